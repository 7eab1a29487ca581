//! Ordered handler pipelines.
//!
//! A pipeline is built once from a list of *layers*.  Each layer receives the
//! handler for "the rest of the chain" and returns a new handler that does its
//! own work and then (usually) calls into that rest.  A layer may also stop
//! early, for example after answering on the packet's connection.
//!
//! ```text
//! builder.layer(A).layer(B).layer(C).build()
//!
//!   A(B(C(terminal)))      call → A → B → C → terminal
//! ```
//!
//! Layers are applied in reverse so the first one registered runs first.
//! The result is an immutable [`Handler`] that is cheap to clone and safe to
//! call from any number of sessions at once.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use thiserror::Error;

use crate::application::packet::Packet;
use crate::application::persistence::StoreError;

/// Why a handler aborted the chain for one packet.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Writing a reply back on the packet's connection failed.
    #[error("failed to write reply to {remote}: {source}")]
    Reply {
        remote: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The packet store rejected the packet.  `payload` keeps the original
    /// message (escaped) for the failure report.
    #[error("packet store failed for payload '{payload}': {source}")]
    Store {
        payload: String,
        #[source]
        source: StoreError,
    },

    #[error("{0}")]
    Other(String),
}

/// The future returned by a handler.
pub type HandlerFuture = BoxFuture<'static, Result<(), HandlerError>>;

/// A composed, immutable message handler.
#[derive(Clone)]
pub struct Handler(Arc<dyn Fn(Arc<Packet>) -> HandlerFuture + Send + Sync>);

impl Handler {
    /// Wraps an async closure as a handler.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Arc<Packet>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        Self(Arc::new(move |packet| f(packet).boxed()))
    }

    /// The end of every chain: accepts the packet and does nothing.
    pub fn terminal() -> Self {
        Self::new(|_packet| async { Ok(()) })
    }

    /// Runs the chain for one packet.
    pub async fn call(&self, packet: Arc<Packet>) -> Result<(), HandlerError> {
        (self.0)(packet).await
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Handler")
    }
}

type Layer = Box<dyn FnOnce(Handler) -> Handler + Send>;

/// Collects layers and composes them into a [`Handler`].
#[derive(Default)]
pub struct PipelineBuilder {
    layers: Vec<Layer>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a layer.  Layers run in the order they are added.
    pub fn layer<L>(mut self, layer: L) -> Self
    where
        L: FnOnce(Handler) -> Handler + Send + 'static,
    {
        self.layers.push(Box::new(layer));
        self
    }

    /// Appends a layer only when `layer` is `Some`.
    pub fn layer_opt<L>(self, layer: Option<L>) -> Self
    where
        L: FnOnce(Handler) -> Handler + Send + 'static,
    {
        match layer {
            Some(layer) => self.layer(layer),
            None => self,
        }
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Composes the chain.  The first layer added becomes the outermost.
    pub fn build(self) -> Handler {
        self.build_with(Handler::terminal())
    }

    /// Composes the chain around `terminal`, which runs after the last layer
    /// forwards.
    pub fn build_with(self, terminal: Handler) -> Handler {
        self.layers
            .into_iter()
            .rev()
            .fold(terminal, |next, layer| layer(next))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::packet::tests::connection_pair;
    use parking_lot::Mutex;
    use sqlio_core::Frame;

    type Log = Arc<Mutex<Vec<&'static str>>>;

    /// A layer that records `name` and then forwards.
    fn recording(name: &'static str, log: Log) -> impl FnOnce(Handler) -> Handler + Send {
        move |next: Handler| {
            Handler::new(move |packet| {
                let log = Arc::clone(&log);
                let next = next.clone();
                async move {
                    log.lock().push(name);
                    next.call(packet).await
                }
            })
        }
    }

    /// A layer that records `name` and then fails.
    fn failing(name: &'static str, log: Log) -> impl FnOnce(Handler) -> Handler + Send {
        move |_next: Handler| {
            Handler::new(move |_packet| {
                let log = Arc::clone(&log);
                async move {
                    log.lock().push(name);
                    Err(HandlerError::Other(format!("{name} failed")))
                }
            })
        }
    }

    /// The end of a chain that records `"terminal"`.
    fn recording_terminal(log: Log) -> Handler {
        Handler::new(move |_packet| {
            let log = Arc::clone(&log);
            async move {
                log.lock().push("terminal");
                Ok(())
            }
        })
    }

    fn packet() -> Arc<Packet> {
        let (connection, _peer) = connection_pair(7000);
        Arc::new(Packet::new(Frame::raw(b"@X\n".to_vec()), connection))
    }

    #[tokio::test]
    async fn test_layers_run_in_registration_order() {
        // Arrange
        let log: Log = Arc::default();
        let pipeline = PipelineBuilder::new()
            .layer(recording("A", Arc::clone(&log)))
            .layer(recording("B", Arc::clone(&log)))
            .layer(recording("C", Arc::clone(&log)))
            .build_with(recording_terminal(Arc::clone(&log)));

        // Act
        pipeline.call(packet()).await.unwrap();

        // Assert
        assert_eq!(*log.lock(), vec!["A", "B", "C", "terminal"]);
    }

    #[tokio::test]
    async fn test_failing_layer_stops_the_rest_of_the_chain() {
        // Arrange
        let log: Log = Arc::default();
        let pipeline = PipelineBuilder::new()
            .layer(recording("A", Arc::clone(&log)))
            .layer(failing("B", Arc::clone(&log)))
            .layer(recording("C", Arc::clone(&log)))
            .build_with(recording_terminal(Arc::clone(&log)));

        // Act
        let result = pipeline.call(packet()).await;

        // Assert
        assert!(matches!(result, Err(HandlerError::Other(_))));
        assert_eq!(*log.lock(), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_empty_pipeline_is_the_terminal_handler() {
        let builder = PipelineBuilder::new();
        assert!(builder.is_empty());

        let pipeline = builder.build();

        assert!(pipeline.call(packet()).await.is_ok());
    }

    #[tokio::test]
    async fn test_built_pipeline_can_be_called_repeatedly_and_concurrently() {
        let log: Log = Arc::default();
        let pipeline = PipelineBuilder::new()
            .layer(recording("A", Arc::clone(&log)))
            .build();

        let other = pipeline.clone();

        let (first, second) = tokio::join!(pipeline.call(packet()), other.call(packet()));

        assert!(first.is_ok() && second.is_ok());
        assert_eq!(log.lock().len(), 2);
    }

    #[test]
    fn test_layer_opt_skips_none() {
        let log: Log = Arc::default();
        let none: Option<fn(Handler) -> Handler> = None;

        let builder = PipelineBuilder::new()
            .layer_opt(none)
            .layer_opt(Some(recording("A", log)));

        assert_eq!(builder.len(), 1);
    }
}
