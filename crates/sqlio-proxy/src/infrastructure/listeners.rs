//! Accept handlers for the three listeners the proxy can run.
//!
//! | Listener | Peers            | What happens to their bytes                        |
//! |----------|------------------|----------------------------------------------------|
//! | device   | marking devices  | framed and run through the device pipeline         |
//! | fanout   | loopback tools   | broadcast to every registered device               |
//! | chat     | one loopback peer| written verbatim to the bridge's device connection |
//!
//! Each function here builds an [`AcceptHandler`] for a
//! [`ConnectionServer`](super::server::ConnectionServer).  The handler owns
//! the accepted stream for its whole life: it splits it, wraps the write half
//! in a [`Connection`], runs the read side until the peer leaves or the
//! session token fires, and closes the connection on the way out.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use futures_util::FutureExt;
use sqlio_core::{display_payload, ProtocolKind};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::bridge_state::BridgeState;
use crate::application::fanout::{fanout_layer, FanoutRegistry};
use crate::application::packet::Connection;
use crate::application::pipeline::{Handler, PipelineBuilder};
use crate::domain::config::SessionOptions;
use crate::infrastructure::server::AcceptHandler;
use crate::infrastructure::session::{read_some, run_session, ReadEvent, SessionEnd};

/// Splits an accepted stream into its read half and a shared [`Connection`].
fn open(stream: TcpStream, remote: SocketAddr) -> (tokio::net::tcp::OwnedReadHalf, Arc<Connection>) {
    let local = stream.local_addr().unwrap_or(remote);
    let (reader, writer) = stream.into_split();
    (reader, Arc::new(Connection::new(local, remote, Box::new(writer))))
}

fn log_end(kind: &str, remote: SocketAddr, end: Result<SessionEnd, sqlio_core::FramingError>) {
    match end {
        Ok(SessionEnd::PeerClosed) => info!("{kind} {remote} disconnected"),
        Ok(SessionEnd::ReadFailed) => info!("{kind} {remote} dropped"),
        Ok(SessionEnd::Cancelled) => debug!("{kind} {remote} session cancelled"),
        Err(e) => warn!("closing {kind} {remote}: {e}"),
    }
}

// ── Device listener ───────────────────────────────────────────────────────────

/// Accepts marking devices.  Every device is registered for fanout while its
/// session runs, and every message it sends goes through `pipeline`.
pub fn device_handler(
    protocol: ProtocolKind,
    options: SessionOptions,
    pipeline: Handler,
    registry: Arc<FanoutRegistry>,
) -> AcceptHandler {
    Arc::new(move |stream: TcpStream, remote: SocketAddr, cancel: CancellationToken| {
        let pipeline = pipeline.clone();
        let registry = Arc::clone(&registry);
        async move {
            let (reader, connection) = open(stream, remote);
            if registry.register(Arc::clone(&connection)) {
                info!("device {remote} registered for fanout ({} total)", registry.len());
            } else {
                warn!("device {remote} is already registered for fanout");
            }

            let end = run_session(
                reader,
                Arc::clone(&connection),
                protocol.framer(),
                pipeline,
                options,
                cancel,
            )
            .await;
            log_end("device", remote, end);

            registry.unregister(&connection);
            connection.close().await;
        }
        .boxed()
    })
}

// ── Fanout listener ───────────────────────────────────────────────────────────

/// Accepts fanout peers.
///
/// With `framed == false` every received chunk is broadcast as-is.  With
/// `framed == true` the peer speaks `protocol` and only complete messages are
/// broadcast.
pub fn fanout_handler(
    registry: Arc<FanoutRegistry>,
    protocol: ProtocolKind,
    options: SessionOptions,
    framed: bool,
) -> AcceptHandler {
    let framed_pipeline = PipelineBuilder::new()
        .layer(fanout_layer(Arc::clone(&registry)))
        .build();

    Arc::new(move |stream: TcpStream, remote: SocketAddr, cancel: CancellationToken| {
        let registry = Arc::clone(&registry);
        let pipeline = framed_pipeline.clone();
        async move {
            let (reader, connection) = open(stream, remote);
            if framed {
                let end = run_session(
                    reader,
                    Arc::clone(&connection),
                    protocol.framer(),
                    pipeline,
                    options,
                    cancel,
                )
                .await;
                log_end("fanout peer", remote, end);
            } else {
                let end = relay_chunks(reader, &connection, options.min_chunk, &cancel, |chunk| {
                    let registry = Arc::clone(&registry);
                    async move {
                        let recipients = registry.broadcast(&chunk).await;
                        info!("fanout completed to {recipients} recipients");
                    }
                })
                .await;
                log_end("fanout peer", remote, Ok(end));
            }
            connection.close().await;
        }
        .boxed()
    })
}

// ── Chat listener ─────────────────────────────────────────────────────────────

/// Accepts the chat peer of a bridge.  A new peer replaces (and closes) the
/// previous one; everything it sends goes verbatim to the device.
pub fn chat_handler(state: Arc<BridgeState>, options: SessionOptions) -> AcceptHandler {
    Arc::new(move |stream: TcpStream, remote: SocketAddr, cancel: CancellationToken| {
        let state = Arc::clone(&state);
        async move {
            let (reader, connection) = open(stream, remote);
            if let Some(previous) = state.replace_chat(Arc::clone(&connection)) {
                info!(
                    "chat peer {remote} replaces {}",
                    previous.remote_addr()
                );
                previous.close().await;
            } else {
                info!("chat peer {remote} connected");
            }

            let end = relay_chunks(reader, &connection, options.min_chunk, &cancel, |chunk| {
                let state = Arc::clone(&state);
                async move {
                    if !state.write_remote(&chunk).await {
                        warn!("unable to forward {} bytes", chunk.len());
                    }
                }
            })
            .await;
            log_end("chat peer", remote, Ok(end));

            state.clear_chat_if(connection.id());
            connection.close().await;
        }
        .boxed()
    })
}

/// Reads raw chunks and hands each one to `forward` until the stream ends,
/// the session is cancelled, or the connection is closed locally.
async fn relay_chunks<R, F, Fut>(
    mut reader: R,
    connection: &Connection,
    chunk_size: usize,
    cancel: &CancellationToken,
    forward: F,
) -> SessionEnd
where
    R: tokio::io::AsyncRead + Unpin,
    F: Fn(Vec<u8>) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let closing = connection.closing();
    let remote = connection.remote_addr();
    let mut buf = BytesMut::with_capacity(chunk_size.max(1));
    loop {
        buf.clear();
        buf.reserve(chunk_size.max(1));
        match read_some(&mut reader, &mut buf, cancel, &closing).await {
            ReadEvent::Data(n) => {
                debug!("{n} bytes from {remote}: {}", display_payload(&buf));
                tokio::select! {
                    _ = cancel.cancelled() => return SessionEnd::Cancelled,
                    _ = closing.cancelled() => return SessionEnd::Cancelled,
                    () = forward(buf.to_vec()) => {}
                }
            }
            ReadEvent::Eof => return SessionEnd::PeerClosed,
            ReadEvent::Failed(e) => {
                warn!("read from {remote} failed: {e}");
                return SessionEnd::ReadFailed;
            }
            ReadEvent::Cancelled => return SessionEnd::Cancelled,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
