//! `ConnectionServer`: a named TCP listener with an explicit lifecycle.
//!
//! ```text
//!   Created ──start()──▶ Listening ──stop()──▶ Stopped
//! ```
//!
//! While listening, an accept loop runs on its own task.  Each accepted
//! connection is handed to the server's [`AcceptHandler`] on a fresh task, so
//! one slow peer never delays the next accept.
//!
//! Stopping only ends the accept loop; sessions that are already running are
//! left alone.  They are torn down through the `sessions` token the server
//! was created with (see [`ConnectionServer::abort_sessions`]), which the
//! process-wide shutdown path cancels, and can then be awaited with
//! [`ConnectionServer::wait_sessions`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

/// Pause after a failed `accept` (for example when file descriptors run out)
/// so the loop does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Called once per accepted connection with the stream, the peer address,
/// and a token that fires when sessions must end.
pub type AcceptHandler =
    Arc<dyn Fn(TcpStream, SocketAddr, CancellationToken) -> BoxFuture<'static, ()> + Send + Sync>;

/// Misuse of the server lifecycle, or a failed bind.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("server is already started")]
    AlreadyStarted,

    #[error("server was never started")]
    NotStarted,

    #[error("server is already stopped")]
    Stopped,

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

enum State {
    Created,
    Listening {
        local_addr: SocketAddr,
        accept_cancel: CancellationToken,
        task: JoinHandle<()>,
    },
    Stopped,
}

/// A TCP listener that hands every accepted connection to a handler.
pub struct ConnectionServer {
    name: String,
    bind_addr: SocketAddr,
    handler: AcceptHandler,
    sessions: CancellationToken,
    tracker: TaskTracker,
    state: Mutex<State>,
}

impl ConnectionServer {
    /// Creates a server that is not listening yet.  `sessions` is the parent
    /// of every per-connection token.
    pub fn new(
        name: impl Into<String>,
        bind_addr: SocketAddr,
        handler: AcceptHandler,
        sessions: CancellationToken,
    ) -> Self {
        Self {
            name: name.into(),
            bind_addr,
            handler,
            sessions,
            tracker: TaskTracker::new(),
            state: Mutex::new(State::Created),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Binds the listener and starts accepting.  Returns the bound address,
    /// which differs from the configured one when port 0 was requested.
    ///
    /// # Errors
    ///
    /// [`ServerError::AlreadyStarted`] or [`ServerError::Stopped`] on
    /// misuse, [`ServerError::Bind`] when the address cannot be bound.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let mut state = self.state.lock().await;
        match *state {
            State::Created => {}
            State::Listening { .. } => return Err(ServerError::AlreadyStarted),
            State::Stopped => return Err(ServerError::Stopped),
        }

        let bind = |source: std::io::Error| ServerError::Bind {
            addr: self.bind_addr,
            source,
        };
        let listener = TcpListener::bind(self.bind_addr).await.map_err(bind)?;
        let local_addr = listener.local_addr().map_err(bind)?;
        info!("{} listening on {local_addr}", self.name);

        let accept_cancel = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            self.name.clone(),
            listener,
            Arc::clone(&self.handler),
            accept_cancel.clone(),
            self.sessions.clone(),
            self.tracker.clone(),
        ));
        *state = State::Listening {
            local_addr,
            accept_cancel,
            task,
        };
        Ok(local_addr)
    }

    /// Stops accepting new connections.  Running sessions are not touched.
    ///
    /// # Errors
    ///
    /// [`ServerError::NotStarted`] if `start` never succeeded,
    /// [`ServerError::Stopped`] on a second call.
    pub async fn stop(&self) -> Result<(), ServerError> {
        let mut state = self.state.lock().await;
        match std::mem::replace(&mut *state, State::Stopped) {
            State::Listening {
                local_addr,
                accept_cancel,
                task,
            } => {
                accept_cancel.cancel();
                if let Err(e) = task.await {
                    error!("{} accept loop failed: {e}", self.name);
                }
                info!("{} stopped listening on {local_addr}", self.name);
                Ok(())
            }
            State::Created => {
                *state = State::Created;
                Err(ServerError::NotStarted)
            }
            State::Stopped => Err(ServerError::Stopped),
        }
    }

    /// The bound address while listening.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        match *self.state.lock().await {
            State::Listening { local_addr, .. } => Some(local_addr),
            _ => None,
        }
    }

    /// Ends every session this server has spawned (and any other session
    /// sharing the same token).
    pub fn abort_sessions(&self) {
        self.sessions.cancel();
    }

    /// Waits until every session spawned so far has finished.  Meant for
    /// shutdown, after [`stop`](Self::stop); sessions accepted afterwards
    /// are not waited for.
    pub async fn wait_sessions(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl std::fmt::Debug for ConnectionServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionServer")
            .field("name", &self.name)
            .field("bind_addr", &self.bind_addr)
            .finish()
    }
}

async fn accept_loop(
    name: String,
    listener: TcpListener,
    handler: AcceptHandler,
    cancel: CancellationToken,
    sessions: CancellationToken,
    tracker: TaskTracker,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    info!("{name} accepted connection from {remote}");
                    tracker.spawn(handler(stream, remote, sessions.child_token()));
                }
                Err(e) => {
                    warn!("{name} accept failed: {e}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
