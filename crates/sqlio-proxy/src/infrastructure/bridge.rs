//! `BridgeSupervisor`: keeps one outbound device connection alive.
//!
//! ```text
//!             ┌──────────────── retry_delay ◀──────────────┐
//!             ▼                                            │
//!   Disconnected ──▶ Connecting ──dial ok──▶ Connected ──session ends──┘
//!                        │
//!                        └──dial failed──▶ Disconnected (after retry_delay)
//!
//!   cancel (any state) ──▶ Stopped
//! ```
//!
//! While connected, the device's messages run through the bridge pipeline.
//! Its last step relays each message's raw bytes to the current chat peer, if
//! there is one.  The supervisor never gives up on its own: refused
//! connections, resets, and framing errors all lead back to `Disconnected`
//! and another attempt.  Only the cancellation token ends the loop.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlio_core::ProtocolKind;
use tokio::io::AsyncRead;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::application::bridge_state::{chat_relay_layer, BridgeState};
use crate::application::packet::{BoxedWriter, Connection};
use crate::application::pipeline::{Handler, PipelineBuilder};
use crate::domain::config::{BridgeStatus, SessionOptions};
use crate::infrastructure::session::{run_session, SessionEnd};

// ── Dialing ───────────────────────────────────────────────────────────────────

/// An established outbound stream, split into halves.
pub struct Dialed {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: BoxedWriter,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
}

/// Opens the outbound device connection.  Tests swap in a scripted dialer.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> io::Result<Dialed>;
}

/// Dials `host:port` over TCP, resolving the name on every attempt.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    remote: String,
}

impl TcpDialer {
    pub fn new(remote: impl Into<String>) -> Self {
        Self {
            remote: remote.into(),
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self) -> io::Result<Dialed> {
        let stream = TcpStream::connect(&self.remote).await?;
        let local_addr = stream.local_addr()?;
        let remote_addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(Dialed {
            reader: Box::new(reader),
            writer: Box::new(writer),
            local_addr,
            remote_addr,
        })
    }
}

// ── Supervisor ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct BridgeOptions {
    pub protocol: ProtocolKind,
    pub session: SessionOptions,
    pub retry_delay: Duration,
}

pub struct BridgeSupervisor {
    dialer: Arc<dyn Dialer>,
    state: Arc<BridgeState>,
    pipeline: Handler,
    options: BridgeOptions,
    status: watch::Sender<BridgeStatus>,
}

impl BridgeSupervisor {
    /// `layers` run before the chat relay, which the supervisor appends.
    pub fn new(
        dialer: Arc<dyn Dialer>,
        state: Arc<BridgeState>,
        layers: PipelineBuilder,
        options: BridgeOptions,
    ) -> Self {
        let pipeline = layers.layer(chat_relay_layer(Arc::clone(&state))).build();
        let (status, _) = watch::channel(BridgeStatus::Disconnected);
        Self {
            dialer,
            state,
            pipeline,
            options,
            status,
        }
    }

    /// Watches status changes.
    pub fn subscribe(&self) -> watch::Receiver<BridgeStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> BridgeStatus {
        *self.status.borrow()
    }

    fn set_status(&self, status: BridgeStatus) {
        self.status.send_replace(status);
    }

    /// Runs until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        loop {
            self.set_status(BridgeStatus::Connecting);
            let dialed = tokio::select! {
                _ = cancel.cancelled() => break,
                dialed = self.dialer.dial() => dialed,
            };

            let delay = self.options.retry_delay;
            match dialed {
                Ok(dialed) => {
                    self.connected(dialed, &cancel).await;
                    if cancel.is_cancelled() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                    warn!("device refused the connection; retrying in {delay:?}");
                }
                Err(e) => warn!("could not reach device: {e}; retrying in {delay:?}"),
            }

            self.set_status(BridgeStatus::Disconnected);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.options.retry_delay) => {}
            }
        }

        self.set_status(BridgeStatus::Stopped);
        info!("bridge supervisor stopped");
    }

    /// Runs one device session until it ends.
    async fn connected(&self, dialed: Dialed, cancel: &CancellationToken) {
        let remote = dialed.remote_addr;
        let connection = Arc::new(Connection::new(dialed.local_addr, remote, dialed.writer));
        if let Some(stale) = self.state.set_remote(Arc::clone(&connection)) {
            stale.close().await;
        }
        self.set_status(BridgeStatus::Connected);
        info!("connected to device {remote}");

        let end = run_session(
            dialed.reader,
            Arc::clone(&connection),
            self.options.protocol.framer(),
            self.pipeline.clone(),
            self.options.session,
            cancel.child_token(),
        )
        .await;

        self.state.clear_remote_if(connection.id());
        connection.close().await;
        match end {
            Ok(SessionEnd::Cancelled) => info!("device {remote} session cancelled"),
            Ok(end) => warn!("lost device {remote} ({end:?})"),
            Err(e) => warn!("closing device {remote}: {e}"),
        }
    }
}

impl std::fmt::Debug for BridgeSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeSupervisor")
            .field("status", &self.status())
            .field("options", &self.options)
            .finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::time::Instant;

    const DELAY: Duration = Duration::from_millis(1000);

    /// What the scripted dialer does on one attempt.
    enum Step {
        Refuse,
        Reset,
        Connect,
    }

    /// Plays back a script of dial results.  Once the script runs out, every
    /// attempt is refused.  The device side of each connection is kept in
    /// `peers`.
    struct ScriptedDialer {
        script: Mutex<VecDeque<Step>>,
        dials: AtomicUsize,
        peers: Mutex<Vec<DuplexStream>>,
    }

    impl ScriptedDialer {
        fn new(script: impl IntoIterator<Item = Step>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into_iter().collect()),
                dials: AtomicUsize::new(0),
                peers: Mutex::new(Vec::new()),
            })
        }

        fn dials(&self) -> usize {
            self.dials.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Dialer for ScriptedDialer {
        async fn dial(&self) -> io::Result<Dialed> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let step = self.script.lock().pop_front().unwrap_or(Step::Refuse);
            match step {
                Step::Refuse => Err(io::Error::from(io::ErrorKind::ConnectionRefused)),
                Step::Reset => Err(io::Error::from(io::ErrorKind::ConnectionReset)),
                Step::Connect => {
                    let (ours, theirs) = tokio::io::duplex(1024);
                    let (reader, writer) = tokio::io::split(ours);
                    self.peers.lock().push(theirs);
                    Ok(Dialed {
                        reader: Box::new(reader),
                        writer: Box::new(writer),
                        local_addr: "127.0.0.1:50000".parse().unwrap(),
                        remote_addr: "127.0.0.1:9100".parse().unwrap(),
                    })
                }
            }
        }
    }

    fn options() -> BridgeOptions {
        BridgeOptions {
            protocol: ProtocolKind::Default,
            session: SessionOptions::default(),
            retry_delay: DELAY,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_failures_then_success_waits_three_delays() {
        // Arrange
        let dialer = ScriptedDialer::new([Step::Refuse, Step::Reset, Step::Refuse, Step::Connect]);
        let state = Arc::new(BridgeState::new());
        let supervisor = BridgeSupervisor::new(
            dialer.clone(),
            Arc::clone(&state),
            PipelineBuilder::new(),
            options(),
        );
        let mut status = supervisor.subscribe();
        let cancel = CancellationToken::new();
        let started = Instant::now();

        // Act
        let task = tokio::spawn(supervisor.run(cancel.clone()));
        status
            .wait_for(|s| *s == BridgeStatus::Connected)
            .await
            .unwrap();
        let elapsed = started.elapsed();

        // Assert
        assert_eq!(dialer.dials(), 4);
        assert!(elapsed >= DELAY * 3, "elapsed {elapsed:?}");
        assert!(elapsed < DELAY * 4, "elapsed {elapsed:?}");
        assert!(state.remote().is_some());

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(*status.borrow(), BridgeStatus::Stopped);
        assert!(state.remote().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_retry_delay_stops_without_more_dials() {
        // Arrange
        let dialer = ScriptedDialer::new(Vec::new());
        let supervisor = BridgeSupervisor::new(
            dialer.clone(),
            Arc::new(BridgeState::new()),
            PipelineBuilder::new(),
            options(),
        );
        let mut status = supervisor.subscribe();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervisor.run(cancel.clone()));
        status
            .wait_for(|s| *s == BridgeStatus::Disconnected)
            .await
            .unwrap();

        // Act
        cancel.cancel();
        task.await.unwrap();
        tokio::time::sleep(DELAY * 5).await;

        // Assert
        assert_eq!(dialer.dials(), 1);
        assert_eq!(*status.borrow(), BridgeStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_disconnect_leads_to_another_attempt() {
        // Arrange: connect, then the device hangs up
        let dialer = ScriptedDialer::new([Step::Connect, Step::Connect]);
        let supervisor = BridgeSupervisor::new(
            dialer.clone(),
            Arc::new(BridgeState::new()),
            PipelineBuilder::new(),
            options(),
        );
        let mut status = supervisor.subscribe();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervisor.run(cancel.clone()));
        status
            .wait_for(|s| *s == BridgeStatus::Connected)
            .await
            .unwrap();

        // Act
        let first_peer = dialer.peers.lock().remove(0);
        drop(first_peer);
        status
            .wait_for(|s| *s == BridgeStatus::Disconnected)
            .await
            .unwrap();
        status
            .wait_for(|s| *s == BridgeStatus::Connected)
            .await
            .unwrap();

        // Assert
        assert_eq!(dialer.dials(), 2);
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_device_messages_reach_the_chat_peer() {
        // Arrange
        let dialer = ScriptedDialer::new([Step::Connect]);
        let state = Arc::new(BridgeState::new());
        let (chat, mut chat_peer) = crate::application::packet::tests::connection_pair(9200);
        state.replace_chat(chat);
        let supervisor = BridgeSupervisor::new(
            dialer.clone(),
            Arc::clone(&state),
            PipelineBuilder::new(),
            options(),
        );
        let mut status = supervisor.subscribe();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervisor.run(cancel.clone()));
        status
            .wait_for(|s| *s == BridgeStatus::Connected)
            .await
            .unwrap();

        // Act
        let mut device = dialer.peers.lock().remove(0);
        device.write_all(b"noise\r\n@READY\r\n").await.unwrap();

        // Assert
        let mut buf = [0u8; 8];
        chat_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"@READY\r\n");

        cancel.cancel();
        task.await.unwrap();
    }
}
