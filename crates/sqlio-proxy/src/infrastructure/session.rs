//! The per-connection read loop.
//!
//! ```text
//! socket ──read──▶ FrameBuffer ──drain──▶ Framer ──Outcome──▶ dispatcher ──▶ pipeline
//!                     ▲                                │
//!                     └── leftover bytes wait here ────┘
//! ```
//!
//! Each iteration reads once into the [`FrameBuffer`], then extracts every
//! complete message currently buffered and hands it to the dispatcher.
//! Framing happens inline, so messages always leave the framer in arrival
//! order.  What happens after that depends on [`DispatchMode`]:
//!
//! - `Sequential`: a single worker task per connection runs the pipeline for
//!   one message at a time, fed by a bounded queue.  Pipeline side effects
//!   keep arrival order, and a slow pipeline eventually pauses reading.
//! - `Concurrent`: every message gets its own task.  Side effects of two
//!   messages from the same connection may land in either order.
//!
//! Either way a failing or panicking pipeline only loses that one message;
//! the failure is logged with the remote address and the loop carries on.

use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::BytesMut;
use futures_util::FutureExt;
use sqlio_core::{FrameBuffer, Framer, FramingError, Outcome};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::packet::{Connection, Packet};
use crate::application::pipeline::Handler;
use crate::domain::config::{DispatchMode, SessionOptions};

/// How a session's read loop ended, when it ended without a framing error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The peer closed its side of the stream.
    PeerClosed,
    /// A read failed (reset, aborted, ...).
    ReadFailed,
    /// Shutdown was requested, or the connection was closed locally.
    Cancelled,
}

// ── Reading ───────────────────────────────────────────────────────────────────

/// The result of one read attempt.
#[derive(Debug)]
pub(crate) enum ReadEvent {
    Data(usize),
    Eof,
    Failed(io::Error),
    Cancelled,
}

/// Reads once into `buf`, giving up as soon as `cancel` or `closing` fires.
/// `buf` must have spare capacity.
pub(crate) async fn read_some<R>(
    reader: &mut R,
    buf: &mut BytesMut,
    cancel: &CancellationToken,
    closing: &CancellationToken,
) -> ReadEvent
where
    R: AsyncRead + Unpin,
{
    tokio::select! {
        _ = cancel.cancelled() => ReadEvent::Cancelled,
        _ = closing.cancelled() => ReadEvent::Cancelled,
        read = reader.read_buf(buf) => match read {
            Ok(0) => ReadEvent::Eof,
            Ok(n) => ReadEvent::Data(n),
            Err(e) => ReadEvent::Failed(e),
        },
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

/// Runs the read loop for one connection until the peer closes, a read fails,
/// or `cancel` fires.
///
/// When the stream ends (peer closed or read failed) the framer gets a final
/// chance to flush, and leftover bytes are reported as
/// [`FramingError::Incomplete`].
///
/// # Errors
///
/// Returns the [`FramingError`] that made the stream unusable.  The caller
/// should close the connection.
pub async fn run_session<R>(
    mut reader: R,
    connection: Arc<Connection>,
    framer: Box<dyn Framer>,
    pipeline: Handler,
    options: SessionOptions,
    cancel: CancellationToken,
) -> Result<SessionEnd, FramingError>
where
    R: AsyncRead + Unpin + Send,
{
    let remote = connection.remote_addr();
    let closing = connection.closing();
    let mut buffer = FrameBuffer::new(options.min_chunk, options.max_buffer);
    let mut outcomes = Vec::new();
    let mut dispatcher = Dispatcher::new(options, pipeline, cancel.clone(), closing.clone());

    let end = loop {
        let event = read_some(&mut reader, buffer.write_target(), &cancel, &closing).await;
        match event {
            ReadEvent::Data(n) => {
                debug!("received {n} bytes from {remote}");
                let drained = buffer.drain(framer.as_ref(), &mut outcomes);
                if !dispatcher.dispatch(outcomes.drain(..), &connection).await {
                    break SessionEnd::Cancelled;
                }
                if let Err(e) = drained {
                    dispatcher.finish(true).await;
                    return Err(e);
                }
            }
            ReadEvent::Eof => break SessionEnd::PeerClosed,
            ReadEvent::Failed(e) => {
                warn!("read from {remote} failed: {e}");
                break SessionEnd::ReadFailed;
            }
            ReadEvent::Cancelled => break SessionEnd::Cancelled,
        }
    };

    if end == SessionEnd::Cancelled {
        dispatcher.finish(false).await;
        return Ok(end);
    }

    let finished = buffer.finish(framer.as_ref(), &mut outcomes);
    if !dispatcher.dispatch(outcomes.drain(..), &connection).await {
        dispatcher.finish(false).await;
        return Ok(SessionEnd::Cancelled);
    }
    dispatcher.finish(true).await;
    finished.map(|()| end)
}

// ── Dispatch ──────────────────────────────────────────────────────────────────

/// Hands packets to the pipeline.  Every wait on a busy pipeline also
/// watches `cancel` and `closing`, so a stuck handler never hides shutdown
/// from the read loop.
struct Dispatcher {
    mode: Mode,
    cancel: CancellationToken,
    closing: CancellationToken,
}

enum Mode {
    Sequential {
        queue: mpsc::Sender<Arc<Packet>>,
        worker: JoinHandle<()>,
    },
    Concurrent {
        pipeline: Handler,
    },
}

impl Dispatcher {
    fn new(
        options: SessionOptions,
        pipeline: Handler,
        cancel: CancellationToken,
        closing: CancellationToken,
    ) -> Self {
        let mode = match options.dispatch {
            DispatchMode::Sequential => {
                let (queue, mut rx) = mpsc::channel::<Arc<Packet>>(options.queue_depth.max(1));
                let worker = tokio::spawn(async move {
                    while let Some(packet) = rx.recv().await {
                        run_pipeline(&pipeline, packet).await;
                    }
                });
                Mode::Sequential { queue, worker }
            }
            DispatchMode::Concurrent => Mode::Concurrent { pipeline },
        };
        Self {
            mode,
            cancel,
            closing,
        }
    }

    /// Returns `false` if the session was cancelled or the connection closed
    /// while waiting for room in the queue.
    async fn dispatch<I>(&mut self, outcomes: I, connection: &Arc<Connection>) -> bool
    where
        I: Iterator<Item = Outcome>,
    {
        let remote = connection.remote_addr();
        for outcome in outcomes {
            let frame = match outcome {
                Outcome::Message(frame) => frame,
                Outcome::Skipped(reason) => {
                    warn!("dropped bytes from {remote}: {reason}");
                    continue;
                }
            };
            let packet = Arc::new(Packet::new(frame, Arc::clone(connection)));
            info!("received packet {packet} from {remote}");

            match &self.mode {
                Mode::Sequential { queue, .. } => {
                    let sent = tokio::select! {
                        _ = self.cancel.cancelled() => return false,
                        _ = self.closing.cancelled() => return false,
                        sent = queue.send(packet) => sent,
                    };
                    if sent.is_err() {
                        error!("pipeline worker for {remote} is gone; dropping packet");
                    }
                }
                Mode::Concurrent { pipeline } => {
                    let pipeline = pipeline.clone();
                    tokio::spawn(async move { run_pipeline(&pipeline, packet).await });
                }
            }
        }
        true
    }

    /// Stops accepting packets.  With `wait`, queued packets are processed
    /// before this returns unless the session is cancelled meanwhile; without
    /// it, the worker is aborted.
    async fn finish(self, wait: bool) {
        let Mode::Sequential { queue, mut worker } = self.mode else {
            return;
        };
        drop(queue);
        if !wait {
            worker.abort();
            return;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => worker.abort(),
            joined = &mut worker => {
                if let Err(e) = joined {
                    error!("pipeline worker failed: {e}");
                }
            }
        }
    }
}

/// Runs the pipeline for one packet and turns every failure, panics
/// included, into a log line.
async fn run_pipeline(pipeline: &Handler, packet: Arc<Packet>) {
    let remote = packet.connection().remote_addr();
    match AssertUnwindSafe(pipeline.call(packet)).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("error while handling packet from {remote}: {e}"),
        Err(_) => error!("unknown stack error while handling packet from {remote}"),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
