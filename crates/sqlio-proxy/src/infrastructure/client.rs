//! The `client` command: send one payload to a device (or to the proxy) and
//! optionally wait for the first framed reply.
//!
//! Payloads are typed on the command line, so they need an encoding:
//! text protocols (`sc500`) take the XML as-is, binary protocols take hex
//! (`24210615...` for a videojet command).  Replies are rendered the same way.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use sqlio_core::ProtocolKind;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::application::packet::{Connection, Packet};
use crate::application::pipeline::{Handler, PipelineBuilder};
use crate::domain::config::{ClientConfig, SessionOptions};
use crate::infrastructure::session::run_session;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to send payload: {0}")]
    Send(#[source] std::io::Error),

    #[error("payload is not valid hex: {0}")]
    Hex(#[from] hex::FromHexError),
}

/// How a client run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientOutcome {
    /// The payload was sent and no reply was requested.
    Sent,
    /// The first reply, exactly as framed.
    Reply(Vec<u8>),
    /// A reply was requested but none arrived in time.
    NoReply,
}

/// Turns a command-line payload into bytes: UTF-8 for text protocols, hex
/// (whitespace ignored) for everything else.
///
/// # Errors
///
/// [`ClientError::Hex`] for malformed hex.
pub fn decode_payload(text: &str, protocol: ProtocolKind) -> Result<Vec<u8>, ClientError> {
    if protocol.is_text() {
        return Ok(text.as_bytes().to_vec());
    }
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    Ok(hex::decode(compact)?)
}

/// Renders a reply for the terminal: text for text protocols, hex otherwise.
pub fn render_reply(bytes: &[u8], protocol: ProtocolKind) -> String {
    if protocol.is_text() {
        String::from_utf8_lossy(bytes).into_owned()
    } else {
        hex::encode(bytes)
    }
}

/// A pipeline layer that hands the first packet's bytes to `sender`.
fn capture_first(sender: oneshot::Sender<Vec<u8>>) -> impl FnOnce(Handler) -> Handler + Send {
    let slot = Arc::new(Mutex::new(Some(sender)));
    move |next: Handler| {
        Handler::new(move |packet: Arc<Packet>| {
            let slot = Arc::clone(&slot);
            let next = next.clone();
            async move {
                if let Some(sender) = slot.lock().take() {
                    let _ = sender.send(packet.raw().to_vec());
                }
                next.call(packet).await
            }
        })
    }
}

/// Connects, sends `config.payload`, and waits for a reply when asked to.
///
/// # Errors
///
/// [`ClientError::Connect`] or [`ClientError::Send`].  A missing reply is
/// [`ClientOutcome::NoReply`], not an error.
pub async fn run_client(config: &ClientConfig) -> Result<ClientOutcome, ClientError> {
    let started = Instant::now();
    let stream = TcpStream::connect(&config.addr)
        .await
        .map_err(|source| ClientError::Connect {
            addr: config.addr.clone(),
            source,
        })?;
    let local = stream.local_addr().map_err(ClientError::Send)?;
    let remote = stream.peer_addr().map_err(ClientError::Send)?;
    debug!("connected to {remote} in {:?}", started.elapsed());

    let (reader, writer) = stream.into_split();
    let connection = Arc::new(Connection::new(local, remote, Box::new(writer)));

    let (reply_tx, reply_rx) = oneshot::channel();
    let pipeline = PipelineBuilder::new().layer(capture_first(reply_tx)).build();
    let cancel = CancellationToken::new();
    let session = tokio::spawn(run_session(
        reader,
        Arc::clone(&connection),
        config.reply_protocol.framer(),
        pipeline,
        SessionOptions::default(),
        cancel.clone(),
    ));

    let sent_at = Instant::now();
    connection
        .write(&config.payload)
        .await
        .map_err(ClientError::Send)?;
    info!("sent {} bytes to {remote}", config.payload.len());

    let outcome = match config.reply_timeout {
        None => ClientOutcome::Sent,
        Some(wait) => match tokio::time::timeout(wait, reply_rx).await {
            Ok(Ok(reply)) => {
                debug!("reply after {:?}", sent_at.elapsed());
                ClientOutcome::Reply(reply)
            }
            Ok(Err(_)) | Err(_) => ClientOutcome::NoReply,
        },
    };

    cancel.cancel();
    connection.close().await;
    let _ = session.await;
    debug!("done in {:?}", started.elapsed());
    Ok(outcome)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
