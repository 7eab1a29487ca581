//! The connection handle and the packet passed through pipelines.
//!
//! A [`Connection`] is the write side of one open socket plus its addresses.
//! The read side stays with the session loop that owns it; everybody else
//! (reply handlers, fanout, the bridge) only ever writes, so the write half
//! lives behind an async mutex and writes to one peer are never interleaved.
//!
//! A [`Packet`] is one framed message together with the connection it came
//! from, so a handler can answer on the same stream.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use sqlio_core::{display_payload, Frame, XmlElement};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Boxed write half of any byte stream (TCP in production, in-memory pipes in
/// tests).
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The shared, write-only view of an open connection.
pub struct Connection {
    id: Uuid,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    writer: Mutex<Option<BoxedWriter>>,
    closed: AtomicBool,
    /// Fired by [`Connection::close`] so the owning read loop stops too.
    closing: CancellationToken,
}

impl Connection {
    pub fn new(local_addr: SocketAddr, remote_addr: SocketAddr, writer: BoxedWriter) -> Self {
        Self {
            id: Uuid::new_v4(),
            local_addr,
            remote_addr,
            writer: Mutex::new(Some(writer)),
            closed: AtomicBool::new(false),
            closing: CancellationToken::new(),
        }
    }

    /// Unique per connection, so two connections from the same address (a
    /// reconnect) are never confused.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once [`Connection::close`] has been called.
    pub fn closing(&self) -> CancellationToken {
        self.closing.clone()
    }

    /// Writes `bytes` and flushes.  Concurrent writers are serialized.
    ///
    /// [`Connection::close`] interrupts a write that is waiting for the lock
    /// or for the peer to drain its receive window.
    ///
    /// # Errors
    ///
    /// Returns [`io::ErrorKind::NotConnected`] once the connection is closed,
    /// or the underlying I/O error.  A failed write closes the connection.
    pub async fn write(&self, bytes: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(not_connected());
        }
        let mut guard = tokio::select! {
            _ = self.closing.cancelled() => return Err(not_connected()),
            guard = self.writer.lock() => guard,
        };
        let writer = guard.as_mut().ok_or_else(not_connected)?;

        debug!(
            "writing {} to {}",
            display_payload(bytes),
            self.remote_addr
        );
        let result = tokio::select! {
            _ = self.closing.cancelled() => Err(not_connected()),
            result = async {
                writer.write_all(bytes).await?;
                writer.flush().await
            } => result,
        };
        if result.is_err() {
            self.closed.store(true, Ordering::Release);
            guard.take();
            self.closing.cancel();
        }
        result
    }

    /// Shuts the write half down and signals the owning read loop to stop.
    /// A write in progress is abandoned.  Calling it more than once is
    /// harmless.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.closing.cancel();
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection is closed")
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ── Packet ────────────────────────────────────────────────────────────────────

/// One framed message and the connection it arrived on.
#[derive(Debug, Clone)]
pub struct Packet {
    raw: Vec<u8>,
    xml: Option<XmlElement>,
    connection: Arc<Connection>,
}

impl Packet {
    pub fn new(frame: Frame, connection: Arc<Connection>) -> Self {
        Self {
            raw: frame.bytes,
            xml: frame.xml,
            connection,
        }
    }

    /// The message bytes exactly as received.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// The parsed document, for tag-delimited protocols.
    pub fn xml(&self) -> Option<&XmlElement> {
        self.xml.as_ref()
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Writes `bytes` back on the originating connection.
    ///
    /// # Errors
    ///
    /// See [`Connection::write`].
    pub async fn reply(&self, bytes: &[u8]) -> io::Result<()> {
        self.connection.write(bytes).await
    }
}

impl fmt::Display for Packet {
    /// XML packets show as text, everything else as escaped bytes.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.raw) {
            Ok(text) if self.xml.is_some() => f.write_str(text),
            _ => f.write_str(&display_payload(&self.raw)),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, DuplexStream};

    /// Builds a connection whose peer end is returned for inspection.
    pub(crate) fn connection_pair(remote_port: u16) -> (Arc<Connection>, DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(4096);
        let local: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let remote: SocketAddr = format!("127.0.0.1:{remote_port}").parse().unwrap();
        (Arc::new(Connection::new(local, remote, Box::new(ours))), theirs)
    }

    #[tokio::test]
    async fn test_write_delivers_bytes_to_peer() {
        // Arrange
        let (connection, mut peer) = connection_pair(5000);

        // Act
        connection.write(b"@HELLO\r\n").await.unwrap();

        // Assert
        let mut buf = [0u8; 8];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"@HELLO\r\n");
    }

    #[tokio::test]
    async fn test_write_after_close_is_not_connected() {
        let (connection, _peer) = connection_pair(5001);

        connection.close().await;
        let result = connection.write(b"x").await;

        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::NotConnected);
        assert!(connection.closing().is_cancelled());
    }

    #[tokio::test]
    async fn test_write_to_dropped_peer_fails_and_closes() {
        let (connection, peer) = connection_pair(5002);
        drop(peer);

        let result = connection.write(b"x").await;

        assert!(result.is_err());
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn test_close_interrupts_a_write_the_peer_never_drains() {
        // Arrange: a tiny pipe that nobody reads
        let (ours, _theirs) = tokio::io::duplex(64);
        let addr: SocketAddr = "127.0.0.1:5004".parse().unwrap();
        let connection = Arc::new(Connection::new(addr, addr, Box::new(ours)));
        let writer = Arc::clone(&connection);
        let stalled = tokio::spawn(async move { writer.write(&[0u8; 4096]).await });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        // Act
        let closed =
            tokio::time::timeout(std::time::Duration::from_secs(2), connection.close()).await;

        // Assert
        assert!(closed.is_ok(), "close must not wait for the stalled write");
        let result = stalled.await.unwrap();
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::NotConnected);
        assert!(connection.is_closed());
    }

    #[tokio::test]
    async fn test_packet_reply_goes_to_originating_connection() {
        // Arrange
        let (connection, mut peer) = connection_pair(5003);
        let packet = Packet::new(Frame::raw(b"@Q\n".to_vec()), Arc::clone(&connection));

        // Act
        packet.reply(b"@A\n").await.unwrap();

        // Assert
        let mut buf = [0u8; 3];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"@A\n");
        assert_eq!(packet.raw(), b"@Q\n");
        assert!(packet.xml().is_none());
    }

    #[test]
    fn test_connections_get_distinct_ids() {
        let (ours, _theirs) = tokio::io::duplex(16);
        let (ours2, _theirs2) = tokio::io::duplex(16);
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();

        let a = Connection::new(addr, addr, Box::new(ours));
        let b = Connection::new(addr, addr, Box::new(ours2));

        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_binary_packet_displays_escaped() {
        let (ours, _theirs) = tokio::io::duplex(16);
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let connection = Arc::new(Connection::new(addr, addr, Box::new(ours)));

        let packet = Packet::new(Frame::raw(b"@A\r\n".to_vec()), connection);

        assert_eq!(packet.to_string(), "@A\\r\\n");
    }
}
