//! Pluggable packet persistence.
//!
//! Every packet that reaches the persistence layer is submitted to a
//! [`PacketStore`] as a [`StoreRequest`]: the procedure to run, both ends of
//! the originating connection, and the raw payload.  The store may answer
//! with a reply, which is written straight back to the device before the
//! chain continues.
//!
//! The store itself is a seam.  The proxy only depends on the trait; what
//! sits behind it (a stored procedure in a relational database, a message
//! queue, a test double) is up to the embedding application.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use sqlio_core::display_payload;
use thiserror::Error;
use tracing::{debug, error};

use crate::application::packet::Packet;
use crate::application::pipeline::{Handler, HandlerError};

/// Procedure used for binary and line packets.
pub const DEFAULT_PACKET_PROCEDURE: &str = "SQLIO_IncomingPacket";

/// Procedure used for packets carrying an XML document.
pub const DEFAULT_XML_PROCEDURE: &str = "SQLIO_IncomingXML";

/// Errors reported by a [`PacketStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store was reached but the procedure failed.
    #[error("procedure {procedure} failed: {message}")]
    Procedure { procedure: String, message: String },
}

/// One submission to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreRequest {
    pub procedure: String,
    /// Our end of the device connection.
    pub local: SocketAddr,
    /// The device's end.
    pub remote: SocketAddr,
    pub payload: Vec<u8>,
}

impl StoreRequest {
    /// Builds the request for `packet`, picking the XML procedure when the
    /// packet carries a parsed document.
    pub fn for_packet(packet: &Packet, options: &StoreOptions) -> Self {
        let procedure = if packet.xml().is_some() {
            &options.xml_procedure
        } else {
            &options.packet_procedure
        };
        Self {
            procedure: procedure.clone(),
            local: packet.connection().local_addr(),
            remote: packet.connection().remote_addr(),
            payload: packet.raw().to_vec(),
        }
    }
}

/// Procedure names used by the persistence layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOptions {
    pub packet_procedure: String,
    pub xml_procedure: String,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            packet_procedure: DEFAULT_PACKET_PROCEDURE.to_string(),
            xml_procedure: DEFAULT_XML_PROCEDURE.to_string(),
        }
    }
}

/// Destination for packets; may produce one immediate reply per packet.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PacketStore: Send + Sync {
    /// Submits one packet.  `Ok(Some(reply))` is written back to the device.
    async fn submit(&self, request: &StoreRequest) -> Result<Option<Vec<u8>>, StoreError>;
}

/// Pipeline layer that submits every packet to `store`.
///
/// A store failure aborts the chain for that packet with
/// [`HandlerError::Store`], which carries the escaped payload.
pub fn persistence_layer(
    store: Arc<dyn PacketStore>,
    options: StoreOptions,
) -> impl FnOnce(Handler) -> Handler + Send {
    let options = Arc::new(options);
    move |next: Handler| {
        Handler::new(move |packet: Arc<Packet>| {
            let store = Arc::clone(&store);
            let options = Arc::clone(&options);
            let next = next.clone();
            async move {
                let request = StoreRequest::for_packet(&packet, &options);
                match store.submit(&request).await {
                    Ok(Some(reply)) => {
                        debug!(
                            "store replied {} to {}",
                            display_payload(&reply),
                            request.remote
                        );
                        packet
                            .reply(&reply)
                            .await
                            .map_err(|source| HandlerError::Reply {
                                remote: request.remote,
                                source,
                            })?;
                    }
                    Ok(None) => {}
                    Err(source) => {
                        let payload = display_payload(packet.raw());
                        error!(
                            "could not send packet {payload} from {} to {}: {source}",
                            request.remote, request.procedure
                        );
                        return Err(HandlerError::Store { payload, source });
                    }
                }
                next.call(packet).await
            }
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
