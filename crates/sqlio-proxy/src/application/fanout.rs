//! Fanout: one write, every registered peer.
//!
//! The registry maps a remote address to the live [`Connection`] registered
//! under it.  A broadcast works on a snapshot of the members, so
//! registrations and removals that happen meanwhile never block it.  A member
//! whose write fails is removed right away and is never written to again;
//! only a fresh registration brings that address back.

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{info, warn};

use crate::application::packet::{Connection, Packet};
use crate::application::pipeline::Handler;

/// Concurrent set of fanout members keyed by remote address.
#[derive(Debug, Default)]
pub struct FanoutRegistry {
    members: DashMap<SocketAddr, Arc<Connection>>,
}

impl FanoutRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `connection`.  Returns `false`, leaving the registry untouched,
    /// when its remote address is already registered.
    pub fn register(&self, connection: Arc<Connection>) -> bool {
        match self.members.entry(connection.remote_addr()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(connection);
                true
            }
        }
    }

    /// Removes `connection` if it is still the one registered for its
    /// address.
    pub fn unregister(&self, connection: &Connection) -> bool {
        let id = connection.id();
        self.members
            .remove_if(&connection.remote_addr(), |_, member| member.id() == id)
            .is_some()
    }

    /// Writes `bytes` to every member and returns how many writes succeeded.
    pub async fn broadcast(&self, bytes: &[u8]) -> usize {
        let snapshot: Vec<Arc<Connection>> = self
            .members
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut delivered = 0;
        for member in snapshot {
            match member.write(bytes).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(
                        "fanout write to {} failed, removing it: {e}",
                        member.remote_addr()
                    );
                    self.unregister(&member);
                }
            }
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.members.contains_key(addr)
    }
}

/// Pipeline layer that broadcasts every packet's raw bytes, then continues.
pub fn fanout_layer(registry: Arc<FanoutRegistry>) -> impl FnOnce(Handler) -> Handler + Send {
    move |next: Handler| {
        Handler::new(move |packet: Arc<Packet>| {
            let registry = Arc::clone(&registry);
            let next = next.clone();
            async move {
                let recipients = registry.broadcast(packet.raw()).await;
                info!("fanout completed to {recipients} recipients");
                next.call(packet).await
            }
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
