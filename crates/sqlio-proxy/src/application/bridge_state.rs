//! The two connection slots of a chat bridge.
//!
//! A bridge has at most one *remote* connection (the device we dialed) and
//! at most one *chat* connection (the local peer talking to that device).
//! Each slot is replaced independently: the supervisor fills the remote slot
//! on every reconnect, the chat listener fills the chat slot for every new
//! peer.
//!
//! Slots are cleared with compare-and-clear.  A writer that sees its write
//! fail clears the slot only if it still holds the connection that failed,
//! so a late failure report from an old connection can never wipe out the
//! one a reconnect has just installed.  The lock only guards the slot swap;
//! it is never held across a write.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, warn};
use uuid::Uuid;

use crate::application::packet::{Connection, Packet};
use crate::application::pipeline::Handler;

type Slot = Mutex<Option<Arc<Connection>>>;

/// Remote and chat slots shared by the supervisor and the chat listener.
#[derive(Debug, Default)]
pub struct BridgeState {
    remote: Slot,
    chat: Slot,
}

impl BridgeState {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Remote slot ───────────────────────────────────────────────────────────

    pub fn remote(&self) -> Option<Arc<Connection>> {
        self.remote.lock().clone()
    }

    /// Installs the freshly dialed device connection.
    pub fn set_remote(&self, connection: Arc<Connection>) -> Option<Arc<Connection>> {
        self.remote.lock().replace(connection)
    }

    /// Clears the remote slot if it still holds connection `id`.
    pub fn clear_remote_if(&self, id: Uuid) -> bool {
        clear_if(&self.remote, id)
    }

    /// Writes to the device.  Returns `false` when there is no device or the
    /// write failed (the slot is then compare-and-cleared).
    pub async fn write_remote(&self, bytes: &[u8]) -> bool {
        let Some(connection) = self.remote() else {
            warn!("there is no remote connection");
            return false;
        };
        match connection.write(bytes).await {
            Ok(()) => true,
            Err(e) => {
                error!("failed to write to remote {}: {e}", connection.remote_addr());
                self.clear_remote_if(connection.id());
                false
            }
        }
    }

    // ── Chat slot ─────────────────────────────────────────────────────────────

    pub fn chat(&self) -> Option<Arc<Connection>> {
        self.chat.lock().clone()
    }

    /// Installs a new chat peer and returns the one it displaced.
    pub fn replace_chat(&self, connection: Arc<Connection>) -> Option<Arc<Connection>> {
        self.chat.lock().replace(connection)
    }

    /// Clears the chat slot if it still holds connection `id`.
    pub fn clear_chat_if(&self, id: Uuid) -> bool {
        clear_if(&self.chat, id)
    }

    /// Writes to the chat peer.  Returns `false` when there is no peer or the
    /// write failed (the slot is then compare-and-cleared).
    pub async fn write_chat(&self, bytes: &[u8]) -> bool {
        let Some(connection) = self.chat() else {
            warn!("there is no chat connection");
            return false;
        };
        match connection.write(bytes).await {
            Ok(()) => true,
            Err(e) => {
                error!("failed to write to chat {}: {e}", connection.remote_addr());
                self.clear_chat_if(connection.id());
                false
            }
        }
    }
}

fn clear_if(slot: &Slot, id: Uuid) -> bool {
    let mut guard = slot.lock();
    let matches = guard.as_ref().is_some_and(|current| current.id() == id);
    if matches {
        guard.take();
    }
    matches
}

/// Pipeline layer that relays every packet's raw bytes to the chat peer, then
/// continues.  A missing or failed chat peer never aborts the chain.
pub fn chat_relay_layer(state: Arc<BridgeState>) -> impl FnOnce(Handler) -> Handler + Send {
    move |next: Handler| {
        Handler::new(move |packet: Arc<Packet>| {
            let state = Arc::clone(&state);
            let next = next.clone();
            async move {
                state.write_chat(packet.raw()).await;
                next.call(packet).await
            }
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
