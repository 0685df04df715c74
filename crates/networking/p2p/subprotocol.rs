use std::sync::Arc;

use bytes::Bytes;

use crate::rlpx::p2p::Capability;

/// An installed subprotocol: a named, versioned message space multiplexed
/// over a devp2p connection.
///
/// Handlers are addressed by connection id and send replies back through the
/// owning [`Network`](crate::Network); they hold no reference that could keep
/// a closed connection alive.
pub trait Subprotocol: Send + Sync {
    /// Capabilities to advertise in our Hello, in preference order.
    fn capabilities(&self) -> Vec<Capability>;

    /// Whether this subprotocol can serve the given capability.
    fn supports(&self, capability: &Capability) -> bool;

    /// Number of message ids the subprotocol uses at the given version.
    fn message_space(&self, version: u8) -> u8;

    /// Called once per connection after the Hello exchange selects this
    /// subprotocol.
    fn new_peer_connection(&self, conn_id: &str);

    /// Handles one inbound message, already mapped to the subprotocol's own
    /// id space.
    fn handle(&self, capability: &Capability, msg_id: u8, data: Bytes, conn_id: &str);
}

/// Ordered table of installed subprotocols. Registration order decides both
/// the Hello capability list and which handler wins a contested capability.
#[derive(Clone, Default)]
pub struct SubprotocolRegistry {
    entries: Vec<Arc<dyn Subprotocol>>,
}

impl SubprotocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, subprotocol: Arc<dyn Subprotocol>) {
        self.entries.push(subprotocol);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The capability list for our Hello, in registration order.
    pub fn capabilities(&self) -> Vec<Capability> {
        self.entries
            .iter()
            .flat_map(|entry| entry.capabilities())
            .collect()
    }

    /// First installed subprotocol supporting the capability, if any.
    pub(crate) fn find_supporting(
        &self,
        capability: &Capability,
    ) -> Option<(usize, &Arc<dyn Subprotocol>)> {
        self.entries
            .iter()
            .enumerate()
            .find(|(_, entry)| entry.supports(capability))
    }

    pub(crate) fn get(&self, index: usize) -> Option<&Arc<dyn Subprotocol>> {
        self.entries.get(index)
    }
}
