//! Transport abstraction for peer links

use crate::error::MeshResult;
use async_trait::async_trait;
use shared::{Message, PeerId};
use std::time::Duration;

/// Events a transport reports to the relay node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A peer was seen by a scan but no link exists yet
    PeerDiscovered { peer_id: PeerId, name: String },

    /// A link to the peer is up and frames may flow
    PeerConnected {
        peer_id: PeerId,
        name: String,
        group_id: Option<String>,
    },

    PeerDisconnected { peer_id: PeerId },

    /// Raw frame received from a connected peer, in link order
    FrameReceived { peer_id: PeerId, bytes: Vec<u8> },
}

/// Trait for link-agnostic peer operations
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start discovering peers, repeating every `interval`
    async fn start_scanning(&self, interval: Duration) -> MeshResult<()>;

    /// Send a message to a connected peer
    async fn send(&self, peer: &PeerId, message: &Message) -> MeshResult<()>;

    /// Drop the link to a peer
    async fn disconnect(&self, peer: &PeerId) -> MeshResult<()>;

    /// Peers with an open link
    async fn connected_devices(&self) -> MeshResult<Vec<PeerId>>;
}
