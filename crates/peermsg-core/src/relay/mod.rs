//! Signaling relay
//!
//! The relay never sees plaintext. It groups connections into rooms by id,
//! forwards every text frame verbatim to the other members of the room, and
//! keeps a bounded backlog so a peer that joins late still receives recent
//! control messages.
//!
//! [`RoomHub`] holds the room logic and is shared by the `peermsg-relay`
//! WebSocket server and the in-process [`MemoryRelay`]. Clients reach a relay
//! through a [`RelayConnector`].

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::PeerResult;

pub mod backlog;
mod memory;
mod room;

pub use backlog::{Backlog, DEFAULT_MAX_AGE, DEFAULT_MAX_BACKLOG};
pub use memory::MemoryRelay;
pub use room::{Membership, RoomHub};

/// A live connection to one relay room.
///
/// `incoming` yields `None` once the connection is gone; sends on `outgoing`
/// fail from then on.
#[derive(Debug)]
pub struct RelayLink {
    /// Frames to publish
    pub outgoing: mpsc::UnboundedSender<String>,
    /// Frames from other members, backlog first
    pub incoming: mpsc::UnboundedReceiver<String>,
}

/// Opens connections to a relay.
#[async_trait]
pub trait RelayConnector: Send + Sync + 'static {
    /// Join `room` on the relay.
    async fn connect(&self, room: &str) -> PeerResult<RelayLink>;
}
