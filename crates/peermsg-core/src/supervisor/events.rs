//! Events emitted by the supervisor

use super::channel::ChannelState;
use crate::gossip::WireFrame;
use crate::types::Message;

/// Notifications for the rendering layer, fanned out on a broadcast channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A link to `peer` is up
    ChannelOpened {
        /// Friend fingerprint
        peer: String,
    },
    /// The link to `peer` went away
    ChannelClosed {
        /// Friend fingerprint
        peer: String,
    },
    /// Lifecycle transition of a channel
    StateChanged {
        /// Friend fingerprint
        peer: String,
        /// New state
        state: ChannelState,
    },
    /// A message was stored for the first time
    MessageStored {
        /// The stored record
        message: Message,
        /// Who delivered it, `None` if written locally
        from: Option<String>,
    },
}

/// Inbound traffic from all channels, consumed at one dispatch point.
///
/// For each peer, `Opened` precedes that link's frames and `Closed`
/// follows them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A link was installed
    Opened {
        /// Friend fingerprint
        peer: String,
    },
    /// A frame that decrypted and decoded cleanly
    Frame {
        /// Friend fingerprint
        peer: String,
        /// The frame
        frame: WireFrame,
    },
    /// The link dropped
    Closed {
        /// Friend fingerprint
        peer: String,
    },
}
