//! PeerMessenger Core Library
//!
//! Serverless, end-to-end encrypted messaging between paired identities with
//! gossip-based message replication.
//!
//! ## Overview
//!
//! Two people pair by copying an invite code and an answer code between
//! them. From then on their nodes share a static X25519 key, talk over a
//! direct link, and keep a message log that converges across every friend
//! that happens to be reachable. When a relay is configured, broken links
//! are renegotiated through encrypted signaling in a room only the two of
//! them can compute.
//!
//! ## Core Principles
//!
//! - **No plaintext server**: the relay only forwards sealed envelopes
//! - **Local-first**: messages are written locally and replicated later
//! - **Idempotent convergence**: messages are keyed by id and merged by union
//!
//! ## Quick Start
//!
//! ```ignore
//! use peermsg_core::{Config, Messenger};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let node = Messenger::open("~/.peermsg/data", Config::default()).await?;
//!
//!     let invite = node.create_invite().await?;
//!     println!("Send this to your friend: {}", invite);
//!
//!     for message in node.messages(50)? {
//!         println!("{}: {}", message.sender_fingerprint, message.text);
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod gossip;
pub mod identity;
pub mod logging;
pub mod pairing;
pub mod relay;
pub mod signaling;
pub mod storage;
pub mod supervisor;
pub mod transport;
pub mod types;

// Re-exports
pub use config::Config;
pub use crypto::{Envelope, SessionKey};
pub use engine::{Messenger, NodeInfo};
pub use error::{PeerError, PeerResult};
pub use gossip::{Have, Replicator, WireFrame};
pub use identity::{fingerprint, short_fingerprint, Identity};
pub use pairing::{CodeType, Inviter, PairedChannel, PairingCode, Responder};
pub use relay::{MemoryRelay, RelayConnector, RoomHub};
pub use signaling::{room_id, SignalKind, SignalMessage, SignalingClient, WsConnector};
pub use storage::{MemoryStore, Storage, Store};
pub use supervisor::{Backoff, ChannelInfo, ChannelState, PeerEvent, Supervisor};
pub use transport::{MemoryNetwork, TcpTransport, Transport};
pub use types::*;
