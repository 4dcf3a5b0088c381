//! Encrypted control plane over a shared relay
//!
//! Once two identities are friends they can renegotiate a link without
//! copying codes again. Both join a relay room whose id only they can
//! compute and exchange sealed control messages there:
//!
//! ```text
//! {"__enc":true,"payload":{"iv":"...","ct":"..."}}
//! ```
//!
//! The sealed payload is a [`SignalMessage`]; the relay only ever sees the
//! envelope. The signaling key is the same pairwise key used on the link.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::crypto::{b64url_encode, Envelope, SessionKey};
use crate::error::{PeerError, PeerResult};
use crate::transport::{Candidate, SessionDescription};

mod client;
mod websocket;

pub use client::{SignalEvent, SignalingClient};
pub use websocket::WsConnector;

const ROOM_DOMAIN: &str = "pm-room:";

/// Derive the relay room for a pair of base64url public keys.
///
/// Order-independent: both friends compute the same id.
pub fn room_id(public_a: &str, public_b: &str) -> String {
    let mut keys = [public_a, public_b];
    keys.sort_unstable();
    let digest = Sha256::digest(format!("{}{}", ROOM_DOMAIN, keys.join("|")).as_bytes());
    b64url_encode(&digest)
}

/// Control message body. Unknown kinds fail to decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SignalKind {
    /// Sent on joining the room
    Hello,
    /// A fresh offer; candidates follow as `candidate` messages
    Offer {
        /// The offer description
        description: SessionDescription,
    },
    /// Reply to an offer
    Answer {
        /// The answer description
        description: SessionDescription,
        /// Session token of the offer being answered
        #[serde(rename = "inReplyTo")]
        in_reply_to: String,
    },
    /// A trickled candidate of an offer
    Candidate {
        /// Dialable address
        candidate: Candidate,
        /// Session token of the offer it belongs to
        session: String,
    },
}

impl SignalKind {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            SignalKind::Hello => "hello",
            SignalKind::Offer { .. } => "offer",
            SignalKind::Answer { .. } => "answer",
            SignalKind::Candidate { .. } => "candidate",
        }
    }
}

/// A control message and its author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    /// What is being signaled
    #[serde(flatten)]
    pub kind: SignalKind,
    /// Fingerprint of the author, used to drop our own echoes
    pub sender_fingerprint: String,
}

#[derive(Serialize, Deserialize)]
struct RelayFrame {
    #[serde(rename = "__enc")]
    enc: bool,
    payload: Envelope,
}

impl SignalMessage {
    /// Seal into a relay text frame
    pub fn seal(&self, key: &SessionKey) -> PeerResult<String> {
        let frame = RelayFrame {
            enc: true,
            payload: key.seal(self)?,
        };
        serde_json::to_string(&frame).map_err(|e| PeerError::Serialization(e.to_string()))
    }

    /// Open a relay text frame. Plaintext frames are refused.
    pub fn open(text: &str, key: &SessionKey) -> PeerResult<Self> {
        let frame: RelayFrame = serde_json::from_str(text)
            .map_err(|e| PeerError::Decryption(format!("Malformed relay frame: {}", e)))?;
        if !frame.enc {
            return Err(PeerError::Decryption("unencrypted relay frame".to_string()));
        }
        key.open(&frame.payload)
    }
}
