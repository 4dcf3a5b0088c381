//! Friend records
//!
//! A friend is a remote identity we completed a handshake with. The mapping
//! from fingerprint to friend is append-only; only `last_seen` and
//! `display_name` change after creation.

use serde::{Deserialize, Serialize};

use crate::error::{PeerError, PeerResult};
use crate::identity::{decode_public_key, fingerprint};

/// Default name for a friend who did not announce one
pub const DEFAULT_FRIEND_NAME: &str = "Friend";

/// A paired remote identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Friend {
    /// Grouped hex fingerprint (primary key)
    pub fingerprint: String,
    /// base64url raw public key
    pub public_key: String,
    /// Human-readable name
    pub display_name: String,
    /// Unix timestamp (milliseconds) of the last time we saw this friend
    pub last_seen: i64,
}

impl Friend {
    /// Create a friend record from the identity a peer presented.
    ///
    /// The fingerprint must be the digest of the public key; a mismatch means
    /// the code was forged or corrupted.
    pub fn from_presented(
        public_key: &str,
        claimed_fingerprint: &str,
        display_name: Option<&str>,
    ) -> PeerResult<Self> {
        let raw = decode_public_key(public_key)?;
        let actual = fingerprint(&raw);
        if actual != claimed_fingerprint {
            return Err(PeerError::CodeFormat(format!(
                "Fingerprint {} does not match public key",
                claimed_fingerprint
            )));
        }

        let display_name = display_name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(DEFAULT_FRIEND_NAME)
            .to_string();

        Ok(Self {
            fingerprint: actual,
            public_key: public_key.to_string(),
            display_name,
            last_seen: super::now_millis(),
        })
    }

    /// Update the last_seen timestamp to now
    pub fn touch(&mut self) {
        self.last_seen = super::now_millis();
    }

    /// Raw public key bytes.
    pub fn public_key_raw(&self) -> PeerResult<[u8; 32]> {
        decode_public_key(&self.public_key)
    }

    /// Initials for compact display
    pub fn initials(&self) -> String {
        self.display_name
            .trim()
            .chars()
            .take(2)
            .collect::<String>()
            .to_uppercase()
    }
}
