//! Replicated chat messages
//!
//! A message is identified by its id alone. Receiving the same id again never
//! creates a second record; it can only grow the `delivered_to` and `seen_by`
//! sets of the record already stored.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Globally unique, random message identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Generate a fresh id
    pub fn new() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Wrap an id received from a peer
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A chat message and its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique identifier
    pub id: MessageId,
    /// Unix timestamp in milliseconds when the message was created
    pub timestamp: i64,
    /// Fingerprint of the author
    pub sender_fingerprint: String,
    /// Message content
    pub text: String,
    /// Peers we know have received this message from us or through us
    #[serde(default)]
    pub delivered_to: BTreeSet<String>,
    /// Peers known to hold this message; never forwarded to again
    #[serde(default)]
    pub seen_by: BTreeSet<String>,
}

impl Message {
    /// Create a new message authored by `sender_fingerprint`.
    ///
    /// The sender is recorded in `seen_by` from the start.
    pub fn new(sender_fingerprint: impl Into<String>, text: impl Into<String>) -> Self {
        let sender_fingerprint = sender_fingerprint.into();
        let mut seen_by = BTreeSet::new();
        seen_by.insert(sender_fingerprint.clone());
        Self {
            id: MessageId::new(),
            timestamp: super::now_millis(),
            sender_fingerprint,
            text: text.into(),
            delivered_to: BTreeSet::new(),
            seen_by,
        }
    }

    /// Union another copy of the same message into this one.
    ///
    /// Returns `true` if either set grew.
    pub fn merge(&mut self, other: &Message) -> bool {
        let before = (self.delivered_to.len(), self.seen_by.len());
        self.delivered_to.extend(other.delivered_to.iter().cloned());
        self.seen_by.extend(other.seen_by.iter().cloned());
        before != (self.delivered_to.len(), self.seen_by.len())
    }

    /// Record that `fingerprint` holds this message. Returns `true` if new.
    pub fn mark_delivered(&mut self, fingerprint: &str) -> bool {
        self.delivered_to.insert(fingerprint.to_string())
    }

    /// Whether `fingerprint` is already known to hold this message
    pub fn seen_by(&self, fingerprint: &str) -> bool {
        self.seen_by.contains(fingerprint)
    }

    /// The copy sent to `next_hop`, with `next_hop` added to `seen_by`.
    pub fn forwarded_to(&self, next_hop: &str) -> Message {
        let mut copy = self.clone();
        copy.seen_by.insert(next_hop.to_string());
        copy
    }

    /// Whether this message was written by `fingerprint`
    pub fn is_from(&self, fingerprint: &str) -> bool {
        self.sender_fingerprint == fingerprint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_message_seen_by_sender() {
        let msg = Message::new("aaaa", "hello");
        assert!(msg.seen_by("aaaa"));
        assert!(msg.delivered_to.is_empty());
        assert!(msg.is_from("aaaa"));
    }

    #[test]
    fn test_ids_are_unique() {
        let a = Message::new("aaaa", "x");
        let b = Message::new("aaaa", "x");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_merge_is_union() {
        let mut local = Message::new("aaaa", "hi");
        local.mark_delivered("bbbb");

        let mut remote = local.clone();
        remote.delivered_to.clear();
        remote.seen_by.insert("cccc".to_string());

        assert!(local.merge(&remote));
        assert!(local.delivered_to.contains("bbbb"));
        assert!(local.seen_by("aaaa"));
        assert!(local.seen_by("cccc"));

        // Merging again changes nothing
        assert!(!local.merge(&remote));
    }

    #[test]
    fn test_forwarded_copy() {
        let msg = Message::new("aaaa", "hi");
        let copy = msg.forwarded_to("bbbb");
        assert!(copy.seen_by("bbbb"));
        assert!(!msg.seen_by("bbbb"));
        assert_eq!(copy.id, msg.id);
    }

    #[test]
    fn test_wire_field_names() {
        let msg = Message::new("aaaa", "hi");
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("senderFingerprint").is_some());
        assert!(json.get("deliveredTo").is_some());
        assert!(json.get("seenBy").is_some());
        assert_eq!(json["id"], serde_json::Value::String(msg.id.to_string()));
    }

    #[test]
    fn test_missing_sets_default_to_empty() {
        let json = r#"{"id":"x","timestamp":1,"senderFingerprint":"a","text":"t"}"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert!(msg.seen_by.is_empty());
        assert!(msg.delivered_to.is_empty());
    }
}
