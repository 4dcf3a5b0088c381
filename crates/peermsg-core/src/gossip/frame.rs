//! Open-channel wire frames
//!
//! ```text
//! {"type":"chat","data":{<message>}}
//! {"type":"have","data":{"ids":["01J...", ...]}}
//! ```
//!
//! Each frame is sealed with the pair's session key and sent as one
//! envelope per line.

use serde::{Deserialize, Serialize};

use crate::crypto::{Envelope, SessionKey};
use crate::error::PeerResult;
use crate::types::{Message, MessageId};

/// Inventory announcement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Have {
    /// Ids of the sender's most recent messages
    pub ids: Vec<MessageId>,
}

/// A replication frame. Unknown `type` tags fail to decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum WireFrame {
    /// A full message
    Chat(Message),
    /// An inventory of recent ids
    Have(Have),
}

impl WireFrame {
    /// Seal into a single text line
    pub fn seal(&self, key: &SessionKey) -> PeerResult<String> {
        key.seal(self)?.to_json()
    }

    /// Open a text line. Any failure is a decryption error.
    pub fn open(line: &str, key: &SessionKey) -> PeerResult<Self> {
        key.open(&Envelope::from_json(line)?)
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            WireFrame::Chat(_) => "chat",
            WireFrame::Have(_) => "have",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PeerError;

    fn key() -> SessionKey {
        SessionKey::from_bytes(SessionKey::generate_key())
    }

    #[test]
    fn test_chat_shape() {
        let msg = Message::new("aaaa", "hi");
        let json = serde_json::to_value(WireFrame::Chat(msg.clone())).unwrap();
        assert_eq!(json["type"], "chat");
        assert_eq!(json["data"]["text"], "hi");
        assert_eq!(json["data"]["id"], msg.id.as_str());
    }

    #[test]
    fn test_have_shape() {
        let frame = WireFrame::Have(Have {
            ids: vec![MessageId::from_string("a"), MessageId::from_string("b")],
        });
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json, serde_json::json!({"type": "have", "data": {"ids": ["a", "b"]}}));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let key = key();
        let line = key
            .seal(&serde_json::json!({"type": "ping", "data": {}}))
            .unwrap()
            .to_json()
            .unwrap();
        assert!(matches!(
            WireFrame::open(&line, &key),
            Err(PeerError::Decryption(_))
        ));
    }

    #[test]
    fn test_sealed_line_opens() {
        let key = key();
        let frame = WireFrame::Chat(Message::new("aaaa", "sealed"));
        let line = frame.seal(&key).unwrap();
        assert!(!line.contains("sealed"));
        assert_eq!(WireFrame::open(&line, &key).unwrap(), frame);
    }

    #[test]
    fn test_garbage_line_rejected() {
        assert!(matches!(
            WireFrame::open("not json", &key()),
            Err(PeerError::Decryption(_))
        ));
    }
}
