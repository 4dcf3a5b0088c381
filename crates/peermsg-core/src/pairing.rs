//! Manual out-of-band pairing
//!
//! Two identities bootstrap a channel by copying two codes between them,
//! with no server involved:
//!
//! ```text
//! Inviter                                Responder
//!   create_invite()  ---- offer code --->  accept_invite()
//!   complete()       <--- answer code ---
//!   connected()      <==== link =====>     connected()
//! ```
//!
//! Codes are `pm1:` followed by base64url JSON. Both sides store a [`Friend`]
//! record for the other as soon as they have seen the other's identity.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::crypto::{b64url_decode, b64url_encode, SessionKey};
use crate::error::{PeerError, PeerResult};
use crate::identity::Identity;
use crate::storage::Store;
use crate::transport::{DescriptionKind, Link, Negotiation, SessionDescription, Transport};
use crate::types::Friend;

/// Prefix for encoded pairing codes
pub const CODE_PREFIX: &str = "pm1:";

/// Which handshake step a code belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodeType {
    /// Created by the inviter
    Offer,
    /// Created by the responder
    Answer,
}

impl std::fmt::Display for CodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodeType::Offer => f.write_str("offer"),
            CodeType::Answer => f.write_str("answer"),
        }
    }
}

/// The identity a code's author presents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderIdentity {
    /// base64url raw public key
    pub public_key: String,
    /// Fingerprint of `public_key`
    pub fingerprint: String,
    /// Only carried in offers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Decoded contents of a pairing code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingCode {
    /// Offer or answer
    #[serde(rename = "type")]
    pub code_type: CodeType,
    /// Link negotiation details, with every candidate included
    pub session_description: SessionDescription,
    /// Who wrote the code
    pub sender_identity: SenderIdentity,
}

impl PairingCode {
    /// Encode as a `pm1:` string.
    pub fn encode(&self) -> PeerResult<String> {
        let json = serde_json::to_vec(self)
            .map_err(|e| PeerError::Serialization(format!("Failed to encode code: {}", e)))?;
        Ok(format!("{}{}", CODE_PREFIX, b64url_encode(&json)))
    }

    /// Decode a `pm1:` string.
    ///
    /// # Errors
    ///
    /// Returns `PeerError::CodeFormat` if:
    /// - The string doesn't start with `pm1:`
    /// - The base64url payload is invalid
    /// - The JSON is malformed or has an unknown type
    /// - The fingerprint is not the digest of the public key
    pub fn decode(s: &str) -> PeerResult<Self> {
        let data = s.trim().strip_prefix(CODE_PREFIX).ok_or_else(|| {
            PeerError::CodeFormat(format!(
                "expected '{}' prefix, got '{}'",
                CODE_PREFIX,
                s.trim().chars().take(8).collect::<String>()
            ))
        })?;

        let bytes = b64url_decode(data)
            .map_err(|e| PeerError::CodeFormat(format!("Invalid base64url: {}", e)))?;
        let code: PairingCode = serde_json::from_slice(&bytes)
            .map_err(|e| PeerError::CodeFormat(format!("Invalid code data: {}", e)))?;

        // Validates the key and that the fingerprint belongs to it
        code.sender_friend()?;
        Ok(code)
    }

    /// Decode and require a particular step.
    pub fn decode_expecting(s: &str, expected: CodeType) -> PeerResult<Self> {
        let code = Self::decode(s)?;
        if code.code_type != expected {
            return Err(PeerError::ProtocolStep {
                expected: expected.to_string(),
                actual: code.code_type.to_string(),
            });
        }
        Ok(code)
    }

    /// Friend record for the code's author
    pub fn sender_friend(&self) -> PeerResult<Friend> {
        let sender = &self.sender_identity;
        Friend::from_presented(
            &sender.public_key,
            &sender.fingerprint,
            sender.display_name.as_deref(),
        )
        .map_err(|e| match e {
            PeerError::Identity(msg) => PeerError::CodeFormat(msg),
            other => other,
        })
    }
}

/// Inviter progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviterState {
    /// Nothing done yet
    Idle,
    /// Offer negotiated, code being encoded
    OfferCreated,
    /// Code handed out, waiting for the answer code
    AwaitingAnswer,
    /// Link established
    Connected,
}

/// Responder progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderState {
    /// Nothing done yet
    Idle,
    /// Offer code parsed
    OfferDecoded,
    /// Answer negotiated
    AnswerCreated,
    /// Answer code handed out, waiting for the link
    AwaitingConnection,
    /// Link established
    Connected,
}

/// A finished pairing: the friend, the pairwise key and the open link.
pub struct PairedChannel {
    /// The other side
    pub friend: Friend,
    /// Shared key for this pair
    pub session_key: SessionKey,
    /// The established link
    pub link: Link,
}

impl std::fmt::Debug for PairedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairedChannel")
            .field("friend", &self.friend.fingerprint)
            .finish_non_exhaustive()
    }
}

/// The side that creates the offer code.
pub struct Inviter {
    identity: Arc<Identity>,
    transport: Arc<dyn Transport>,
    state: InviterState,
    negotiation: Option<Negotiation>,
    friend: Option<Friend>,
}

impl Inviter {
    /// Create an idle inviter
    pub fn new(identity: Arc<Identity>, transport: Arc<dyn Transport>) -> Self {
        Self {
            identity,
            transport,
            state: InviterState::Idle,
            negotiation: None,
            friend: None,
        }
    }

    /// Current state
    pub fn state(&self) -> InviterState {
        self.state
    }

    /// The responder, once their answer was applied
    pub fn friend(&self) -> Option<&Friend> {
        self.friend.as_ref()
    }

    /// Start listening and produce the offer code.
    pub async fn create_invite(&mut self, display_name: &str) -> PeerResult<String> {
        if self.state != InviterState::Idle {
            return Err(PeerError::InvalidOperation(
                "invite already created".to_string(),
            ));
        }

        // Candidates are complete once the offer exists
        let negotiation = Negotiation::create_offer(self.transport.clone(), false).await?;
        self.state = InviterState::OfferCreated;

        let name = display_name.trim();
        let code = PairingCode {
            code_type: CodeType::Offer,
            session_description: negotiation.local_description().clone(),
            sender_identity: SenderIdentity {
                public_key: self.identity.public_key_b64(),
                fingerprint: self.identity.fingerprint().to_string(),
                display_name: (!name.is_empty()).then(|| name.to_string()),
            },
        }
        .encode()?;

        self.negotiation = Some(negotiation);
        self.state = InviterState::AwaitingAnswer;
        debug!("Invite created");
        Ok(code)
    }

    /// Apply the responder's answer code and remember them as a friend.
    ///
    /// A rejected code leaves the inviter waiting for another attempt.
    pub async fn complete(&mut self, code: &str, store: &dyn Store) -> PeerResult<Friend> {
        if self.state != InviterState::AwaitingAnswer || self.friend.is_some() {
            return Err(PeerError::InvalidOperation(
                "no invite is awaiting an answer".to_string(),
            ));
        }
        let answer = PairingCode::decode_expecting(code, CodeType::Answer)?;
        let friend = answer.sender_friend()?;
        if friend.fingerprint == self.identity.fingerprint() {
            return Err(PeerError::CodeFormat(
                "answer code was created by this identity".to_string(),
            ));
        }
        if answer.session_description.kind != DescriptionKind::Answer {
            return Err(PeerError::CodeFormat(
                "answer code carries an offer description".to_string(),
            ));
        }
        let negotiation = self
            .negotiation
            .as_ref()
            .ok_or_else(|| PeerError::InvalidOperation("no negotiation".to_string()))?;

        // Nothing is applied until the friend is stored
        store.save_friend(&friend)?;
        negotiation.set_remote_description(answer.session_description)?;
        info!(friend = %friend.fingerprint, "Pairing answer applied");
        self.friend = Some(friend.clone());
        Ok(friend)
    }

    /// Wait for the link to come up after [`complete`](Self::complete).
    pub async fn connected(&mut self) -> PeerResult<PairedChannel> {
        let friend = self
            .friend
            .clone()
            .ok_or_else(|| PeerError::InvalidOperation("pairing not completed".to_string()))?;
        let negotiation = self
            .negotiation
            .as_mut()
            .ok_or_else(|| PeerError::InvalidOperation("no negotiation".to_string()))?;

        let link = negotiation.connected().await?;
        let session_key = self.identity.derive_session_key(&friend.public_key_raw()?)?;
        self.state = InviterState::Connected;
        Ok(PairedChannel {
            friend,
            session_key,
            link,
        })
    }
}

/// The side that accepts an offer code.
pub struct Responder {
    identity: Arc<Identity>,
    transport: Arc<dyn Transport>,
    state: ResponderState,
    negotiation: Option<Negotiation>,
    friend: Option<Friend>,
}

impl Responder {
    /// Create an idle responder
    pub fn new(identity: Arc<Identity>, transport: Arc<dyn Transport>) -> Self {
        Self {
            identity,
            transport,
            state: ResponderState::Idle,
            negotiation: None,
            friend: None,
        }
    }

    /// Current state
    pub fn state(&self) -> ResponderState {
        self.state
    }

    /// The inviter, once their code was accepted
    pub fn friend(&self) -> Option<&Friend> {
        self.friend.as_ref()
    }

    /// Accept an offer code, remember the inviter, and produce the answer code.
    pub async fn accept_invite(&mut self, code: &str, store: &dyn Store) -> PeerResult<String> {
        if self.state != ResponderState::Idle {
            return Err(PeerError::InvalidOperation(
                "invite already accepted".to_string(),
            ));
        }
        let offer = PairingCode::decode_expecting(code, CodeType::Offer)?;
        let friend = offer.sender_friend()?;
        if friend.fingerprint == self.identity.fingerprint() {
            return Err(PeerError::CodeFormat(
                "invite code was created by this identity".to_string(),
            ));
        }
        self.state = ResponderState::OfferDecoded;

        let result = self.answer_offer(offer, friend, store);
        if result.is_err() {
            // Back to the start so the same code can be retried
            self.state = ResponderState::Idle;
        }
        result
    }

    fn answer_offer(
        &mut self,
        offer: PairingCode,
        friend: Friend,
        store: &dyn Store,
    ) -> PeerResult<String> {
        let negotiation =
            Negotiation::accept_offer(self.transport.clone(), offer.session_description)?;
        self.state = ResponderState::AnswerCreated;

        let answer = PairingCode {
            code_type: CodeType::Answer,
            session_description: negotiation.local_description().clone(),
            sender_identity: SenderIdentity {
                public_key: self.identity.public_key_b64(),
                fingerprint: self.identity.fingerprint().to_string(),
                display_name: None,
            },
        }
        .encode()?;
        store.save_friend(&friend)?;

        info!(friend = %friend.fingerprint, "Invite accepted");
        self.negotiation = Some(negotiation);
        self.friend = Some(friend);
        self.state = ResponderState::AwaitingConnection;
        Ok(answer)
    }

    /// Wait for the inviter to apply our answer and the link to come up.
    pub async fn connected(&mut self) -> PeerResult<PairedChannel> {
        let friend = self
            .friend
            .clone()
            .ok_or_else(|| PeerError::InvalidOperation("invite not accepted".to_string()))?;
        let negotiation = self
            .negotiation
            .as_mut()
            .ok_or_else(|| PeerError::InvalidOperation("no negotiation".to_string()))?;

        let link = negotiation.connected().await?;
        let session_key = self.identity.derive_session_key(&friend.public_key_raw()?)?;
        self.state = ResponderState::Connected;
        Ok(PairedChannel {
            friend,
            session_key,
            link,
        })
    }
}
