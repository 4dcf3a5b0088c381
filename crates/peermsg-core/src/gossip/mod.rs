//! Gossip message replication
//!
//! Keeps the message log converging across whatever channels are open:
//!
//! - on open, each side announces its most recent ids with `have`
//! - on `have`, the receiver sends back every recent message the other lacks
//! - on `chat` with an unknown id, the message is stored, announced, and
//!   forwarded to every other open peer that has not seen it
//!
//! Known ids are merged (delivery tracking only) and never forwarded again.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::PeerResult;
use crate::storage::Store;
use crate::supervisor::{ChannelEvent, PeerEvent, Supervisor};
use crate::types::{Message, MessageId};

mod frame;

pub use frame::{Have, WireFrame};

/// Replicates messages over the supervisor's channels.
#[derive(Clone)]
pub struct Replicator {
    supervisor: Supervisor,
    store: Arc<dyn Store>,
    have_limit: usize,
}

impl Replicator {
    /// `have_limit` bounds both the `have` inventory and the backfill window.
    pub fn new(supervisor: Supervisor, store: Arc<dyn Store>, have_limit: usize) -> Self {
        Self {
            supervisor,
            store,
            have_limit,
        }
    }

    /// Consume the supervisor's dispatch stream until it closes.
    pub async fn run(self, mut inbound: mpsc::UnboundedReceiver<ChannelEvent>) {
        while let Some(event) = inbound.recv().await {
            if let Err(e) = self.handle(event) {
                warn!(error = %e, "Replication step failed");
            }
        }
        debug!("Replicator stopped");
    }

    /// Handle a single channel event.
    pub fn handle(&self, event: ChannelEvent) -> PeerResult<()> {
        match event {
            ChannelEvent::Opened { peer } => self.announce(&peer),
            ChannelEvent::Frame { peer, frame } => match frame {
                WireFrame::Have(have) => self.backfill(&peer, &have),
                WireFrame::Chat(message) => self.receive(&peer, message),
            },
            ChannelEvent::Closed { peer } => {
                debug!(%peer, "Channel closed, nothing to replicate");
                Ok(())
            }
        }
    }

    /// Create, store, and send a message of our own.
    pub fn send_text(&self, text: &str) -> PeerResult<Message> {
        let message = Message::new(self.supervisor.fingerprint(), text);
        let outcome = self.store.merge_message(&message)?;
        self.supervisor.emit(PeerEvent::MessageStored {
            message: outcome.message.clone(),
            from: None,
        });

        let peers = self.supervisor.open_peers();
        for peer in &peers {
            if let Err(e) = self
                .supervisor
                .send_frame(peer, &WireFrame::Chat(message.clone()))
            {
                warn!(%peer, error = %e, "Could not send message");
            }
        }
        info!(id = %message.id, peers = peers.len(), "Message sent");
        Ok(outcome.message)
    }

    fn announce(&self, peer: &str) -> PeerResult<()> {
        let ids: Vec<MessageId> = self
            .store
            .recent_messages(self.have_limit)?
            .into_iter()
            .map(|m| m.id)
            .collect();
        debug!(%peer, count = ids.len(), "Announcing inventory");
        self.supervisor
            .send_frame(peer, &WireFrame::Have(Have { ids }))
    }

    fn backfill(&self, peer: &str, have: &Have) -> PeerResult<()> {
        let known: HashSet<&MessageId> = have.ids.iter().collect();
        let missing: Vec<Message> = self
            .store
            .recent_messages(self.have_limit)?
            .into_iter()
            .filter(|m| !known.contains(&m.id))
            .collect();

        if !missing.is_empty() {
            debug!(%peer, count = missing.len(), "Backfilling");
        }
        for message in missing {
            self.supervisor.send_frame(peer, &WireFrame::Chat(message))?;
        }
        Ok(())
    }

    fn receive(&self, peer: &str, message: Message) -> PeerResult<()> {
        let mut record = message.clone();
        record.mark_delivered(peer);
        let outcome = self.store.merge_message(&record)?;
        if !outcome.inserted {
            debug!(%peer, id = %message.id, "Known message merged");
            return Ok(());
        }

        debug!(%peer, id = %message.id, "New message stored");
        self.supervisor.emit(PeerEvent::MessageStored {
            message: outcome.message,
            from: Some(peer.to_string()),
        });

        for next in self.supervisor.open_peers() {
            if next == peer || message.seen_by(&next) {
                continue;
            }
            let copy = message.forwarded_to(&next);
            if let Err(e) = self.supervisor.send_frame(&next, &WireFrame::Chat(copy)) {
                warn!(peer = %next, error = %e, "Could not forward message");
            }
        }
        Ok(())
    }
}
