//! Messenger - the primary entry point for PeerMessenger
//!
//! Messenger wires together:
//! - the persisted identity and the [`Store`]
//! - the [`Supervisor`] owning one channel per friend
//! - the [`Replicator`] consuming every channel's frames
//! - manual pairing through invite and answer codes
//!
//! # Example
//!
//! ```ignore
//! use peermsg_core::{Config, Messenger};
//!
//! let alice = Messenger::open("~/.peermsg/alice", Config::default()).await?;
//! let invite = alice.create_invite().await?;
//! // ... hand `invite` to a friend, receive their answer code ...
//! alice.complete_invite(&answer).await?;
//! alice.send_text("hello")?;
//! ```

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{PeerError, PeerResult};
use crate::gossip::Replicator;
use crate::identity::Identity;
use crate::pairing::{Inviter, PairedChannel, Responder};
use crate::relay::RelayConnector;
use crate::signaling::WsConnector;
use crate::storage::{Storage, Store};
use crate::supervisor::{ChannelInfo, PeerEvent, Supervisor};
use crate::transport::{TaskGuard, TcpTransport, Transport};
use crate::types::{Friend, Message};

/// Summary of the local node for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// Our fingerprint
    pub fingerprint: String,
    /// Our base64url public key
    pub public_key: String,
    /// Stored friends
    pub friends: usize,
    /// Stored messages
    pub messages: usize,
    /// Channels that can send right now
    pub open_channels: usize,
    /// Whether relay-assisted reconnection is enabled
    pub relay: bool,
}

/// A running messenger node.
pub struct Messenger {
    identity: Arc<Identity>,
    store: Arc<dyn Store>,
    config: Config,
    transport: Arc<dyn Transport>,
    supervisor: Supervisor,
    replicator: Replicator,
    inviter: tokio::sync::Mutex<Option<Inviter>>,
    pairings: Mutex<Vec<TaskGuard>>,
    _replication: TaskGuard,
}

impl Messenger {
    /// Open (or create) a node in `data_dir` with the redb store, the TCP
    /// transport, and the WebSocket relay from `config.signaling_url`.
    pub async fn open(data_dir: impl AsRef<Path>, config: Config) -> PeerResult<Self> {
        let store: Arc<dyn Store> = Arc::new(Storage::open_in(data_dir)?);
        let transport: Arc<dyn Transport> =
            Arc::new(TcpTransport::from_addr_str(&config.listen_addr)?);
        let relay: Option<Arc<dyn RelayConnector>> = config
            .signaling_url
            .as_deref()
            .map(|url| Arc::new(WsConnector::new(url)) as Arc<dyn RelayConnector>);
        Self::with_parts(store, config, transport, relay).await
    }

    /// Start a node over explicit collaborators.
    ///
    /// Loads the identity from `store`, generating and saving one on first
    /// run, then creates a channel for every stored friend.
    pub async fn with_parts(
        store: Arc<dyn Store>,
        config: Config,
        transport: Arc<dyn Transport>,
        relay: Option<Arc<dyn RelayConnector>>,
    ) -> PeerResult<Self> {
        config.validate()?;
        let identity = Arc::new(load_or_create_identity(store.as_ref())?);
        info!(fingerprint = %identity.fingerprint(), "Identity loaded");

        let (supervisor, inbound) = Supervisor::new(
            identity.clone(),
            store.clone(),
            config.clone(),
            transport.clone(),
            relay,
        );
        let replicator = Replicator::new(supervisor.clone(), store.clone(), config.have_limit);
        let replication = TaskGuard(tokio::spawn(replicator.clone().run(inbound)));
        supervisor.start()?;

        Ok(Self {
            identity,
            store,
            config,
            transport,
            supervisor,
            replicator,
            inviter: tokio::sync::Mutex::new(None),
            pairings: Mutex::new(Vec::new()),
            _replication: replication,
        })
    }

    /// Our fingerprint
    pub fn fingerprint(&self) -> &str {
        self.identity.fingerprint()
    }

    /// Our identity
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The channel supervisor
    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Node summary
    pub fn node_info(&self) -> PeerResult<NodeInfo> {
        Ok(NodeInfo {
            fingerprint: self.identity.fingerprint().to_string(),
            public_key: self.identity.public_key_b64(),
            friends: self.store.list_friends()?.len(),
            messages: self.store.message_count()?,
            open_channels: self.supervisor.open_peers().len(),
            relay: self.supervisor.has_relay(),
        })
    }

    /// Start a pairing and return the offer code for the friend.
    ///
    /// Replaces any invite that is still waiting for an answer.
    pub async fn create_invite(&self) -> PeerResult<String> {
        let mut inviter = Inviter::new(self.identity.clone(), self.transport.clone());
        let code = inviter.create_invite(&self.config.display_name).await?;
        *self.inviter.lock().await = Some(inviter);
        Ok(code)
    }

    /// Apply the friend's answer code to the pending invite.
    ///
    /// A rejected code keeps the invite open for another attempt.
    pub async fn complete_invite(&self, code: &str) -> PeerResult<Friend> {
        let mut slot = self.inviter.lock().await;
        let inviter = slot
            .as_mut()
            .ok_or_else(|| PeerError::InvalidOperation("no pending invite".to_string()))?;
        let friend = inviter.complete(code, self.store.as_ref()).await?;

        if let Some(mut inviter) = slot.take() {
            self.spawn_pairing(friend.clone(), async move { inviter.connected().await });
        }
        Ok(friend)
    }

    /// Accept a friend's offer code and return the answer code for them.
    pub async fn accept_invite(&self, code: &str) -> PeerResult<String> {
        let mut responder = Responder::new(self.identity.clone(), self.transport.clone());
        let answer = responder.accept_invite(code, self.store.as_ref()).await?;
        let friend = responder
            .friend()
            .cloned()
            .ok_or_else(|| PeerError::InvalidOperation("invite not accepted".to_string()))?;
        self.spawn_pairing(friend, async move { responder.connected().await });
        Ok(answer)
    }

    fn spawn_pairing(
        &self,
        friend: Friend,
        connected: impl std::future::Future<Output = PeerResult<PairedChannel>> + Send + 'static,
    ) {
        let supervisor = self.supervisor.clone();
        let task = tokio::spawn(async move {
            let peer = friend.fingerprint.clone();
            let attached = match connected.await {
                Ok(paired) => supervisor.attach(paired),
                Err(e) => Err(e),
            };
            if let Err(e) = attached {
                warn!(%peer, error = %e, "Pairing link failed");
                // The relay may still reach them
                if let Err(e) = supervisor.ensure_channel(friend) {
                    warn!(%peer, error = %e, "Could not create channel");
                }
            }
        });

        let mut pairings = self.pairings.lock();
        pairings.retain(|t| !t.0.is_finished());
        pairings.push(TaskGuard(task));
    }

    /// Write a message and send it to every open channel.
    pub fn send_text(&self, text: &str) -> PeerResult<Message> {
        let text = text.trim();
        if text.is_empty() {
            return Err(PeerError::InvalidOperation("empty message".to_string()));
        }
        self.replicator.send_text(text)
    }

    /// All friends, sorted by name
    pub fn friends(&self) -> PeerResult<Vec<Friend>> {
        self.store.list_friends()
    }

    /// The newest `limit` messages, oldest first
    pub fn messages(&self, limit: usize) -> PeerResult<Vec<Message>> {
        self.store.recent_messages(limit)
    }

    /// Every channel and its state
    pub fn peers(&self) -> Vec<ChannelInfo> {
        self.supervisor.channels()
    }

    /// Subscribe to lifecycle and message events
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.supervisor.subscribe()
    }

    /// Abort pairings and channels.
    pub fn shutdown(&self) {
        self.pairings.lock().clear();
        self.supervisor.shutdown();
    }
}

impl Drop for Messenger {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn load_or_create_identity(store: &dyn Store) -> PeerResult<Identity> {
    match store.load_identity()? {
        Some(record) => Identity::from_record(&record),
        None => {
            let identity = Identity::generate()?;
            store.save_identity(&identity.to_record())?;
            info!(fingerprint = %identity.fingerprint(), "Generated new identity");
            Ok(identity)
        }
    }
}
