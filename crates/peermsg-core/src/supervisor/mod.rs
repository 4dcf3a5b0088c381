//! Connection supervisor
//!
//! Owns one [`Channel`] per stored friend and everything that keeps it
//! alive: the installed link, its reader and writer tasks, and (when a relay
//! is configured) the signaling driver that renegotiates after failures.
//!
//! Inbound frames from every link are funnelled into a single
//! [`ChannelEvent`] stream returned by [`Supervisor::new`]. Lifecycle changes
//! are broadcast as [`PeerEvent`]s.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{PeerError, PeerResult};
use crate::gossip::WireFrame;
use crate::identity::Identity;
use crate::pairing::PairedChannel;
use crate::relay::RelayConnector;
use crate::signaling::{room_id, SignalingClient};
use crate::storage::Store;
use crate::transport::{Link, Transport};
use crate::types::Friend;

mod backoff;
mod channel;
mod driver;
mod events;

pub use backoff::Backoff;
pub use channel::{Channel, ChannelInfo, ChannelState, Registry};
pub use events::{ChannelEvent, PeerEvent};

use channel::LinkHandle;
use driver::{Driver, DriverCommand};

/// Capacity of the UI event broadcast
const EVENT_CAPACITY: usize = 256;

pub(crate) struct Inner {
    pub(crate) identity: Arc<Identity>,
    pub(crate) config: Config,
    pub(crate) transport: Arc<dyn Transport>,
    store: Arc<dyn Store>,
    relay: Option<Arc<dyn RelayConnector>>,
    registry: Mutex<Registry>,
    events: broadcast::Sender<PeerEvent>,
    dispatch: mpsc::UnboundedSender<ChannelEvent>,
    generation: AtomicU64,
}

/// Per-friend channel lifecycle and reconnection.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// Create a supervisor and the receiving end of its dispatch stream.
    pub fn new(
        identity: Arc<Identity>,
        store: Arc<dyn Store>,
        config: Config,
        transport: Arc<dyn Transport>,
        relay: Option<Arc<dyn RelayConnector>>,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (dispatch, inbound) = mpsc::unbounded_channel();
        let inner = Inner {
            identity,
            config,
            transport,
            store,
            relay,
            registry: Mutex::new(Registry::default()),
            events,
            dispatch,
            generation: AtomicU64::new(0),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            inbound,
        )
    }

    /// Subscribe to lifecycle and message events
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.inner.events.subscribe()
    }

    /// Our fingerprint
    pub fn fingerprint(&self) -> &str {
        self.inner.identity.fingerprint()
    }

    /// Whether channels renegotiate through a relay
    pub fn has_relay(&self) -> bool {
        self.inner.relay.is_some()
    }

    /// Create a channel for every stored friend.
    ///
    /// A friend whose key cannot be used is logged and skipped.
    pub fn start(&self) -> PeerResult<usize> {
        let friends = self.inner.store.list_friends()?;
        let mut started = 0;
        for friend in friends {
            let fingerprint = friend.fingerprint.clone();
            match self.ensure_channel(friend) {
                Ok(_) => started += 1,
                Err(e) => warn!(peer = %fingerprint, error = %e, "Skipping friend"),
            }
        }
        info!(channels = started, relay = self.has_relay(), "Supervisor started");
        Ok(started)
    }

    /// Make sure a channel exists for `friend`. Returns `true` if one was created.
    pub fn ensure_channel(&self, friend: Friend) -> PeerResult<bool> {
        self.inner.ensure_channel(friend)
    }

    /// Adopt the link produced by a finished pairing.
    pub fn attach(&self, paired: PairedChannel) -> PeerResult<()> {
        let peer = paired.friend.fingerprint.clone();
        self.inner.ensure_channel(paired.friend)?;
        self.inner.install_link(&peer, paired.link)?;
        info!(%peer, "Paired channel attached");
        Ok(())
    }

    /// Seal `frame` and queue it on the link to `peer`.
    pub fn send_frame(&self, peer: &str, frame: &WireFrame) -> PeerResult<()> {
        let (writer, key) = {
            let registry = self.inner.registry.lock();
            let channel = registry
                .lookup(peer)
                .ok_or_else(|| PeerError::FriendNotFound(peer.to_string()))?;
            match (&channel.link, channel.is_open()) {
                (Some(link), true) => (link.writer(), channel.session_key.clone()),
                _ => {
                    return Err(PeerError::Transport(format!(
                        "channel to {} is not open",
                        peer
                    )))
                }
            }
        };

        let line = frame.seal(&key)?;
        writer
            .send(line)
            .map_err(|_| PeerError::Transport(format!("link to {} closed", peer)))?;
        debug!(%peer, kind = frame.kind(), "Frame queued");
        Ok(())
    }

    /// Fingerprints of all channels that can send right now, sorted
    pub fn open_peers(&self) -> Vec<String> {
        self.inner.registry.lock().open_peers()
    }

    /// Snapshot of every channel
    pub fn channels(&self) -> Vec<ChannelInfo> {
        self.inner.registry.lock().infos()
    }

    /// Lifecycle state of the channel to `peer`
    pub fn state_of(&self, peer: &str) -> Option<ChannelState> {
        self.inner.registry.lock().lookup(peer).map(|c| c.state)
    }

    /// Emit a lifecycle or message event.
    pub fn emit(&self, event: PeerEvent) {
        self.inner.emit(event);
    }

    /// Close the channel to `peer`. A closed channel is not retried.
    pub fn close(&self, peer: &str) -> PeerResult<()> {
        let had_link = {
            let mut registry = self.inner.registry.lock();
            let channel = registry
                .lookup_mut(peer)
                .ok_or_else(|| PeerError::FriendNotFound(peer.to_string()))?;
            channel.driver = None;
            let had_link = channel.link.take().is_some();
            channel.state = ChannelState::Closed;
            had_link
        };

        if had_link {
            let _ = self.inner.dispatch.send(ChannelEvent::Closed {
                peer: peer.to_string(),
            });
            self.inner.emit(PeerEvent::ChannelClosed {
                peer: peer.to_string(),
            });
        }
        self.inner.emit(PeerEvent::StateChanged {
            peer: peer.to_string(),
            state: ChannelState::Closed,
        });
        info!(%peer, "Channel closed");
        Ok(())
    }

    /// Abort every channel task
    pub fn shutdown(&self) {
        let mut registry = self.inner.registry.lock();
        let count = registry.len();
        registry.clear();
        info!(channels = count, "Supervisor shut down");
    }
}

impl Inner {
    fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    fn ensure_channel(self: &Arc<Self>, friend: Friend) -> PeerResult<bool> {
        let mut registry = self.registry.lock();
        if registry.lookup(&friend.fingerprint).is_some() {
            return Ok(false);
        }

        let session_key = self.identity.derive_session_key(&friend.public_key_raw()?)?;
        let mut channel = Channel::new(friend, session_key.clone());
        let peer = channel.friend.fingerprint.clone();

        if let Some(relay) = &self.relay {
            let signaling = SignalingClient::start(
                relay.clone(),
                room_id(&self.identity.public_key_b64(), &channel.friend.public_key),
                session_key,
                self.identity.fingerprint().to_string(),
                Backoff::from_config(&self.config),
            );
            channel.driver = Some(Driver::spawn(self, peer.clone(), signaling, false));
        }

        registry.add(channel);
        debug!(%peer, "Channel created");
        Ok(true)
    }

    /// Install a freshly negotiated link, replacing any existing one.
    pub(crate) fn install_link(self: &Arc<Self>, peer: &str, link: Link) -> PeerResult<()> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let (friend, previous, driver) = {
            let mut registry = self.registry.lock();
            let channel = registry
                .lookup_mut(peer)
                .ok_or_else(|| PeerError::FriendNotFound(peer.to_string()))?;

            let weak = Arc::downgrade(self);
            let lost_peer = peer.to_string();
            let handle = LinkHandle::spawn(
                peer.to_string(),
                channel.session_key.clone(),
                link,
                generation,
                self.dispatch.clone(),
                move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.link_lost(&lost_peer, generation);
                    }
                },
            );
            let replaced = channel.link.replace(handle).is_some();

            let previous = channel.state;
            channel.state = ChannelState::Connected;
            channel.friend.touch();
            if replaced {
                debug!(%peer, "Replacing existing link");
            }
            (
                channel.friend.clone(),
                previous,
                channel.driver.as_ref().map(|d| d.commands.clone()),
            )
        };

        if let Err(e) = self.store.save_friend(&friend) {
            warn!(%peer, error = %e, "Could not update last_seen");
        }
        if let Some(driver) = driver {
            let _ = driver.send(DriverCommand::LinkInstalled);
        }

        self.emit(PeerEvent::ChannelOpened {
            peer: peer.to_string(),
        });
        if previous != ChannelState::Connected {
            self.emit(PeerEvent::StateChanged {
                peer: peer.to_string(),
                state: ChannelState::Connected,
            });
        }
        info!(%peer, generation, "Channel connected");
        Ok(())
    }

    /// Called from a link's reader task when the link ends.
    fn link_lost(&self, peer: &str, generation: u64) {
        let driver = {
            let mut registry = self.registry.lock();
            let Some(channel) = registry.lookup_mut(peer) else {
                return;
            };
            match &channel.link {
                Some(link) if link.generation == generation => {}
                _ => return,
            }
            channel.link = None;
            channel.state = ChannelState::Disconnected;
            channel.driver.as_ref().map(|d| d.commands.clone())
        };

        warn!(%peer, generation, "Channel lost");
        let _ = self.dispatch.send(ChannelEvent::Closed {
            peer: peer.to_string(),
        });
        self.emit(PeerEvent::ChannelClosed {
            peer: peer.to_string(),
        });
        self.emit(PeerEvent::StateChanged {
            peer: peer.to_string(),
            state: ChannelState::Disconnected,
        });
        if let Some(driver) = driver {
            let _ = driver.send(DriverCommand::LinkLost);
        }
    }

    /// Record a lifecycle transition, emitting an event if it changed.
    pub(crate) fn set_state(&self, peer: &str, state: ChannelState) {
        let changed = {
            let mut registry = self.registry.lock();
            match registry.lookup_mut(peer) {
                Some(channel) if channel.state != state && channel.state != ChannelState::Closed => {
                    // A live link outranks a side negotiation's progress
                    if channel.link.is_some() && state != ChannelState::Connected {
                        false
                    } else {
                        channel.state = state;
                        true
                    }
                }
                _ => false,
            }
        };
        if changed {
            debug!(%peer, ?state, "Channel state");
            self.emit(PeerEvent::StateChanged {
                peer: peer.to_string(),
                state,
            });
        }
    }
}
