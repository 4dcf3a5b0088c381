//! Per-friend channel records and the registry that owns them

use std::collections::HashMap;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::driver::DriverHandle;
use super::events::ChannelEvent;
use crate::crypto::SessionKey;
use crate::gossip::WireFrame;
use crate::transport::{Link, TaskGuard};
use crate::types::Friend;

/// Channel lifecycle. Same states as a single negotiation.
pub use crate::transport::ConnectionState as ChannelState;

/// Snapshot of a channel for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    /// Friend fingerprint
    pub fingerprint: String,
    /// Friend display name
    pub display_name: String,
    /// Current state
    pub state: ChannelState,
}

/// The tasks serving one established link.
pub(crate) struct LinkHandle {
    pub(crate) generation: u64,
    writer: mpsc::UnboundedSender<String>,
    _reader: TaskGuard,
    _writer: TaskGuard,
}

impl LinkHandle {
    /// Split `link` into a reader task and a writer task.
    ///
    /// The reader announces the link on `dispatch`, forwards every frame
    /// that opens cleanly, and calls `on_lost` once the link ends.
    pub(crate) fn spawn(
        peer: String,
        key: SessionKey,
        link: Link,
        generation: u64,
        dispatch: mpsc::UnboundedSender<ChannelEvent>,
        on_lost: impl FnOnce() + Send + 'static,
    ) -> Self {
        let (mut sink, mut stream) = link.split();
        let (writer, mut outbox) = mpsc::unbounded_channel::<String>();

        let writer_task = tokio::spawn(async move {
            while let Some(line) = outbox.recv().await {
                if let Err(e) = sink.send(line).await {
                    debug!(error = %e, "Link write failed");
                    break;
                }
            }
        });

        let reader_task = tokio::spawn(async move {
            let _ = dispatch.send(ChannelEvent::Opened { peer: peer.clone() });
            while let Some(line) = stream.next().await {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        debug!(%peer, error = %e, "Link read failed");
                        break;
                    }
                };
                match WireFrame::open(&line, &key) {
                    Ok(frame) => {
                        let _ = dispatch.send(ChannelEvent::Frame {
                            peer: peer.clone(),
                            frame,
                        });
                    }
                    Err(e) => warn!(%peer, error = %e, "Dropping undecodable frame"),
                }
            }
            on_lost();
        });

        Self {
            generation,
            writer,
            _reader: TaskGuard(reader_task),
            _writer: TaskGuard(writer_task),
        }
    }

    /// Queue a sealed line for the writer task.
    pub(crate) fn send_line(&self, line: String) -> bool {
        self.writer.send(line).is_ok()
    }

    pub(crate) fn writer(&self) -> mpsc::UnboundedSender<String> {
        self.writer.clone()
    }
}

/// Runtime state for one friend. Exists only for stored friends.
pub struct Channel {
    /// The friend this channel reaches
    pub friend: Friend,
    /// Pairwise key for frames on this channel
    pub session_key: SessionKey,
    /// Lifecycle state
    pub state: ChannelState,
    pub(crate) link: Option<LinkHandle>,
    pub(crate) driver: Option<DriverHandle>,
}

impl Channel {
    /// A channel with no link yet
    pub fn new(friend: Friend, session_key: SessionKey) -> Self {
        Self {
            friend,
            session_key,
            state: ChannelState::New,
            link: None,
            driver: None,
        }
    }

    /// Whether frames can be sent right now
    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Connected && self.link.is_some()
    }

    /// Display snapshot
    pub fn info(&self) -> ChannelInfo {
        ChannelInfo {
            fingerprint: self.friend.fingerprint.clone(),
            display_name: self.friend.display_name.clone(),
            state: self.state,
        }
    }
}

/// All channels, keyed by friend fingerprint.
#[derive(Default)]
pub struct Registry {
    channels: HashMap<String, Channel>,
}

impl Registry {
    /// Insert a channel, returning any channel it replaced.
    pub fn add(&mut self, channel: Channel) -> Option<Channel> {
        self.channels
            .insert(channel.friend.fingerprint.clone(), channel)
    }

    /// Remove and return a channel.
    pub fn remove(&mut self, fingerprint: &str) -> Option<Channel> {
        self.channels.remove(fingerprint)
    }

    /// Look up a channel
    pub fn lookup(&self, fingerprint: &str) -> Option<&Channel> {
        self.channels.get(fingerprint)
    }

    /// Look up a channel for mutation
    pub fn lookup_mut(&mut self, fingerprint: &str) -> Option<&mut Channel> {
        self.channels.get_mut(fingerprint)
    }

    /// Fingerprints of every channel that can send right now, sorted.
    pub fn open_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self
            .channels
            .values()
            .filter(|c| c.is_open())
            .map(|c| c.friend.fingerprint.clone())
            .collect();
        peers.sort();
        peers
    }

    /// Snapshots of every channel, sorted by name
    pub fn infos(&self) -> Vec<ChannelInfo> {
        let mut infos: Vec<ChannelInfo> = self.channels.values().map(Channel::info).collect();
        infos.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        infos
    }

    /// Number of channels
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether there are no channels
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Drop every channel, aborting its tasks
    pub fn clear(&mut self) {
        self.channels.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::transport::{frame, BoxedStream};

    fn channel(name: &str) -> Channel {
        let identity = Identity::generate().unwrap();
        let friend =
            Friend::from_presented(&identity.public_key_b64(), identity.fingerprint(), Some(name))
                .unwrap();
        Channel::new(friend, SessionKey::from_bytes(SessionKey::generate_key()))
    }

    #[test]
    fn test_registry_add_lookup_remove() {
        let mut registry = Registry::default();
        let c = channel("Bob");
        let fp = c.friend.fingerprint.clone();

        assert!(registry.add(c).is_none());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup(&fp).unwrap().state, ChannelState::New);
        assert!(registry.open_peers().is_empty());

        registry.lookup_mut(&fp).unwrap().state = ChannelState::Failed;
        assert_eq!(registry.infos()[0].state, ChannelState::Failed);

        assert!(registry.remove(&fp).is_some());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_link_handle_reads_and_writes() {
        let key = SessionKey::from_bytes(SessionKey::generate_key());
        let (near, far) = tokio::io::duplex(4096);
        let mut remote = frame(Box::new(far) as BoxedStream);

        let (dispatch, mut events) = mpsc::unbounded_channel();
        let (lost_tx, lost_rx) = tokio::sync::oneshot::channel();
        let handle = LinkHandle::spawn(
            "bbbb".to_string(),
            key.clone(),
            frame(Box::new(near) as BoxedStream),
            1,
            dispatch,
            move || {
                let _ = lost_tx.send(());
            },
        );

        assert_eq!(
            events.recv().await.unwrap(),
            ChannelEvent::Opened {
                peer: "bbbb".to_string()
            }
        );

        // Garbage is dropped, the link survives
        remote.send("garbage".to_string()).await.unwrap();
        let frame_out = WireFrame::Have(crate::gossip::Have { ids: vec![] });
        remote.send(frame_out.seal(&key).unwrap()).await.unwrap();
        match events.recv().await.unwrap() {
            ChannelEvent::Frame { peer, frame } => {
                assert_eq!(peer, "bbbb");
                assert_eq!(frame, frame_out);
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(handle.send_line("outbound".to_string()));
        assert_eq!(remote.next().await.unwrap().unwrap(), "outbound");

        drop(remote);
        lost_rx.await.unwrap();
    }
}
