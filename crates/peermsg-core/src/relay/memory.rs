//! In-process relay for tests

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{RelayConnector, RelayLink, RoomHub};
use crate::error::{PeerError, PeerResult};

/// A relay living inside the test process. Clones share the same hub.
#[derive(Clone)]
pub struct MemoryRelay {
    hub: Arc<RoomHub>,
    offline: Arc<AtomicBool>,
    connections: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::with_hub(Arc::new(RoomHub::default()))
    }
}

impl MemoryRelay {
    /// Create a relay with default backlog bounds
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a relay over an existing hub
    pub fn with_hub(hub: Arc<RoomHub>) -> Self {
        Self {
            hub,
            offline: Arc::new(AtomicBool::new(false)),
            connections: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The underlying hub
    pub fn hub(&self) -> &Arc<RoomHub> {
        &self.hub
    }

    /// While offline, new connections are refused.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Sever every open connection, as a relay restart would.
    pub fn drop_connections(&self) {
        for handle in self.connections.lock().drain(..) {
            handle.abort();
        }
    }
}

#[async_trait]
impl RelayConnector for MemoryRelay {
    async fn connect(&self, room: &str) -> PeerResult<RelayLink> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(PeerError::Relay("relay unreachable".to_string()));
        }

        let (membership, mut from_room) = self.hub.join(room);
        let (outgoing, mut from_client) = mpsc::unbounded_channel::<String>();
        let (to_client, incoming) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = from_client.recv() => match frame {
                        Some(frame) => membership.publish(frame),
                        None => break,
                    },
                    frame = from_room.recv() => match frame {
                        Some(frame) => {
                            if to_client.send(frame).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        let mut connections = self.connections.lock();
        connections.retain(|h| !h.is_finished());
        connections.push(task);

        Ok(RelayLink { outgoing, incoming })
    }
}
