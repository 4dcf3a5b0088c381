//! In-process transport for tests
//!
//! Every node of a test shares one [`MemoryNetwork`]. Listening registers a
//! numbered endpoint; dialing it creates a `tokio::io::duplex` pair and hands
//! one half to the listener.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{BoxedStream, Candidate, Listener, Transport};
use crate::error::{PeerError, PeerResult};

const SCHEME: &str = "mem";
const DUPLEX_BUFFER: usize = 64 * 1024;

#[derive(Default)]
struct Hub {
    endpoints: Mutex<HashMap<u64, mpsc::Sender<BoxedStream>>>,
    next_id: AtomicU64,
    offline: AtomicBool,
}

/// A shared in-memory network. Clones refer to the same network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Hub>,
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every dial fails; existing streams are untouched.
    pub fn set_offline(&self, offline: bool) {
        self.hub.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of endpoints still accepting
    pub fn endpoint_count(&self) -> usize {
        let mut endpoints = self.hub.endpoints.lock();
        endpoints.retain(|_, tx| !tx.is_closed());
        endpoints.len()
    }
}

#[async_trait]
impl Transport for MemoryNetwork {
    async fn listen(&self) -> PeerResult<Listener> {
        let id = self.hub.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, incoming) = mpsc::channel(8);
        self.hub.endpoints.lock().insert(id, tx);

        Ok(Listener {
            candidates: vec![Candidate::new(SCHEME, id)],
            incoming,
            _guard: None,
        })
    }

    async fn dial(&self, candidate: &Candidate) -> PeerResult<BoxedStream> {
        if self.hub.offline.load(Ordering::SeqCst) {
            return Err(PeerError::Transport("network is offline".to_string()));
        }

        let id: u64 = match candidate.parts() {
            Some((SCHEME, id)) => id
                .parse()
                .map_err(|_| PeerError::Transport(format!("Bad candidate {}", candidate)))?,
            _ => {
                return Err(PeerError::Transport(format!(
                    "Unsupported candidate {}",
                    candidate
                )))
            }
        };

        let tx = self
            .hub
            .endpoints
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| PeerError::Transport(format!("No endpoint at {}", candidate)))?;

        let (near, far) = tokio::io::duplex(DUPLEX_BUFFER);
        tx.send(Box::new(far))
            .await
            .map_err(|_| PeerError::Transport(format!("Endpoint {} closed", candidate)))?;
        Ok(Box::new(near))
    }
}
