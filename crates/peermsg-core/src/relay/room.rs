//! Room membership and fan-out

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use super::backlog::{Backlog, DEFAULT_MAX_AGE, DEFAULT_MAX_BACKLOG};

struct Room {
    members: HashMap<u64, mpsc::UnboundedSender<String>>,
    backlog: Backlog,
}

/// All rooms of one relay.
///
/// Frames are opaque text. A frame published by a member goes to every
/// other member of the same room and into the room's backlog.
pub struct RoomHub {
    rooms: Mutex<HashMap<String, Room>>,
    next_member: AtomicU64,
    max_backlog: usize,
    max_age: Duration,
}

impl Default for RoomHub {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BACKLOG, DEFAULT_MAX_AGE)
    }
}

impl RoomHub {
    /// Create a hub whose rooms keep at most `max_backlog` frames for `max_age`
    pub fn new(max_backlog: usize, max_age: Duration) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            next_member: AtomicU64::new(1),
            max_backlog,
            max_age,
        }
    }

    /// Join `room`. The backlog is queued on the returned receiver before
    /// any live frame.
    pub fn join(self: &Arc<Self>, room: &str) -> (Membership, mpsc::UnboundedReceiver<String>) {
        let id = self.next_member.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        let now = Instant::now();

        {
            let mut rooms = self.rooms.lock();
            let entry = rooms.entry(room.to_string()).or_insert_with(|| Room {
                members: HashMap::new(),
                backlog: Backlog::new(self.max_backlog, self.max_age),
            });
            let replay = entry.backlog.replay(now);
            debug!(room, member = id, replayed = replay.len(), "Member joined");
            for frame in replay {
                let _ = tx.send(frame);
            }
            entry.members.insert(id, tx);
        }

        (
            Membership {
                hub: self.clone(),
                room: room.to_string(),
                id,
            },
            rx,
        )
    }

    fn publish(&self, room: &str, from: u64, frame: String) {
        let mut rooms = self.rooms.lock();
        let Some(entry) = rooms.get_mut(room) else {
            return;
        };
        entry.members.retain(|id, tx| *id == from || !tx.is_closed());
        for (id, tx) in &entry.members {
            if *id != from {
                let _ = tx.send(frame.clone());
            }
        }
        entry.backlog.push(frame, Instant::now());
    }

    fn leave(&self, room: &str, id: u64) {
        let mut rooms = self.rooms.lock();
        let now = Instant::now();
        if let Some(entry) = rooms.get_mut(room) {
            entry.members.remove(&id);
            debug!(room, member = id, "Member left");
        }
        rooms.retain(|_, r| {
            r.backlog.prune(now);
            !r.members.is_empty() || !r.backlog.is_empty()
        });
    }

    /// Members currently in `room`
    pub fn member_count(&self, room: &str) -> usize {
        self.rooms
            .lock()
            .get(room)
            .map(|r| r.members.len())
            .unwrap_or(0)
    }

    /// Frames retained for `room`
    pub fn backlog_len(&self, room: &str) -> usize {
        let mut rooms = self.rooms.lock();
        match rooms.get_mut(room) {
            Some(r) => {
                r.backlog.prune(Instant::now());
                r.backlog.len()
            }
            None => 0,
        }
    }
}

/// A connection's seat in a room. Leaves on drop.
pub struct Membership {
    hub: Arc<RoomHub>,
    room: String,
    id: u64,
}

impl Membership {
    /// Fan a frame out to the other members and retain it.
    pub fn publish(&self, frame: String) {
        self.hub.publish(&self.room, self.id, frame);
    }

    /// The room joined
    pub fn room(&self) -> &str {
        &self.room
    }
}

impl Drop for Membership {
    fn drop(&mut self) {
        self.hub.leave(&self.room, self.id);
    }
}
