//! In-memory [`Store`] for tests and ephemeral nodes

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::{newest_tail, MergeOutcome, Store};
use crate::error::{PeerError, PeerResult};
use crate::types::{Friend, Message, MessageId};

#[derive(Default)]
struct Tables {
    kv: HashMap<String, Vec<u8>>,
    friends: HashMap<String, Friend>,
    messages: HashMap<MessageId, Message>,
}

/// A store that lives and dies with the process.
///
/// Writes can be made to fail with [`MemoryStore::fail_writes`] to exercise
/// error propagation.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write return a store error (or stop doing so).
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> PeerResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PeerError::Store("write rejected".to_string()));
        }
        Ok(())
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> PeerResult<Option<Vec<u8>>> {
        Ok(self.tables.lock().kv.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> PeerResult<()> {
        self.check_writable()?;
        self.tables.lock().kv.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn save_friend(&self, friend: &Friend) -> PeerResult<()> {
        self.check_writable()?;
        self.tables
            .lock()
            .friends
            .insert(friend.fingerprint.clone(), friend.clone());
        Ok(())
    }

    fn load_friend(&self, fingerprint: &str) -> PeerResult<Option<Friend>> {
        Ok(self.tables.lock().friends.get(fingerprint).cloned())
    }

    fn list_friends(&self) -> PeerResult<Vec<Friend>> {
        let mut friends: Vec<Friend> = self.tables.lock().friends.values().cloned().collect();
        friends.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        Ok(friends)
    }

    fn delete_friend(&self, fingerprint: &str) -> PeerResult<()> {
        self.check_writable()?;
        self.tables.lock().friends.remove(fingerprint);
        Ok(())
    }

    fn load_message(&self, id: &MessageId) -> PeerResult<Option<Message>> {
        Ok(self.tables.lock().messages.get(id).cloned())
    }

    fn merge_message(&self, message: &Message) -> PeerResult<MergeOutcome> {
        self.check_writable()?;
        let mut tables = self.tables.lock();
        match tables.messages.get_mut(&message.id) {
            Some(stored) => {
                stored.merge(message);
                Ok(MergeOutcome {
                    message: stored.clone(),
                    inserted: false,
                })
            }
            None => {
                tables.messages.insert(message.id.clone(), message.clone());
                Ok(MergeOutcome {
                    message: message.clone(),
                    inserted: true,
                })
            }
        }
    }

    fn recent_messages(&self, limit: usize) -> PeerResult<Vec<Message>> {
        let messages: Vec<Message> = self.tables.lock().messages.values().cloned().collect();
        Ok(newest_tail(messages, limit))
    }

    fn message_count(&self) -> PeerResult<usize> {
        Ok(self.tables.lock().messages.len())
    }
}
