//! Persistent storage using redb.
//!
//! This module provides ACID-compliant storage for:
//! - The local identity (single record in the `kv` table)
//! - Friend records keyed by fingerprint
//! - Message records keyed by id, merged on write
//!
//! Everything above this layer talks to the [`Store`] trait so tests can run
//! against [`MemoryStore`] instead of a database file.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, DatabaseError, ReadableTable, ReadableTableMetadata, TableDefinition};

use crate::error::{PeerError, PeerResult};
use crate::identity::IdentityRecord;
use crate::types::{Friend, Message, MessageId};

mod memory;

pub use memory::MemoryStore;

/// Default database file name inside a data directory
pub const DB_FILE_NAME: &str = "peermsg.redb";

// Table definitions
const KV_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");
const FRIENDS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("friends");
const MESSAGES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("messages");

/// Result of merging a message into the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    /// The record as stored after the merge
    pub message: Message,
    /// `true` if no record with this id existed before
    pub inserted: bool,
}

/// Persistence collaborator.
///
/// Message writes are merge-on-write: storing an id that already exists
/// unions `delivered_to` and `seen_by` into the existing record and never
/// replaces the text, timestamp or sender. Implementations must perform the
/// read-merge-write atomically so concurrent receipts of the same id converge.
pub trait Store: Send + Sync {
    /// Read a raw value from the key/value table
    fn get(&self, key: &str) -> PeerResult<Option<Vec<u8>>>;

    /// Write a raw value to the key/value table
    fn set(&self, key: &str, value: &[u8]) -> PeerResult<()>;

    /// Save a friend, overwriting any existing record for the fingerprint
    fn save_friend(&self, friend: &Friend) -> PeerResult<()>;

    /// Load a friend by fingerprint
    fn load_friend(&self, fingerprint: &str) -> PeerResult<Option<Friend>>;

    /// All friends, sorted by display name
    fn list_friends(&self) -> PeerResult<Vec<Friend>>;

    /// Remove a friend. Succeeds if the friend does not exist.
    fn delete_friend(&self, fingerprint: &str) -> PeerResult<()>;

    /// Load a message by id
    fn load_message(&self, id: &MessageId) -> PeerResult<Option<Message>>;

    /// Insert a message or merge it into the existing record with the same id
    fn merge_message(&self, message: &Message) -> PeerResult<MergeOutcome>;

    /// The newest `limit` messages by timestamp, returned oldest first
    fn recent_messages(&self, limit: usize) -> PeerResult<Vec<Message>>;

    /// Number of stored messages
    fn message_count(&self) -> PeerResult<usize>;

    /// Load the local identity record, if one was saved.
    fn load_identity(&self) -> PeerResult<Option<IdentityRecord>> {
        match self.get(IDENTITY_KEY)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| PeerError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    /// Persist the local identity record.
    fn save_identity(&self, record: &IdentityRecord) -> PeerResult<()> {
        let bytes =
            serde_json::to_vec(record).map_err(|e| PeerError::Serialization(e.to_string()))?;
        self.set(IDENTITY_KEY, &bytes)
    }
}

/// Identity storage key (there's only one identity per node)
const IDENTITY_KEY: &str = "identity";

/// Sort newest-last and keep the tail.
pub(crate) fn newest_tail(mut messages: Vec<Message>, limit: usize) -> Vec<Message> {
    messages.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.id.cmp(&b.id))
    });
    let skip = messages.len().saturating_sub(limit);
    messages.split_off(skip)
}

fn encode<T: serde::Serialize>(value: &T) -> PeerResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| PeerError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> PeerResult<T> {
    serde_json::from_slice(bytes).map_err(|e| PeerError::Serialization(e.to_string()))
}

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
}

impl Storage {
    /// Create a new storage instance at the given path.
    ///
    /// This will:
    /// - Create the database directory if it doesn't exist
    /// - Initialize the database file
    /// - Create all required tables
    pub fn new(path: impl AsRef<Path>) -> PeerResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path).map_err(|e| match e {
            DatabaseError::DatabaseAlreadyOpen => PeerError::InUse(path.display().to_string()),
            other => other.into(),
        })?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(KV_TABLE)?;
            let _ = write_txn.open_table(FRIENDS_TABLE)?;
            let _ = write_txn.open_table(MESSAGES_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    /// Open `peermsg.redb` inside a data directory
    pub fn open_in(data_dir: impl AsRef<Path>) -> PeerResult<Self> {
        Self::new(data_dir.as_ref().join(DB_FILE_NAME))
    }
}

impl Store for Storage {
    fn get(&self, key: &str) -> PeerResult<Option<Vec<u8>>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(KV_TABLE)?;
        Ok(table.get(key)?.map(|v| v.value().to_vec()))
    }

    fn set(&self, key: &str, value: &[u8]) -> PeerResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(KV_TABLE)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn save_friend(&self, friend: &Friend) -> PeerResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(FRIENDS_TABLE)?;
            let data = encode(friend)?;
            table.insert(friend.fingerprint.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn load_friend(&self, fingerprint: &str) -> PeerResult<Option<Friend>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(FRIENDS_TABLE)?;

        match table.get(fingerprint)? {
            Some(v) => Ok(Some(decode(v.value())?)),
            None => Ok(None),
        }
    }

    fn list_friends(&self) -> PeerResult<Vec<Friend>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(FRIENDS_TABLE)?;

        let mut friends = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            friends.push(decode::<Friend>(value.value())?);
        }
        friends.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        Ok(friends)
    }

    fn delete_friend(&self, fingerprint: &str) -> PeerResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(FRIENDS_TABLE)?;
            table.remove(fingerprint)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn load_message(&self, id: &MessageId) -> PeerResult<Option<Message>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(MESSAGES_TABLE)?;

        match table.get(id.as_str())? {
            Some(v) => Ok(Some(decode(v.value())?)),
            None => Ok(None),
        }
    }

    fn merge_message(&self, message: &Message) -> PeerResult<MergeOutcome> {
        let db = self.db.read();
        // redb serializes write transactions, which makes the merge atomic
        let write_txn = db.begin_write()?;
        let outcome = {
            let mut table = write_txn.open_table(MESSAGES_TABLE)?;
            let existing = table
                .get(message.id.as_str())?
                .map(|v| decode::<Message>(v.value()))
                .transpose()?;

            let outcome = match existing {
                Some(mut stored) => {
                    stored.merge(message);
                    MergeOutcome {
                        message: stored,
                        inserted: false,
                    }
                }
                None => MergeOutcome {
                    message: message.clone(),
                    inserted: true,
                },
            };

            let data = encode(&outcome.message)?;
            table.insert(message.id.as_str(), data.as_slice())?;
            outcome
        };
        write_txn.commit()?;
        Ok(outcome)
    }

    fn recent_messages(&self, limit: usize) -> PeerResult<Vec<Message>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(MESSAGES_TABLE)?;

        let mut messages = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            messages.push(decode::<Message>(value.value())?);
        }
        Ok(newest_tail(messages, limit))
    }

    fn message_count(&self) -> PeerResult<usize> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(MESSAGES_TABLE)?;
        Ok(table.len()? as usize)
    }
}
