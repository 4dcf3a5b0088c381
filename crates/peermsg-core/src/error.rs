//! Error types for PeerMessenger

use thiserror::Error;

/// Main error type for PeerMessenger operations
#[derive(Error, Debug)]
pub enum PeerError {
    /// Pairing code has an unrecognized prefix or an unparsable payload
    #[error("Invalid pairing code: {0}")]
    CodeFormat(String),

    /// Pairing code is well formed but belongs to the wrong handshake step
    #[error("Unexpected handshake step: expected {expected}, got {actual}")]
    ProtocolStep {
        /// The code type the current step accepts
        expected: String,
        /// The code type that was supplied
        actual: String,
    },

    /// Decryption failed (wrong key, tampered data, or malformed envelope)
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// Persistence layer failure
    #[error("Store error: {0}")]
    Store(String),

    /// Another process holds the database lock
    #[error("Database {0} is in use by another node")]
    InUse(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Key material is missing, malformed, or could not be generated
    #[error("Identity error: {0}")]
    Identity(String),

    /// Raw channel could not be negotiated or has failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Relay connection failure
    #[error("Relay error: {0}")]
    Relay(String),

    /// Configuration could not be loaded
    #[error("Config error: {0}")]
    Config(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No friend record for the given fingerprint
    #[error("Friend not found: {0}")]
    FriendNotFound(String),

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl PeerError {
    /// Whether this error belongs to the persistence layer.
    ///
    /// Store failures must reach the caller; everything raised while handling
    /// inbound traffic is otherwise logged and dropped.
    pub fn is_store(&self) -> bool {
        matches!(
            self,
            PeerError::Store(_)
                | PeerError::Database(_)
                | PeerError::Transaction(_)
                | PeerError::Table(_)
                | PeerError::StorageOp(_)
                | PeerError::Commit(_)
        )
    }
}

/// Result type alias using PeerError
pub type PeerResult<T> = Result<T, PeerError>;
