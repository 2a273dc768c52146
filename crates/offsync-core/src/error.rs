//! Error types for the sync core

use thiserror::Error;

/// Main error type for sync core operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// Encrypt/decrypt called before a key was derived
    #[error("Encryption service is not initialized")]
    NotInitialized,

    /// Authentication of an encrypted payload failed (wrong key, corrupted
    /// or tampered ciphertext; the variants are indistinguishable)
    #[error("Decryption failed")]
    DecryptionFailed,

    /// Encrypted envelope uses a format version this build cannot read
    #[error("Unsupported encryption format version: {0}")]
    UnsupportedVersion(u32),

    /// Cryptographic operation failed for a reason other than authentication
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Entity type matches one of the configured exclude patterns
    #[error("Entity type '{0}' is excluded from sync")]
    Excluded(String),

    /// Change request rejected before any I/O
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration value rejected
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// No pending conflict for the given index or entity key
    #[error("Conflict not found: {0}")]
    ConflictNotFound(String),

    /// Change record checksum does not match its payload
    #[error("Change record {0} is corrupted (checksum mismatch)")]
    Corrupted(String),

    /// Error reported by a local store implementation
    #[error("Storage error: {0}")]
    Storage(String),

    /// Error reported by the remote sync service
    #[error("Remote error: {0}")]
    Remote(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

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

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;
