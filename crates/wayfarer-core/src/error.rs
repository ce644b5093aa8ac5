//! Error types for the Wayfarer sync core

use thiserror::Error;

/// Main error type for sync core operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// Device is offline or the remote service is unreachable
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(String),

    /// Remote call exceeded its bounded timeout
    #[error("Remote call timed out: {0}")]
    Timeout(String),

    /// Remote service rejected the operation's inputs
    #[error("Remote validation error: {0}")]
    RemoteValidation(String),

    /// Remote service rejected the caller's credentials
    #[error("Remote auth error: {0}")]
    RemoteAuth(String),

    /// Local store detected a duplicate canonical write.
    ///
    /// Callers treat this as "already applied, safe to ignore".
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Message cannot be opened with available keys
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// Conversation was not found in the local store
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    /// Message was not found in the local store
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// Error during storage operations (redb)
    #[error("Storage error: {0}")]
    Storage(String),

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

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Device credentials are missing from the secure store
    #[error("Credentials missing: {0}")]
    CredentialsMissing(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Whether this failure should be retried (outbox enqueue + backoff)
    /// rather than surfaced to the caller as permanent.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::NetworkUnavailable(_) | SyncError::Timeout(_)
        )
    }

    /// Whether this failure means the write was already applied.
    pub fn is_conflict(&self) -> bool {
        matches!(self, SyncError::Conflict(_))
    }
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::ConversationNotFound("conv-1".to_string());
        assert_eq!(format!("{}", err), "Conversation not found: conv-1");
    }

    #[test]
    fn test_transient_classification() {
        assert!(SyncError::NetworkUnavailable("down".into()).is_transient());
        assert!(SyncError::Timeout("5s".into()).is_transient());
        assert!(!SyncError::RemoteValidation("bad input".into()).is_transient());
        assert!(!SyncError::RemoteAuth("expired".into()).is_transient());
        assert!(!SyncError::Conflict("dup".into()).is_transient());
    }

    #[test]
    fn test_conflict_classification() {
        assert!(SyncError::Conflict("dup".into()).is_conflict());
        assert!(!SyncError::NetworkUnavailable("down".into()).is_conflict());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let sync_err: SyncError = io_err.into();
        assert!(matches!(sync_err, SyncError::Io(_)));
    }
}
