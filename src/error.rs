//! MirrorSync Error Types

use thiserror::Error;

/// Result type alias for MirrorSync operations
pub type Result<T> = std::result::Result<T, Error>;

/// MirrorSync error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Invalid replica argument: {0}")]
    InvalidReplica(String),

    // Session errors
    #[error("Replication already active")]
    AlreadyActive,

    #[error("Confirmation wait timed out for revision {rev}")]
    ConfirmationTimeout { rev: String },

    // Replication lifecycle errors
    #[error("Replication denied: {0}")]
    ReplicationDenied(String),

    #[error("Fatal replication error: {0}")]
    ReplicationFatal(String),

    // Document errors
    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Revision conflict for document {0}")]
    Conflict(String),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Attachment not found: {id}/{name}")]
    AttachmentNotFound { id: String, name: String },

    // Storage engine errors
    #[error("Storage error: {0}")]
    Storage(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error means "written, confirmation unknown".
    ///
    /// The underlying write already succeeded at the write target; only the
    /// confirmation on the mirrored replica's change feed is missing.
    pub fn is_confirmation_timeout(&self) -> bool {
        matches!(self, Error::ConfirmationTimeout { .. })
    }

    /// Check if this error resets session state to the safe default replica
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ReplicationDenied(_) | Error::ReplicationFatal(_)
        )
    }
}
