//! Error types for the block storage engine.

use thiserror::Error;

/// Result type alias for keepstore operations.
pub type KeepResult<T> = Result<T, KeepError>;

/// Error variants for keepstore operations.
#[derive(Debug, Error)]
pub enum KeepError {
    /// Wraps standard I/O errors raised by a volume backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The block is absent or trashed on every candidate volume.
    #[error("Block not found: {hash}")]
    NotFound {
        /// Hash of the missing block.
        hash: String,
    },

    /// Stored data has the requested hash but differs from the data being written.
    #[error("Hash collision: stored data for {hash} differs from the data being written")]
    Collision {
        /// Hash shared by both inputs.
        hash: String,
    },

    /// Stored data does not match its own hash.
    #[error("Checksum mismatch in stored data for {hash}")]
    Corrupt {
        /// Hash the stored data was filed under.
        hash: String,
    },

    /// Uploaded data does not match the hash the client asked for.
    #[error("Hash mismatch: request for {expected} carried data hashing to {actual}")]
    HashMismatch {
        /// Hash requested by the client.
        expected: String,
        /// Hash of the data received.
        actual: String,
    },

    /// The locator string could not be parsed.
    #[error("Invalid locator: {locator:?}")]
    InvalidLocator {
        /// The offending locator.
        locator: String,
    },

    /// Signature is missing, malformed, or does not match.
    #[error("Forbidden: invalid signature")]
    Forbidden,

    /// Signature is valid but its expiry time has passed.
    #[error("Expired signature")]
    Expired,

    /// Signature enforcement is on and the request carried no token.
    #[error("Missing authorization token")]
    NoToken,

    /// The volume has no space for the block.
    #[error("Volume full")]
    Full,

    /// The volume does not accept writes.
    #[error("Volume is read-only")]
    ReadOnly,

    /// The operation is disabled by configuration or volume mode.
    #[error("Method disabled: {reason}")]
    MethodDisabled {
        /// Why the method is unavailable.
        reason: String,
    },

    /// Stored or requested data exceeds the buffer capacity.
    #[error("Block too large: {size} bytes exceeds capacity of {capacity} bytes")]
    TooLarge {
        /// Size of the data.
        size: u64,
        /// Capacity available.
        capacity: u64,
    },

    /// The write could not satisfy the requested storage classes.
    #[error("Insufficient replicas: stored {replicas}, missing classes {missing:?}")]
    InsufficientReplicas {
        /// Replicas written before giving up.
        replicas: u32,
        /// Requested classes that received no replica.
        missing: Vec<String>,
    },

    /// The calling context was cancelled mid-operation.
    #[error("Operation cancelled")]
    Cancelled,

    /// A volume call or remote fetch exceeded its deadline.
    #[error("Operation timed out: {operation}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
    },

    /// Replication accounting was asked to double-count or un-count a mount.
    #[error("Replication accounting bug: {op} on mount {mount}")]
    AccountingBug {
        /// "add" or "sub".
        op: &'static str,
        /// Mount the call referred to.
        mount: String,
    },

    /// No volume driver is registered under this name.
    #[error("Unknown volume driver: {driver}")]
    UnknownDriver {
        /// The configured driver name.
        driver: String,
    },

    /// No mount carries this UUID.
    #[error("Unknown mount: {uuid}")]
    UnknownMount {
        /// The requested mount UUID.
        uuid: String,
    },

    /// Configuration could not be loaded or is inconsistent.
    #[error("Configuration error: {reason}")]
    Config {
        /// Description of the problem.
        reason: String,
    },

    /// The work queue has been closed.
    #[error("Work queue closed")]
    QueueClosed,

    /// Fetching a block from a remote server failed.
    #[error("Fetch from {server} failed: {reason}")]
    Fetch {
        /// The remote server address.
        server: String,
        /// Description of the failure.
        reason: String,
    },
}

impl KeepError {
    /// Shorthand for a [`KeepError::NotFound`] on `hash`.
    pub fn not_found(hash: impl Into<String>) -> Self {
        Self::NotFound { hash: hash.into() }
    }

    /// True for errors a caller treats as "block absent" rather than failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True for errors meaning the volume cannot take the write.
    pub fn is_full(&self) -> bool {
        matches!(self, Self::Full)
    }

    /// HTTP status code the front end reports for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound { .. } | Self::UnknownMount { .. } => 404,
            Self::InvalidLocator { .. } => 400,
            Self::Forbidden => 403,
            Self::Expired | Self::NoToken => 401,
            Self::MethodDisabled { .. } => 405,
            Self::TooLarge { .. } => 413,
            Self::HashMismatch { .. } => 422,
            Self::Cancelled => 499,
            Self::Corrupt { .. } | Self::Fetch { .. } => 502,
            Self::Full => 507,
            Self::Timeout { .. } => 504,
            Self::ReadOnly | Self::InsufficientReplicas { .. } | Self::QueueClosed => 503,
            Self::Io(_)
            | Self::Collision { .. }
            | Self::AccountingBug { .. }
            | Self::UnknownDriver { .. }
            | Self::Config { .. } => 500,
        }
    }
}
