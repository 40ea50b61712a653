//! Error types for multipost

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MultipostError>;

#[derive(Error, Debug)]
pub enum MultipostError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl MultipostError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            MultipostError::InvalidInput(_) | MultipostError::Forbidden(_) => 3,
            MultipostError::Credential(_) => 2,
            MultipostError::Platform(PlatformError::InvalidToken(_)) => 2,
            MultipostError::Platform(_) => 1,
            MultipostError::Config(_) => 1,
            MultipostError::Database(_) => 1,
            MultipostError::Queue(_) => 1,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Remote-provider failures, classified by the adapter that observed them.
///
/// The retryable/terminal split drives the target state machine: workers
/// never inspect raw provider responses, only this classification.
#[derive(Error, Debug, Clone)]
pub enum PlatformError {
    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Provider error: {0}")]
    Remote(String),

    #[error("Invalid or revoked token: {0}")]
    InvalidToken(String),

    #[error("Content rejected: {0}")]
    Rejected(String),
}

impl PlatformError {
    /// Whether a publish attempt that failed with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PlatformError::RateLimit(_)
                | PlatformError::Network(_)
                | PlatformError::Timeout(_)
                | PlatformError::Remote(_)
        )
    }
}

/// Credential store failures.
///
/// `NotFound` and `Expired` are deliberately distinct kinds: a missing
/// credential is a linking problem, an expired one is a refresh problem,
/// and callers must not conflate them.
#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Credential not found: {0}")]
    NotFound(String),

    #[error("Credential expired: {0}")]
    Expired(String),

    #[error("Credential revoked or invalid: {0}")]
    RevokedOrInvalid(String),

    #[error("Encryption master key is not configured (set encryption.master_key or MULTIPOST_MASTER_KEY)")]
    MasterKeyMissing,

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Concurrent credential update: {0}")]
    CasConflict(String),
}
