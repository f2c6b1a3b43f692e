//! Error types for Autopost

use std::time::Duration;

use thiserror::Error;

use crate::types::{LifecycleState, Platform};

pub type Result<T> = std::result::Result<T, AutopostError>;

#[derive(Error, Debug)]
pub enum AutopostError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Credential for {platform} is invalid for user '{user}'; re-link the account")]
    CredentialInvalid { user: String, platform: Platform },

    #[error("No {platform} account linked for user '{user}'")]
    CredentialMissing { user: String, platform: Platform },

    #[error("Post {post_id} cannot {action} while {state}")]
    InvalidTransition {
        post_id: String,
        state: LifecycleState,
        action: &'static str,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Media error: {0}")]
    Media(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl AutopostError {
    /// Returns the appropriate exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            AutopostError::InvalidInput(_) | AutopostError::InvalidTransition { .. } => 3,
            AutopostError::CredentialInvalid { .. }
            | AutopostError::CredentialMissing { .. }
            | AutopostError::Platform(PlatformError::AuthExpired(_))
            | AutopostError::Platform(PlatformError::RefreshDenied(_)) => 2,
            AutopostError::NotFound(_) => 4,
            AutopostError::Platform(_)
            | AutopostError::Config(_)
            | AutopostError::Database(_)
            | AutopostError::Media(_) => 1,
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

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database operation failed: {0}")]
    SqlxError(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Corrupt row in {table}: {reason}")]
    Corrupt { table: &'static str, reason: String },
}

/// Errors surfaced by platform adapters.
///
/// These never leave the dispatcher unclassified; see
/// [`crate::retry::FailureClass`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlatformError {
    #[error("Authentication expired: {0}")]
    AuthExpired(String),

    #[error("Rate limited (retry after {}s): {message}", retry_after.as_secs())]
    RateLimited {
        retry_after: Duration,
        message: String,
    },

    #[error("Invalid media: {0}")]
    InvalidMedia(String),

    #[error("Platform unavailable: {0}")]
    Unavailable(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Credential refresh denied: {0}")]
    RefreshDenied(String),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Unexpected platform response: {0}")]
    Protocol(String),
}
