//! Error types for CleanMail.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors from the remote mailbox service.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("{operation} request failed: {reason}")]
    Request { operation: String, reason: String },

    #[error("{operation} returned HTTP {status}: {body}")]
    Status {
        operation: String,
        status: u16,
        body: String,
    },

    #[error("{operation} rate limited, gave up after {attempts} attempts (last wait {waited:?})")]
    RateLimited {
        operation: String,
        attempts: usize,
        waited: Duration,
    },

    #[error("Failed to decode {operation} response: {reason}")]
    Decode { operation: String, reason: String },

    #[error("Invalid folder path: {0:?}")]
    InvalidPath(String),
}

/// Credential errors. The engine never retries these.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("No access token available")]
    MissingToken,

    #[error("Access token rejected: {0}")]
    Rejected(String),
}

/// Structural engine failures, caught once at the orchestrator boundary.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Not authenticated: {0}")]
    Auth(#[from] AuthError),

    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Rule {0} not found")]
    RuleNotFound(Uuid),

    #[error("Rule '{name}' is inactive")]
    RuleInactive { name: String },

    #[error("Could not resolve folder '{path}': {source}")]
    FolderResolution {
        path: String,
        #[source]
        source: MailboxError,
    },

    #[error("No active rules")]
    NoActiveRules,
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
