//! Error types for the mail digest pipeline.

use std::time::Duration;

/// Configuration-related errors. All of these are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Unknown profile '{name}' (available: {available})")]
    UnknownProfile { name: String, available: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Mail transport errors.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Mail request failed: {0}")]
    RequestFailed(String),

    #[error("Mail authentication failed: {0}")]
    AuthFailed(String),

    #[error("Mail provider rate limited")]
    RateLimited,

    #[error("Invalid mail payload: {0}")]
    InvalidPayload(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },
}

/// Content extraction errors.
///
/// These never abort a message: callers downgrade them to a dropped image
/// or an attachment without text.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("Image rejected: {0}")]
    ImageRejected(String),

    #[error("PDF error: {0}")]
    Pdf(String),
}

/// Document rendering errors.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("Failed to write digest document {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Run-level errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Digest send failed: {0}")]
    Send(String),

    #[error("Mail error: {0}")]
    Mail(#[from] MailError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Render error: {0}")]
    Render(#[from] RenderError),
}
