use thiserror::Error;

/// Errors that can occur inside a resource observer's watch loop
#[derive(Error, Debug)]
pub enum ObserverError {
    #[error("expected {expected} resource part(s), but got {actual}")]
    InvalidParts { expected: usize, actual: usize },

    #[error("failed to spawn subprocess: {0}")]
    SubprocessSpawn(String),

    #[error("filesystem watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned to a monitor when subscribing to a resource
#[derive(Error, Debug)]
pub enum SubscribeError {
    #[error("no observer registered for resource type {0:?}")]
    UnknownResourceType(String),

    #[error("failed to construct observer: {0}")]
    Observer(#[from] ObserverError),
}

/// Errors returned to a monitor from a condition notification
#[derive(Error, Debug, PartialEq, Eq)]
pub enum NotifyError {
    #[error("notification cancelled before the queue had capacity")]
    Cancelled,

    #[error("the manager's notification queue is closed")]
    Closed,
}

/// Errors that can occur while routing a condition to an exporter
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("missing condition type mapping for monitor: {0}")]
    MissingConditionType(String),

    #[error("control plane client error: {0}")]
    Client(#[from] ClientError),
}

/// Errors from the control plane API client
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API request failed with status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration value: {0}")]
    ValidationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),
}
