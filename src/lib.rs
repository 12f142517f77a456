/// Error types for the node health agent
pub mod error;

/// Monitor-facing API: conditions, severities, the monitor contract
pub mod monitor;

/// Resource observers: file, kernel ring buffer and journal tailers
pub mod observer;

/// Monitor manager, severity routing and the node condition exporter
pub mod manager;

/// Control plane API client
pub mod client;

/// Standard node condition types managed by the agent
pub mod conditions;

/// Stable condition reason identifiers and the condition builder
pub mod reasons;

/// Built-in monitors
pub mod monitors;

/// Plugin list assembly and validation
pub mod plugins;

/// Configuration management
pub mod config;

/// Shared concurrency helpers
pub mod util;

// Re-export commonly used types
pub use error::{ClientError, ConfigError, ExportError, NotifyError, ObserverError, SubscribeError};
pub use monitor::{Condition, ConditionType, ManagerHandle, Monitor, Severity};
