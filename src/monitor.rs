//! Monitor-facing API types.
//!
//! A monitor is a unit of detection logic that subscribes to node resources
//! and/or runs on its own timers, and reports its findings as [`Condition`]s
//! through the manager handle it is given at registration time.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{NotifyError, SubscribeError};

/// Resource types available at the observation boundary.
pub mod resource {
    /// The kernel ring buffer. Takes no parts.
    pub const DMESG: &str = "dmesg";
    /// An arbitrary file on the host. Takes one part: the absolute path.
    pub const FILE: &str = "file";
    /// The system journal. Takes one part: the syslog identifier.
    pub const JOURNAL: &str = "journal";
}

/// A gauge for how severe an issue is, and an indicator for which backend the
/// issue is routed to. Fatal severity indicates the node has a persistent
/// issue, only repairable through an external action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Info,
    Warning,
    Fatal,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "Info",
            Severity::Warning => "Warning",
            Severity::Fatal => "Fatal",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single detected health fact provided by a monitor.
///
/// This data may be delivered to different backends, so the fields are kept
/// generic. A condition is immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    /// Short, PascalCase identifier for the issue that stays stable across
    /// occurrences.
    pub reason: String,
    /// Longer human-readable description with details.
    pub message: String,
    /// Routing severity.
    pub severity: Severity,
    /// Minimal number of same-reason occurrences before the condition is
    /// exported. Defaults to 0 (export immediately).
    pub min_occurrences: i64,
}

/// The type key of a long-lived node health flag (e.g. `KernelReady`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConditionType(String);

impl ConditionType {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConditionType {
    fn from(s: &str) -> Self {
        ConditionType(s.to_string())
    }
}

impl From<String> for ConditionType {
    fn from(s: String) -> Self {
        ConditionType(s)
    }
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The manager facade handed to a monitor at registration time. It exposes
/// exactly the two operations a producer needs.
#[async_trait]
pub trait ManagerHandle: Send + Sync {
    /// Returns a receive queue for the stream of lines coming from the
    /// specified resource. Many subscriptions to the same resource identity
    /// share one underlying observer.
    fn subscribe(
        &self,
        resource_type: &str,
        parts: &[String],
    ) -> Result<mpsc::Receiver<String>, SubscribeError>;

    /// Emits a condition to the manager. Blocks until the notification queue
    /// has capacity or the monitor's registration lifetime is cancelled.
    async fn notify(&self, condition: Condition) -> Result<(), NotifyError>;
}

/// The contract an external producer implements to plug into the pipeline.
#[async_trait]
pub trait Monitor: Send + Sync {
    /// Human readable identifier for the monitor.
    fn name(&self) -> &str;

    /// A synchronous snapshot of the conditions the monitor currently holds,
    /// polled by the manager at a fixed cadence. Monitors that only emit
    /// one-shot events return an empty list.
    fn conditions(&self) -> Vec<Condition>;

    /// Entrypoint for the monitor to set up its subscriptions and background
    /// tasks. All communication back to the pipeline goes through `handle`.
    async fn register(
        &self,
        shutdown: CancellationToken,
        handle: Arc<dyn ManagerHandle>,
    ) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_display() {
        assert_eq!(Severity::Info.to_string(), "Info");
        assert_eq!(Severity::Warning.to_string(), "Warning");
        assert_eq!(Severity::Fatal.to_string(), "Fatal");
    }

    #[test]
    fn test_condition_type_from_str() {
        let t = ConditionType::from("KernelReady");
        assert_eq!(t.as_str(), "KernelReady");
        assert_eq!(t.to_string(), "KernelReady");
    }
}
