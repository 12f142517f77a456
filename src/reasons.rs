//! Stable condition reason identifiers.
//!
//! Reasons are the vocabulary the agent exposes to the control plane. They
//! are declared here as metadata (identifier plus default severity) so that
//! monitors build conditions declaratively and the set of reasons in use is
//! auditable in one place.

use crate::monitor::{Condition, Severity};

/// Metadata for one stable reason identifier.
#[derive(Debug, Clone, Copy)]
pub struct ReasonMeta {
    reason: &'static str,
    default_severity: Severity,
}

impl ReasonMeta {
    pub const fn new(reason: &'static str, default_severity: Severity) -> Self {
        ReasonMeta {
            reason,
            default_severity,
        }
    }

    pub fn reason(&self) -> &'static str {
        self.reason
    }

    /// Starts building a condition with this reason and its default severity.
    pub fn builder(&self) -> ConditionBuilder {
        ConditionBuilder {
            condition: Condition {
                reason: self.reason.to_string(),
                message: String::new(),
                severity: self.default_severity,
                min_occurrences: 0,
            },
        }
    }
}

/// Fluent builder for a [`Condition`].
#[derive(Debug, Clone)]
pub struct ConditionBuilder {
    condition: Condition,
}

impl ConditionBuilder {
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.condition.message = message.into();
        self
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.condition.severity = severity;
        self
    }

    pub fn min_occurrences(mut self, min_occurrences: i64) -> Self {
        self.condition.min_occurrences = min_occurrences;
        self
    }

    pub fn build(self) -> Condition {
        self.condition
    }
}

// Reasons for the KernelReady condition.

pub const KERNEL_BUG: ReasonMeta = ReasonMeta::new("KernelBug", Severity::Warning);
pub const SOFT_LOCKUP: ReasonMeta = ReasonMeta::new("SoftLockup", Severity::Warning);
pub const APP_CRASH: ReasonMeta = ReasonMeta::new("AppCrash", Severity::Warning);
pub const APP_BLOCKED: ReasonMeta = ReasonMeta::new("AppBlocked", Severity::Warning);
pub const FORK_FAILED_OUT_OF_PIDS: ReasonMeta =
    ReasonMeta::new("ForkFailedOutOfPIDs", Severity::Fatal);
pub const APPROACHING_MAX_OPEN_FILES: ReasonMeta =
    ReasonMeta::new("ApproachingMaxOpenFiles", Severity::Warning);

// Reasons for the NetworkingReady condition.

pub const CONNTRACK_EXCEEDED_KERNEL: ReasonMeta =
    ReasonMeta::new("ConntrackExceededKernel", Severity::Warning);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let condition = KERNEL_BUG.builder().message("a bug").build();
        assert_eq!(condition.reason, "KernelBug");
        assert_eq!(condition.message, "a bug");
        assert_eq!(condition.severity, Severity::Warning);
        assert_eq!(condition.min_occurrences, 0);
    }

    #[test]
    fn test_builder_overrides() {
        let condition = APP_CRASH
            .builder()
            .message("crash")
            .severity(Severity::Info)
            .min_occurrences(3)
            .build();
        assert_eq!(condition.severity, Severity::Info);
        assert_eq!(condition.min_occurrences, 3);
    }
}
