use async_trait::async_trait;

use crate::error::ExportError;
use crate::monitor::{Condition, ConditionType};

/// Propagates conditions from monitors to an external system.
///
/// The manager dispatches to exactly one of these operations based on the
/// condition's severity.
#[async_trait]
pub trait Exporter: Send + Sync {
    /// Exports an informational condition.
    async fn info(
        &self,
        condition: &Condition,
        condition_type: &ConditionType,
    ) -> Result<(), ExportError>;

    /// Exports a warning condition.
    async fn warning(
        &self,
        condition: &Condition,
        condition_type: &ConditionType,
    ) -> Result<(), ExportError>;

    /// Exports a fatal condition.
    async fn fatal(
        &self,
        condition: &Condition,
        condition_type: &ConditionType,
    ) -> Result<(), ExportError>;
}
