//! Node condition exporter.
//!
//! Maintains a small set of long-lived node health flags and reconciles them
//! against the control plane's view of the node. Fatal conditions mutate the
//! local managed-condition map synchronously; a background loop periodically
//! applies the map to the remote node with an upsert strategy that never
//! disturbs condition entries owned by other writers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use log::{error, info};
use tokio::sync::Mutex;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::client::{Event, NodeClient, NodeCondition, CONDITION_FALSE, CONDITION_TRUE};
use crate::client::{EVENT_TYPE_NORMAL, EVENT_TYPE_WARNING};
use crate::error::{ClientError, ExportError};
use crate::manager::Exporter;
use crate::monitor::{Condition, ConditionType};

/// Interval at which local state is applied to the node. Changes to multiple
/// managed conditions within one interval collapse into a single API call.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(15);

/// Interval at which managed condition heartbeat times are refreshed.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(300);

/// Healthy-state configuration for one managed condition type.
#[derive(Debug, Clone)]
pub struct NodeConditionConfig {
    pub ready_reason: String,
    pub ready_message: String,
}

struct ManagedState {
    conditions: BTreeMap<ConditionType, NodeCondition>,
    dirty: bool,
}

pub struct NodeExporter {
    client: Arc<dyn NodeClient>,
    node_name: String,
    state: Mutex<ManagedState>,
}

impl NodeExporter {
    /// Creates an exporter managing the given condition types. Every managed
    /// type starts out healthy; the state is born dirty so the defaults are
    /// published on the first report tick.
    pub fn new(
        node_name: impl Into<String>,
        client: Arc<dyn NodeClient>,
        managed: BTreeMap<ConditionType, NodeConditionConfig>,
    ) -> Self {
        let now = Utc::now();
        let conditions = managed
            .into_iter()
            .map(|(condition_type, config)| {
                let condition = NodeCondition {
                    condition_type: condition_type.to_string(),
                    status: CONDITION_TRUE.to_string(),
                    reason: config.ready_reason,
                    message: config.ready_message,
                    last_heartbeat_time: now,
                    last_transition_time: now,
                };
                (condition_type, condition)
            })
            .collect();
        NodeExporter {
            client,
            node_name: node_name.into(),
            state: Mutex::new(ManagedState {
                conditions,
                dirty: true,
            }),
        }
    }

    /// Runs the heartbeat and report loops until the token is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("starting node exporter");
        let mut heartbeat = interval_at(
            Instant::now() + HEARTBEAT_INTERVAL,
            HEARTBEAT_INTERVAL,
        );
        let mut report = interval_at(Instant::now() + REPORT_INTERVAL, REPORT_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = heartbeat.tick() => self.update_heartbeat_times().await,
                _ = report.tick() => {
                    // The report itself must not outlive the governing
                    // lifetime either; a slow control plane call is abandoned
                    // on cancellation.
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        result = self.report_managed_conditions() => {
                            if let Err(err) = result {
                                error!("failed to report managed conditions: {}", err);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Stamps every managed condition's heartbeat time and marks the state
    /// dirty, so all conditions are republished on the next report tick.
    async fn update_heartbeat_times(&self) {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        for condition in state.conditions.values_mut() {
            condition.last_heartbeat_time = now;
        }
        state.dirty = true;
    }

    /// Applies the managed conditions to the remote node with an upsert
    /// strategy. A no-op while the state is clean. A managed condition that
    /// already exists remotely is replaced in place; a missing one is
    /// appended; entries owned by other writers are never touched. The dirty
    /// flag is cleared only after a successful patch, so failures are
    /// retried on the next tick.
    async fn report_managed_conditions(&self) -> Result<(), ClientError> {
        let mut state = self.state.lock().await;
        if !state.dirty {
            return Ok(());
        }
        info!("reporting managed conditions");
        let node = self.client.get_node(&self.node_name).await?;
        let mut conditions = node.status.conditions;
        for managed in state.conditions.values() {
            let value = serde_json::to_value(managed)?;
            match conditions
                .iter_mut()
                .find(|entry| entry["type"] == managed.condition_type.as_str())
            {
                Some(entry) => *entry = value,
                None => conditions.push(value),
            }
        }
        self.client
            .patch_node_conditions(&self.node_name, &conditions)
            .await?;
        state.dirty = false;
        info!("reported node conditions");
        Ok(())
    }

    async fn record_event(
        &self,
        event_type: &str,
        condition: &Condition,
        condition_type: &ConditionType,
    ) -> Result<(), ExportError> {
        let event = Event {
            node_name: self.node_name.clone(),
            event_type: event_type.to_string(),
            reason: condition_type.to_string(),
            message: format!("{}: {}", condition.reason, condition.message),
        };
        self.client.record_event(&event).await?;
        Ok(())
    }
}

#[async_trait]
impl Exporter for NodeExporter {
    /// Records a one-shot event for the condition. No batching, no state.
    async fn info(
        &self,
        condition: &Condition,
        condition_type: &ConditionType,
    ) -> Result<(), ExportError> {
        self.record_event(EVENT_TYPE_NORMAL, condition, condition_type)
            .await
    }

    /// Records a one-shot event for the condition. No batching, no state.
    async fn warning(
        &self,
        condition: &Condition,
        condition_type: &ConditionType,
    ) -> Result<(), ExportError> {
        self.record_event(EVENT_TYPE_WARNING, condition, condition_type)
            .await
    }

    /// Updates the local state for the managed condition type. The condition
    /// is applied to the node asynchronously by the report loop. The
    /// transition timestamp moves only when the (reason, message) pair
    /// actually changed, so a repeating identical failure keeps its original
    /// "since when" clock.
    async fn fatal(
        &self,
        condition: &Condition,
        condition_type: &ConditionType,
    ) -> Result<(), ExportError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut new_condition = NodeCondition {
            condition_type: condition_type.to_string(),
            status: CONDITION_FALSE.to_string(),
            reason: condition.reason.clone(),
            message: condition.message.clone(),
            last_heartbeat_time: now,
            last_transition_time: now,
        };
        if let Some(old_condition) = state.conditions.get(condition_type) {
            if old_condition.reason == new_condition.reason
                && old_condition.message == new_condition.message
            {
                new_condition.last_transition_time = old_condition.last_transition_time;
            }
        }
        state.conditions.insert(condition_type.clone(), new_condition);
        state.dirty = true;
        Ok(())
    }
}
