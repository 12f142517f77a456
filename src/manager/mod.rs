//! Monitor manager.
//!
//! The manager binds monitors to the observation layer, receives their
//! conditions over a bounded notification queue, applies per-reason
//! debouncing, and routes each surviving condition to an exporter keyed by
//! severity. The run loop is the single consumer of the queue, which keeps
//! the debounce table free of locks.

mod exporter;
pub mod node_exporter;

pub use exporter::Exporter;
pub use node_exporter::{NodeConditionConfig, NodeExporter, HEARTBEAT_INTERVAL, REPORT_INTERVAL};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::{error, info};
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{ExportError, NotifyError, SubscribeError};
use crate::monitor::{Condition, ConditionType, ManagerHandle, Monitor, Severity};
use crate::observer::{resource_id, Observer, ObserverRegistry};

/// Capacity of the internal notification queue. When full, `notify` applies
/// backpressure to the calling monitor task instead of dropping conditions.
const NOTIFY_QUEUE_SIZE: usize = 100;

/// Cadence at which every registered monitor's condition snapshot is polled.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

struct Notification {
    monitor_name: String,
    condition: Condition,
}

/// State shared between the manager and the handles given to monitors.
struct ManagerShared {
    registry: ObserverRegistry,
    observers: Mutex<HashMap<String, Arc<dyn Observer>>>,
}

impl ManagerShared {
    /// Looks up or lazily constructs the observer for the resource identity
    /// and returns a fresh subscription to it.
    fn subscribe(
        &self,
        resource_type: &str,
        parts: &[String],
    ) -> Result<mpsc::Receiver<String>, SubscribeError> {
        let id = resource_id(resource_type, parts);
        let mut observers = self.observers.lock().unwrap();
        if let Some(observer) = observers.get(&id) {
            return Ok(observer.subscribe());
        }
        let observer = self.registry.build(resource_type, parts)?;
        let subscription = observer.subscribe();
        observers.insert(id, observer);
        Ok(subscription)
    }
}

/// The manager-scoped facade handed to one monitor at registration time.
struct MonitorManagerHandle {
    monitor_name: String,
    shared: Arc<ManagerShared>,
    notify_tx: mpsc::Sender<Notification>,
    shutdown: CancellationToken,
}

#[async_trait]
impl ManagerHandle for MonitorManagerHandle {
    fn subscribe(
        &self,
        resource_type: &str,
        parts: &[String],
    ) -> Result<mpsc::Receiver<String>, SubscribeError> {
        self.shared.subscribe(resource_type, parts)
    }

    async fn notify(&self, condition: Condition) -> Result<(), NotifyError> {
        let notification = Notification {
            monitor_name: self.monitor_name.clone(),
            condition,
        };
        tokio::select! {
            result = self.notify_tx.send(notification) => {
                result.map_err(|_| NotifyError::Closed)
            }
            _ = self.shutdown.cancelled() => Err(NotifyError::Cancelled),
        }
    }
}

/// Manages the lifecycle of monitors and routes their conditions.
pub struct MonitorManager {
    monitors: Vec<Box<dyn Monitor>>,
    condition_types: HashMap<String, ConditionType>,
    occurrences: HashMap<String, i64>,
    shared: Arc<ManagerShared>,
    notify_tx: mpsc::Sender<Notification>,
    notify_rx: mpsc::Receiver<Notification>,
    exporter: Arc<dyn Exporter>,
    poll_interval: Duration,
}

impl MonitorManager {
    pub fn new(registry: ObserverRegistry, exporter: Arc<dyn Exporter>) -> Self {
        let (notify_tx, notify_rx) = mpsc::channel(NOTIFY_QUEUE_SIZE);
        MonitorManager {
            monitors: Vec::new(),
            condition_types: HashMap::new(),
            occurrences: HashMap::new(),
            shared: Arc::new(ManagerShared {
                registry,
                observers: Mutex::new(HashMap::new()),
            }),
            notify_tx,
            notify_rx,
            exporter,
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Registers a monitor and the health-flag key its fatal conditions map
    /// to, then calls the monitor's registration entrypoint with a
    /// manager-scoped handle. A subscription failure inside the monitor is a
    /// hard registration failure.
    pub async fn register(
        &mut self,
        monitor: Box<dyn Monitor>,
        condition_type: ConditionType,
        shutdown: &CancellationToken,
    ) -> anyhow::Result<()> {
        let name = monitor.name().to_string();
        self.condition_types.insert(name.clone(), condition_type);
        let handle = Arc::new(MonitorManagerHandle {
            monitor_name: name,
            shared: Arc::clone(&self.shared),
            notify_tx: self.notify_tx.clone(),
            shutdown: shutdown.clone(),
        });
        monitor.register(shutdown.clone(), handle).await?;
        self.monitors.push(monitor);
        Ok(())
    }

    /// Starts every cached observer's watch loop, then runs the manager's
    /// run loop until the token is cancelled.
    pub async fn start(mut self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let observers: Vec<Arc<dyn Observer>> = {
            let observers = self.shared.observers.lock().unwrap();
            observers.values().map(Arc::clone).collect()
        };
        for observer in observers {
            let id = observer.identifier();
            info!("starting observer {}", id);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(err) = observer.run(shutdown).await {
                    error!("observer {} failed: {}", id, err);
                }
            });
        }
        self.run_loop(shutdown).await
    }

    async fn run_loop(&mut self, shutdown: CancellationToken) -> anyhow::Result<()> {
        enum LoopEvent {
            Poll,
            Notified(Option<Notification>),
        }

        let mut poll = interval_at(
            Instant::now() + self.poll_interval,
            self.poll_interval,
        );
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = poll.tick() => LoopEvent::Poll,
                notification = self.notify_rx.recv() => LoopEvent::Notified(notification),
            };
            match event {
                LoopEvent::Poll => {
                    let snapshots: Vec<(String, Vec<Condition>)> = self
                        .monitors
                        .iter()
                        .map(|monitor| (monitor.name().to_string(), monitor.conditions()))
                        .collect();
                    for (name, conditions) in snapshots {
                        for condition in conditions {
                            if let Err(err) = self.route_condition(&name, condition).await {
                                error!("failed to export condition from {}: {}", name, err);
                            }
                        }
                    }
                }
                LoopEvent::Notified(Some(notification)) => {
                    let name = notification.monitor_name;
                    if let Err(err) = self.route_condition(&name, notification.condition).await {
                        error!("failed to export condition from {}: {}", name, err);
                    }
                }
                LoopEvent::Notified(None) => return Ok(()),
            }
        }
    }

    /// Debounce-then-dispatch for one condition.
    async fn route_condition(
        &mut self,
        monitor_name: &str,
        condition: Condition,
    ) -> Result<(), ExportError> {
        counter!(
            "problem_condition_count",
            "severity" => condition.severity.as_str(),
            "reason" => condition.reason.clone(),
        )
        .increment(1);

        let condition_type = self
            .condition_types
            .get(monitor_name)
            .ok_or_else(|| ExportError::MissingConditionType(monitor_name.to_string()))?
            .clone();

        if !meets_occurrence_threshold(&mut self.occurrences, &condition) {
            info!(
                "condition {} has not met min occurrences ({} required)",
                condition.reason, condition.min_occurrences
            );
            return Ok(());
        }

        self.send_condition(&condition, &condition_type).await
    }

    /// Dispatches a condition to the exporter operation matching its
    /// severity.
    async fn send_condition(
        &self,
        condition: &Condition,
        condition_type: &ConditionType,
    ) -> Result<(), ExportError> {
        info!(
            "sending condition to exporter: {} ({}, {})",
            condition.reason, condition.severity, condition_type
        );
        match condition.severity {
            Severity::Info => self.exporter.info(condition, condition_type).await,
            Severity::Warning => self.exporter.warning(condition, condition_type).await,
            Severity::Fatal => {
                for registered in self.condition_types.values() {
                    if registered == condition_type {
                        gauge!(
                            "fatal_condition_gauge",
                            "type" => registered.as_str().to_string(),
                        )
                        .set(1.0);
                    }
                }
                self.exporter.fatal(condition, condition_type).await
            }
        }
    }
}

/// Per-reason debounce counter. Returns false while a condition has not yet
/// met its minimum occurrences; the counter resets to zero whenever a
/// condition is let through, so one in every `min_occurrences + 1`
/// consecutive same-reason emissions is exported.
fn meets_occurrence_threshold(
    occurrences: &mut HashMap<String, i64>,
    condition: &Condition,
) -> bool {
    let count = occurrences.entry(condition.reason.clone()).or_insert(0);
    if *count < condition.min_occurrences {
        *count += 1;
        return false;
    }
    *count = 0;
    true
}
