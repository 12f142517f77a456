//! Resource observers.
//!
//! An observer tails exactly one physical resource (a file, the kernel ring
//! buffer, a journal stream) and broadcasts each new line of text to any
//! number of subscribers. Observers are stateless about meaning; detection
//! logic lives in the monitors that subscribe to them.

pub mod file;
pub mod journal;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use log::debug;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::error::{ObserverError, SubscribeError};
use crate::monitor::resource;

/// Per-subscriber queue capacity. A subscriber that falls this far behind
/// starts dropping lines; other subscribers are unaffected.
const SUBSCRIBER_QUEUE_SIZE: usize = 1000;

/// Watches a resource and broadcasts events to subscribers.
#[async_trait]
pub trait Observer: Send + Sync {
    /// Returns a queue that receives every line this observer broadcasts
    /// from now on.
    fn subscribe(&self) -> mpsc::Receiver<String>;

    /// Unique identifier for this observer, derived from the resource it
    /// watches.
    fn identifier(&self) -> String;

    /// Runs the watch loop until the token is cancelled. This is the
    /// observer's only entry point to begin watching.
    async fn run(&self, shutdown: CancellationToken) -> Result<(), ObserverError>;
}

/// Common fan-out machinery for observers.
///
/// Delivery is best-effort and non-blocking: a full subscriber queue drops
/// the message for that subscriber only, so one slow consumer never blocks
/// the watch loop or starves other subscribers.
#[derive(Default)]
pub struct Broadcaster {
    subscribers: Mutex<Vec<mpsc::Sender<String>>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Broadcaster::default()
    }

    pub fn subscribe(&self) -> mpsc::Receiver<String> {
        self.subscribe_with_capacity(SUBSCRIBER_QUEUE_SIZE)
    }

    pub(crate) fn subscribe_with_capacity(&self, capacity: usize) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(capacity);
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Sends a message to all current subscribers. Subscribers whose receive
    /// half has been dropped are pruned.
    pub fn broadcast(&self, source: &str, message: &str) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| match tx.try_send(message.to_string()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("{}: subscriber queue full, dropping message", source);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

/// Constructor for an observer, given the resource parts of a subscription.
pub type ObserverConstructor =
    Box<dyn Fn(&[String]) -> Result<Arc<dyn Observer>, ObserverError> + Send + Sync>;

/// Table from resource type to observer constructor.
///
/// The registry is assembled explicitly by the process entrypoint before any
/// manager starts; registering the same resource type twice is a wiring
/// defect and panics.
#[derive(Default)]
pub struct ObserverRegistry {
    constructors: HashMap<String, ObserverConstructor>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        ObserverRegistry::default()
    }

    /// Returns a registry with constructors for the built-in resource types:
    /// `file` (one part: path), `journal` (one part: syslog identifier) and
    /// `dmesg` (no parts, a file observer over the kernel message device).
    pub fn builtin(host_root: &Path) -> Self {
        let mut registry = ObserverRegistry::new();
        registry.register(resource::FILE, |parts| {
            let [path] = parts else {
                return Err(ObserverError::InvalidParts {
                    expected: 1,
                    actual: parts.len(),
                });
            };
            Ok(Arc::new(file::FileObserver::new(path)))
        });
        let kmsg_path = host_root.join("dev/kmsg");
        registry.register(resource::DMESG, move |parts| {
            if !parts.is_empty() {
                return Err(ObserverError::InvalidParts {
                    expected: 0,
                    actual: parts.len(),
                });
            }
            // A file observer over the live kernel message device; dmesg has
            // no semantics of its own.
            Ok(Arc::new(file::FileObserver::new(&kmsg_path)))
        });
        registry.register(resource::JOURNAL, |parts| {
            let [identifier] = parts else {
                return Err(ObserverError::InvalidParts {
                    expected: 1,
                    actual: parts.len(),
                });
            };
            Ok(Arc::new(journal::JournalObserver::new(identifier)))
        });
        registry
    }

    /// Registers a constructor for a resource type.
    ///
    /// # Panics
    ///
    /// Panics if a constructor is already registered for the type.
    pub fn register<F>(&mut self, resource_type: &str, constructor: F)
    where
        F: Fn(&[String]) -> Result<Arc<dyn Observer>, ObserverError> + Send + Sync + 'static,
    {
        if self
            .constructors
            .insert(resource_type.to_string(), Box::new(constructor))
            .is_some()
        {
            panic!(
                "observer constructor already registered for resource type: {}",
                resource_type
            );
        }
    }

    /// Constructs an observer for the given resource.
    pub fn build(
        &self,
        resource_type: &str,
        parts: &[String],
    ) -> Result<Arc<dyn Observer>, SubscribeError> {
        let constructor = self
            .constructors
            .get(resource_type)
            .ok_or_else(|| SubscribeError::UnknownResourceType(resource_type.to_string()))?;
        Ok(constructor(parts)?)
    }
}

/// Derives the identity string for a resource subscription. Two subscriptions
/// with the same identity share one observer.
pub fn resource_id(resource_type: &str, parts: &[String]) -> String {
    let mut id = resource_type.to_string();
    for part in parts {
        id.push('-');
        id.push_str(part);
    }
    id
}
