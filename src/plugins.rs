//! Monitor plugin assembly.
//!
//! Plugins are declared as an explicit list built by the entrypoint and
//! validated before the manager starts. Each plugin pairs a monitor
//! constructor with the node condition type its fatal findings map to.

use crate::config::{Config, RuntimeContext};
use crate::conditions;
use crate::error::ConfigError;
use crate::monitor::{ConditionType, Monitor};
use crate::monitors::kernel::KernelMonitor;

/// Builds a plugin's monitor from the configuration and the discovered
/// runtime context, so hardware- or distro-specific plugins can adapt their
/// behavior to the host.
pub type MonitorConstructor =
    Box<dyn Fn(&Config, &RuntimeContext) -> Box<dyn Monitor> + Send + Sync>;

pub struct MonitorPlugin {
    name: &'static str,
    condition_type: ConditionType,
    constructor: MonitorConstructor,
}

impl MonitorPlugin {
    pub fn new(
        name: &'static str,
        condition_type: ConditionType,
        constructor: MonitorConstructor,
    ) -> Self {
        MonitorPlugin {
            name,
            condition_type,
            constructor,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn condition_type(&self) -> &ConditionType {
        &self.condition_type
    }

    pub fn build(&self, config: &Config, context: &RuntimeContext) -> Box<dyn Monitor> {
        (self.constructor)(config, context)
    }
}

/// The plugins shipped with the agent.
pub fn builtin() -> Vec<MonitorPlugin> {
    vec![MonitorPlugin::new(
        "kernel-monitor",
        ConditionType::from(conditions::KERNEL_READY),
        Box::new(|config, _context| Box::new(KernelMonitor::new(&config.host_root))),
    )]
}

/// Rejects plugin lists with empty or duplicate names before any monitor is
/// registered.
pub fn validate(plugins: &[MonitorPlugin]) -> Result<(), ConfigError> {
    let mut seen = std::collections::HashSet::new();
    for plugin in plugins {
        if plugin.name().is_empty() {
            return Err(ConfigError::ValidationError(
                "plugin name cannot be empty".to_string(),
            ));
        }
        if !seen.insert(plugin.name()) {
            return Err(ConfigError::ValidationError(format!(
                "plugin {:?} already registered",
                plugin.name()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(name: &'static str) -> MonitorPlugin {
        MonitorPlugin::new(
            name,
            ConditionType::from(conditions::KERNEL_READY),
            Box::new(|config, _context| Box::new(KernelMonitor::new(&config.host_root))),
        )
    }

    fn test_context() -> RuntimeContext {
        RuntimeContext::from_parts("linux", "none", Vec::new())
    }

    #[test]
    fn test_builtin_plugins_are_valid() {
        let plugins = builtin();
        assert!(validate(&plugins).is_ok());
        assert_eq!(plugins[0].name(), "kernel-monitor");
        assert_eq!(
            plugins[0].condition_type(),
            &ConditionType::from("KernelReady")
        );
    }

    #[test]
    fn test_duplicate_plugin_names_rejected() {
        let plugins = vec![named("kernel-monitor"), named("kernel-monitor")];
        let err = validate(&plugins).unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[test]
    fn test_empty_plugin_name_rejected() {
        let plugins = vec![named("")];
        assert!(validate(&plugins).is_err());
    }

    #[test]
    fn test_build_constructs_monitor() {
        let config = Config::default();
        let monitor = builtin()[0].build(&config, &test_context());
        assert_eq!(monitor.name(), "kernel");
    }
}
