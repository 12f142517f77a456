//! Standard node condition types reported by the agent.
//!
//! These are the long-lived health flags reconciled against the control
//! plane's view of the node. Each managed type starts out healthy with a
//! stable ready reason so that downstream consumers can distinguish "the
//! agent is running and found nothing" from "the agent never reported".

use crate::manager::NodeConditionConfig;
use crate::monitor::ConditionType;

/// Whether accelerated hardware (GPU, Neuron) on the node is functioning.
pub const ACCELERATED_HARDWARE_READY: &str = "AcceleratedHardwareReady";

/// Whether the container runtime is functioning and able to run containers.
pub const CONTAINER_RUNTIME_READY: &str = "ContainerRuntimeReady";

/// Whether the kernel is functioning without critical errors, panics or
/// resource exhaustion.
pub const KERNEL_READY: &str = "KernelReady";

/// Whether the node's networking stack is functioning.
pub const NETWORKING_READY: &str = "NetworkingReady";

/// Standard condition indicating the node is healthy and ready for workloads.
pub const READY: &str = "Ready";

/// Whether the node's storage subsystem is functioning.
pub const STORAGE_READY: &str = "StorageReady";

/// Returns the healthy-default configuration for a managed condition type.
pub fn ready_config(condition_type: &ConditionType) -> NodeConditionConfig {
    NodeConditionConfig {
        ready_reason: format!("{}", condition_type),
        ready_message: format!("{} is healthy", condition_type),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_config_reason() {
        let config = ready_config(&ConditionType::from(KERNEL_READY));
        assert_eq!(config.ready_reason, "KernelReady");
        assert_eq!(config.ready_message, "KernelReady is healthy");
    }
}
