//! Agent configuration and runtime context.
//!
//! Configuration comes from a TOML file. A missing or empty file yields the
//! defaults (every monitor enabled, host root at `/`); a file that exists but
//! fails to parse or names unknown monitors is a hard error.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::info;
use serde::Deserialize;

use crate::error::ConfigError;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/nodewatch/config.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Name of the node this agent reports for. Usually supplied on the
    /// command line or via the environment instead.
    pub node_name: Option<String>,
    /// Prefix under which the host filesystem is mounted.
    pub host_root: PathBuf,
    pub api: ApiConfig,
    /// Per-monitor settings keyed by plugin name. Monitors not listed here
    /// are enabled.
    pub monitors: BTreeMap<String, MonitorSettings>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            node_name: None,
            host_root: PathBuf::from("/"),
            api: ApiConfig::default(),
            monitors: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApiConfig {
    pub endpoint: String,
    pub token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            endpoint: "http://127.0.0.1:8001".to_string(),
            token: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorSettings {
    enabled: Option<bool>,
}

impl MonitorSettings {
    /// Defaults to enabled when not explicitly set.
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

impl Config {
    /// Loads the configuration from `path`. A missing or empty file yields
    /// the defaults.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "no configuration file at {}, using defaults",
                    path.display()
                );
                return Ok(Config::default());
            }
            Err(err) => return Err(ConfigError::IoError(err)),
        };
        if contents.trim().is_empty() {
            return Ok(Config::default());
        }
        Ok(toml::from_str(&contents)?)
    }

    pub fn monitor_enabled(&self, name: &str) -> bool {
        self.monitors
            .get(name)
            .map(MonitorSettings::is_enabled)
            .unwrap_or(true)
    }

    /// Rejects monitor settings that reference names outside the known
    /// plugin set.
    pub fn validate_monitor_names(&self, known: &[&str]) -> Result<(), ConfigError> {
        let unknown: Vec<&str> = self
            .monitors
            .keys()
            .map(String::as_str)
            .filter(|name| !known.contains(name))
            .collect();
        if unknown.is_empty() {
            return Ok(());
        }
        Err(ConfigError::ValidationError(format!(
            "unknown monitor plugin name(s): {}",
            unknown.join(", ")
        )))
    }

    /// Joins a host-absolute path onto the configured host root.
    pub fn host_path(&self, path: &str) -> PathBuf {
        self.host_root.join(path.trim_start_matches('/'))
    }
}

pub const ACCELERATED_HARDWARE_NVIDIA: &str = "nvidia";
pub const ACCELERATED_HARDWARE_NEURON: &str = "neuron";
pub const ACCELERATED_HARDWARE_NONE: &str = "none";

/// Facts about the host discovered once at startup, passed explicitly to the
/// components that adapt their behavior to the environment. Tags are
/// append-only and may be extended at runtime.
#[derive(Debug)]
pub struct RuntimeContext {
    os_distro: String,
    accelerated_hardware: String,
    tags: Mutex<Vec<String>>,
}

impl RuntimeContext {
    /// Discovers the runtime context from the host filesystem and the
    /// environment. The agent runs across different operating systems and
    /// accelerator hardware, so this is derived at startup rather than
    /// configured.
    pub fn detect(config: &Config) -> Result<Self, ConfigError> {
        let os_distro =
            std::env::var("OS_DISTRO").unwrap_or_else(|_| "linux".to_string());

        let pci_devices = std::fs::read_to_string(config.host_path("/proc/bus/pci/devices"))
            .unwrap_or_default();
        let accelerated_hardware = if pci_devices.contains(ACCELERATED_HARDWARE_NVIDIA) {
            ACCELERATED_HARDWARE_NVIDIA
        } else if pci_devices.contains(ACCELERATED_HARDWARE_NEURON) {
            ACCELERATED_HARDWARE_NEURON
        } else {
            ACCELERATED_HARDWARE_NONE
        };

        // The TAGS environment variable injects additional comma-separated
        // tags to control context-aware behavior.
        let mut tags: Vec<String> = std::env::var("TAGS")
            .unwrap_or_default()
            .split(',')
            .filter(|tag| !tag.is_empty())
            .map(str::to_string)
            .collect();
        match std::fs::read_to_string(config.host_path("/etc/os-release")) {
            Ok(release_info) => {
                if let Some(id) = os_release_id(&release_info) {
                    tags.push(id.to_string());
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(ConfigError::IoError(err)),
        }

        Ok(RuntimeContext {
            os_distro,
            accelerated_hardware: accelerated_hardware.to_string(),
            tags: Mutex::new(tags),
        })
    }

    #[cfg(test)]
    pub(crate) fn from_parts(
        os_distro: impl Into<String>,
        accelerated_hardware: impl Into<String>,
        tags: Vec<String>,
    ) -> Self {
        RuntimeContext {
            os_distro: os_distro.into(),
            accelerated_hardware: accelerated_hardware.into(),
            tags: Mutex::new(tags),
        }
    }

    pub fn os_distro(&self) -> &str {
        &self.os_distro
    }

    pub fn accelerated_hardware(&self) -> &str {
        &self.accelerated_hardware
    }

    pub fn tags(&self) -> Vec<String> {
        self.tags.lock().unwrap().clone()
    }

    pub fn add_tags(&self, tags: impl IntoIterator<Item = String>) {
        self.tags.lock().unwrap().extend(tags);
    }
}

/// Extracts the `ID` field value from `/etc/os-release` contents, stripping
/// surrounding quotes.
fn os_release_id(release_info: &str) -> Option<&str> {
    release_info
        .lines()
        .find_map(|line| line.strip_prefix("ID="))
        .map(|id| id.trim_matches('"'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.host_root, PathBuf::from("/"));
        assert!(config.monitor_enabled("kernel-monitor"));
        assert!(config.node_name.is_none());
    }

    #[test]
    fn test_load_missing_file_yields_defaults() {
        let config = Config::load(Path::new("/nonexistent/config.toml")).unwrap();
        assert!(config.monitors.is_empty());
    }

    #[test]
    fn test_load_full_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
node_name = "worker-1"
host_root = "/host"

[api]
endpoint = "https://control-plane.local:6443"
token = "secret"

[monitors.kernel-monitor]
enabled = false
"#
        )
        .unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.node_name.as_deref(), Some("worker-1"));
        assert_eq!(config.host_root, PathBuf::from("/host"));
        assert_eq!(config.api.endpoint, "https://control-plane.local:6443");
        assert_eq!(config.api.token.as_deref(), Some("secret"));
        assert!(!config.monitor_enabled("kernel-monitor"));
        assert!(config.monitor_enabled("anything-else"));
    }

    #[test]
    fn test_load_empty_file_yields_defaults() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let config = Config::load(file.path()).unwrap();
        assert!(config.monitors.is_empty());
    }

    #[test]
    fn test_load_invalid_toml_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not valid toml [[[").unwrap();
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn test_validate_monitor_names() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[monitors.kernel-monitor]
enabled = true

[monitors.bogus-monitor]
enabled = false
"#
        )
        .unwrap();
        let config = Config::load(file.path()).unwrap();
        assert!(config.validate_monitor_names(&["kernel-monitor"]).is_err());
        assert!(config
            .validate_monitor_names(&["kernel-monitor", "bogus-monitor"])
            .is_ok());
    }

    #[test]
    fn test_host_path() {
        let config = Config {
            host_root: PathBuf::from("/host"),
            ..Config::default()
        };
        assert_eq!(
            config.host_path("/proc/sys/fs/file-nr"),
            PathBuf::from("/host/proc/sys/fs/file-nr")
        );
    }

    #[test]
    fn test_os_release_id() {
        let release = "NAME=\"Amazon Linux\"\nID=\"amzn\"\nVERSION_ID=\"2023\"\n";
        assert_eq!(os_release_id(release), Some("amzn"));
        assert_eq!(os_release_id("NAME=whatever\n"), None);
    }

    #[test]
    fn test_runtime_context_tags_append_only() {
        let context = RuntimeContext::from_parts("linux", "none", vec!["amzn".to_string()]);
        context.add_tags(["hybrid".to_string()]);
        assert_eq!(context.tags(), vec!["amzn".to_string(), "hybrid".to_string()]);
        assert_eq!(context.os_distro(), "linux");
        assert_eq!(context.accelerated_hardware(), "none");
    }
}
