//! Configuration loading (C13): a TOML file plus environment-variable
//! overrides, mirroring the teacher's `config_file.rs`/`config.rs` split but
//! trimmed to what stpd actually reads at startup (spec §5 "resource
//! bounds", §6.1 `STPD_SOCK_NAME`).

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StpError};

/// Default IPC socket path (`original_source/stpd_main.cpp`:
/// `STPD_SOCK_NAME`).
pub const DEFAULT_IPC_SOCK_PATH: &str = "/var/run/stpipc.sock";

/// Hard ceiling on `InitReady.maxStpInstances` (spec §5 "maximum instances
/// is configured at startup"); a config asking for more is rejected rather
/// than silently clamped.
fn default_max_instances_ceiling() -> u16 {
    1024
}

fn default_ipc_sock_path() -> String {
    DEFAULT_IPC_SOCK_PATH.to_string()
}

fn default_tick_interval_ms() -> u64 {
    100
}

fn default_base_mac() -> String {
    "00:00:00:00:00:00".to_string()
}

/// Top-level stpd configuration, loaded once at startup and otherwise
/// immutable for the life of the process (BridgeConfig/InitReady IPC
/// messages mutate the live [`crate::model::Global`], not this struct).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StpdConfig {
    /// Path to the UNIX datagram socket the IPC decoder (C9) listens on.
    #[serde(default = "default_ipc_sock_path")]
    pub ipc_sock_path: String,

    /// Upper bound accepted from `InitReady.maxStpInstances`.
    #[serde(default = "default_max_instances_ceiling")]
    pub max_instances_ceiling: u16,

    /// Scheduler tick period (spec §4.8: "the high-priority queue holds
    /// only the 100 ms tick").
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Fallback base MAC used before the first `BridgeConfig` IPC message
    /// arrives. `BridgeConfig.baseMac` overrides this at runtime.
    #[serde(default = "default_base_mac")]
    pub base_mac: String,
}

impl Default for StpdConfig {
    fn default() -> Self {
        Self {
            ipc_sock_path: default_ipc_sock_path(),
            max_instances_ceiling: default_max_instances_ceiling(),
            tick_interval_ms: default_tick_interval_ms(),
            base_mac: default_base_mac(),
        }
    }
}

impl StpdConfig {
    /// Loads from `path`, falling back to defaults if the file is absent.
    /// A present-but-malformed file is a hard error: unlike a missing file,
    /// it signals operator intent that didn't parse.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content)
                .map_err(|e| StpError::InvalidArgument(format!("malformed config file {}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(StpError::Io(e)),
        }
    }

    /// Loads from `path` (or defaults), then applies `STPD_*` environment
    /// overrides on top — the same override order the teacher's daemons use
    /// for container deployments where a bind-mounted conf file is optional.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::load_or_default(path)?;
        if let Ok(v) = std::env::var("STPD_IPC_SOCK_PATH") {
            config.ipc_sock_path = v;
        }
        if let Ok(v) = std::env::var("STPD_MAX_INSTANCES_CEILING") {
            config.max_instances_ceiling = v
                .parse()
                .map_err(|_| StpError::InvalidArgument(format!("invalid STPD_MAX_INSTANCES_CEILING: {v}")))?;
        }
        if let Ok(v) = std::env::var("STPD_TICK_INTERVAL_MS") {
            config.tick_interval_ms = v
                .parse()
                .map_err(|_| StpError::InvalidArgument(format!("invalid STPD_TICK_INTERVAL_MS: {v}")))?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_instances_ceiling == 0 {
            return Err(StpError::InvalidArgument("max_instances_ceiling must be > 0".to_string()));
        }
        if self.tick_interval_ms == 0 {
            return Err(StpError::InvalidArgument("tick_interval_ms must be > 0".to_string()));
        }
        if self.ipc_sock_path.is_empty() {
            return Err(StpError::InvalidArgument("ipc_sock_path must not be empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StpdConfig::default();
        assert_eq!(config.ipc_sock_path, DEFAULT_IPC_SOCK_PATH);
        assert_eq!(config.tick_interval_ms, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_nonexistent_file_defaults() {
        let config = StpdConfig::load_or_default("/nonexistent/stpd-config-test.toml").unwrap();
        assert_eq!(config, StpdConfig::default());
    }

    #[test]
    fn test_toml_roundtrip_partial_override() {
        let toml_str = r#"
            max_instances_ceiling = 64
        "#;
        let config: StpdConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.max_instances_ceiling, 64);
        assert_eq!(config.ipc_sock_path, DEFAULT_IPC_SOCK_PATH);
    }

    #[test]
    fn test_malformed_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stpd.toml");
        fs::write(&path, "this is not valid toml {{{").unwrap();
        let err = StpdConfig::load_or_default(&path).unwrap_err();
        assert!(matches!(err, StpError::InvalidArgument(_)));
    }

    #[test]
    fn test_validate_rejects_zero_tick_interval() {
        let mut config = StpdConfig::default();
        config.tick_interval_ms = 0;
        assert!(config.validate().is_err());
    }
}
