//! Configuration for the edge agents.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use edge_store::ovsdb::{DEFAULT_DATABASE, DEFAULT_REMOTE, DEFAULT_SCHEMA_PATH};
use edge_store::OvsdbConfig;

/// Bridge every interface is attached to.
pub const DEFAULT_BRIDGE: &str = "br0";

/// Hypervisor executable.
pub const DEFAULT_QEMU_BIN: &str = "qemu-system-aarch64";

/// cgroup that hypervisor processes are moved into.
pub const DEFAULT_VM_CGROUP_PROCS: &str = "/sys/fs/cgroup/vm.slice/cgroup.procs";

/// Grace period between SIGTERM and SIGKILL when stopping a VM.
pub const DEFAULT_VM_STOP_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_TIMEZONE_FILE: &str = "/etc/timezone";

/// Agent configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Store remote (`unix:` socket or `tcp:` address).
    pub store_remote: String,

    /// Database name inside the store.
    pub store_db: String,

    /// Schema file checked at startup.
    pub schema_path: PathBuf,

    /// Bridge interfaces are attached to.
    pub bridge: String,

    /// Hypervisor executable.
    pub qemu_bin: PathBuf,

    /// `cgroup.procs` file hypervisor pids are written to.
    pub vm_cgroup_procs: PathBuf,

    /// SIGTERM grace period for VM processes.
    pub vm_stop_timeout: Duration,

    /// Poll interval override; each domain has its own default.
    pub poll_interval: Option<Duration>,

    /// File the System table's timezone is written to.
    pub timezone_file: PathBuf,

    /// Initial log filter when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_remote: DEFAULT_REMOTE.to_string(),
            store_db: DEFAULT_DATABASE.to_string(),
            schema_path: PathBuf::from(DEFAULT_SCHEMA_PATH),
            bridge: DEFAULT_BRIDGE.to_string(),
            qemu_bin: PathBuf::from(DEFAULT_QEMU_BIN),
            vm_cgroup_procs: PathBuf::from(DEFAULT_VM_CGROUP_PROCS),
            vm_stop_timeout: DEFAULT_VM_STOP_TIMEOUT,
            poll_interval: None,
            timezone_file: PathBuf::from(DEFAULT_TIMEZONE_FILE),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let vm_stop_timeout = match var("EDGE_VM_STOP_TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(
                raw.trim()
                    .parse()
                    .with_context(|| format!("invalid EDGE_VM_STOP_TIMEOUT_SECS: {raw}"))?,
            ),
            None => defaults.vm_stop_timeout,
        };

        let poll_interval = var("EDGE_POLL_INTERVAL_MS")
            .map(|raw| {
                raw.trim()
                    .parse()
                    .map(Duration::from_millis)
                    .with_context(|| format!("invalid EDGE_POLL_INTERVAL_MS: {raw}"))
            })
            .transpose()?;

        Ok(Self {
            store_remote: var("EDGE_STORE_REMOTE").unwrap_or(defaults.store_remote),
            store_db: var("EDGE_STORE_DB").unwrap_or(defaults.store_db),
            schema_path: var("EDGE_SCHEMA_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.schema_path),
            bridge: var("EDGE_BRIDGE").unwrap_or(defaults.bridge),
            qemu_bin: var("EDGE_QEMU_BIN")
                .map(PathBuf::from)
                .unwrap_or(defaults.qemu_bin),
            vm_cgroup_procs: var("EDGE_VM_CGROUP_PROCS")
                .map(PathBuf::from)
                .unwrap_or(defaults.vm_cgroup_procs),
            vm_stop_timeout,
            poll_interval,
            timezone_file: var("EDGE_TIMEZONE_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.timezone_file),
            log_level: var("EDGE_LOG_LEVEL").unwrap_or(defaults.log_level),
        })
    }

    /// Store connection settings replicating `tables`.
    pub fn store_config(&self, tables: &[&str]) -> OvsdbConfig {
        OvsdbConfig::new(&self.store_remote, &self.store_db)
            .with_schema(&self.schema_path)
            .with_tables(tables.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.store_remote, "unix:/var/run/openvswitch/db.sock");
        assert_eq!(config.bridge, "br0");
        assert_eq!(config.vm_stop_timeout, Duration::from_secs(10));
        assert!(config.poll_interval.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("EDGE_STORE_DB", "Lab"),
            ("EDGE_QEMU_BIN", "/opt/qemu/bin/qemu-system-x86_64"),
            ("EDGE_VM_STOP_TIMEOUT_SECS", "3"),
            ("EDGE_POLL_INTERVAL_MS", "250"),
            ("EDGE_BRIDGE", ""),
        ]))
        .unwrap();

        assert_eq!(config.store_db, "Lab");
        assert_eq!(
            config.qemu_bin,
            PathBuf::from("/opt/qemu/bin/qemu-system-x86_64")
        );
        assert_eq!(config.vm_stop_timeout, Duration::from_secs(3));
        assert_eq!(config.poll_interval, Some(Duration::from_millis(250)));
        // Empty values fall back to the default.
        assert_eq!(config.bridge, "br0");
    }

    #[test]
    fn test_invalid_integer_is_an_error() {
        let err = Config::from_lookup(lookup(&[("EDGE_VM_STOP_TIMEOUT_SECS", "ten")])).unwrap_err();
        assert!(err.to_string().contains("EDGE_VM_STOP_TIMEOUT_SECS"));
    }

    #[test]
    fn test_store_config() {
        let store = Config::default().store_config(&["Interface", "System"]);
        assert_eq!(store.database, "Edge");
        assert_eq!(store.tables, vec!["Interface", "System"]);
        assert_eq!(
            store.schema_path,
            Some(PathBuf::from("/etc/openvswitch/system.ovsschema"))
        );
    }
}
