//! Per-table record types.

use serde::{Deserialize, Deserializer, Serialize};

use crate::macros::string_enum;
use crate::{SchemaError, TableKind, TableRow};

/// Default guest memory in MiB when a VM row leaves `ram` unset.
pub const DEFAULT_VM_RAM_MB: u64 = 512;

/// Default virtual CPU count when a VM row leaves `cpu` unset.
pub const DEFAULT_VM_CPUS: u32 = 1;

/// Default iSCSI LUN.
pub const DEFAULT_LUN: u32 = 0;

/// Root under which storage targets are mounted when no mount point is set.
pub const DEFAULT_MOUNT_ROOT: &str = "/mnt";

string_enum! {
    /// Process-wide log verbosity requested through the System table.
    LogLevel, "logging_level" {
        Debug => "debug",
        Info => "info",
        Warning => "warning",
        Error => "error",
        Critical => "critical",
    }
}

string_enum! {
    /// Administrative link state of an interface.
    LinkState, "state" {
        Up => "up",
        Down => "down",
    }
}

string_enum! {
    /// Desired power state of a virtual machine.
    VmPowerState, "state" {
        Run => "run",
        Stop => "stop",
    }
}

/// Host-wide settings (singleton `System` table).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemSettings {
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub logging_level: Option<LogLevel>,
}

impl TableRow for SystemSettings {
    const TABLE: &'static str = "System";
    const KIND: TableKind = TableKind::Singleton;
}

/// Desired configuration of one network interface.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterfaceSpec {
    #[serde(default)]
    pub name: String,
    /// Address in CIDR notation.
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub state: Option<LinkState>,
    #[serde(default)]
    pub mtu: Option<u32>,
    #[serde(default)]
    pub vlan: Option<u16>,
}

impl TableRow for InterfaceSpec {
    const TABLE: &'static str = "Interface";
    const KIND: TableKind = TableKind::Keyed;

    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }
}

/// Desired iSCSI attachment and mount.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageSpec {
    #[serde(default)]
    pub target_iqn: Option<String>,
    #[serde(default)]
    pub portal_ip: Option<String>,
    #[serde(default)]
    pub lun: Option<u32>,
    #[serde(default)]
    pub mount_point: Option<String>,
}

impl StorageSpec {
    /// Target IQN and portal address, both required for a login.
    pub fn target(&self) -> Result<(&str, &str), SchemaError> {
        let iqn = non_empty(&self.target_iqn).ok_or(SchemaError::MissingField {
            table: Self::TABLE,
            field: "target_iqn",
        })?;
        let portal = non_empty(&self.portal_ip).ok_or(SchemaError::MissingField {
            table: Self::TABLE,
            field: "portal_ip",
        })?;
        Ok((iqn, portal))
    }

    /// LUN number, defaulting to 0.
    pub fn lun(&self) -> u32 {
        self.lun.unwrap_or(DEFAULT_LUN)
    }

    /// Mount point, derived from the target IQN when unset.
    ///
    /// Returns `None` only when neither a mount point nor a target is known.
    pub fn mount_point(&self) -> Option<String> {
        if let Some(mount) = non_empty(&self.mount_point) {
            return Some(mount.to_string());
        }
        non_empty(&self.target_iqn)
            .map(|iqn| format!("{}/{}", DEFAULT_MOUNT_ROOT, iqn.replace(':', "_")))
    }
}

impl TableRow for StorageSpec {
    const TABLE: &'static str = "Storage";
    const KIND: TableKind = TableKind::Unkeyed;
}

/// Desired virtual machine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VmSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub cpu: Option<u32>,
    /// Guest memory in MiB.
    #[serde(default)]
    pub ram: Option<u64>,
    #[serde(default)]
    pub disk_path: Option<String>,
    /// Host PCI device ids handed to the guest.
    #[serde(default, deserialize_with = "one_or_many")]
    pub pci_passthrough: Vec<String>,
    #[serde(default)]
    pub state: Option<VmPowerState>,
}

impl VmSpec {
    pub fn ram_mb(&self) -> u64 {
        match self.ram {
            Some(ram) if ram > 0 => ram,
            _ => DEFAULT_VM_RAM_MB,
        }
    }

    pub fn vcpus(&self) -> u32 {
        match self.cpu {
            Some(cpu) if cpu > 0 => cpu,
            _ => DEFAULT_VM_CPUS,
        }
    }

    /// Primary disk image, if one is set.
    pub fn disk(&self) -> Option<&str> {
        non_empty(&self.disk_path)
    }
}

impl TableRow for VmSpec {
    const TABLE: &'static str = "VirtualMachine";
    const KIND: TableKind = TableKind::Keyed;

    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }
}

/// Host metrics published by the telemetry agent (singleton `Telemetry` table).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// One-minute load average.
    #[serde(default)]
    pub cpu_load: Option<f64>,
    /// Temperature in degrees Celsius.
    #[serde(default)]
    pub temp: Option<f64>,
    /// Available memory in kB.
    #[serde(default)]
    pub ram_free: Option<i64>,
}

impl TableRow for TelemetryRecord {
    const TABLE: &'static str = "Telemetry";
    const KIND: TableKind = TableKind::Singleton;
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Accepts a single string, a list of strings, or null.
///
/// The store sends a one-element set as a bare atom.
fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(value)) => vec![value],
        Some(OneOrMany::Many(values)) => values,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case("run", VmPowerState::Run)]
    #[case("RUN", VmPowerState::Run)]
    #[case(" Stop ", VmPowerState::Stop)]
    fn test_power_state_is_case_insensitive(#[case] raw: &str, #[case] expected: VmPowerState) {
        assert_eq!(raw.parse::<VmPowerState>().unwrap(), expected);
    }

    #[test]
    fn test_unknown_enum_value_rejected() {
        let err = "paused".parse::<VmPowerState>().unwrap_err();
        assert_eq!(
            err,
            SchemaError::InvalidValue {
                field: "state",
                value: "paused".to_string()
            }
        );
        assert!("verbose".parse::<LogLevel>().is_err());
    }

    #[rstest]
    #[case(json!(null), vec![])]
    #[case(json!("0000:01:00.0"), vec!["0000:01:00.0"])]
    #[case(json!(["0000:01:00.0", "0000:02:00.0"]), vec!["0000:01:00.0", "0000:02:00.0"])]
    fn test_passthrough_shapes(#[case] raw: serde_json::Value, #[case] expected: Vec<&str>) {
        let vm: VmSpec =
            serde_json::from_value(json!({"name": "vm1", "pci_passthrough": raw})).unwrap();
        assert_eq!(vm.pci_passthrough, expected);
    }

    #[test]
    fn test_vm_defaults_ignore_zero() {
        let vm = VmSpec {
            name: "vm1".to_string(),
            cpu: Some(0),
            ram: Some(0),
            ..Default::default()
        };
        assert_eq!(vm.vcpus(), DEFAULT_VM_CPUS);
        assert_eq!(vm.ram_mb(), DEFAULT_VM_RAM_MB);
        assert_eq!(vm.disk(), None);
    }

    #[test]
    fn test_storage_mount_point_derived_from_iqn() {
        let spec = StorageSpec {
            target_iqn: Some("iqn.2024-01.lan.nas:vol1".to_string()),
            portal_ip: Some("10.0.0.5".to_string()),
            ..Default::default()
        };
        assert_eq!(
            spec.mount_point().as_deref(),
            Some("/mnt/iqn.2024-01.lan.nas_vol1")
        );
        assert_eq!(spec.lun(), 0);
        assert_eq!(
            spec.target().unwrap(),
            ("iqn.2024-01.lan.nas:vol1", "10.0.0.5")
        );
    }

    #[test]
    fn test_storage_target_requires_portal() {
        let spec = StorageSpec {
            target_iqn: Some("iqn.2024-01.lan.nas:vol1".to_string()),
            portal_ip: Some("  ".to_string()),
            ..Default::default()
        };
        assert_eq!(
            spec.target().unwrap_err(),
            SchemaError::MissingField {
                table: "Storage",
                field: "portal_ip"
            }
        );
    }

    #[test]
    fn test_explicit_mount_point_wins() {
        let spec = StorageSpec {
            target_iqn: Some("iqn:x".to_string()),
            mount_point: Some("/srv/data".to_string()),
            ..Default::default()
        };
        assert_eq!(spec.mount_point().as_deref(), Some("/srv/data"));
    }
}
