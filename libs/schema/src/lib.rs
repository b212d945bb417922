//! # edge-schema
//!
//! Typed records for the desired-state tables of the edge host store.
//!
//! Every table the agents consume has an explicit struct here, with optional
//! columns modelled as `Option` and defaults applied through accessors. Rows
//! are decoded once, right after they are fetched, so the reconcilers never
//! poke at loosely typed JSON.
//!
//! ## Tables
//!
//! | Table            | Record             | Addressed by |
//! |------------------|--------------------|--------------|
//! | `System`         | [`SystemSettings`] | singleton    |
//! | `Interface`      | [`InterfaceSpec`]  | `name`       |
//! | `Storage`        | [`StorageSpec`]    | row id       |
//! | `VirtualMachine` | [`VmSpec`]         | `name`       |
//! | `Telemetry`      | [`TelemetryRecord`]| singleton    |

mod error;
mod macros;
mod tables;

pub use error::SchemaError;
pub use tables::*;

use serde::de::DeserializeOwned;

/// How rows of a table are addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    /// Rows are addressed by their `name` column.
    Keyed,
    /// Rows are addressed by their store row id.
    Unkeyed,
    /// The table holds at most one row.
    Singleton,
}

/// A record type backed by one store table.
pub trait TableRow: DeserializeOwned + Send + Sync + 'static {
    /// Store table name.
    const TABLE: &'static str;

    /// Addressing scheme of the table.
    const KIND: TableKind;

    /// The row's `name`, for keyed tables.
    fn name(&self) -> Option<&str> {
        None
    }

    /// Checks invariants that serde cannot express.
    fn validate(&self) -> Result<(), SchemaError> {
        if Self::KIND == TableKind::Keyed && self.name().is_none_or(str::is_empty) {
            return Err(SchemaError::EmptyName { table: Self::TABLE });
        }
        Ok(())
    }
}

/// Decode a row's columns into a typed record and validate it.
pub fn decode_row<T: TableRow>(
    fields: &serde_json::Map<String, serde_json::Value>,
) -> Result<T, SchemaError> {
    let record: T = serde_json::from_value(serde_json::Value::Object(fields.clone())).map_err(
        |e| SchemaError::InvalidRow {
            table: T::TABLE,
            message: e.to_string(),
        },
    )?;
    record.validate()?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        match value {
            serde_json::Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn test_decode_vm_row_with_defaults() {
        let vm: VmSpec = decode_row(&fields(json!({
            "name": "vm1",
            "disk_path": "/vm/vm1.img",
            "state": "run",
        })))
        .unwrap();

        assert_eq!(vm.name, "vm1");
        assert_eq!(vm.ram_mb(), 512);
        assert_eq!(vm.vcpus(), 1);
        assert_eq!(vm.state, Some(VmPowerState::Run));
        assert!(vm.pci_passthrough.is_empty());
    }

    #[test]
    fn test_keyed_row_requires_name() {
        let err = decode_row::<InterfaceSpec>(&fields(json!({"name": "", "mtu": 1500})))
            .unwrap_err();
        assert_eq!(err, SchemaError::EmptyName { table: "Interface" });

        let err = decode_row::<VmSpec>(&fields(json!({"cpu": 2}))).unwrap_err();
        assert_eq!(err, SchemaError::EmptyName { table: "VirtualMachine" });
    }

    #[test]
    fn test_wrong_column_type_is_reported() {
        let err = decode_row::<InterfaceSpec>(&fields(json!({"name": "eth0", "mtu": "big"})))
            .unwrap_err();
        assert!(matches!(err, SchemaError::InvalidRow { table: "Interface", .. }));
    }

    #[test]
    fn test_singletons_need_no_name() {
        let telemetry: TelemetryRecord =
            decode_row(&fields(json!({"cpu_load": 0.5, "ram_free": 1024}))).unwrap();
        assert_eq!(telemetry.cpu_load, Some(0.5));
        assert_eq!(telemetry.temp, None);

        let system: SystemSettings = decode_row(&fields(json!({}))).unwrap();
        assert_eq!(system.hostname, None);
    }
}
