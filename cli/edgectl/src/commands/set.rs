//! `edgectl set` - upsert one field of a desired-state row.

use std::str::FromStr;

use anyhow::Result;
use clap::{Args, ValueEnum};
use edge_schema::{
    InterfaceSpec, LinkState, LogLevel, SystemSettings, TableRow, VmPowerState, VmSpec,
};
use edge_store::{StoreClient, TableSnapshot, Transaction};
use serde_json::{Map, Value};

use super::CommandContext;
use crate::error::CliError;
use crate::output::print_success;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Resource {
    Interface,
    System,
    Vm,
}

impl Resource {
    pub fn table(self) -> &'static str {
        match self {
            Self::Interface => InterfaceSpec::TABLE,
            Self::System => SystemSettings::TABLE,
            Self::Vm => VmSpec::TABLE,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Interface => "interface",
            Self::System => "system",
            Self::Vm => "vm",
        }
    }
}

#[derive(Debug, Args)]
pub struct SetCommand {
    /// Resource kind.
    #[arg(value_enum)]
    resource: Resource,

    /// Row name (ignored for system).
    name: String,

    /// Field name.
    key: String,

    /// Field value.
    value: String,
}

impl SetCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let value = coerce(self.resource, &self.key, &self.value)?;

        let table = self.resource.table();
        let mut store = ctx.open(table).await?;
        let snapshot = store.table(table)?;
        let txn = upsert(self.resource, &self.name, &snapshot, &self.key, value);

        let status = store.commit(txn).await?;
        if !status.is_success() {
            return Err(CliError::Commit(status.to_string()).into());
        }

        match self.resource {
            Resource::System => print_success(&format!("{table} {} updated", self.key)),
            _ => print_success(&format!("{table} {} {} updated", self.name, self.key)),
        }
        Ok(())
    }
}

/// Convert the raw command-line value to the column's store type.
pub fn coerce(resource: Resource, key: &str, raw: &str) -> Result<Value, CliError> {
    match (resource, key) {
        (Resource::Interface, "ip") => Ok(Value::String(raw.to_string())),
        (Resource::Interface, "state") => enum_text::<LinkState>(key, raw),
        (Resource::Interface, "mtu") => integer::<u32>(key, raw),
        (Resource::Interface, "vlan") => {
            let vlan: u16 = raw.trim().parse().map_err(|e| CliError::invalid(key, raw, e))?;
            if vlan > 4094 {
                return Err(CliError::invalid(key, raw, "VLAN id must be at most 4094"));
            }
            Ok(Value::from(vlan))
        }

        (Resource::System, "hostname" | "timezone") => Ok(Value::String(raw.to_string())),
        (Resource::System, "logging_level") => enum_text::<LogLevel>(key, raw),

        (Resource::Vm, "cpu") => integer::<u32>(key, raw),
        (Resource::Vm, "ram") => integer::<u64>(key, raw),
        (Resource::Vm, "disk_path") => Ok(Value::String(raw.to_string())),
        (Resource::Vm, "state") => enum_text::<VmPowerState>(key, raw),
        (Resource::Vm, "pci_passthrough") => Ok(Value::Array(
            raw.split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(|id| Value::String(id.to_string()))
                .collect(),
        )),

        _ => Err(CliError::UnknownField {
            resource: resource.label(),
            key: key.to_string(),
        }),
    }
}

fn integer<T>(key: &str, raw: &str) -> Result<Value, CliError>
where
    T: FromStr + Into<Value>,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map(Into::into)
        .map_err(|e| CliError::invalid(key, raw, e))
}

fn enum_text<T>(key: &str, raw: &str) -> Result<Value, CliError>
where
    T: FromStr + std::fmt::Display,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map(|v| Value::String(v.to_string()))
        .map_err(|e| CliError::invalid(key, raw, e))
}

/// Build the transaction that sets `key` on the matching row.
///
/// System is a singleton and always targets its first row. Other resources
/// are matched by `name`; a new row carries the name alongside the field.
pub fn upsert(
    resource: Resource,
    name: &str,
    snapshot: &TableSnapshot,
    key: &str,
    value: Value,
) -> Transaction {
    let existing = match resource {
        Resource::System => snapshot.first(),
        _ => snapshot.iter().map(|(_, row)| row).find(|row| row.name() == Some(name)),
    };

    let mut fields = Map::new();
    if existing.is_none() && resource != Resource::System {
        fields.insert("name".to_string(), Value::String(name.to_string()));
    }
    fields.insert(key.to_string(), value);

    let mut txn = Transaction::new();
    txn.upsert(resource.table(), existing.map(|row| row.id.clone()), fields);
    txn
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_store::{Row, RowId, TxnOp};
    use rstest::rstest;
    use serde_json::json;

    #[rstest]
    #[case(Resource::Interface, "mtu", "1400", json!(1400))]
    #[case(Resource::Interface, "vlan", "20", json!(20))]
    #[case(Resource::Interface, "ip", "10.0.0.2/24", json!("10.0.0.2/24"))]
    #[case(Resource::Interface, "state", "UP", json!("up"))]
    #[case(Resource::System, "logging_level", "warning", json!("warning"))]
    #[case(Resource::Vm, "cpu", "2", json!(2))]
    #[case(Resource::Vm, "ram", "1024", json!(1024))]
    #[case(Resource::Vm, "state", "run", json!("run"))]
    #[case(Resource::Vm, "pci_passthrough", "0000:01:00.0, 0000:02:00.0", json!(["0000:01:00.0", "0000:02:00.0"]))]
    #[case(Resource::Vm, "pci_passthrough", "", json!([]))]
    fn test_coerce(
        #[case] resource: Resource,
        #[case] key: &str,
        #[case] raw: &str,
        #[case] expected: Value,
    ) {
        assert_eq!(coerce(resource, key, raw).unwrap(), expected);
    }

    #[rstest]
    #[case(Resource::Interface, "mtu", "big")]
    #[case(Resource::Interface, "vlan", "5000")]
    #[case(Resource::Interface, "state", "sideways")]
    #[case(Resource::Vm, "ram", "-1")]
    #[case(Resource::System, "logging_level", "verbose")]
    fn test_coerce_rejects_bad_values(
        #[case] resource: Resource,
        #[case] key: &str,
        #[case] raw: &str,
    ) {
        assert!(matches!(
            coerce(resource, key, raw),
            Err(CliError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_unknown_interface_field() {
        let err = coerce(Resource::Interface, "speed", "1000").unwrap_err();
        assert_eq!(err.to_string(), "unknown interface field `speed`");
    }

    fn snapshot(table: &str, rows: &[(&str, Value)]) -> TableSnapshot {
        TableSnapshot::from_rows(
            table,
            rows.iter().map(|(id, fields)| {
                let Value::Object(fields) = fields.clone() else {
                    panic!("fields must be an object");
                };
                Row::new(RowId::new(*id), fields)
            }),
        )
    }

    #[test]
    fn test_upsert_updates_row_with_matching_name() {
        let snap = snapshot(
            "Interface",
            &[("u1", json!({"name": "eth0"})), ("u2", json!({"name": "eth1"}))],
        );
        let txn = upsert(Resource::Interface, "eth1", &snap, "mtu", json!(9000));

        match &txn.ops()[0] {
            TxnOp::Update { id, fields, .. } => {
                assert_eq!(id.as_str(), "u2");
                assert_eq!(fields.get("mtu"), Some(&json!(9000)));
                assert!(!fields.contains_key("name"));
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn test_upsert_inserts_named_row() {
        let snap = snapshot("VirtualMachine", &[]);
        let txn = upsert(Resource::Vm, "vm1", &snap, "cpu", json!(2));

        match &txn.ops()[0] {
            TxnOp::Insert { table, fields } => {
                assert_eq!(table, "VirtualMachine");
                assert_eq!(fields.get("name"), Some(&json!("vm1")));
                assert_eq!(fields.get("cpu"), Some(&json!(2)));
            }
            other => panic!("expected insert, got {other:?}"),
        }
    }

    #[test]
    fn test_system_targets_singleton_row() {
        let snap = snapshot("System", &[("s1", json!({"hostname": "old"}))]);
        let txn = upsert(Resource::System, "ignored", &snap, "hostname", json!("edge-02"));
        assert!(matches!(&txn.ops()[0], TxnOp::Update { id, .. } if id.as_str() == "s1"));

        let empty = snapshot("System", &[]);
        let txn = upsert(Resource::System, "ignored", &empty, "hostname", json!("edge-02"));
        match &txn.ops()[0] {
            TxnOp::Insert { fields, .. } => assert!(!fields.contains_key("name")),
            other => panic!("expected insert, got {other:?}"),
        }
    }
}
