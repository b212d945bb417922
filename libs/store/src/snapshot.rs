//! Table snapshots and change versions.

use std::collections::BTreeMap;
use std::fmt;

use edge_schema::{decode_row, SchemaError, TableKind, TableRow};
use serde_json::{Map, Value};
use tracing::warn;

/// Monotonically increasing counter that moves whenever the store commits a
/// change the client has observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ChangeVersion(u64);

impl ChangeVersion {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(&self) -> u64 {
        self.0
    }

    /// The following version.
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for ChangeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Store-assigned row identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowId(String);

impl RowId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One row as read from the store: its id plus decoded column values.
///
/// Unset optional columns are absent or `null`.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub id: RowId,
    pub fields: Map<String, Value>,
}

impl Row {
    pub fn new(id: RowId, fields: Map<String, Value>) -> Self {
        Self { id, fields }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.fields.get(column).filter(|v| !v.is_null())
    }

    /// The row's non-empty `name` column, if any.
    pub fn name(&self) -> Option<&str> {
        self.get("name")
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
    }
}

/// A typed row together with its store identity.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedRow<T> {
    pub id: RowId,
    /// Snapshot key: the row name for keyed tables, the row id otherwise.
    pub key: String,
    pub value: T,
}

/// A row that is present in the store but could not be decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRow {
    pub id: RowId,
    /// Snapshot key: the row name when it has one, the row id otherwise.
    pub key: String,
    /// The raw `name` column, when it is a non-empty string.
    pub name: Option<String>,
    pub error: SchemaError,
}

/// Result of decoding a whole table.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded<T> {
    pub rows: Vec<TypedRow<T>>,
    pub rejected: Vec<RejectedRow>,
}

impl<T> Decoded<T> {
    /// Names of rows that exist but failed to decode.
    pub fn rejected_names(&self) -> impl Iterator<Item = &str> {
        self.rejected.iter().filter_map(|row| row.name.as_deref())
    }
}

/// All rows of one table at a given change version, keyed by name.
///
/// Rows without a name are keyed by their row id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableSnapshot {
    table: String,
    rows: BTreeMap<String, Row>,
}

impl TableSnapshot {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            rows: BTreeMap::new(),
        }
    }

    /// Build a snapshot from rows in any order.
    pub fn from_rows(table: impl Into<String>, rows: impl IntoIterator<Item = Row>) -> Self {
        let mut snapshot = Self::new(table);
        for row in rows {
            snapshot.insert(row);
        }
        snapshot
    }

    pub fn insert(&mut self, row: Row) {
        let key = row
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| row.id.to_string());
        self.rows.insert(key, row);
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Row> {
        self.rows.get(key)
    }

    /// The first row, for singleton tables.
    pub fn first(&self) -> Option<&Row> {
        self.rows.values().next()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Row)> {
        self.rows.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Decode every row into `T`.
    ///
    /// Rows that fail to decode or validate are logged and left out; they
    /// never poison the rest of the snapshot.
    pub fn typed<T: TableRow>(&self) -> Vec<TypedRow<T>> {
        self.decode::<T>().rows
    }

    /// Decode every row into `T`, keeping track of the rows that failed.
    pub fn decode<T: TableRow>(&self) -> Decoded<T> {
        let mut decoded = Decoded {
            rows: Vec::with_capacity(self.rows.len()),
            rejected: Vec::new(),
        };
        for (key, row) in &self.rows {
            match decode_row::<T>(&row.fields) {
                Ok(value) => {
                    let key = match T::KIND {
                        TableKind::Keyed => value.name().unwrap_or(key).to_string(),
                        TableKind::Unkeyed | TableKind::Singleton => row.id.to_string(),
                    };
                    decoded.rows.push(TypedRow {
                        id: row.id.clone(),
                        key,
                        value,
                    });
                }
                Err(error) => {
                    warn!(table = T::TABLE, row = %key, error = %error, "Skipping invalid row");
                    decoded.rejected.push(RejectedRow {
                        id: row.id.clone(),
                        key: key.clone(),
                        name: row.name().map(str::to_string),
                        error,
                    });
                }
            }
        }
        decoded
    }

    /// Decode the singleton row, if present and valid.
    pub fn singleton<T: TableRow>(&self) -> Option<TypedRow<T>> {
        self.typed::<T>().into_iter().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_schema::{InterfaceSpec, TelemetryRecord, VmSpec};
    use serde_json::json;

    fn row(id: &str, fields: Value) -> Row {
        let Value::Object(map) = fields else {
            panic!("fields must be an object")
        };
        Row::new(RowId::new(id), map)
    }

    #[test]
    fn test_rows_keyed_by_name_or_id() {
        let snapshot = TableSnapshot::from_rows(
            "Interface",
            [
                row("u1", json!({"name": "eth0"})),
                row("u2", json!({"name": ""})),
                row("u3", json!({"mtu": 1500})),
            ],
        );

        assert_eq!(snapshot.len(), 3);
        assert!(snapshot.get("eth0").is_some());
        assert!(snapshot.get("u2").is_some());
        assert!(snapshot.get("u3").is_some());
    }

    #[test]
    fn test_typed_skips_invalid_rows() {
        let snapshot = TableSnapshot::from_rows(
            "Interface",
            [
                row("u1", json!({"name": "eth0", "mtu": 9000})),
                row("u2", json!({"name": "eth1", "mtu": "jumbo"})),
                row("u3", json!({"mtu": 1500})),
            ],
        );

        let typed = snapshot.typed::<InterfaceSpec>();
        assert_eq!(typed.len(), 1);
        assert_eq!(typed[0].key, "eth0");
        assert_eq!(typed[0].value.mtu, Some(9000));
    }

    #[test]
    fn test_decode_keeps_rejected_names() {
        let snapshot = TableSnapshot::from_rows(
            "VirtualMachine",
            [
                row("u1", json!({"name": "vm1", "cpu": 2})),
                row("u2", json!({"name": "vm2", "cpu": 5_000_000_000_u64})),
                row("u3", json!({"cpu": "two"})),
            ],
        );

        let decoded = snapshot.decode::<VmSpec>();
        assert_eq!(decoded.rows.len(), 1);
        assert_eq!(decoded.rejected.len(), 2);
        assert_eq!(decoded.rejected_names().collect::<Vec<_>>(), vec!["vm2"]);
        let unnamed = decoded.rejected.iter().find(|r| r.name.is_none()).unwrap();
        assert_eq!(unnamed.key, "u3");
    }

    #[test]
    fn test_singleton_uses_row_id() {
        let snapshot =
            TableSnapshot::from_rows("Telemetry", [row("t1", json!({"cpu_load": 0.25}))]);
        let telemetry = snapshot.singleton::<TelemetryRecord>().unwrap();
        assert_eq!(telemetry.id, RowId::new("t1"));
        assert_eq!(telemetry.key, "t1");
        assert_eq!(telemetry.value.cpu_load, Some(0.25));
    }

    #[test]
    fn test_null_columns_read_as_unset() {
        let r = row("u1", json!({"name": "eth0", "ip": null}));
        assert!(r.get("ip").is_none());
        assert_eq!(r.name(), Some("eth0"));
    }
}
