//! Store client backed by the `ovsdb-client` executable.
//!
//! The client keeps a replica of the registered tables. [`run`] refreshes it
//! with a single `select` transaction and bumps the change version when the
//! content digest moves. A long-lived `ovsdb-client monitor` child provides
//! the blocking wait: every line it prints is an update notification.
//!
//! [`run`]: crate::StoreClient::run

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::{
    ChangeVersion, CommitStatus, ContentDigest, Row, RowId, StoreClient, StoreError,
    TableSnapshot, Transaction, TxnOp,
};

/// Default store socket.
pub const DEFAULT_REMOTE: &str = "unix:/var/run/openvswitch/db.sock";

/// Default database name.
pub const DEFAULT_DATABASE: &str = "Edge";

/// Schema file shipped with the host image.
pub const DEFAULT_SCHEMA_PATH: &str = "/etc/openvswitch/system.ovsschema";

/// Connection settings for [`OvsdbCliStore`].
#[derive(Debug, Clone)]
pub struct OvsdbConfig {
    /// Store remote, e.g. `unix:/var/run/openvswitch/db.sock`.
    pub remote: String,
    /// Database name inside the store.
    pub database: String,
    /// Schema file the database was created from. Checked at connect time.
    pub schema_path: Option<PathBuf>,
    /// Tables to replicate.
    pub tables: Vec<String>,
    /// Path of the `ovsdb-client` executable.
    pub client_bin: PathBuf,
}

impl OvsdbConfig {
    pub fn new(remote: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            remote: remote.into(),
            database: database.into(),
            schema_path: None,
            tables: Vec::new(),
            client_bin: PathBuf::from("ovsdb-client"),
        }
    }

    pub fn with_schema(mut self, path: impl Into<PathBuf>) -> Self {
        self.schema_path = Some(path.into());
        self
    }

    pub fn with_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables = tables.into_iter().map(Into::into).collect();
        self
    }
}

impl Default for OvsdbConfig {
    fn default() -> Self {
        Self::new(DEFAULT_REMOTE, DEFAULT_DATABASE)
    }
}

/// Running `ovsdb-client monitor` child.
struct Monitor {
    // Held so the child is killed when the monitor is dropped.
    _child: Child,
    lines: Lines<BufReader<ChildStdout>>,
}

/// Store client that shells out to `ovsdb-client`.
pub struct OvsdbCliStore {
    config: OvsdbConfig,
    cache: BTreeMap<String, TableSnapshot>,
    digest: Option<ContentDigest>,
    version: ChangeVersion,
    monitor: Option<Monitor>,
}

impl OvsdbCliStore {
    /// Connect to the store.
    ///
    /// Fails if the schema file is missing, the store does not answer, or the
    /// database is not served.
    pub async fn connect(config: OvsdbConfig) -> Result<Self, StoreError> {
        if let Some(schema) = &config.schema_path {
            if !schema.exists() {
                return Err(StoreError::SchemaMissing(schema.clone()));
            }
        }

        let output = Command::new(&config.client_bin)
            .arg("list-dbs")
            .arg(&config.remote)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| StoreError::Unreachable {
                remote: config.remote.clone(),
                detail: format!("failed to execute {}: {e}", config.client_bin.display()),
            })?;

        if !output.status.success() {
            return Err(StoreError::Unreachable {
                remote: config.remote.clone(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let listing = String::from_utf8_lossy(&output.stdout);
        if !listing.lines().any(|db| db.trim() == config.database) {
            return Err(StoreError::DatabaseMissing(config.database.clone()));
        }

        info!(
            remote = %config.remote,
            database = %config.database,
            tables = ?config.tables,
            "Connected to store"
        );

        let mut store = Self {
            config,
            cache: BTreeMap::new(),
            digest: None,
            version: ChangeVersion::default(),
            monitor: None,
        };
        store.ensure_monitor();
        Ok(store)
    }

    pub fn config(&self) -> &OvsdbConfig {
        &self.config
    }

    fn ensure_monitor(&mut self) {
        if self.monitor.is_some() {
            return;
        }

        let spawned = Command::new(&self.config.client_bin)
            .arg("--format=json")
            .arg("monitor")
            .arg(&self.config.remote)
            .arg(&self.config.database)
            .arg("ALL")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();

        match spawned {
            Ok(mut child) => match child.stdout.take() {
                Some(stdout) => {
                    debug!(pid = child.id(), "Started store monitor");
                    self.monitor = Some(Monitor {
                        _child: child,
                        lines: BufReader::new(stdout).lines(),
                    });
                }
                None => warn!("Store monitor has no stdout"),
            },
            Err(e) => warn!(error = %e, "Failed to start store monitor, falling back to polling"),
        }
    }

    /// Run a raw transaction and return the decoded result array.
    pub async fn transact(&self, request: &Value) -> Result<Vec<Value>, StoreError> {
        let output = Command::new(&self.config.client_bin)
            .arg("transact")
            .arg(&self.config.remote)
            .arg(request.to_string())
            .stdin(Stdio::null())
            .output()
            .await?;

        if !output.status.success() {
            return Err(StoreError::Unreachable {
                remote: self.config.remote.clone(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        match serde_json::from_slice::<Value>(&output.stdout)? {
            Value::Array(results) => Ok(results),
            other => Err(StoreError::Protocol(format!(
                "transact returned non-array result: {other}"
            ))),
        }
    }
}

#[async_trait]
impl StoreClient for OvsdbCliStore {
    async fn run(&mut self) -> Result<(), StoreError> {
        self.ensure_monitor();

        let request = select_request(&self.config.database, &self.config.tables);
        let results = self.transact(&request).await?;
        let cache = decode_select(&self.config.tables, &results)?;

        let digest = ContentDigest::from_json(&cache_json(&cache));
        if self.digest.as_ref() != Some(&digest) {
            self.version = self.version.next();
            debug!(version = %self.version, digest = %digest, "Store contents changed");
            self.digest = Some(digest);
        }
        self.cache = cache;
        Ok(())
    }

    fn change_version(&self) -> ChangeVersion {
        self.version
    }

    fn table(&self, name: &str) -> Result<TableSnapshot, StoreError> {
        self.cache
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::UnknownTable(name.to_string()))
    }

    async fn commit(&mut self, txn: Transaction) -> Result<CommitStatus, StoreError> {
        if txn.is_empty() {
            return Ok(CommitStatus::Unchanged);
        }
        let request = transact_request(&self.config.database, &txn);
        let results = self.transact(&request).await?;
        Ok(commit_status(&txn, &results))
    }

    async fn wait_for_change(&mut self, timeout: Duration) {
        let Some(monitor) = self.monitor.as_mut() else {
            tokio::time::sleep(timeout).await;
            return;
        };

        match tokio::time::timeout(timeout, monitor.lines.next_line()).await {
            Ok(Ok(Some(_update))) => {}
            Ok(Ok(None)) => {
                warn!("Store monitor exited");
                self.monitor = None;
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Store monitor read failed");
                self.monitor = None;
            }
            Err(_elapsed) => {}
        }
    }
}

/// Build a transaction selecting every row of `tables`.
pub fn select_request(database: &str, tables: &[String]) -> Value {
    let mut ops = vec![json!(database)];
    ops.extend(
        tables
            .iter()
            .map(|table| json!({"op": "select", "table": table, "where": []})),
    );
    Value::Array(ops)
}

/// Build the store transaction for `txn`.
pub fn transact_request(database: &str, txn: &Transaction) -> Value {
    let mut ops = vec![json!(database)];
    for op in txn.ops() {
        ops.push(match op {
            TxnOp::Insert { table, fields } => json!({
                "op": "insert",
                "table": table,
                "row": encode_row(fields, false),
            }),
            TxnOp::Update { table, id, fields } => json!({
                "op": "update",
                "table": table,
                "where": [["_uuid", "==", ["uuid", id.as_str()]]],
                "row": encode_row(fields, true),
            }),
        });
    }
    Value::Array(ops)
}

/// Map a transaction result array onto a [`CommitStatus`].
pub fn commit_status(txn: &Transaction, results: &[Value]) -> CommitStatus {
    if let Some(error) = results.iter().find_map(|r| r.get("error")) {
        let details = results
            .iter()
            .find_map(|r| r.get("details"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let error = error.as_str().unwrap_or("unknown error");
        return CommitStatus::Error(if details.is_empty() {
            error.to_string()
        } else {
            format!("{error}: {details}")
        });
    }

    if results.len() < txn.ops().len() {
        return CommitStatus::Error(format!(
            "expected {} results, got {}",
            txn.ops().len(),
            results.len()
        ));
    }

    let row_vanished = txn.ops().iter().zip(results).any(|(op, result)| {
        matches!(op, TxnOp::Update { .. })
            && result.get("count").and_then(Value::as_u64) == Some(0)
    });
    if row_vanished {
        return CommitStatus::TryAgain;
    }

    CommitStatus::Success
}

fn decode_select(
    tables: &[String],
    results: &[Value],
) -> Result<BTreeMap<String, TableSnapshot>, StoreError> {
    if let Some(error) = results.iter().find_map(|r| r.get("error")) {
        return Err(StoreError::Protocol(format!("select failed: {error}")));
    }

    let mut cache = BTreeMap::new();
    for (table, result) in tables.iter().zip(results) {
        let rows = result
            .get("rows")
            .and_then(Value::as_array)
            .ok_or_else(|| StoreError::Protocol(format!("select on {table} returned no rows")))?;

        let mut snapshot = TableSnapshot::new(table.clone());
        for raw in rows {
            snapshot.insert(decode_row(raw)?);
        }
        cache.insert(table.clone(), snapshot);
    }
    Ok(cache)
}

/// Decode one wire row into a [`Row`], dropping bookkeeping columns.
pub fn decode_row(raw: &Value) -> Result<Row, StoreError> {
    let object = raw
        .as_object()
        .ok_or_else(|| StoreError::Protocol(format!("row is not an object: {raw}")))?;

    let id = match object.get("_uuid").map(decode_datum) {
        Some(Value::String(id)) => RowId::new(id),
        _ => return Err(StoreError::Protocol(format!("row without _uuid: {raw}"))),
    };

    let fields = object
        .iter()
        .filter(|(column, _)| !column.starts_with('_'))
        .map(|(column, value)| (column.clone(), decode_datum(value)))
        .collect();

    Ok(Row::new(id, fields))
}

/// Decode a wire datum into plain JSON.
///
/// `["uuid", id]` becomes the id string, an empty set becomes `null`, other
/// sets become arrays and maps become objects.
pub fn decode_datum(value: &Value) -> Value {
    let Some([tag, body]) = value.as_array().map(Vec::as_slice) else {
        return value.clone();
    };

    match (tag.as_str(), body) {
        (Some("uuid" | "named-uuid"), Value::String(id)) => Value::String(id.clone()),
        (Some("set"), Value::Array(items)) if items.is_empty() => Value::Null,
        (Some("set"), Value::Array(items)) => Value::Array(items.iter().map(decode_datum).collect()),
        (Some("map"), Value::Array(pairs)) => {
            let mut map = Map::new();
            for pair in pairs {
                if let Some([k, v]) = pair.as_array().map(Vec::as_slice) {
                    let key = match decode_datum(k) {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    map.insert(key, decode_datum(v));
                }
            }
            Value::Object(map)
        }
        _ => value.clone(),
    }
}

/// Encode plain JSON as a wire datum.
pub fn encode_datum(value: &Value) -> Value {
    match value {
        Value::Null => json!(["set", []]),
        Value::Array(items) => json!(["set", items.iter().map(encode_datum).collect::<Vec<_>>()]),
        Value::Object(map) => json!([
            "map",
            map.iter()
                .map(|(k, v)| json!([k, encode_datum(v)]))
                .collect::<Vec<_>>()
        ]),
        atom => atom.clone(),
    }
}

fn encode_row(fields: &Map<String, Value>, keep_nulls: bool) -> Value {
    Value::Object(
        fields
            .iter()
            .filter(|(_, v)| keep_nulls || !v.is_null())
            .map(|(k, v)| (k.clone(), encode_datum(v)))
            .collect(),
    )
}

fn cache_json(cache: &BTreeMap<String, TableSnapshot>) -> Value {
    let mut tables = Map::new();
    for (name, snapshot) in cache {
        let rows: Map<String, Value> = snapshot
            .iter()
            .map(|(_, row)| (row.id.to_string(), Value::Object(row.fields.clone())))
            .collect();
        tables.insert(name.clone(), Value::Object(rows));
    }
    Value::Object(tables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(json!("eth0"), json!("eth0"))]
    #[case(json!(1500), json!(1500))]
    #[case(json!(["uuid", "a1b2"]), json!("a1b2"))]
    #[case(json!(["set", []]), json!(null))]
    #[case(json!(["set", ["a", "b"]]), json!(["a", "b"]))]
    #[case(json!(["map", [["k", "v"], ["n", 1]]]), json!({"k": "v", "n": 1}))]
    fn test_decode_datum(#[case] wire: Value, #[case] plain: Value) {
        assert_eq!(decode_datum(&wire), plain);
    }

    #[test]
    fn test_encode_datum() {
        assert_eq!(encode_datum(&json!(null)), json!(["set", []]));
        assert_eq!(encode_datum(&json!(["x"])), json!(["set", ["x"]]));
        assert_eq!(encode_datum(&json!(4.5)), json!(4.5));
    }

    #[test]
    fn test_decode_row_strips_bookkeeping() {
        let row = decode_row(&json!({
            "_uuid": ["uuid", "0b5c"],
            "_version": ["uuid", "ffff"],
            "name": "vm1",
            "ram": ["set", []],
            "pci_passthrough": "0000:01:00.0",
        }))
        .unwrap();

        assert_eq!(row.id, RowId::new("0b5c"));
        assert_eq!(row.name(), Some("vm1"));
        assert!(row.get("ram").is_none());
        assert!(!row.fields.contains_key("_version"));
        assert_eq!(row.get("pci_passthrough"), Some(&json!("0000:01:00.0")));
    }

    #[test]
    fn test_decode_row_requires_uuid() {
        assert!(decode_row(&json!({"name": "x"})).is_err());
    }

    #[test]
    fn test_select_request_shape() {
        let request = select_request("Edge", &["Interface".to_string(), "System".to_string()]);
        assert_eq!(
            request,
            json!([
                "Edge",
                {"op": "select", "table": "Interface", "where": []},
                {"op": "select", "table": "System", "where": []},
            ])
        );
    }

    #[test]
    fn test_transact_request_shape() {
        let mut fields = Map::new();
        fields.insert("cpu_load".to_string(), json!(0.7));
        fields.insert("temp".to_string(), Value::Null);

        let mut txn = Transaction::new();
        txn.insert("Telemetry", fields.clone())
            .update("Telemetry", RowId::new("u-1"), fields);

        let request = transact_request("Edge", &txn);
        assert_eq!(request[0], json!("Edge"));
        assert_eq!(request[1]["op"], json!("insert"));
        assert_eq!(request[1]["row"], json!({"cpu_load": 0.7}));
        assert_eq!(request[2]["op"], json!("update"));
        assert_eq!(request[2]["where"], json!([["_uuid", "==", ["uuid", "u-1"]]]));
        assert_eq!(request[2]["row"], json!({"cpu_load": 0.7, "temp": ["set", []]}));
    }

    #[test]
    fn test_commit_status_mapping() {
        let mut txn = Transaction::new();
        txn.update("Telemetry", RowId::new("u-1"), {
            let mut m = Map::new();
            m.insert("temp".to_string(), json!(40.0));
            m
        });

        assert_eq!(commit_status(&txn, &[json!({"count": 1})]), CommitStatus::Success);
        assert_eq!(commit_status(&txn, &[json!({"count": 0})]), CommitStatus::TryAgain);
        assert_eq!(
            commit_status(
                &txn,
                &[json!({"error": "constraint violation", "details": "bad temp"})]
            ),
            CommitStatus::Error("constraint violation: bad temp".to_string())
        );
        assert!(matches!(commit_status(&txn, &[]), CommitStatus::Error(_)));
    }

    #[test]
    fn test_decode_select_builds_snapshots() {
        let tables = vec!["Interface".to_string()];
        let results = vec![json!({"rows": [
            {"_uuid": ["uuid", "u1"], "name": "eth0", "mtu": 9000},
            {"_uuid": ["uuid", "u2"], "name": "br0", "mtu": ["set", []]},
        ]})];

        let cache = decode_select(&tables, &results).unwrap();
        let interfaces = &cache["Interface"];
        assert_eq!(interfaces.len(), 2);
        assert_eq!(interfaces.get("eth0").unwrap().get("mtu"), Some(&json!(9000)));
        assert!(interfaces.get("br0").unwrap().get("mtu").is_none());
    }

    #[tokio::test]
    async fn test_connect_fails_without_schema() {
        let dir = tempfile::tempdir().unwrap();
        let config = OvsdbConfig::default().with_schema(dir.path().join("missing.ovsschema"));
        let err = OvsdbCliStore::connect(config).await.err().unwrap();
        assert!(matches!(err, StoreError::SchemaMissing(_)));
    }

    #[tokio::test]
    async fn test_connect_fails_when_client_missing() {
        let mut config = OvsdbConfig::default();
        config.client_bin = PathBuf::from("/nonexistent/ovsdb-client");
        let err = OvsdbCliStore::connect(config).await.err().unwrap();
        assert!(matches!(err, StoreError::Unreachable { .. }));
    }
}
