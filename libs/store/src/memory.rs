//! In-process store replica.
//!
//! `MemoryStore` behaves like a store client attached to a local database:
//! writes made through any clone become visible to every clone on its next
//! [`run`](crate::StoreClient::run). Tests use the inspection and
//! fault-injection helpers to drive reconcilers without a store daemon.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::watch;

use crate::{
    ChangeVersion, CommitStatus, Row, RowId, StoreClient, StoreError, TableSnapshot, Transaction,
    TxnOp,
};

#[derive(Debug, Default)]
struct State {
    tables: BTreeMap<String, BTreeMap<RowId, Map<String, Value>>>,
    next_id: u64,
    failing_runs: u32,
    forced_status: Option<CommitStatus>,
    commits: Vec<Transaction>,
}

impl State {
    fn allocate_id(&mut self) -> RowId {
        self.next_id += 1;
        RowId::new(format!("{:08x}-0000-4000-8000-{:012x}", self.next_id, self.next_id))
    }
}

#[derive(Debug)]
struct Shared {
    state: Mutex<State>,
    version: watch::Sender<u64>,
}

/// In-memory store shared between clones.
#[derive(Debug)]
pub struct MemoryStore {
    shared: Arc<Shared>,
    version_rx: watch::Receiver<u64>,
    seen: ChangeVersion,
    replica: BTreeMap<String, TableSnapshot>,
}

impl MemoryStore {
    /// Create a store holding the given (empty) tables.
    pub fn new(tables: &[&str]) -> Self {
        let state = State {
            tables: tables
                .iter()
                .map(|t| (t.to_string(), BTreeMap::new()))
                .collect(),
            ..Default::default()
        };
        let (version, version_rx) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                version,
            }),
            version_rx,
            seen: ChangeVersion::default(),
            replica: BTreeMap::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) {
        self.shared.version.send_modify(|v| *v += 1);
    }

    /// Insert a row directly, bypassing transactions.
    pub fn insert_row(&self, table: &str, fields: Value) -> RowId {
        let id = {
            let mut state = self.state();
            let id = state.allocate_id();
            state
                .tables
                .entry(table.to_string())
                .or_default()
                .insert(id.clone(), into_map(fields));
            id
        };
        self.bump();
        id
    }

    /// Merge columns into an existing row. Returns false if the row is gone.
    pub fn update_row(&self, table: &str, id: &RowId, fields: Value) -> bool {
        let updated = {
            let mut state = self.state();
            match state.tables.get_mut(table).and_then(|rows| rows.get_mut(id)) {
                Some(row) => {
                    row.extend(into_map(fields));
                    true
                }
                None => false,
            }
        };
        if updated {
            self.bump();
        }
        updated
    }

    /// Delete a row. Returns false if it did not exist.
    pub fn remove_row(&self, table: &str, id: &RowId) -> bool {
        let removed = self
            .state()
            .tables
            .get_mut(table)
            .and_then(|rows| rows.remove(id))
            .is_some();
        if removed {
            self.bump();
        }
        removed
    }

    /// Current committed rows of a table, regardless of what this clone has seen.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.state()
            .tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .map(|(id, fields)| Row::new(id.clone(), fields.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Make the next `count` calls to `run` fail as if the store were down.
    pub fn fail_next_runs(&self, count: u32) {
        self.state().failing_runs = count;
    }

    /// Answer every subsequent commit with `status` without applying it.
    pub fn force_commit_status(&self, status: CommitStatus) {
        self.state().forced_status = Some(status);
    }

    /// Every transaction submitted so far, in order.
    pub fn commits(&self) -> Vec<Transaction> {
        self.state().commits.clone()
    }

    fn apply(state: &mut State, txn: &Transaction) -> CommitStatus {
        // Validate first so a failed transaction leaves nothing behind.
        for op in txn.ops() {
            let exists = match op {
                TxnOp::Insert { table, .. } => state.tables.contains_key(table),
                TxnOp::Update { table, id, .. } => state
                    .tables
                    .get(table)
                    .is_some_and(|rows| rows.contains_key(id)),
            };
            if !exists {
                return match op {
                    TxnOp::Insert { table, .. } => {
                        CommitStatus::Error(format!("unknown table {table}"))
                    }
                    TxnOp::Update { .. } => CommitStatus::TryAgain,
                };
            }
        }

        for op in txn.ops() {
            match op {
                TxnOp::Insert { table, fields } => {
                    let id = state.allocate_id();
                    if let Some(rows) = state.tables.get_mut(table) {
                        rows.insert(id, fields.clone());
                    }
                }
                TxnOp::Update { table, id, fields } => {
                    if let Some(row) = state.tables.get_mut(table).and_then(|r| r.get_mut(id)) {
                        row.extend(fields.clone());
                    }
                }
            }
        }
        CommitStatus::Success
    }
}

impl Clone for MemoryStore {
    /// Attach another client to the same store. The clone starts with its
    /// own empty replica.
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            version_rx: self.shared.version.subscribe(),
            seen: ChangeVersion::default(),
            replica: BTreeMap::new(),
        }
    }
}

#[async_trait]
impl StoreClient for MemoryStore {
    async fn run(&mut self) -> Result<(), StoreError> {
        let tables = {
            let mut state = self.state();
            if state.failing_runs > 0 {
                state.failing_runs -= 1;
                return Err(StoreError::Unreachable {
                    remote: "memory".to_string(),
                    detail: "injected failure".to_string(),
                });
            }
            state
                .tables
                .iter()
                .map(|(name, rows)| {
                    let snapshot = TableSnapshot::from_rows(
                        name.clone(),
                        rows.iter()
                            .map(|(id, fields)| Row::new(id.clone(), fields.clone())),
                    );
                    (name.clone(), snapshot)
                })
                .collect()
        };
        let version = *self.version_rx.borrow_and_update();
        self.replica = tables;
        self.seen = ChangeVersion::new(version);
        Ok(())
    }

    fn change_version(&self) -> ChangeVersion {
        self.seen
    }

    fn table(&self, name: &str) -> Result<TableSnapshot, StoreError> {
        self.replica
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::UnknownTable(name.to_string()))
    }

    async fn commit(&mut self, txn: Transaction) -> Result<CommitStatus, StoreError> {
        let status = {
            let mut state = self.state();
            state.commits.push(txn.clone());
            if let Some(forced) = state.forced_status.clone() {
                return Ok(forced);
            }
            if txn.is_empty() {
                return Ok(CommitStatus::Unchanged);
            }
            Self::apply(&mut state, &txn)
        };
        if status == CommitStatus::Success {
            self.bump();
        }
        Ok(status)
    }

    async fn wait_for_change(&mut self, timeout: Duration) {
        if *self.version_rx.borrow() != self.seen.get() {
            return;
        }
        let _ = tokio::time::timeout(timeout, self.version_rx.changed()).await;
    }
}

fn into_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_changes_visible_after_run() {
        let mut client = MemoryStore::new(&["Interface"]);
        let admin = client.clone();

        client.run().await.unwrap();
        let v0 = client.change_version();
        assert!(client.table("Interface").unwrap().is_empty());

        admin.insert_row("Interface", json!({"name": "eth0"}));
        // Not visible until the client advances.
        assert!(client.table("Interface").unwrap().is_empty());

        client.run().await.unwrap();
        assert_ne!(client.change_version(), v0);
        assert!(client.table("Interface").unwrap().get("eth0").is_some());
    }

    #[tokio::test]
    async fn test_unknown_table() {
        let mut client = MemoryStore::new(&["Interface"]);
        client.run().await.unwrap();
        assert!(matches!(
            client.table("Nope"),
            Err(StoreError::UnknownTable(t)) if t == "Nope"
        ));
    }

    #[tokio::test]
    async fn test_commit_insert_then_update() {
        let mut client = MemoryStore::new(&["Telemetry"]);
        let mut txn = Transaction::new();
        txn.insert("Telemetry", into_map(json!({"cpu_load": 0.1})));
        assert_eq!(client.commit(txn).await.unwrap(), CommitStatus::Success);

        let id = client.rows("Telemetry")[0].id.clone();
        let mut txn = Transaction::new();
        txn.update("Telemetry", id, into_map(json!({"temp": 41.5})));
        assert_eq!(client.commit(txn).await.unwrap(), CommitStatus::Success);

        let rows = client.rows("Telemetry");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("cpu_load"), Some(&json!(0.1)));
        assert_eq!(rows[0].get("temp"), Some(&json!(41.5)));
    }

    #[tokio::test]
    async fn test_update_of_missing_row_is_try_again() {
        let mut client = MemoryStore::new(&["Telemetry"]);
        let mut txn = Transaction::new();
        txn.update("Telemetry", RowId::new("gone"), into_map(json!({"temp": 1.0})));
        assert_eq!(client.commit(txn).await.unwrap(), CommitStatus::TryAgain);
    }

    #[tokio::test]
    async fn test_injected_run_failures() {
        let mut client = MemoryStore::new(&["VirtualMachine"]);
        client.fail_next_runs(1);
        assert!(client.run().await.is_err());
        assert!(client.run().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_returns_on_change() {
        let mut client = MemoryStore::new(&["Interface"]);
        client.run().await.unwrap();
        let admin = client.clone();

        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            admin.insert_row("Interface", json!({"name": "eth0"}));
        });

        let started = tokio::time::Instant::now();
        client.wait_for_change(Duration::from_secs(30)).await;
        assert!(started.elapsed() < Duration::from_secs(30));
        writer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_without_change() {
        let mut client = MemoryStore::new(&["Interface"]);
        client.run().await.unwrap();

        let started = tokio::time::Instant::now();
        client.wait_for_change(Duration::from_secs(2)).await;
        assert!(started.elapsed() >= Duration::from_secs(2));
    }
}
