//! Reconciliation loop primitives.
//!
//! Every host domain (network, storage, VMs, telemetry) runs the same loop:
//!
//! 1. Advance the store client.
//! 2. If the change version moved, snapshot the domain's tables and hand the
//!    snapshot to the domain's [`Domain::sync`].
//! 3. Block on the store until the next change or the poll interval.
//!
//! # Invariants
//!
//! - All domain operations are idempotent; `sync` runs on every observed
//!   version, not on individual row changes.
//! - A failing row never aborts the rest of the snapshot, and a failing store
//!   call never terminates the loop.
//! - Only an external shutdown signal stops [`ReconcileLoop::run`]; a pass
//!   that already started runs to completion.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use edge_schema::TableRow;
use edge_store::{ChangeVersion, Decoded, StoreClient, StoreError, TableSnapshot, TypedRow};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

mod report;

pub use report::{RowFailure, RowSkip, SyncReport};

/// Poll interval for the network, storage and VM domains.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(2);

/// Poll interval for the telemetry domain.
pub const TELEMETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The store could not be advanced or read.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// The tables a domain consumes, captured at one change version.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    version: ChangeVersion,
    tables: BTreeMap<String, TableSnapshot>,
}

impl Snapshot {
    pub fn new(version: ChangeVersion) -> Self {
        Self {
            version,
            tables: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_table(mut self, table: TableSnapshot) -> Self {
        self.tables.insert(table.table().to_string(), table);
        self
    }

    pub fn version(&self) -> ChangeVersion {
        self.version
    }

    pub fn table(&self, name: &str) -> Option<&TableSnapshot> {
        self.tables.get(name)
    }

    /// Decoded rows of `T`'s table; empty if the table is not in the snapshot.
    pub fn typed<T: TableRow>(&self) -> Vec<TypedRow<T>> {
        self.table(T::TABLE)
            .map(TableSnapshot::typed::<T>)
            .unwrap_or_default()
    }

    /// Decoded rows of `T`'s table together with the rows that failed.
    pub fn decode<T: TableRow>(&self) -> Decoded<T> {
        match self.table(T::TABLE) {
            Some(table) => table.decode::<T>(),
            None => Decoded {
                rows: Vec::new(),
                rejected: Vec::new(),
            },
        }
    }

    /// The decoded singleton row of `T`'s table.
    pub fn singleton<T: TableRow>(&self) -> Option<TypedRow<T>> {
        self.table(T::TABLE).and_then(TableSnapshot::singleton::<T>)
    }
}

/// A host domain driven by the loop.
#[async_trait]
pub trait Domain: Send {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Store tables this domain reads.
    fn tables(&self) -> &'static [&'static str];

    /// Whether to sync on every tick instead of only on version changes.
    fn sync_every_tick(&self) -> bool {
        false
    }

    /// Converge host state towards `snapshot`.
    ///
    /// The store is passed for domains that publish back to it.
    async fn sync(&mut self, snapshot: &Snapshot, store: &mut dyn StoreClient) -> SyncReport;
}

/// Result of a single loop iteration.
#[derive(Debug)]
pub enum TickOutcome {
    /// Nothing changed since the last pass.
    Idle,
    /// The domain ran a sync pass.
    Synced(SyncReport),
    /// The store could not be advanced or read; retried next tick.
    Failed(ReconcileError),
}

/// One domain's reconciliation loop.
pub struct ReconcileLoop<S, D> {
    store: S,
    domain: D,
    interval: Duration,
    last_version: Option<ChangeVersion>,
}

impl<S: StoreClient, D: Domain> ReconcileLoop<S, D> {
    pub fn new(store: S, domain: D, interval: Duration) -> Self {
        Self {
            store,
            domain,
            interval,
            last_version: None,
        }
    }

    pub fn domain(&self) -> &D {
        &self.domain
    }

    pub fn domain_mut(&mut self) -> &mut D {
        &mut self.domain
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Version of the last snapshot handed to the domain.
    pub fn last_version(&self) -> Option<ChangeVersion> {
        self.last_version
    }

    /// Perform one iteration without blocking on the store.
    pub async fn tick(&mut self) -> TickOutcome {
        let domain = self.domain.name();

        if let Err(e) = self.store.run().await {
            warn!(domain, error = %e, "Store update failed, will retry");
            return TickOutcome::Failed(e.into());
        }

        let version = self.store.change_version();
        if self.last_version == Some(version) && !self.domain.sync_every_tick() {
            return TickOutcome::Idle;
        }

        let snapshot = match self.snapshot(version) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(domain, error = %e, "Failed to read tables, will retry");
                return TickOutcome::Failed(e.into());
            }
        };

        debug!(domain, version = %version, "Syncing snapshot");
        let report = self.domain.sync(&snapshot, &mut self.store).await;
        self.last_version = Some(version);

        if report.is_clean() {
            debug!(
                domain,
                version = %version,
                applied = report.applied,
                skipped = report.skipped.len(),
                "Sync pass complete"
            );
        } else {
            warn!(
                domain,
                version = %version,
                applied = report.applied,
                failed = ?report.failed_keys(),
                "Sync pass finished with failures"
            );
        }

        TickOutcome::Synced(report)
    }

    fn snapshot(&self, version: ChangeVersion) -> Result<Snapshot, StoreError> {
        let mut snapshot = Snapshot::new(version);
        for table in self.domain.tables() {
            snapshot = snapshot.with_table(self.store.table(table)?);
        }
        Ok(snapshot)
    }

    /// Run until `shutdown` turns true.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        let domain = self.domain.name();
        let interval = self.interval;
        info!(
            domain,
            interval = ?interval,
            "Starting reconciliation loop"
        );

        while !*shutdown.borrow() {
            self.tick().await;

            tokio::select! {
                _ = self.store.wait_for_change(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(domain, "Reconciliation loop shutting down");
    }
}
