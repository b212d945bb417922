//! # edge-store
//!
//! Client port for the shared desired-state store.
//!
//! The store is a transactional, schema-driven database (OVSDB) reachable over
//! a local socket. Agents consume it as a capability:
//!
//! - **Advance**: [`StoreClient::run`] refreshes the local replica and moves
//!   the [`ChangeVersion`] when committed contents changed.
//! - **Read**: [`StoreClient::table`] returns a name-keyed [`TableSnapshot`]
//!   from the replica.
//! - **Write**: [`StoreClient::commit`] applies a [`Transaction`].
//! - **Block**: [`StoreClient::wait_for_change`] parks until the next change
//!   or a timeout.
//!
//! Two implementations are provided: [`OvsdbCliStore`], which drives the
//! `ovsdb-client` executable, and [`MemoryStore`], an in-process replica for
//! tests and local development.

use std::time::Duration;

use async_trait::async_trait;

mod digest;
mod error;
mod memory;
pub mod ovsdb;
mod snapshot;
mod txn;

pub use digest::ContentDigest;
pub use error::StoreError;
pub use memory::MemoryStore;
pub use ovsdb::{OvsdbCliStore, OvsdbConfig};
pub use snapshot::{ChangeVersion, Decoded, RejectedRow, Row, RowId, TableSnapshot, TypedRow};
pub use txn::{CommitStatus, Transaction, TxnOp};

/// Capability interface over the shared store.
#[async_trait]
pub trait StoreClient: Send {
    /// Process pending updates from the store.
    ///
    /// After this returns, [`change_version`](Self::change_version) reflects
    /// every change the client has seen.
    async fn run(&mut self) -> Result<(), StoreError>;

    /// Current change version of the local replica.
    fn change_version(&self) -> ChangeVersion;

    /// Snapshot of one table from the local replica.
    fn table(&self, name: &str) -> Result<TableSnapshot, StoreError>;

    /// Commit a transaction and block until the store answers.
    async fn commit(&mut self, txn: Transaction) -> Result<CommitStatus, StoreError>;

    /// Block until the store signals a change or `timeout` elapses.
    async fn wait_for_change(&mut self, timeout: Duration);
}
