//! Edge host agents.
//!
//! One process per domain keeps a slice of the host converged with the
//! desired state in the store:
//!
//! - **net**: bridge membership, VLAN, MTU, link state and addresses of
//!   interfaces, plus hostname, timezone and log level
//! - **storage**: iSCSI login and mount of remote block devices
//! - **vm**: hypervisor processes, one per desired VM
//! - **stat**: host metrics published back into the store
//!
//! Each domain implements [`edge_reconcile::Domain`] and runs inside an
//! [`edge_reconcile::ReconcileLoop`]. Host changes go through
//! [`command::CommandRunner`] and [`vm::VmLauncher`], which have recording
//! fakes for tests.

pub mod command;
pub mod config;
pub mod logging;
pub mod network;
pub mod storage;
pub mod system;
pub mod telemetry;
pub mod vm;

pub use command::{CommandRunner, RecordingRunner, SystemRunner};
pub use config::Config;
pub use network::NetworkReconciler;
pub use storage::{StorageConfig, StorageReconciler};
pub use system::SystemApplier;
pub use telemetry::{HostMetrics, TelemetryPublisher};
pub use vm::{MockLauncher, QemuLauncher, VmSupervisor};
