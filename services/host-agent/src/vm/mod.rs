//! Virtual machine domain.
//!
//! The [`VmSupervisor`] owns every hypervisor process it spawned and converges
//! that set towards the `VirtualMachine` table:
//!
//! ```text
//! Absent ──start──▶ Starting ──console──▶ Running ──stop──▶ Stopping ──▶ Stopped
//!                                            │                             ▲
//!                                            └──────── process exits ──────┘
//! ```
//!
//! States are derived on demand from the tracked handle, a non-blocking
//! liveness check and whether the guest has written to its console yet;
//! nothing else records them.

use std::io;

use thiserror::Error;

mod cgroup;
mod console;
mod launch;
mod process;
mod supervisor;

pub use cgroup::assign_cgroup;
pub use console::{ConsoleBuffer, CONSOLE_LINES};
pub use launch::LaunchCommand;
pub use process::{Launched, MockHandle, MockLauncher, QemuLauncher, VmLauncher, VmProcess};
pub use supervisor::{StopOutcome, SupervisorConfig, VmState, VmSupervisor, VM_TABLES};

#[derive(Debug, Error)]
pub enum VmError {
    #[error("VM {0} has no disk_path")]
    MissingDisk(String),

    #[error("failed to launch VM {name}: {source}")]
    Launch { name: String, source: io::Error },
}
