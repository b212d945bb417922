use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use edge_reconcile::{Domain, Snapshot, SyncReport};
use edge_schema::{VmPowerState, VmSpec};
use edge_store::StoreClient;
use tracing::{debug, info, warn};

use super::{assign_cgroup, ConsoleBuffer, LaunchCommand, VmError, VmLauncher, VmProcess};
use crate::config::{DEFAULT_QEMU_BIN, DEFAULT_VM_CGROUP_PROCS, DEFAULT_VM_STOP_TIMEOUT};

/// Tables consumed by the VM domain.
pub const VM_TABLES: &[&str] = &["VirtualMachine"];

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub qemu_bin: PathBuf,
    pub cgroup_procs: PathBuf,
    /// How long SIGTERM is given before SIGKILL.
    pub stop_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            qemu_bin: PathBuf::from(DEFAULT_QEMU_BIN),
            cgroup_procs: PathBuf::from(DEFAULT_VM_CGROUP_PROCS),
            stop_timeout: DEFAULT_VM_STOP_TIMEOUT,
        }
    }
}

/// Observed lifecycle state of a VM name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// Not tracked.
    Absent,
    /// Tracked and alive, no console output yet.
    Starting,
    /// Tracked and alive.
    Running,
    /// SIGTERM sent, exit not yet confirmed.
    Stopping,
    /// Tracked but the process has exited.
    Stopped,
}

/// How a `stop` call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotTracked,
    /// The process had already exited; it was only untracked.
    AlreadyExited,
    /// Exited within the grace period after SIGTERM.
    Graceful,
    /// Needed SIGKILL.
    Forced,
}

struct TrackedVm {
    process: Box<dyn VmProcess>,
    console: ConsoleBuffer,
    stopping: bool,
}

/// Owner of every hypervisor process this agent spawned.
pub struct VmSupervisor {
    launcher: Arc<dyn VmLauncher>,
    config: SupervisorConfig,
    tracked: BTreeMap<String, TrackedVm>,
}

impl VmSupervisor {
    pub fn new(launcher: Arc<dyn VmLauncher>, config: SupervisorConfig) -> Self {
        Self {
            launcher,
            config,
            tracked: BTreeMap::new(),
        }
    }

    pub fn observe(&mut self, name: &str) -> VmState {
        let Some(vm) = self.tracked.get_mut(name) else {
            return VmState::Absent;
        };
        if vm.process.has_exited() {
            VmState::Stopped
        } else if vm.stopping {
            VmState::Stopping
        } else if vm.console.is_empty() {
            VmState::Starting
        } else {
            VmState::Running
        }
    }

    /// Tracked and its exit status not yet observed.
    pub fn is_running(&mut self, name: &str) -> bool {
        self.tracked
            .get_mut(name)
            .is_some_and(|vm| !vm.process.has_exited())
    }

    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    pub fn tracked_names(&self) -> Vec<String> {
        self.tracked.keys().cloned().collect()
    }

    pub fn pid(&self, name: &str) -> Option<u32> {
        self.tracked.get(name).and_then(|vm| vm.process.pid())
    }

    /// Recent console output of a tracked VM, oldest line first.
    pub fn console_tail(&self, name: &str) -> Option<Vec<String>> {
        self.tracked.get(name).map(|vm| vm.console.lines())
    }

    /// Launch `spec` unless it is already running.
    ///
    /// Returns whether a process was spawned.
    pub fn start(&mut self, spec: &VmSpec) -> Result<bool, VmError> {
        let name = spec.name.as_str();

        match self.observe(name) {
            VmState::Starting | VmState::Running | VmState::Stopping => {
                debug!(vm = name, "VM already running");
                return Ok(false);
            }
            VmState::Stopped => {
                info!(vm = name, "VM exited on its own, relaunching");
                self.tracked.remove(name);
            }
            VmState::Absent => {}
        }

        let command = LaunchCommand::for_vm(&self.config.qemu_bin, spec)?;
        debug!(vm = name, command = %command, "Starting VM");

        let launched = self
            .launcher
            .launch(&command)
            .map_err(|source| VmError::Launch {
                name: name.to_string(),
                source,
            })?;

        let pid = launched.process.pid();
        if let Some(pid) = pid {
            assign_cgroup(&self.config.cgroup_procs, pid);
        }
        info!(vm = name, pid = ?pid, "VM started");

        self.tracked.insert(
            name.to_string(),
            TrackedVm {
                process: launched.process,
                console: launched.console,
                stopping: false,
            },
        );
        Ok(true)
    }

    /// Stop a tracked VM: SIGTERM, bounded wait, then SIGKILL.
    ///
    /// The name is untracked whatever the outcome.
    pub async fn stop(&mut self, name: &str) -> StopOutcome {
        let grace = self.config.stop_timeout;
        let Some(vm) = self.tracked.get_mut(name) else {
            return StopOutcome::NotTracked;
        };

        if vm.process.has_exited() {
            info!(vm = name, "VM already exited");
            self.tracked.remove(name);
            return StopOutcome::AlreadyExited;
        }

        vm.stopping = true;
        info!(vm = name, pid = ?vm.process.pid(), "Stopping VM");
        if let Err(e) = vm.process.terminate() {
            warn!(vm = name, error = %e, "Failed to send SIGTERM");
        }

        let outcome = match tokio::time::timeout(grace, vm.process.wait()).await {
            Ok(Ok(())) => {
                info!(vm = name, "VM stopped");
                StopOutcome::Graceful
            }
            Ok(Err(e)) => {
                warn!(vm = name, error = %e, "Failed to wait for VM, sending SIGKILL");
                force_stop(name, vm.process.as_mut()).await
            }
            Err(_) => {
                warn!(
                    vm = name,
                    timeout_secs = grace.as_secs(),
                    "VM did not stop in time, sending SIGKILL"
                );
                force_stop(name, vm.process.as_mut()).await
            }
        };

        self.tracked.remove(name);
        outcome
    }

    /// Converge tracked processes towards `desired`.
    pub async fn sync(&mut self, desired: &[VmSpec]) -> SyncReport {
        self.sync_keeping(desired, &BTreeSet::new()).await
    }

    /// Like [`sync`](Self::sync), but tracked names in `keep` are left alone
    /// even without a desired spec. Used for rows that exist in the store
    /// but could not be read.
    pub async fn sync_keeping(&mut self, desired: &[VmSpec], keep: &BTreeSet<&str>) -> SyncReport {
        let desired: BTreeMap<&str, &VmSpec> = desired
            .iter()
            .filter(|spec| !spec.name.is_empty())
            .map(|spec| (spec.name.as_str(), spec))
            .collect();
        let mut report = SyncReport::new();

        for name in self.tracked_names() {
            if keep.contains(name.as_str()) && !desired.contains_key(name.as_str()) {
                debug!(vm = %name, "Desired row unreadable, leaving VM as is");
                continue;
            }
            let unwanted = desired
                .get(name.as_str())
                .is_none_or(|spec| spec.state == Some(VmPowerState::Stop));
            if unwanted {
                self.stop(&name).await;
                report.record_applied();
            }
        }

        for (name, spec) in desired {
            if spec.state != Some(VmPowerState::Run) {
                continue;
            }
            match self.start(spec) {
                Ok(true) => report.record_applied(),
                Ok(false) => {}
                Err(e @ VmError::MissingDisk(_)) => {
                    warn!(vm = name, error = %e, "Skipping VM");
                    report.record_skipped(name, e);
                }
                Err(e) => {
                    warn!(vm = name, error = %e, "Failed to start VM");
                    report.record_failure(name, e);
                }
            }
        }

        report
    }

    /// Stop every tracked VM.
    pub async fn shutdown_all(&mut self) {
        for name in self.tracked_names() {
            self.stop(&name).await;
        }
    }
}

async fn force_stop(name: &str, process: &mut dyn VmProcess) -> StopOutcome {
    if let Err(e) = process.kill() {
        warn!(vm = name, error = %e, "Failed to send SIGKILL");
    }
    if let Err(e) = process.wait().await {
        warn!(vm = name, error = %e, "Failed to reap VM process");
    }
    info!(vm = name, "VM killed");
    StopOutcome::Forced
}

#[async_trait]
impl Domain for VmSupervisor {
    fn name(&self) -> &'static str {
        "vm"
    }

    fn tables(&self) -> &'static [&'static str] {
        VM_TABLES
    }

    async fn sync(&mut self, snapshot: &Snapshot, _store: &mut dyn StoreClient) -> SyncReport {
        let decoded = snapshot.decode::<VmSpec>();
        let keep: BTreeSet<&str> = decoded.rejected_names().collect();
        let desired: Vec<VmSpec> = decoded.rows.iter().map(|row| row.value.clone()).collect();

        let mut report = self.sync_keeping(&desired, &keep).await;
        for row in &decoded.rejected {
            report.record_skipped(row.key.clone(), &row.error);
        }
        report
    }
}
