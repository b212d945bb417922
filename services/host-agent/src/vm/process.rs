//! Hypervisor process handles.
//!
//! [`QemuLauncher`] spawns real processes; [`MockLauncher`] hands out fake
//! ones whose exit is controlled by the test.

use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::console::{pump, ConsoleBuffer};
use super::launch::LaunchCommand;

/// An owned hypervisor process.
#[async_trait]
pub trait VmProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Non-blocking liveness check. True once the exit status is known.
    fn has_exited(&mut self) -> bool;

    /// Ask the process to shut down (SIGTERM).
    fn terminate(&mut self) -> io::Result<()>;

    /// Force the process down (SIGKILL). Does not wait.
    fn kill(&mut self) -> io::Result<()>;

    /// Wait for the process to exit and reap it.
    async fn wait(&mut self) -> io::Result<()>;
}

/// A freshly spawned VM.
pub struct Launched {
    pub process: Box<dyn VmProcess>,
    pub console: ConsoleBuffer,
}

/// Spawns hypervisor processes.
pub trait VmLauncher: Send + Sync {
    fn launch(&self, command: &LaunchCommand) -> io::Result<Launched>;
}

/// Launches QEMU with its console captured.
#[derive(Debug, Clone, Copy, Default)]
pub struct QemuLauncher;

impl VmLauncher for QemuLauncher {
    fn launch(&self, command: &LaunchCommand) -> io::Result<Launched> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let console = ConsoleBuffer::default();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, console.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, console.clone()));
        }

        Ok(Launched {
            process: Box::new(QemuProcess { child }),
            console,
        })
    }
}

struct QemuProcess {
    child: Child,
}

#[async_trait]
impl VmProcess for QemuProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn has_exited(&mut self) -> bool {
        exit_observed(self.pid(), self.child.try_wait())
    }

    fn terminate(&mut self) -> io::Result<()> {
        let Some(pid) = self.child.id() else {
            // Already reaped.
            return Ok(());
        };
        let pid = i32::try_from(pid).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        signal::kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(io::Error::from)
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    async fn wait(&mut self) -> io::Result<()> {
        let status = self.child.wait().await?;
        debug!(status = %status, "Hypervisor process reaped");
        Ok(())
    }
}

/// Only a collected exit status counts as exited. A failed check keeps the
/// process tracked so it is never launched twice.
fn exit_observed(pid: Option<u32>, status: io::Result<Option<ExitStatus>>) -> bool {
    match status {
        Ok(Some(_)) => true,
        Ok(None) => false,
        Err(e) => {
            warn!(pid = ?pid, error = %e, "Failed to check hypervisor process, assuming alive");
            false
        }
    }
}

/// Test view of a process handed out by [`MockLauncher`].
#[derive(Clone)]
pub struct MockHandle {
    pub name: String,
    pub pid: u32,
    exited: Arc<watch::Sender<bool>>,
    terminated: Arc<AtomicBool>,
    killed: Arc<AtomicBool>,
}

impl MockHandle {
    /// Whether SIGTERM was sent.
    pub fn terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Whether SIGKILL was sent.
    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Make the process exit on its own, as a crashed guest would.
    pub fn exit(&self) {
        self.exited.send_replace(true);
    }
}

struct MockProcess {
    handle: MockHandle,
    ignore_sigterm: bool,
}

#[async_trait]
impl VmProcess for MockProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.handle.pid)
    }

    fn has_exited(&mut self) -> bool {
        self.handle.has_exited()
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.handle.terminated.store(true, Ordering::SeqCst);
        if !self.ignore_sigterm {
            self.handle.exit();
        }
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        self.handle.killed.store(true, Ordering::SeqCst);
        self.handle.exit();
        Ok(())
    }

    async fn wait(&mut self) -> io::Result<()> {
        let mut rx = self.handle.exited.subscribe();
        rx.wait_for(|exited| *exited)
            .await
            .map(|_| ())
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))
    }
}

#[derive(Default)]
struct MockState {
    launches: Vec<LaunchCommand>,
    handles: Vec<MockHandle>,
    next_pid: u32,
}

/// Launcher that records commands and hands out fake processes.
#[derive(Clone, Default)]
pub struct MockLauncher {
    state: Arc<Mutex<MockState>>,
    ignore_sigterm: bool,
    fail: bool,
    silent: bool,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Processes that only go down on SIGKILL.
    pub fn ignoring_sigterm() -> Self {
        Self {
            ignore_sigterm: true,
            ..Self::default()
        }
    }

    /// Processes that never write to their console.
    pub fn silent() -> Self {
        Self {
            silent: true,
            ..Self::default()
        }
    }

    /// Every launch fails as if the binary were missing.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn launch_count(&self) -> usize {
        self.lock().launches.len()
    }

    pub fn launches(&self) -> Vec<LaunchCommand> {
        self.lock().launches.clone()
    }

    /// Most recent process launched for `name`.
    pub fn process(&self, name: &str) -> Option<MockHandle> {
        self.lock()
            .handles
            .iter()
            .rev()
            .find(|h| h.name == name)
            .cloned()
    }
}

impl VmLauncher for MockLauncher {
    fn launch(&self, command: &LaunchCommand) -> io::Result<Launched> {
        let mut state = self.lock();
        state.launches.push(command.clone());
        if self.fail {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{}: not found", command.program.display()),
            ));
        }

        state.next_pid += 1;
        let handle = MockHandle {
            name: command.name.clone(),
            pid: 10_000 + state.next_pid,
            exited: Arc::new(watch::channel(false).0),
            terminated: Arc::new(AtomicBool::new(false)),
            killed: Arc::new(AtomicBool::new(false)),
        };
        state.handles.push(handle.clone());

        let console = ConsoleBuffer::default();
        if !self.silent {
            console.push(format!("booting {}", command.name));
        }

        Ok(Launched {
            process: Box::new(MockProcess {
                handle,
                ignore_sigterm: self.ignore_sigterm,
            }),
            console,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn sleep_command(secs: &str) -> LaunchCommand {
        LaunchCommand {
            name: "sleeper".to_string(),
            program: PathBuf::from("sleep"),
            args: vec![secs.to_string()],
        }
    }

    #[tokio::test]
    async fn test_qemu_launcher_terminate_and_reap() {
        let mut launched = QemuLauncher.launch(&sleep_command("30")).unwrap();
        assert!(launched.process.pid().is_some());
        assert!(!launched.process.has_exited());

        launched.process.terminate().unwrap();
        tokio::time::timeout(Duration::from_secs(5), launched.process.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(launched.process.has_exited());
    }

    #[tokio::test]
    async fn test_qemu_launcher_captures_console() {
        let command = LaunchCommand {
            name: "echo".to_string(),
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), "echo booted; echo oops >&2".to_string()],
        };
        let mut launched = QemuLauncher.launch(&command).unwrap();
        launched.process.wait().await.unwrap();

        // Reader tasks finish shortly after the pipes close.
        for _ in 0..50 {
            if launched.console.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let mut lines = launched.console.lines();
        lines.sort();
        assert_eq!(lines, vec!["booted", "oops"]);
    }

    #[tokio::test]
    async fn test_invalid_console_bytes_do_not_kill_guest() {
        let command = LaunchCommand {
            name: "noisy".to_string(),
            program: PathBuf::from("sh"),
            args: vec![
                "-c".to_string(),
                "printf '\\377\\n'; sleep 0.2; for i in 1 2 3; do echo line$i || exit 7; done; sleep 30"
                    .to_string(),
            ],
        };
        let mut launched = QemuLauncher.launch(&command).unwrap();

        for _ in 0..200 {
            if launched.console.len() == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            launched.console.lines(),
            vec!["\u{fffd}", "line1", "line2", "line3"]
        );
        assert!(!launched.process.has_exited());

        launched.process.kill().unwrap();
        launched.process.wait().await.unwrap();
    }

    #[test]
    fn test_failed_liveness_check_counts_as_alive() {
        use std::os::unix::process::ExitStatusExt;

        let err = io::Error::other("ECHILD");
        assert!(!exit_observed(Some(42), Err(err)));
        assert!(!exit_observed(Some(42), Ok(None)));
        assert!(exit_observed(None, Ok(Some(ExitStatus::from_raw(0)))));
    }

    #[tokio::test]
    async fn test_mock_process_lifecycle() {
        let launcher = MockLauncher::ignoring_sigterm();
        let mut launched = launcher.launch(&sleep_command("1")).unwrap();
        let handle = launcher.process("sleeper").unwrap();

        launched.process.terminate().unwrap();
        assert!(handle.terminated());
        assert!(!launched.process.has_exited());

        launched.process.kill().unwrap();
        launched.process.wait().await.unwrap();
        assert!(handle.killed());
        assert!(handle.has_exited());
    }

    #[test]
    fn test_failing_launcher_records_attempt() {
        let launcher = MockLauncher::failing();
        assert!(launcher.launch(&sleep_command("1")).is_err());
        assert_eq!(launcher.launch_count(), 1);
        assert!(launcher.process("sleeper").is_none());
    }
}
