//! External command execution.
//!
//! Host changes are made by running system tools (`ovs-vsctl`, `ip`,
//! `iscsiadm`, `mount`). Reconcilers go through [`CommandRunner`] so tests can
//! script the tools' answers with [`RecordingRunner`].

use std::fmt;
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// A program and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Exit status and merged stdout/stderr of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` if the program could not be started or was signalled.
    pub code: Option<i32>,
    pub output: String,
}

impl CommandOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            output: output.into(),
        }
    }

    pub fn failed(code: i32, output: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            output: output.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Non-empty trimmed output lines.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.output.lines().map(str::trim).filter(|l| !l.is_empty())
    }
}

/// Runs external commands to completion.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command`. Failing to start the program is reported as an output
    /// without an exit code, never as a panic or error.
    async fn run(&self, command: &CommandSpec) -> CommandOutput;
}

/// Runs commands on the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, command: &CommandSpec) -> CommandOutput {
        debug!(command = %command, "Running command");

        let result = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .output()
            .await;

        match result {
            Ok(output) => {
                let mut merged = String::from_utf8_lossy(&output.stdout).into_owned();
                merged.push_str(&String::from_utf8_lossy(&output.stderr));
                CommandOutput {
                    code: output.status.code(),
                    output: merged,
                }
            }
            Err(e) => CommandOutput {
                code: None,
                output: format!("failed to execute {}: {e}", command.program),
            },
        }
    }
}

/// A command that did not exit successfully.
#[derive(Debug, Clone, Error)]
#[error("`{command}` failed (exit {status}): {output}")]
pub struct CommandError {
    pub command: String,
    pub status: String,
    pub output: String,
}

/// Run `command` and turn anything but exit status 0 into an error.
pub async fn run_checked(
    runner: &dyn CommandRunner,
    command: &CommandSpec,
) -> Result<CommandOutput, CommandError> {
    let output = runner.run(command).await;
    if output.success() {
        return Ok(output);
    }
    Err(CommandError {
        command: command.to_string(),
        status: output
            .code
            .map_or_else(|| "none".to_string(), |c| c.to_string()),
        output: output.output.trim().to_string(),
    })
}

type Handler = dyn Fn(&CommandSpec) -> Option<CommandOutput> + Send + Sync;

/// Test runner that records every command.
///
/// Commands succeed with empty output unless the handler returns a scripted
/// answer for them.
pub struct RecordingRunner {
    calls: Mutex<Vec<CommandSpec>>,
    handler: Option<Box<Handler>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            handler: None,
        }
    }

    pub fn with_handler(
        handler: impl Fn(&CommandSpec) -> Option<CommandOutput> + Send + Sync + 'static,
    ) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            handler: Some(Box::new(handler)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<CommandSpec>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.lock().clone()
    }

    /// Recorded commands rendered as shell-like strings.
    pub fn rendered(&self) -> Vec<String> {
        self.lock().iter().map(ToString::to_string).collect()
    }

    /// Number of recorded commands starting with `prefix`.
    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.rendered()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl Default for RecordingRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, command: &CommandSpec) -> CommandOutput {
        self.lock().push(command.clone());
        self.handler
            .as_ref()
            .and_then(|handler| handler(command))
            .unwrap_or_else(|| CommandOutput::ok(""))
    }
}
