//! Host-wide settings from the System table.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use edge_reconcile::SyncReport;
use edge_schema::{LogLevel, SystemSettings};
use tracing::{info, warn};

use crate::command::{run_checked, CommandRunner, CommandSpec};
use crate::logging::LogLevelControl;

/// Applies hostname, timezone and log level.
pub struct SystemApplier {
    runner: Arc<dyn CommandRunner>,
    timezone_file: PathBuf,
    log_control: Option<Arc<dyn LogLevelControl>>,
    applied_level: Option<LogLevel>,
}

impl SystemApplier {
    pub fn new(runner: Arc<dyn CommandRunner>, timezone_file: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            timezone_file: timezone_file.into(),
            log_control: None,
            applied_level: None,
        }
    }

    #[must_use]
    pub fn with_log_control(mut self, control: Arc<dyn LogLevelControl>) -> Self {
        self.log_control = Some(control);
        self
    }

    /// Apply every setting present in `settings`.
    pub async fn apply(&mut self, settings: &SystemSettings, report: &mut SyncReport) {
        if let Some(hostname) = non_empty(&settings.hostname) {
            let cmd = CommandSpec::new("hostname").arg(hostname);
            match run_checked(self.runner.as_ref(), &cmd).await {
                Ok(_) => report.record_applied(),
                Err(e) => {
                    warn!(hostname, error = %e, "Failed to set hostname");
                    report.record_failure("System.hostname", e);
                }
            }
        }

        if let Some(timezone) = non_empty(&settings.timezone) {
            match self.write_timezone(timezone).await {
                Ok(changed) => {
                    if changed {
                        info!(timezone, path = %self.timezone_file.display(), "Timezone updated");
                    }
                    report.record_applied();
                }
                Err(e) => {
                    warn!(timezone, error = %e, "Failed to write timezone");
                    report.record_failure("System.timezone", e);
                }
            }
        }

        if let Some(level) = settings.logging_level {
            self.apply_level(level, report);
        }
    }

    /// Returns whether the file content changed.
    async fn write_timezone(&self, timezone: &str) -> io::Result<bool> {
        let content = format!("{timezone}\n");
        match tokio::fs::read_to_string(&self.timezone_file).await {
            Ok(current) if current == content => return Ok(false),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        tokio::fs::write(&self.timezone_file, content).await?;
        Ok(true)
    }

    fn apply_level(&mut self, level: LogLevel, report: &mut SyncReport) {
        if self.applied_level == Some(level) {
            return;
        }
        let Some(control) = &self.log_control else {
            return;
        };
        match control.set_level(level) {
            Ok(()) => {
                info!(level = %level, "Log level changed");
                self.applied_level = Some(level);
                report.record_applied();
            }
            Err(e) => {
                warn!(level = %level, error = %e, "Failed to change log level");
                report.record_failure("System.logging_level", e);
            }
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}
