//! Storage domain: iSCSI login, device discovery and mount.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use edge_reconcile::{Domain, Snapshot, SyncReport};
use edge_schema::{SchemaError, StorageSpec};
use edge_store::StoreClient;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::command::{run_checked, CommandError, CommandRunner, CommandSpec};

/// Tables consumed by the storage domain.
pub const STORAGE_TABLES: &[&str] = &["Storage"];

/// Where udev publishes iSCSI block devices.
pub const DEFAULT_BY_PATH_DIR: &str = "/dev/disk/by-path";

/// Port appended to portals given without one.
pub const ISCSI_PORT: u16 = 3260;

/// `iscsiadm` exit status for "session already present".
const ISCSI_ERR_SESS_EXISTS: i32 = 15;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Invalid(#[from] SchemaError),

    #[error("device {} did not appear after {attempts} attempts", path.display())]
    DeviceTimeout { path: PathBuf, attempts: u32 },

    #[error("failed to create mount point {}: {source}", path.display())]
    MountPoint { path: PathBuf, source: io::Error },

    #[error("mount failed: {0}")]
    Mount(#[source] CommandError),
}

/// What `attach` found or did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    Mounted,
    AlreadyMounted,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub by_path_dir: PathBuf,
    /// How many times to look for the block device after login.
    pub device_attempts: u32,
    pub device_poll_interval: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            by_path_dir: PathBuf::from(DEFAULT_BY_PATH_DIR),
            device_attempts: 5,
            device_poll_interval: Duration::from_secs(1),
        }
    }
}

/// Block device path udev creates for a LUN behind `portal`.
pub fn device_path(by_path_dir: &Path, portal: &str, iqn: &str, lun: u32) -> PathBuf {
    let portal = if has_port(portal) {
        portal.to_string()
    } else {
        format!("{portal}:{ISCSI_PORT}")
    };
    by_path_dir.join(format!("ip-{portal}-iscsi-{iqn}-lun-{lun}"))
}

fn has_port(portal: &str) -> bool {
    match portal.rsplit_once(':') {
        Some((host, port)) => {
            port.parse::<u16>().is_ok() && (!host.contains(':') || host.ends_with(']'))
        }
        None => false,
    }
}

pub struct StorageReconciler {
    runner: Arc<dyn CommandRunner>,
    config: StorageConfig,
}

impl StorageReconciler {
    pub fn new(runner: Arc<dyn CommandRunner>, config: StorageConfig) -> Self {
        Self { runner, config }
    }

    /// Log in, wait for the device and mount it.
    pub async fn attach(&self, spec: &StorageSpec) -> Result<AttachOutcome, StorageError> {
        let (iqn, portal) = spec.target()?;
        // target() succeeded, so a mount point can always be derived.
        let mount_point = PathBuf::from(spec.mount_point().unwrap_or_default());

        self.login(iqn, portal).await;

        let device = device_path(&self.config.by_path_dir, portal, iqn, spec.lun());
        self.wait_for_device(&device).await?;

        tokio::fs::create_dir_all(&mount_point)
            .await
            .map_err(|source| StorageError::MountPoint {
                path: mount_point.clone(),
                source,
            })?;
        // findmnt reports resolved paths without a trailing slash.
        let mount_point = tokio::fs::canonicalize(&mount_point)
            .await
            .map_err(|source| StorageError::MountPoint {
                path: mount_point.clone(),
                source,
            })?;

        if self.is_mounted(&device, &mount_point).await {
            debug!(
                device = %device.display(),
                mount_point = %mount_point.display(),
                "Already mounted"
            );
            return Ok(AttachOutcome::AlreadyMounted);
        }

        let mount = CommandSpec::new("mount")
            .arg(device.to_string_lossy())
            .arg(mount_point.to_string_lossy());
        run_checked(self.runner.as_ref(), &mount)
            .await
            .map_err(StorageError::Mount)?;

        info!(device = %device.display(), mount_point = %mount_point.display(), "Mounted");
        Ok(AttachOutcome::Mounted)
    }

    /// A failed login is not fatal: the device may still exist from an
    /// earlier session.
    async fn login(&self, iqn: &str, portal: &str) {
        let cmd = CommandSpec::new("iscsiadm")
            .args(["-m", "node", "-T", iqn, "-p", portal, "--login"]);
        let output = self.runner.run(&cmd).await;
        match output.code {
            Some(0) => info!(target_iqn = iqn, portal, "iSCSI login complete"),
            Some(ISCSI_ERR_SESS_EXISTS) => debug!(target_iqn = iqn, portal, "iSCSI session exists"),
            _ => warn!(
                target_iqn = iqn,
                portal,
                code = ?output.code,
                output = %output.output.trim(),
                "iSCSI login failed"
            ),
        }
    }

    async fn wait_for_device(&self, device: &Path) -> Result<(), StorageError> {
        let attempts = self.config.device_attempts.max(1);
        for attempt in 1..=attempts {
            if tokio::fs::try_exists(device).await.unwrap_or(false) {
                return Ok(());
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.device_poll_interval).await;
            }
        }
        Err(StorageError::DeviceTimeout {
            path: device.to_path_buf(),
            attempts,
        })
    }

    async fn is_mounted(&self, device: &Path, mount_point: &Path) -> bool {
        let cmd = CommandSpec::new("findmnt")
            .args(["-n", "-o", "TARGET", "--source"])
            .arg(device.to_string_lossy());
        let output = self.runner.run(&cmd).await;
        let wanted = mount_point.to_string_lossy();
        output.success() && output.lines().any(|line| line == wanted)
    }
}

#[async_trait]
impl Domain for StorageReconciler {
    fn name(&self) -> &'static str {
        "storage"
    }

    fn tables(&self) -> &'static [&'static str] {
        STORAGE_TABLES
    }

    async fn sync(&mut self, snapshot: &Snapshot, _store: &mut dyn StoreClient) -> SyncReport {
        let mut report = SyncReport::new();
        for row in snapshot.typed::<StorageSpec>() {
            match self.attach(&row.value).await {
                Ok(_) => report.record_applied(),
                Err(StorageError::Invalid(e)) => {
                    warn!(row = %row.key, error = %e, "Skipping storage row");
                    report.record_skipped(row.key, e);
                }
                Err(e) => {
                    warn!(row = %row.key, error = %e, "Failed to attach storage");
                    report.record_failure(row.key, e);
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("192.168.1.10", "ip-192.168.1.10:3260-iscsi-iqn.2024-01.lab:disk1-lun-0")]
    #[case("192.168.1.10:3261", "ip-192.168.1.10:3261-iscsi-iqn.2024-01.lab:disk1-lun-0")]
    #[case("[fd00::1]:3260", "ip-[fd00::1]:3260-iscsi-iqn.2024-01.lab:disk1-lun-0")]
    fn test_device_path(#[case] portal: &str, #[case] file: &str) {
        let path = device_path(Path::new("/dev/disk/by-path"), portal, "iqn.2024-01.lab:disk1", 0);
        assert_eq!(path, Path::new("/dev/disk/by-path").join(file));
    }

    #[test]
    fn test_bare_ipv6_gets_default_port() {
        assert!(!has_port("fd00::1"));
        assert!(has_port("[fd00::1]:3260"));
        assert!(!has_port("host.example"));
    }
}
