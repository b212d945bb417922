//! Telemetry domain: samples host metrics and publishes them to the
//! singleton `Telemetry` row.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use edge_reconcile::{Domain, Snapshot, SyncReport};
use edge_schema::{TableRow, TelemetryRecord};
use edge_store::{StoreClient, Transaction};
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Tables consumed by the telemetry domain.
pub const TELEMETRY_TABLES: &[&str] = &["Telemetry"];

/// One round of metric readings. Each reading is independent.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Sample {
    pub cpu_load: Option<f64>,
    pub temp: Option<f64>,
    pub ram_free: Option<i64>,
}

impl Sample {
    pub fn is_empty(&self) -> bool {
        self.cpu_load.is_none() && self.temp.is_none() && self.ram_free.is_none()
    }

    /// Columns for the readings that succeeded.
    pub fn fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        if let Some(load) = self.cpu_load {
            fields.insert("cpu_load".to_string(), Value::from(load));
        }
        if let Some(temp) = self.temp {
            fields.insert("temp".to_string(), Value::from(temp));
        }
        if let Some(ram) = self.ram_free {
            fields.insert("ram_free".to_string(), Value::from(ram));
        }
        fields
    }
}

/// Source of host metrics.
pub trait MetricSource: Send + Sync {
    /// One-minute load average.
    fn cpu_load(&self) -> Option<f64>;

    /// Temperature in degrees Celsius.
    fn temperature(&self) -> Option<f64>;

    /// Available memory in kB.
    fn ram_free_kb(&self) -> Option<i64>;

    fn sample(&self) -> Sample {
        Sample {
            cpu_load: self.cpu_load(),
            temp: self.temperature(),
            ram_free: self.ram_free_kb(),
        }
    }
}

/// Reads metrics from procfs and sysfs.
#[derive(Debug, Clone)]
pub struct HostMetrics {
    proc_root: PathBuf,
    thermal_root: PathBuf,
}

impl Default for HostMetrics {
    fn default() -> Self {
        Self::with_roots("/proc", "/sys/class/thermal")
    }
}

impl HostMetrics {
    pub fn with_roots(proc_root: impl Into<PathBuf>, thermal_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            thermal_root: thermal_root.into(),
        }
    }
}

impl MetricSource for HostMetrics {
    fn cpu_load(&self) -> Option<f64> {
        let content = fs::read_to_string(self.proc_root.join("loadavg")).ok()?;
        parse_loadavg(&content)
    }

    fn temperature(&self) -> Option<f64> {
        first_thermal_zone(&self.thermal_root)
    }

    fn ram_free_kb(&self) -> Option<i64> {
        let content = fs::read_to_string(self.proc_root.join("meminfo")).ok()?;
        parse_mem_available(&content)
    }
}

fn parse_loadavg(content: &str) -> Option<f64> {
    content.split_whitespace().next()?.parse().ok()
}

/// `MemAvailable` in kB.
fn parse_mem_available(content: &str) -> Option<i64> {
    content.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("MemAvailable:") => parts.next()?.parse().ok(),
            _ => None,
        }
    })
}

/// First readable `thermal_zone*/temp`, in name order, converted from
/// millidegrees.
fn first_thermal_zone(root: &Path) -> Option<f64> {
    let mut zones: Vec<PathBuf> = fs::read_dir(root)
        .ok()?
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("thermal_zone"))
        .map(|entry| entry.path().join("temp"))
        .collect();
    zones.sort();

    zones.iter().find_map(|path| {
        let raw = fs::read_to_string(path).ok()?;
        let millidegrees: i64 = raw.trim().parse().ok()?;
        Some(millidegrees as f64 / 1000.0)
    })
}

/// Publishes a fresh sample on every tick.
pub struct TelemetryPublisher {
    source: Box<dyn MetricSource>,
}

impl TelemetryPublisher {
    pub fn new(source: impl MetricSource + 'static) -> Self {
        Self {
            source: Box::new(source),
        }
    }
}

#[async_trait]
impl Domain for TelemetryPublisher {
    fn name(&self) -> &'static str {
        "telemetry"
    }

    fn tables(&self) -> &'static [&'static str] {
        TELEMETRY_TABLES
    }

    fn sync_every_tick(&self) -> bool {
        true
    }

    async fn sync(&mut self, snapshot: &Snapshot, store: &mut dyn StoreClient) -> SyncReport {
        let mut report = SyncReport::new();
        let sample = self.source.sample();
        if sample.is_empty() {
            warn!("No metric could be read");
            report.record_skipped(TelemetryRecord::TABLE, "no metric could be read");
            return report;
        }

        let existing = snapshot
            .table(TelemetryRecord::TABLE)
            .and_then(|table| table.first())
            .map(|row| row.id.clone());

        let mut txn = Transaction::new();
        txn.upsert(TelemetryRecord::TABLE, existing, sample.fields());

        match store.commit(txn).await {
            Ok(status) if status.is_success() => {
                debug!(
                    cpu_load = ?sample.cpu_load,
                    temp = ?sample.temp,
                    ram_free = ?sample.ram_free,
                    status = %status,
                    "Telemetry published"
                );
                report.record_applied();
            }
            Ok(status) => {
                warn!(status = %status, "Telemetry commit not applied");
                report.record_failure(TelemetryRecord::TABLE, status);
            }
            Err(e) => {
                warn!(error = %e, "Telemetry commit failed");
                report.record_failure(TelemetryRecord::TABLE, e);
            }
        }
        report
    }
}
