//! Per-pass bookkeeping of row outcomes.

use std::fmt;

/// A row that could not be converged in this pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFailure {
    pub key: String,
    pub error: String,
}

/// A row that was deliberately left alone in this pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowSkip {
    pub key: String,
    pub reason: String,
}

/// Outcome of one sync pass over a snapshot.
///
/// Failures are collected rather than propagated so one bad row never stops
/// the rest of the snapshot from being processed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub applied: usize,
    pub skipped: Vec<RowSkip>,
    pub failed: Vec<RowFailure>,
}

impl SyncReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_applied(&mut self) {
        self.applied += 1;
    }

    pub fn record_skipped(&mut self, key: impl Into<String>, reason: impl fmt::Display) {
        self.skipped.push(RowSkip {
            key: key.into(),
            reason: reason.to_string(),
        });
    }

    pub fn record_failure(&mut self, key: impl Into<String>, error: impl fmt::Display) {
        self.failed.push(RowFailure {
            key: key.into(),
            error: error.to_string(),
        });
    }

    /// Record the result of converging one row.
    pub fn record<E: fmt::Display>(&mut self, key: impl Into<String>, result: Result<(), E>) {
        match result {
            Ok(()) => self.record_applied(),
            Err(e) => self.record_failure(key, e),
        }
    }

    /// Fold another report into this one.
    pub fn merge(&mut self, other: SyncReport) {
        self.applied += other.applied;
        self.skipped.extend(other.skipped);
        self.failed.extend(other.failed);
    }

    /// True when no row failed.
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_keys(&self) -> Vec<&str> {
        self.failed.iter().map(|f| f.key.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_merge() {
        let mut report = SyncReport::new();
        report.record::<String>("eth0", Ok(()));
        report.record("eth1", Err("ip failed"));
        report.record_skipped("row-3", "missing target_iqn");

        let mut other = SyncReport::new();
        other.record_applied();
        report.merge(other);

        assert_eq!(report.applied, 2);
        assert_eq!(report.failed_keys(), vec!["eth1"]);
        assert_eq!(report.skipped[0].reason, "missing target_iqn");
        assert!(!report.is_clean());
    }
}
