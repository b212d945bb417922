//! cgroup placement of hypervisor processes.

use std::fs;
use std::path::Path;

use tracing::{debug, warn};

/// Move `pid` into the cgroup whose `cgroup.procs` file is `procs`.
///
/// Best effort: a missing cgroup is skipped and a failed write only warns.
/// Returns whether the pid was written.
pub fn assign_cgroup(procs: &Path, pid: u32) -> bool {
    if !procs.exists() {
        debug!(cgroup = %procs.display(), pid, "cgroup not present, leaving process in place");
        return false;
    }

    match fs::write(procs, pid.to_string()) {
        Ok(()) => {
            debug!(cgroup = %procs.display(), pid, "Process moved into cgroup");
            true
        }
        Err(e) => {
            warn!(cgroup = %procs.display(), pid, error = %e, "Failed to move process into cgroup");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writes_pid() {
        let dir = tempfile::tempdir().unwrap();
        let procs = dir.path().join("cgroup.procs");
        fs::write(&procs, "").unwrap();

        assert!(assign_cgroup(&procs, 4242));
        assert_eq!(fs::read_to_string(&procs).unwrap(), "4242");
    }

    #[test]
    fn test_missing_cgroup_skipped() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!assign_cgroup(&dir.path().join("vm.slice/cgroup.procs"), 1));
    }
}
