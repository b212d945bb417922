//! Hypervisor command line.

use std::fmt;
use std::path::{Path, PathBuf};

use edge_schema::VmSpec;

use super::VmError;

/// Fully resolved hypervisor invocation for one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl LaunchCommand {
    /// Build the QEMU command line for `spec`.
    ///
    /// Fails when the VM has no disk image.
    pub fn for_vm(qemu_bin: &Path, spec: &VmSpec) -> Result<Self, VmError> {
        let disk = spec
            .disk()
            .ok_or_else(|| VmError::MissingDisk(spec.name.clone()))?;

        let mut args = vec![
            "-name".to_string(),
            spec.name.clone(),
            "-m".to_string(),
            spec.ram_mb().to_string(),
            "-smp".to_string(),
            spec.vcpus().to_string(),
            "-drive".to_string(),
            format!("file={disk},if=virtio,format=raw"),
            "-nographic".to_string(),
            "-enable-kvm".to_string(),
        ];
        for device in spec.pci_passthrough.iter().filter(|d| !d.trim().is_empty()) {
            args.push("-device".to_string());
            args.push(format!("vfio-pci,host={}", device.trim()));
        }

        Ok(Self {
            name: spec.name.clone(),
            program: qemu_bin.to_path_buf(),
            args,
        })
    }

    /// True if `flag` is immediately followed by `value`.
    pub fn has_pair(&self, flag: &str, value: &str) -> bool {
        self.args
            .windows(2)
            .any(|pair| pair[0] == flag && pair[1] == value)
    }
}

impl fmt::Display for LaunchCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> VmSpec {
        VmSpec {
            name: "vm1".to_string(),
            cpu: Some(2),
            ram: Some(1024),
            disk_path: Some("/vm/vm1.img".to_string()),
            pci_passthrough: vec!["0000:01:00.0".to_string()],
            state: None,
        }
    }

    #[test]
    fn test_command_line() {
        let cmd = LaunchCommand::for_vm(Path::new("qemu-system-aarch64"), &spec()).unwrap();
        assert_eq!(
            cmd.to_string(),
            "qemu-system-aarch64 -name vm1 -m 1024 -smp 2 \
             -drive file=/vm/vm1.img,if=virtio,format=raw -nographic -enable-kvm \
             -device vfio-pci,host=0000:01:00.0"
        );
        assert!(cmd.has_pair("-m", "1024"));
    }

    #[test]
    fn test_defaults_applied() {
        let spec = VmSpec {
            cpu: None,
            ram: Some(0),
            pci_passthrough: vec![],
            ..spec()
        };
        let cmd = LaunchCommand::for_vm(Path::new("qemu"), &spec).unwrap();
        assert!(cmd.has_pair("-m", "512"));
        assert!(cmd.has_pair("-smp", "1"));
        assert!(!cmd.args.contains(&"-device".to_string()));
    }

    #[test]
    fn test_missing_disk() {
        let spec = VmSpec {
            disk_path: Some("  ".to_string()),
            ..spec()
        };
        assert!(matches!(
            LaunchCommand::for_vm(Path::new("qemu"), &spec),
            Err(VmError::MissingDisk(name)) if name == "vm1"
        ));
    }
}
