//! Narrow interfaces for collaborators that live outside the lifecycle core.

use std::path::{Path, PathBuf};

use machine_shared::errors::{MachineError, MachineResult};

use crate::config::{MachineConfig, MachineDirs, MachineFile};
use crate::vmm::VmType;

/// Supplies the first-boot configuration the hypervisor hands to the guest.
pub trait FirstBootConfigProvider: Send + Sync {
    fn config_handle(&self, mc: &MachineConfig) -> MachineResult<MachineFile>;
}

/// Uses the `<name>.ign` file in the machine's config directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnitionFileProvider;

impl FirstBootConfigProvider for IgnitionFileProvider {
    fn config_handle(&self, mc: &MachineConfig) -> MachineResult<MachineFile> {
        mc.ignition_file()
    }
}

/// Acquires a bootable disk image and returns where it was placed.
pub trait DiskImageProvider: Send + Sync {
    fn fetch(
        &self,
        user_input: Option<&str>,
        dirs: &MachineDirs,
        vm_type: VmType,
        name: &str,
    ) -> MachineResult<PathBuf>;
}

/// Copies a local image into the data directory.
///
/// Downloading images is left to other providers.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalDiskImageProvider;

impl LocalDiskImageProvider {
    pub fn image_path(dirs: &MachineDirs, vm_type: VmType, name: &str) -> PathBuf {
        dirs.data_dir.join(format!("{}-{}.qcow2", name, vm_type))
    }
}

impl DiskImageProvider for LocalDiskImageProvider {
    fn fetch(
        &self,
        user_input: Option<&str>,
        dirs: &MachineDirs,
        vm_type: VmType,
        name: &str,
    ) -> MachineResult<PathBuf> {
        let source = user_input.filter(|s| !s.is_empty()).ok_or_else(|| {
            MachineError::Config("a local disk image path is required".into())
        })?;
        let source = Path::new(source);
        if !source.is_file() {
            return Err(MachineError::Storage(format!(
                "disk image {} does not exist",
                source.display()
            )));
        }

        let dest = Self::image_path(dirs, vm_type, name);
        std::fs::create_dir_all(&dirs.data_dir).map_err(|e| {
            MachineError::Storage(format!(
                "Failed to create {}: {}",
                dirs.data_dir.display(),
                e
            ))
        })?;
        std::fs::copy(source, &dest).map_err(|e| {
            MachineError::Storage(format!(
                "Failed to copy {} to {}: {}",
                source.display(),
                dest.display(),
                e
            ))
        })?;

        tracing::info!(source = %source.display(), dest = %dest.display(), "Disk image copied");
        Ok(dest)
    }
}

/// A systemd unit the guest runs to signal readiness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyUnit {
    pub name: String,
    pub contents: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_provider_copies_image() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("fcos.qcow2");
        std::fs::write(&image, b"qcow").unwrap();
        let dirs = MachineDirs::under(&dir.path().join("home"), VmType::Qemu);

        let dest = LocalDiskImageProvider
            .fetch(image.to_str(), &dirs, VmType::Qemu, "dev")
            .unwrap();
        assert_eq!(dest, dirs.data_dir.join("dev-qemu.qcow2"));
        assert_eq!(std::fs::read(&dest).unwrap(), b"qcow");
    }

    #[test]
    fn test_local_provider_requires_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let dirs = MachineDirs::under(dir.path(), VmType::Qemu);
        assert!(LocalDiskImageProvider.fetch(None, &dirs, VmType::Qemu, "dev").is_err());
        assert!(
            LocalDiskImageProvider
                .fetch(Some("/nonexistent.qcow2"), &dirs, VmType::Qemu, "dev")
                .is_err()
        );
    }
}
