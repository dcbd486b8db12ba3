use std::path::{Path, PathBuf};
use std::process::Command;

use machine_shared::constants::helpers;
use machine_shared::errors::{MachineError, MachineResult};

use crate::util::HelperBinaryFinder;

/// The `qemu-img` disk utility.
#[derive(Debug, Clone)]
pub struct QemuImg {
    binary: PathBuf,
}

impl QemuImg {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn locate(finder: &dyn HelperBinaryFinder) -> MachineResult<Self> {
        Ok(Self::new(finder.find(helpers::QEMU_IMG)?))
    }

    /// Grow `disk_path` to `size_gib` GiB.
    pub fn resize(&self, disk_path: &Path, size_gib: u64) -> MachineResult<()> {
        let size = format!("{}G", size_gib);
        tracing::info!(disk = %disk_path.display(), size = %size, "Resizing disk image");

        let output = Command::new(&self.binary)
            .arg("resize")
            .arg(disk_path)
            .arg(&size)
            .output()
            .map_err(|e| MachineError::DiskResize {
                path: disk_path.display().to_string(),
                reason: format!("failed to run {}: {}", self.binary.display(), e),
            })?;

        if !output.status.success() {
            return Err(MachineError::DiskResize {
                path: disk_path.display().to_string(),
                reason: format!(
                    "{} exited with {}: {}",
                    self.binary.display(),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        tracing::debug!(disk = %disk_path.display(), "Disk image resized");
        Ok(())
    }
}
