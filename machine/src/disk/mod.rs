//! Backing disk provisioning.
//!
//! Resizing is not state-aware. Callers gate it on a stopped machine.

mod qemu_img;

pub use qemu_img::QemuImg;

use std::path::Path;

use machine_shared::errors::MachineResult;

use crate::util::HelperBinaryFinder;

/// Resize `disk_path` to `new_size_gib` with the resolved `qemu-img`.
pub fn resize(
    finder: &dyn HelperBinaryFinder,
    new_size_gib: u64,
    disk_path: &Path,
) -> MachineResult<()> {
    QemuImg::locate(finder)?.resize(disk_path, new_size_gib)
}
