pub mod process;

use std::path::{Path, PathBuf};

use machine_shared::constants::envs;
use machine_shared::errors::{MachineError, MachineResult};

pub use process::{
    ProcessStatus, check_process_status, is_process_alive, kill_process, read_pid_file,
};

/// Resolves helper binaries (hypervisor, disk utility, ssh) by logical name.
pub trait HelperBinaryFinder: Send + Sync {
    fn find(&self, name: &str) -> MachineResult<PathBuf>;
}

/// Searches explicit directories, then `$MACHINE_HELPER_BINARIES_DIR`, then `PATH`.
#[derive(Debug, Clone, Default)]
pub struct DefaultHelperFinder {
    search_dirs: Vec<PathBuf>,
}

impl DefaultHelperFinder {
    pub fn new(search_dirs: Vec<PathBuf>) -> Self {
        Self { search_dirs }
    }

    fn candidates(&self, name: &str) -> Vec<PathBuf> {
        let mut candidates: Vec<PathBuf> = self.search_dirs.iter().map(|d| d.join(name)).collect();

        if let Ok(dir) = std::env::var(envs::HELPER_BINARIES_DIR)
            && !dir.is_empty()
        {
            candidates.push(PathBuf::from(dir).join(name));
        }

        if let Some(path) = std::env::var_os("PATH") {
            candidates.extend(std::env::split_paths(&path).map(|d| d.join(name)));
        }

        candidates
    }
}

impl HelperBinaryFinder for DefaultHelperFinder {
    fn find(&self, name: &str) -> MachineResult<PathBuf> {
        // Absolute or relative paths are taken as-is.
        if name.contains('/') {
            let path = Path::new(name);
            if is_executable(path) {
                return Ok(path.to_path_buf());
            }
            return Err(MachineError::BinaryNotFound {
                name: name.to_string(),
                reason: "path is not an executable file".into(),
            });
        }

        let candidates = self.candidates(name);
        for candidate in &candidates {
            tracing::trace!(binary = name, candidate = %candidate.display(), "Probing helper binary");
            if is_executable(candidate) {
                tracing::debug!(binary = %candidate.display(), "Found helper binary");
                return Ok(candidate.clone());
            }
        }

        let locations = candidates
            .iter()
            .map(|p| format!("  - {}", p.display()))
            .collect::<Vec<_>>()
            .join("\n");

        Err(MachineError::BinaryNotFound {
            name: name.to_string(),
            reason: format!("searched locations:\n{}", locations),
        })
    }
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
