//! Process utilities for PID files and liveness checks.

use machine_shared::errors::{MachineError, MachineResult};
use nix::errno::Errno;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::path::Path;

/// Outcome of a non-blocking status probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Alive,
    Exited,
}

/// Read PID from file.
///
/// The hypervisor writes its own PID file once it is up. The file contains a
/// PID as a decimal string, optionally with a trailing newline.
pub fn read_pid_file(path: &Path) -> MachineResult<u32> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        MachineError::Storage(format!("Failed to read PID file {}: {}", path.display(), e))
    })?;

    content.trim().parse::<u32>().map_err(|e| {
        MachineError::Storage(format!(
            "Invalid PID in file {}: '{}' - {}",
            path.display(),
            content.trim(),
            e
        ))
    })
}

/// Kill a process with SIGKILL.
///
/// # Returns
/// * `true` - Process was killed or doesn't exist
/// * `false` - Failed to kill (permission denied)
pub fn kill_process(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, libc::SIGKILL) == 0 || !is_process_alive(pid) }
}

/// Check if a process with the given PID exists.
///
/// Uses `libc::kill(pid, 0)` which sends a null signal to check existence.
pub fn is_process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

/// Probe a process without blocking.
///
/// Children are reaped through `waitpid(WNOHANG)` so a dead hypervisor does
/// not linger as a zombie that `kill(pid, 0)` would still report. For
/// processes that are not our children the null signal is used instead.
pub fn check_process_status(pid: u32) -> ProcessStatus {
    match waitpid(Pid::from_raw(pid as i32), Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => ProcessStatus::Alive,
        Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => ProcessStatus::Exited,
        Ok(_) => ProcessStatus::Alive,
        Err(Errno::ECHILD) => {
            if is_process_alive(pid) {
                ProcessStatus::Alive
            } else {
                ProcessStatus::Exited
            }
        }
        Err(e) => {
            tracing::debug!(pid, error = %e, "waitpid failed, assuming process exited");
            ProcessStatus::Exited
        }
    }
}
