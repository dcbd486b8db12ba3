//! Handle returned by a successful launch.

use std::path::{Path, PathBuf};

use machine_shared::errors::{MachineResult, ResultExt};

use crate::readiness::ReadinessProtocol;
use crate::supervisor::{StderrBuffer, SupervisedProcess};

/// A launched hypervisor whose guest may not have booted yet.
///
/// [`StartHandle::await_ready`] blocks on the guest signal; the caller may do
/// other start-up work first. [`StartHandle::release`] detaches from the
/// process without stopping it.
#[derive(Debug)]
pub struct StartHandle {
    process: SupervisedProcess,
    ready_socket: PathBuf,
    readiness: ReadinessProtocol,
}

impl StartHandle {
    pub fn new(
        process: SupervisedProcess,
        ready_socket: impl Into<PathBuf>,
        readiness: ReadinessProtocol,
    ) -> Self {
        Self {
            process,
            ready_socket: ready_socket.into(),
            readiness,
        }
    }

    pub fn pid(&self) -> u32 {
        self.process.pid()
    }

    pub fn ready_socket(&self) -> &Path {
        &self.ready_socket
    }

    pub fn stderr(&self) -> &StderrBuffer {
        self.process.stderr()
    }

    /// Block until the guest signals boot completion.
    pub fn await_ready(&self) -> MachineResult<()> {
        self.readiness
            .wait(&self.ready_socket, Some(&self.process))
            .with_context(|| format!("waiting for {} (pid {})", self.process.name(), self.pid()))
    }

    /// Detach from the hypervisor. It keeps running.
    pub fn release(self) {
        self.process.release();
    }
}
