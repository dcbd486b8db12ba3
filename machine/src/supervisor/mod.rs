//! Launch and supervise the hypervisor process.
//!
//! The supervisor owns the spawned child until [`SupervisedProcess::release`]
//! detaches from it. Release never kills the process: the VM keeps running
//! after this process exits.

mod spawn;
mod stderr;

pub use stderr::{StderrBuffer, spawn_capture};

use std::process::Child;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use machine_shared::errors::MachineResult;

use crate::backoff::ProcessHealthCheck;
use crate::cmdline::CommandLine;
use crate::util::{HelperBinaryFinder, ProcessStatus, check_process_status};

/// How long diagnostics wait for the stderr reader to drain a dead process.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// A running hypervisor process.
#[derive(Debug)]
pub struct SupervisedProcess {
    name: String,
    child: Child,
    stderr: StderrBuffer,
    reader: Option<JoinHandle<()>>,
}

impl SupervisedProcess {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stderr(&self) -> &StderrBuffer {
        &self.stderr
    }

    /// Detach from the process without killing it.
    pub fn release(mut self) {
        tracing::debug!(process = %self.name, pid = self.pid(), "Releasing hypervisor process");
        // Dropping the JoinHandle detaches the reader; dropping Child does not kill.
        self.reader.take();
    }

    fn wait_for_stderr_drain(&self) {
        let Some(reader) = &self.reader else {
            return;
        };
        let deadline = Instant::now() + STDERR_DRAIN_TIMEOUT;
        while !reader.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

impl ProcessHealthCheck for SupervisedProcess {
    fn process_name(&self) -> &str {
        &self.name
    }

    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn is_alive(&self) -> bool {
        check_process_status(self.child.id()) == ProcessStatus::Alive
    }

    fn diagnostics(&self) -> String {
        self.wait_for_stderr_drain();
        self.stderr.contents()
    }
}

/// Start the process described by `cmdline`.
///
/// stdin and stdout are nulled; stderr is captured into an in-memory buffer
/// and mirrored to tracing.
pub fn launch(
    cmdline: &CommandLine,
    finder: &dyn HelperBinaryFinder,
) -> MachineResult<SupervisedProcess> {
    let mut child = spawn::spawn_hypervisor(cmdline, finder)?;

    let name = std::path::Path::new(cmdline.program())
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| cmdline.program().to_string());

    let stderr = StderrBuffer::new();
    let reader = match child.stderr.take() {
        Some(pipe) => Some(spawn_capture(pipe, stderr.clone(), &name)?),
        None => None,
    };

    tracing::info!(process = %name, pid = child.id(), "Hypervisor process started");

    Ok(SupervisedProcess {
        name,
        child,
        stderr,
        reader,
    })
}
