//! Guest operating-system image management.

use machine_shared::errors::{MachineError, MachineResult, ResultExt};

use crate::machine::Machine;
use crate::remote::RemoteExecutor;
use crate::state::VmState;

/// Applies OS images inside a running machine.
pub struct MachineOs<'a> {
    machine: &'a mut Machine,
    executor: &'a dyn RemoteExecutor,
    restart: bool,
}

impl<'a> MachineOs<'a> {
    pub fn new(machine: &'a mut Machine, executor: &'a dyn RemoteExecutor, restart: bool) -> Self {
        Self {
            machine,
            executor,
            restart,
        }
    }

    /// Rebase the guest onto `image`, restarting afterwards if requested.
    pub fn apply(&mut self, image: &str) -> MachineResult<()> {
        if self.machine.status() != VmState::Running {
            return Err(MachineError::InvalidStateTransition(format!(
                "cannot apply {} to machine {} while {}",
                image,
                self.machine.name(),
                self.machine.status()
            )));
        }
        let args: Vec<String> = ["podman", "machine", "os", "apply", image]
            .into_iter()
            .map(String::from)
            .collect();

        tracing::info!(machine = %self.machine.name(), image, "Applying OS image");
        self.executor
            .run(&args)
            .with_context(|| format!("applying {} to {}", image, self.machine.name()))?;

        if self.restart {
            tracing::info!(machine = %self.machine.name(), "Restarting after OS apply");
            self.machine.stop(false)?;
            self.machine.start_and_wait()?;
        }
        Ok(())
    }
}
