//! Machine lifecycle status and state machine.
//!
//! ```text
//! create()  Uninitialized -> Created
//! start()   Created | Stopped -> Starting
//! ready     Starting -> Running
//! stop()    Running -> Stopping -> Stopped
//! error     any -> Failed
//! ```

use chrono::{DateTime, Utc};
use machine_shared::errors::{MachineError, MachineResult};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    /// Nothing allocated yet.
    Uninitialized,

    /// Hypervisor sub-config allocated and disk sized. Never started.
    Created,

    /// Hypervisor launched, waiting on the guest.
    Starting,

    /// Guest signalled readiness.
    Running,

    /// Shutdown requested, process still alive.
    Stopping,

    /// Process gone. Attribute mutation is only permitted here.
    Stopped,

    /// A transition failed. The machine may be stopped or restarted.
    Failed,
}

impl VmState {
    pub fn is_running(&self) -> bool {
        matches!(self, VmState::Running)
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, VmState::Stopped)
    }

    pub fn can_start(&self) -> bool {
        matches!(self, VmState::Created | VmState::Stopped | VmState::Failed)
    }

    pub fn can_stop(&self) -> bool {
        matches!(
            self,
            VmState::Starting | VmState::Running | VmState::Stopping | VmState::Failed
        )
    }

    /// Disk resize, rootful toggle and USB updates require a stopped machine.
    pub fn can_mutate_attrs(&self) -> bool {
        matches!(self, VmState::Stopped)
    }

    /// Check if transition to target state is valid.
    pub fn can_transition_to(&self, target: VmState) -> bool {
        use VmState::*;
        matches!(
            (self, target),
            (_, Failed) |
            (Uninitialized, Created) |
            (Created, Starting) |
            (Starting, Running) |
            // Stop requested while the guest was still booting
            (Starting, Stopping) |
            (Running, Stopping) |
            // Process vanished
            (Running, Stopped) |
            (Stopping, Stopped) |
            (Stopped, Starting) |
            (Failed, Starting) |
            (Failed, Stopping) |
            (Failed, Stopped)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VmState::Uninitialized => "uninitialized",
            VmState::Created => "created",
            VmState::Starting => "starting",
            VmState::Running => "running",
            VmState::Stopping => "stopping",
            VmState::Stopped => "stopped",
            VmState::Failed => "failed",
        }
    }
}

impl std::str::FromStr for VmState {
    type Err = MachineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uninitialized" => Ok(VmState::Uninitialized),
            "created" => Ok(VmState::Created),
            "starting" => Ok(VmState::Starting),
            "running" => Ok(VmState::Running),
            "stopping" => Ok(VmState::Stopping),
            "stopped" => Ok(VmState::Stopped),
            "failed" => Ok(VmState::Failed),
            other => Err(MachineError::Config(format!("unknown machine state '{other}'"))),
        }
    }
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Current status plus when it last changed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineState {
    pub status: VmState,
    /// Last state change timestamp (UTC).
    pub last_updated: DateTime<Utc>,
}

impl MachineState {
    pub fn new() -> Self {
        Self {
            status: VmState::Uninitialized,
            last_updated: Utc::now(),
        }
    }

    /// Start from a known status, e.g. one reported by a live backend query.
    pub fn with_status(status: VmState) -> Self {
        Self {
            status,
            last_updated: Utc::now(),
        }
    }

    /// Attempt state transition with validation.
    pub fn transition_to(&mut self, new_status: VmState) -> MachineResult<()> {
        if !self.status.can_transition_to(new_status) {
            return Err(MachineError::InvalidStateTransition(format!(
                "Cannot transition from {} to {}",
                self.status, new_status
            )));
        }

        self.status = new_status;
        self.last_updated = Utc::now();
        Ok(())
    }

    pub fn mark_failed(&mut self) {
        self.status = VmState::Failed;
        self.last_updated = Utc::now();
    }

    /// Force set status without validation.
    pub fn force_status(&mut self, status: VmState) {
        self.status = status;
        self.last_updated = Utc::now();
    }
}

impl Default for MachineState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut state = MachineState::new();
        for next in [
            VmState::Created,
            VmState::Starting,
            VmState::Running,
            VmState::Stopping,
            VmState::Stopped,
            VmState::Starting,
            VmState::Running,
        ] {
            state.transition_to(next).unwrap();
        }
        assert!(state.status.is_running());
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!VmState::Uninitialized.can_transition_to(VmState::Running));
        assert!(!VmState::Created.can_transition_to(VmState::Running));
        assert!(!VmState::Running.can_transition_to(VmState::Starting));
        assert!(!VmState::Stopped.can_transition_to(VmState::Running));
        assert!(!VmState::Stopping.can_transition_to(VmState::Running));
    }

    #[test]
    fn test_any_state_can_fail() {
        for state in [
            VmState::Uninitialized,
            VmState::Created,
            VmState::Starting,
            VmState::Running,
            VmState::Stopping,
            VmState::Stopped,
            VmState::Failed,
        ] {
            assert!(state.can_transition_to(VmState::Failed), "{state}");
        }
    }

    #[test]
    fn test_failed_recovers_by_start_or_stop() {
        assert!(VmState::Failed.can_transition_to(VmState::Starting));
        assert!(VmState::Failed.can_transition_to(VmState::Stopped));
        assert!(!VmState::Failed.can_transition_to(VmState::Running));
    }

    #[test]
    fn test_only_stopped_allows_mutation() {
        assert!(VmState::Stopped.can_mutate_attrs());
        assert!(!VmState::Running.can_mutate_attrs());
        assert!(!VmState::Created.can_mutate_attrs());
        assert!(!VmState::Starting.can_mutate_attrs());
    }

    #[test]
    fn test_transition_error_is_invalid_state() {
        let mut state = MachineState::new();
        let err = state.transition_to(VmState::Running).unwrap_err();
        assert!(matches!(err, MachineError::InvalidStateTransition(_)));
        assert_eq!(state.status, VmState::Uninitialized);
    }

    #[test]
    fn test_status_string_roundtrip() {
        for state in [VmState::Created, VmState::Failed, VmState::Stopping] {
            assert_eq!(state.as_str().parse::<VmState>().unwrap(), state);
        }
        assert!("bogus".parse::<VmState>().is_err());
    }

    #[test]
    fn test_serde_lowercase() {
        assert_eq!(serde_json::to_string(&VmState::Running).unwrap(), "\"running\"");
    }
}
