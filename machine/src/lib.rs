//! Machine - hypervisor-agnostic virtual machine lifecycle
//!
//! A [`Stubber`] drives one hypervisor backend (QEMU is built in). The
//! [`Machine`] driver enforces the lifecycle state machine on top of it, while
//! the readiness protocol, backoff dialer, process supervision and guest
//! mounts are shared by every backend.

pub mod backoff;
pub mod cmdline;
pub mod config;
pub mod disk;
pub mod logging;
pub mod machine;
pub mod mount;
pub mod net;
pub mod os;
pub mod readiness;
pub mod remote;
pub mod state;
pub mod supervisor;
pub mod util;
pub mod vmm;

pub use machine_shared::errors::{MachineError, MachineResult, ResultExt};

pub use backoff::{BackoffPolicy, DialError};
pub use cmdline::CommandLine;
pub use config::{MachineConfig, MachineDirs, MountSpec, MountType, ResourceSpec, UsbConfig};
pub use logging::{LoggingOptions, init_logging};
pub use machine::Machine;
pub use os::MachineOs;
pub use readiness::ReadinessProtocol;
pub use remote::{RemoteExecutor, SshExecutor};
pub use state::{MachineState, VmState};
pub use vmm::{
    CreateVmOpts, SetOptions, StartHandle, Stubber, StubberOptions, VmType, create_stubber,
};
