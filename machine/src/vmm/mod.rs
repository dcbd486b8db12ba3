//! Backend abstraction for machine lifecycles.
//!
//! Every hypervisor backend implements [`Stubber`]. The backoff dialer,
//! readiness protocol and state machine are shared library code; backends
//! only supply their command line, process and monitor specifics.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use machine_shared::errors::{MachineError, MachineResult};
use serde::{Deserialize, Serialize};

pub mod handle;
pub mod providers;
pub mod qemu;
pub mod registry;

pub use handle::StartHandle;
pub use providers::{
    DiskImageProvider, FirstBootConfigProvider, IgnitionFileProvider, LocalDiskImageProvider,
    ReadyUnit,
};
pub use registry::{available_stubbers, create_stubber, is_registered};

use crate::backoff::BackoffPolicy;
use crate::config::{MachineConfig, MachineDirs, MountType};
use crate::net::GvproxyCommand;
use crate::remote::RemoteExecutor;
use crate::state::VmState;
use crate::util::{DefaultHelperFinder, HelperBinaryFinder};

/// Available hypervisor backends.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmType {
    Qemu,
    HyperV,
    AppleHv,
    Wsl,
}

impl VmType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmType::Qemu => "qemu",
            VmType::HyperV => "hyperv",
            VmType::AppleHv => "applehv",
            VmType::Wsl => "wsl",
        }
    }
}

impl FromStr for VmType {
    type Err = MachineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "qemu" => Ok(VmType::Qemu),
            "hyperv" => Ok(VmType::HyperV),
            "applehv" => Ok(VmType::AppleHv),
            "wsl" => Ok(VmType::Wsl),
            _ => Err(MachineError::Unsupported(format!(
                "Unknown machine provider: '{}'. Supported: qemu, hyperv, applehv, wsl",
                s
            ))),
        }
    }
}

impl std::fmt::Display for VmType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to [`Stubber::create_vm`].
#[derive(Debug, Clone)]
pub struct CreateVmOpts {
    pub name: String,
    pub dirs: MachineDirs,
    pub user_mode_networking: bool,
}

/// Attribute updates. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetOptions {
    pub cpus: Option<u64>,
    pub memory_mib: Option<u64>,
    pub disk_size_gib: Option<u64>,
    pub rootful: Option<bool>,
    /// Raw `bus=..,devnum=..` / `vendor=..,product=..` entries.
    pub usbs: Option<Vec<String>>,
}

/// Collaborators and timing shared by every backend.
#[derive(Clone)]
pub struct StubberOptions {
    pub finder: Arc<dyn HelperBinaryFinder>,
    pub first_boot: Arc<dyn FirstBootConfigProvider>,
    pub disk_images: Arc<dyn DiskImageProvider>,
    /// Guest ready-socket wait.
    pub readiness: BackoffPolicy,
    /// Network proxy socket wait before launch.
    pub proxy: BackoffPolicy,
    /// Process exit wait after a graceful powerdown.
    pub stop: BackoffPolicy,
    /// How long to wait for the ready line once connected.
    pub ready_line_timeout: Option<Duration>,
    pub monitor_timeout: Duration,
}

impl StubberOptions {
    pub const DEFAULT_MONITOR_TIMEOUT: Duration = Duration::from_secs(2);

    /// Defaults with extra helper-binary search directories.
    pub fn with_helper_dirs(dirs: Vec<PathBuf>) -> Self {
        Self {
            finder: Arc::new(DefaultHelperFinder::new(dirs)),
            ..Self::default()
        }
    }
}

impl Default for StubberOptions {
    fn default() -> Self {
        Self {
            finder: Arc::new(DefaultHelperFinder::default()),
            first_boot: Arc::new(IgnitionFileProvider),
            disk_images: Arc::new(LocalDiskImageProvider),
            readiness: BackoffPolicy::default(),
            proxy: BackoffPolicy::default(),
            stop: BackoffPolicy::new(20, Duration::from_millis(500)),
            ready_line_timeout: None,
            monitor_timeout: Self::DEFAULT_MONITOR_TIMEOUT,
        }
    }
}

impl std::fmt::Debug for StubberOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StubberOptions")
            .field("readiness", &self.readiness)
            .field("proxy", &self.proxy)
            .field("stop", &self.stop)
            .field("ready_line_timeout", &self.ready_line_timeout)
            .field("monitor_timeout", &self.monitor_timeout)
            .finish_non_exhaustive()
    }
}

/// Lifecycle contract implemented once per hypervisor backend.
///
/// Callers serialize administrative operations per machine; implementations
/// take no locks.
pub trait Stubber: Send + Sync {
    fn vm_type(&self) -> VmType;

    /// Allocate the hypervisor sub-config and size the disk.
    fn create_vm(&self, opts: &CreateVmOpts, mc: &mut MachineConfig) -> MachineResult<()>;

    /// Launch the hypervisor. Readiness is waited on through the handle.
    fn start_vm(&self, mc: &MachineConfig) -> MachineResult<StartHandle>;

    /// Live state as reported by the hypervisor.
    fn state(&self, mc: &MachineConfig) -> MachineResult<VmState>;

    fn stop_vm(&self, mc: &MachineConfig, hard: bool) -> MachineResult<()>;

    /// Resize, rootful toggle and USB update. Rejected unless stopped.
    fn set_provider_attrs(&self, mc: &mut MachineConfig, opts: &SetOptions) -> MachineResult<()>;

    fn start_networking(&self, mc: &MachineConfig, cmd: &mut GvproxyCommand) -> MachineResult<()>;

    fn post_start_networking(&self, mc: &MachineConfig, no_info: bool) -> MachineResult<()>;

    fn stop_host_networking(&self, mc: &MachineConfig, vm_type: VmType) -> MachineResult<()>;

    fn mount_volumes_to_vm(
        &self,
        mc: &MachineConfig,
        executor: &dyn RemoteExecutor,
    ) -> MachineResult<()>;

    fn mount_type(&self) -> MountType;

    fn user_mode_network_enabled(&self, mc: &MachineConfig) -> bool;

    fn use_provider_network_setup(&self) -> bool;

    /// Whether only one machine of this type may run at a time.
    fn require_exclusive_active(&self) -> bool;

    /// Whether the backend itself knows a machine by this name.
    fn exists(&self, name: &str) -> MachineResult<bool>;

    fn remove_and_clean_machines(&self, dirs: &MachineDirs) -> MachineResult<()>;

    /// Extra first-boot units the backend needs.
    fn prepare_first_boot(&self, mc: &MachineConfig) -> MachineResult<Option<ReadyUnit>>;

    /// Acquire the disk image and record it on `mc`.
    fn get_disk(
        &self,
        user_input: Option<&str>,
        dirs: &MachineDirs,
        mc: &mut MachineConfig,
    ) -> MachineResult<()>;
}
