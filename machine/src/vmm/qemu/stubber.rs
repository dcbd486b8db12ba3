use std::time::Duration;

use machine_shared::errors::{MachineError, MachineResult, ResultExt};
use tracing::Level;

use crate::config::{MachineConfig, MachineDirs, MachineFile, MountType, QemuConfig, UsbConfig};
use crate::mount::{self, ImmutableRootPolicy, MountTargetPolicy};
use crate::net::{self, GvproxyCommand};
use crate::readiness::ReadinessProtocol;
use crate::remote::RemoteExecutor;
use crate::state::VmState;
use crate::supervisor;
use crate::util::{self, ProcessStatus};
use crate::vmm::qemu::command::{QemuCommandBuilder, arch_options, binary_name};
use crate::vmm::qemu::monitor::{self, QmpClient};
use crate::vmm::{
    CreateVmOpts, ReadyUnit, SetOptions, StartHandle, Stubber, StubberOptions, VmType,
};
use crate::{cmdline::CommandLine, disk};

/// Grace period after SIGKILL for the process to disappear.
const KILL_WAIT: Duration = Duration::from_millis(50);
const KILL_WAIT_ATTEMPTS: u32 = 40;

/// QEMU implementation of [`Stubber`].
pub struct QemuStubber {
    options: StubberOptions,
    mount_policy: Box<dyn MountTargetPolicy>,
    arch: String,
}

impl QemuStubber {
    pub fn new(options: StubberOptions) -> Self {
        Self {
            options,
            mount_policy: Box::new(ImmutableRootPolicy::default()),
            arch: std::env::consts::ARCH.to_string(),
        }
    }

    pub fn with_mount_policy(mut self, policy: Box<dyn MountTargetPolicy>) -> Self {
        self.mount_policy = policy;
        self
    }

    pub fn options(&self) -> &StubberOptions {
        &self.options
    }

    fn resolve_binary(&self) -> MachineResult<String> {
        let name = binary_name(&self.arch);
        let path = self.options.finder.find(&name)?;
        Ok(path.display().to_string())
    }

    /// Assemble the invocation for `mc`. Rebuilt on every start.
    pub fn command_line(&self, mc: &MachineConfig, verbose: bool) -> MachineResult<CommandLine> {
        let binary = self.resolve_binary()?;
        let first_boot = self.options.first_boot.config_handle(mc)?;
        QemuCommandBuilder::new(binary, arch_options(&self.arch))
            .verbose(verbose)
            .build(mc, &first_boot)
    }

    fn resize_disk(&self, size_gib: u64, image: &MachineFile) -> MachineResult<()> {
        disk::resize(self.options.finder.as_ref(), size_gib, image.path())
    }

    fn wait_for_exit(&self, pid: u32, attempts: u32, delay: Duration) -> bool {
        for attempt in 0..attempts {
            if util::check_process_status(pid) == ProcessStatus::Exited {
                return true;
            }
            if attempt + 1 < attempts {
                std::thread::sleep(delay);
            }
        }
        false
    }

    fn cleanup_runtime_files(&self, mc: &MachineConfig, qemu: &QemuConfig) {
        let ready = mc.ready_socket();
        let files = [Ok(qemu.monitor.address.clone()), ready, Ok(qemu.pid_file.clone())];
        for file in files.into_iter().flatten() {
            if let Err(e) = file.delete() {
                tracing::warn!(machine = %mc.name, file = %file.path().display(), error = %e, "Failed to remove runtime file");
            }
        }
    }
}

impl Stubber for QemuStubber {
    fn vm_type(&self) -> VmType {
        VmType::Qemu
    }

    fn create_vm(&self, opts: &CreateVmOpts, mc: &mut MachineConfig) -> MachineResult<()> {
        let monitor =
            monitor::new_qmp_monitor(&opts.name, &opts.dirs.runtime_dir, self.options.monitor_timeout)?;
        let pid_file = MachineFile::new(
            mc.runtime_dir().join(format!("{}_vm.pid", mc.name)),
            None,
        )?;

        mc.qemu_hypervisor = Some(QemuConfig { monitor, pid_file });

        let image = mc.image()?;
        self.resize_disk(mc.resources.disk_size_gib, image)
            .with_context(|| format!("creating machine {}", mc.name))?;

        tracing::info!(machine = %mc.name, "QEMU machine created");
        Ok(())
    }

    fn start_vm(&self, mc: &MachineConfig) -> MachineResult<StartHandle> {
        let verbose = tracing::enabled!(Level::DEBUG);
        let cmdline = self
            .command_line(mc, verbose)
            .context("unable to generate qemu command line")?;

        let ready_socket = mc.ready_socket()?;
        let qemu = mc.qemu()?;

        let state = self.state(mc)?;
        if matches!(state, VmState::Running | VmState::Stopping) {
            return Err(MachineError::InvalidStateTransition(format!(
                "machine {} is already {}",
                mc.name, state
            )));
        }

        // Left behind by a crashed previous run.
        for stale in [&ready_socket, &qemu.monitor.address] {
            if let Err(e) = stale.delete() {
                tracing::warn!(machine = %mc.name, file = %stale.path().display(), error = %e, "Failed to remove stale socket");
            }
        }

        net::await_proxy_ready(mc, &self.options.proxy)
            .with_context(|| format!("starting machine {}", mc.name))?;

        tracing::debug!(machine = %mc.name, cmd = %cmdline, "qemu cmd");

        let process = supervisor::launch(&cmdline, self.options.finder.as_ref())?;
        tracing::debug!(machine = %mc.name, pid = process.pid(), "Started qemu");

        let mut readiness = ReadinessProtocol::new(self.options.readiness);
        if let Some(timeout) = self.options.ready_line_timeout {
            readiness = readiness.with_line_timeout(timeout);
        }

        Ok(StartHandle::new(
            process,
            ready_socket.path().to_path_buf(),
            readiness,
        ))
    }

    fn state(&self, mc: &MachineConfig) -> MachineResult<VmState> {
        let Some(qemu) = mc.qemu_hypervisor.as_ref() else {
            return Ok(VmState::Uninitialized);
        };
        monitor::query_state(&qemu.monitor)
    }

    fn stop_vm(&self, mc: &MachineConfig, hard: bool) -> MachineResult<()> {
        let qemu = mc.qemu()?;
        let state = self.state(mc)?;

        if state == VmState::Stopped {
            tracing::debug!(machine = %mc.name, "Machine already stopped");
            self.cleanup_runtime_files(mc, qemu);
            return Ok(());
        }

        if state == VmState::Running && !hard {
            match QmpClient::connect(&qemu.monitor).and_then(|mut c| c.system_powerdown()) {
                Ok(()) => tracing::info!(machine = %mc.name, "Sent powerdown to guest"),
                Err(e) => {
                    tracing::warn!(machine = %mc.name, error = %e, "Powerdown request failed")
                }
            }
        }

        let pid = util::read_pid_file(qemu.pid_file.path())
            .with_context(|| format!("stopping machine {}", mc.name))?;

        let exited =
            !hard && self.wait_for_exit(pid, self.options.stop.attempts, self.options.stop.delay);

        if !exited {
            tracing::info!(machine = %mc.name, pid, hard, "Killing qemu");
            if !util::kill_process(pid) {
                return Err(MachineError::Internal(format!(
                    "failed to kill qemu process {} for machine {}",
                    pid, mc.name
                )));
            }
            if !self.wait_for_exit(pid, KILL_WAIT_ATTEMPTS, KILL_WAIT) {
                return Err(MachineError::Internal(format!(
                    "qemu process {} for machine {} did not exit",
                    pid, mc.name
                )));
            }
        }

        self.cleanup_runtime_files(mc, qemu);
        tracing::info!(machine = %mc.name, "Machine stopped");
        Ok(())
    }

    fn set_provider_attrs(&self, mc: &mut MachineConfig, opts: &SetOptions) -> MachineResult<()> {
        let state = self.state(mc)?;
        if !state.can_mutate_attrs() {
            return Err(MachineError::InvalidStateTransition(format!(
                "unable to change settings unless vm is stopped (machine {} is {})",
                mc.name, state
            )));
        }

        // Validate everything before the first side effect.
        let usbs = opts
            .usbs
            .as_deref()
            .map(UsbConfig::parse_list)
            .transpose()?;

        if let Some(size) = opts.disk_size_gib
            && size < mc.resources.disk_size_gib
        {
            return Err(MachineError::Config(format!(
                "new disk size must be larger than {}GB",
                mc.resources.disk_size_gib
            )));
        }

        if let Some(size) = opts.disk_size_gib
            && size > mc.resources.disk_size_gib
        {
            self.resize_disk(size, mc.image()?)?;
            mc.resources.disk_size_gib = size;
        }

        if let Some(rootful) = opts.rootful
            && mc.host_user.rootful != rootful
        {
            mc.set_rootful(rootful);
        }

        if let Some(usbs) = usbs {
            mc.resources.usbs = usbs;
        }

        if let Some(cpus) = opts.cpus {
            mc.resources.cpus = cpus;
        }
        if let Some(memory) = opts.memory_mib {
            mc.resources.memory_mib = memory;
        }

        Ok(())
    }

    fn start_networking(&self, mc: &MachineConfig, cmd: &mut GvproxyCommand) -> MachineResult<()> {
        net::prepare(mc, cmd)
    }

    fn post_start_networking(&self, _mc: &MachineConfig, _no_info: bool) -> MachineResult<()> {
        Ok(())
    }

    fn stop_host_networking(&self, _mc: &MachineConfig, _vm_type: VmType) -> MachineResult<()> {
        Err(MachineError::NotImplemented(
            "stopping host networking is not supported by the qemu provider".into(),
        ))
    }

    fn mount_volumes_to_vm(
        &self,
        mc: &MachineConfig,
        executor: &dyn RemoteExecutor,
    ) -> MachineResult<()> {
        mount::mount_all(&mc.mounts, executor, self.mount_policy.as_ref())
            .with_context(|| format!("mounting volumes in {}", mc.name))
    }

    fn mount_type(&self) -> MountType {
        MountType::NineP
    }

    fn user_mode_network_enabled(&self, _mc: &MachineConfig) -> bool {
        true
    }

    fn use_provider_network_setup(&self) -> bool {
        false
    }

    fn require_exclusive_active(&self) -> bool {
        true
    }

    fn exists(&self, _name: &str) -> MachineResult<bool> {
        Ok(false)
    }

    fn remove_and_clean_machines(&self, _dirs: &MachineDirs) -> MachineResult<()> {
        // Nothing beyond the machine's own files.
        Ok(())
    }

    fn prepare_first_boot(&self, _mc: &MachineConfig) -> MachineResult<Option<ReadyUnit>> {
        Ok(None)
    }

    fn get_disk(
        &self,
        user_input: Option<&str>,
        dirs: &MachineDirs,
        mc: &mut MachineConfig,
    ) -> MachineResult<()> {
        let path = self
            .options
            .disk_images
            .fetch(user_input, dirs, self.vm_type(), &mc.name)?;
        mc.image_path = Some(MachineFile::new(path, None)?);
        Ok(())
    }
}
