//! Lifecycle driver tying a configuration to a backend.
//!
//! `Machine` enforces the state machine around the backend's operations. A
//! failed transition leaves the machine in [`VmState::Failed`] with the error
//! returned to the caller. Gate rejections have no side effects and do not
//! change the state.

use chrono::Utc;
use machine_shared::errors::{MachineError, MachineResult};

use crate::config::MachineConfig;
use crate::remote::RemoteExecutor;
use crate::state::{MachineState, VmState};
use crate::vmm::{CreateVmOpts, SetOptions, StartHandle, Stubber};

pub struct Machine {
    config: MachineConfig,
    stubber: Box<dyn Stubber>,
    state: MachineState,
}

impl Machine {
    /// A machine that has not been created yet.
    pub fn new(config: MachineConfig, stubber: Box<dyn Stubber>) -> Self {
        Self {
            config,
            stubber,
            state: MachineState::new(),
        }
    }

    /// An existing machine, with its state taken from the backend.
    pub fn load(config: MachineConfig, stubber: Box<dyn Stubber>) -> MachineResult<Self> {
        let status = stubber.state(&config)?;
        tracing::debug!(machine = %config.name, %status, "Loaded machine");
        Ok(Self {
            config,
            stubber,
            state: MachineState::with_status(status),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn into_config(self) -> MachineConfig {
        self.config
    }

    pub fn stubber(&self) -> &dyn Stubber {
        self.stubber.as_ref()
    }

    pub fn state(&self) -> &MachineState {
        &self.state
    }

    pub fn status(&self) -> VmState {
        self.state.status
    }

    fn require(&self, allowed: bool, action: &str) -> MachineResult<()> {
        if allowed {
            Ok(())
        } else {
            Err(MachineError::InvalidStateTransition(format!(
                "cannot {} machine {} while {}",
                action, self.config.name, self.state.status
            )))
        }
    }

    /// Record `result`, moving to Failed on error.
    fn settle<T>(&mut self, result: MachineResult<T>) -> MachineResult<T> {
        if let Err(e) = &result {
            tracing::error!(machine = %self.config.name, from = %self.state.status, error = %e, "Machine transition failed");
            self.state.mark_failed();
        }
        result
    }

    pub fn create(&mut self, opts: &CreateVmOpts) -> MachineResult<()> {
        self.require(
            self.state.status.can_transition_to(VmState::Created),
            "create",
        )?;
        let result = self.stubber.create_vm(opts, &mut self.config);
        self.settle(result)?;
        self.state.transition_to(VmState::Created)
    }

    /// Launch the hypervisor. The guest is not ready until
    /// [`Machine::wait_until_running`] succeeds.
    ///
    /// A refusal from the backend's own gate restores the previous status.
    pub fn start(&mut self) -> MachineResult<StartHandle> {
        self.require(self.state.status.can_start(), "start")?;
        let previous = self.state.status;
        self.state.transition_to(VmState::Starting)?;

        tracing::info!(machine = %self.config.name, "Starting machine");
        match self.stubber.start_vm(&self.config) {
            Err(e @ MachineError::InvalidStateTransition(_)) => {
                tracing::warn!(machine = %self.config.name, error = %e, "Backend refused start");
                self.state.force_status(previous);
                Err(e)
            }
            result => self.settle(result),
        }
    }

    pub fn wait_until_running(&mut self, handle: &StartHandle) -> MachineResult<()> {
        self.require(self.state.status == VmState::Starting, "wait on")?;

        let result = handle.await_ready();
        self.settle(result)?;

        self.config.last_up = Some(Utc::now());
        self.state.transition_to(VmState::Running)?;
        tracing::info!(machine = %self.config.name, pid = handle.pid(), "Machine running");
        Ok(())
    }

    /// Start, wait for the guest and detach from the hypervisor.
    pub fn start_and_wait(&mut self) -> MachineResult<()> {
        let handle = self.start()?;
        self.wait_until_running(&handle)?;
        handle.release();
        Ok(())
    }

    /// Stop the machine. Stopping a stopped machine is a no-op.
    pub fn stop(&mut self, hard: bool) -> MachineResult<()> {
        if self.state.status == VmState::Stopped {
            return Ok(());
        }
        self.require(self.state.status.can_stop(), "stop")?;

        if self.state.status != VmState::Stopping {
            self.state.transition_to(VmState::Stopping)?;
        }

        let result = self.stubber.stop_vm(&self.config, hard);
        self.settle(result)?;
        self.state.transition_to(VmState::Stopped)
    }

    /// Update resources. Only a created or stopped machine accepts changes,
    /// and the backend checks the live state again.
    pub fn set_attrs(&mut self, opts: &SetOptions) -> MachineResult<()> {
        self.require(
            matches!(self.state.status, VmState::Created | VmState::Stopped),
            "set attributes on",
        )?;
        self.stubber.set_provider_attrs(&mut self.config, opts)
    }

    pub fn mount_volumes(&self, executor: &dyn RemoteExecutor) -> MachineResult<()> {
        self.require(self.state.status == VmState::Running, "mount volumes in")?;
        self.stubber.mount_volumes_to_vm(&self.config, executor)
    }

    /// Re-read the live state from the backend.
    ///
    /// Only settled states are reconciled. A machine that is still being
    /// created or booting keeps the driver's view.
    pub fn refresh(&mut self) -> MachineResult<VmState> {
        let settled = matches!(
            self.state.status,
            VmState::Running | VmState::Stopping | VmState::Stopped | VmState::Failed
        );
        if !settled {
            return Ok(self.state.status);
        }
        let live = self.stubber.state(&self.config)?;
        if live != self.state.status && live != VmState::Uninitialized {
            tracing::debug!(machine = %self.config.name, from = %self.state.status, to = %live, "Machine state changed outside the driver");
            self.state.force_status(live);
        }
        Ok(self.state.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::os::unix::net::UnixListener;
    use std::io::Write;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;

    use parking_lot::Mutex;

    use crate::backoff::BackoffPolicy;
    use crate::cmdline::CommandLine;
    use crate::config::{MachineDirs, MountType};
    use crate::net::GvproxyCommand;
    use crate::readiness::ReadinessProtocol;
    use crate::supervisor;
    use crate::util::HelperBinaryFinder;
    use crate::vmm::{ReadyUnit, VmType};

    #[derive(Default)]
    struct Script {
        live: Option<VmState>,
        fail_create: bool,
        fail_stop: bool,
        refuse_start: bool,
        calls: Vec<&'static str>,
    }

    struct FakeStubber {
        script: Arc<Mutex<Script>>,
        hypervisor: PathBuf,
        ready_socket: PathBuf,
    }

    struct NoFinder;

    impl HelperBinaryFinder for NoFinder {
        fn find(&self, name: &str) -> MachineResult<PathBuf> {
            Err(MachineError::BinaryNotFound {
                name: name.to_string(),
                reason: "test".into(),
            })
        }
    }

    impl Stubber for FakeStubber {
        fn vm_type(&self) -> VmType {
            VmType::Qemu
        }

        fn create_vm(&self, _opts: &CreateVmOpts, _mc: &mut MachineConfig) -> MachineResult<()> {
            let mut script = self.script.lock();
            script.calls.push("create");
            if script.fail_create {
                return Err(MachineError::DiskResize {
                    path: "disk".into(),
                    reason: "boom".into(),
                });
            }
            Ok(())
        }

        fn start_vm(&self, _mc: &MachineConfig) -> MachineResult<StartHandle> {
            {
                let mut script = self.script.lock();
                script.calls.push("start");
                if script.refuse_start {
                    return Err(MachineError::InvalidStateTransition("already running".into()));
                }
            }
            let process = supervisor::launch(
                &CommandLine::new(self.hypervisor.to_string_lossy()),
                &NoFinder,
            )?;
            Ok(StartHandle::new(
                process,
                &self.ready_socket,
                ReadinessProtocol::new(BackoffPolicy::new(40, std::time::Duration::from_millis(50))),
            ))
        }

        fn state(&self, _mc: &MachineConfig) -> MachineResult<VmState> {
            let script = self.script.lock();
            Ok(script.live.unwrap_or(VmState::Stopped))
        }

        fn stop_vm(&self, _mc: &MachineConfig, _hard: bool) -> MachineResult<()> {
            let mut script = self.script.lock();
            script.calls.push("stop");
            if script.fail_stop {
                return Err(MachineError::Internal("stuck".into()));
            }
            Ok(())
        }

        fn set_provider_attrs(&self, _mc: &mut MachineConfig, _opts: &SetOptions) -> MachineResult<()> {
            let mut script = self.script.lock();
            script.calls.push("set");
            match script.live {
                Some(VmState::Running) => Err(MachineError::InvalidStateTransition("running".into())),
                _ => Ok(()),
            }
        }

        fn start_networking(&self, _mc: &MachineConfig, _cmd: &mut GvproxyCommand) -> MachineResult<()> {
            Ok(())
        }

        fn post_start_networking(&self, _mc: &MachineConfig, _no_info: bool) -> MachineResult<()> {
            Ok(())
        }

        fn stop_host_networking(&self, _mc: &MachineConfig, _vm_type: VmType) -> MachineResult<()> {
            Ok(())
        }

        fn mount_volumes_to_vm(
            &self,
            _mc: &MachineConfig,
            _executor: &dyn RemoteExecutor,
        ) -> MachineResult<()> {
            self.script.lock().calls.push("mount");
            Ok(())
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
            Ok(())
        }

        fn prepare_first_boot(&self, _mc: &MachineConfig) -> MachineResult<Option<ReadyUnit>> {
            Ok(None)
        }

        fn get_disk(
            &self,
            _user_input: Option<&str>,
            _dirs: &MachineDirs,
            _mc: &mut MachineConfig,
        ) -> MachineResult<()> {
            Ok(())
        }
    }

    struct NoopExecutor;

    impl RemoteExecutor for NoopExecutor {
        fn run(&self, _args: &[String]) -> MachineResult<String> {
            Ok(String::new())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        script: Arc<Mutex<Script>>,
        ready_socket: PathBuf,
        machine: Machine,
    }

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn fixture(hypervisor_body: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let script = Arc::new(Mutex::new(Script::default()));
        let ready_socket = dir.path().join("dev.sock");
        let stubber = FakeStubber {
            script: script.clone(),
            hypervisor: write_script(dir.path(), "fake-hv", hypervisor_body),
            ready_socket: ready_socket.clone(),
        };
        let config = MachineConfig::new("dev", MachineDirs::under(dir.path(), VmType::Qemu));
        Fixture {
            _dir: dir,
            script,
            ready_socket,
            machine: Machine::new(config, Box::new(stubber)),
        }
    }

    fn create_opts(machine: &Machine) -> CreateVmOpts {
        CreateVmOpts {
            name: machine.name().to_string(),
            dirs: machine.config().dirs.clone(),
            user_mode_networking: true,
        }
    }

    /// Accept one connection on the ready socket and signal.
    fn signal_ready(path: &Path) -> std::thread::JoinHandle<()> {
        let listener = UnixListener::bind(path).unwrap();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(b"Ready\n").unwrap();
        })
    }

    #[test]
    fn test_create_moves_to_created() {
        let mut f = fixture("sleep 5");
        let opts = create_opts(&f.machine);
        f.machine.create(&opts).unwrap();
        assert_eq!(f.machine.status(), VmState::Created);

        let err = f.machine.create(&opts).unwrap_err();
        assert!(matches!(err, MachineError::InvalidStateTransition(_)));
        assert_eq!(f.machine.status(), VmState::Created);
    }

    #[test]
    fn test_failed_create_marks_failed() {
        let mut f = fixture("sleep 5");
        f.script.lock().fail_create = true;
        let opts = create_opts(&f.machine);

        assert!(f.machine.create(&opts).is_err());
        assert_eq!(f.machine.status(), VmState::Failed);
    }

    #[test]
    fn test_start_wait_stop() {
        let mut f = fixture("sleep 5");
        let opts = create_opts(&f.machine);
        f.machine.create(&opts).unwrap();

        let guest = signal_ready(&f.ready_socket);
        let handle = f.machine.start().unwrap();
        assert_eq!(f.machine.status(), VmState::Starting);

        f.machine.wait_until_running(&handle).unwrap();
        guest.join().unwrap();
        assert_eq!(f.machine.status(), VmState::Running);
        assert!(f.machine.config().last_up.is_some());

        f.machine.stop(false).unwrap();
        assert_eq!(f.machine.status(), VmState::Stopped);
        assert!(crate::util::kill_process(handle.pid()));
        handle.release();

        assert_eq!(f.script.lock().calls, vec!["create", "start", "stop"]);
    }

    #[test]
    fn test_hypervisor_death_fails_start() {
        let mut f = fixture("echo 'could not open disk' >&2\nexit 1");
        let opts = create_opts(&f.machine);
        f.machine.create(&opts).unwrap();

        let handle = f.machine.start().unwrap();
        let err = f.machine.wait_until_running(&handle).unwrap_err();
        assert!(err.is_process_died());
        assert!(err.to_string().contains("could not open disk"));
        assert_eq!(f.machine.status(), VmState::Failed);

        // Failed machines can be stopped.
        f.machine.stop(true).unwrap();
        assert_eq!(f.machine.status(), VmState::Stopped);
    }

    #[test]
    fn test_stop_gates() {
        let mut f = fixture("sleep 5");
        let err = f.machine.stop(false).unwrap_err();
        assert!(matches!(err, MachineError::InvalidStateTransition(_)));
        assert!(f.script.lock().calls.is_empty());

        let opts = create_opts(&f.machine);
        f.machine.create(&opts).unwrap();
        assert!(f.machine.stop(false).is_err());
        assert_eq!(f.machine.status(), VmState::Created);
    }

    #[test]
    fn test_stop_when_stopped_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let script = Arc::new(Mutex::new(Script::default()));
        let stubber = FakeStubber {
            script: script.clone(),
            hypervisor: PathBuf::from("/bin/true"),
            ready_socket: dir.path().join("dev.sock"),
        };
        let config = MachineConfig::new("dev", MachineDirs::under(dir.path(), VmType::Qemu));
        let mut machine = Machine::load(config, Box::new(stubber)).unwrap();

        assert_eq!(machine.status(), VmState::Stopped);
        machine.stop(false).unwrap();
        assert!(script.lock().calls.is_empty());
    }

    #[test]
    fn test_failed_stop_marks_failed() {
        let dir = tempfile::tempdir().unwrap();
        let script = Arc::new(Mutex::new(Script {
            live: Some(VmState::Running),
            fail_stop: true,
            ..Default::default()
        }));
        let stubber = FakeStubber {
            script: script.clone(),
            hypervisor: PathBuf::from("/bin/true"),
            ready_socket: dir.path().join("dev.sock"),
        };
        let config = MachineConfig::new("dev", MachineDirs::under(dir.path(), VmType::Qemu));
        let mut machine = Machine::load(config, Box::new(stubber)).unwrap();
        assert_eq!(machine.status(), VmState::Running);

        assert!(machine.stop(false).is_err());
        assert_eq!(machine.status(), VmState::Failed);
    }

    #[test]
    fn test_set_attrs_rejection_keeps_state() {
        let dir = tempfile::tempdir().unwrap();
        let script = Arc::new(Mutex::new(Script {
            live: Some(VmState::Running),
            ..Default::default()
        }));
        let stubber = FakeStubber {
            script: script.clone(),
            hypervisor: PathBuf::from("/bin/true"),
            ready_socket: dir.path().join("dev.sock"),
        };
        let config = MachineConfig::new("dev", MachineDirs::under(dir.path(), VmType::Qemu));
        let mut machine = Machine::load(config, Box::new(stubber)).unwrap();

        let err = machine
            .set_attrs(&SetOptions {
                cpus: Some(4),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, MachineError::InvalidStateTransition(_)));
        assert_eq!(machine.status(), VmState::Running);
        assert!(script.lock().calls.is_empty());
    }

    #[test]
    fn test_set_attrs_rejected_while_starting() {
        let mut f = fixture("sleep 5");
        let opts = create_opts(&f.machine);
        f.machine.create(&opts).unwrap();
        f.machine
            .set_attrs(&SetOptions {
                cpus: Some(4),
                ..Default::default()
            })
            .unwrap();

        let handle = f.machine.start().unwrap();
        let err = f
            .machine
            .set_attrs(&SetOptions {
                disk_size_gib: Some(20),
                ..Default::default()
            })
            .unwrap_err();

        assert!(matches!(err, MachineError::InvalidStateTransition(_)));
        assert_eq!(f.machine.status(), VmState::Starting);
        assert_eq!(f.script.lock().calls, vec!["create", "set", "start"]);

        crate::util::kill_process(handle.pid());
        handle.release();
    }

    #[test]
    fn test_set_attrs_rejected_when_failed() {
        let mut f = fixture("sleep 5");
        f.script.lock().fail_create = true;
        let opts = create_opts(&f.machine);
        assert!(f.machine.create(&opts).is_err());

        let err = f.machine.set_attrs(&SetOptions::default()).unwrap_err();
        assert!(matches!(err, MachineError::InvalidStateTransition(_)));
        assert_eq!(f.machine.status(), VmState::Failed);
        assert_eq!(f.script.lock().calls, vec!["create"]);
    }

    #[test]
    fn test_refused_start_restores_status() {
        let mut f = fixture("sleep 5");
        let opts = create_opts(&f.machine);
        f.machine.create(&opts).unwrap();
        f.script.lock().refuse_start = true;

        let err = f.machine.start().unwrap_err();
        assert!(matches!(err, MachineError::InvalidStateTransition(_)));
        assert_eq!(f.machine.status(), VmState::Created);
    }

    #[test]
    fn test_mount_requires_running() {
        let mut f = fixture("sleep 5");
        let opts = create_opts(&f.machine);
        f.machine.create(&opts).unwrap();

        assert!(f.machine.mount_volumes(&NoopExecutor).is_err());
        assert_eq!(f.script.lock().calls, vec!["create"]);
    }

    #[test]
    fn test_refresh_picks_up_vanished_process() {
        let dir = tempfile::tempdir().unwrap();
        let script = Arc::new(Mutex::new(Script {
            live: Some(VmState::Running),
            ..Default::default()
        }));
        let stubber = FakeStubber {
            script: script.clone(),
            hypervisor: PathBuf::from("/bin/true"),
            ready_socket: dir.path().join("dev.sock"),
        };
        let config = MachineConfig::new("dev", MachineDirs::under(dir.path(), VmType::Qemu));
        let mut machine = Machine::load(config, Box::new(stubber)).unwrap();
        machine.mount_volumes(&NoopExecutor).unwrap();

        script.lock().live = Some(VmState::Stopped);
        assert_eq!(machine.refresh().unwrap(), VmState::Stopped);
        assert_eq!(machine.status(), VmState::Stopped);
    }
}
