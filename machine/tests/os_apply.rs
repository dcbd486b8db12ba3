//! Integration tests for applying guest OS images.

use machine::{Machine, MachineError, MachineOs, VmState};
use machine_test_utils::{FakeQmp, PowerdownAction, QemuHarness, RecordingExecutor, kill_pid_from};

/// A machine the backend reports as running, plus the fake monitor.
fn running_machine(harness: &QemuHarness) -> (Machine, FakeQmp, std::path::PathBuf) {
    let mc = harness.created_config("dev");
    let qemu = mc.qemu().unwrap().clone();
    let qmp = FakeQmp::start_with(
        qemu.monitor.address.path(),
        "running",
        PowerdownAction::KillAndExit,
        Some(qemu.pid_file.path().to_path_buf()),
    );
    let machine = Machine::load(mc, Box::new(harness.stubber())).unwrap();
    assert_eq!(machine.status(), VmState::Running);
    (machine, qmp, qemu.pid_file.path().to_path_buf())
}

#[test]
fn apply_runs_rebase_in_guest() {
    let harness = QemuHarness::new();
    let (mut machine, qmp, _) = running_machine(&harness);
    let executor = RecordingExecutor::new();

    MachineOs::new(&mut machine, &executor, false)
        .apply("quay.io/podman/machine-os:5.0")
        .unwrap();

    assert_eq!(
        executor.commands(),
        vec!["podman machine os apply quay.io/podman/machine-os:5.0"]
    );
    assert!(!qmp.received("system_powerdown"));
    assert_eq!(machine.status(), VmState::Running);
}

#[test]
fn failed_apply_does_not_restart() {
    let harness = QemuHarness::new();
    let (mut machine, qmp, _) = running_machine(&harness);
    let executor = RecordingExecutor::failing_on("os apply");

    let err = MachineOs::new(&mut machine, &executor, true)
        .apply("quay.io/podman/machine-os:5.0")
        .unwrap_err();

    assert!(matches!(err.root(), MachineError::RemoteCommand { .. }));
    assert!(!qmp.received("system_powerdown"));
    assert_eq!(machine.status(), VmState::Running);
}

#[test]
fn apply_with_restart_cycles_machine() {
    let harness = QemuHarness::new();
    let (mut machine, qmp, pid_file) = running_machine(&harness);

    // The running hypervisor the monitor will power off.
    let sleeper = std::process::Command::new("sleep").arg("30").spawn().unwrap();
    std::fs::write(&pid_file, sleeper.id().to_string()).unwrap();

    harness.install_hypervisor(machine.config());
    let _proxy = harness.proxy(machine.config());
    let guest = harness.guest(machine.config());
    let executor = RecordingExecutor::new();

    MachineOs::new(&mut machine, &executor, true)
        .apply("quay.io/podman/machine-os:5.0")
        .unwrap();

    assert!(qmp.received("system_powerdown"));
    assert!(guest.join().unwrap());
    assert_eq!(machine.status(), VmState::Running);

    kill_pid_from(&pid_file);
}

#[test]
fn apply_requires_running_machine() {
    let harness = QemuHarness::new();
    let mut machine = Machine::load(harness.created_config("dev"), Box::new(harness.stubber())).unwrap();
    assert_eq!(machine.status(), VmState::Stopped);
    let executor = RecordingExecutor::new();

    let err = MachineOs::new(&mut machine, &executor, true)
        .apply("quay.io/podman/machine-os:5.0")
        .unwrap_err();

    assert!(matches!(err, MachineError::InvalidStateTransition(_)));
    assert!(executor.commands().is_empty());
    assert_eq!(machine.status(), VmState::Stopped);
}
