//! Integration tests for changing machine attributes.

use machine::config::UsbConfig;
use machine::vmm::{SetOptions, Stubber};
use machine::{Machine, MachineError, VmState};
use machine_test_utils::{FakeQmp, QemuHarness};

fn grow_and_toggle() -> SetOptions {
    SetOptions {
        cpus: Some(4),
        memory_mib: Some(4096),
        disk_size_gib: Some(20),
        rootful: Some(true),
        usbs: Some(vec!["vendor=13d3,product=5406".into()]),
    }
}

#[test]
fn running_machine_rejects_changes_without_side_effects() {
    let harness = QemuHarness::new();
    let mut mc = harness.created_config("dev");
    let before = mc.clone();
    let _qmp = FakeQmp::start(mc.qemu().unwrap().monitor.address.path(), "running");

    let err = harness
        .stubber()
        .set_provider_attrs(&mut mc, &grow_and_toggle())
        .unwrap_err();

    assert!(matches!(err, MachineError::InvalidStateTransition(_)));
    assert!(harness.resize_calls().is_empty());
    assert_eq!(mc.resources, before.resources);
    assert_eq!(mc.host_user, before.host_user);
}

#[test]
fn paused_machine_also_rejects_changes() {
    let harness = QemuHarness::new();
    let mut mc = harness.created_config("dev");
    let _qmp = FakeQmp::start(mc.qemu().unwrap().monitor.address.path(), "paused");

    let err = harness
        .stubber()
        .set_provider_attrs(&mut mc, &SetOptions {
            cpus: Some(8),
            ..Default::default()
        })
        .unwrap_err();
    assert!(matches!(err, MachineError::InvalidStateTransition(_)));
    assert_eq!(mc.resources.cpus, 2);
}

#[test]
fn stopped_machine_applies_changes() {
    let harness = QemuHarness::new();
    let mut mc = harness.created_config("dev");

    harness
        .stubber()
        .set_provider_attrs(&mut mc, &grow_and_toggle())
        .unwrap();

    assert_eq!(mc.resources.cpus, 4);
    assert_eq!(mc.resources.memory_mib, 4096);
    assert_eq!(mc.resources.disk_size_gib, 20);
    assert_eq!(
        mc.resources.usbs,
        vec![UsbConfig::Id {
            vendor: 0x13d3,
            product: 0x5406
        }]
    );
    assert!(mc.host_user.rootful);
    assert!(mc.host_user.modified);

    let calls = harness.resize_calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].ends_with(" 20G"));
}

#[test]
fn same_disk_size_skips_resize() {
    let harness = QemuHarness::new();
    let mut mc = harness.created_config("dev");

    harness
        .stubber()
        .set_provider_attrs(&mut mc, &SetOptions {
            disk_size_gib: Some(10),
            rootful: Some(false),
            ..Default::default()
        })
        .unwrap();

    assert!(harness.resize_calls().is_empty());
    assert!(!mc.host_user.modified);
}

#[test]
fn malformed_usb_rejected_before_resize() {
    let harness = QemuHarness::new();
    let mut mc = harness.created_config("dev");

    let err = harness
        .stubber()
        .set_provider_attrs(&mut mc, &SetOptions {
            disk_size_gib: Some(40),
            usbs: Some(vec!["bus=1".into()]),
            ..Default::default()
        })
        .unwrap_err();

    assert!(matches!(err.root(), MachineError::Config(_)));
    assert!(harness.resize_calls().is_empty());
    assert_eq!(mc.resources.disk_size_gib, 10);
}

#[test]
fn driver_defers_gate_to_live_state() {
    let harness = QemuHarness::new();
    let mc = harness.created_config("dev");
    let monitor = mc.qemu().unwrap().monitor.address.path().to_path_buf();
    let mut machine = Machine::load(mc, Box::new(harness.stubber())).unwrap();
    assert_eq!(machine.status(), VmState::Stopped);

    // Started behind the driver's back.
    let _qmp = FakeQmp::start(&monitor, "running");
    let err = machine.set_attrs(&grow_and_toggle()).unwrap_err();

    assert!(matches!(err, MachineError::InvalidStateTransition(_)));
    assert!(harness.resize_calls().is_empty());
    assert_eq!(machine.status(), VmState::Stopped);
}

#[test]
fn driver_rejects_changes_while_starting() {
    let harness = QemuHarness::new();
    let mut machine = Machine::new(harness.config("dev"), Box::new(harness.stubber()));
    machine.create(&harness.create_opts("dev")).unwrap();
    let resizes = harness.resize_calls().len();

    harness.install_hypervisor(machine.config());
    let _proxy = harness.proxy(machine.config());
    let handle = machine.start().unwrap();
    assert_eq!(machine.status(), VmState::Starting);

    // No monitor socket yet, so the live query alone would report Stopped.
    let err = machine.set_attrs(&grow_and_toggle()).unwrap_err();

    assert!(matches!(err, MachineError::InvalidStateTransition(_)));
    assert_eq!(harness.resize_calls().len(), resizes);
    assert_eq!(machine.config().resources.disk_size_gib, 10);
    assert!(!machine.config().host_user.rootful);
    assert_eq!(machine.status(), VmState::Starting);

    machine::util::kill_process(handle.pid());
    handle.release();
}

#[test]
fn driver_applies_changes_once_created() {
    let harness = QemuHarness::new();
    let mut machine = Machine::new(harness.config("dev"), Box::new(harness.stubber()));
    machine.create(&harness.create_opts("dev")).unwrap();

    machine.set_attrs(&grow_and_toggle()).unwrap();

    assert_eq!(machine.config().resources.disk_size_gib, 20);
    assert!(machine.config().host_user.rootful);
    assert_eq!(machine.status(), VmState::Created);
}
