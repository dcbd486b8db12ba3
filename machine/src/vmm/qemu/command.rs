//! QEMU invocation builder.
//!
//! Token groups, in order: binary, arch options, boot disk, memory, CPUs,
//! first-boot config, QMP monitor, network, ready serial port and pid file,
//! one `-virtfs` per mount, USB passthrough, display.

use machine_shared::constants::{network, readiness};
use machine_shared::errors::MachineResult;

use crate::cmdline::CommandLine;
use crate::config::{MachineConfig, MachineFile, MonitorConfig, MountSpec, UsbConfig};

/// Accelerator and machine options for `arch` (as in `std::env::consts::ARCH`).
pub fn arch_options(arch: &str) -> Vec<String> {
    let mut opts: Vec<String> = ["-accel", "kvm", "-cpu", "host"].map(String::from).to_vec();
    if arch == "aarch64" {
        opts.push("-M".to_string());
        opts.push("virt".to_string());
    }
    opts
}

/// QEMU system emulator for `arch`.
pub fn binary_name(arch: &str) -> String {
    format!("qemu-system-{}", arch)
}

/// Appends QEMU option groups to a [`CommandLine`].
#[derive(Debug, Clone)]
pub struct QemuCmd {
    cmd: CommandLine,
}

impl QemuCmd {
    pub fn new(binary: &str, options: &[String]) -> Self {
        let mut cmd = CommandLine::new(binary);
        cmd.args(options.iter().cloned());
        Self { cmd }
    }

    pub fn set_bootable_image(&mut self, image: &str) -> &mut Self {
        self.cmd.opt("-drive", format!("if=virtio,file={}", image));
        self
    }

    pub fn set_memory(&mut self, memory_mib: u64) -> &mut Self {
        self.cmd.opt("-m", memory_mib.to_string());
        self
    }

    pub fn set_cpus(&mut self, cpus: u64) -> &mut Self {
        self.cmd.opt("-smp", cpus.to_string());
        self
    }

    pub fn set_ignition_file(&mut self, file: &MachineFile) -> &mut Self {
        self.cmd.opt(
            "-fw_cfg",
            format!("name=opt/com.coreos/config,file={}", file.path().display()),
        );
        self
    }

    pub fn set_qmp_monitor(&mut self, monitor: &MonitorConfig) -> &mut Self {
        self.cmd.opt(
            "-qmp",
            format!(
                "{}:{},server=on,wait=off",
                monitor.network,
                monitor.address.path().display()
            ),
        );
        self
    }

    pub fn set_network(&mut self, proxy_socket: &MachineFile) -> &mut Self {
        self.cmd.opt(
            "-netdev",
            format!(
                "stream,id={},server=off,addr.type=unix,addr.path={}",
                network::NETDEV_ID,
                proxy_socket.path().display()
            ),
        );
        self.cmd.opt(
            "-device",
            format!(
                "virtio-net-pci,netdev={},mac={}",
                network::NETDEV_ID,
                network::GUEST_MAC
            ),
        );
        self
    }

    pub fn set_serial_port(
        &mut self,
        ready_socket: &MachineFile,
        pid_file: &MachineFile,
        name: &str,
    ) -> &mut Self {
        let chardev = format!("a{}_ready", name);
        self.cmd.opt("-device", "virtio-serial");
        self.cmd.opt(
            "-chardev",
            format!(
                "socket,path={},server=on,wait=off,id={}",
                ready_socket.path().display(),
                chardev
            ),
        );
        self.cmd.opt(
            "-device",
            format!(
                "virtserialport,chardev={},name={}",
                chardev,
                readiness::SERIAL_PORT_NAME
            ),
        );
        self.cmd.opt("-pidfile", pid_file.path().display().to_string());
        self
    }

    pub fn set_virtfs_mount(&mut self, mount: &MountSpec) -> &mut Self {
        let mut value = format!(
            "local,path={},mount_tag={},security_model={}",
            mount.source.display(),
            mount.tag,
            mount.security_model
        );
        if mount.read_only {
            value.push_str(",readonly");
        }
        self.cmd.opt("-virtfs", value);
        self
    }

    pub fn set_usb_host_passthrough(&mut self, usbs: &[UsbConfig]) -> &mut Self {
        if usbs.is_empty() {
            return self;
        }
        self.cmd.opt("-device", "qemu-xhci");
        for usb in usbs {
            let device = match usb {
                UsbConfig::Address { bus, devnum } => {
                    format!("usb-host,hostbus={},hostaddr={}", bus, devnum)
                }
                UsbConfig::Id { vendor, product } => {
                    format!("usb-host,vendorid={},productid={}", vendor, product)
                }
            };
            self.cmd.opt("-device", device);
        }
        self
    }

    pub fn set_display(&mut self, display: &str) -> &mut Self {
        self.cmd.opt("-display", display);
        self
    }

    pub fn build(self) -> CommandLine {
        self.cmd
    }
}

/// Builds the full command line for a machine.
#[derive(Debug, Clone)]
pub struct QemuCommandBuilder {
    binary: String,
    arch_options: Vec<String>,
    verbose: bool,
}

impl QemuCommandBuilder {
    pub fn new(binary: impl Into<String>, arch_options: Vec<String>) -> Self {
        Self {
            binary: binary.into(),
            arch_options,
            verbose: false,
        }
    }

    /// Keep the display when verbose diagnostics are enabled.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Fails if the machine lacks a disk image, hypervisor sub-config or any
    /// socket path.
    pub fn build(&self, mc: &MachineConfig, first_boot: &MachineFile) -> MachineResult<CommandLine> {
        let qemu = mc.qemu()?;
        let image = mc.image()?;
        let ready_socket = mc.ready_socket()?;
        let proxy_socket = mc.gvproxy_socket()?;

        let mut cmd = QemuCmd::new(&self.binary, &self.arch_options);
        cmd.set_bootable_image(&image.path().display().to_string())
            .set_memory(mc.resources.memory_mib)
            .set_cpus(mc.resources.cpus)
            .set_ignition_file(first_boot)
            .set_qmp_monitor(&qemu.monitor)
            .set_network(&proxy_socket)
            .set_serial_port(&ready_socket, &qemu.pid_file, &mc.name);

        for mount in &mc.mounts {
            cmd.set_virtfs_mount(mount);
        }

        cmd.set_usb_host_passthrough(&mc.resources.usbs);

        if !self.verbose {
            cmd.set_display("none");
        }

        Ok(cmd.build())
    }
}
