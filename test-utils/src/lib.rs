//! Shared fixtures for machine integration tests.
//!
//! Stand-ins for the external pieces a machine talks to: helper binaries as
//! shell scripts, a QMP monitor, the network proxy socket, the guest's
//! ready signal and the remote command transport.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use machine::backoff::BackoffPolicy;
use machine::config::{MachineConfig, MachineDirs, MachineFile};
use machine::remote::RemoteExecutor;
use machine::util::HelperBinaryFinder;
use machine::vmm::qemu::{QemuStubber, binary_name};
use machine::vmm::{CreateVmOpts, Stubber, StubberOptions, VmType};
use machine_shared::errors::{MachineError, MachineResult};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tempfile::TempDir;

// ============================================================================
// HELPER BINARIES
// ============================================================================

/// Write an executable `/bin/sh` script.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("chmod script");
    path
}

/// `qemu-img` that appends its arguments to `log`.
pub fn fake_qemu_img(bin: &Path, log: &Path) -> PathBuf {
    write_script(bin, "qemu-img", &format!("echo \"$@\" >> {}", log.display()))
}

/// A hypervisor that records its arguments and pid, then idles.
///
/// `args_log` appears only after launch, so tests can use it as a "process
/// is up" signal.
pub fn fake_hypervisor(bin: &Path, name: &str, args_log: &Path, pid_log: &Path) -> PathBuf {
    write_script(
        bin,
        name,
        &format!(
            "echo $$ > {pid}\necho \"$@\" > {args}\nexec sleep 30",
            pid = pid_log.display(),
            args = args_log.display()
        ),
    )
}

/// A hypervisor that fails immediately with `message` on stderr.
pub fn crashing_hypervisor(bin: &Path, name: &str, message: &str) -> PathBuf {
    write_script(bin, name, &format!("echo '{}' >&2\nexit 1", message))
}

/// Finds helpers only in one directory.
#[derive(Debug, Clone)]
pub struct DirFinder(pub PathBuf);

impl HelperBinaryFinder for DirFinder {
    fn find(&self, name: &str) -> MachineResult<PathBuf> {
        let path = self.0.join(name);
        if path.is_file() {
            Ok(path)
        } else {
            Err(MachineError::BinaryNotFound {
                name: name.to_string(),
                reason: format!("not in {}", self.0.display()),
            })
        }
    }
}

/// Kill a process started by a fake hypervisor script, if still around.
pub fn kill_pid_from(pid_log: &Path) {
    if let Ok(raw) = std::fs::read_to_string(pid_log)
        && let Ok(pid) = raw.trim().parse::<i32>()
    {
        unsafe {
            libc::kill(pid, libc::SIGKILL);
        }
    }
}

/// Poll until `path` exists.
pub fn wait_for_file(path: &Path, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if path.exists() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

// ============================================================================
// REMOTE TRANSPORT
// ============================================================================

/// Records every remote command; optionally fails the ones containing a
/// marker.
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    calls: Mutex<Vec<String>>,
    fail_on: Option<String>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(marker: impl Into<String>) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_on: Some(marker.into()),
        }
    }

    /// Commands in issue order, arguments joined by spaces.
    pub fn commands(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

impl RemoteExecutor for RecordingExecutor {
    fn run(&self, args: &[String]) -> MachineResult<String> {
        let command = args.join(" ");
        self.calls.lock().push(command.clone());
        match &self.fail_on {
            Some(marker) if command.contains(marker.as_str()) => {
                Err(MachineError::RemoteCommand {
                    command,
                    reason: "exit status 1".into(),
                })
            }
            _ => Ok(String::new()),
        }
    }
}

// ============================================================================
// QMP MONITOR
// ============================================================================

/// What the fake monitor does on `system_powerdown`.
#[derive(Debug, Clone, Copy, Default)]
pub enum PowerdownAction {
    /// Acknowledge and keep serving.
    #[default]
    Ignore,
    /// Kill the hypervisor, stop serving and remove the socket, as QEMU
    /// does when the guest powers off.
    KillAndExit,
}

/// A QMP server on a Unix socket, one session at a time.
pub struct FakeQmp {
    socket: PathBuf,
    commands: Arc<Mutex<Vec<String>>>,
    _server: JoinHandle<()>,
}

impl FakeQmp {
    /// Serve `status` for `query-status`.
    pub fn start(socket: &Path, status: &str) -> Self {
        Self::start_with(socket, status, PowerdownAction::Ignore, None)
    }

    /// Serve `status`; on powerdown kill the pid recorded in `pid_file`.
    pub fn start_with(
        socket: &Path,
        status: &str,
        powerdown: PowerdownAction,
        pid_file: Option<PathBuf>,
    ) -> Self {
        let listener = UnixListener::bind(socket).expect("bind qmp socket");
        let commands = Arc::new(Mutex::new(Vec::new()));
        let status = status.to_string();
        let path = socket.to_path_buf();

        let seen = commands.clone();
        let server = std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { return };
                let exit = serve_session(stream, &status, powerdown, pid_file.as_deref(), &seen);
                if exit {
                    let _ = std::fs::remove_file(&path);
                    return;
                }
            }
        });

        Self {
            socket: socket.to_path_buf(),
            commands,
            _server: server,
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Commands received across all sessions, `qmp_capabilities` included.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    pub fn received(&self, command: &str) -> bool {
        self.commands.lock().iter().any(|c| c == command)
    }
}

/// Returns true when the server should stop.
fn serve_session(
    stream: std::os::unix::net::UnixStream,
    status: &str,
    powerdown: PowerdownAction,
    pid_file: Option<&Path>,
    seen: &Mutex<Vec<String>>,
) -> bool {
    let Ok(mut writer) = stream.try_clone() else {
        return false;
    };
    let mut reader = BufReader::new(stream);
    if writer
        .write_all(b"{\"QMP\": {\"version\": {}, \"capabilities\": []}}\n")
        .is_err()
    {
        return false;
    }

    let mut exit = false;
    let mut line = String::new();
    while matches!(reader.read_line(&mut line), Ok(n) if n > 0) {
        let command = serde_json::from_str::<Value>(line.trim())
            .ok()
            .and_then(|msg| msg["execute"].as_str().map(String::from))
            .unwrap_or_default();
        line.clear();

        let reply = match command.as_str() {
            "query-status" => {
                json!({"return": {"status": status, "running": (status == "running")}})
            }
            _ => json!({"return": {}}),
        };
        let _ = writer.write_all(format!("{}\n", reply).as_bytes());

        if command == "system_powerdown"
            && let PowerdownAction::KillAndExit = powerdown
        {
            if let Some(pid_file) = pid_file {
                kill_pid_from(pid_file);
            }
            exit = true;
        }
        seen.lock().push(command);
    }
    exit
}

// ============================================================================
// PROXY AND GUEST SIGNALS
// ============================================================================

/// Listening socket standing in for the network proxy.
pub struct FakeProxy {
    _listener: UnixListener,
}

impl FakeProxy {
    pub fn bind(socket: &Path) -> Self {
        Self {
            _listener: UnixListener::bind(socket).expect("bind proxy socket"),
        }
    }
}

/// Once `trigger` exists, listen on `ready_socket` and send the ready line to
/// the first connection, as the guest would over its serial port.
pub fn signal_ready_after(trigger: PathBuf, ready_socket: PathBuf) -> JoinHandle<bool> {
    std::thread::spawn(move || {
        if !wait_for_file(&trigger, Duration::from_secs(5)) {
            return false;
        }
        let Ok(listener) = UnixListener::bind(&ready_socket) else {
            return false;
        };
        match listener.accept() {
            Ok((mut stream, _)) => stream.write_all(b"Ready\n").is_ok(),
            Err(_) => false,
        }
    })
}

// ============================================================================
// QEMU HARNESS
// ============================================================================

/// Isolated machine home with fake helpers and short timeouts.
pub struct QemuHarness {
    pub dir: TempDir,
    pub bin: PathBuf,
    pub dirs: MachineDirs,
    pub qemu_img_log: PathBuf,
    pub hypervisor_args: PathBuf,
}

impl QemuHarness {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let bin = dir.path().join("bin");
        std::fs::create_dir_all(&bin).expect("create bin dir");
        let qemu_img_log = dir.path().join("qemu-img.log");
        fake_qemu_img(&bin, &qemu_img_log);

        let dirs = MachineDirs::under(&dir.path().join("home"), VmType::Qemu);
        dirs.prepare().expect("prepare machine dirs");

        Self {
            hypervisor_args: dir.path().join("hypervisor.args"),
            dir,
            bin,
            dirs,
            qemu_img_log,
        }
    }

    pub fn options(&self) -> StubberOptions {
        StubberOptions {
            finder: Arc::new(DirFinder(self.bin.clone())),
            readiness: BackoffPolicy::new(40, Duration::from_millis(50)),
            proxy: BackoffPolicy::new(3, Duration::from_millis(20)),
            stop: BackoffPolicy::new(10, Duration::from_millis(20)),
            ready_line_timeout: Some(Duration::from_secs(5)),
            ..StubberOptions::default()
        }
    }

    pub fn stubber(&self) -> QemuStubber {
        QemuStubber::new(self.options())
    }

    /// Config with a disk image, not yet created.
    pub fn config(&self, name: &str) -> MachineConfig {
        let mut mc = MachineConfig::new(name, self.dirs.clone());
        let image = self.dirs.data_dir.join(format!("{}.qcow2", name));
        std::fs::write(&image, b"").expect("write disk image");
        mc.image_path = Some(MachineFile::new(image, None).expect("image path"));
        mc.resources.disk_size_gib = 10;
        mc
    }

    pub fn create_opts(&self, name: &str) -> CreateVmOpts {
        CreateVmOpts {
            name: name.to_string(),
            dirs: self.dirs.clone(),
            user_mode_networking: true,
        }
    }

    /// Config after `create_vm`, with the resize log reset.
    pub fn created_config(&self, name: &str) -> MachineConfig {
        let mut mc = self.config(name);
        self.stubber()
            .create_vm(&self.create_opts(name), &mut mc)
            .expect("create_vm");
        let _ = std::fs::remove_file(&self.qemu_img_log);
        mc
    }

    pub fn hypervisor_name(&self) -> String {
        binary_name(std::env::consts::ARCH)
    }

    /// Install a hypervisor that writes its pid where QEMU's `-pidfile`
    /// would put it.
    pub fn install_hypervisor(&self, mc: &MachineConfig) -> PathBuf {
        let pid_file = mc.qemu().expect("qemu config").pid_file.path().to_path_buf();
        fake_hypervisor(
            &self.bin,
            &self.hypervisor_name(),
            &self.hypervisor_args,
            &pid_file,
        )
    }

    pub fn install_crashing_hypervisor(&self, message: &str) -> PathBuf {
        crashing_hypervisor(&self.bin, &self.hypervisor_name(), message)
    }

    /// Arguments of every `qemu-img` invocation so far.
    pub fn resize_calls(&self) -> Vec<String> {
        std::fs::read_to_string(&self.qemu_img_log)
            .unwrap_or_default()
            .lines()
            .map(String::from)
            .collect()
    }

    /// Bind the network proxy socket for `mc`.
    pub fn proxy(&self, mc: &MachineConfig) -> FakeProxy {
        FakeProxy::bind(mc.gvproxy_socket().expect("proxy socket").path())
    }

    /// Signal readiness once the fake hypervisor is up.
    pub fn guest(&self, mc: &MachineConfig) -> JoinHandle<bool> {
        signal_ready_after(
            self.hypervisor_args.clone(),
            mc.ready_socket().expect("ready socket").path().to_path_buf(),
        )
    }
}

impl Default for QemuHarness {
    fn default() -> Self {
        Self::new()
    }
}
