//! QMP (QEMU Machine Protocol) client.
//!
//! Line-delimited JSON over the monitor's Unix socket: the server greets,
//! the client negotiates capabilities, then issues commands. Asynchronous
//! events may arrive between a command and its reply and are skipped.

use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use machine_shared::errors::{MachineError, MachineResult};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::config::{MachineFile, MonitorConfig};
use crate::state::VmState;

/// Monitor descriptor at `<runtime_dir>/qmp_<name>.sock`.
pub fn new_qmp_monitor(
    name: &str,
    runtime_dir: &Path,
    timeout: Duration,
) -> MachineResult<MonitorConfig> {
    let address = MachineFile::new(runtime_dir.join(format!("qmp_{}.sock", name)), None)?;
    Ok(MonitorConfig {
        network: "unix".to_string(),
        address,
        timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
    })
}

/// Run status reported by `query-status`.
#[derive(Debug, Clone, Deserialize)]
pub struct QmpStatus {
    pub status: String,
    #[serde(default)]
    pub running: bool,
}

impl QmpStatus {
    pub fn to_vm_state(&self) -> VmState {
        match self.status.as_str() {
            "shutdown" | "guest-panicked" | "internal-error" | "io-error" => VmState::Stopping,
            _ => VmState::Running,
        }
    }
}

#[derive(Debug, Deserialize)]
struct QmpError {
    class: String,
    desc: String,
}

/// Connected and negotiated QMP session.
#[derive(Debug)]
pub struct QmpClient {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
}

impl QmpClient {
    /// Connect without negotiating. The raw error is kept so callers can
    /// treat a missing or refusing socket as a stopped machine.
    pub fn dial(config: &MonitorConfig) -> io::Result<UnixStream> {
        if config.network != "unix" {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unsupported monitor network '{}'", config.network),
            ));
        }
        let stream = UnixStream::connect(config.address.path())?;
        stream.set_read_timeout(Some(config.timeout()))?;
        stream.set_write_timeout(Some(config.timeout()))?;
        Ok(stream)
    }

    /// Greet and negotiate capabilities on an established stream.
    pub fn handshake(stream: UnixStream) -> MachineResult<Self> {
        let writer = stream.try_clone()?;
        let mut client = Self {
            reader: BufReader::new(stream),
            writer,
        };

        let greeting = client.read_message()?;
        if greeting.get("QMP").is_none() {
            return Err(MachineError::Monitor(format!(
                "unexpected greeting: {}",
                greeting
            )));
        }

        client.execute("qmp_capabilities")?;
        Ok(client)
    }

    pub fn connect(config: &MonitorConfig) -> MachineResult<Self> {
        let stream = Self::dial(config).map_err(|e| {
            MachineError::Monitor(format!(
                "connecting to {}: {}",
                config.address.path().display(),
                e
            ))
        })?;
        Self::handshake(stream)
    }

    fn read_message(&mut self) -> MachineResult<Value> {
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .map_err(|e| MachineError::Monitor(format!("reading from monitor: {}", e)))?;
        if n == 0 {
            return Err(MachineError::Monitor("monitor closed the connection".into()));
        }
        Ok(serde_json::from_str(line.trim())?)
    }

    /// Send `command` and return its `return` payload.
    pub fn execute(&mut self, command: &str) -> MachineResult<Value> {
        let mut request = serde_json::to_vec(&json!({ "execute": command }))?;
        request.push(b'\n');
        self.writer
            .write_all(&request)
            .map_err(|e| MachineError::Monitor(format!("sending {}: {}", command, e)))?;

        loop {
            let message = self.read_message()?;
            if let Some(event) = message.get("event") {
                tracing::trace!(event = %event, "Skipping QMP event");
                continue;
            }
            if let Some(ret) = message.get("return") {
                return Ok(ret.clone());
            }
            if let Some(err) = message.get("error") {
                let err: QmpError = serde_json::from_value(err.clone())?;
                return Err(MachineError::Monitor(format!(
                    "{} failed: {}: {}",
                    command, err.class, err.desc
                )));
            }
            return Err(MachineError::Monitor(format!(
                "unexpected reply to {}: {}",
                command, message
            )));
        }
    }

    pub fn query_status(&mut self) -> MachineResult<QmpStatus> {
        let ret = self.execute("query-status")?;
        Ok(serde_json::from_value(ret)?)
    }

    /// Ask the guest to power off (ACPI).
    pub fn system_powerdown(&mut self) -> MachineResult<()> {
        self.execute("system_powerdown").map(|_| ())
    }
}

/// Live machine state through the monitor.
///
/// A missing or refusing socket means the hypervisor is not running.
pub fn query_state(config: &MonitorConfig) -> MachineResult<VmState> {
    let stream = match QmpClient::dial(config) {
        Ok(stream) => stream,
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
            ) =>
        {
            return Ok(VmState::Stopped);
        }
        Err(e) => {
            return Err(MachineError::Monitor(format!(
                "connecting to {}: {}",
                config.address.path().display(),
                e
            )));
        }
    };

    let status = QmpClient::handshake(stream)?.query_status()?;
    tracing::trace!(status = %status.status, running = status.running, "QMP status");
    Ok(status.to_vm_state())
}
