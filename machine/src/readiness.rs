//! Guest boot-completion signal.
//!
//! The guest opens the ready socket (a virtio serial port backed by a Unix
//! socket on the host) and writes a single newline-terminated line once boot
//! finishes. Only the arrival of the line matters.

use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::time::Duration;

use machine_shared::errors::{MachineError, MachineResult, ResultExt};

use crate::backoff::{self, BackoffPolicy, ProcessHealthCheck, UnixEndpoint};
use crate::supervisor::StderrBuffer;
use crate::util::{ProcessStatus, check_process_status};

/// Health check bound to a bare pid and a stderr buffer.
#[derive(Debug, Clone)]
pub struct PidHealthCheck {
    name: String,
    pid: u32,
    stderr: StderrBuffer,
}

impl PidHealthCheck {
    pub fn new(name: impl Into<String>, pid: u32, stderr: StderrBuffer) -> Self {
        Self {
            name: name.into(),
            pid,
            stderr,
        }
    }
}

impl ProcessHealthCheck for PidHealthCheck {
    fn process_name(&self) -> &str {
        &self.name
    }

    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_alive(&self) -> bool {
        check_process_status(self.pid) == ProcessStatus::Alive
    }

    fn diagnostics(&self) -> String {
        self.stderr.contents()
    }
}

/// Dial policy plus how long to wait for the line once connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadinessProtocol {
    pub policy: BackoffPolicy,
    /// `None` blocks until the guest writes or closes.
    pub line_timeout: Option<Duration>,
}

impl ReadinessProtocol {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            line_timeout: None,
        }
    }

    pub fn with_line_timeout(mut self, timeout: Duration) -> Self {
        self.line_timeout = Some(timeout);
        self
    }

    /// Block until the guest signals on `ready_socket`.
    pub fn wait(
        &self,
        ready_socket: &Path,
        health: Option<&dyn ProcessHealthCheck>,
    ) -> MachineResult<()> {
        tracing::debug!(socket = %ready_socket.display(), attempts = self.policy.attempts, "Waiting for guest ready signal");

        let endpoint = UnixEndpoint::new(ready_socket);
        let stream = backoff::dial(&endpoint, &self.policy, health)
            .map_err(|e| e.into_readiness_error())?;

        stream
            .set_read_timeout(self.line_timeout)
            .map_err(MachineError::from)
            .with_context(|| format!("configuring {}", ready_socket.display()))?;

        let mut line = String::new();
        let n = BufReader::new(stream)
            .read_line(&mut line)
            .map_err(MachineError::from)
            .with_context(|| format!("reading ready line from {}", ready_socket.display()))?;

        if n == 0 || !line.ends_with('\n') {
            return Err(MachineError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before ready line",
            ))
            .context(format!("reading ready line from {}", ready_socket.display())));
        }

        tracing::info!(socket = %ready_socket.display(), "Guest signalled ready");
        Ok(())
    }
}

/// Wait with the default policy against `ready_socket`, watching `pid`.
pub fn wait_ready(ready_socket: &Path, pid: u32, stderr: StderrBuffer) -> MachineResult<()> {
    let health = PidHealthCheck::new("hypervisor", pid, stderr);
    ReadinessProtocol::default().wait(ready_socket, Some(&health))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixListener;

    fn fast() -> ReadinessProtocol {
        ReadinessProtocol::new(BackoffPolicy::new(3, Duration::from_millis(10)))
            .with_line_timeout(Duration::from_secs(5))
    }

    #[test]
    fn test_ready_line_received() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ready.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let guest = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            conn.write_all(b"Ready\n").unwrap();
        });

        fast().wait(&path, None).unwrap();
        guest.join().unwrap();
    }

    #[test]
    fn test_content_is_not_validated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ready.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let guest = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            conn.write_all(b"anything at all\n").unwrap();
        });

        assert!(fast().wait(&path, None).is_ok());
        guest.join().unwrap();
    }

    #[test]
    fn test_closed_without_line_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ready.sock");
        let listener = UnixListener::bind(&path).unwrap();

        let guest = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            conn.write_all(b"partial").unwrap();
        });

        let err = fast().wait(&path, None).unwrap_err();
        assert!(matches!(err.root(), MachineError::Io(_)));
        guest.join().unwrap();
    }

    #[test]
    fn test_missing_socket_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let err = fast()
            .wait(&dir.path().join("never.sock"), None)
            .unwrap_err();
        assert!(matches!(
            err,
            MachineError::ReadinessTimeout { attempts: 3, .. }
        ));
    }

    #[test]
    fn test_alive_pid_gives_timeout_not_death() {
        let dir = tempfile::tempdir().unwrap();
        let health = PidHealthCheck::new("self", std::process::id(), StderrBuffer::new());
        let err = fast()
            .wait(&dir.path().join("never.sock"), Some(&health))
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(!err.is_process_died());
    }
}
