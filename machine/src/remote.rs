//! In-guest command execution.

use std::path::PathBuf;
use std::process::{Command, Stdio};

use machine_shared::constants::helpers;
use machine_shared::errors::{MachineError, MachineResult};

use crate::config::MachineConfig;
use crate::util::HelperBinaryFinder;

/// Runs a command inside the guest and returns its stdout.
pub trait RemoteExecutor: Send + Sync {
    fn run(&self, args: &[String]) -> MachineResult<String>;
}

/// [`RemoteExecutor`] over the host's `ssh` client.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    binary: PathBuf,
    identity_path: PathBuf,
    port: u16,
    username: String,
    host: String,
}

impl SshExecutor {
    pub fn new(
        binary: impl Into<PathBuf>,
        identity_path: impl Into<PathBuf>,
        port: u16,
        username: impl Into<String>,
    ) -> Self {
        Self {
            binary: binary.into(),
            identity_path: identity_path.into(),
            port,
            username: username.into(),
            host: "localhost".to_string(),
        }
    }

    /// Executor for `mc`'s SSH settings with `ssh` resolved through `finder`.
    pub fn for_machine(mc: &MachineConfig, finder: &dyn HelperBinaryFinder) -> MachineResult<Self> {
        let binary = finder.find(helpers::SSH)?;
        Ok(Self::new(
            binary,
            &mc.ssh.identity_path,
            mc.ssh.port,
            &mc.ssh.remote_username,
        ))
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Full argument vector handed to `ssh`.
    pub fn ssh_args(&self, remote: &[String]) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            self.identity_path.display().to_string(),
            "-p".to_string(),
            self.port.to_string(),
            format!("{}@{}", self.username, self.host),
            "-o".to_string(),
            "IdentitiesOnly=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            "SetEnv=LC_ALL=".to_string(),
            "-q".to_string(),
            "--".to_string(),
        ];
        args.extend(remote.iter().cloned());
        args
    }
}

impl RemoteExecutor for SshExecutor {
    fn run(&self, args: &[String]) -> MachineResult<String> {
        let command = args.join(" ");
        tracing::debug!(host = %self.host, port = self.port, command = %command, "Running remote command");

        let output = Command::new(&self.binary)
            .args(self.ssh_args(args))
            .stdin(Stdio::null())
            .output()
            .map_err(|e| MachineError::RemoteCommand {
                command: command.clone(),
                reason: format!("failed to run {}: {}", self.binary.display(), e),
            })?;

        if !output.status.success() {
            return Err(MachineError::RemoteCommand {
                command,
                reason: format!(
                    "{}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
