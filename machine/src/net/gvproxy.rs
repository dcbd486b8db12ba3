//! Network proxy startup configuration.
//!
//! The proxy process is started by the caller. This crate only contributes
//! the endpoint the hypervisor will attach to.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::cmdline::CommandLine;

/// Startup configuration for the user-mode network proxy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GvproxyCommand {
    /// Control endpoints (`unix://...`) the proxy listens on.
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// Stream socket a QEMU NIC attaches to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qemu_socket: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid_file: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,

    /// Host port forwarded to the guest's SSH daemon.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_port: Option<u16>,

    pub debug: bool,
}

impl GvproxyCommand {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_endpoint(&mut self, url: impl Into<String>) {
        self.endpoints.push(url.into());
    }

    /// Register the socket the hypervisor's network device connects to.
    pub fn add_qemu_socket(&mut self, url: impl Into<String>) {
        self.qemu_socket = Some(url.into());
    }

    pub fn with_pid_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.pid_file = Some(path.into());
        self
    }

    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    pub fn with_ssh_port(mut self, port: u16) -> Self {
        self.ssh_port = Some(port);
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Render as an invocation of `binary`.
    pub fn to_cmdline(&self, binary: &str) -> CommandLine {
        let mut cmd = CommandLine::new(binary);
        for endpoint in &self.endpoints {
            cmd.opt("-listen", endpoint.as_str());
        }
        if let Some(socket) = &self.qemu_socket {
            cmd.opt("-listen-qemu", socket.as_str());
        }
        if let Some(pid_file) = &self.pid_file {
            cmd.opt("-pid-file", pid_file.display().to_string());
        }
        if let Some(log_file) = &self.log_file {
            cmd.opt("-log-file", log_file.display().to_string());
        }
        if let Some(port) = self.ssh_port {
            cmd.opt("-ssh-port", port.to_string());
        }
        if self.debug {
            cmd.arg("-debug");
        }
        cmd
    }
}
