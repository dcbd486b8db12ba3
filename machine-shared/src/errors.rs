//! Error taxonomy for machine lifecycle operations.
//!
//! Variants are grouped by how a caller is expected to react:
//! - launch and wait failures ([`MachineError::BinaryNotFound`],
//!   [`MachineError::ProcessLaunch`], [`MachineError::ReadinessTimeout`],
//!   [`MachineError::ProcessDied`], [`MachineError::NetworkProxyUnavailable`])
//!   leave the machine not running and usually carry diagnostics
//! - gate failures ([`MachineError::InvalidStateTransition`],
//!   [`MachineError::UnsupportedMountType`]) are rejected before any side effect
//! - provisioning failures ([`MachineError::DiskResize`],
//!   [`MachineError::RemoteCommand`]) wrap what an external tool reported

use std::io;
use thiserror::Error;

/// Result type for machine operations.
pub type MachineResult<T> = Result<T, MachineError>;

/// Errors produced by machine backends and the lifecycle driver.
#[derive(Debug, Error)]
pub enum MachineError {
    /// A helper or hypervisor binary could not be resolved to a path.
    #[error("binary '{name}' not found: {reason}")]
    BinaryNotFound { name: String, reason: String },

    /// The hypervisor process could not be started.
    #[error("unable to execute {command:?}: {source}")]
    ProcessLaunch {
        command: String,
        #[source]
        source: io::Error,
    },

    /// Every dial attempt against the readiness endpoint failed.
    #[error("{endpoint} not ready after {attempts} attempts: {reason}")]
    ReadinessTimeout {
        endpoint: String,
        attempts: u32,
        reason: String,
    },

    /// The supervised process exited while we were waiting on it.
    #[error("{process} exited unexpectedly with pid {pid}: {diagnostics}")]
    ProcessDied {
        process: String,
        pid: u32,
        diagnostics: String,
    },

    /// The network proxy never published its socket.
    #[error("network proxy socket {socket} unavailable after {attempts} attempts: {reason}")]
    NetworkProxyUnavailable {
        socket: String,
        attempts: u32,
        reason: String,
    },

    /// Operation not permitted in the machine's current state.
    #[error("invalid state: {0}")]
    InvalidStateTransition(String),

    /// A mount entry names a sharing mechanism the backend cannot provide.
    #[error("unknown mount type: {0}")]
    UnsupportedMountType(String),

    /// The external resize utility failed.
    #[error("resizing image {path}: {reason}")]
    DiskResize { path: String, reason: String },

    /// A command issued through the remote transport failed.
    #[error("remote command {command:?} failed: {reason}")]
    RemoteCommand { command: String, reason: String },

    /// Hypervisor monitor protocol error.
    #[error("monitor: {0}")]
    Monitor(String),

    /// Network setup error.
    #[error("network: {0}")]
    Network(String),

    /// Missing or malformed configuration.
    #[error("config: {0}")]
    Config(String),

    /// Filesystem error on machine artifacts.
    #[error("storage: {0}")]
    Storage(String),

    /// Operation not implemented by this backend.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Backend or platform not supported.
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("internal: {0}")]
    Internal(String),

    /// Error with the operation and target it happened in.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<MachineError>,
    },

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] io::Error),
}

impl MachineError {
    /// Wrap this error with a description of the operation that failed.
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error once every context layer is peeled off.
    pub fn root(&self) -> &MachineError {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Captured diagnostic output, if the failure carries any.
    pub fn diagnostics(&self) -> Option<&str> {
        match self.root() {
            Self::ProcessDied { diagnostics, .. } if !diagnostics.is_empty() => {
                Some(diagnostics.as_str())
            }
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self.root(),
            Self::ReadinessTimeout { .. } | Self::NetworkProxyUnavailable { .. }
        )
    }

    pub fn is_process_died(&self) -> bool {
        matches!(self.root(), Self::ProcessDied { .. })
    }
}

/// Attach context to the error side of a [`MachineResult`].
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> MachineResult<T>;

    fn with_context<F, S>(self, f: F) -> MachineResult<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> ResultExt<T> for MachineResult<T> {
    fn context(self, context: impl Into<String>) -> MachineResult<T> {
        self.map_err(|e| e.context(context))
    }

    fn with_context<F, S>(self, f: F) -> MachineResult<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| e.context(f()))
    }
}
