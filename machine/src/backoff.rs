//! Bounded retry harness for socket endpoints.
//!
//! Callers own their [`BackoffPolicy`]; there is no shared default state.
//! A dial either returns the connection, a timeout once every attempt failed,
//! or a process-died error as soon as the supplied health check reports the
//! monitored process gone.

use std::io;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use machine_shared::errors::MachineError;
use thiserror::Error;

/// Attempt count and fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl BackoffPolicy {
    pub const DEFAULT_ATTEMPTS: u32 = 6;
    pub const DEFAULT_DELAY: Duration = Duration::from_millis(500);

    /// `attempts` is clamped to at least one.
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }

    /// Upper bound on the time spent sleeping.
    pub fn total_wait(&self) -> Duration {
        self.delay * self.attempts.saturating_sub(1)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_ATTEMPTS, Self::DEFAULT_DELAY)
    }
}

/// Something that can be connected to.
pub trait Endpoint {
    type Conn;

    fn connect(&self) -> io::Result<Self::Conn>;

    /// Human-readable name used in errors and logs.
    fn describe(&self) -> String;
}

/// A Unix domain socket on the local file system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnixEndpoint(PathBuf);

impl UnixEndpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl Endpoint for UnixEndpoint {
    type Conn = UnixStream;

    fn connect(&self) -> io::Result<UnixStream> {
        UnixStream::connect(&self.0)
    }

    fn describe(&self) -> String {
        self.0.display().to_string()
    }
}

/// Liveness probe for the process that is expected to open the endpoint.
pub trait ProcessHealthCheck {
    fn process_name(&self) -> &str;

    fn pid(&self) -> u32;

    fn is_alive(&self) -> bool;

    /// Captured output explaining why the process died.
    fn diagnostics(&self) -> String;
}

#[derive(Debug, Error)]
pub enum DialError {
    #[error("{endpoint} not connectable after {attempts} attempts: {last_error}")]
    Timeout {
        endpoint: String,
        attempts: u32,
        last_error: String,
    },

    #[error("{process} (pid {pid}) exited before {endpoint} became connectable")]
    ProcessDied {
        process: String,
        pid: u32,
        endpoint: String,
        diagnostics: String,
    },
}

impl DialError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, DialError::Timeout { .. })
    }

    /// Classify as a guest readiness failure.
    pub fn into_readiness_error(self) -> MachineError {
        match self {
            DialError::Timeout {
                endpoint,
                attempts,
                last_error,
            } => MachineError::ReadinessTimeout {
                endpoint,
                attempts,
                reason: last_error,
            },
            DialError::ProcessDied {
                process,
                pid,
                diagnostics,
                ..
            } => MachineError::ProcessDied {
                process,
                pid,
                diagnostics,
            },
        }
    }

    /// Classify as a network proxy failure.
    pub fn into_proxy_error(self) -> MachineError {
        match self {
            DialError::Timeout {
                endpoint,
                attempts,
                last_error,
            } => MachineError::NetworkProxyUnavailable {
                socket: endpoint,
                attempts,
                reason: last_error,
            },
            DialError::ProcessDied {
                process,
                pid,
                diagnostics,
                ..
            } => MachineError::ProcessDied {
                process,
                pid,
                diagnostics,
            },
        }
    }
}

/// Connect to `endpoint`, retrying per `policy`.
pub fn dial<E: Endpoint>(
    endpoint: &E,
    policy: &BackoffPolicy,
    health: Option<&dyn ProcessHealthCheck>,
) -> Result<E::Conn, DialError> {
    let attempts = policy.attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        match endpoint.connect() {
            Ok(conn) => {
                tracing::debug!(endpoint = %endpoint.describe(), attempt, "Connected");
                return Ok(conn);
            }
            Err(e) => {
                tracing::trace!(
                    endpoint = %endpoint.describe(),
                    attempt,
                    attempts,
                    error = %e,
                    "Dial attempt failed"
                );
                last_error = e.to_string();
            }
        }

        if let Some(check) = health
            && !check.is_alive()
        {
            tracing::debug!(
                process = check.process_name(),
                pid = check.pid(),
                attempt,
                "Monitored process exited, aborting dial"
            );
            return Err(DialError::ProcessDied {
                process: check.process_name().to_string(),
                pid: check.pid(),
                endpoint: endpoint.describe(),
                diagnostics: check.diagnostics(),
            });
        }

        if attempt < attempts {
            std::thread::sleep(policy.delay);
        }
    }

    Err(DialError::Timeout {
        endpoint: endpoint.describe(),
        attempts,
        last_error,
    })
}
