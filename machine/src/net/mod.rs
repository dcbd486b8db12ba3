//! Coordination with the user-mode network proxy.
//!
//! Ordering: [`prepare`] runs before the proxy starts, [`await_proxy_ready`]
//! must succeed before the hypervisor that attaches to the proxy is launched.

pub mod gvproxy;

pub use gvproxy::GvproxyCommand;

use std::path::Path;

use machine_shared::errors::MachineResult;

use crate::backoff::{self, BackoffPolicy, UnixEndpoint};
use crate::config::MachineConfig;

/// `unix://` URL for `path` with forward-slash separators.
pub fn socket_url(path: &Path) -> String {
    let raw = path.to_string_lossy();
    let normalized = if std::path::MAIN_SEPARATOR == '/' {
        raw.into_owned()
    } else {
        raw.replace(std::path::MAIN_SEPARATOR, "/")
    };
    format!("unix://{}", normalized)
}

/// Remove any stale proxy socket and register the hypervisor endpoint.
///
/// A failed delete is logged and ignored.
pub fn prepare(mc: &MachineConfig, cmd: &mut GvproxyCommand) -> MachineResult<()> {
    let socket = mc.gvproxy_socket()?;

    if let Err(e) = socket.delete() {
        tracing::error!(machine = %mc.name, socket = %socket.path().display(), error = %e, "Failed to remove stale proxy socket");
    }

    let url = socket_url(socket.path());
    tracing::debug!(machine = %mc.name, url = %url, "Registering hypervisor socket with network proxy");
    cmd.add_qemu_socket(url);
    Ok(())
}

/// Wait until the proxy's socket accepts connections.
pub fn await_proxy_ready(mc: &MachineConfig, policy: &BackoffPolicy) -> MachineResult<()> {
    let socket = mc.gvproxy_socket()?;
    let endpoint = UnixEndpoint::new(socket.path());

    tracing::debug!(machine = %mc.name, socket = %socket.path().display(), "Waiting for network proxy");
    backoff::dial(&endpoint, policy, None).map_err(|e| e.into_proxy_error())?;
    Ok(())
}
