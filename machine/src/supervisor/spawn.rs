//! Hypervisor process spawning.

use std::io;
use std::path::Path;
use std::process::{Child, Command, Stdio};

use machine_shared::errors::{MachineError, MachineResult};

use crate::cmdline::CommandLine;
use crate::util::HelperBinaryFinder;

/// Spawn `program` with `args`, stdin and stdout nulled and stderr piped.
fn spawn_once(program: &Path, args: &[String]) -> io::Result<Child> {
    let mut cmd = Command::new(program);
    cmd.args(args);

    // Pass RUST_LOG through for helpers that use it.
    if let Ok(rust_log) = std::env::var("RUST_LOG") {
        cmd.env("RUST_LOG", rust_log);
    }

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::piped());

    cmd.spawn()
}

/// Start the process described by `cmdline`.
///
/// A not-found failure re-resolves the executable through `finder` by its
/// file name and retries exactly once. Every other failure is returned with
/// the attempted command.
pub(crate) fn spawn_hypervisor(
    cmdline: &CommandLine,
    finder: &dyn HelperBinaryFinder,
) -> MachineResult<Child> {
    let program = Path::new(cmdline.program());
    let args = cmdline.arguments();

    match spawn_once(program, args) {
        Ok(child) => Ok(child),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let name = program
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_else(|| cmdline.program());
            tracing::debug!(
                binary = %program.display(),
                "Hypervisor binary not found, re-resolving through helper lookup"
            );

            let resolved = finder.find(name).map_err(|find_err| {
                tracing::error!(command = %cmdline, error = %find_err, "Unable to resolve hypervisor binary");
                find_err.context(format!("unable to execute {:?}", cmdline.to_string()))
            })?;

            spawn_once(&resolved, args).map_err(|source| {
                tracing::error!(binary = %resolved.display(), error = %source, "Failed to spawn hypervisor after re-resolving");
                MachineError::ProcessLaunch {
                    command: format!("{} {}", resolved.display(), args.join(" ")),
                    source,
                }
            })
        }
        Err(source) => {
            tracing::error!(command = %cmdline, error = %source, "Failed to spawn hypervisor");
            Err(MachineError::ProcessLaunch {
                command: cmdline.to_string(),
                source,
            })
        }
    }
}
