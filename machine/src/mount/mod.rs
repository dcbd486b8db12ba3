//! Shared-directory provisioning inside the guest.
//!
//! Each mount gets two remote commands, in input order: create the target,
//! then mount it over 9p. The whole pass is rejected up front when any entry
//! names a mount type other than 9p. There is no rollback of mounts that
//! succeeded before a later failure.

pub mod policy;

pub use policy::{ImmutableRootPolicy, MountTargetPolicy, PlainMkdirPolicy};

use machine_shared::constants::sharing;
use machine_shared::errors::{MachineError, MachineResult, ResultExt};

use crate::config::{MountSpec, MountType};
use crate::remote::RemoteExecutor;

/// `sudo mount` arguments for a 9p share.
pub fn mount_command(mount: &MountSpec) -> MachineResult<Vec<String>> {
    if mount.mount_type != MountType::NineP {
        return Err(MachineError::UnsupportedMountType(
            mount.mount_type.to_string(),
        ));
    }

    let mut args: Vec<String> = ["sudo", "mount", "-t", "9p", "-o"]
        .map(String::from)
        .to_vec();
    args.push(format!("trans={}", sharing::TRANSPORT));
    args.push(mount.tag.clone());
    args.push(mount.target.clone());
    args.push("-o".to_string());
    args.push(format!(
        "version={},msize={},cache={}",
        sharing::PROTOCOL_VERSION,
        sharing::MSIZE,
        sharing::CACHE_MODE
    ));
    if mount.read_only {
        args.push("-o".to_string());
        args.push("ro".to_string());
    }
    Ok(args)
}

/// Create and mount every share in `mounts`.
pub fn mount_all(
    mounts: &[MountSpec],
    executor: &dyn RemoteExecutor,
    policy: &dyn MountTargetPolicy,
) -> MachineResult<()> {
    if let Some(bad) = mounts.iter().find(|m| m.mount_type != MountType::NineP) {
        return Err(
            MachineError::UnsupportedMountType(bad.mount_type.to_string())
                .context(format!("mounting {} at {}", bad.source.display(), bad.target)),
        );
    }

    for mount in mounts {
        tracing::info!(source = %mount.source.display(), target = %mount.target, tag = %mount.tag, "Mounting volume");

        executor
            .run(&policy.mkdir_command(&mount.target))
            .with_context(|| format!("creating mount target {}", mount.target))?;

        executor
            .run(&mount_command(mount)?)
            .with_context(|| format!("mounting {} at {}", mount.tag, mount.target))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl RemoteExecutor for Recorder {
        fn run(&self, args: &[String]) -> MachineResult<String> {
            self.calls.lock().push(args.join(" "));
            Ok(String::new())
        }
    }

    #[test]
    fn test_mount_command_read_write() {
        let spec = MountSpec::new("/src", "/home/user/data", "tag0", false, MountType::NineP);
        assert_eq!(
            mount_command(&spec).unwrap().join(" "),
            "sudo mount -t 9p -o trans=virtio tag0 /home/user/data -o version=9p2000.L,msize=131072,cache=mmap"
        );
    }

    #[test]
    fn test_mount_command_read_only() {
        let spec = MountSpec::new("/src", "/mnt/ro", "vol1", true, MountType::NineP);
        let cmd = mount_command(&spec).unwrap();
        assert_eq!(&cmd[cmd.len() - 2..], &["-o".to_string(), "ro".to_string()]);
    }

    #[test]
    fn test_mount_all_order() {
        let recorder = Recorder::default();
        let mounts = vec![
            MountSpec::new("/a", "/home/a", "vol0", false, MountType::NineP),
            MountSpec::new("/b", "/data", "vol1", true, MountType::NineP),
        ];
        mount_all(&mounts, &recorder, &ImmutableRootPolicy::default()).unwrap();

        let calls = recorder.calls.lock();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[0], "sudo mkdir -p /home/a");
        assert!(calls[1].starts_with("sudo mount -t 9p"));
        assert_eq!(calls[2], "sudo chattr -i / ; sudo mkdir -p /data ; sudo chattr +i /");
        assert!(calls[3].ends_with("-o ro"));
    }

    #[test]
    fn test_unknown_type_issues_nothing() {
        let recorder = Recorder::default();
        let mounts = vec![
            MountSpec::new("/a", "/home/a", "vol0", false, MountType::NineP),
            MountSpec::new("/b", "/data", "vol1", false, MountType::Unknown),
        ];
        let err = mount_all(&mounts, &recorder, &ImmutableRootPolicy::default()).unwrap_err();
        assert!(matches!(err.root(), MachineError::UnsupportedMountType(_)));
        assert!(recorder.calls.lock().is_empty());
    }

    #[test]
    fn test_virtiofs_is_unsupported() {
        let spec = MountSpec::new("/a", "/b", "vol0", false, MountType::Virtiofs);
        assert!(matches!(
            mount_command(&spec),
            Err(MachineError::UnsupportedMountType(t)) if t == "virtiofs"
        ));
    }
}
