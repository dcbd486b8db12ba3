//! How mount targets are created inside the guest.

use std::path::Path;

/// Builds the remote command that creates a mount target directory.
pub trait MountTargetPolicy: Send + Sync {
    fn mkdir_command(&self, target: &str) -> Vec<String>;
}

/// Clears the immutable attribute on `/` around `mkdir` for targets outside
/// the writable prefixes. Fedora CoreOS ships an immutable root.
#[derive(Debug, Clone)]
pub struct ImmutableRootPolicy {
    writable_prefixes: Vec<String>,
}

impl ImmutableRootPolicy {
    pub fn new(writable_prefixes: Vec<String>) -> Self {
        Self { writable_prefixes }
    }

    pub fn needs_toggle(&self, target: &str) -> bool {
        !self
            .writable_prefixes
            .iter()
            .any(|prefix| Path::new(target).starts_with(prefix))
    }
}

impl Default for ImmutableRootPolicy {
    fn default() -> Self {
        Self::new(vec!["/home".to_string(), "/mnt".to_string()])
    }
}

impl MountTargetPolicy for ImmutableRootPolicy {
    fn mkdir_command(&self, target: &str) -> Vec<String> {
        let toggle = self.needs_toggle(target);
        let mut args = Vec::new();
        if toggle {
            args.extend(["sudo", "chattr", "-i", "/", ";"].map(String::from));
        }
        args.extend(["sudo", "mkdir", "-p"].map(String::from));
        args.push(target.to_string());
        if toggle {
            args.extend([";", "sudo", "chattr", "+i", "/"].map(String::from));
        }
        args
    }
}

/// Plain `mkdir -p`, for guests with a writable root.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainMkdirPolicy;

impl MountTargetPolicy for PlainMkdirPolicy {
    fn mkdir_command(&self, target: &str) -> Vec<String> {
        vec![
            "sudo".to_string(),
            "mkdir".to_string(),
            "-p".to_string(),
            target.to_string(),
        ]
    }
}
