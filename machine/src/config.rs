//! Machine configuration model.
//!
//! `MachineConfig` is owned by the caller and persisted outside this crate.
//! Backends only mutate the hypervisor sub-record and the resource fields.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use machine_shared::constants::{envs, sharing};
use machine_shared::errors::{MachineError, MachineResult};
use serde::{Deserialize, Serialize};

use crate::vmm::VmType;

/// Default resources for a new machine
pub mod defaults {
    pub const CPUS: u64 = 2;
    pub const MEMORY_MIB: u64 = 2048;
    pub const DISK_SIZE_GIB: u64 = 100;
}

// ============================================================================
// MACHINE FILE
// ============================================================================

/// A file-system artifact belonging to a machine (socket, pid file, disk).
///
/// When a symlink is set it is the path handed to other processes; this keeps
/// Unix socket paths under the platform length limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineFile {
    path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    symlink: Option<PathBuf>,
}

impl MachineFile {
    pub fn new(path: impl Into<PathBuf>, symlink: Option<PathBuf>) -> MachineResult<Self> {
        let path = path.into();
        if path.as_os_str().is_empty() {
            return Err(MachineError::Config("machine file path is empty".into()));
        }
        Ok(Self { path, symlink })
    }

    /// Path other processes should use.
    pub fn path(&self) -> &Path {
        self.symlink.as_deref().unwrap_or(&self.path)
    }

    /// Path of the underlying file, ignoring any symlink.
    pub fn real_path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path().exists()
    }

    /// Remove the file and its symlink. Missing files are not an error.
    pub fn delete(&self) -> MachineResult<()> {
        if let Some(symlink) = &self.symlink {
            remove_if_exists(symlink)?;
        }
        remove_if_exists(&self.path)
    }
}

fn remove_if_exists(path: &Path) -> MachineResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(MachineError::Storage(format!(
            "failed to remove {}: {}",
            path.display(),
            e
        ))),
    }
}

// ============================================================================
// DIRECTORIES
// ============================================================================

/// Per-backend directory set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineDirs {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub runtime_dir: PathBuf,
}

impl MachineDirs {
    /// All three directories below a single root, one subtree per backend.
    pub fn under(root: &Path, vm_type: VmType) -> Self {
        let kind = vm_type.as_str();
        Self {
            config_dir: root.join("config").join(kind),
            data_dir: root.join("data").join(kind),
            runtime_dir: root.join("run").join(kind),
        }
    }

    /// Resolve directories for a backend.
    ///
    /// `$MACHINE_HOME` wins when set; otherwise the platform config, data and
    /// runtime directories are used.
    pub fn for_vm_type(vm_type: VmType) -> MachineResult<Self> {
        if let Ok(home) = std::env::var(envs::MACHINE_HOME)
            && !home.is_empty()
        {
            return Ok(Self::under(Path::new(&home), vm_type));
        }

        let kind = vm_type.as_str();
        let config = dirs::config_dir()
            .ok_or_else(|| MachineError::Config("no config directory for this user".into()))?;
        let data = dirs::data_dir()
            .ok_or_else(|| MachineError::Config("no data directory for this user".into()))?;
        let runtime = dirs::runtime_dir().unwrap_or_else(std::env::temp_dir);

        Ok(Self {
            config_dir: config.join("machine").join(kind),
            data_dir: data.join("machine").join(kind),
            runtime_dir: runtime.join("machine").join(kind),
        })
    }

    /// Create every directory.
    pub fn prepare(&self) -> MachineResult<()> {
        for dir in [&self.config_dir, &self.data_dir, &self.runtime_dir] {
            std::fs::create_dir_all(dir).map_err(|e| {
                MachineError::Storage(format!("failed to create {}: {}", dir.display(), e))
            })?;
        }
        Ok(())
    }
}

// ============================================================================
// RESOURCES
// ============================================================================

/// A host USB device passed through to the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsbConfig {
    /// Device addressed by bus and device number.
    Address { bus: String, devnum: String },
    /// Device addressed by vendor and product id.
    Id { vendor: u16, product: u16 },
}

impl UsbConfig {
    /// Parse a list of `bus=..,devnum=..` / `vendor=..,product=..` entries.
    /// Empty entries are skipped.
    pub fn parse_list<S: AsRef<str>>(entries: &[S]) -> MachineResult<Vec<UsbConfig>> {
        entries
            .iter()
            .map(AsRef::as_ref)
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect()
    }
}

impl FromStr for UsbConfig {
    type Err = MachineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |why: &str| MachineError::Config(format!("usb: fail to parse {why}: {s}"));

        let (left, right) = s.split_once(',').ok_or_else(|| invalid("missing ','"))?;
        if right.contains(',') {
            return Err(invalid("too many ','"));
        }
        let (lkey, lval) = left.split_once('=').ok_or_else(|| invalid("missing '='"))?;
        let (rkey, rval) = right.split_once('=').ok_or_else(|| invalid("missing '='"))?;

        let parse_hex = |v: &str| {
            let digits = v.trim_start_matches("0x").trim_start_matches("0X");
            u16::from_str_radix(digits, 16)
                .map_err(|e| MachineError::Config(format!("usb: invalid hex id {v}: {e}")))
        };

        match (lkey, rkey) {
            ("bus", "devnum") => Ok(UsbConfig::Address {
                bus: lval.to_string(),
                devnum: rval.to_string(),
            }),
            ("devnum", "bus") => Ok(UsbConfig::Address {
                bus: rval.to_string(),
                devnum: lval.to_string(),
            }),
            ("vendor", "product") => Ok(UsbConfig::Id {
                vendor: parse_hex(lval)?,
                product: parse_hex(rval)?,
            }),
            ("product", "vendor") => Ok(UsbConfig::Id {
                vendor: parse_hex(rval)?,
                product: parse_hex(lval)?,
            }),
            _ => Err(invalid("unknown keys")),
        }
    }
}

/// CPU, memory, disk and passthrough devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub cpus: u64,
    pub memory_mib: u64,
    pub disk_size_gib: u64,
    #[serde(default)]
    pub usbs: Vec<UsbConfig>,
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self {
            cpus: defaults::CPUS,
            memory_mib: defaults::MEMORY_MIB,
            disk_size_gib: defaults::DISK_SIZE_GIB,
            usbs: Vec::new(),
        }
    }
}

// ============================================================================
// MOUNTS
// ============================================================================

/// Directory sharing mechanism for a mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountType {
    #[serde(rename = "9p")]
    NineP,
    Virtiofs,
    #[serde(other)]
    Unknown,
}

impl MountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MountType::NineP => "9p",
            MountType::Virtiofs => "virtiofs",
            MountType::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for MountType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One host directory shared into the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    pub source: PathBuf,
    pub target: String,
    pub tag: String,
    pub read_only: bool,
    pub mount_type: MountType,
    /// Host-side permission mapping for the export.
    #[serde(default = "default_security_model")]
    pub security_model: String,
}

fn default_security_model() -> String {
    sharing::DEFAULT_SECURITY_MODEL.to_string()
}

impl MountSpec {
    pub fn new(
        source: impl Into<PathBuf>,
        target: impl Into<String>,
        tag: impl Into<String>,
        read_only: bool,
        mount_type: MountType,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            tag: tag.into(),
            read_only,
            mount_type,
            security_model: default_security_model(),
        }
    }

    /// Parse a `source[:target[:options]]` volume string.
    ///
    /// The tag is derived from `index`. Options are comma separated:
    /// `ro`, `rw` and `security_model=<model>`. Unknown options are logged
    /// and ignored.
    pub fn from_volume(index: usize, volume: &str, mount_type: MountType) -> MachineResult<Self> {
        let mut parts = volume.splitn(3, ':');
        let source = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| MachineError::Config(format!("volume '{volume}' has no source")))?;
        let target = parts.next().filter(|t| !t.is_empty()).unwrap_or(source);

        let mut spec = MountSpec::new(source, target, format!("vol{index}"), false, mount_type);

        if let Some(options) = parts.next() {
            for option in options.split(',') {
                match option {
                    "ro" => spec.read_only = true,
                    "rw" => spec.read_only = false,
                    o if o.starts_with("security_model=") => {
                        spec.security_model = o["security_model=".len()..].to_string();
                    }
                    other => {
                        tracing::warn!(volume, option = other, "Unknown volume option");
                    }
                }
            }
        }

        Ok(spec)
    }
}

// ============================================================================
// ACCESS AND IDENTITY
// ============================================================================

/// How the remote transport reaches the guest.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SshConfig {
    pub identity_path: PathBuf,
    pub port: u16,
    pub remote_username: String,
}

/// Host user the machine runs on behalf of.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HostUser {
    pub rootful: bool,
    pub uid: u32,
    /// Set when a setting changed and external connections must be refreshed.
    #[serde(default)]
    pub modified: bool,
}

// ============================================================================
// HYPERVISOR SUB-CONFIG
// ============================================================================

/// Monitor socket descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Socket family, always "unix" for local machines.
    pub network: String,
    pub address: MachineFile,
    /// Dial and I/O timeout in milliseconds.
    pub timeout_ms: u64,
}

impl MonitorConfig {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }
}

/// QEMU-specific state, allocated by `create_vm`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QemuConfig {
    pub monitor: MonitorConfig,
    /// Written by the hypervisor itself once it is up.
    pub pid_file: MachineFile,
}

// ============================================================================
// MACHINE CONFIG
// ============================================================================

/// Everything known about one machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineConfig {
    pub name: String,
    pub dirs: MachineDirs,
    pub resources: ResourceSpec,
    #[serde(default)]
    pub mounts: Vec<MountSpec>,
    /// Bootable disk image, set once the image has been acquired.
    pub image_path: Option<MachineFile>,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub host_user: HostUser,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qemu_hypervisor: Option<QemuConfig>,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub last_up: Option<DateTime<Utc>>,
}

impl MachineConfig {
    pub fn new(name: impl Into<String>, dirs: MachineDirs) -> Self {
        Self {
            name: name.into(),
            dirs,
            resources: ResourceSpec::default(),
            mounts: Vec::new(),
            image_path: None,
            ssh: SshConfig::default(),
            host_user: HostUser::default(),
            qemu_hypervisor: None,
            created: Utc::now(),
            last_up: None,
        }
    }

    pub fn runtime_dir(&self) -> &Path {
        &self.dirs.runtime_dir
    }

    /// Socket the guest signals readiness on.
    pub fn ready_socket(&self) -> MachineResult<MachineFile> {
        MachineFile::new(self.runtime_dir().join(format!("{}.sock", self.name)), None)
    }

    /// Socket the network proxy listens on for the hypervisor.
    pub fn gvproxy_socket(&self) -> MachineResult<MachineFile> {
        MachineFile::new(
            self.runtime_dir().join(format!("{}-gvproxy.sock", self.name)),
            None,
        )
    }

    /// Default location of the first-boot configuration file.
    pub fn ignition_file(&self) -> MachineResult<MachineFile> {
        MachineFile::new(self.dirs.config_dir.join(format!("{}.ign", self.name)), None)
    }

    pub fn image(&self) -> MachineResult<&MachineFile> {
        self.image_path
            .as_ref()
            .ok_or_else(|| MachineError::Config(format!("machine {} has no disk image", self.name)))
    }

    pub fn qemu(&self) -> MachineResult<&QemuConfig> {
        self.qemu_hypervisor.as_ref().ok_or_else(|| {
            MachineError::Config(format!(
                "machine {} has no QEMU configuration (was it created?)",
                self.name
            ))
        })
    }

    pub fn set_rootful(&mut self, rootful: bool) {
        self.host_user.rootful = rootful;
        self.host_user.modified = true;
    }
}
