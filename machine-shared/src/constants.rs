//! Shared constants between host and guest
//!
//! These constants must be identical on both sides of the host-guest boundary.

/// Guest network identity
pub mod network {
    /// Guest MAC address.
    ///
    /// The user-mode network proxy hands out a static DHCP lease for this MAC,
    /// which is why only one machine may be active at a time.
    pub const GUEST_MAC: &str = "5a:94:ef:e4:0c:ee";

    /// Network device id used to bind the NIC to the proxy stream
    pub const NETDEV_ID: &str = "vlan";
}

/// Directory sharing (9p) parameters used inside the guest
pub mod sharing {
    /// Transport between guest and host
    pub const TRANSPORT: &str = "virtio";

    /// Protocol dialect
    pub const PROTOCOL_VERSION: &str = "9p2000.L";

    /// Maximum message size in bytes
    pub const MSIZE: u32 = 131072;

    /// Guest page-cache mode
    pub const CACHE_MODE: &str = "mmap";

    /// Default security model for host-side exports
    pub const DEFAULT_SECURITY_MODEL: &str = "none";
}

/// Logical names of helper binaries resolved at runtime
pub mod helpers {
    /// Disk image utility used for resizing
    pub const QEMU_IMG: &str = "qemu-img";

    /// Remote shell client
    pub const SSH: &str = "ssh";
}

/// Environment variables
pub mod envs {
    /// Overrides the root of all machine directories
    pub const MACHINE_HOME: &str = "MACHINE_HOME";

    /// Extra directory searched for helper binaries
    pub const HELPER_BINARIES_DIR: &str = "MACHINE_HELPER_BINARIES_DIR";
}

/// Guest readiness channel
pub mod readiness {
    /// Virtio serial port name the guest writes its ready line to
    pub const SERIAL_PORT_NAME: &str = "org.fedoraproject.port.0";
}
