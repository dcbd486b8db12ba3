//! Backend factory using the inventory pattern for compile-time registration.
//!
//! Backends register themselves with `inventory::submit!`. A [`VmType`]
//! without a registration is reported as unsupported.

use crate::vmm::{Stubber, StubberOptions, VmType};
use machine_shared::errors::{MachineError, MachineResult};

/// Type alias for backend factory functions.
pub type StubberFactoryFn = fn(StubberOptions) -> MachineResult<Box<dyn Stubber>>;

/// Registration entry submitted by backend implementations via inventory.
pub struct StubberRegistration {
    pub kind: VmType,
    pub factory: StubberFactoryFn,
}

inventory::collect!(StubberRegistration);

/// Create a backend by looking up the registered factory.
///
/// # Returns
/// * `Ok(Box<dyn Stubber>)` - Backend instance
/// * `Err(MachineError::Unsupported)` - Kind not registered in this build
pub fn create_stubber(kind: VmType, options: StubberOptions) -> MachineResult<Box<dyn Stubber>> {
    for registration in inventory::iter::<StubberRegistration> {
        if registration.kind == kind {
            tracing::debug!(provider = %kind, "Creating machine backend");
            return (registration.factory)(options);
        }
    }

    let available = available_stubbers();

    Err(MachineError::Unsupported(format!(
        "Machine provider {} is not available. Available providers: {:?}",
        kind, available
    )))
}

/// Check if a backend kind is registered.
pub fn is_registered(kind: VmType) -> bool {
    inventory::iter::<StubberRegistration>().any(|r| r.kind == kind)
}

/// Get a list of all registered backend kinds.
pub fn available_stubbers() -> Vec<VmType> {
    inventory::iter::<StubberRegistration>()
        .map(|r| r.kind)
        .collect()
}
