//! QEMU backend.

pub mod command;
pub mod monitor;
mod stubber;

pub use command::{QemuCmd, QemuCommandBuilder, arch_options, binary_name};
pub use monitor::{QmpClient, QmpStatus, new_qmp_monitor, query_state};
pub use stubber::QemuStubber;

use crate::vmm::VmType;
use crate::vmm::registry::StubberRegistration;

inventory::submit! {
    StubberRegistration {
        kind: VmType::Qemu,
        factory: |options| {
            Ok(Box::new(QemuStubber::new(options)))
        }
    }
}
