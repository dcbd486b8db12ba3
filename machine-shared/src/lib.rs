//! Machine Shared - code common to every hypervisor backend
//!
//! This crate contains the error taxonomy and the constants that must agree
//! between the host-side supervisor and what the guest expects.

pub mod constants;
pub mod errors;

pub use errors::{MachineError, MachineResult};
