//! # Module: NETLIB
//!
//! Identifier types for the adapters managed by this crate.
//!
//! * [`guid_wrapper`] - The GUID requested for a new adapter.
//! * [`if_luid`] - The locally unique identifier the system assigned to an adapter.

// Submodules
pub mod guid_wrapper;
pub mod if_luid;

// Re-exports
pub use guid_wrapper::GuidWrapper;
pub use if_luid::IfLuid;
