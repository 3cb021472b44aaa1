//! Event types exchanged between systems.
//!
//! Submodules:
//! - [`scriptcall`] – requests to run a script callback and their outcomes
pub mod scriptcall;
