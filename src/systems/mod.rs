//! ECS systems.
//!
//! Submodules overview
//! - [`scriptevents`] – run queued script calls on the VM thread

pub mod scriptevents;
