//! Resources made available to the bridge and to ECS systems.
//!
//! Overview
//! - `files` – file system abstraction scripts are loaded through
//! - `lua_runtime` – the Lua VM and everything that crosses its boundary
//! - `scriptconfig` – script root, entry point and error handling options
//! - `scriptevents` – channel that queues script calls from other threads
pub mod files;
pub mod lua_runtime;
pub mod scriptconfig;
pub mod scriptevents;
