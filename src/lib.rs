//! Aberred scripting bridge library.
//!
//! This module exposes the Lua bridge (VM lifecycle, marshalling, object
//! classes, held references), the engine-neutral [`bridge::ScriptEngine`]
//! contract, and the ECS glue that lets other threads queue script calls.

pub mod bridge;
pub mod error;
pub mod events;
pub mod luarc_generator;
pub mod resources;
pub mod stub_generator;
pub mod systems;
