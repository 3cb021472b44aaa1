//! Lua scripting bridge.
//!
//! This module lets native code and Lua scripts call each other and share
//! values and objects.
//!
//! # Architecture
//!
//! The module is split into focused submodules:
//!
//! - [`marshal`] - Conversions between native values and Lua values
//! - [`refs`] - Strong and weak handles to Lua values held by native code
//! - [`object`] - Traits that make a native type visible to scripts
//! - [`class`] - Class registration, object wrappers and downcasting
//! - [`proxy`] - Trampolines that let scripts call native functions
//! - [`dynamic`], [`table`], [`array`], [`function`], [`instance`] - Typed
//!   views over values held from native code
//! - [`trace`] - Protected calls and the error handler
//! - [`loader`] - `require` resolution through the VM's file system
//! - [`bindings`] - The `luna` table and the `class` helper
//! - [`runtime`] - VM lifecycle
//!
//! # Example
//!
//! ```ignore
//! let vm = ScriptVm::new()?;
//! vm.register_class::<Sprite>()?
//!     .constructor(|frame: i32| Sprite::new(frame))?
//!     .method("frame", |this: &Sprite| this.frame.get())?;
//! vm.do_string("local s = Sprite(3) luna.log(s:frame())", "demo")?;
//! ```

pub mod array;
pub mod bindings;
pub mod class;
pub mod dynamic;
pub mod function;
pub mod instance;
pub mod loader;
pub mod marshal;
pub mod object;
pub mod proxy;
pub mod refs;
mod runtime;
pub mod table;
pub mod trace;

pub use array::DynamicArray;
pub use bindings::ApiFunction;
pub use class::{CastError, ClassBuilder, ClassInfo, ClassRegistry, MethodInfo, TypeTag};
pub use dynamic::{DynamicValue, ValueKind};
pub use function::ScriptFunction;
pub use instance::ScriptInstance;
pub use marshal::{FromScript, IntoArgs, IntoScript, Marshal, Nil, ReturnValue, Stack};
pub use object::{BackRef, Exposed, ScriptClass};
pub use proxy::{Arity, BindingKind, FunctionBinding};
pub use refs::{RefSlots, ScriptRef, VmId, WeakScriptRef};
pub use runtime::ScriptVm;
pub use table::DynamicTable;
