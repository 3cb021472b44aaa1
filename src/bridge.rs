//! Engine-neutral scripting contract.
//!
//! Application code (the binary, the event dispatch system) talks to a
//! script VM through [`ScriptEngine`] and exchanges plain owned [`Variant`]
//! values, so it never depends on the binding library of a particular
//! language. [`ScriptVm`](crate::resources::lua_runtime::ScriptVm) is the Lua
//! adapter.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

/// Owned script value that can cross threads and engines.
///
/// Maps one-to-one onto JSON documents, which is how `luna.read_json` builds
/// script tables.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Variant {
    #[default]
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Variant>),
    Table(BTreeMap<String, Variant>),
}

impl Variant {
    pub fn is_nil(&self) -> bool {
        matches!(self, Variant::Nil)
    }

    /// Integer view with the same leniency as the marshaller: floats
    /// truncate, numeric strings parse.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Variant::Int(i) => Some(*i),
            Variant::Float(f) => Some(*f as i64),
            Variant::String(s) => s.trim().parse::<f64>().ok().map(|f| f as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Variant::Int(i) => Some(*i as f64),
            Variant::Float(f) => Some(*f),
            Variant::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Variant::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Variant::String(s) => Some(s),
            _ => None,
        }
    }

    /// Field of a [`Variant::Table`], or element `key` (1-based) of an
    /// array when `key` is numeric.
    pub fn get(&self, key: &str) -> Option<&Variant> {
        match self {
            Variant::Table(map) => map.get(key),
            Variant::Array(items) => key
                .parse::<usize>()
                .ok()
                .and_then(|i| i.checked_sub(1))
                .and_then(|i| items.get(i)),
            _ => None,
        }
    }

    /// Script-side type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            Variant::Nil => "nil",
            Variant::Bool(_) => "boolean",
            Variant::Int(_) | Variant::Float(_) => "number",
            Variant::String(_) => "string",
            Variant::Array(_) | Variant::Table(_) => "table",
        }
    }
}

impl From<bool> for Variant {
    fn from(v: bool) -> Self {
        Variant::Bool(v)
    }
}

impl From<i64> for Variant {
    fn from(v: i64) -> Self {
        Variant::Int(v)
    }
}

impl From<i32> for Variant {
    fn from(v: i32) -> Self {
        Variant::Int(v as i64)
    }
}

impl From<f64> for Variant {
    fn from(v: f64) -> Self {
        Variant::Float(v)
    }
}

impl From<&str> for Variant {
    fn from(v: &str) -> Self {
        Variant::String(v.to_string())
    }
}

impl From<String> for Variant {
    fn from(v: String) -> Self {
        Variant::String(v)
    }
}

impl<T: Into<Variant>> From<Vec<T>> for Variant {
    fn from(v: Vec<T>) -> Self {
        Variant::Array(v.into_iter().map(Into::into).collect())
    }
}

/// Operations every scripting backend provides to the application.
pub trait ScriptEngine {
    /// Short name of the language, used in log lines.
    fn engine_name(&self) -> &'static str;

    /// Loads and runs a script file through the engine's file system.
    fn run_file(&self, path: &str) -> Result<(), BridgeError>;

    /// Runs source text; `chunk_name` shows up in error traces.
    fn run_string(&self, source: &str, chunk_name: &str) -> Result<(), BridgeError>;

    /// True when a global function with this name exists.
    fn has_function(&self, name: &str) -> bool;

    /// Calls a global function under the error handler. Returns the first
    /// result, or [`Variant::Nil`] when the function returns nothing.
    fn call(&self, name: &str, args: &[Variant]) -> Result<Variant, BridgeError>;

    fn set_global(&self, name: &str, value: &Variant) -> Result<(), BridgeError>;

    fn get_global(&self, name: &str) -> Result<Variant, BridgeError>;

    /// Runs a full collection cycle.
    fn collect_garbage(&self) -> Result<(), BridgeError>;
}
