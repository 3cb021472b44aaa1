//! A Lua value of any type held from native code.

use std::rc::Rc;

use mlua::prelude::*;
use serde::de::DeserializeOwned;

use super::array::DynamicArray;
use super::class;
use super::function::ScriptFunction;
use super::marshal::{FromScript, IntoScript, Nil, value_to_variant};
use super::object::ScriptClass;
use super::refs::ScriptRef;
use super::table::DynamicTable;
use crate::bridge::Variant;
use crate::error::BridgeError;

/// Lua type of a [`DynamicValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Nil,
    Boolean,
    Number,
    String,
    Table,
    Function,
    Userdata,
    Thread,
    Other,
}

impl ValueKind {
    pub fn of(value: &LuaValue) -> Self {
        match value {
            LuaValue::Nil => ValueKind::Nil,
            LuaValue::Boolean(_) => ValueKind::Boolean,
            LuaValue::Integer(_) | LuaValue::Number(_) => ValueKind::Number,
            LuaValue::String(_) => ValueKind::String,
            LuaValue::Table(_) => ValueKind::Table,
            LuaValue::Function(_) => ValueKind::Function,
            LuaValue::UserData(_) | LuaValue::LightUserData(_) => ValueKind::Userdata,
            LuaValue::Thread(_) => ValueKind::Thread,
            _ => ValueKind::Other,
        }
    }
}

/// Strong handle to a value of any type. Conversions never fail: a value of
/// the wrong type reads as the target's default.
#[derive(Clone, Debug, Default)]
pub struct DynamicValue {
    handle: ScriptRef,
}

impl DynamicValue {
    pub fn nil() -> Self {
        Self::default()
    }

    pub fn new(lua: &Lua, value: LuaValue) -> LuaResult<Self> {
        Ok(Self {
            handle: ScriptRef::new(lua, value)?,
        })
    }

    /// Pushes a native value and holds the result.
    pub fn from_native<T: IntoScript>(lua: &Lua, value: T) -> LuaResult<Self> {
        Self::new(lua, value.into_script(lua)?)
    }

    pub fn is_nil(&self) -> bool {
        self.handle.is_nil()
    }

    pub fn handle(&self) -> &ScriptRef {
        &self.handle
    }

    pub fn value(&self, lua: &Lua) -> LuaResult<LuaValue> {
        self.handle.get(lua)
    }

    pub fn kind(&self, lua: &Lua) -> ValueKind {
        self.value(lua).map_or(ValueKind::Nil, |v| ValueKind::of(&v))
    }

    /// Reads the value as `T`, or `T::default()`.
    pub fn to<T: FromScript + Default>(&self, lua: &Lua) -> T {
        match self.value(lua) {
            Ok(value) => T::get(lua, value).unwrap_or_default(),
            Err(_) => T::default(),
        }
    }

    /// The native object behind a class wrapper, if the value is one of `T`
    /// (or of a class derived from `T`).
    pub fn to_object<T: ScriptClass>(&self, lua: &Lua) -> Option<Rc<T>> {
        let value = self.value(lua).ok()?;
        class::cast::<T>(lua, &value).ok()
    }

    /// Table view; nil when the value is not a table.
    pub fn to_table(&self, lua: &Lua) -> DynamicTable {
        self.to(lua)
    }

    pub fn to_array(&self, lua: &Lua) -> DynamicArray {
        self.to(lua)
    }

    pub fn to_function(&self, lua: &Lua) -> ScriptFunction {
        self.to(lua)
    }

    pub fn to_variant(&self, lua: &Lua) -> Variant {
        match self.value(lua) {
            Ok(value) => value_to_variant(lua, &value, 0),
            Err(_) => Variant::Nil,
        }
    }

    /// Deserializes the value with serde.
    pub fn deserialize<T: DeserializeOwned>(&self, lua: &Lua) -> Result<T, BridgeError> {
        Ok(lua.from_value(self.value(lua)?)?)
    }
}

impl PartialEq<Nil> for DynamicValue {
    fn eq(&self, _: &Nil) -> bool {
        self.is_nil()
    }
}

impl IntoScript for DynamicValue {
    fn into_script(self, lua: &Lua) -> LuaResult<LuaValue> {
        self.value(lua)
    }
}

impl IntoScript for &DynamicValue {
    fn into_script(self, lua: &Lua) -> LuaResult<LuaValue> {
        self.value(lua)
    }
}

impl FromScript for DynamicValue {
    fn get(lua: &Lua, value: LuaValue) -> Option<Self> {
        Some(Self {
            handle: <ScriptRef as FromScript>::get(lua, value)?,
        })
    }
}
