//! Value marshalling between native types and Lua values.
//!
//! Every type that crosses the boundary implements [`IntoScript`] (native to
//! Lua, exactly one value) and [`FromScript`] (Lua to native). Reading is
//! lenient the way Lua itself is:
//!
//! - a value of the wrong type yields the type's default (`0`, `false`, `""`,
//!   empty container, `None`) instead of an error,
//! - integers and floats convert into each other (floats truncate),
//! - numeric strings coerce to numbers and numbers coerce to strings.
//!
//! Class objects (`Rc<T>` of a [`ScriptClass`]) have no default, so reading one
//! from a mismatched value yields `None`. `Option<Rc<T>>` turns that into a
//! plain `None` argument.
//!
//! [`ReturnValue`] decides how many results a native callable produces: one for
//! any [`IntoScript`] type, zero for `()`.

use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};
use std::rc::{Rc, Weak};

use log::warn;
use mlua::prelude::*;

use super::class;
use super::object::ScriptClass;
use crate::bridge::Variant;

/// Marker for the script `nil`. Compares equal to an empty [`ScriptRef`](super::ScriptRef).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Nil;

/// Tables nested deeper than this are cut off when converted to [`Variant`].
const MAX_VARIANT_DEPTH: usize = 64;

/// Converts a native value into exactly one Lua value.
pub trait IntoScript {
    fn into_script(self, lua: &Lua) -> LuaResult<LuaValue>;
}

/// Converts a Lua value into a native value, falling back to a default on
/// mismatch.
pub trait FromScript: Sized {
    /// `None` only for types without a meaningful default (class objects).
    fn get(lua: &Lua, value: LuaValue) -> Option<Self>;

    /// Type name used in diagnostics and generated stubs.
    fn script_type() -> &'static str {
        "any"
    }
}

/// Anything that converts both ways.
pub trait Marshal: IntoScript + FromScript {}

impl<T: IntoScript + FromScript> Marshal for T {}

/// Results a native callable hands back to the VM.
pub trait ReturnValue {
    fn into_results(self, lua: &Lua) -> LuaResult<LuaMultiValue>;

    /// `None` when nothing is returned.
    fn script_type() -> Option<&'static str> {
        None
    }
}

impl ReturnValue for () {
    fn into_results(self, _: &Lua) -> LuaResult<LuaMultiValue> {
        Ok(LuaMultiValue::new())
    }
}

impl<T> ReturnValue for T
where
    T: IntoScript + ScriptTyped,
{
    fn into_results(self, lua: &Lua) -> LuaResult<LuaMultiValue> {
        Ok(LuaMultiValue::from_vec(vec![self.into_script(lua)?]))
    }

    fn script_type() -> Option<&'static str> {
        Some(<T as ScriptTyped>::type_name())
    }
}

/// Native callables may fail; the error becomes a script error.
impl<T: ReturnValue> ReturnValue for Result<T, LuaError> {
    fn into_results(self, lua: &Lua) -> LuaResult<LuaMultiValue> {
        self?.into_results(lua)
    }

    fn script_type() -> Option<&'static str> {
        T::script_type()
    }
}

/// Type name of a pushable value, for stubs. Every [`FromScript`] type gets it
/// from there; push-only types name themselves.
pub trait ScriptTyped {
    fn type_name() -> &'static str;
}

impl<T: FromScript> ScriptTyped for T {
    fn type_name() -> &'static str {
        T::script_type()
    }
}

impl ScriptTyped for &str {
    fn type_name() -> &'static str {
        "string"
    }
}

impl ScriptTyped for &String {
    fn type_name() -> &'static str {
        "string"
    }
}

impl ScriptTyped for LuaTable {
    fn type_name() -> &'static str {
        "table"
    }
}

impl ScriptTyped for LuaFunction {
    fn type_name() -> &'static str {
        "function"
    }
}

// --------------- Argument lists ---------------

/// Argument list for a native-to-script call.
pub trait IntoArgs {
    fn into_args(self, lua: &Lua) -> LuaResult<LuaMultiValue>;
}

impl IntoArgs for () {
    fn into_args(self, _: &Lua) -> LuaResult<LuaMultiValue> {
        Ok(LuaMultiValue::new())
    }
}

impl IntoArgs for LuaMultiValue {
    fn into_args(self, _: &Lua) -> LuaResult<LuaMultiValue> {
        Ok(self)
    }
}

impl IntoArgs for Stack {
    fn into_args(self, _: &Lua) -> LuaResult<LuaMultiValue> {
        Ok(self.into_multi())
    }
}

impl IntoArgs for &[Variant] {
    fn into_args(self, lua: &Lua) -> LuaResult<LuaMultiValue> {
        let values = self
            .iter()
            .map(|v| variant_to_value(lua, v))
            .collect::<LuaResult<Vec<_>>>()?;
        Ok(LuaMultiValue::from_vec(values))
    }
}

macro_rules! impl_into_args {
    ($($name:ident),+) => {
        impl<$($name: IntoScript),+> IntoArgs for ($($name,)+) {
            #[allow(non_snake_case)]
            fn into_args(self, lua: &Lua) -> LuaResult<LuaMultiValue> {
                let ($($name,)+) = self;
                Ok(LuaMultiValue::from_vec(vec![$($name.into_script(lua)?),+]))
            }
        }
    };
}

impl_into_args!(A);
impl_into_args!(A, B);
impl_into_args!(A, B, C);
impl_into_args!(A, B, C, D);
impl_into_args!(A, B, C, D, E);
impl_into_args!(A, B, C, D, E, F);
impl_into_args!(A, B, C, D, E, F, G);
impl_into_args!(A, B, C, D, E, F, G, H);

// --------------- Call frame ---------------

/// Arguments (or results) of one call, indexed from 1 like the Lua stack.
#[derive(Debug, Default, Clone)]
pub struct Stack {
    values: Vec<LuaValue>,
}

impl Stack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw value at a 1-based index; `nil` past the top.
    pub fn value(&self, index: usize) -> LuaValue {
        index
            .checked_sub(1)
            .and_then(|i| self.values.get(i))
            .cloned()
            .unwrap_or(LuaValue::Nil)
    }

    /// Converted value at a 1-based index, defaulting on mismatch.
    pub fn get<T: FromScript + Default>(&self, lua: &Lua, index: usize) -> T {
        T::get(lua, self.value(index)).unwrap_or_default()
    }

    pub fn push<T: IntoScript>(&mut self, lua: &Lua, value: T) -> LuaResult<()> {
        self.values.push(value.into_script(lua)?);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &LuaValue> {
        self.values.iter()
    }

    pub fn into_multi(self) -> LuaMultiValue {
        LuaMultiValue::from_vec(self.values)
    }
}

impl From<LuaMultiValue> for Stack {
    fn from(values: LuaMultiValue) -> Self {
        Self {
            values: values.into_vec(),
        }
    }
}

// --------------- Primitive conversions ---------------

/// Parses the numeric strings Lua's `tonumber` accepts (decimal, exponent,
/// `0x` hex). `inf`/`nan` spellings are rejected like Lua does.
pub(crate) fn parse_number(text: &str) -> Option<f64> {
    let t = text.trim();
    let (negative, body) = match t.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, t),
    };
    if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        let v = i64::from_str_radix(hex, 16).ok()? as f64;
        return Some(if negative { -v } else { v });
    }
    if t.is_empty() || t.chars().any(|c| c.is_ascii_alphabetic() && c != 'e' && c != 'E') {
        return None;
    }
    t.parse::<f64>().ok()
}

/// Number formatting matching `tostring`: integral values print without a
/// fraction.
pub(crate) fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

pub(crate) fn lua_string(s: &LuaString) -> String {
    s.to_string_lossy().to_string()
}

impl IntoScript for Nil {
    fn into_script(self, _: &Lua) -> LuaResult<LuaValue> {
        Ok(LuaValue::Nil)
    }
}

impl FromScript for Nil {
    fn get(_: &Lua, _: LuaValue) -> Option<Self> {
        Some(Nil)
    }

    fn script_type() -> &'static str {
        "nil"
    }
}

impl IntoScript for bool {
    fn into_script(self, _: &Lua) -> LuaResult<LuaValue> {
        Ok(LuaValue::Boolean(self))
    }
}

impl FromScript for bool {
    /// Only real booleans are accepted; `nil`, numbers and strings read as `false`.
    fn get(_: &Lua, value: LuaValue) -> Option<Self> {
        Some(matches!(value, LuaValue::Boolean(true)))
    }

    fn script_type() -> &'static str {
        "boolean"
    }
}

macro_rules! marshal_integer {
    ($($t:ty),*) => {$(
        impl IntoScript for $t {
            fn into_script(self, _: &Lua) -> LuaResult<LuaValue> {
                Ok(mlua::Integer::try_from(self)
                    .map(LuaValue::Integer)
                    .unwrap_or(LuaValue::Number(self as f64)))
            }
        }

        impl FromScript for $t {
            fn get(_: &Lua, value: LuaValue) -> Option<Self> {
                Some(match value {
                    LuaValue::Integer(i) => i as $t,
                    LuaValue::Number(n) => n as $t,
                    LuaValue::String(s) => parse_number(&lua_string(&s)).map_or(0, |n| n as $t),
                    _ => 0,
                })
            }

            fn script_type() -> &'static str {
                "integer"
            }
        }
    )*};
}

marshal_integer!(i8, i16, i32, i64, u8, u16, u32, u64, usize, isize);

macro_rules! marshal_float {
    ($($t:ty),*) => {$(
        impl IntoScript for $t {
            fn into_script(self, _: &Lua) -> LuaResult<LuaValue> {
                Ok(LuaValue::Number(self as f64))
            }
        }

        impl FromScript for $t {
            fn get(_: &Lua, value: LuaValue) -> Option<Self> {
                Some(match value {
                    LuaValue::Integer(i) => i as $t,
                    LuaValue::Number(n) => n as $t,
                    LuaValue::String(s) => parse_number(&lua_string(&s)).map_or(0.0, |n| n as $t),
                    _ => 0.0,
                })
            }

            fn script_type() -> &'static str {
                "number"
            }
        }
    )*};
}

marshal_float!(f32, f64);

impl IntoScript for String {
    fn into_script(self, lua: &Lua) -> LuaResult<LuaValue> {
        lua.create_string(&self).map(LuaValue::String)
    }
}

impl IntoScript for &str {
    fn into_script(self, lua: &Lua) -> LuaResult<LuaValue> {
        lua.create_string(self).map(LuaValue::String)
    }
}

impl IntoScript for &String {
    fn into_script(self, lua: &Lua) -> LuaResult<LuaValue> {
        lua.create_string(self.as_str()).map(LuaValue::String)
    }
}

impl FromScript for String {
    fn get(_: &Lua, value: LuaValue) -> Option<Self> {
        Some(match value {
            LuaValue::String(s) => lua_string(&s),
            LuaValue::Integer(i) => i.to_string(),
            LuaValue::Number(n) => format_number(n),
            _ => String::new(),
        })
    }

    fn script_type() -> &'static str {
        "string"
    }
}

impl<T: IntoScript> IntoScript for Option<T> {
    fn into_script(self, lua: &Lua) -> LuaResult<LuaValue> {
        match self {
            Some(v) => v.into_script(lua),
            None => Ok(LuaValue::Nil),
        }
    }
}

impl<T: FromScript> FromScript for Option<T> {
    fn get(lua: &Lua, value: LuaValue) -> Option<Self> {
        Some(match value {
            LuaValue::Nil => None,
            v => T::get(lua, v),
        })
    }

    fn script_type() -> &'static str {
        T::script_type()
    }
}

impl<T: IntoScript> IntoScript for Vec<T> {
    fn into_script(self, lua: &Lua) -> LuaResult<LuaValue> {
        let table = lua.create_table()?;
        for (i, item) in self.into_iter().enumerate() {
            table.raw_set(i + 1, item.into_script(lua)?)?;
        }
        Ok(LuaValue::Table(table))
    }
}

impl<T: FromScript + Default> FromScript for Vec<T> {
    fn get(lua: &Lua, value: LuaValue) -> Option<Self> {
        let LuaValue::Table(table) = value else {
            return Some(Vec::new());
        };
        let len = table.raw_len();
        let mut out = Vec::with_capacity(len);
        for i in 1..=len {
            let item = table.raw_get::<LuaValue>(i).unwrap_or(LuaValue::Nil);
            out.push(T::get(lua, item).unwrap_or_default());
        }
        Some(out)
    }

    fn script_type() -> &'static str {
        "table"
    }
}

impl<K, V, S> IntoScript for HashMap<K, V, S>
where
    K: IntoScript,
    V: IntoScript,
{
    fn into_script(self, lua: &Lua) -> LuaResult<LuaValue> {
        let table = lua.create_table()?;
        for (k, v) in self {
            table.raw_set(k.into_script(lua)?, v.into_script(lua)?)?;
        }
        Ok(LuaValue::Table(table))
    }
}

impl<K, V, S> FromScript for HashMap<K, V, S>
where
    K: FromScript + Default + Eq + Hash,
    V: FromScript + Default,
    S: BuildHasher + Default,
{
    fn get(lua: &Lua, value: LuaValue) -> Option<Self> {
        let mut out = HashMap::default();
        if let LuaValue::Table(table) = value {
            for pair in table.pairs::<LuaValue, LuaValue>() {
                let Ok((k, v)) = pair else { continue };
                out.insert(
                    K::get(lua, k).unwrap_or_default(),
                    V::get(lua, v).unwrap_or_default(),
                );
            }
        }
        Some(out)
    }

    fn script_type() -> &'static str {
        "table"
    }
}

// --------------- Raw Lua values ---------------

impl IntoScript for LuaValue {
    fn into_script(self, _: &Lua) -> LuaResult<LuaValue> {
        Ok(self)
    }
}

impl FromScript for LuaValue {
    fn get(_: &Lua, value: LuaValue) -> Option<Self> {
        Some(value)
    }
}

impl IntoScript for LuaTable {
    fn into_script(self, _: &Lua) -> LuaResult<LuaValue> {
        Ok(LuaValue::Table(self))
    }
}

impl IntoScript for LuaFunction {
    fn into_script(self, _: &Lua) -> LuaResult<LuaValue> {
        Ok(LuaValue::Function(self))
    }
}

// --------------- Class objects ---------------

impl<T: ScriptClass> IntoScript for Rc<T> {
    fn into_script(self, lua: &Lua) -> LuaResult<LuaValue> {
        class::push_object(lua, self)
    }
}

impl<T: ScriptClass> FromScript for Rc<T> {
    fn get(lua: &Lua, value: LuaValue) -> Option<Self> {
        match value {
            LuaValue::UserData(ud) => class::downcast::<T>(lua, &ud),
            _ => None,
        }
    }

    fn script_type() -> &'static str {
        T::TYPE_NAME
    }
}

impl<T: ScriptClass> IntoScript for Weak<T> {
    fn into_script(self, lua: &Lua) -> LuaResult<LuaValue> {
        match self.upgrade() {
            Some(obj) => class::push_object(lua, obj),
            None => Ok(LuaValue::Nil),
        }
    }
}

impl<T: ScriptClass> FromScript for Weak<T> {
    fn get(lua: &Lua, value: LuaValue) -> Option<Self> {
        Some(match Rc::<T>::get(lua, value) {
            Some(obj) => Rc::downgrade(&obj),
            None => Weak::new(),
        })
    }

    fn script_type() -> &'static str {
        T::TYPE_NAME
    }
}

// --------------- Variant ---------------

impl IntoScript for Variant {
    fn into_script(self, lua: &Lua) -> LuaResult<LuaValue> {
        variant_to_value(lua, &self)
    }
}

impl IntoScript for &Variant {
    fn into_script(self, lua: &Lua) -> LuaResult<LuaValue> {
        variant_to_value(lua, self)
    }
}

impl FromScript for Variant {
    fn get(lua: &Lua, value: LuaValue) -> Option<Self> {
        Some(value_to_variant(lua, &value, 0))
    }
}

pub(crate) fn variant_to_value(lua: &Lua, variant: &Variant) -> LuaResult<LuaValue> {
    Ok(match variant {
        Variant::Nil => LuaValue::Nil,
        Variant::Bool(b) => LuaValue::Boolean(*b),
        Variant::Int(i) => (*i).into_script(lua)?,
        Variant::Float(f) => LuaValue::Number(*f),
        Variant::String(s) => LuaValue::String(lua.create_string(s)?),
        Variant::Array(items) => {
            let table = lua.create_table()?;
            for (i, item) in items.iter().enumerate() {
                table.raw_set(i + 1, variant_to_value(lua, item)?)?;
            }
            LuaValue::Table(table)
        }
        Variant::Table(map) => {
            let table = lua.create_table()?;
            for (k, v) in map {
                table.raw_set(k.as_str(), variant_to_value(lua, v)?)?;
            }
            LuaValue::Table(table)
        }
    })
}

fn array_index(key: &LuaValue) -> Option<usize> {
    match key {
        LuaValue::Integer(i) if *i >= 1 => Some(*i as usize),
        LuaValue::Number(n) if *n >= 1.0 && n.fract() == 0.0 => Some(*n as usize),
        _ => None,
    }
}

/// Tables whose keys are exactly `1..=n` become arrays, everything else a
/// string-keyed table. Functions, userdata and threads read as nil.
pub(crate) fn value_to_variant(lua: &Lua, value: &LuaValue, depth: usize) -> Variant {
    match value {
        LuaValue::Nil => Variant::Nil,
        LuaValue::Boolean(b) => Variant::Bool(*b),
        LuaValue::Integer(i) => Variant::Int(*i as i64),
        LuaValue::Number(n) => Variant::Float(*n),
        LuaValue::String(s) => Variant::String(lua_string(s)),
        LuaValue::Table(table) => {
            if depth >= MAX_VARIANT_DEPTH {
                warn!("Table nested deeper than {} levels, truncated", MAX_VARIANT_DEPTH);
                return Variant::Nil;
            }
            let len = table.raw_len();
            let mut entries = Vec::new();
            for (k, v) in table.pairs::<LuaValue, LuaValue>().flatten() {
                entries.push((k, v));
            }
            let is_array = len > 0
                && entries.len() == len
                && entries
                    .iter()
                    .all(|(k, _)| array_index(k).is_some_and(|i| i <= len));
            if is_array {
                let mut items = vec![Variant::Nil; len];
                for (k, v) in &entries {
                    if let Some(i) = array_index(k) {
                        items[i - 1] = value_to_variant(lua, v, depth + 1);
                    }
                }
                Variant::Array(items)
            } else {
                let mut map = std::collections::BTreeMap::new();
                for (k, v) in &entries {
                    let key = match k {
                        LuaValue::String(s) => lua_string(s),
                        LuaValue::Integer(i) => i.to_string(),
                        LuaValue::Number(n) => format_number(*n),
                        LuaValue::Boolean(b) => b.to_string(),
                        _ => continue,
                    };
                    map.insert(key, value_to_variant(lua, v, depth + 1));
                }
                Variant::Table(map)
            }
        }
        _ => Variant::Nil,
    }
}
