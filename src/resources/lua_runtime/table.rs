//! Tables held from native code.

use log::error;
use mlua::prelude::*;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::array::DynamicArray;
use super::dynamic::DynamicValue;
use super::function::ScriptFunction;
use super::marshal::{FromScript, IntoScript, Nil, value_to_variant, variant_to_value};
use super::refs::ScriptRef;
use super::runtime::set_metatable;
use crate::bridge::Variant;
use crate::error::BridgeError;

/// Strong handle to a Lua table. A handle built from anything that is not a
/// table is nil; reads on it return defaults and writes are logged and
/// ignored.
#[derive(Clone, Debug, Default)]
pub struct DynamicTable {
    handle: ScriptRef,
}

impl DynamicTable {
    pub fn nil() -> Self {
        Self::default()
    }

    /// New empty table.
    pub fn new(lua: &Lua) -> LuaResult<Self> {
        Self::from_table(lua, lua.create_table()?)
    }

    pub fn from_table(lua: &Lua, table: LuaTable) -> LuaResult<Self> {
        Ok(Self {
            handle: ScriptRef::new(lua, LuaValue::Table(table))?,
        })
    }

    /// Builds a table tree from a variant. Non-table variants give a nil handle.
    pub fn from_variant(lua: &Lua, variant: &Variant) -> LuaResult<Self> {
        match variant_to_value(lua, variant)? {
            LuaValue::Table(table) => Self::from_table(lua, table),
            _ => Ok(Self::nil()),
        }
    }

    /// Parses JSON text into a table tree.
    pub fn from_json(lua: &Lua, text: &str) -> Result<Self, BridgeError> {
        let variant: Variant = serde_json::from_str(text)?;
        Ok(Self::from_variant(lua, &variant)?)
    }

    /// Serializes any serde value into a table tree.
    pub fn from_serializable<T: Serialize>(lua: &Lua, value: &T) -> Result<Self, BridgeError> {
        match lua.to_value(value)? {
            LuaValue::Table(table) => Ok(Self::from_table(lua, table)?),
            _ => Ok(Self::nil()),
        }
    }

    pub fn is_nil(&self) -> bool {
        self.handle.is_nil()
    }

    pub fn handle(&self) -> &ScriptRef {
        &self.handle
    }

    /// The underlying table, `None` for a nil handle.
    pub fn table(&self, lua: &Lua) -> LuaResult<Option<LuaTable>> {
        match self.handle.get(lua)? {
            LuaValue::Table(table) => Ok(Some(table)),
            _ => Ok(None),
        }
    }

    fn require_table(&self, lua: &Lua, op: &str) -> LuaResult<Option<LuaTable>> {
        let table = self.table(lua)?;
        if table.is_none() {
            error!("{} on a nil table ignored", op);
        }
        Ok(table)
    }

    /// Reads `key`, honoring `__index`. Missing or mismatched values read as
    /// the default.
    pub fn get<T: FromScript + Default>(&self, lua: &Lua, key: impl IntoScript) -> T {
        let value = (|| -> LuaResult<LuaValue> {
            match self.table(lua)? {
                Some(table) => table.get(key.into_script(lua)?),
                None => Ok(LuaValue::Nil),
            }
        })();
        match value {
            Ok(value) => T::get(lua, value).unwrap_or_default(),
            Err(_) => T::default(),
        }
    }

    /// Reads `key` without metamethods.
    pub fn raw_get<T: FromScript + Default>(&self, lua: &Lua, key: impl IntoScript) -> T {
        let value = (|| -> LuaResult<LuaValue> {
            match self.table(lua)? {
                Some(table) => table.raw_get(key.into_script(lua)?),
                None => Ok(LuaValue::Nil),
            }
        })();
        match value {
            Ok(value) => T::get(lua, value).unwrap_or_default(),
            Err(_) => T::default(),
        }
    }

    /// 1-based positional read.
    pub fn get_index<T: FromScript + Default>(&self, lua: &Lua, index: usize) -> T {
        self.raw_get(lua, index)
    }

    pub fn get_table(&self, lua: &Lua, key: impl IntoScript) -> DynamicTable {
        self.get(lua, key)
    }

    pub fn get_array(&self, lua: &Lua, key: impl IntoScript) -> DynamicArray {
        self.get(lua, key)
    }

    pub fn get_function(&self, lua: &Lua, key: impl IntoScript) -> ScriptFunction {
        self.get(lua, key)
    }

    /// Writes `key`, honoring `__newindex`.
    pub fn set(&self, lua: &Lua, key: impl IntoScript, value: impl IntoScript) -> LuaResult<()> {
        if let Some(table) = self.require_table(lua, "set")? {
            table.set(key.into_script(lua)?, value.into_script(lua)?)?;
        }
        Ok(())
    }

    pub fn raw_set(&self, lua: &Lua, key: impl IntoScript, value: impl IntoScript) -> LuaResult<()> {
        if let Some(table) = self.require_table(lua, "raw_set")? {
            table.raw_set(key.into_script(lua)?, value.into_script(lua)?)?;
        }
        Ok(())
    }

    /// True when `key` has a non-nil value (`__index` included).
    pub fn has_field(&self, lua: &Lua, key: impl IntoScript) -> bool {
        match self.table(lua) {
            Ok(Some(table)) => key
                .into_script(lua)
                .and_then(|k| table.get::<LuaValue>(k))
                .is_ok_and(|v| !v.is_nil()),
            _ => false,
        }
    }

    pub fn remove(&self, lua: &Lua, key: impl IntoScript) -> LuaResult<()> {
        self.raw_set(lua, key, Nil)
    }

    /// Removes every entry.
    pub fn clear(&self, lua: &Lua) -> LuaResult<()> {
        let Some(table) = self.require_table(lua, "clear")? else {
            return Ok(());
        };
        let keys: Vec<LuaValue> = table
            .pairs::<LuaValue, LuaValue>()
            .filter_map(Result::ok)
            .map(|(k, _)| k)
            .collect();
        for key in keys {
            table.raw_set(key, LuaValue::Nil)?;
        }
        Ok(())
    }

    pub fn is_empty(&self, lua: &Lua) -> bool {
        match self.table(lua) {
            Ok(Some(table)) => table.pairs::<LuaValue, LuaValue>().next().is_none(),
            _ => true,
        }
    }

    /// Length of the sequence part (`#t`, without `__len`).
    pub fn len(&self, lua: &Lua) -> usize {
        match self.table(lua) {
            Ok(Some(table)) => table.raw_len(),
            _ => 0,
        }
    }

    /// Every key/value pair, in the table's iteration order.
    pub fn entries(&self, lua: &Lua) -> LuaResult<Vec<(DynamicValue, DynamicValue)>> {
        let Some(table) = self.table(lua)? else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for pair in table.pairs::<LuaValue, LuaValue>() {
            let (k, v) = pair?;
            out.push((DynamicValue::new(lua, k)?, DynamicValue::new(lua, v)?));
        }
        Ok(out)
    }

    /// String keys, sorted.
    pub fn keys(&self, lua: &Lua) -> Vec<String> {
        let Ok(Some(table)) = self.table(lua) else {
            return Vec::new();
        };
        let mut keys: Vec<String> = table
            .pairs::<LuaValue, LuaValue>()
            .filter_map(Result::ok)
            .filter_map(|(k, _)| match k {
                LuaValue::String(s) => Some(s.to_string_lossy().to_string()),
                _ => None,
            })
            .collect();
        keys.sort();
        keys
    }

    /// The metatable, nil when there is none.
    pub fn metatable(&self, lua: &Lua) -> LuaResult<DynamicTable> {
        match self.table(lua)?.and_then(|t| t.metatable()) {
            Some(meta) => Self::from_table(lua, meta),
            None => Ok(Self::nil()),
        }
    }

    /// Sets the metatable; a nil `meta` removes it.
    pub fn set_metatable(&self, lua: &Lua, meta: &DynamicTable) -> LuaResult<()> {
        if let Some(table) = self.require_table(lua, "set_metatable")? {
            set_metatable(lua, &table, meta.table(lua)?)?;
        }
        Ok(())
    }

    /// Read-only proxy: reads go through to this table, writes raise a script
    /// error.
    pub fn make_read_only(&self, lua: &Lua) -> LuaResult<DynamicTable> {
        let Some(table) = self.require_table(lua, "make_read_only")? else {
            return Ok(Self::nil());
        };
        let proxy = lua.create_table()?;
        let meta = lua.create_table()?;
        meta.raw_set("__index", table)?;
        meta.raw_set(
            "__newindex",
            lua.create_function(|_, (_, key, _): (LuaValue, LuaValue, LuaValue)| -> LuaResult<()> {
                let key = match key {
                    LuaValue::String(s) => s.to_string_lossy().to_string(),
                    other => other.type_name().to_string(),
                };
                Err(LuaError::runtime(format!("attempt to modify read-only table (key '{}')", key)))
            })?,
        )?;
        meta.raw_set("__metatable", false)?;
        set_metatable(lua, &proxy, Some(meta))?;
        Self::from_table(lua, proxy)
    }

    pub fn to_variant(&self, lua: &Lua) -> Variant {
        match self.table(lua) {
            Ok(Some(table)) => value_to_variant(lua, &LuaValue::Table(table), 0),
            _ => Variant::Nil,
        }
    }

    pub fn deserialize<T: DeserializeOwned>(&self, lua: &Lua) -> Result<T, BridgeError> {
        Ok(lua.from_value(self.handle.get(lua)?)?)
    }
}

impl PartialEq<Nil> for DynamicTable {
    fn eq(&self, _: &Nil) -> bool {
        self.is_nil()
    }
}

impl IntoScript for DynamicTable {
    fn into_script(self, lua: &Lua) -> LuaResult<LuaValue> {
        self.handle.get(lua)
    }
}

impl IntoScript for &DynamicTable {
    fn into_script(self, lua: &Lua) -> LuaResult<LuaValue> {
        self.handle.get(lua)
    }
}

impl FromScript for DynamicTable {
    fn get(lua: &Lua, value: LuaValue) -> Option<Self> {
        Some(match value {
            LuaValue::Table(table) => Self::from_table(lua, table).unwrap_or_default(),
            _ => Self::nil(),
        })
    }

    fn script_type() -> &'static str {
        "table"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::lua_runtime::ScriptVm;
    use serde::Deserialize;

    #[test]
    fn get_and_set_follow_lua_semantics() {
        let vm = ScriptVm::new().unwrap();
        let lua = vm.lua();
        let t = DynamicTable::new(lua).unwrap();
        t.set(lua, "speed", 4.5).unwrap();
        t.set(lua, 1, "first").unwrap();
        assert_eq!(t.get::<f64>(lua, "speed"), 4.5);
        assert_eq!(t.get_index::<String>(lua, 1), "first");
        assert_eq!(t.get::<i32>(lua, "missing"), 0);
        assert!(t.has_field(lua, "speed"));
        assert!(!t.has_field(lua, "missing"));
        assert_eq!(t.len(lua), 1);

        t.remove(lua, "speed").unwrap();
        assert!(!t.has_field(lua, "speed"));
        t.clear(lua).unwrap();
        assert!(t.is_empty(lua));
    }

    #[test]
    fn nil_tables_read_defaults() {
        let vm = ScriptVm::new().unwrap();
        let lua = vm.lua();
        let t = DynamicTable::nil();
        assert!(t == Nil);
        assert_eq!(t.get::<i32>(lua, "x"), 0);
        t.set(lua, "x", 1).unwrap();
        assert!(t.is_empty(lua));
        assert!(t.keys(lua).is_empty());
    }

    #[test]
    fn metatables_and_read_only_proxies() {
        let vm = ScriptVm::new().unwrap();
        let lua = vm.lua();
        let defaults = DynamicTable::new(lua).unwrap();
        defaults.set(lua, "hp", 10).unwrap();
        let meta = DynamicTable::new(lua).unwrap();
        meta.set(lua, "__index", &defaults).unwrap();

        let t = DynamicTable::new(lua).unwrap();
        t.set_metatable(lua, &meta).unwrap();
        assert_eq!(t.get::<i32>(lua, "hp"), 10);
        assert_eq!(t.raw_get::<i32>(lua, "hp"), 0);
        assert!(!t.metatable(lua).unwrap().is_nil());

        let ro = defaults.make_read_only(lua).unwrap();
        vm.set_global("ro", &ro).unwrap();
        assert_eq!(vm.lua().load("return ro.hp").eval::<i32>().unwrap(), 10);
        assert!(vm.do_string("ro.hp = 1", "write").is_err());
    }

    #[test]
    fn json_and_serde_conversions() {
        #[derive(Serialize, Deserialize, Debug, PartialEq)]
        struct Level {
            name: String,
            waves: Vec<i32>,
        }
        let vm = ScriptVm::new().unwrap();
        let lua = vm.lua();

        let t = DynamicTable::from_json(lua, r#"{"name": "intro", "waves": [1, 2]}"#).unwrap();
        assert_eq!(t.get::<String>(lua, "name"), "intro");
        assert_eq!(t.get_array(lua, "waves").len(lua), 2);
        assert_eq!(t.keys(lua), vec!["name", "waves"]);

        let level = Level {
            name: "boss".into(),
            waves: vec![9],
        };
        let t = DynamicTable::from_serializable(lua, &level).unwrap();
        assert_eq!(t.deserialize::<Level>(lua).unwrap(), level);
        assert!(DynamicTable::from_json(lua, "{ nope").is_err());
    }
}
