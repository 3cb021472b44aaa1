//! Sequence tables held from native code. Indices are 1-based, as in Lua.

use log::error;
use mlua::prelude::*;

use super::marshal::{FromScript, IntoScript, Nil};
use super::refs::ScriptRef;

#[derive(Clone, Debug, Default)]
pub struct DynamicArray {
    handle: ScriptRef,
}

impl DynamicArray {
    pub fn nil() -> Self {
        Self::default()
    }

    pub fn new(lua: &Lua) -> LuaResult<Self> {
        Self::from_table(lua, lua.create_table()?)
    }

    pub fn from_table(lua: &Lua, table: LuaTable) -> LuaResult<Self> {
        Ok(Self {
            handle: ScriptRef::new(lua, LuaValue::Table(table))?,
        })
    }

    pub fn from_vec<T: IntoScript>(lua: &Lua, items: Vec<T>) -> LuaResult<Self> {
        match IntoScript::into_script(items, lua)? {
            LuaValue::Table(table) => Self::from_table(lua, table),
            _ => Ok(Self::nil()),
        }
    }

    pub fn is_nil(&self) -> bool {
        self.handle.is_nil()
    }

    fn table(&self, lua: &Lua) -> LuaResult<Option<LuaTable>> {
        match self.handle.get(lua)? {
            LuaValue::Table(table) => Ok(Some(table)),
            _ => Ok(None),
        }
    }

    fn require_table(&self, lua: &Lua, op: &str) -> LuaResult<Option<LuaTable>> {
        let table = self.table(lua)?;
        if table.is_none() {
            error!("{} on a nil array ignored", op);
        }
        Ok(table)
    }

    pub fn len(&self, lua: &Lua) -> usize {
        match self.table(lua) {
            Ok(Some(table)) => table.raw_len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self, lua: &Lua) -> bool {
        self.len(lua) == 0
    }

    /// Element at `index`; out of range reads as the default.
    pub fn get<T: FromScript + Default>(&self, lua: &Lua, index: usize) -> T {
        match self.table(lua) {
            Ok(Some(table)) => table
                .raw_get::<LuaValue>(index)
                .ok()
                .and_then(|v| T::get(lua, v))
                .unwrap_or_default(),
            _ => T::default(),
        }
    }

    pub fn set(&self, lua: &Lua, index: usize, value: impl IntoScript) -> LuaResult<()> {
        if let Some(table) = self.require_table(lua, "set")? {
            table.raw_set(index, value.into_script(lua)?)?;
        }
        Ok(())
    }

    pub fn push(&self, lua: &Lua, value: impl IntoScript) -> LuaResult<()> {
        if let Some(table) = self.require_table(lua, "push")? {
            let len = table.raw_len();
            table.raw_set(len + 1, value.into_script(lua)?)?;
        }
        Ok(())
    }

    /// Inserts at `index`, shifting later elements up. An index past the end
    /// appends.
    pub fn insert(&self, lua: &Lua, index: usize, value: impl IntoScript) -> LuaResult<()> {
        let Some(table) = self.require_table(lua, "insert")? else {
            return Ok(());
        };
        let len = table.raw_len();
        let index = index.clamp(1, len + 1);
        for i in (index..=len).rev() {
            table.raw_set(i + 1, table.raw_get::<LuaValue>(i)?)?;
        }
        table.raw_set(index, value.into_script(lua)?)
    }

    /// Removes the element at `index`, shifting later elements down.
    pub fn remove(&self, lua: &Lua, index: usize) -> LuaResult<()> {
        let Some(table) = self.require_table(lua, "remove")? else {
            return Ok(());
        };
        let len = table.raw_len();
        if index == 0 || index > len {
            return Ok(());
        }
        for i in index..len {
            table.raw_set(i, table.raw_get::<LuaValue>(i + 1)?)?;
        }
        table.raw_set(len, LuaValue::Nil)
    }

    /// Removes and returns the last element.
    pub fn pop<T: FromScript + Default>(&self, lua: &Lua) -> LuaResult<T> {
        let len = self.len(lua);
        if len == 0 {
            return Ok(T::default());
        }
        let last = self.get(lua, len);
        self.remove(lua, len)?;
        Ok(last)
    }

    /// Truncates to `len`, or grows to it filling new slots with `fill`.
    pub fn resize<V: IntoScript + Clone>(&self, lua: &Lua, len: usize, fill: V) -> LuaResult<()> {
        let Some(table) = self.require_table(lua, "resize")? else {
            return Ok(());
        };
        let current = table.raw_len();
        for i in (len + 1..=current).rev() {
            table.raw_set(i, LuaValue::Nil)?;
        }
        for i in current + 1..=len {
            table.raw_set(i, fill.clone().into_script(lua)?)?;
        }
        Ok(())
    }

    pub fn reverse(&self, lua: &Lua) -> LuaResult<()> {
        let Some(table) = self.require_table(lua, "reverse")? else {
            return Ok(());
        };
        let len = table.raw_len();
        for i in 1..=len / 2 {
            let j = len + 1 - i;
            let a: LuaValue = table.raw_get(i)?;
            let b: LuaValue = table.raw_get(j)?;
            table.raw_set(i, b)?;
            table.raw_set(j, a)?;
        }
        Ok(())
    }

    pub fn clear(&self, lua: &Lua) -> LuaResult<()> {
        self.resize(lua, 0, Nil)
    }

    pub fn to_vec<T: FromScript + Default>(&self, lua: &Lua) -> Vec<T> {
        match self.handle.get(lua) {
            Ok(value) => <Vec<T> as FromScript>::get(lua, value).unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }
}

impl PartialEq<Nil> for DynamicArray {
    fn eq(&self, _: &Nil) -> bool {
        self.is_nil()
    }
}

impl IntoScript for DynamicArray {
    fn into_script(self, lua: &Lua) -> LuaResult<LuaValue> {
        self.handle.get(lua)
    }
}

impl IntoScript for &DynamicArray {
    fn into_script(self, lua: &Lua) -> LuaResult<LuaValue> {
        self.handle.get(lua)
    }
}

impl FromScript for DynamicArray {
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

    #[test]
    fn push_insert_remove_keep_sequence() {
        let vm = ScriptVm::new().unwrap();
        let lua = vm.lua();
        let a = DynamicArray::from_vec(lua, vec![1, 2, 4]).unwrap();
        a.insert(lua, 3, 3).unwrap();
        a.push(lua, 5).unwrap();
        assert_eq!(a.to_vec::<i32>(lua), vec![1, 2, 3, 4, 5]);

        a.remove(lua, 1).unwrap();
        assert_eq!(a.to_vec::<i32>(lua), vec![2, 3, 4, 5]);
        assert_eq!(a.pop::<i32>(lua).unwrap(), 5);
        assert_eq!(a.len(lua), 3);
        assert_eq!(a.get::<i32>(lua, 10), 0);
    }

    #[test]
    fn resize_reverse_clear() {
        let vm = ScriptVm::new().unwrap();
        let lua = vm.lua();
        let a = DynamicArray::from_vec(lua, vec!["a", "b", "c"]).unwrap();
        a.reverse(lua).unwrap();
        assert_eq!(a.to_vec::<String>(lua), vec!["c", "b", "a"]);
        a.resize(lua, 5, "z").unwrap();
        assert_eq!(a.to_vec::<String>(lua), vec!["c", "b", "a", "z", "z"]);
        a.resize(lua, 2, "z").unwrap();
        assert_eq!(a.len(lua), 2);
        a.clear(lua).unwrap();
        assert!(a.is_empty(lua));
    }

    #[test]
    fn script_sees_native_changes() {
        let vm = ScriptVm::new().unwrap();
        let a = DynamicArray::new(vm.lua()).unwrap();
        vm.set_global("items", &a).unwrap();
        a.push(vm.lua(), "x").unwrap();
        assert_eq!(vm.lua().load("return #items").eval::<i32>().unwrap(), 1);
    }
}
