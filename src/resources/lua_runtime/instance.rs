//! Script objects held from native code: Lua tables used as objects (for
//! instance the ones built with `class()`) and wrappers of native classes.

use std::rc::Rc;

use log::error;
use mlua::prelude::*;

use super::class;
use super::marshal::{FromScript, IntoArgs, IntoScript, Nil, Stack};
use super::object::ScriptClass;
use super::refs::ScriptRef;
use super::table::DynamicTable;
use super::trace::protected_call;
use crate::error::BridgeError;

#[derive(Clone, Debug, Default)]
pub struct ScriptInstance {
    handle: ScriptRef,
}

impl ScriptInstance {
    pub fn nil() -> Self {
        Self::default()
    }

    /// Holds `value` when it is a table or a class wrapper; anything else
    /// gives a nil handle.
    pub fn new(lua: &Lua, value: LuaValue) -> LuaResult<Self> {
        let accepted = match &value {
            LuaValue::Table(_) => true,
            other => class::is_object(other),
        };
        if !accepted {
            return Ok(Self::nil());
        }
        Ok(Self {
            handle: ScriptRef::new(lua, value)?,
        })
    }

    pub fn is_nil(&self) -> bool {
        self.handle.is_nil()
    }

    pub fn value(&self, lua: &Lua) -> LuaResult<LuaValue> {
        self.handle.get(lua)
    }

    pub fn is_table(&self, lua: &Lua) -> bool {
        matches!(self.value(lua), Ok(LuaValue::Table(_)))
    }

    pub fn is_object(&self, lua: &Lua) -> bool {
        self.value(lua).is_ok_and(|v| class::is_object(&v))
    }

    fn member(&self, lua: &Lua, key: LuaValue) -> LuaResult<LuaValue> {
        match self.value(lua)? {
            LuaValue::Table(table) => table.get(key),
            LuaValue::UserData(ud) => class::index(lua, &ud, key),
            _ => Ok(LuaValue::Nil),
        }
    }

    /// Reads a member, honoring metatables and class chains.
    pub fn get<T: FromScript + Default>(&self, lua: &Lua, name: &str) -> T {
        let value = lua
            .create_string(name)
            .and_then(|key| self.member(lua, LuaValue::String(key)));
        match value {
            Ok(value) => T::get(lua, value).unwrap_or_default(),
            Err(_) => T::default(),
        }
    }

    /// Writes a member. On class wrappers the value becomes an instance field.
    pub fn set(&self, lua: &Lua, name: &str, value: impl IntoScript) -> LuaResult<()> {
        let key = LuaValue::String(lua.create_string(name)?);
        let value = value.into_script(lua)?;
        match self.value(lua)? {
            LuaValue::Table(table) => table.set(key, value),
            LuaValue::UserData(ud) => class::set_field(lua, &ud, key, value),
            _ => {
                error!("Field \"{}\" set on a nil instance ignored", name);
                Ok(())
            }
        }
    }

    pub fn has_field(&self, lua: &Lua, name: &str) -> bool {
        lua.create_string(name)
            .and_then(|key| self.member(lua, LuaValue::String(key)))
            .is_ok_and(|v| !v.is_nil())
    }

    pub fn has_method(&self, lua: &Lua, name: &str) -> bool {
        lua.create_string(name)
            .and_then(|key| self.member(lua, LuaValue::String(key)))
            .is_ok_and(|v| matches!(v, LuaValue::Function(_)))
    }

    /// Calls `self:name(args...)` under the error handler and returns every
    /// result.
    pub fn call_method_multi(&self, lua: &Lua, name: &str, args: impl IntoArgs) -> Result<Stack, BridgeError> {
        let this = self.value(lua)?;
        let method = self.member(lua, LuaValue::String(lua.create_string(name)?))?;
        let LuaValue::Function(method) = method else {
            error!(target: "lua", "Method \"{}\" not found on {}", name, this.type_name());
            return Err(BridgeError::Script {
                message: format!("attempt to call method '{}' (a nil value)", name),
                traceback: Vec::new(),
            });
        };
        let mut call_args = vec![this];
        call_args.extend(args.into_args(lua)?.into_vec());
        Ok(Stack::from(protected_call(lua, &method, LuaMultiValue::from_vec(call_args))?))
    }

    pub fn call_method<R: FromScript + Default>(&self, lua: &Lua, name: &str, args: impl IntoArgs) -> Result<R, BridgeError> {
        Ok(self.call_method_multi(lua, name, args)?.get(lua, 1))
    }

    pub fn call_method_void(&self, lua: &Lua, name: &str, args: impl IntoArgs) -> Result<(), BridgeError> {
        self.call_method_multi(lua, name, args).map(|_| ())
    }

    /// Native object behind a class wrapper.
    pub fn to_object<T: ScriptClass>(&self, lua: &Lua) -> Option<Rc<T>> {
        let value = self.value(lua).ok()?;
        class::cast::<T>(lua, &value).ok()
    }

    /// Table view; nil for class wrappers.
    pub fn to_table(&self, lua: &Lua) -> DynamicTable {
        match self.value(lua) {
            Ok(value) => <DynamicTable as FromScript>::get(lua, value).unwrap_or_default(),
            Err(_) => DynamicTable::nil(),
        }
    }
}

impl PartialEq<Nil> for ScriptInstance {
    fn eq(&self, _: &Nil) -> bool {
        self.is_nil()
    }
}

impl IntoScript for ScriptInstance {
    fn into_script(self, lua: &Lua) -> LuaResult<LuaValue> {
        self.handle.get(lua)
    }
}

impl IntoScript for &ScriptInstance {
    fn into_script(self, lua: &Lua) -> LuaResult<LuaValue> {
        self.handle.get(lua)
    }
}

impl FromScript for ScriptInstance {
    fn get(lua: &Lua, value: LuaValue) -> Option<Self> {
        Some(Self::new(lua, value).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::lua_runtime::ScriptVm;
    use crate::resources::lua_runtime::object::{BackRef, Exposed};
    use std::cell::Cell;

    #[test]
    fn table_objects_from_class_helper() {
        let vm = ScriptVm::new().unwrap();
        vm.do_string(
            r#"
            Paddle = class()
            function Paddle:onInit(x) self.x = x end
            function Paddle:move(dx) self.x = self.x + dx return self.x end
            paddle = Paddle(100)
            "#,
            "paddle",
        )
        .unwrap();
        let lua = vm.lua();
        let paddle: ScriptInstance = vm.global("paddle");
        assert!(paddle.is_table(lua));
        assert!(paddle.has_method(lua, "move"));
        assert!(!paddle.has_method(lua, "x"));
        assert_eq!(paddle.call_method::<i32>(lua, "move", (5,)).unwrap(), 105);
        paddle.set(lua, "x", 0).unwrap();
        assert_eq!(paddle.get::<i32>(lua, "x"), 0);
        assert!(paddle.call_method_void(lua, "jump", ()).is_err());
    }

    #[test]
    fn plain_values_are_not_instances() {
        let vm = ScriptVm::new().unwrap();
        let inst = ScriptInstance::new(vm.lua(), LuaValue::Integer(3)).unwrap();
        assert!(inst == Nil);
    }

    struct Ball {
        back_ref: BackRef,
        speed: Cell<i32>,
    }

    impl Exposed for Ball {
        fn back_ref(&self) -> &BackRef {
            &self.back_ref
        }
    }

    impl ScriptClass for Ball {
        const TYPE_NAME: &'static str = "Ball";
    }

    #[test]
    fn class_wrappers_expose_fields_and_methods() {
        let vm = ScriptVm::new().unwrap();
        vm.register_class::<Ball>()
            .unwrap()
            .method("speed", |this: &Ball| this.speed.get())
            .unwrap();
        let ball = Rc::new(Ball {
            back_ref: BackRef::new(),
            speed: Cell::new(3),
        });
        let lua = vm.lua();
        let inst = ScriptInstance::new(lua, vm.push(ball.clone()).unwrap()).unwrap();
        assert!(inst.is_object(lua));
        assert_eq!(inst.call_method::<i32>(lua, "speed", ()).unwrap(), 3);

        inst.set(lua, "label", "main").unwrap();
        assert_eq!(inst.get::<String>(lua, "label"), "main");
        assert!(Rc::ptr_eq(&inst.to_object::<Ball>(lua).unwrap(), &ball));
        assert!(inst.to_table(lua).is_nil());
    }
}
