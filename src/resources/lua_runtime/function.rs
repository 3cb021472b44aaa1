//! Callable values held from native code.

use std::rc::Rc;

use log::error;
use mlua::prelude::*;

use super::marshal::{FromScript, IntoArgs, IntoScript, Nil, ReturnValue, Stack};
use super::object::ScriptClass;
use super::proxy::{Arity, FunctionBinding, NativeFn, NativeMethod};
use super::refs::ScriptRef;
use super::runtime::bridge_state;
use super::trace::protected_call;
use crate::error::BridgeError;

/// Strong handle to a Lua function. Calls run under the error handler.
#[derive(Clone, Debug, Default)]
pub struct ScriptFunction {
    handle: ScriptRef,
}

impl ScriptFunction {
    pub fn nil() -> Self {
        Self::default()
    }

    pub fn new(lua: &Lua, function: LuaFunction) -> LuaResult<Self> {
        Ok(Self {
            handle: ScriptRef::new(lua, LuaValue::Function(function))?,
        })
    }

    /// Wraps a native function so scripts (or native code) can call it like
    /// any other Lua function.
    pub fn from_fn<F, Args, R>(lua: &Lua, f: F) -> LuaResult<Self>
    where
        F: NativeFn<Args, R>,
        R: ReturnValue,
    {
        let strict = bridge_state(lua)?.strict_arity;
        let arity = Arity::for_params(F::param_types().len(), strict);
        let binding = FunctionBinding::function(lua, "<native>", f, arity)?;
        Self::new(lua, binding.into_function())
    }

    /// Wraps a method bound to `object`. The function holds the object weakly.
    pub fn from_method<T, F, Args, R>(lua: &Lua, name: &str, object: &Rc<T>, f: F) -> LuaResult<Self>
    where
        T: ScriptClass,
        F: NativeMethod<T, Args, R>,
        R: ReturnValue,
    {
        let strict = bridge_state(lua)?.strict_arity;
        let arity = Arity::for_params(F::param_types().len(), strict);
        let binding = FunctionBinding::bound(lua, name, object, f, arity)?;
        Self::new(lua, binding.into_function())
    }

    /// Wraps a callback that handles the call frame itself.
    pub fn from_raw<F>(lua: &Lua, f: F) -> LuaResult<Self>
    where
        F: Fn(&Lua, Stack) -> LuaResult<LuaMultiValue> + 'static,
    {
        let binding = FunctionBinding::raw(lua, "<native>", f)?;
        Self::new(lua, binding.into_function())
    }

    pub fn is_nil(&self) -> bool {
        self.handle.is_nil()
    }

    pub fn function(&self, lua: &Lua) -> LuaResult<Option<LuaFunction>> {
        match self.handle.get(lua)? {
            LuaValue::Function(f) => Ok(Some(f)),
            _ => Ok(None),
        }
    }

    /// Calls the function and returns every result.
    ///
    /// # Errors
    ///
    /// Calling a nil handle, or a function that raises, is an error; the
    /// handler has already logged it.
    pub fn call_multi(&self, lua: &Lua, args: impl IntoArgs) -> Result<Stack, BridgeError> {
        let Some(function) = self.function(lua)? else {
            error!(target: "lua", "attempt to call a nil function");
            return Err(BridgeError::Script {
                message: "attempt to call a nil function".to_string(),
                traceback: Vec::new(),
            });
        };
        let args = args.into_args(lua)?;
        Ok(Stack::from(protected_call(lua, &function, args)?))
    }

    /// Calls the function and reads its first result as `R`.
    pub fn call<R: FromScript + Default>(&self, lua: &Lua, args: impl IntoArgs) -> Result<R, BridgeError> {
        let results = self.call_multi(lua, args)?;
        Ok(results.get(lua, 1))
    }

    /// Calls the function, ignoring results.
    pub fn call_void(&self, lua: &Lua, args: impl IntoArgs) -> Result<(), BridgeError> {
        self.call_multi(lua, args).map(|_| ())
    }
}

impl PartialEq<Nil> for ScriptFunction {
    fn eq(&self, _: &Nil) -> bool {
        self.is_nil()
    }
}

impl IntoScript for ScriptFunction {
    fn into_script(self, lua: &Lua) -> LuaResult<LuaValue> {
        self.handle.get(lua)
    }
}

impl IntoScript for &ScriptFunction {
    fn into_script(self, lua: &Lua) -> LuaResult<LuaValue> {
        self.handle.get(lua)
    }
}

impl FromScript for ScriptFunction {
    fn get(lua: &Lua, value: LuaValue) -> Option<Self> {
        Some(match value {
            LuaValue::Function(f) => Self::new(lua, f).unwrap_or_default(),
            _ => Self::nil(),
        })
    }

    fn script_type() -> &'static str {
        "function"
    }
}
