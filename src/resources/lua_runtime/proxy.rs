//! Trampolines that let scripts call native functions.
//!
//! A native callable is moved into a Lua closure created with
//! `create_function`. The VM owns that closure, so the callable is freed
//! exactly once, when the closure is collected or the VM closes. On every call
//! the trampoline:
//!
//! 1. checks the argument count for fixed-arity bindings (raising a script
//!    error on short calls),
//! 2. for methods, validates the receiver in slot 1,
//! 3. converts each declared parameter left to right,
//! 4. invokes the callable and pushes its result (nothing for `()`).
//!
//! Argument mismatches degrade to defaults (see [`marshal`](super::marshal));
//! the only values that cannot degrade are class objects, and a call with a
//! bad object argument is logged and returns no results.

use std::fmt;
use std::rc::{Rc, Weak};

use log::error;
use mlua::prelude::*;

use super::class::{self, CastError};
use super::marshal::{FromScript, ReturnValue, Stack};
use super::object::ScriptClass;

/// How strictly a binding checks its argument count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Arity {
    /// Missing arguments read as `nil` and degrade to defaults.
    #[default]
    Lenient,
    /// Calls with fewer arguments raise a script error before the body runs.
    Exact(usize),
}

impl Arity {
    /// `Exact(params)` when `strict`, `Lenient` otherwise.
    pub fn for_params(params: usize, strict: bool) -> Self {
        if strict {
            Arity::Exact(params)
        } else {
            Arity::Lenient
        }
    }

    fn check(self, name: &str, supplied: usize) -> LuaResult<()> {
        match self {
            Arity::Exact(expected) if supplied < expected => Err(LuaError::runtime(format!(
                "wrong number of arguments to '{}' (expected {}, got {})",
                name, expected, supplied
            ))),
            _ => Ok(()),
        }
    }
}

/// A parameter that could not be converted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgError {
    /// 1-based position among the declared parameters.
    pub index: usize,
    pub expected: &'static str,
}

impl fmt::Display for ArgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bad argument #{} ({} expected)", self.index, self.expected)
    }
}

/// A native free function taking marshallable parameters.
///
/// Implemented for every `Fn(A1, .., An) -> R` with up to eight parameters.
/// Closures need their parameter types spelled out.
pub trait NativeFn<Args, R>: 'static {
    fn param_types() -> Vec<&'static str>;

    /// Converts the parameters found after `offset` and calls the function.
    fn invoke(&self, lua: &Lua, stack: &Stack, offset: usize) -> Result<R, ArgError>;
}

/// A native method: a callable taking the receiver as `&T` first.
pub trait NativeMethod<T, Args, R>: 'static {
    fn param_types() -> Vec<&'static str>;

    fn invoke(&self, lua: &Lua, this: &T, stack: &Stack, offset: usize) -> Result<R, ArgError>;
}

macro_rules! impl_native {
    ($($A:ident),*) => {
        impl<Func, Ret, $($A,)*> NativeFn<($($A,)*), Ret> for Func
        where
            Func: Fn($($A),*) -> Ret + 'static,
            $($A: FromScript,)*
        {
            fn param_types() -> Vec<&'static str> {
                vec![$(<$A as FromScript>::script_type()),*]
            }

            #[allow(non_snake_case, unused_variables, unused_mut)]
            fn invoke(&self, lua: &Lua, stack: &Stack, offset: usize) -> Result<Ret, ArgError> {
                let mut index = 0;
                $(
                    index += 1;
                    let $A = <$A as FromScript>::get(lua, stack.value(offset + index)).ok_or(ArgError {
                        index,
                        expected: <$A as FromScript>::script_type(),
                    })?;
                )*
                Ok((self)($($A),*))
            }
        }

        impl<Func, Obj, Ret, $($A,)*> NativeMethod<Obj, ($($A,)*), Ret> for Func
        where
            Func: Fn(&Obj, $($A),*) -> Ret + 'static,
            Obj: 'static,
            $($A: FromScript,)*
        {
            fn param_types() -> Vec<&'static str> {
                vec![$(<$A as FromScript>::script_type()),*]
            }

            #[allow(non_snake_case, unused_variables, unused_mut)]
            fn invoke(&self, lua: &Lua, this: &Obj, stack: &Stack, offset: usize) -> Result<Ret, ArgError> {
                let mut index = 0;
                $(
                    index += 1;
                    let $A = <$A as FromScript>::get(lua, stack.value(offset + index)).ok_or(ArgError {
                        index,
                        expected: <$A as FromScript>::script_type(),
                    })?;
                )*
                Ok((self)(this, $($A),*))
            }
        }
    };
}

impl_native!();
impl_native!(A1);
impl_native!(A1, A2);
impl_native!(A1, A2, A3);
impl_native!(A1, A2, A3, A4);
impl_native!(A1, A2, A3, A4, A5);
impl_native!(A1, A2, A3, A4, A5, A6);
impl_native!(A1, A2, A3, A4, A5, A6, A7);
impl_native!(A1, A2, A3, A4, A5, A6, A7, A8);

/// What kind of callable a binding wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    Function,
    Method,
    BoundMethod,
    Constructor,
    Raw,
}

/// A native callable turned into a Lua function, together with its
/// signature.
#[derive(Debug, Clone)]
pub struct FunctionBinding {
    pub name: String,
    pub kind: BindingKind,
    pub params: Vec<&'static str>,
    pub returns: Option<&'static str>,
    pub arity: Arity,
    function: LuaFunction,
}

impl FunctionBinding {
    /// Free function: parameters start at slot 1.
    pub fn function<F, Args, R>(lua: &Lua, name: &str, f: F, arity: Arity) -> LuaResult<Self>
    where
        F: NativeFn<Args, R>,
        R: ReturnValue,
    {
        let label = name.to_string();
        let function = lua.create_function(move |lua, args: LuaMultiValue| {
            let stack = Stack::from(args);
            arity.check(&label, stack.len())?;
            match f.invoke(lua, &stack, 0) {
                Ok(ret) => ret.into_results(lua),
                Err(e) => {
                    error!(target: "lua", "{} to '{}'", e, label);
                    Ok(LuaMultiValue::new())
                }
            }
        })?;
        Ok(Self {
            name: name.to_string(),
            kind: BindingKind::Function,
            params: F::param_types(),
            returns: R::script_type(),
            arity,
            function,
        })
    }

    /// Unbound method: the receiver is slot 1 (`obj:name(...)`), parameters
    /// follow it.
    pub fn method<T, F, Args, R>(lua: &Lua, name: &str, f: F, arity: Arity) -> LuaResult<Self>
    where
        T: ScriptClass,
        F: NativeMethod<T, Args, R>,
        R: ReturnValue,
    {
        let label = name.to_string();
        let function = lua.create_function(move |lua, args: LuaMultiValue| {
            let stack = Stack::from(args);
            arity.check(&label, stack.len().saturating_sub(1))?;
            let Some(this) = receiver::<T>(lua, &stack, &label) else {
                return Ok(LuaMultiValue::new());
            };
            match f.invoke(lua, &this, &stack, 1) {
                Ok(ret) => ret.into_results(lua),
                Err(e) => {
                    error!(target: "lua", "{} to '{}:{}'", e, T::TYPE_NAME, label);
                    Ok(LuaMultiValue::new())
                }
            }
        })?;
        Ok(Self {
            name: name.to_string(),
            kind: BindingKind::Method,
            params: F::param_types(),
            returns: R::script_type(),
            arity,
            function,
        })
    }

    /// Method bound to one object. The binding holds the object weakly; once
    /// the object is gone calls log and return nothing.
    pub fn bound<T, F, Args, R>(lua: &Lua, name: &str, object: &Rc<T>, f: F, arity: Arity) -> LuaResult<Self>
    where
        T: ScriptClass,
        F: NativeMethod<T, Args, R>,
        R: ReturnValue,
    {
        let label = name.to_string();
        let target: Weak<T> = Rc::downgrade(object);
        let function = lua.create_function(move |lua, args: LuaMultiValue| {
            let stack = Stack::from(args);
            arity.check(&label, stack.len())?;
            let Some(this) = target.upgrade() else {
                error!(target: "lua", "'{}' called after its {} object was dropped", label, T::TYPE_NAME);
                return Ok(LuaMultiValue::new());
            };
            match f.invoke(lua, &this, &stack, 0) {
                Ok(ret) => ret.into_results(lua),
                Err(e) => {
                    error!(target: "lua", "{} to '{}'", e, label);
                    Ok(LuaMultiValue::new())
                }
            }
        })?;
        Ok(Self {
            name: name.to_string(),
            kind: BindingKind::BoundMethod,
            params: F::param_types(),
            returns: R::script_type(),
            arity,
            function,
        })
    }

    /// Constructor installed as `__call` on the class table: slot 1 is the
    /// class table itself, parameters follow it. Returns the new object's
    /// wrapper.
    pub fn constructor<T, F, Args>(lua: &Lua, f: F, arity: Arity) -> LuaResult<Self>
    where
        T: ScriptClass,
        F: NativeFn<Args, T>,
    {
        let function = lua.create_function(move |lua, args: LuaMultiValue| {
            let stack = Stack::from(args);
            arity.check(T::TYPE_NAME, stack.len().saturating_sub(1))?;
            match f.invoke(lua, &stack, 1) {
                Ok(object) => {
                    let wrapper = class::push_object(lua, Rc::new(object))?;
                    Ok(LuaMultiValue::from_vec(vec![wrapper]))
                }
                Err(e) => {
                    error!(target: "lua", "{} to {} constructor", e, T::TYPE_NAME);
                    Ok(LuaMultiValue::new())
                }
            }
        })?;
        Ok(Self {
            name: T::TYPE_NAME.to_string(),
            kind: BindingKind::Constructor,
            params: F::param_types(),
            returns: Some(T::TYPE_NAME),
            arity,
            function,
        })
    }

    /// Raw VM callback: receives the whole call frame and builds its own
    /// results.
    pub fn raw<F>(lua: &Lua, name: &str, f: F) -> LuaResult<Self>
    where
        F: Fn(&Lua, Stack) -> LuaResult<LuaMultiValue> + 'static,
    {
        let function = lua.create_function(move |lua, args: LuaMultiValue| f(lua, Stack::from(args)))?;
        Ok(Self {
            name: name.to_string(),
            kind: BindingKind::Raw,
            params: Vec::new(),
            returns: None,
            arity: Arity::Lenient,
            function,
        })
    }

    pub fn lua_function(&self) -> &LuaFunction {
        &self.function
    }

    pub fn into_function(self) -> LuaFunction {
        self.function
    }

    /// `(integer, string) -> boolean` style summary for logs and tooling.
    pub fn signature(&self) -> String {
        let params = self.params.join(", ");
        match self.returns {
            Some(ret) => format!("({}) -> {}", params, ret),
            None => format!("({})", params),
        }
    }
}

/// Resolves slot 1 as the receiver of a method call.
fn receiver<T: ScriptClass>(lua: &Lua, stack: &Stack, name: &str) -> Option<Rc<T>> {
    match class::cast::<T>(lua, &stack.value(1)) {
        Ok(this) => Some(this),
        Err(CastError::NotObject) => {
            error!(
                target: "lua",
                "First argument of '{}:{}' is not userdata. Possibly called with '.' instead of ':'?",
                T::TYPE_NAME,
                name
            );
            None
        }
        Err(e) => {
            error!(target: "lua", "Invalid receiver for '{}:{}': {}", T::TYPE_NAME, name, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::lua_runtime::ScriptVm;
    use std::cell::Cell;

    #[test]
    fn free_function_marshals_arguments() {
        let vm = ScriptVm::new().unwrap();
        let lua = vm.lua();
        let add = FunctionBinding::function(lua, "add", |a: i32, b: i32| a + b, Arity::Lenient).unwrap();
        lua.globals().set("add", add.into_function()).unwrap();

        assert_eq!(lua.load("return add(2, 3)").eval::<i32>().unwrap(), 5);
        assert_eq!(lua.load("return add('4', 1.9)").eval::<i32>().unwrap(), 5);
        assert_eq!(lua.load("return add(7)").eval::<i32>().unwrap(), 7);
    }

    #[test]
    fn unit_return_pushes_nothing() {
        let vm = ScriptVm::new().unwrap();
        let lua = vm.lua();
        let hits = Rc::new(Cell::new(0));
        let counter = hits.clone();
        let touch = FunctionBinding::function(lua, "touch", move || counter.set(counter.get() + 1), Arity::Lenient)
            .unwrap();
        lua.globals().set("touch", touch.into_function()).unwrap();

        let count: i32 = lua.load("return select('#', touch())").eval().unwrap();
        assert_eq!(count, 0);
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn exact_arity_rejects_short_calls() {
        let vm = ScriptVm::new().unwrap();
        let lua = vm.lua();
        let ran = Rc::new(Cell::new(false));
        let flag = ran.clone();
        let f = FunctionBinding::function(
            lua,
            "pair",
            move |_a: i32, _b: i32| flag.set(true),
            Arity::Exact(2),
        )
        .unwrap();
        lua.globals().set("pair", f.into_function()).unwrap();

        assert!(lua.load("pair(1)").exec().is_err());
        assert!(!ran.get());
        assert!(lua.load("pair(1, 2)").exec().is_ok());
        assert!(ran.get());
    }

    #[test]
    fn signature_lists_parameter_types() {
        let vm = ScriptVm::new().unwrap();
        let f = FunctionBinding::function(
            vm.lua(),
            "describe",
            |_n: i32, _s: String, _x: f64| true,
            Arity::Lenient,
        )
        .unwrap();
        assert_eq!(f.signature(), "(integer, string, number) -> boolean");
        assert_eq!(f.kind, BindingKind::Function);
    }

    #[test]
    fn raw_callbacks_see_the_whole_frame() {
        let vm = ScriptVm::new().unwrap();
        let lua = vm.lua();
        let count = FunctionBinding::raw(lua, "count", |lua, stack| {
            let mut out = Stack::new();
            out.push(lua, stack.len())?;
            Ok(out.into_multi())
        })
        .unwrap();
        lua.globals().set("count", count.into_function()).unwrap();
        assert_eq!(lua.load("return count(1, nil, 3)").eval::<i32>().unwrap(), 3);
    }

    #[test]
    fn native_errors_become_script_errors() {
        let vm = ScriptVm::new().unwrap();
        let lua = vm.lua();
        let fail = FunctionBinding::function(
            lua,
            "fail",
            |msg: String| -> LuaResult<()> { Err(LuaError::runtime(msg)) },
            Arity::Lenient,
        )
        .unwrap();
        lua.globals().set("fail", fail.into_function()).unwrap();
        let ok: bool = lua.load("return (pcall(fail, 'nope'))").eval().unwrap();
        assert!(!ok);
    }
}
