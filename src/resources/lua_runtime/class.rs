//! Class registration and the userdata wrapper of native objects.
//!
//! Each registered class gets a class table, published as a global under its
//! type name and kept in the registry under its name and its [`TypeTag`]:
//!
//! | key      | value                                       |
//! |----------|---------------------------------------------|
//! | `__name` | type name                                   |
//! | `__tag`  | runtime tag (integer, registration order)   |
//! | `__base` | class table of the base class, if any       |
//! | methods  | method and static function closures         |
//!
//! Its metatable carries the constructor as `__call` and falls back to the
//! base class table for static lookups.
//!
//! Objects reach scripts as [`Instance`] userdata. Member lookup on an
//! instance tries, in order: the class's index handler, the instance's own
//! fields (set from script with `obj.x = v`), the class table, then each base
//! class table up the chain. The `__`-prefixed bookkeeping keys of class
//! tables are not visible through instances.

use std::any::TypeId;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use log::{error, info, warn};
use mlua::prelude::*;
use rustc_hash::FxHashMap;

use super::marshal::{IntoScript, ReturnValue};
use super::object::{Exposed, ScriptClass, downcast_rc};
use super::proxy::{Arity, FunctionBinding, NativeFn, NativeMethod};
use super::refs::WeakScriptRef;
use super::runtime::{bridge_state, set_metatable};

const CLASS_TABLE: &str = "aberred.classes";

/// Runtime type tag, assigned once per VM in registration order starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeTag(pub(crate) u32);

impl TypeTag {
    pub fn get(self) -> u32 {
        self.0
    }
}

type IndexHandler = Rc<dyn Fn(&Lua, Rc<dyn Exposed>, LuaValue) -> LuaResult<LuaValue>>;

/// Signature of a bound method or static function, kept for tooling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub name: String,
    pub params: Vec<&'static str>,
    pub returns: Option<&'static str>,
    pub is_static: bool,
}

/// Native-side description of a registered class.
pub struct ClassInfo {
    pub name: &'static str,
    /// Base class, present only when it was registered first.
    pub base: Option<&'static str>,
    pub tag: TypeTag,
    /// Constructor parameter types, when a constructor is bound.
    pub constructor: Option<Vec<&'static str>>,
    pub methods: Vec<MethodInfo>,
    type_id: TypeId,
    index_handler: Option<IndexHandler>,
}

impl ClassInfo {
    fn record(&mut self, info: MethodInfo) {
        match self.methods.iter_mut().find(|m| m.name == info.name) {
            Some(existing) => *existing = info,
            None => self.methods.push(info),
        }
    }

    pub fn has_index_handler(&self) -> bool {
        self.index_handler.is_some()
    }
}

impl fmt::Debug for ClassInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassInfo")
            .field("name", &self.name)
            .field("base", &self.base)
            .field("tag", &self.tag)
            .field("methods", &self.methods.len())
            .finish()
    }
}

/// All classes registered in one VM.
#[derive(Debug, Default)]
pub struct ClassRegistry {
    classes: Vec<ClassInfo>,
    by_name: FxHashMap<&'static str, usize>,
}

impl ClassRegistry {
    pub fn get(&self, name: &str) -> Option<&ClassInfo> {
        self.by_name.get(name).map(|&i| &self.classes[i])
    }

    fn get_mut(&mut self, name: &str) -> Option<&mut ClassInfo> {
        self.by_name.get(name).map(|&i| &mut self.classes[i])
    }

    pub fn by_tag(&self, tag: TypeTag) -> Option<&ClassInfo> {
        (tag.0 as usize).checked_sub(1).and_then(|i| self.classes.get(i))
    }

    pub fn tag_of(&self, name: &str) -> Option<TypeTag> {
        self.get(name).map(|c| c.tag)
    }

    /// Classes in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &ClassInfo> {
        self.classes.iter()
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    fn insert(&mut self, info: ClassInfo) {
        self.by_name.insert(info.name, self.classes.len());
        self.classes.push(info);
    }

    fn next_tag(&self) -> TypeTag {
        TypeTag(self.classes.len() as u32 + 1)
    }
}

// --------------- Wrapper userdata ---------------

/// Script wrapper of a native object. Holds exactly one `Rc` to it.
pub(crate) struct Instance {
    tag: TypeTag,
    object: RefCell<Option<Rc<dyn Exposed>>>,
    wrapper_slot: Cell<Option<i64>>,
}

impl Instance {
    fn object(&self) -> Option<Rc<dyn Exposed>> {
        self.object.borrow().clone()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        if let Some(object) = self.object.get_mut().take() {
            if let Some(slot) = self.wrapper_slot.get() {
                object.back_ref().clear_slot(slot);
            }
        }
    }
}

impl LuaUserData for Instance {
    fn add_methods<M: LuaUserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_function(
            LuaMetaMethod::Index,
            |lua, (ud, key): (LuaAnyUserData, LuaValue)| index(lua, &ud, key),
        );
        methods.add_meta_function(
            LuaMetaMethod::NewIndex,
            |lua, (ud, key, value): (LuaAnyUserData, LuaValue, LuaValue)| set_field(lua, &ud, key, value),
        );
        methods.add_meta_function(LuaMetaMethod::ToString, |lua, ud: LuaAnyUserData| {
            let (tag, alive) = {
                let inst = ud.borrow::<Instance>()?;
                (inst.tag, inst.object.borrow().is_some())
            };
            let name = class_name(lua, tag)?;
            Ok(if alive {
                format!("{}: {:p}", name, ud.to_pointer())
            } else {
                format!("{} (detached): {:p}", name, ud.to_pointer())
            })
        });
    }
}

/// Stores a per-instance field, as `obj.key = value` does.
pub(crate) fn set_field(lua: &Lua, ud: &LuaAnyUserData, key: LuaValue, value: LuaValue) -> LuaResult<()> {
    let fields = match ud.user_value::<LuaValue>()? {
        LuaValue::Table(fields) => fields,
        _ => {
            let fields = lua.create_table()?;
            ud.set_user_value(fields.clone())?;
            fields
        }
    };
    fields.raw_set(key, value)
}

/// Member lookup, as `obj.key` does.
pub(crate) fn index(lua: &Lua, ud: &LuaAnyUserData, key: LuaValue) -> LuaResult<LuaValue> {
    let (tag, object) = {
        let inst = ud.borrow::<Instance>()?;
        (inst.tag, inst.object())
    };

    if let Some(object) = object {
        let handler = bridge_state(lua)?
            .classes
            .borrow()
            .by_tag(tag)
            .and_then(|c| c.index_handler.clone());
        if let Some(handler) = handler {
            let value = handler(lua, object, key.clone())?;
            if !value.is_nil() {
                return Ok(value);
            }
        }
    }

    if let LuaValue::Table(fields) = ud.user_value::<LuaValue>()? {
        let value: LuaValue = fields.raw_get(key.clone())?;
        if !value.is_nil() {
            return Ok(value);
        }
    }

    if is_bookkeeping_key(&key) {
        return Ok(LuaValue::Nil);
    }
    let mut class = class_table_by_tag(lua, tag)?;
    while let Some(table) = class {
        let value: LuaValue = table.raw_get(key.clone())?;
        if !value.is_nil() {
            return Ok(value);
        }
        class = table.raw_get("__base")?;
    }
    Ok(LuaValue::Nil)
}

fn is_bookkeeping_key(key: &LuaValue) -> bool {
    matches!(key, LuaValue::String(s) if s.as_bytes().starts_with(b"__"))
}

// --------------- Class tables ---------------

fn classes(lua: &Lua) -> LuaResult<LuaTable> {
    match lua.named_registry_value::<Option<LuaTable>>(CLASS_TABLE)? {
        Some(t) => Ok(t),
        None => {
            let t = lua.create_table()?;
            lua.set_named_registry_value(CLASS_TABLE, t.clone())?;
            Ok(t)
        }
    }
}

/// Class table registered under `name`.
pub fn class_table(lua: &Lua, name: &str) -> LuaResult<Option<LuaTable>> {
    classes(lua)?.raw_get(name)
}

fn class_table_by_tag(lua: &Lua, tag: TypeTag) -> LuaResult<Option<LuaTable>> {
    classes(lua)?.raw_get(tag.0)
}

fn class_name(lua: &Lua, tag: TypeTag) -> LuaResult<&'static str> {
    Ok(bridge_state(lua)?
        .classes
        .borrow()
        .by_tag(tag)
        .map(|c| c.name)
        .unwrap_or("userdata"))
}

/// Registers `T` and publishes its class table as the global `T::TYPE_NAME`,
/// or returns a builder for the existing registration.
///
/// A base class named by `T::BASE_TYPE_NAME` must already be registered;
/// when it is not, the error is logged and the class is registered without
/// a base link.
pub fn register<T: ScriptClass>(lua: &Lua) -> LuaResult<ClassBuilder<'_, T>> {
    let state = bridge_state(lua)?;
    let strict = state.strict_arity;
    let existing = state
        .classes
        .borrow()
        .get(T::TYPE_NAME)
        .map(|c| (c.tag, c.type_id));

    if let Some((tag, type_id)) = existing {
        if type_id != TypeId::of::<T>() {
            error!("Class \"{}\" is already registered by another native type", T::TYPE_NAME);
            return Err(LuaError::runtime(format!(
                "class \"{}\" is already registered by another native type",
                T::TYPE_NAME
            )));
        }
        let table = class_table_by_tag(lua, tag)?
            .ok_or_else(|| LuaError::runtime(format!("class table of \"{}\" is missing", T::TYPE_NAME)))?;
        return Ok(ClassBuilder::new(lua, table, tag, strict));
    }

    let tag = state.classes.borrow().next_tag();
    let table = lua.create_table()?;
    table.raw_set("__name", T::TYPE_NAME)?;
    table.raw_set("__tag", tag.0)?;

    let meta = lua.create_table()?;
    let mut base = None;
    if let Some(base_name) = T::BASE_TYPE_NAME {
        match class_table(lua, base_name)? {
            Some(base_table) => {
                table.raw_set("__base", base_table.clone())?;
                meta.raw_set("__index", base_table)?;
                base = Some(base_name);
            }
            None => error!(
                "Base class \"{}\" of \"{}\" is not registered, inheritance link skipped",
                base_name,
                T::TYPE_NAME
            ),
        }
    }
    set_metatable(lua, &table, Some(meta))?;

    let registry = classes(lua)?;
    registry.raw_set(T::TYPE_NAME, table.clone())?;
    registry.raw_set(tag.0, table.clone())?;
    lua.globals().raw_set(T::TYPE_NAME, table.clone())?;

    state.classes.borrow_mut().insert(ClassInfo {
        name: T::TYPE_NAME,
        base,
        tag,
        constructor: None,
        methods: Vec::new(),
        type_id: TypeId::of::<T>(),
        index_handler: None,
    });
    info!("Registered class \"{}\" ({:?})", T::TYPE_NAME, tag);

    Ok(ClassBuilder::new(lua, table, tag, strict))
}

/// Fluent binding of constructor, methods and static functions of a class.
pub struct ClassBuilder<'lua, T: ScriptClass> {
    lua: &'lua Lua,
    table: LuaTable,
    tag: TypeTag,
    strict: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<'lua, T: ScriptClass> ClassBuilder<'lua, T> {
    fn new(lua: &'lua Lua, table: LuaTable, tag: TypeTag, strict: bool) -> Self {
        Self {
            lua,
            table,
            tag,
            strict,
            _marker: PhantomData,
        }
    }

    pub fn table(&self) -> &LuaTable {
        &self.table
    }

    pub fn tag(&self) -> TypeTag {
        self.tag
    }

    fn update(&self, f: impl FnOnce(&mut ClassInfo)) -> LuaResult<()> {
        let state = bridge_state(self.lua)?;
        if let Some(info) = state.classes.borrow_mut().get_mut(T::TYPE_NAME) {
            f(info);
        }
        Ok(())
    }

    /// Makes the class table callable: `T(args...)` builds a new object.
    pub fn constructor<F, Args>(self, f: F) -> LuaResult<Self>
    where
        F: NativeFn<Args, T>,
    {
        let arity = Arity::for_params(F::param_types().len(), self.strict);
        self.bind_constructor(f, arity)
    }

    /// Constructor that rejects calls with missing arguments.
    pub fn constructor_checked<F, Args>(self, f: F) -> LuaResult<Self>
    where
        F: NativeFn<Args, T>,
    {
        let arity = Arity::Exact(F::param_types().len());
        self.bind_constructor(f, arity)
    }

    fn bind_constructor<F, Args>(self, f: F, arity: Arity) -> LuaResult<Self>
    where
        F: NativeFn<Args, T>,
    {
        let binding = FunctionBinding::constructor::<T, F, Args>(self.lua, f, arity)?;
        let meta = match self.table.metatable() {
            Some(meta) => meta,
            None => {
                let meta = self.lua.create_table()?;
                set_metatable(self.lua, &self.table, Some(meta.clone()))?;
                meta
            }
        };
        meta.raw_set("__call", binding.lua_function().clone())?;
        let params = binding.params.clone();
        self.update(|info| info.constructor = Some(params))?;
        Ok(self)
    }

    /// Binds a method called as `obj:name(...)`.
    pub fn method<F, Args, R>(self, name: &str, f: F) -> LuaResult<Self>
    where
        F: NativeMethod<T, Args, R>,
        R: ReturnValue,
    {
        let arity = Arity::for_params(F::param_types().len(), self.strict);
        self.bind_method(name, f, arity)
    }

    /// Method that rejects calls with missing arguments.
    pub fn method_checked<F, Args, R>(self, name: &str, f: F) -> LuaResult<Self>
    where
        F: NativeMethod<T, Args, R>,
        R: ReturnValue,
    {
        let arity = Arity::Exact(F::param_types().len());
        self.bind_method(name, f, arity)
    }

    fn bind_method<F, Args, R>(self, name: &str, f: F, arity: Arity) -> LuaResult<Self>
    where
        F: NativeMethod<T, Args, R>,
        R: ReturnValue,
    {
        let binding = FunctionBinding::method::<T, F, Args, R>(self.lua, name, f, arity)?;
        self.install(binding, false)
    }

    /// Binds a function on the class table called as `Class.name(...)`.
    pub fn static_function<F, Args, R>(self, name: &str, f: F) -> LuaResult<Self>
    where
        F: NativeFn<Args, R>,
        R: ReturnValue,
    {
        let arity = Arity::for_params(F::param_types().len(), self.strict);
        let binding = FunctionBinding::function(self.lua, name, f, arity)?;
        self.install(binding, true)
    }

    /// Binds a raw callback that sees the whole call frame.
    pub fn raw_method<F>(self, name: &str, f: F) -> LuaResult<Self>
    where
        F: Fn(&Lua, super::marshal::Stack) -> LuaResult<LuaMultiValue> + 'static,
    {
        let binding = FunctionBinding::raw(self.lua, name, f)?;
        self.install(binding, false)
    }

    /// Stores a plain value (constant, script function) on the class table.
    pub fn field<V: IntoScript>(self, name: &str, value: V) -> LuaResult<Self> {
        self.table.raw_set(name, value.into_script(self.lua)?)?;
        Ok(self)
    }

    fn install(self, binding: FunctionBinding, is_static: bool) -> LuaResult<Self> {
        self.table.raw_set(binding.name.as_str(), binding.lua_function().clone())?;
        let info = MethodInfo {
            name: binding.name.clone(),
            params: binding.params.clone(),
            returns: binding.returns,
            is_static,
        };
        self.update(|class| class.record(info))?;
        Ok(self)
    }

    /// Handler consulted first on every member lookup. Returning `nil` falls
    /// through to fields and the class chain.
    pub fn index_handler<F>(self, f: F) -> LuaResult<Self>
    where
        F: Fn(&Lua, Rc<T>, LuaValue) -> LuaResult<LuaValue> + 'static,
    {
        let handler: IndexHandler = Rc::new(
            move |lua: &Lua, object: Rc<dyn Exposed>, key: LuaValue| match downcast_rc::<T>(object) {
                Some(this) => f(lua, this, key),
                None => Ok(LuaValue::Nil),
            },
        );
        self.update(|info| info.index_handler = Some(handler))?;
        Ok(self)
    }

    /// Ends the chain, returning the class table.
    pub fn finish(self) -> LuaTable {
        self.table
    }
}

// --------------- Pushing and casting objects ---------------

/// Pushes `object`, reusing its wrapper when one is alive.
pub(crate) fn push_object<T: ScriptClass>(lua: &Lua, object: Rc<T>) -> LuaResult<LuaValue> {
    if let Some(ud) = object.back_ref().wrapper(lua)? {
        return Ok(LuaValue::UserData(ud));
    }
    let tag = bridge_state(lua)?.classes.borrow().tag_of(T::TYPE_NAME);
    let Some(tag) = tag else {
        error!("Class \"{}\" is not registered, object pushed as nil", T::TYPE_NAME);
        return Ok(LuaValue::Nil);
    };

    let erased: Rc<dyn Exposed> = object;
    let ud = lua.create_userdata(Instance {
        tag,
        object: RefCell::new(Some(erased.clone())),
        wrapper_slot: Cell::new(None),
    })?;
    let weak = WeakScriptRef::new(lua, LuaValue::UserData(ud.clone()))?;
    ud.borrow::<Instance>()?.wrapper_slot.set(weak.slot());
    erased.back_ref().set(weak);
    Ok(LuaValue::UserData(ud))
}

/// Why a value could not be read as a particular class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CastError {
    /// Not a class wrapper at all.
    NotObject,
    /// The wrapper was detached from its native object.
    Detached,
    /// The target class is unknown to this VM.
    Unregistered(&'static str),
    /// Neither the object's class nor any of its bases is the target.
    WrongClass { from: &'static str, to: &'static str },
}

impl fmt::Display for CastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CastError::NotObject => write!(f, "value is not a class object"),
            CastError::Detached => write!(f, "object was detached from its native instance"),
            CastError::Unregistered(name) => write!(f, "class \"{}\" is not registered", name),
            CastError::WrongClass { from, to } => write!(f, "cannot cast {} to {}", from, to),
        }
    }
}

/// Reads `value` as an object of class `T`, walking base classes when the
/// object's own class differs.
pub(crate) fn cast<T: ScriptClass>(lua: &Lua, value: &LuaValue) -> Result<Rc<T>, CastError> {
    let LuaValue::UserData(ud) = value else {
        return Err(CastError::NotObject);
    };
    let (tag, object) = match ud.borrow::<Instance>() {
        Ok(inst) => (inst.tag, inst.object()),
        Err(_) => return Err(CastError::NotObject),
    };
    let Some(object) = object else {
        return Err(CastError::Detached);
    };

    let (target, from) = {
        let state = bridge_state(lua).map_err(|_| CastError::Unregistered(T::TYPE_NAME))?;
        let registry = state.classes.borrow();
        let target = registry
            .tag_of(T::TYPE_NAME)
            .ok_or(CastError::Unregistered(T::TYPE_NAME))?;
        let from = registry.by_tag(tag).map(|c| c.name).unwrap_or("userdata");
        (target, from)
    };
    let wrong = CastError::WrongClass { from, to: T::TYPE_NAME };

    if tag == target {
        return downcast_rc::<T>(object).ok_or(wrong);
    }

    let mut current = object;
    let mut table = class_table_by_tag(lua, tag).ok().flatten();
    while let Some(class) = table {
        let base: Option<LuaTable> = class.raw_get("__base").ok().flatten();
        let Some(base) = base else { break };
        let Some(base_object) = current.clone().base_object() else {
            warn!(
                "Class \"{}\" declares a base class but provides no base object",
                class.raw_get::<String>("__name").unwrap_or_default()
            );
            break;
        };
        let base_tag: u32 = base.raw_get("__tag").unwrap_or(0);
        if base_tag == target.0 {
            return downcast_rc::<T>(base_object).ok_or(wrong);
        }
        current = base_object;
        table = Some(base);
    }
    Err(wrong)
}

pub(crate) fn downcast<T: ScriptClass>(lua: &Lua, ud: &LuaAnyUserData) -> Option<Rc<T>> {
    cast::<T>(lua, &LuaValue::UserData(ud.clone())).ok()
}

/// Cuts the link between `object` and its wrapper. The userdata stays valid
/// for scripts but references nothing; calling methods on it logs and returns
/// nothing. Returns false when the object had no live wrapper.
pub fn detach<T: ScriptClass>(lua: &Lua, object: &Rc<T>) -> LuaResult<bool> {
    let Some(ud) = object.back_ref().wrapper(lua)? else {
        return Ok(false);
    };
    let taken = ud.borrow::<Instance>()?.object.borrow_mut().take();
    object.back_ref().clear();
    Ok(taken.is_some())
}

/// True when `value` is a wrapper, detached or not.
pub fn is_object(value: &LuaValue) -> bool {
    matches!(value, LuaValue::UserData(ud) if ud.is::<Instance>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::lua_runtime::ScriptVm;
    use crate::resources::lua_runtime::object::BackRef;

    struct Counter {
        back_ref: BackRef,
        value: Cell<i32>,
    }

    impl Exposed for Counter {
        fn back_ref(&self) -> &BackRef {
            &self.back_ref
        }
    }

    impl ScriptClass for Counter {
        const TYPE_NAME: &'static str = "Counter";
    }

    struct Orphan {
        back_ref: BackRef,
    }

    impl Exposed for Orphan {
        fn back_ref(&self) -> &BackRef {
            &self.back_ref
        }
    }

    impl ScriptClass for Orphan {
        const TYPE_NAME: &'static str = "Orphan";
        const BASE_TYPE_NAME: Option<&'static str> = Some("Counter");
    }

    fn counter(value: i32) -> Counter {
        Counter {
            back_ref: BackRef::new(),
            value: Cell::new(value),
        }
    }

    #[test]
    fn tags_follow_registration_order() {
        let vm = ScriptVm::new().unwrap();
        let tag = register::<Counter>(vm.lua()).unwrap().tag();
        assert_eq!(tag.get(), 1);
        let again = register::<Counter>(vm.lua()).unwrap().tag();
        assert_eq!(again, tag);
        assert_eq!(vm.classes().len(), 1);
    }

    #[test]
    fn constructor_and_methods_work_from_script() {
        let vm = ScriptVm::new().unwrap();
        register::<Counter>(vm.lua())
            .unwrap()
            .constructor(|start: i32| counter(start))
            .unwrap()
            .method("add", |this: &Counter, n: i32| {
                this.value.set(this.value.get() + n);
                this.value.get()
            })
            .unwrap();

        let v: i32 = vm
            .lua()
            .load("local c = Counter(10); c:add(5); return c:add(1)")
            .eval()
            .unwrap();
        assert_eq!(v, 16);
    }

    #[test]
    fn class_tables_are_published_once() {
        let vm = ScriptVm::new().unwrap();
        let table = register::<Counter>(vm.lua()).unwrap().finish();
        vm.do_string("Counter.extra = 1", "publish").unwrap();
        let again = register::<Counter>(vm.lua()).unwrap().finish();
        assert_eq!(table, again);

        let (same, extra): (bool, i32) = vm
            .lua()
            .load("return rawequal(Counter, ...), Counter.extra")
            .call(table)
            .unwrap();
        assert!(same);
        assert_eq!(extra, 1);
    }

    #[test]
    fn missing_base_registers_as_root_class() {
        let vm = ScriptVm::new().unwrap();
        register::<Orphan>(vm.lua())
            .unwrap()
            .constructor(|| Orphan { back_ref: BackRef::new() })
            .unwrap()
            .method("ping", |_: &Orphan| 1i32)
            .unwrap();
        assert_eq!(vm.classes().get("Orphan").unwrap().base, None);

        let (ping, base): (i32, LuaValue) = vm
            .lua()
            .load("local o = Orphan() return o:ping(), rawget(Orphan, '__base')")
            .eval()
            .unwrap();
        assert_eq!(ping, 1);
        assert!(base.is_nil());
    }

    #[test]
    fn bookkeeping_keys_are_hidden_from_instances() {
        let vm = ScriptVm::new().unwrap();
        register::<Counter>(vm.lua()).unwrap();
        vm.lua()
            .globals()
            .set("obj", vm.push(Rc::new(counter(0))).unwrap())
            .unwrap();
        let hidden: bool = vm
            .lua()
            .load("return obj.__name == nil and obj.__tag == nil and obj.__base == nil")
            .eval()
            .unwrap();
        assert!(hidden);
        assert_eq!(vm.lua().load("return Counter.__name").eval::<String>().unwrap(), "Counter");
    }

    #[test]
    fn instance_fields_shadow_class_members() {
        let vm = ScriptVm::new().unwrap();
        register::<Counter>(vm.lua())
            .unwrap()
            .field("kind", "counter")
            .unwrap();
        let obj = vm.push(Rc::new(counter(0))).unwrap();
        vm.lua().globals().set("obj", obj).unwrap();

        let (before, after): (String, String) = vm
            .lua()
            .load("local a = obj.kind; obj.kind = 'mine'; return a, obj.kind")
            .eval()
            .unwrap();
        assert_eq!(before, "counter");
        assert_eq!(after, "mine");
    }

    #[test]
    fn index_handler_runs_first() {
        let vm = ScriptVm::new().unwrap();
        register::<Counter>(vm.lua())
            .unwrap()
            .index_handler(|lua, this, key| match String::from_lua(key, lua).unwrap_or_default().as_str() {
                "value" => Ok(LuaValue::Integer(this.value.get() as mlua::Integer)),
                _ => Ok(LuaValue::Nil),
            })
            .unwrap();
        vm.lua()
            .globals()
            .set("obj", vm.push(Rc::new(counter(7))).unwrap())
            .unwrap();
        assert_eq!(vm.lua().load("return obj.value").eval::<i32>().unwrap(), 7);
        assert!(vm.lua().load("return obj.missing").eval::<LuaValue>().unwrap().is_nil());
    }

    #[test]
    fn detached_wrapper_fails_gracefully() {
        let vm = ScriptVm::new().unwrap();
        register::<Counter>(vm.lua())
            .unwrap()
            .method("get", |this: &Counter| this.value.get())
            .unwrap();
        let object = Rc::new(counter(3));
        vm.lua()
            .globals()
            .set("obj", vm.push(object.clone()).unwrap())
            .unwrap();
        assert!(detach(vm.lua(), &object).unwrap());
        assert!(!object.back_ref().is_linked());

        let count: i32 = vm.lua().load("return select('#', obj:get())").eval().unwrap();
        assert_eq!(count, 0);
        assert_eq!(Rc::strong_count(&object), 1);
    }

    #[test]
    fn unregistered_class_pushes_nil() {
        let vm = ScriptVm::new().unwrap();
        assert!(vm.push(Rc::new(counter(1))).unwrap().is_nil());
    }
}
