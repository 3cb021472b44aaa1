//! Lua VM lifecycle.
//!
//! [`ScriptVm`] owns one Lua state together with the bridge bookkeeping that
//! lives in its app data: the ref slots, the class registry, the file system
//! scripts are read from and the stack of files currently executing.

use std::cell::{Ref, RefCell};
use std::rc::Rc;

use log::{error, info};
use mlua::prelude::*;

use super::bindings::{self, ApiFunction};
use super::class::{self, ClassBuilder, ClassRegistry};
use super::dynamic::DynamicValue;
use super::function::ScriptFunction;
use super::loader;
use super::marshal::{FromScript, IntoArgs, IntoScript, value_to_variant, variant_to_value};
use super::object::ScriptClass;
use super::refs::{RefSlots, VmId};
use super::table::DynamicTable;
use super::trace::{self, protected_call};
use crate::bridge::{ScriptEngine, Variant};
use crate::error::BridgeError;
use crate::resources::files::{DiskFiles, FileSystem, normalize_path};
use crate::resources::scriptconfig::ScriptConfig;

const SETMETATABLE: &str = "aberred.setmetatable";

/// Bridge state shared by every native callback of one VM.
pub(crate) struct BridgeState {
    pub(crate) vm: VmId,
    pub(crate) slots: Rc<RefSlots>,
    pub(crate) classes: Rc<RefCell<ClassRegistry>>,
    pub(crate) files: Rc<dyn FileSystem>,
    pub(crate) scripts_root: String,
    pub(crate) trace_depth: usize,
    pub(crate) strict_arity: bool,
    /// Files being executed, innermost last.
    pub(crate) sources: RefCell<Vec<String>>,
    /// Functions of the `luna` table, for stub generation.
    pub(crate) api: RefCell<Vec<ApiFunction>>,
}

pub(crate) fn bridge_state(lua: &Lua) -> LuaResult<mlua::AppDataRef<'_, BridgeState>> {
    lua.app_data_ref::<BridgeState>()
        .ok_or_else(|| LuaError::runtime("scripting bridge is not initialized for this VM"))
}

/// Sets or clears the metatable of `table` through the stock `setmetatable`.
pub(crate) fn set_metatable(lua: &Lua, table: &LuaTable, meta: Option<LuaTable>) -> LuaResult<()> {
    let setmetatable: LuaFunction = lua.named_registry_value(SETMETATABLE)?;
    setmetatable.call::<LuaValue>((table.clone(), meta))?;
    Ok(())
}

/// Runs `f` with `path` on top of the executing-file stack.
pub(crate) fn with_source<R>(lua: &Lua, path: &str, f: impl FnOnce() -> R) -> LuaResult<R> {
    bridge_state(lua)?.sources.borrow_mut().push(path.to_string());
    let result = f();
    if let Ok(state) = bridge_state(lua) {
        state.sources.borrow_mut().pop();
    }
    Ok(result)
}

/// One Lua VM with the scripting bridge installed.
///
/// Not `Send`: keep it as a non-send resource or on the thread that created it.
pub struct ScriptVm {
    lua: Lua,
    id: VmId,
    slots: Rc<RefSlots>,
    classes: Rc<RefCell<ClassRegistry>>,
    files: Rc<dyn FileSystem>,
}

impl ScriptVm {
    /// Creates a VM with default settings reading scripts from the working
    /// directory.
    ///
    /// # Errors
    ///
    /// Returns an error if Lua initialization or API registration fails.
    pub fn new() -> Result<Self, BridgeError> {
        Self::with_config(&ScriptConfig::new())
    }

    /// Creates a VM configured by `config`, reading scripts from disk.
    pub fn with_config(config: &ScriptConfig) -> Result<Self, BridgeError> {
        Self::with_files(config, Rc::new(DiskFiles::cwd()))
    }

    /// Creates a VM that reads every script and data file through `files`.
    ///
    /// # Errors
    ///
    /// Returns an error if Lua initialization or API registration fails.
    pub fn with_files(config: &ScriptConfig, files: Rc<dyn FileSystem>) -> Result<Self, BridgeError> {
        // SAFETY: the debug library is only reachable from native code. Its
        // `getinfo` is stashed in the registry and the global is removed
        // before any script runs.
        let lua = unsafe { Lua::unsafe_new_with(LuaStdLib::ALL_SAFE | LuaStdLib::DEBUG, LuaOptions::default()) };

        let id = VmId::next();
        let setmetatable: LuaFunction = lua.globals().get("setmetatable")?;
        lua.set_named_registry_value(SETMETATABLE, setmetatable)?;
        let slots = RefSlots::install(&lua, id)?;
        let classes = Rc::new(RefCell::new(ClassRegistry::default()));
        let scripts_root = normalize_path(&config.scripts_root);

        lua.set_app_data(BridgeState {
            vm: id,
            slots: slots.clone(),
            classes: classes.clone(),
            files: files.clone(),
            scripts_root: scripts_root.clone(),
            trace_depth: config.trace_depth,
            strict_arity: config.strict_arity,
            sources: RefCell::new(Vec::new()),
            api: RefCell::new(Vec::new()),
        });

        trace::install(&lua)?;
        loader::install(&lua)?;
        bindings::register(&lua)?;
        lua.globals().set("debug", LuaValue::Nil)?;

        info!("Lua VM {} ready, scripts root \"{}\"", id, scripts_root);
        Ok(Self {
            lua,
            id,
            slots,
            classes,
            files,
        })
    }

    /// Returns a reference to the underlying Lua state.
    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    pub fn id(&self) -> VmId {
        self.id
    }

    pub fn slots(&self) -> &RefSlots {
        &self.slots
    }

    /// Registered classes, in registration order.
    pub fn classes(&self) -> Ref<'_, ClassRegistry> {
        self.classes.borrow()
    }

    pub fn files(&self) -> Rc<dyn FileSystem> {
        self.files.clone()
    }

    /// Functions of the `luna` table with their signatures.
    pub fn api(&self) -> Vec<ApiFunction> {
        bridge_state(&self.lua)
            .map(|s| s.api.borrow().clone())
            .unwrap_or_default()
    }

    /// Registers `T` as a script class and returns a builder for its members.
    pub fn register_class<T: ScriptClass>(&self) -> Result<ClassBuilder<'_, T>, BridgeError> {
        Ok(class::register::<T>(&self.lua)?)
    }

    /// Unlinks `object` from its script wrapper.
    pub fn detach<T: ScriptClass>(&self, object: &Rc<T>) -> Result<bool, BridgeError> {
        Ok(class::detach(&self.lua, object)?)
    }

    /// Converts a native value into a Lua value of this VM.
    pub fn push<T: IntoScript>(&self, value: T) -> Result<LuaValue, BridgeError> {
        self.slots.flush(&self.lua)?;
        Ok(value.into_script(&self.lua)?)
    }

    /// Reads a Lua value as `T`, falling back to `T::default()`.
    pub fn get<T: FromScript + Default>(&self, value: LuaValue) -> T {
        T::get(&self.lua, value).unwrap_or_default()
    }

    pub fn set_global<T: IntoScript>(&self, name: &str, value: T) -> Result<(), BridgeError> {
        let value = self.push(value)?;
        self.lua.globals().set(name, value)?;
        Ok(())
    }

    /// Global `name` read as `T`; missing or mismatched globals read as the default.
    pub fn global<T: FromScript + Default>(&self, name: &str) -> T {
        match self.lua.globals().raw_get::<LuaValue>(name) {
            Ok(value) => self.get(value),
            Err(_) => T::default(),
        }
    }

    /// The table of globals.
    pub fn globals(&self) -> Result<DynamicTable, BridgeError> {
        Ok(DynamicTable::from_table(&self.lua, self.lua.globals())?)
    }

    /// Compiles and runs source text under the error handler.
    ///
    /// # Errors
    ///
    /// Syntax errors come back as [`BridgeError::Lua`], runtime errors as
    /// [`BridgeError::Script`].
    pub fn do_string(&self, source: &str, chunk_name: &str) -> Result<(), BridgeError> {
        self.slots.flush(&self.lua)?;
        let chunk = self
            .lua
            .load(source)
            .set_name(format!("={chunk_name}"))
            .into_function()
            .inspect_err(|e| error!(target: "lua", "{}", e))?;
        protected_call(&self.lua, &chunk, LuaMultiValue::new())?;
        Ok(())
    }

    /// Compiles a script file without running it.
    pub fn load_file(&self, path: &str) -> Result<ScriptFunction, BridgeError> {
        let chunk = self.compile_file(path)?;
        Ok(ScriptFunction::new(&self.lua, chunk)?)
    }

    /// Loads and runs a script file under the error handler.
    ///
    /// # Arguments
    ///
    /// * `path` - Path of the script, as understood by the VM's file system
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or the script has
    /// syntax/runtime errors.
    pub fn do_file(&self, path: &str) -> Result<(), BridgeError> {
        self.slots.flush(&self.lua)?;
        let path = normalize_path(path);
        let chunk = self.compile_file(&path)?;
        with_source(&self.lua, &path, || protected_call(&self.lua, &chunk, LuaMultiValue::new()))??;
        Ok(())
    }

    fn compile_file(&self, path: &str) -> Result<LuaFunction, BridgeError> {
        let path = normalize_path(path);
        let source = self.files.read_file(&path).map_err(|e| {
            error!("Failed to read script \"{}\": {}", path, e);
            BridgeError::io(&path, e)
        })?;
        let chunk = self
            .lua
            .load(source)
            .set_name(format!("@{path}"))
            .into_function()
            .inspect_err(|e| error!(target: "lua", "{}", e))?;
        Ok(chunk)
    }

    /// Runs the configured entry script.
    pub fn run_main(&self, config: &ScriptConfig) -> Result<(), BridgeError> {
        let path = config.main_path();
        info!("Running main script \"{}\"", path);
        self.do_file(&path)
    }

    /// Loads module `name` the way a top-level `require` would and returns
    /// its value. Modules already loaded come from the cache.
    ///
    /// # Errors
    ///
    /// [`BridgeError::ModuleNotFound`] when no candidate file exists, a
    /// script error when the module raises while loading.
    pub fn require(&self, name: &str) -> Result<DynamicValue, BridgeError> {
        self.slots.flush(&self.lua)?;
        let root = bridge_state(&self.lua)?.scripts_root.clone();
        let exists = loader::candidates(name, None, &root)
            .iter()
            .any(|path| self.files.is_file(path));
        if !exists {
            error!(target: "lua", "module '{}' not found under \"{}\"", name, root);
            return Err(BridgeError::ModuleNotFound(name.to_string()));
        }
        let require: LuaFunction = self.lua.globals().get("require")?;
        let args = LuaMultiValue::from_vec(vec![LuaValue::String(self.lua.create_string(name)?)]);
        let first = protected_call(&self.lua, &require, args)?
            .into_iter()
            .next()
            .unwrap_or(LuaValue::Nil);
        Ok(DynamicValue::new(&self.lua, first)?)
    }

    /// Class table of a registered class.
    pub fn class_table(&self, name: &str) -> Result<DynamicTable, BridgeError> {
        match class::class_table(&self.lua, name)? {
            Some(table) => Ok(DynamicTable::from_table(&self.lua, table)?),
            None => Err(BridgeError::UnknownClass(name.to_string())),
        }
    }

    /// Calls a global function by name under the error handler and reads its
    /// first result as `R`.
    ///
    /// # Errors
    ///
    /// Returns an error if the function doesn't exist or execution fails.
    pub fn call_function<R: FromScript + Default>(&self, name: &str, args: impl IntoArgs) -> Result<R, BridgeError> {
        let results = self.call_multi(name, args)?;
        let first = results.into_iter().next().unwrap_or(LuaValue::Nil);
        Ok(self.get(first))
    }

    /// Like [`call_function`](Self::call_function) but keeps every result.
    pub fn call_multi(&self, name: &str, args: impl IntoArgs) -> Result<LuaMultiValue, BridgeError> {
        self.slots.flush(&self.lua)?;
        let func = match self.lua.globals().get::<LuaValue>(name)? {
            LuaValue::Function(f) => f,
            _ => {
                error!(target: "lua", "Global function \"{}\" does not exist", name);
                return Err(BridgeError::Script {
                    message: format!("attempt to call global '{}' (not a function)", name),
                    traceback: Vec::new(),
                });
            }
        };
        let args = args.into_args(&self.lua)?;
        protected_call(&self.lua, &func, args)
    }

    /// Checks if a global function exists.
    pub fn has_function(&self, name: &str) -> bool {
        matches!(self.lua.globals().get::<LuaValue>(name), Ok(LuaValue::Function(_)))
    }

    /// Clears released ref slots without running the collector.
    pub fn flush_released(&self) -> Result<(), BridgeError> {
        Ok(self.slots.flush(&self.lua)?)
    }

    /// Full collection cycle, then slot cleanup.
    pub fn collect_garbage(&self) -> Result<(), BridgeError> {
        self.lua.gc_collect()?;
        self.lua.gc_collect()?;
        self.slots.flush(&self.lua)?;
        Ok(())
    }

    /// Bytes currently allocated by the VM.
    pub fn used_memory(&self) -> usize {
        self.lua.used_memory()
    }

    /// Shuts the VM down. Native objects still referenced only by scripts are
    /// released; wrappers of objects that outlive the VM are unlinked.
    pub fn close(self) {
        info!("Closing Lua VM {}", self.id);
        if let Err(e) = self.slots.flush(&self.lua) {
            error!("Failed to release reference slots of {}: {}", self.id, e);
        }
        drop(self.lua);
    }
}

impl ScriptEngine for ScriptVm {
    fn engine_name(&self) -> &'static str {
        "lua"
    }

    fn run_file(&self, path: &str) -> Result<(), BridgeError> {
        self.do_file(path)
    }

    fn run_string(&self, source: &str, chunk_name: &str) -> Result<(), BridgeError> {
        self.do_string(source, chunk_name)
    }

    fn has_function(&self, name: &str) -> bool {
        ScriptVm::has_function(self, name)
    }

    fn call(&self, name: &str, args: &[Variant]) -> Result<Variant, BridgeError> {
        let results = self.call_multi(name, args)?;
        Ok(match results.into_iter().next() {
            Some(value) => value_to_variant(&self.lua, &value, 0),
            None => Variant::Nil,
        })
    }

    fn set_global(&self, name: &str, value: &Variant) -> Result<(), BridgeError> {
        let value = variant_to_value(&self.lua, value)?;
        self.lua.globals().set(name, value)?;
        Ok(())
    }

    fn get_global(&self, name: &str) -> Result<Variant, BridgeError> {
        let value: LuaValue = self.lua.globals().get(name)?;
        Ok(value_to_variant(&self.lua, &value, 0))
    }

    fn collect_garbage(&self) -> Result<(), BridgeError> {
        ScriptVm::collect_garbage(self)
    }
}
