//! The `luna` table and global helpers available to every script.
//!
//! ```lua
//! luna.log("plain message")            -- same as luna.log.info
//! luna.log.warning("careful")
//! luna.log.table({ a = 1, b = { 2, 3 } })
//!
//! local cfg = luna.read_json("assets/data/level1.json")
//! if luna.files.is_file("assets/scripts/extra.lua") then require("extra") end
//!
//! local Enemy = class()
//! function Enemy:onInit(hp) self.hp = hp end
//! local Boss = class(Enemy)
//! function Boss:onInit(hp) Boss.base.onInit(self, hp * 10) end
//! local b = Boss(5)                     -- b.hp == 50
//! ```
//!
//! Every function registered here is also recorded as an [`ApiFunction`] so
//! the stub generator can describe it.

use std::rc::Rc;

use log::{debug, error, info, warn};
use mlua::prelude::*;
use rustc_hash::FxHashSet;

use super::marshal::{format_number, lua_string, Stack};
use super::proxy::{Arity, FunctionBinding};
use super::runtime::{bridge_state, set_metatable};
use crate::bridge::Variant;
use crate::resources::files::{
    basename, extension, join_path, normalize_path, parent_path, replace_extension, FileSystem,
};

/// Nesting below which `luna.log.table` stops descending.
const MAX_DUMP_DEPTH: usize = 16;

/// A function of the script API, as shown by tooling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiFunction {
    /// Dotted path of the owning table; empty for globals.
    pub table: &'static str,
    pub name: String,
    pub params: Vec<&'static str>,
    pub returns: Option<&'static str>,
    pub doc: &'static str,
}

impl ApiFunction {
    /// `luna.log.info` style full name.
    pub fn path(&self) -> String {
        if self.table.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.table, self.name)
        }
    }
}

// Lua-side class helper. `class(base)` returns a callable class table; calling
// it creates an instance and runs `onInit` with the call arguments.
const CLASS_HELPER_SRC: &str = r#"
local setmetatable = setmetatable
return function(base)
    local cls = {}
    cls.__index = cls
    cls.base = base
    local meta = {
        __index = base,
        __call = function(c, ...)
            local obj = setmetatable({}, c)
            if obj.onInit then obj:onInit(...) end
            return obj
        end,
    }
    setmetatable(cls, meta)
    return cls
end
"#;

fn expose(lua: &Lua, table: &LuaTable, path: &'static str, binding: FunctionBinding, doc: &'static str) -> LuaResult<()> {
    let name = binding.name.clone();
    bridge_state(lua)?.api.borrow_mut().push(ApiFunction {
        table: path,
        name: name.clone(),
        params: binding.params.clone(),
        returns: binding.returns,
        doc,
    });
    table.raw_set(name, binding.into_function())
}

fn expose_raw(
    lua: &Lua,
    table: &LuaTable,
    path: &'static str,
    name: &str,
    signature: (Vec<&'static str>, Option<&'static str>),
    doc: &'static str,
    f: impl Fn(&Lua, Stack) -> LuaResult<LuaMultiValue> + 'static,
) -> LuaResult<()> {
    let mut binding = FunctionBinding::raw(lua, name, f)?;
    binding.params = signature.0;
    binding.returns = signature.1;
    expose(lua, table, path, binding, doc)
}

/// Installs `luna` and `class` into the globals.
pub(crate) fn register(lua: &Lua) -> LuaResult<()> {
    let files = bridge_state(lua)?.files.clone();
    let luna = lua.create_table()?;

    luna.raw_set("log", register_log(lua)?)?;
    luna.raw_set("files", register_files(lua, files.clone())?)?;

    let reader = files.clone();
    expose(
        lua,
        &luna,
        "luna",
        FunctionBinding::function(lua, "read_json", move |path: String| read_json(&*reader, &path), Arity::Lenient)?,
        "Parses a JSON file into a table. Returns nil when the file cannot be read or parsed.",
    )?;
    luna.raw_set("platform", std::env::consts::OS)?;
    luna.raw_set("version", env!("CARGO_PKG_VERSION"))?;
    lua.globals().set("luna", luna)?;

    let class_helper: LuaFunction = lua.load(CLASS_HELPER_SRC).set_name("=class").eval()?;
    lua.globals().set("class", class_helper)?;
    bridge_state(lua)?.api.borrow_mut().push(ApiFunction {
        table: "",
        name: "class".to_string(),
        params: vec!["table?"],
        returns: Some("table"),
        doc: "Creates a class table, optionally deriving from `base`. Calling it constructs an instance and runs `onInit`.",
    });
    Ok(())
}

fn register_log(lua: &Lua) -> LuaResult<LuaTable> {
    let log = lua.create_table()?;
    let path = "luna.log";

    expose(
        lua,
        &log,
        path,
        FunctionBinding::function(lua, "info", |msg: String| info!(target: "lua", "{}", msg), Arity::Lenient)?,
        "Info level logging.",
    )?;
    expose(
        lua,
        &log,
        path,
        FunctionBinding::function(lua, "warning", |msg: String| warn!(target: "lua", "{}", msg), Arity::Lenient)?,
        "Warning level logging.",
    )?;
    expose(
        lua,
        &log,
        path,
        FunctionBinding::function(lua, "error", |msg: String| error!(target: "lua", "{}", msg), Arity::Lenient)?,
        "Error level logging.",
    )?;
    expose(
        lua,
        &log,
        path,
        FunctionBinding::function(lua, "debug", |msg: String| debug!(target: "lua", "{}", msg), Arity::Lenient)?,
        "Debug level logging.",
    )?;
    expose_raw(
        lua,
        &log,
        path,
        "table",
        (vec!["table"], None),
        "Logs the contents of a table, nested tables included.",
        |_, stack| {
            match stack.value(1) {
                LuaValue::Table(t) => {
                    for line in dump_table(&t) {
                        info!(target: "lua", "{}", line);
                    }
                }
                other => info!(target: "lua", "{}", format_value(&other)),
            }
            Ok(LuaMultiValue::new())
        },
    )?;

    // `luna.log(msg)` is `luna.log.info(msg)`
    let call = lua.create_function(|_, (_, msg): (LuaValue, LuaValue)| {
        info!(target: "lua", "{}", display_message(&msg));
        Ok(())
    })?;
    let meta = lua.create_table()?;
    meta.raw_set("__call", call)?;
    set_metatable(lua, &log, Some(meta))?;
    Ok(log)
}

fn register_files(lua: &Lua, files: Rc<dyn FileSystem>) -> LuaResult<LuaTable> {
    let table = lua.create_table()?;
    let path = "luna.files";

    let fs = files.clone();
    expose(
        lua,
        &table,
        path,
        FunctionBinding::function(lua, "is_file", move |p: String| fs.is_file(&p), Arity::Lenient)?,
        "True when the path names a regular file.",
    )?;
    let fs = files.clone();
    expose(
        lua,
        &table,
        path,
        FunctionBinding::function(lua, "exists", move |p: String| fs.exists(&p), Arity::Lenient)?,
        "True when the path exists.",
    )?;
    let fs = files;
    expose(
        lua,
        &table,
        path,
        FunctionBinding::function(
            lua,
            "read",
            move |p: String| match fs.read_file_to_string(&p) {
                Ok(text) => Some(text),
                Err(e) => {
                    error!(target: "lua", "Failed to read \"{}\": {}", p, e);
                    None
                }
            },
            Arity::Lenient,
        )?,
        "Whole file as a string, or nil when it cannot be read.",
    )?;
    expose(
        lua,
        &table,
        path,
        FunctionBinding::function(lua, "parent_path", |p: String| parent_path(&p), Arity::Lenient)?,
        "Directory part of a path.",
    )?;
    expose(
        lua,
        &table,
        path,
        FunctionBinding::function(lua, "extension", |p: String| extension(&p), Arity::Lenient)?,
        "Extension without the dot.",
    )?;
    expose(
        lua,
        &table,
        path,
        FunctionBinding::function(lua, "basename", |p: String| basename(&p), Arity::Lenient)?,
        "File name without directories and extension.",
    )?;
    expose(
        lua,
        &table,
        path,
        FunctionBinding::function(
            lua,
            "replace_extension",
            |p: String, ext: String| replace_extension(&p, &ext),
            Arity::Lenient,
        )?,
        "Swaps the extension of a path.",
    )?;
    expose(
        lua,
        &table,
        path,
        FunctionBinding::function(lua, "join", |dir: String, name: String| join_path(&dir, &name), Arity::Lenient)?,
        "Joins two path fragments.",
    )?;
    expose(
        lua,
        &table,
        path,
        FunctionBinding::function(lua, "normalize", |p: String| normalize_path(&p), Arity::Lenient)?,
        "Collapses `.` and `..` segments.",
    )?;
    Ok(table)
}

fn read_json(files: &dyn FileSystem, path: &str) -> Option<Variant> {
    let text = match files.read_file_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            error!(target: "lua", "Failed to read \"{}\": {}", path, e);
            return None;
        }
    };
    match serde_json::from_str::<Variant>(&text) {
        Ok(value) => Some(value),
        Err(e) => {
            error!(target: "lua", "Failed to parse JSON \"{}\": {}", path, e);
            None
        }
    }
}

fn display_message(value: &LuaValue) -> String {
    match value {
        LuaValue::String(s) => lua_string(s),
        other => format_value(other),
    }
}

fn format_value(value: &LuaValue) -> String {
    match value {
        LuaValue::Nil => "nil".to_string(),
        LuaValue::Boolean(b) => b.to_string(),
        LuaValue::Integer(i) => i.to_string(),
        LuaValue::Number(n) => format_number(*n),
        LuaValue::String(s) => format!("\"{}\"", lua_string(s)),
        other => format!("{}: {:p}", other.type_name(), other.to_pointer()),
    }
}

fn format_key(key: &LuaValue) -> String {
    match key {
        LuaValue::String(s) => lua_string(s),
        other => format!("[{}]", format_value(other)),
    }
}

/// Lines of a readable, indented dump of `table`. Entries are sorted by key
/// and repeated tables are printed once.
pub(crate) fn dump_table(table: &LuaTable) -> Vec<String> {
    let mut lines = vec!["{".to_string()];
    let mut seen = FxHashSet::default();
    seen.insert(table.to_pointer() as usize);
    dump_entries(table, 1, &mut seen, &mut lines);
    lines.push("}".to_string());
    lines
}

fn dump_entries(table: &LuaTable, depth: usize, seen: &mut FxHashSet<usize>, lines: &mut Vec<String>) {
    let indent = "    ".repeat(depth);
    let mut entries: Vec<(String, LuaValue)> = table
        .pairs::<LuaValue, LuaValue>()
        .filter_map(Result::ok)
        .map(|(k, v)| (format_key(&k), v))
        .collect();
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    for (key, value) in entries {
        match value {
            LuaValue::Table(inner) => {
                let id = inner.to_pointer() as usize;
                if depth >= MAX_DUMP_DEPTH {
                    lines.push(format!("{}{} = {{ ... }},", indent, key));
                } else if !seen.insert(id) {
                    lines.push(format!("{}{} = <cycle>,", indent, key));
                } else {
                    lines.push(format!("{}{} = {{", indent, key));
                    dump_entries(&inner, depth + 1, seen, lines);
                    lines.push(format!("{}}},", indent));
                }
            }
            other => lines.push(format!("{}{} = {},", indent, key, format_value(&other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::files::MemoryFiles;
    use crate::resources::lua_runtime::ScriptVm;
    use crate::resources::scriptconfig::ScriptConfig;

    fn vm_with(files: MemoryFiles) -> ScriptVm {
        ScriptVm::with_files(&ScriptConfig::new(), Rc::new(files)).unwrap()
    }

    #[test]
    fn log_is_callable_and_has_levels() {
        let vm = ScriptVm::new().unwrap();
        vm.do_string(
            "luna.log('plain') luna.log.info('i') luna.log.warning('w') luna.log.error('e') luna.log.table({1, x = {2}})",
            "log",
        )
        .unwrap();
    }

    #[test]
    fn class_helper_runs_on_init_through_bases() {
        let vm = ScriptVm::new().unwrap();
        vm.do_string(
            r#"
            Enemy = class()
            function Enemy:onInit(hp) self.hp = hp end
            function Enemy:alive() return self.hp > 0 end
            Boss = class(Enemy)
            function Boss:onInit(hp) Boss.base.onInit(self, hp * 10) end
            boss = Boss(5)
            "#,
            "classes",
        )
        .unwrap();
        let hp: i32 = vm.lua().load("return boss.hp").eval().unwrap();
        assert_eq!(hp, 50);
        let alive: bool = vm.lua().load("return boss:alive()").eval().unwrap();
        assert!(alive);
    }

    #[test]
    fn read_json_builds_tables() {
        let vm = vm_with(MemoryFiles::new().with(
            "data/level.json",
            r#"{"name": "intro", "waves": [3, 5, 8], "boss": {"hp": 120}}"#,
        ));
        let (name, second, hp): (String, i32, i32) = vm
            .lua()
            .load("local t = luna.read_json('data/level.json') return t.name, t.waves[2], t.boss.hp")
            .eval()
            .unwrap();
        assert_eq!(name, "intro");
        assert_eq!(second, 5);
        assert_eq!(hp, 120);

        let missing: LuaValue = vm.lua().load("return luna.read_json('nope.json')").eval().unwrap();
        assert!(missing.is_nil());
    }

    #[test]
    fn file_helpers_are_exposed() {
        let vm = vm_with(MemoryFiles::new().with("a/b.txt", "hello"));
        let (exists, text, ext, joined): (bool, String, String, String) = vm
            .lua()
            .load("local f = luna.files return f.is_file('a/b.txt'), f.read('a/b.txt'), f.extension('x/y.lua'), f.join('a', 'c')")
            .eval()
            .unwrap();
        assert!(exists);
        assert_eq!(text, "hello");
        assert_eq!(ext, "lua");
        assert_eq!(joined, "a/c");
    }

    #[test]
    fn api_records_every_function() {
        let vm = ScriptVm::new().unwrap();
        let api = vm.api();
        let paths: Vec<String> = api.iter().map(ApiFunction::path).collect();
        assert!(paths.contains(&"luna.log.info".to_string()));
        assert!(paths.contains(&"luna.read_json".to_string()));
        assert!(paths.contains(&"class".to_string()));
        let replace = api.iter().find(|f| f.name == "replace_extension").unwrap();
        assert_eq!(replace.params, vec!["string", "string"]);
        assert_eq!(replace.returns, Some("string"));
    }

    #[test]
    fn dump_sorts_keys_and_marks_cycles() {
        let vm = ScriptVm::new().unwrap();
        let t: LuaTable = vm
            .lua()
            .load("local t = { b = 2, a = 'x' } t.self = t return t")
            .eval()
            .unwrap();
        let lines = dump_table(&t);
        assert_eq!(lines, vec!["{", "    a = \"x\",", "    b = 2,", "    self = <cycle>,", "}"]);
    }
}
