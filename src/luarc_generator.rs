//! Generator for `.luarc.json`, the Lua Language Server configuration.
//!
//! The generated config declares every global the bridge installs (API
//! tables, global functions, registered classes) and points the language
//! server at the generated stubs file.

use crate::resources::lua_runtime::ScriptVm;
use std::collections::BTreeSet;
use std::path::Path;

/// Names scripts see as globals: top-level API tables, global functions and
/// class tables.
pub fn script_globals(vm: &ScriptVm) -> Vec<String> {
    let mut globals = BTreeSet::new();
    for f in vm.api() {
        match f.table.split('.').next() {
            Some(root) if !root.is_empty() => globals.insert(root.to_string()),
            _ => globals.insert(f.name),
        };
    }
    for class in vm.classes().iter() {
        globals.insert(class.name.to_string());
    }
    globals.into_iter().collect()
}

/// Generate `.luarc.json` content for `vm`.
pub fn generate_luarc(vm: &ScriptVm, stubs_filename: &str) -> Result<String, String> {
    let content = serde_json::json!({
        "$schema": "https://raw.githubusercontent.com/LuaLS/vscode-lua/master/setting/schema.json",
        "runtime.version": "LuaJIT",
        "diagnostics.globals": script_globals(vm),
        "workspace.library": [stubs_filename],
        "completion.autoRequire": false
    });

    serde_json::to_string_pretty(&content).map_err(|e| format!("Failed to serialize .luarc.json: {e}"))
}

/// Write the generated `.luarc.json` content to a file.
pub fn write_luarc(path: &Path, content: &str) -> Result<(), String> {
    std::fs::write(path, content).map_err(|e| format!("Failed to write {}: {e}", path.display()))
}
