//! Lua stub generator for EmmyLua / lua-language-server.
//!
//! Reads the bound API and the class registry of a [`ScriptVm`] and emits a
//! deterministic stub file with `---@class`, `---@param`, and `---@return`
//! annotations. Parameter names are not known natively, so they are written
//! as `arg1`, `arg2`, ...

use crate::resources::lua_runtime::{ApiFunction, ClassInfo, MethodInfo, ScriptVm};
use std::collections::BTreeSet;
use std::fmt::{self, Write as FmtWrite};
use std::path::Path;

/// Maps a marshaller type name to the EmmyLua annotation type.
fn lua_type_annotation(script_type: &str) -> String {
    match script_type {
        "nil" => "nil".into(),
        "any" => "any".into(),
        s if s.ends_with('?') => format!("{}|nil", &s[..s.len() - 1]),
        other => other.into(),
    }
}

fn arg_names(count: usize) -> Vec<String> {
    (1..=count).map(|i| format!("arg{}", i)).collect()
}

/// Generate the stub file content for everything bound in `vm`.
pub fn generate_stubs(vm: &ScriptVm) -> Result<String, String> {
    let mut api = vm.api();
    api.sort_by(|a, b| a.table.cmp(b.table).then_with(|| a.name.cmp(&b.name)));
    let registry = vm.classes();
    let classes: Vec<&ClassInfo> = registry.iter().collect();

    let mut out = String::with_capacity(16 * 1024);
    render_stubs(&mut out, &api, &classes).map_err(|e| format!("Failed to render stubs: {e}"))?;
    Ok(out)
}

/// Write the generated stubs to a file.
pub fn write_stubs(path: &Path, content: &str) -> Result<(), String> {
    std::fs::write(path, content).map_err(|e| format!("Failed to write {}: {e}", path.display()))
}

fn render_stubs(out: &mut String, api: &[ApiFunction], classes: &[&ClassInfo]) -> fmt::Result {
    writeln!(out, "---@meta")?;
    writeln!(out)?;
    writeln!(out, "-- THIS FILE IS AUTO-GENERATED by `aberredscript --create-lua-stubs`.")?;
    writeln!(out, "-- DO NOT EDIT MANUALLY. Regenerate from the running bridge instead.")?;
    writeln!(out)?;

    render_tables(out, api)?;
    render_functions(out, api)?;
    for class in classes {
        render_class(out, class)?;
    }
    Ok(())
}

/// Declares every table functions live in, parents before children.
fn render_tables(out: &mut String, api: &[ApiFunction]) -> fmt::Result {
    let mut tables = BTreeSet::new();
    for f in api.iter().filter(|f| !f.table.is_empty()) {
        let mut prefix = String::new();
        for part in f.table.split('.') {
            if !prefix.is_empty() {
                prefix.push('.');
            }
            prefix.push_str(part);
            tables.insert(prefix.clone());
        }
    }
    for table in &tables {
        if !table.contains('.') {
            writeln!(out, "---@class {}", table)?;
        }
        writeln!(out, "{} = {{}}", table)?;
    }
    if !tables.is_empty() {
        writeln!(out)?;
    }
    Ok(())
}

fn render_functions(out: &mut String, api: &[ApiFunction]) -> fmt::Result {
    let mut current_table = None;
    for f in api {
        if current_table != Some(f.table) {
            current_table = Some(f.table);
            let title = if f.table.is_empty() { "Globals" } else { f.table };
            writeln!(out, "-- ==================== {} ====================", title)?;
            writeln!(out)?;
        }
        write_description(out, f.doc)?;
        let names = arg_names(f.params.len());
        for (name, ty) in names.iter().zip(&f.params) {
            writeln!(out, "---@param {} {}", name, lua_type_annotation(ty))?;
        }
        if let Some(ret) = f.returns {
            writeln!(out, "---@return {}", lua_type_annotation(ret))?;
        }
        writeln!(out, "function {}({}) end", f.path(), names.join(", "))?;
        writeln!(out)?;
    }
    Ok(())
}

/// Writes a description as doc-comment lines, handling multi-line descriptions.
fn write_description(out: &mut String, description: &str) -> fmt::Result {
    for line in description.lines() {
        writeln!(out, "---{}", line)?;
    }
    Ok(())
}

fn render_class(out: &mut String, class: &ClassInfo) -> fmt::Result {
    writeln!(out, "-- ==================== {} ====================", class.name)?;
    writeln!(out)?;
    match class.base {
        Some(base) => writeln!(out, "---@class {} : {}", class.name, base)?,
        None => writeln!(out, "---@class {}", class.name)?,
    }
    if let Some(params) = &class.constructor {
        let names = arg_names(params.len());
        let sig: Vec<String> = names
            .iter()
            .zip(params)
            .map(|(n, t)| format!("{}: {}", n, lua_type_annotation(t)))
            .collect();
        writeln!(out, "---@overload fun({}): {}", sig.join(", "), class.name)?;
    }
    writeln!(out, "{} = {{}}", class.name)?;
    writeln!(out)?;

    let mut methods: Vec<&MethodInfo> = class.methods.iter().collect();
    methods.sort_by(|a, b| a.name.cmp(&b.name));
    for m in methods {
        let names = arg_names(m.params.len());
        for (name, ty) in names.iter().zip(&m.params) {
            writeln!(out, "---@param {} {}", name, lua_type_annotation(ty))?;
        }
        if let Some(ret) = m.returns {
            writeln!(out, "---@return {}", lua_type_annotation(ret))?;
        }
        let sep = if m.is_static { '.' } else { ':' };
        writeln!(out, "function {}{}{}({}) end", class.name, sep, m.name, names.join(", "))?;
        writeln!(out)?;
    }
    Ok(())
}
