//! `require` resolution.
//!
//! The global `require` is replaced by a native one that reads through the
//! VM's [`FileSystem`](crate::resources::files::FileSystem). A module name is
//! resolved to a file first next to the requiring script, then under the
//! scripts root. Dots separate directories (`enemies.boss` is
//! `enemies/boss.lua`) unless the name already contains a `/`.
//!
//! Loaded modules are cached by resolved path only, so one file runs once even
//! when it is required under two different names, and the same name required
//! from two directories may resolve to two different files. Names with no
//! matching file fall back to `package.loaded` and `package.preload`.

use log::{error, info};
use mlua::prelude::*;

use super::runtime::{bridge_state, with_source};
use super::trace;
use crate::resources::files::{join_path, normalize_path, parent_path};

const MODULES: &str = "aberred.modules";
const LOADING: &str = "aberred.modules.loading";

/// Frames inspected when looking for the requiring script.
const MAX_CALLER_LEVELS: i64 = 12;

pub(crate) fn install(lua: &Lua) -> LuaResult<()> {
    lua.set_named_registry_value(MODULES, lua.create_table()?)?;
    lua.set_named_registry_value(LOADING, lua.create_table()?)?;
    lua.globals().raw_set("require", lua.create_function(require)?)
}

/// File name a module name maps to.
pub fn module_file(name: &str) -> String {
    if name.ends_with(".lua") {
        name.to_string()
    } else if name.contains('/') {
        format!("{name}.lua")
    } else {
        format!("{}.lua", name.replace('.', "/"))
    }
}

/// Candidate paths for `name`, in lookup order, without duplicates.
pub fn candidates(name: &str, requester_dir: Option<&str>, scripts_root: &str) -> Vec<String> {
    let file = module_file(name);
    let mut paths = Vec::with_capacity(2);
    if let Some(dir) = requester_dir {
        paths.push(normalize_path(&join_path(dir, &file)));
    }
    let global = normalize_path(&join_path(scripts_root, &file));
    if !paths.contains(&global) {
        paths.push(global);
    }
    paths
}

fn require(lua: &Lua, name: String) -> LuaResult<LuaValue> {
    let (files, root) = {
        let state = bridge_state(lua)?;
        (state.files.clone(), state.scripts_root.clone())
    };
    let dir = requester_dir(lua)?;
    let paths = candidates(&name, dir.as_deref(), &root);

    let Some(path) = paths.iter().find(|p| files.is_file(p)).cloned() else {
        return require_without_file(lua, &name, &paths);
    };

    let modules: LuaTable = lua.named_registry_value(MODULES)?;
    let cached: LuaValue = modules.raw_get(path.as_str())?;
    if !cached.is_nil() {
        return Ok(cached);
    }

    let loading: LuaTable = lua.named_registry_value(LOADING)?;
    if loading.raw_get::<bool>(path.as_str())? {
        return Err(LuaError::runtime(format!(
            "loop or previous error loading module '{}' ('{}')",
            name, path
        )));
    }

    let source = files
        .read_file(&path)
        .map_err(|e| LuaError::runtime(format!("error loading module '{}' from '{}': {}", name, path, e)))?;
    let chunk = lua.load(source).set_name(format!("@{path}")).into_function()?;

    info!("Loading module \"{}\"", path);
    loading.raw_set(path.as_str(), true)?;
    let result = with_source(lua, &path, || chunk.call::<LuaValue>((name.as_str(), path.as_str())));
    loading.raw_set(path.as_str(), LuaValue::Nil)?;
    let value = result??;

    let value = if value.is_nil() { LuaValue::Boolean(true) } else { value };
    modules.raw_set(path.as_str(), value.clone())?;
    let package: LuaTable = lua.globals().get("package")?;
    let loaded: LuaTable = package.get("loaded")?;
    loaded.raw_set(name.as_str(), value.clone())?;
    Ok(value)
}

/// Modules that are not files: libraries already in `package.loaded`, then
/// loaders registered in `package.preload`.
fn require_without_file(lua: &Lua, name: &str, paths: &[String]) -> LuaResult<LuaValue> {
    let package: LuaTable = lua.globals().get("package")?;
    let loaded: LuaTable = package.get("loaded")?;
    let value: LuaValue = loaded.raw_get(name)?;
    if !value.is_nil() {
        return Ok(value);
    }

    let preload: Option<LuaTable> = package.get("preload")?;
    if let Some(loader) = preload.map(|p| p.raw_get::<Option<LuaFunction>>(name)).transpose()?.flatten() {
        let value = loader.call::<LuaValue>(name)?;
        let value = if value.is_nil() { LuaValue::Boolean(true) } else { value };
        loaded.raw_set(name, value.clone())?;
        return Ok(value);
    }

    error!(target: "lua", "Module \"{}\" not found, tried: {}", name, paths.join(", "));
    let tried: String = paths.iter().map(|p| format!("\n\tno file '{}'", p)).collect();
    Err(LuaError::runtime(format!("module '{}' not found:{}", name, tried)))
}

/// Directory of the innermost Lua function loaded from a file, or of the
/// file currently being executed by the host.
fn requester_dir(lua: &Lua) -> LuaResult<Option<String>> {
    let getinfo = trace::getinfo(lua)?;
    for level in 1..=MAX_CALLER_LEVELS {
        let Some(info) = getinfo.call::<Option<LuaTable>>((level, "S"))? else {
            break;
        };
        let what: String = info.get::<Option<String>>("what")?.unwrap_or_default();
        if what == "C" || what == "tail" {
            continue;
        }
        let source: String = info.get::<Option<String>>("source")?.unwrap_or_default();
        if let Some(path) = source.strip_prefix('@') {
            return Ok(Some(parent_path(path)));
        }
        break;
    }
    Ok(bridge_state(lua)?
        .sources
        .borrow()
        .last()
        .map(|p| parent_path(p)))
}
