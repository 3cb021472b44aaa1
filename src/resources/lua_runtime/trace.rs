//! Protected calls and the error handler.
//!
//! Every native-to-script call goes through [`protected_call`], which runs the
//! function under `xpcall` with a native message handler. The handler logs the
//! error message followed by one `source:line: function` line per Lua frame
//! (frames without line information are skipped) and hands the report back to
//! the caller as [`BridgeError::Script`].

use log::error;
use mlua::prelude::*;

use super::runtime::bridge_state;
use crate::error::BridgeError;

const GETINFO: &str = "aberred.getinfo";
const PROTECTED_CALL: &str = "aberred.pcall";
const HANDLER: &str = "aberred.errhandler";

const TRACE_MARKER: &str = "\n--- stack trace ---\n";
const DEFAULT_TRACE_DEPTH: usize = 32;

// Lua 5.1 `xpcall` takes no arguments for the callee, so they travel in a
// closure.
const PROTECTED_CALL_SRC: &str = r#"
local xpcall, select, unpack = xpcall, select, unpack or table.unpack
return function(handler, fn, ...)
    local n = select('#', ...)
    local args = { ... }
    return xpcall(function() return fn(unpack(args, 1, n)) end, handler)
end
"#;

/// Stashes `debug.getinfo`, the call shim and the handler in the registry.
pub(crate) fn install(lua: &Lua) -> LuaResult<()> {
    let debug: LuaTable = lua.globals().get("debug")?;
    let getinfo: LuaFunction = debug.get("getinfo")?;
    lua.set_named_registry_value(GETINFO, getinfo)?;

    let shim: LuaFunction = lua
        .load(PROTECTED_CALL_SRC)
        .set_name("=protected_call")
        .eval()?;
    lua.set_named_registry_value(PROTECTED_CALL, shim)?;

    let handler = lua.create_function(|lua, message: LuaValue| handle_error(lua, message))?;
    lua.set_named_registry_value(HANDLER, handler)?;
    Ok(())
}

/// `debug.getinfo`, kept even though the `debug` global is removed.
pub(crate) fn getinfo(lua: &Lua) -> LuaResult<LuaFunction> {
    lua.named_registry_value(GETINFO)
}

/// Calls `func` under the error handler.
pub fn protected_call(lua: &Lua, func: &LuaFunction, args: LuaMultiValue) -> Result<LuaMultiValue, BridgeError> {
    let shim: LuaFunction = lua.named_registry_value(PROTECTED_CALL)?;
    let handler: LuaFunction = lua.named_registry_value(HANDLER)?;

    let mut call_args = Vec::with_capacity(args.len() + 2);
    call_args.push(LuaValue::Function(handler));
    call_args.push(LuaValue::Function(func.clone()));
    call_args.extend(args.into_vec());

    let mut results = shim.call::<LuaMultiValue>(LuaMultiValue::from_vec(call_args))?.into_vec();
    if matches!(results.first(), Some(LuaValue::Boolean(true))) {
        results.remove(0);
        return Ok(LuaMultiValue::from_vec(results));
    }
    let report = match results.get(1) {
        Some(LuaValue::String(s)) => s.to_string_lossy().to_string(),
        Some(other) => describe(lua, other),
        None => "unknown error".to_string(),
    };
    Err(parse_report(&report))
}

fn handle_error(lua: &Lua, message: LuaValue) -> LuaResult<String> {
    let message = describe(lua, &message);
    let depth = bridge_state(lua)
        .map(|s| s.trace_depth)
        .unwrap_or(DEFAULT_TRACE_DEPTH);
    let frames = capture_frames(lua, depth).unwrap_or_default();

    error!(target: "lua", "{}", message);
    error!(target: "lua", "Stack trace:");
    for frame in &frames {
        error!(target: "lua", "    {}", frame);
    }

    Ok(format_report(&message, &frames))
}

/// One line per Lua frame with a current line, innermost first.
pub(crate) fn capture_frames(lua: &Lua, depth: usize) -> LuaResult<Vec<String>> {
    let getinfo = getinfo(lua)?;
    let mut frames = Vec::new();
    // level 0 is getinfo itself
    for level in 1..=(depth as i64 + 2) {
        let Some(info) = getinfo.call::<Option<LuaTable>>((level, "Sln"))? else {
            break;
        };
        let line: i64 = info.get::<Option<i64>>("currentline")?.unwrap_or(-1);
        if line < 0 {
            continue;
        }
        let source: String = info
            .get::<Option<String>>("short_src")?
            .unwrap_or_else(|| "?".to_string());
        let name = match info.get::<Option<String>>("name")? {
            Some(name) => name,
            None if info.get::<Option<String>>("what")?.as_deref() == Some("main") => "main chunk".to_string(),
            None => "?".to_string(),
        };
        frames.push(format!("{}:{}: {}", source, line, name));
        if frames.len() >= depth {
            break;
        }
    }
    Ok(frames)
}

fn format_report(message: &str, frames: &[String]) -> String {
    if frames.is_empty() {
        message.to_string()
    } else {
        format!("{}{}{}", message, TRACE_MARKER, frames.join("\n"))
    }
}

fn parse_report(report: &str) -> BridgeError {
    match report.split_once(TRACE_MARKER) {
        Some((message, frames)) => BridgeError::Script {
            message: message.to_string(),
            traceback: frames.lines().map(str::to_string).collect(),
        },
        None => BridgeError::Script {
            message: report.to_string(),
            traceback: Vec::new(),
        },
    }
}

/// Readable message for an error value of any type.
fn describe(lua: &Lua, value: &LuaValue) -> String {
    match value {
        LuaValue::String(s) => s.to_string_lossy().to_string(),
        LuaValue::Error(e) => root_message(e),
        LuaValue::Nil => "nil".to_string(),
        other => lua
            .globals()
            .get::<LuaFunction>("tostring")
            .and_then(|f| f.call::<String>(other.clone()))
            .unwrap_or_else(|_| other.type_name().to_string()),
    }
}

fn root_message(err: &LuaError) -> String {
    match err {
        LuaError::CallbackError { cause, .. } => root_message(cause),
        LuaError::RuntimeError(message) => message.clone(),
        other => other.to_string(),
    }
}
