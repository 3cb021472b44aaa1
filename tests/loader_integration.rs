//! Integration tests for module loading.
//!
//! Scripts are served from [`MemoryFiles`] so every test controls the exact
//! file layout `require` sees. The last test runs the scripts shipped under
//! `assets/scripts` from disk.

use std::rc::Rc;

use aberredscript::bridge::ScriptEngine;
use aberredscript::error::BridgeError;
use aberredscript::resources::files::MemoryFiles;
use aberredscript::resources::lua_runtime::ScriptVm;
use aberredscript::resources::scriptconfig::ScriptConfig;

fn vm_with(files: MemoryFiles) -> ScriptVm {
    let mut config = ScriptConfig::new();
    config.scripts_root = "scripts".to_string();
    ScriptVm::with_files(&config, Rc::new(files)).unwrap()
}

#[test]
fn require_runs_a_module_once() {
    let vm = vm_with(
        MemoryFiles::new()
            .with("scripts/main.lua", "a = require('counter') b = require('counter')")
            .with("scripts/counter.lua", "loads = (loads or 0) + 1 return { id = loads }"),
    );
    vm.do_file("scripts/main.lua").unwrap();
    assert_eq!(vm.global::<i32>("loads"), 1);
    let same: bool = vm.lua().load("return rawequal(a, b)").eval().unwrap();
    assert!(same);
}

#[test]
fn modules_returning_nothing_cache_true() {
    let vm = vm_with(
        MemoryFiles::new()
            .with("scripts/main.lua", "r = require('side')")
            .with("scripts/side.lua", "touched = true"),
    );
    vm.do_file("scripts/main.lua").unwrap();
    assert!(vm.global::<bool>("touched"));
    assert!(vm.global::<bool>("r"));
}

#[test]
fn requester_directory_wins_over_scripts_root() {
    let vm = vm_with(
        MemoryFiles::new()
            .with("scripts/main.lua", "top = require('util').at sub = require('enemies.boss')")
            .with("scripts/util.lua", "return { at = 'root' }")
            .with("scripts/enemies/boss.lua", "return require('util').at")
            .with("scripts/enemies/util.lua", "return { at = 'enemies' }"),
    );
    vm.do_file("scripts/main.lua").unwrap();
    assert_eq!(vm.global::<String>("top"), "root");
    assert_eq!(vm.global::<String>("sub"), "enemies");
}

#[test]
fn nested_modules_fall_back_to_scripts_root() {
    let vm = vm_with(
        MemoryFiles::new()
            .with("scripts/main.lua", "value = require('enemies.boss')")
            .with("scripts/enemies/boss.lua", "return require('util').at")
            .with("scripts/util.lua", "return { at = 'root' }"),
    );
    vm.do_file("scripts/main.lua").unwrap();
    assert_eq!(vm.global::<String>("value"), "root");
}

#[test]
fn one_file_under_two_names_runs_once() {
    let vm = vm_with(
        MemoryFiles::new()
            .with(
                "scripts/main.lua",
                "a = require('data.levels') b = require('data/levels') same = rawequal(a, b)",
            )
            .with("scripts/data/levels.lua", "loads = (loads or 0) + 1 return {}"),
    );
    vm.do_file("scripts/main.lua").unwrap();
    assert_eq!(vm.global::<i32>("loads"), 1);
    assert!(vm.global::<bool>("same"));
}

#[test]
fn callers_in_different_directories_share_a_module() {
    let vm = vm_with(
        MemoryFiles::new()
            .with("scripts/main.lua", "top = require('util') sub = require('enemies.boss')")
            .with("scripts/enemies/boss.lua", "local util = require('../util') return util")
            .with("scripts/util.lua", "loads = (loads or 0) + 1 return { id = loads }"),
    );
    vm.do_file("scripts/main.lua").unwrap();
    assert_eq!(vm.global::<i32>("loads"), 1);
    let same: bool = vm.lua().load("return rawequal(top, sub)").eval().unwrap();
    assert!(same);
}

#[test]
fn require_loops_are_reported() {
    let vm = vm_with(
        MemoryFiles::new()
            .with("scripts/main.lua", "require('ping')")
            .with("scripts/ping.lua", "return require('pong')")
            .with("scripts/pong.lua", "return require('ping')"),
    );
    let err = vm.do_file("scripts/main.lua").unwrap_err();
    assert!(err.to_string().contains("loop"));
}

#[test]
fn library_names_resolve_without_files() {
    let vm = vm_with(MemoryFiles::new().with("scripts/main.lua", "same = rawequal(require('string'), string)"));
    vm.do_file("scripts/main.lua").unwrap();
    assert!(vm.global::<bool>("same"));
}

#[test]
fn missing_modules_are_script_errors() {
    let vm = vm_with(MemoryFiles::new().with("scripts/main.lua", "require('nowhere')"));
    let err = vm.do_file("scripts/main.lua").unwrap_err();
    assert!(matches!(err, BridgeError::Script { .. }));
    assert!(err.to_string().contains("nowhere"));
}

#[test]
fn errors_inside_modules_propagate() {
    let vm = vm_with(
        MemoryFiles::new()
            .with("scripts/main.lua", "require('broken')")
            .with("scripts/broken.lua", "error('module failed')"),
    );
    let err = vm.do_file("scripts/main.lua").unwrap_err();
    assert!(err.to_string().contains("module failed"));
}

#[test]
fn shipped_main_script_runs_from_disk() {
    let config = ScriptConfig::new();
    let vm = ScriptVm::with_config(&config).unwrap();
    vm.run_main(&config).unwrap();

    let engine: &dyn ScriptEngine = &vm;
    assert!(engine.has_function("on_start"));
    assert_eq!(engine.call("on_start", &[]).unwrap().as_int(), Some(15));
    assert!(engine.call("on_fail", &[]).is_err());
}
