//! Aberred script host entry point.
//!
//! Runs Lua scripts against the scripting bridge using:
//! - **mlua + LuaJIT** for the VM
//! - **bevy_ecs** to own the VM as a non-send resource and dispatch calls
//!   queued from other threads
//!
//! # Main Flow
//!
//! 1. Load `config.ini` (defaults when missing)
//! 2. Create the VM and run the main script
//! 3. Queue every `--call` from a worker thread
//! 4. Run the dispatch schedule until the queue is empty and log outcomes
//! 5. Close the VM
//!
//! # Running
//!
//! ```sh
//! cargo run --release -- --script main.lua --call on_start
//! ```

use aberredscript::events::scriptcall::{ScriptCall, ScriptCallResult};
use aberredscript::luarc_generator;
use aberredscript::resources::lua_runtime::ScriptVm;
use aberredscript::resources::scriptconfig::ScriptConfig;
use aberredscript::resources::scriptevents::{ScriptEventBridge, setup_script_events};
use aberredscript::stub_generator;
use aberredscript::systems::scriptevents::{dispatch_script_events, update_script_event_messages};
use bevy_ecs::prelude::*;
use clap::Parser;
use std::path::PathBuf;

/// Aberred script host
#[derive(Parser)]
#[command(version, about = "Runs Lua scripts through the Aberred scripting bridge.")]
struct Cli {
    /// Configuration file (default: ./config.ini).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Entry script relative to the scripts root; overrides the config file.
    #[arg(long, value_name = "PATH")]
    script: Option<String>,

    /// Global Lua function to call after the main script ran. Repeatable.
    #[arg(long, value_name = "NAME")]
    call: Vec<String>,

    /// Generate Lua LSP stubs from the bound API and exit.
    /// Optionally provide a path (default: assets/scripts/luna.lua).
    #[arg(long, value_name = "PATH")]
    create_lua_stubs: Option<Option<PathBuf>>,

    /// Generate .luarc.json for Lua Language Server and exit.
    /// Optionally provide a path (default: assets/scripts/.luarc.json).
    #[arg(long, value_name = "PATH")]
    create_luarc: Option<Option<PathBuf>>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // Early-exit: generate Lua stubs and quit
    if let Some(maybe_path) = cli.create_lua_stubs {
        let path = maybe_path.unwrap_or_else(|| PathBuf::from("assets/scripts/luna.lua"));
        let vm = ScriptVm::new().unwrap_or_else(|e| fail("Failed to create Lua VM for stub generation", e));
        match stub_generator::generate_stubs(&vm) {
            Ok(content) => {
                if let Err(e) = stub_generator::write_stubs(&path, &content) {
                    fail("Error writing stubs", e);
                }
                println!("Lua stubs written to {}", path.display());
            }
            Err(e) => fail("Error generating stubs", e),
        }
        return;
    }

    // Early-exit: generate .luarc.json and quit
    if let Some(maybe_path) = cli.create_luarc {
        let path = maybe_path.unwrap_or_else(|| PathBuf::from("assets/scripts/.luarc.json"));
        let vm = ScriptVm::new().unwrap_or_else(|e| fail("Failed to create Lua VM for .luarc.json generation", e));
        match luarc_generator::generate_luarc(&vm, "luna.lua") {
            Ok(content) => {
                if let Err(e) = luarc_generator::write_luarc(&path, &content) {
                    fail("Error writing .luarc.json", e);
                }
                println!(".luarc.json written to {}", path.display());
            }
            Err(e) => fail("Error generating .luarc.json", e),
        }
        return;
    }

    let mut config = match cli.config {
        Some(path) => ScriptConfig::with_path(path),
        None => ScriptConfig::new(),
    };
    if let Err(e) = config.load_from_file() {
        log::warn!("Using default script configuration: {}", e);
    }
    if let Some(script) = cli.script {
        config.main_script = script;
    }

    let vm = ScriptVm::with_config(&config).unwrap_or_else(|e| fail("Failed to create Lua VM", e));
    if let Err(e) = vm.run_main(&config) {
        log::error!("Failed to run {}: {}", config.main_path(), e);
        std::process::exit(1);
    }

    // --------------- ECS world + dispatch ---------------
    let mut world = World::new();
    setup_script_events(&mut world);
    world.insert_non_send_resource(vm);

    let tx = world.resource::<ScriptEventBridge>().sender();
    let calls = cli.call;
    let worker = std::thread::spawn(move || {
        for name in calls {
            if tx.send(ScriptCall::new(name, Vec::new())).is_err() {
                break;
            }
        }
    });
    if worker.join().is_err() {
        log::error!("Call queueing thread panicked");
    }

    let mut schedule = Schedule::default();
    schedule.add_systems(
        (
            dispatch_script_events,
            log_script_results,
            update_script_event_messages,
        )
            .chain(),
    );
    while world.resource::<ScriptEventBridge>().pending() > 0 {
        schedule.run(&mut world);
    }

    let used = world.non_send_resource::<ScriptVm>().used_memory();
    log::info!("Lua memory in use at exit: {} bytes", used);
    if let Some(vm) = world.remove_non_send_resource::<ScriptVm>() {
        vm.close();
    }
}

fn log_script_results(mut reader: MessageReader<ScriptCallResult>) {
    for result in reader.read() {
        match &result.outcome {
            Ok(value) => log::info!("{}() returned {:?}", result.callback, value),
            Err(e) => log::error!("{}() failed: {}", result.callback, e),
        }
    }
}

fn fail(context: &str, e: impl std::fmt::Display) -> ! {
    eprintln!("{context}: {e}");
    std::process::exit(1);
}
