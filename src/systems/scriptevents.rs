//! Script event dispatch.
//!
//! Runs [`ScriptCall`] requests queued on the [`ScriptEventBridge`] against
//! the VM and publishes one [`ScriptCallResult`] message per request.
//!
//! # System Flow
//!
//! 1. Drain every queued call without blocking
//! 2. Skip (and report) callbacks the scripts never defined
//! 3. Call the global function through [`ScriptEngine::call`]
//! 4. Write the outcome as a message for other systems to read
//!
//! Errors raised by scripts were already logged with their stack trace by
//! the VM's error handler, so they are only forwarded here.

use bevy_ecs::prelude::*;
use log::warn;

use crate::bridge::ScriptEngine;
use crate::events::scriptcall::ScriptCallResult;
use crate::resources::lua_runtime::ScriptVm;
use crate::resources::scriptevents::ScriptEventBridge;

/// Drain queued calls and run them on the VM thread.
pub fn dispatch_script_events(
    vm: NonSend<ScriptVm>,
    bridge: Res<ScriptEventBridge>,
    mut writer: MessageWriter<ScriptCallResult>,
) {
    let engine: &dyn ScriptEngine = &*vm;
    for call in bridge.rx_call.try_iter() {
        let outcome = if engine.has_function(&call.callback) {
            engine.call(&call.callback, &call.args).map_err(|e| e.to_string())
        } else {
            warn!(
                "Script callback '{}' is not defined; call dropped",
                call.callback
            );
            Err(format!("function '{}' not found", call.callback))
        };
        writer.write(ScriptCallResult {
            callback: call.callback,
            outcome,
        });
    }
}

/// Advance the double buffer of `Messages<ScriptCallResult>`.
pub fn update_script_event_messages(mut messages: ResMut<Messages<ScriptCallResult>>) {
    messages.update();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::Variant;
    use crate::events::scriptcall::ScriptCall;
    use crate::resources::scriptevents::setup_script_events;
    use bevy_ecs::system::SystemState;

    fn world_with_script(source: &str) -> World {
        let vm = ScriptVm::new().unwrap();
        vm.do_string(source, "events").unwrap();
        let mut world = World::new();
        setup_script_events(&mut world);
        world.insert_non_send_resource(vm);
        world
    }

    fn results(world: &mut World) -> Vec<ScriptCallResult> {
        let mut state = SystemState::<MessageReader<ScriptCallResult>>::new(world);
        let mut reader = state.get_mut(world);
        reader.read().cloned().collect()
    }

    #[test]
    fn queued_calls_run_on_the_vm() {
        let mut world = world_with_script(
            r#"
            total = 0
            function add(n) total = total + n return total end
            "#,
        );
        let tx = world.resource::<ScriptEventBridge>().sender();
        tx.send(ScriptCall::new("add", vec![Variant::Int(2)])).unwrap();
        tx.send(ScriptCall::new("add", vec![Variant::Int(3)])).unwrap();

        let mut schedule = Schedule::default();
        schedule.add_systems(dispatch_script_events);
        schedule.run(&mut world);

        let results = results(&mut world);
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].outcome.as_ref().unwrap().as_int(), Some(5));
        assert_eq!(world.resource::<ScriptEventBridge>().pending(), 0);
    }

    #[test]
    fn missing_and_failing_callbacks_report_errors() {
        let mut world = world_with_script("function explode() error('kaboom') end");
        let tx = world.resource::<ScriptEventBridge>().sender();
        tx.send(ScriptCall::new("nowhere", Vec::new())).unwrap();
        tx.send(ScriptCall::new("explode", Vec::new())).unwrap();

        let mut schedule = Schedule::default();
        schedule.add_systems(dispatch_script_events);
        schedule.run(&mut world);

        let results = results(&mut world);
        assert_eq!(results.len(), 2);
        assert!(results[0].outcome.as_ref().unwrap_err().contains("not found"));
        assert!(results[1].outcome.as_ref().unwrap_err().contains("kaboom"));
    }
}
