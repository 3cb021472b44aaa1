//! ECS resources that let other threads ask the VM thread to run scripts.
//!
//! The Lua VM is single-threaded and lives in the world as a non-send
//! resource. Worker threads never touch it; they push [`ScriptCall`]s through
//! the [`ScriptEventBridge`] channel and the
//! [`dispatch_script_events`](crate::systems::scriptevents::dispatch_script_events)
//! system drains them on the VM thread.
//!
//! Use [`setup_script_events`] once during initialization.

use crate::events::scriptcall::{ScriptCall, ScriptCallResult};
use bevy_ecs::prelude::*;
use crossbeam_channel::{Receiver, Sender, unbounded};

/// Shared bridge between worker threads and the VM thread.
#[derive(Resource)]
pub struct ScriptEventBridge {
    /// Sender for [`ScriptCall`] requests (any thread -> VM thread).
    pub tx_call: Sender<ScriptCall>,
    /// Receiver drained by the dispatch system.
    pub rx_call: Receiver<ScriptCall>,
}

impl ScriptEventBridge {
    pub fn new() -> Self {
        let (tx_call, rx_call) = unbounded::<ScriptCall>();
        Self { tx_call, rx_call }
    }

    /// A sender to hand to another thread.
    pub fn sender(&self) -> Sender<ScriptCall> {
        self.tx_call.clone()
    }

    /// Number of calls waiting for the next dispatch.
    pub fn pending(&self) -> usize {
        self.rx_call.len()
    }
}

impl Default for ScriptEventBridge {
    fn default() -> Self {
        Self::new()
    }
}

/// Insert [`ScriptEventBridge`] and `Messages<ScriptCallResult>`.
pub fn setup_script_events(world: &mut World) {
    world.insert_resource(ScriptEventBridge::new());
    world.insert_resource(Messages::<ScriptCallResult>::default());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn senders_from_other_threads_reach_the_bridge() {
        let bridge = ScriptEventBridge::new();
        let tx = bridge.sender();
        std::thread::spawn(move || {
            tx.send(ScriptCall::new("ping", Vec::new())).unwrap();
        })
        .join()
        .unwrap();
        assert_eq!(bridge.pending(), 1);
        assert_eq!(bridge.rx_call.try_recv().unwrap().callback, "ping");
    }

    #[test]
    fn setup_inserts_resources() {
        let mut world = World::new();
        setup_script_events(&mut world);
        assert!(world.contains_resource::<ScriptEventBridge>());
        assert!(world.contains_resource::<Messages<ScriptCallResult>>());
    }
}
