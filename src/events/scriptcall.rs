use bevy_ecs::message::Message;
use serde::{Deserialize, Serialize};

use crate::bridge::Variant;

/// Request sent *to* the VM thread: call the global function `callback`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptCall {
    pub callback: String,
    #[serde(default)]
    pub args: Vec<Variant>,
}

impl ScriptCall {
    pub fn new(callback: impl Into<String>, args: Vec<Variant>) -> Self {
        Self {
            callback: callback.into(),
            args,
        }
    }
}

/// Outcome of a [`ScriptCall`], sent *back* once the VM thread ran it.
#[derive(Message, Debug, Clone)]
pub struct ScriptCallResult {
    pub callback: String,
    pub outcome: Result<Variant, String>,
}
