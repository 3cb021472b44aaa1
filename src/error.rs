//! Error type for the native side of the scripting bridge.
//!
//! Lua-facing callbacks keep returning [`mlua::Result`] so the VM can turn
//! failures into script errors. Everything the host calls returns
//! [`BridgeError`] instead.

use std::path::PathBuf;

use thiserror::Error;

/// Errors reported to native callers of the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The Lua VM rejected an operation (allocation, conversion, syntax).
    #[error("lua error: {0}")]
    Lua(#[from] mlua::Error),

    /// A script raised an error that was caught by the installed handler.
    #[error("script error: {message}")]
    Script { message: String, traceback: Vec<String> },

    /// A script or data file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A data file was not valid JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// The configuration file was missing or malformed.
    #[error("config error: {0}")]
    Config(String),

    /// `require` or `do_file` could not resolve a script.
    #[error("module '{0}' not found")]
    ModuleNotFound(String),

    /// A class was used before it was registered in this VM.
    #[error("class \"{0}\" is not registered")]
    UnknownClass(String),
}

impl BridgeError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BridgeError::Io {
            path: path.into(),
            source,
        }
    }

    /// Frames captured by the error handler, innermost first. Empty for
    /// anything but [`BridgeError::Script`].
    pub fn traceback(&self) -> &[String] {
        match self {
            BridgeError::Script { traceback, .. } => traceback,
            _ => &[],
        }
    }
}
