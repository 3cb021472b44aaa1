//! Script runtime configuration.
//!
//! Settings are read from an INI file. Every value has a safe default, so a
//! missing file or a missing key never prevents the VM from starting.
//!
//! # Configuration File Format
//!
//! ```ini
//! [scripts]
//! root = ./assets/scripts
//! main = main.lua
//!
//! [lua]
//! trace_depth = 32
//! strict_arity = false
//! ```

use configparser::ini::Ini;
use log::info;
use std::path::PathBuf;

use crate::error::BridgeError;
use crate::resources::files::{join_path, normalize_path};

/// Default safe values for startup
const DEFAULT_SCRIPTS_ROOT: &str = "./assets/scripts";
const DEFAULT_MAIN_SCRIPT: &str = "main.lua";
const DEFAULT_TRACE_DEPTH: usize = 32;
const DEFAULT_STRICT_ARITY: bool = false;
const DEFAULT_CONFIG_PATH: &str = "./config.ini";

/// Script runtime configuration.
#[derive(Debug, Clone)]
pub struct ScriptConfig {
    /// Directory that `require` falls back to after the requesting script's
    /// own directory.
    pub scripts_root: String,
    /// Entry script, relative to `scripts_root`.
    pub main_script: String,
    /// Maximum number of frames the error handler records.
    pub trace_depth: usize,
    /// When true, bindings registered without an explicit arity mode check
    /// that scripts pass every declared parameter.
    pub strict_arity: bool,
    /// Path to the configuration file.
    pub config_path: PathBuf,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptConfig {
    /// Create a new configuration with safe default values.
    pub fn new() -> Self {
        Self {
            scripts_root: DEFAULT_SCRIPTS_ROOT.to_string(),
            main_script: DEFAULT_MAIN_SCRIPT.to_string(),
            trace_depth: DEFAULT_TRACE_DEPTH,
            strict_arity: DEFAULT_STRICT_ARITY,
            config_path: PathBuf::from(DEFAULT_CONFIG_PATH),
        }
    }

    /// Create a new configuration with a custom config file path.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            config_path: path.into(),
            ..Self::new()
        }
    }

    /// Load configuration from the INI file.
    ///
    /// Missing values retain their current (default) values.
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from_file(&mut self) -> Result<(), BridgeError> {
        let mut config = Ini::new();
        config
            .load(&self.config_path)
            .map_err(|e| BridgeError::Config(format!("failed to load {}: {}", self.config_path.display(), e)))?;
        self.apply(&config);
        Ok(())
    }

    /// Load configuration from INI text instead of a file.
    pub fn load_from_str(&mut self, text: &str) -> Result<(), BridgeError> {
        let mut config = Ini::new();
        config
            .read(text.to_string())
            .map_err(|e| BridgeError::Config(format!("failed to parse config: {}", e)))?;
        self.apply(&config);
        Ok(())
    }

    fn apply(&mut self, config: &Ini) {
        // [scripts] section
        if let Some(root) = config.get("scripts", "root") {
            self.scripts_root = root;
        }
        if let Some(main) = config.get("scripts", "main") {
            self.main_script = main;
        }

        // [lua] section
        if let Some(depth) = config.getuint("lua", "trace_depth").ok().flatten() {
            self.trace_depth = depth as usize;
        }
        if let Some(strict) = config.getbool("lua", "strict_arity").ok().flatten() {
            self.strict_arity = strict;
        }

        info!(
            "Loaded script config: root={}, main={}, trace_depth={}, strict_arity={}",
            self.scripts_root, self.main_script, self.trace_depth, self.strict_arity
        );
    }

    /// Save configuration to the INI file.
    ///
    /// Creates the file if it doesn't exist.
    pub fn save_to_file(&self) -> Result<(), BridgeError> {
        let mut config = Ini::new();

        // [scripts] section
        config.set("scripts", "root", Some(self.scripts_root.clone()));
        config.set("scripts", "main", Some(self.main_script.clone()));

        // [lua] section
        config.set("lua", "trace_depth", Some(self.trace_depth.to_string()));
        config.set("lua", "strict_arity", Some(self.strict_arity.to_string()));

        config
            .write(&self.config_path)
            .map_err(|e| BridgeError::Config(format!("failed to save {}: {}", self.config_path.display(), e)))?;

        info!("Saved script config to {:?}", self.config_path);

        Ok(())
    }

    /// Full path of the entry script.
    pub fn main_path(&self) -> String {
        normalize_path(&join_path(&self.scripts_root, &self.main_script))
    }
}
