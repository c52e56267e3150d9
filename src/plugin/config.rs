//! Per-plugin persisted configuration (`config.yml` in the data folder).

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::package::PackageSource;
use crate::value::ScriptValue;
use crate::{LuaCordError, Result};

/// File name of the instance-local config.
pub const CONFIG_FILE: &str = "config.yml";
/// Where a corrupt config is moved before the default is re-exported.
pub const BROKEN_CONFIG_FILE: &str = "config.broken.yml";

/// Dotted-path view over a plugin's YAML config.
#[derive(Debug, Clone)]
pub struct PluginConfig {
    path: PathBuf,
    root: ScriptValue,
    autosave: bool,
}

fn parse(content: &str) -> std::result::Result<ScriptValue, String> {
    if content.trim().is_empty() {
        return Ok(ScriptValue::mapping());
    }
    match serde_yml::from_str::<ScriptValue>(content) {
        Ok(ScriptValue::Null) => Ok(ScriptValue::mapping()),
        Ok(value @ ScriptValue::Mapping(_)) => Ok(value),
        Ok(_) => Err("top level is not a mapping".to_string()),
        Err(e) => Err(e.to_string()),
    }
}

impl PluginConfig {
    /// A config with no values, saved to `<data_folder>/config.yml`.
    pub fn empty(data_folder: &Path) -> Self {
        Self {
            path: data_folder.join(CONFIG_FILE),
            root: ScriptValue::mapping(),
            autosave: false,
        }
    }

    /// Load the config, exporting the package default first if none exists.
    ///
    /// A corrupt file is copied to `config.broken.yml`, the default is
    /// exported over it and the load is retried once.
    pub fn open(data_folder: &Path, source: &PackageSource) -> Result<Self> {
        let mut config = Self::empty(data_folder);
        let default = source.default_config_bytes();

        if !config.path.exists() {
            let Some(bytes) = &default else {
                return Ok(config);
            };
            fs::create_dir_all(data_folder)?;
            fs::write(&config.path, bytes)?;
            debug!(path = %config.path.display(), "Exported default config");
        }

        match config.read() {
            Ok(root) => {
                config.root = root;
                Ok(config)
            }
            Err(reason) => {
                let broken = data_folder.join(BROKEN_CONFIG_FILE);
                fs::copy(&config.path, &broken)?;
                match &default {
                    Some(bytes) => fs::write(&config.path, bytes)?,
                    None => fs::remove_file(&config.path)?,
                }
                warn!(
                    path = %config.path.display(),
                    reason = %reason,
                    "Config was invalid; moved it to {BROKEN_CONFIG_FILE} and exported the default"
                );

                if !config.path.exists() {
                    return Ok(config);
                }
                config.root = config.read().map_err(|reason| {
                    LuaCordError::ConfigLoad(format!("default config is invalid: {reason}"))
                })?;
                Ok(config)
            }
        }
    }

    fn read(&self) -> std::result::Result<ScriptValue, String> {
        let content = fs::read_to_string(&self.path).map_err(|e| e.to_string())?;
        parse(&content)
    }

    /// Re-read the file, discarding unsaved changes.
    pub fn reload(&mut self) -> Result<()> {
        if !self.path.exists() {
            self.root = ScriptValue::mapping();
            return Ok(());
        }
        self.root = self.read().map_err(LuaCordError::ConfigLoad)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, path: &str) -> Option<&ScriptValue> {
        self.root.get_path(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Set a value. `Null` removes the key.
    pub fn set(&mut self, path: &str, value: ScriptValue) -> Result<()> {
        if value.is_null() {
            self.root.remove_path(path);
        } else {
            self.root.set_path(path, value)?;
        }
        if self.autosave {
            self.save()?;
        }
        Ok(())
    }

    /// Set a value only when the key is absent. Returns whether it was set.
    pub fn set_default(&mut self, path: &str, value: ScriptValue) -> Result<bool> {
        if self.contains(path) {
            return Ok(false);
        }
        self.set(path, value)?;
        Ok(true)
    }

    /// Remove a key and save immediately.
    pub fn clear(&mut self, path: &str) -> Result<()> {
        self.root.remove_path(path);
        self.save()
    }

    pub fn set_autosave(&mut self, autosave: bool) {
        self.autosave = autosave;
    }

    pub fn autosave(&self) -> bool {
        self.autosave
    }

    /// Store a whole table under `path` without saving.
    pub fn map_table_to_key(&mut self, path: &str, table: ScriptValue) -> Result<()> {
        self.root.set_path(path, table)
    }

    /// Write the config back to disk.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_yml::to_string(&self.root)
            .map_err(|e| LuaCordError::ConfigLoad(format!("cannot serialize config: {e}")))?;
        fs::write(&self.path, content)?;
        Ok(())
    }
}
