//! Key/value storage objects handed to scripts.
//!
//! The backends themselves belong to the host; LuaCord only defines the
//! contract, an in-memory implementation and the script view.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use mlua::{UserData, UserDataMethods, Value};
use tracing::warn;

use crate::value::ScriptValue;
use crate::{LuaCordError, Result};

/// Storage file format, chosen by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Json,
    Yaml,
}

impl StorageKind {
    /// Kind for `path`, or `None` for unsupported extensions.
    pub fn from_path(path: &str) -> Option<Self> {
        let extension = Path::new(path).extension()?.to_str()?.to_lowercase();
        match extension.as_str() {
            "json" => Some(StorageKind::Json),
            "yml" | "yaml" => Some(StorageKind::Yaml),
            _ => None,
        }
    }

    /// Lowercase tag reported to scripts.
    pub fn as_str(self) -> &'static str {
        match self {
            StorageKind::Json => "json",
            StorageKind::Yaml => "yaml",
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageKind::Json => write!(f, "JSON"),
            StorageKind::Yaml => write!(f, "YAML"),
        }
    }
}

/// A dotted-path key/value store.
pub trait StorageObject: Send + Sync {
    fn kind(&self) -> StorageKind;

    fn exists(&self, path: &str) -> bool;

    fn get(&self, path: &str) -> Result<ScriptValue>;

    fn set(&self, path: &str, value: ScriptValue) -> Result<()>;

    /// Set `path` only if it is unset. Returns whether a value was written.
    fn set_default(&self, path: &str, value: ScriptValue) -> Result<bool> {
        if self.exists(path) {
            return Ok(false);
        }
        self.set(path, value)?;
        Ok(true)
    }

    /// Remove `path`. Returns whether anything was removed.
    fn clear(&self, path: &str) -> Result<bool>;

    fn save(&self) -> Result<()>;
}

/// Storage that lives only as long as the process.
pub struct MemoryStorage {
    kind: StorageKind,
    root: Mutex<ScriptValue>,
}

impl MemoryStorage {
    pub fn new(kind: StorageKind) -> Self {
        Self {
            kind,
            root: Mutex::new(ScriptValue::Mapping(BTreeMap::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ScriptValue> {
        self.root.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl StorageObject for MemoryStorage {
    fn kind(&self) -> StorageKind {
        self.kind
    }

    fn exists(&self, path: &str) -> bool {
        self.lock().get_path(path).is_some()
    }

    fn get(&self, path: &str) -> Result<ScriptValue> {
        Ok(self.lock().get_path(path).cloned().unwrap_or_default())
    }

    fn set(&self, path: &str, value: ScriptValue) -> Result<()> {
        if path.is_empty() {
            return Err(LuaCordError::NotFound("empty storage path".to_string()));
        }
        let mut root = self.lock();
        if value.is_null() {
            root.remove_path(path);
        } else {
            root.set_path(path, value)?;
        }
        Ok(())
    }

    fn clear(&self, path: &str) -> Result<bool> {
        Ok(self.lock().remove_path(path).is_some())
    }

    fn save(&self) -> Result<()> {
        Ok(())
    }
}

/// Script view of a storage object. Methods are called with `:`.
#[derive(Clone)]
pub struct StorageHandle {
    plugin: String,
    storage: Arc<dyn StorageObject>,
}

impl StorageHandle {
    pub fn new(plugin: &str, storage: Arc<dyn StorageObject>) -> Self {
        Self {
            plugin: plugin.to_string(),
            storage,
        }
    }

    fn report(&self, op: &str, err: &LuaCordError) {
        warn!(plugin = %self.plugin, op, error = %err, "Storage operation failed");
    }
}

impl UserData for StorageHandle {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("getType", |_, this, ()| Ok(this.storage.kind().as_str()));

        methods.add_method("exists", |_, this, path: String| Ok(this.storage.exists(&path)));

        methods.add_method("setDefaultValue", |_, this, (path, value): (String, Value)| {
            let value = ScriptValue::from_lua(value)?;
            match this.storage.set_default(&path, value) {
                Ok(written) => Ok(Some(written)),
                Err(e) => {
                    this.report("setDefaultValue", &e);
                    Ok(None)
                }
            }
        });

        methods.add_method("setValue", |_, this, (path, value): (String, Value)| {
            let value = ScriptValue::from_lua(value)?;
            match this.storage.set(&path, value) {
                Ok(()) => Ok(true),
                Err(e) => {
                    this.report("setValue", &e);
                    Ok(false)
                }
            }
        });

        methods.add_method("getValue", |lua, this, path: String| {
            match this.storage.get(&path) {
                Ok(value) => value.to_lua(lua),
                Err(e) => {
                    this.report("getValue", &e);
                    Ok(Value::Nil)
                }
            }
        });

        methods.add_method("clearValue", |_, this, path: String| {
            match this.storage.clear(&path) {
                Ok(removed) => Ok(Some(removed)),
                Err(e) => {
                    this.report("clearValue", &e);
                    Ok(None)
                }
            }
        });

        methods.add_method("save", |_, this, ()| {
            if let Err(e) = this.storage.save() {
                this.report("save", &e);
            }
            Ok(())
        });
    }
}
