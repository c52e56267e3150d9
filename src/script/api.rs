//! Plugin bridge API for Lua scripts.
//!
//! Provides the `plugin`, `logger` and `config` global tables.

use std::sync::{Arc, Weak};

use mlua::{Function, Lua, Result as LuaResult, Table, UserData, UserDataMethods, Value};
use tracing::{debug, error, info, warn};

use crate::bridge::{CommandHandler, CommandSpec};
use crate::plugin::{InstanceCore, Lifecycle, ScriptCommand, StorageHandle};
use crate::value::ScriptValue;

/// Resolve the owning instance from a script closure.
pub(crate) fn upgrade(core: &Weak<InstanceCore>) -> LuaResult<Arc<InstanceCore>> {
    core.upgrade()
        .ok_or_else(|| mlua::Error::RuntimeError("plugin has been unloaded".to_string()))
}

/// Script view of a bound command.
pub struct CommandHandle(pub Arc<ScriptCommand>);

impl UserData for CommandHandle {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("onTabComplete", |_, this, completer: Function| {
            this.0.set_completer(completer);
            Ok(())
        });
        methods.add_method("getName", |_, this, ()| Ok(this.0.spec().name.clone()));
        methods.add_method("getAliases", |_, this, ()| Ok(this.0.spec().aliases.clone()));
        methods.add_method("getDescription", |_, this, ()| {
            Ok(this.0.spec().description.clone())
        });
        methods.add_method("getUsage", |_, this, ()| Ok(this.0.spec().usage.clone()));
        methods.add_method("getPermission", |_, this, ()| {
            Ok(this.0.spec().permission.clone())
        });
    }
}

/// Plugin API builder for registering bridge objects with Lua.
pub struct PluginApi {
    core: Weak<InstanceCore>,
    name: String,
}

impl PluginApi {
    /// Create a new PluginApi bound to `core`.
    pub fn new(core: &Arc<InstanceCore>) -> Self {
        Self {
            core: Arc::downgrade(core),
            name: core.name().to_string(),
        }
    }

    /// Register `plugin`, `logger` and `config` with the Lua environment.
    pub fn register(&self, lua: &Lua) -> LuaResult<()> {
        let plugin = lua.create_table()?;
        self.register_lifecycle_functions(lua, &plugin)?;
        self.register_binding_functions(lua, &plugin)?;
        self.register_resource_functions(lua, &plugin)?;
        self.register_info_functions(lua, &plugin)?;
        lua.globals().set("plugin", plugin)?;

        let logger = lua.create_table()?;
        self.register_logger_functions(lua, &logger)?;
        lua.globals().set("logger", logger)?;

        let config = lua.create_table()?;
        self.register_config_functions(lua, &config)?;
        lua.globals().set("config", config)?;

        Ok(())
    }

    /// Register onLoad/onEnable/onDisable.
    fn register_lifecycle_functions(&self, lua: &Lua, plugin: &Table) -> LuaResult<()> {
        for which in [Lifecycle::Load, Lifecycle::Enable, Lifecycle::Disable] {
            let core = self.core.clone();
            let register = lua.create_function(move |_, callback: Value| match callback {
                Value::Function(callback) => {
                    upgrade(&core)?.set_callback(which, callback);
                    Ok(())
                }
                other => Err(mlua::Error::RuntimeError(format!(
                    "There was an issue registering the {} callback - was provided a {} instead of a function.",
                    which.as_str(),
                    other.type_name()
                ))),
            })?;
            plugin.set(which.as_str(), register)?;
        }
        Ok(())
    }

    /// Register addCommand/registerEvent.
    fn register_binding_functions(&self, lua: &Lua, plugin: &Table) -> LuaResult<()> {
        let core = self.core.clone();
        let add_command = lua.create_function(move |_, (definition, callback): (Value, Value)| {
            let (Value::Table(definition), Value::Function(callback)) = (definition, callback)
            else {
                return Err(mlua::Error::RuntimeError(
                    "There was an issue registering a command. Expected a definition table and a callback function.".to_string(),
                ));
            };
            let spec = command_spec(&definition)?;
            let command = upgrade(&core)?
                .add_command(spec, callback)
                .map_err(mlua::Error::external)?;
            Ok(CommandHandle(command))
        })?;
        plugin.set("addCommand", add_command)?;

        let core = self.core.clone();
        let register_event =
            lua.create_function(move |_, (name, callback): (String, Function)| {
                upgrade(&core)?
                    .register_event(&name, callback)
                    .map_err(mlua::Error::external)
            })?;
        plugin.set("registerEvent", register_event)?;

        Ok(())
    }

    /// Register naggable flag, resource export and storage objects.
    fn register_resource_functions(&self, lua: &Lua, plugin: &Table) -> LuaResult<()> {
        let core = self.core.clone();
        let set_naggable = lua.create_function(move |_, naggable: bool| {
            upgrade(&core)?.set_naggable(naggable);
            Ok(())
        })?;
        plugin.set("setNaggable", set_naggable)?;

        let core = self.core.clone();
        let is_naggable = lua.create_function(move |_, ()| Ok(upgrade(&core)?.is_naggable()))?;
        plugin.set("isNaggable", is_naggable)?;

        let core = self.core.clone();
        let export_resource =
            lua.create_function(move |_, (path, replace): (String, Option<bool>)| {
                upgrade(&core)?
                    .export_resource(&path, replace.unwrap_or(false))
                    .map_err(mlua::Error::external)
            })?;
        plugin.set("exportResource", export_resource)?;

        let core = self.core.clone();
        let get_storage = lua.create_function(move |_, path: String| {
            let core = upgrade(&core)?;
            match core.storage_object(&path) {
                Ok(storage) => Ok(StorageHandle::new(core.name(), storage)),
                Err(e) => {
                    warn!(plugin = %core.name(), error = %e, "Storage object rejected");
                    core.report(&e);
                    Err(mlua::Error::external(e))
                }
            }
        })?;
        plugin.set("getStorageObject", get_storage)?;

        Ok(())
    }

    /// Register descriptor accessors.
    fn register_info_functions(&self, lua: &Lua, plugin: &Table) -> LuaResult<()> {
        let core = self.core.clone();
        let get_name = lua.create_function(move |_, ()| Ok(upgrade(&core)?.name().to_string()))?;
        plugin.set("getName", get_name)?;

        let core = self.core.clone();
        let get_version = lua.create_function(move |_, ()| {
            Ok(upgrade(&core)?.descriptor().version.clone())
        })?;
        plugin.set("getVersion", get_version)?;

        let core = self.core.clone();
        let get_description = lua.create_function(move |_, ()| {
            Ok(upgrade(&core)?.descriptor().description.clone())
        })?;
        plugin.set("getDescription", get_description)?;

        let core = self.core.clone();
        let get_authors = lua.create_function(move |_, ()| {
            Ok(upgrade(&core)?.descriptor().authors.clone())
        })?;
        plugin.set("getAuthors", get_authors)?;

        let core = self.core.clone();
        let get_data_folder = lua.create_function(move |_, ()| {
            Ok(upgrade(&core)?.data_folder().display().to_string())
        })?;
        plugin.set("getDataFolder", get_data_folder)?;

        Ok(())
    }

    /// Register info/warn/severe/debug.
    fn register_logger_functions(&self, lua: &Lua, logger: &Table) -> LuaResult<()> {
        let name = self.name.clone();
        let info_fn = lua.create_function(move |_, message: Value| {
            info!(plugin = %name, "{}", value_to_string(&message));
            Ok(())
        })?;
        logger.set("info", info_fn)?;

        let name = self.name.clone();
        let warn_fn = lua.create_function(move |_, message: Value| {
            warn!(plugin = %name, "{}", value_to_string(&message));
            Ok(())
        })?;
        logger.set("warn", warn_fn)?;

        let name = self.name.clone();
        let severe_fn = lua.create_function(move |_, message: Value| {
            error!(plugin = %name, "{}", value_to_string(&message));
            Ok(())
        })?;
        logger.set("severe", severe_fn)?;

        let name = self.name.clone();
        let debug_fn = lua.create_function(move |_, message: Value| {
            debug!(plugin = %name, "{}", value_to_string(&message));
            Ok(())
        })?;
        logger.set("debug", debug_fn)?;

        Ok(())
    }

    /// Register the `config` accessor functions.
    fn register_config_functions(&self, lua: &Lua, config: &Table) -> LuaResult<()> {
        let core = self.core.clone();
        let get_value = lua.create_function(move |lua, path: String| {
            let value = upgrade(&core)?.config().get(&path).cloned();
            match value {
                Some(value) => value.to_lua(lua),
                None => Ok(Value::Nil),
            }
        })?;
        config.set("getValue", get_value)?;

        let core = self.core.clone();
        let set_default = lua.create_function(move |_, (path, value): (String, Value)| {
            let value = ScriptValue::from_lua(value)?;
            upgrade(&core)?
                .config()
                .set_default(&path, value)
                .map_err(mlua::Error::external)
        })?;
        config.set("setDefault", set_default)?;

        let core = self.core.clone();
        let set = lua.create_function(move |_, (path, value): (String, Value)| {
            let value = ScriptValue::from_lua(value)?;
            upgrade(&core)?
                .config()
                .set(&path, value)
                .map_err(mlua::Error::external)
        })?;
        config.set("set", set)?;

        let core = self.core.clone();
        let clear = lua.create_function(move |_, path: String| {
            upgrade(&core)?
                .config()
                .clear(&path)
                .map_err(mlua::Error::external)
        })?;
        config.set("clear", clear)?;

        let core = self.core.clone();
        let set_autosave = lua.create_function(move |_, autosave: bool| {
            upgrade(&core)?.config().set_autosave(autosave);
            Ok(())
        })?;
        config.set("setAutosave", set_autosave)?;

        let core = self.core.clone();
        let save = lua.create_function(move |_, ()| {
            upgrade(&core)?
                .config()
                .save()
                .map_err(mlua::Error::external)
        })?;
        config.set("save", save)?;

        let core = self.core.clone();
        let map_table = lua.create_function(move |_, (path, table): (String, Table)| {
            let value = ScriptValue::from_lua(Value::Table(table))?;
            upgrade(&core)?
                .config()
                .map_table_to_key(&path, value)
                .map_err(mlua::Error::external)
        })?;
        config.set("mapTableToKey", map_table)?;

        let core = self.core.clone();
        let reload = lua.create_function(move |_, ()| {
            upgrade(&core)?
                .config()
                .reload()
                .map_err(mlua::Error::external)
        })?;
        config.set("reload", reload)?;

        Ok(())
    }
}

/// Build a command spec from an `addCommand` definition table.
fn command_spec(definition: &Table) -> LuaResult<CommandSpec> {
    let name: Option<String> = definition.get("name")?;
    let name = name
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| mlua::Error::RuntimeError("a command needs a name".to_string()))?;

    let mut spec = CommandSpec::new(name.trim());
    spec.description = definition.get::<Option<String>>("description")?.unwrap_or_default();
    spec.usage = definition.get::<Option<String>>("usage")?.unwrap_or_default();
    spec.aliases = definition
        .get::<Option<Vec<String>>>("aliases")?
        .unwrap_or_default()
        .into_iter()
        .map(|alias| alias.to_lowercase())
        .collect();
    spec.permission = definition.get("permission")?;
    spec.permission_message = definition.get("permissionMessage")?;
    spec.min_args = definition
        .get::<Option<i64>>("minArgs")?
        .map_or(0, |min| usize::try_from(min).unwrap_or(0));
    spec.max_args = definition
        .get::<Option<i64>>("maxArgs")?
        .and_then(|max| usize::try_from(max).ok());
    spec.run_async = definition.get::<Option<bool>>("runAsync")?.unwrap_or(false);
    Ok(spec)
}

/// Convert a Lua Value to a string for log output.
fn value_to_string(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.to_string_lossy().to_string(),
        Value::Table(_) => "[table]".to_string(),
        Value::Function(_) => "[function]".to_string(),
        Value::UserData(_) => "[userdata]".to_string(),
        _ => "[unknown]".to_string(),
    }
}
