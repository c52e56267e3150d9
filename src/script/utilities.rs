//! The `util` global: collection helpers, deferred execution and foreign
//! object checks.

use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use mlua::{Function, Lua, Result as LuaResult, Table, Value};
use tracing::{debug, warn};

use super::api::upgrade;
use super::foreign::{foreign_object, ForeignAccess, ForeignHandle, ForeignTypeHandle};
use crate::plugin::InstanceCore;
use crate::value::ScriptValue;

/// Utilities builder for registering `util` with Lua.
pub struct Utilities {
    core: Weak<InstanceCore>,
    name: String,
    foreign: ForeignAccess,
}

impl Utilities {
    pub fn new(core: &Arc<InstanceCore>, foreign: ForeignAccess) -> Self {
        Self {
            core: Arc::downgrade(core),
            name: core.name().to_string(),
            foreign,
        }
    }

    /// Register the `util` table with the Lua environment.
    pub fn register(&self, lua: &Lua) -> LuaResult<()> {
        let util = lua.create_table()?;
        self.register_table_functions(lua, &util)?;
        self.register_execution_functions(lua, &util)?;
        self.register_foreign_functions(lua, &util)?;
        lua.globals().set("util", util)?;
        Ok(())
    }

    /// Register getTableLength and the collection conversions.
    fn register_table_functions(&self, lua: &Lua, util: &Table) -> LuaResult<()> {
        let get_length = lua.create_function(|_, table: Table| {
            let mut count = 0i64;
            for pair in table.pairs::<Value, Value>() {
                pair?;
                count += 1;
            }
            Ok(count)
        })?;
        util.set("getTableLength", get_length)?;

        let from_list = lua.create_function(|lua, value: Value| {
            match collection(&value, "getTableFromList")? {
                seq @ ScriptValue::Sequence(_) => seq.to_lua(lua),
                _ => Err(mlua::Error::RuntimeError(
                    "util.getTableFromList(obj) was passed something other than a list.".to_string(),
                )),
            }
        })?;
        util.set("getTableFromList", from_list.clone())?;
        util.set("getTableFromArray", from_list)?;

        let from_map = lua.create_function(|lua, value: Value| {
            match collection(&value, "getTableFromMap")? {
                map @ ScriptValue::Mapping(_) => map.to_lua(lua),
                _ => Err(mlua::Error::RuntimeError(
                    "util.getTableFromMap(obj) was passed something other than a map.".to_string(),
                )),
            }
        })?;
        util.set("getTableFromMap", from_map)?;

        Ok(())
    }

    /// Register runAsync/runDelayed.
    ///
    /// `util.runAsync` runs the callback on a fresh thread. `util.runDelayed`
    /// only waits on the plugin scheduler; the callback itself then runs on
    /// the thread that called `runDelayed`, which blocks until it returns.
    fn register_execution_functions(&self, lua: &Lua, util: &Table) -> LuaResult<()> {
        let core = self.core.clone();
        let name = self.name.clone();
        let run_async =
            lua.create_function(move |_, (callback, delay): (Function, Option<u64>)| {
                let core = core.clone();
                thread::Builder::new()
                    .name(format!("luacord-async-{name}"))
                    .spawn(move || {
                        if let Some(ms) = delay {
                            thread::sleep(Duration::from_millis(ms));
                        }
                        let Some(core) = core.upgrade() else {
                            return;
                        };
                        if !core.is_live() {
                            debug!(plugin = %core.name(), "Skipping async task of stopped plugin");
                            return;
                        }
                        // Failures are logged by the guard.
                        let _ = core.guard("runAsync", || callback.call::<()>(()));
                    })
                    .map_err(mlua::Error::external)?;
                Ok(())
            })?;
        util.set("runAsync", run_async)?;

        let core = self.core.clone();
        let run_delayed = lua.create_function(move |_, (callback, delay): (Function, u64)| {
            run_delayed(&upgrade(&core)?, callback, Duration::from_millis(delay));
            Ok(())
        })?;
        util.set("runDelayed", run_delayed)?;

        Ok(())
    }

    /// Register newInstance/cast/instanceOf/getClass.
    fn register_foreign_functions(&self, lua: &Lua, util: &Table) -> LuaResult<()> {
        let new_instance = lua.globals().get::<Function>("newInstance")?;
        util.set("newInstance", new_instance)?;

        let foreign = self.foreign.clone();
        let get_class = lua.create_function(move |_, name: String| Ok(foreign.import(&name)))?;
        util.set("getClass", get_class)?;

        let foreign = self.foreign.clone();
        let name = self.name.clone();
        let cast = lua.create_function(move |_, (object, target): (Value, Value)| {
            let type_name = target_type(&foreign, &target)?;
            match foreign_object(&object) {
                Some(inner) if inner.is_instance_of(&type_name) => Ok(Some(ForeignHandle(inner))),
                _ => {
                    warn!(plugin = %name, type_name = %type_name, "Provided object cannot be cast");
                    Ok(None)
                }
            }
        })?;
        util.set("cast", cast)?;

        let foreign = self.foreign.clone();
        let instance_of = lua.create_function(move |_, (object, target): (Value, Value)| {
            let type_name = target_type(&foreign, &target)?;
            Ok(foreign_object(&object).is_some_and(|inner| inner.is_instance_of(&type_name)))
        })?;
        util.set("instanceOf", instance_of.clone())?;
        util.set("instanceof", instance_of)?;

        Ok(())
    }
}

/// Wait `delay` on the plugin scheduler, then run `callback` on the
/// calling thread.
///
/// The calling thread blocks until the callback has finished. Failures of
/// the wait or of the callback are logged and recorded, never raised.
///
/// # Deadlock
///
/// The wait is queued behind every job already on the scheduler. A caller
/// that is itself running on the scheduler thread never returns.
pub(crate) fn run_delayed(core: &Arc<InstanceCore>, callback: Function, delay: Duration) {
    let waited = core
        .scheduler()
        .and_then(|scheduler| scheduler.run_delayed(delay, || ()));
    if let Err(e) = waited {
        warn!(plugin = %core.name(), error = %e, "The delayed task was terminated");
        core.report(&e);
        return;
    }
    let _ = core.guard("runDelayed", || callback.call::<()>(()));
}

/// Plain-value view of a collection argument.
fn collection(value: &Value, function: &str) -> LuaResult<ScriptValue> {
    if let Value::Table(table) = value {
        return ScriptValue::from_lua(Value::Table(table.clone()));
    }
    foreign_object(value)
        .and_then(|object| object.to_value())
        .ok_or_else(|| {
            mlua::Error::RuntimeError(format!(
                "util.{function}(obj) was passed something that is not a collection."
            ))
        })
}

/// Type name from a string or an imported type.
fn target_type(foreign: &ForeignAccess, target: &Value) -> LuaResult<String> {
    match target {
        Value::String(s) => Ok(foreign.expand(&s.to_str()?)),
        Value::UserData(ud) => match ud.borrow::<ForeignTypeHandle>() {
            Ok(handle) => Ok(handle.type_name().to_string()),
            Err(_) => Err(mlua::Error::RuntimeError(
                "expected a type name or an imported type".to_string(),
            )),
        },
        _ => Err(mlua::Error::RuntimeError(
            "expected a type name or an imported type".to_string(),
        )),
    }
}
