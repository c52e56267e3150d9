//! Package-local module resolution.

use std::sync::Arc;

use mlua::{Function, Lua, Result as LuaResult, Table, Value};
use tracing::debug;

use crate::package::PackageSource;
use crate::LuaCordError;

/// Registry key of the per-environment module cache.
pub const MODULE_CACHE_KEY: &str = "luacord.modules";

/// Turn a logical module name into a package resource path.
///
/// `a.b.c` and `/a/b/c.lua` both become `a/b/c.lua`.
pub fn normalize_module_path(name: &str) -> String {
    let name = name.trim().trim_start_matches('/');
    let stem = name.strip_suffix(".lua").unwrap_or(name);
    format!("{}.lua", stem.replace('.', "/"))
}

fn module_cache(lua: &Lua) -> LuaResult<Table> {
    lua.named_registry_value::<Table>(MODULE_CACHE_KEY)
}

/// Create an empty module cache.
pub fn install_module_cache(lua: &Lua) -> LuaResult<()> {
    lua.set_named_registry_value(MODULE_CACHE_KEY, lua.create_table()?)
}

/// Number of cached modules.
pub fn cached_module_count(lua: &Lua) -> LuaResult<usize> {
    let mut count = 0;
    for pair in module_cache(lua)?.pairs::<Value, Value>() {
        pair?;
        count += 1;
    }
    Ok(count)
}

fn cached(lua: &Lua, path: &str) -> LuaResult<Option<Value>> {
    let value: Value = module_cache(lua)?.raw_get(path)?;
    Ok(if value.is_nil() { None } else { Some(value) })
}

/// Evaluate a package module, serving repeat requests from the cache.
///
/// Modules that return nothing are cached as `true`.
pub fn require_local(lua: &Lua, source: &PackageSource, name: &str) -> LuaResult<Value> {
    let path = normalize_module_path(name);
    if let Some(value) = cached(lua, &path)? {
        return Ok(value);
    }

    let bytes = source
        .resource_bytes(&path)
        .ok_or_else(|| mlua::Error::external(LuaCordError::ModuleNotFound(path.clone())))?;
    debug!(module = %path, "Loading package module");

    let value: Value = lua.load(bytes).set_name(format!("@{path}")).call(())?;
    let value = if value.is_nil() {
        Value::Boolean(true)
    } else {
        value
    };
    module_cache(lua)?.raw_set(path.as_str(), value.clone())?;
    Ok(value)
}

/// Install `require_local` and override `require`.
///
/// The override resolves package modules first and falls back to the
/// runtime's own `require` only when the package has no such resource.
pub fn install_require(lua: &Lua, source: Arc<PackageSource>) -> LuaResult<()> {
    let globals = lua.globals();

    let local_source = Arc::clone(&source);
    let require_local_fn = lua.create_function(move |lua, name: String| {
        require_local(lua, &local_source, &name)
    })?;
    globals.set("require_local", require_local_fn)?;

    let original: Option<Function> = globals.get("require")?;
    let require_fn = lua.create_function(move |lua, name: String| {
        let path = normalize_module_path(&name);
        if cached(lua, &path)?.is_some() || source.resource_exists(&path) {
            return require_local(lua, &source, &name);
        }
        match &original {
            Some(fallback) => fallback.call::<Value>(name),
            None => Err(mlua::Error::external(LuaCordError::ModuleNotFound(path))),
        }
    })?;
    globals.set("require", require_fn)?;
    Ok(())
}

/// Drop every cached module.
pub fn clear_module_cache(lua: &Lua) -> LuaResult<()> {
    install_module_cache(lua)
}
