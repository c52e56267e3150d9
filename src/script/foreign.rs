//! Host objects constructed from scripts.
//!
//! Scripts may only build types the host registered, and only under
//! namespaces the allow-list permits. Names may start with `$` (host
//! namespace) or `#` (LuaCord internal namespace).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};

use mlua::{AnyUserData, Lua, MetaMethod, MultiValue, UserData, UserDataMethods, Value};
use regex::Regex;
use tracing::warn;

use crate::config::ForeignTypesConfig;
use crate::error_log::ErrorLog;
use crate::host::Host;
use crate::value::ScriptValue;
use crate::{LuaCordError, Result};

/// An object owned by the host that scripts can call into.
pub trait ForeignObject: Send + Sync {
    /// Fully-qualified type name.
    fn type_name(&self) -> &str;

    /// Whether the object can be viewed as `type_name`.
    fn is_instance_of(&self, type_name: &str) -> bool {
        self.type_name() == type_name
    }

    /// Invoke a method.
    fn call(&self, method: &str, args: Vec<ScriptValue>) -> Result<ScriptValue>;

    /// Plain-value view, for collection-like objects.
    fn to_value(&self) -> Option<ScriptValue> {
        None
    }
}

/// Builds a foreign object from script arguments.
pub type ForeignConstructor =
    Arc<dyn Fn(Vec<ScriptValue>) -> Result<Arc<dyn ForeignObject>> + Send + Sync>;

/// Types the host allows scripts to construct.
#[derive(Default)]
pub struct ForeignTypeRegistry {
    types: RwLock<BTreeMap<String, ForeignConstructor>>,
}

impl ForeignTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a constructor.
    pub fn register<F>(&self, type_name: &str, constructor: F)
    where
        F: Fn(Vec<ScriptValue>) -> Result<Arc<dyn ForeignObject>> + Send + Sync + 'static,
    {
        self.types
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(type_name.to_string(), Arc::new(constructor));
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.types
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(type_name)
    }

    /// Run the constructor for `type_name`.
    pub fn construct(&self, type_name: &str, args: Vec<ScriptValue>) -> Result<Arc<dyn ForeignObject>> {
        let constructor = self
            .types
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(type_name)
            .cloned()
            .ok_or_else(|| {
                LuaCordError::InvalidForeignType(format!("{type_name} is not a known type"))
            })?;
        constructor(args)
    }
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*(\.[A-Za-z_$][A-Za-z0-9_$]*)*$")
            .expect("valid identifier pattern")
    })
}

/// Name expansion and allow-list checks for foreign types.
#[derive(Debug, Clone)]
pub struct ForeignTypePolicy {
    host_namespace: String,
    internal_namespace: String,
    allowed_prefixes: Vec<String>,
}

impl ForeignTypePolicy {
    pub fn new(config: &ForeignTypesConfig) -> Self {
        Self {
            host_namespace: config.host_namespace.clone(),
            internal_namespace: config.internal_namespace.clone(),
            allowed_prefixes: config.allowed_prefixes.clone(),
        }
    }

    /// Expand `$` and `#` shorthands.
    pub fn expand(&self, name: &str) -> String {
        let name = name.trim();
        if let Some(rest) = name.strip_prefix('$') {
            format!("{}{rest}", self.host_namespace)
        } else if let Some(rest) = name.strip_prefix('#') {
            format!("{}{rest}", self.internal_namespace)
        } else {
            name.to_string()
        }
    }

    /// Expand `name` and check it is a well-formed, allowed type name.
    pub fn validate(&self, name: &str) -> Result<String> {
        let expanded = self.expand(name);
        if !identifier_pattern().is_match(&expanded) {
            return Err(LuaCordError::InvalidForeignType(format!(
                "\"{expanded}\" is not a valid type name"
            )));
        }

        let allowed = self.allowed_prefixes.iter().any(|prefix| {
            expanded == *prefix
                || expanded
                    .strip_prefix(prefix.as_str())
                    .is_some_and(|rest| rest.starts_with('.'))
        });
        if !allowed {
            return Err(LuaCordError::InvalidForeignType(format!(
                "{expanded} is outside the allowed namespaces"
            )));
        }
        Ok(expanded)
    }

    /// Validate, then construct through the host registry.
    pub fn instantiate(
        &self,
        registry: &ForeignTypeRegistry,
        name: &str,
        args: Vec<ScriptValue>,
    ) -> Result<Arc<dyn ForeignObject>> {
        let type_name = self.validate(name)?;
        if !registry.contains(&type_name) {
            return Err(LuaCordError::InvalidForeignType(format!(
                "{type_name} is not a known type"
            )));
        }
        registry.construct(&type_name, args)
    }
}

/// Script view of a foreign object. Unknown keys resolve to methods.
#[derive(Clone)]
pub struct ForeignHandle(pub Arc<dyn ForeignObject>);

impl fmt::Debug for ForeignHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ForeignHandle").field(&self.0.type_name()).finish()
    }
}

impl UserData for ForeignHandle {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Index, |lua, this, method: String| {
            let object = Arc::clone(&this.0);
            lua.create_function(move |lua, args: MultiValue| {
                let mut values = Vec::with_capacity(args.len());
                for (i, arg) in args.into_iter().enumerate() {
                    // `obj:method(...)` passes the handle first.
                    if i == 0 && is_handle(&arg) {
                        continue;
                    }
                    values.push(ScriptValue::from_lua(arg)?);
                }
                let result = object.call(&method, values).map_err(mlua::Error::external)?;
                result.to_lua(lua)
            })
        });

        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(format!("{}@foreign", this.0.type_name()))
        });
    }
}

fn is_handle(value: &Value) -> bool {
    matches!(value, Value::UserData(ud) if ud.is::<ForeignHandle>())
}

/// Result of `import`: a constructible type.
#[derive(Clone)]
pub struct ForeignTypeHandle {
    type_name: String,
    host: Arc<dyn Host>,
    policy: Arc<ForeignTypePolicy>,
}

impl ForeignTypeHandle {
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    fn construct(&self, args: MultiValue) -> mlua::Result<ForeignHandle> {
        let mut values = Vec::with_capacity(args.len());
        for (i, arg) in args.into_iter().enumerate() {
            // `T:new(...)` passes the type first.
            if i == 0 && matches!(&arg, Value::UserData(ud) if ud.is::<ForeignTypeHandle>()) {
                continue;
            }
            values.push(ScriptValue::from_lua(arg)?);
        }
        self.policy
            .instantiate(self.host.foreign_types(), &self.type_name, values)
            .map(ForeignHandle)
            .map_err(mlua::Error::external)
    }
}

impl UserData for ForeignTypeHandle {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_method(MetaMethod::Index, |lua, this, key: String| {
            let handle = this.clone();
            match key.as_str() {
                "new" => lua
                    .create_function(move |_, args: MultiValue| handle.construct(args))
                    .map(Value::Function),
                "getName" => lua
                    .create_function(move |_, _: MultiValue| Ok(handle.type_name.clone()))
                    .map(Value::Function),
                _ => Ok(Value::Nil),
            }
        });

        methods.add_meta_method(MetaMethod::ToString, |_, this, ()| {
            Ok(format!("type {}", this.type_name))
        });
    }
}

/// Script-facing construction capability of one plugin.
#[derive(Clone)]
pub struct ForeignAccess {
    plugin: String,
    host: Arc<dyn Host>,
    policy: Arc<ForeignTypePolicy>,
    error_log: Arc<ErrorLog>,
}

impl ForeignAccess {
    pub fn new(
        plugin: &str,
        host: Arc<dyn Host>,
        policy: Arc<ForeignTypePolicy>,
        error_log: Arc<ErrorLog>,
    ) -> Self {
        Self {
            plugin: plugin.to_string(),
            host,
            policy,
            error_log,
        }
    }

    /// Resolve a type for `import`. Unknown or disallowed types yield
    /// `None` after a warning.
    pub fn import(&self, name: &str) -> Option<ForeignTypeHandle> {
        let type_name = match self.policy.validate(name) {
            Ok(type_name) if self.host.foreign_types().contains(&type_name) => type_name,
            Ok(type_name) => {
                warn!(plugin = %self.plugin, type_name = %type_name, "Cannot import unknown type");
                return None;
            }
            Err(e) => {
                warn!(plugin = %self.plugin, error = %e, "Cannot import type");
                return None;
            }
        };
        Some(ForeignTypeHandle {
            type_name,
            host: Arc::clone(&self.host),
            policy: Arc::clone(&self.policy),
        })
    }

    /// Construct an object. Failures are recorded before being returned.
    pub fn new_instance(&self, name: &str, args: Vec<ScriptValue>) -> Result<Arc<dyn ForeignObject>> {
        self.policy
            .instantiate(self.host.foreign_types(), name, args)
            .inspect_err(|e| {
                warn!(plugin = %self.plugin, error = %e, "Rejected foreign construction");
                self.error_log.record(e, Some(&self.plugin));
            })
    }

    /// Expanded form of a type name, without validation.
    pub fn expand(&self, name: &str) -> String {
        self.policy.expand(name)
    }

    /// Install `import` and `newInstance` as globals.
    pub fn register(&self, lua: &Lua) -> mlua::Result<()> {
        let access = self.clone();
        let import = lua.create_function(move |_, name: String| Ok(access.import(&name)))?;
        lua.globals().set("import", import)?;

        let access = self.clone();
        let new_instance =
            lua.create_function(move |_, (name, args): (String, Option<mlua::Table>)| {
                let values = match args {
                    Some(table) => table
                        .sequence_values::<Value>()
                        .map(|v| v.and_then(ScriptValue::from_lua))
                        .collect::<mlua::Result<Vec<_>>>()?,
                    None => Vec::new(),
                };
                access
                    .new_instance(&name, values)
                    .map(ForeignHandle)
                    .map_err(mlua::Error::external)
            })?;
        lua.globals().set("newInstance", new_instance)?;
        Ok(())
    }
}

/// Extract the foreign object behind a script value.
pub fn foreign_object(value: &Value) -> Option<Arc<dyn ForeignObject>> {
    match value {
        Value::UserData(ud) => handle_object(ud),
        _ => None,
    }
}

fn handle_object(ud: &AnyUserData) -> Option<Arc<dyn ForeignObject>> {
    ud.borrow::<ForeignHandle>()
        .ok()
        .map(|handle| Arc::clone(&handle.0))
}
