//! Closed value model shared by scripts, configuration and storage.

use std::collections::{BTreeMap, HashSet};
use std::ffi::c_void;
use std::fmt;

use mlua::{Lua, Result as LuaResult, Table, Value};
use serde::{Deserialize, Serialize};

use crate::error::{LuaCordError, Result};

/// Deepest table nesting (and dotted path length) a value may have.
pub const MAX_DEPTH: usize = 64;

/// A script-visible value that can be persisted or handed to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScriptValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Sequence(Vec<ScriptValue>),
    Mapping(BTreeMap<String, ScriptValue>),
}

impl ScriptValue {
    /// Empty mapping.
    pub fn mapping() -> Self {
        ScriptValue::Mapping(BTreeMap::new())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ScriptValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScriptValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ScriptValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ScriptValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Convert a Lua value.
    ///
    /// Tables whose keys are exactly `1..=n` become sequences, every other
    /// table becomes a mapping with stringified keys. Functions, threads and
    /// userdata have no representation and are rejected, as are cyclic
    /// tables and tables nested deeper than [`MAX_DEPTH`].
    pub fn from_lua(value: Value) -> LuaResult<Self> {
        Self::convert(value, &mut HashSet::new())
    }

    /// `open` holds the tables currently being converted, outermost first.
    fn convert(value: Value, open: &mut HashSet<*const c_void>) -> LuaResult<Self> {
        match value {
            Value::Nil => Ok(ScriptValue::Null),
            Value::Boolean(b) => Ok(ScriptValue::Boolean(b)),
            Value::Integer(i) => Ok(ScriptValue::Integer(i)),
            Value::Number(n) => Ok(ScriptValue::Float(n)),
            Value::String(s) => Ok(ScriptValue::String(s.to_str()?.to_string())),
            Value::Table(table) => {
                let id = table.to_pointer();
                if open.contains(&id) {
                    return Err(mlua::Error::RuntimeError(
                        "a cyclic table cannot be stored".to_string(),
                    ));
                }
                if open.len() >= MAX_DEPTH {
                    return Err(mlua::Error::RuntimeError(format!(
                        "a table nested deeper than {MAX_DEPTH} levels cannot be stored"
                    )));
                }
                open.insert(id);
                let converted = Self::from_table(table, open);
                open.remove(&id);
                converted
            }
            other => Err(mlua::Error::RuntimeError(format!(
                "a {} value cannot be stored",
                other.type_name()
            ))),
        }
    }

    fn from_table(table: Table, open: &mut HashSet<*const c_void>) -> LuaResult<Self> {
        let len = table.raw_len();
        let mut count = 0usize;
        for pair in table.clone().pairs::<Value, Value>() {
            pair?;
            count += 1;
        }

        if len > 0 && count == len {
            let mut items = Vec::with_capacity(len);
            for value in table.sequence_values::<Value>() {
                items.push(Self::convert(value?, open)?);
            }
            return Ok(ScriptValue::Sequence(items));
        }

        let mut map = BTreeMap::new();
        for pair in table.pairs::<Value, Value>() {
            let (key, value) = pair?;
            let key = match key {
                Value::String(s) => s.to_str()?.to_string(),
                Value::Integer(i) => i.to_string(),
                Value::Number(n) => n.to_string(),
                Value::Boolean(b) => b.to_string(),
                other => {
                    return Err(mlua::Error::RuntimeError(format!(
                        "a {} key cannot be stored",
                        other.type_name()
                    )))
                }
            };
            map.insert(key, Self::convert(value, open)?);
        }
        Ok(ScriptValue::Mapping(map))
    }

    /// Convert into a Lua value owned by `lua`.
    pub fn to_lua(&self, lua: &Lua) -> LuaResult<Value> {
        Ok(match self {
            ScriptValue::Null => Value::Nil,
            ScriptValue::Boolean(b) => Value::Boolean(*b),
            ScriptValue::Integer(i) => Value::Integer(*i),
            ScriptValue::Float(f) => Value::Number(*f),
            ScriptValue::String(s) => Value::String(lua.create_string(s)?),
            ScriptValue::Sequence(items) => {
                let table = lua.create_table_with_capacity(items.len(), 0)?;
                for (i, item) in items.iter().enumerate() {
                    table.raw_set(i + 1, item.to_lua(lua)?)?;
                }
                Value::Table(table)
            }
            ScriptValue::Mapping(map) => {
                let table = lua.create_table_with_capacity(0, map.len())?;
                for (key, item) in map {
                    table.raw_set(key.as_str(), item.to_lua(lua)?)?;
                }
                Value::Table(table)
            }
        })
    }

    /// Look up a dotted path (`a.b.c`) through nested mappings.
    pub fn get_path(&self, path: &str) -> Option<&ScriptValue> {
        let mut current = self;
        for segment in path.split('.') {
            match current {
                ScriptValue::Mapping(map) => current = map.get(segment)?,
                _ => return None,
            }
        }
        Some(current)
    }

    /// Set a dotted path, creating intermediate mappings and replacing
    /// non-mapping values on the way. Paths longer than [`MAX_DEPTH`]
    /// segments are rejected.
    pub fn set_path(&mut self, path: &str, value: ScriptValue) -> Result<()> {
        if path.split('.').count() > MAX_DEPTH {
            return Err(LuaCordError::TooDeep(format!(
                "path has more than {MAX_DEPTH} segments"
            )));
        }
        let mut segments = path.split('.').peekable();
        let mut current = self;
        while let Some(segment) = segments.next() {
            let map = current.ensure_mapping();
            if segments.peek().is_none() {
                map.insert(segment.to_string(), value);
                break;
            }
            current = map
                .entry(segment.to_string())
                .or_insert_with(ScriptValue::mapping);
        }
        Ok(())
    }

    fn ensure_mapping(&mut self) -> &mut BTreeMap<String, ScriptValue> {
        if !matches!(self, ScriptValue::Mapping(_)) {
            *self = ScriptValue::mapping();
        }
        match self {
            ScriptValue::Mapping(map) => map,
            _ => unreachable!("value was just replaced by a mapping"),
        }
    }

    /// Remove a dotted path. Returns the removed value.
    pub fn remove_path(&mut self, path: &str) -> Option<ScriptValue> {
        let (parent, leaf) = match path.rsplit_once('.') {
            Some((parent, leaf)) => (Some(parent), leaf),
            None => (None, path),
        };
        let target = match parent {
            Some(parent) => self.get_path_mut(parent)?,
            None => self,
        };
        match target {
            ScriptValue::Mapping(map) => map.remove(leaf),
            _ => None,
        }
    }

    fn get_path_mut(&mut self, path: &str) -> Option<&mut ScriptValue> {
        let mut current = self;
        for segment in path.split('.') {
            match current {
                ScriptValue::Mapping(map) => current = map.get_mut(segment)?,
                _ => return None,
            }
        }
        Some(current)
    }
}

impl Default for ScriptValue {
    fn default() -> Self {
        ScriptValue::Null
    }
}

impl fmt::Display for ScriptValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptValue::Null => write!(f, "nil"),
            ScriptValue::Boolean(b) => write!(f, "{b}"),
            ScriptValue::Integer(i) => write!(f, "{i}"),
            ScriptValue::Float(n) => write!(f, "{n}"),
            ScriptValue::String(s) => write!(f, "{s}"),
            ScriptValue::Sequence(items) => write!(f, "[sequence of {}]", items.len()),
            ScriptValue::Mapping(map) => write!(f, "[mapping of {}]", map.len()),
        }
    }
}

impl From<&str> for ScriptValue {
    fn from(s: &str) -> Self {
        ScriptValue::String(s.to_string())
    }
}

impl From<String> for ScriptValue {
    fn from(s: String) -> Self {
        ScriptValue::String(s)
    }
}

impl From<i64> for ScriptValue {
    fn from(i: i64) -> Self {
        ScriptValue::Integer(i)
    }
}

impl From<f64> for ScriptValue {
    fn from(n: f64) -> Self {
        ScriptValue::Float(n)
    }
}

impl From<bool> for ScriptValue {
    fn from(b: bool) -> Self {
        ScriptValue::Boolean(b)
    }
}
