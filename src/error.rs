//! Error types for LuaCord.

use thiserror::Error;

/// Common error type for LuaCord.
#[derive(Error, Debug)]
pub enum LuaCordError {
    /// The package manifest is missing, unparseable or incomplete.
    #[error("invalid plugin descriptor: {0}")]
    Descriptor(String),

    /// A `require` target does not exist in the package.
    #[error("module not found: {0}")]
    ModuleNotFound(String),

    /// Script code raised an error.
    ///
    /// Always caught at the nearest instance boundary; never propagated to
    /// the host or to sibling instances.
    #[error("script error in {plugin}: {message}")]
    ScriptRuntime { plugin: String, message: String },

    /// A foreign-object construction request named a disallowed type.
    #[error("invalid foreign type: {0}")]
    InvalidForeignType(String),

    /// The persisted instance config could not be loaded.
    #[error("config load error: {0}")]
    ConfigLoad(String),

    /// Failure adding or removing a binding from the host tables.
    #[error("host registration error: {0}")]
    HostRegistration(String),

    /// Unload or reload was requested for a non-developer package.
    #[error("{0} cannot be unloaded; restart the host instead")]
    NotUnloadable(String),

    /// A lifecycle transition that the state machine does not allow.
    #[error("{plugin}: cannot {action} while {state}")]
    InvalidTransition {
        plugin: String,
        action: &'static str,
        state: String,
    },

    /// Resource not found.
    #[error("{0} not found")]
    NotFound(String),

    /// A plugin with the same (case-insensitive) name is already registered.
    #[error("a plugin named {0} is already loaded")]
    DuplicatePlugin(String),

    /// A listener cancelled a load or enable event.
    #[error("{0} was cancelled by a listener")]
    Cancelled(String),

    /// The per-instance scheduler rejected or lost a job.
    #[error("scheduler error: {0}")]
    Scheduler(String),

    /// A storage object was requested for an unsupported file.
    #[error("storage error: {0}")]
    Storage(String),

    /// A value or dotted path exceeds the nesting limit.
    #[error("value nested too deeply: {0}")]
    TooDeep(String),

    /// Host configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LuaCordError {
    /// Wrap a Lua error raised while running code owned by `plugin`.
    pub fn script(plugin: &str, err: &mlua::Error) -> Self {
        LuaCordError::ScriptRuntime {
            plugin: plugin.to_string(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for LuaCord operations.
pub type Result<T> = std::result::Result<T, LuaCordError>;
