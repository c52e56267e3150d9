//! Host command and event bridge.

mod command;
mod event;

pub use command::{
    split_command_line, CommandEvent, CommandHandler, CommandMap, CommandOutcome, CommandSpec,
    SenderHandle, ERROR_MISSING_ARGS, ERROR_NO_PERMISSION, ERROR_TOO_MANY_ARGS,
};
pub use event::{DispatchReport, Event, EventBus, EventHandle, EventHandler};

/// Raised before a package is loaded. Cancelling it skips the package.
pub const PLUGIN_LOAD_EVENT: &str = "LuaPluginLoadEvent";
/// Raised before a plugin is enabled. Cancelling it keeps the plugin loaded.
pub const PLUGIN_ENABLE_EVENT: &str = "LuaPluginEnableEvent";
/// Raised after a plugin has been disabled.
pub const PLUGIN_DISABLE_EVENT: &str = "LuaPluginDisableEvent";
