//! LuaCord - Lua plugin packages for a game server host
//!
//! Discovers script packages, runs each in its own sandboxed Lua state and
//! bridges commands, events, configuration and storage to the host.

pub mod bridge;
pub mod config;
pub mod error;
pub mod error_log;
pub mod host;
pub mod logging;
pub mod package;
pub mod plugin;
pub mod script;
pub mod state;
pub mod value;
pub mod version;

pub use bridge::{CommandOutcome, CommandSpec, Event, EventBus};
pub use config::{Config, LoadMode};
pub use error::{LuaCordError, Result};
pub use error_log::{ErrorLog, ErrorLogEntry};
pub use host::{CommandSender, Host, SenderKind, StandaloneHost};
pub use package::{PackageDescriptor, PackageSource};
pub use plugin::{Loader, PluginConfig, PluginInstance, PluginState, ScanReport};
pub use state::ProcessState;
pub use value::ScriptValue;
pub use version::is_out_of_date;
