//! Script environments for Lua plugins.
//!
//! Every plugin instance runs in its own Lua state with its own module
//! cache, foreign-object access and bridge objects (`plugin`, `logger`,
//! `config`, `util`).

pub mod api;
pub mod environment;
pub mod foreign;
pub mod require;
pub mod scheduler;
pub mod utilities;

pub use api::{CommandHandle, PluginApi};
pub use environment::{EnvironmentOptions, ResourceLimits, ScriptEnvironment};
pub use foreign::{
    foreign_object, ForeignAccess, ForeignConstructor, ForeignHandle, ForeignObject,
    ForeignTypeHandle, ForeignTypePolicy, ForeignTypeRegistry,
};
pub use require::{normalize_module_path, MODULE_CACHE_KEY};
pub use scheduler::Scheduler;
pub use utilities::Utilities;
