//! Plugin instances, their persisted state and the lifecycle manager.

mod config;
mod instance;
mod loader;
mod storage;

pub use config::{PluginConfig, BROKEN_CONFIG_FILE, CONFIG_FILE};
pub use instance::{InstanceCore, Lifecycle, PluginInstance, PluginState, ScriptCommand};
pub use loader::{Loader, ScanReport};
pub use storage::{MemoryStorage, StorageHandle, StorageKind, StorageObject};
