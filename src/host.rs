//! The seam between LuaCord and the game server.
//!
//! A [`Host`] owns the live command table and event bus and provides the
//! few native capabilities the loader depends on (plugin deregistration,
//! delegated loading, default completions, storage backends).
//! [`StandaloneHost`] is a self-contained implementation used by the
//! binary and by tests.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};

use crate::bridge::{
    split_command_line, CommandMap, CommandOutcome, DispatchReport, Event, EventBus,
    PLUGIN_DISABLE_EVENT, PLUGIN_ENABLE_EVENT, PLUGIN_LOAD_EVENT,
};
use crate::plugin::{MemoryStorage, StorageKind, StorageObject};
use crate::script::ForeignTypeRegistry;
use crate::{LuaCordError, Result};

/// What issued a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderKind {
    Player,
    Console,
    Block,
    Entity,
}

impl SenderKind {
    /// Players are entities too.
    pub fn is_entity(self) -> bool {
        matches!(self, SenderKind::Player | SenderKind::Entity)
    }
}

/// Capabilities of a command sender.
pub trait CommandSender: Send + Sync {
    fn name(&self) -> String;
    fn kind(&self) -> SenderKind;
    fn has_permission(&self, permission: &str) -> bool;
    fn send_message(&self, message: &str);
}

/// The game server as seen by the loader and the script bridge.
pub trait Host: Send + Sync {
    fn commands(&self) -> &CommandMap;

    fn events(&self) -> &EventBus;

    fn foreign_types(&self) -> &ForeignTypeRegistry;

    /// Resolve a script-supplied event name to a known event type.
    fn resolve_event(&self, name: &str) -> Option<String>;

    /// Add a plugin to the host's own name lookup.
    fn register_plugin(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    /// Remove a plugin from the host's own registries.
    ///
    /// Called with the process registry locked, so implementations must not
    /// call back into the loader.
    fn deregister_plugin(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    /// Hand a package to the host's native plugin manager.
    fn delegate_load(&self, path: &Path) -> Result<()> {
        Err(LuaCordError::HostRegistration(format!(
            "host cannot load {} natively",
            path.display()
        )))
    }

    /// Completions used when a command supplies none.
    fn default_completions(&self, _sender: &dyn CommandSender, _args: &[String]) -> Vec<String> {
        Vec::new()
    }

    /// Open a storage backend for a file in a plugin's data folder.
    fn open_storage(&self, path: &Path, kind: StorageKind) -> Result<Arc<dyn StorageObject>> {
        Err(LuaCordError::NotFound(format!(
            "{kind} storage backend for {}",
            path.display()
        )))
    }

    /// Run a command line typed by `sender`.
    fn dispatch_command(&self, sender: Arc<dyn CommandSender>, line: &str) -> CommandOutcome {
        self.commands().dispatch(sender, line)
    }

    /// Complete a partially typed command line.
    fn tab_complete(&self, sender: Arc<dyn CommandSender>, line: &str) -> Vec<String> {
        let (label, args) = split_command_line(line);
        match self.commands().completions(Arc::clone(&sender), &label, &args) {
            Some(list) => list,
            None => self.default_completions(sender.as_ref(), &args),
        }
    }

    /// Raise an event on the live bus.
    fn raise_event(&self, event: &Event) -> DispatchReport {
        self.events().raise(event)
    }
}

/// In-process host with no game server behind it.
pub struct StandaloneHost {
    commands: CommandMap,
    events: EventBus,
    foreign_types: ForeignTypeRegistry,
    event_types: Mutex<BTreeSet<String>>,
    plugins: Mutex<Vec<String>>,
    players: Mutex<Vec<String>>,
    delegated: Mutex<Vec<PathBuf>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl StandaloneHost {
    /// Create a host that knows the plugin lifecycle events.
    pub fn new() -> Self {
        let host = Self {
            commands: CommandMap::new(),
            events: EventBus::new(),
            foreign_types: ForeignTypeRegistry::new(),
            event_types: Mutex::new(BTreeSet::new()),
            plugins: Mutex::new(Vec::new()),
            players: Mutex::new(Vec::new()),
            delegated: Mutex::new(Vec::new()),
        };
        for name in [PLUGIN_LOAD_EVENT, PLUGIN_ENABLE_EVENT, PLUGIN_DISABLE_EVENT] {
            host.register_event_type(name);
        }
        host
    }

    /// Make an event type resolvable by scripts. Dotted names can also be
    /// resolved by their last segment.
    pub fn register_event_type(&self, name: &str) {
        lock(&self.event_types).insert(name.to_string());
    }

    /// Names currently in the host plugin lookup.
    pub fn plugin_names(&self) -> Vec<String> {
        lock(&self.plugins).clone()
    }

    /// Mark a player online for default completions.
    pub fn add_player(&self, name: &str) {
        lock(&self.players).push(name.to_string());
    }

    /// Packages handed over through [`Host::delegate_load`].
    pub fn delegated_paths(&self) -> Vec<PathBuf> {
        lock(&self.delegated).clone()
    }
}

impl Default for StandaloneHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for StandaloneHost {
    fn commands(&self) -> &CommandMap {
        &self.commands
    }

    fn events(&self) -> &EventBus {
        &self.events
    }

    fn foreign_types(&self) -> &ForeignTypeRegistry {
        &self.foreign_types
    }

    fn resolve_event(&self, name: &str) -> Option<String> {
        let known = lock(&self.event_types);
        if known.contains(name) {
            return Some(name.to_string());
        }
        known
            .iter()
            .find(|full| full.rsplit('.').next() == Some(name))
            .cloned()
    }

    fn register_plugin(&self, name: &str) -> Result<()> {
        let mut plugins = lock(&self.plugins);
        if plugins.iter().any(|p| p.eq_ignore_ascii_case(name)) {
            return Err(LuaCordError::HostRegistration(format!(
                "{name} is already known to the host"
            )));
        }
        plugins.push(name.to_string());
        Ok(())
    }

    fn deregister_plugin(&self, name: &str) -> Result<()> {
        let mut plugins = lock(&self.plugins);
        let before = plugins.len();
        plugins.retain(|p| !p.eq_ignore_ascii_case(name));
        if plugins.len() == before {
            debug!(plugin = name, "Plugin was not in the host lookup");
        }
        Ok(())
    }

    fn delegate_load(&self, path: &Path) -> Result<()> {
        info!(path = %path.display(), "Delegating package to the host plugin manager");
        lock(&self.delegated).push(path.to_path_buf());
        Ok(())
    }

    fn default_completions(&self, _sender: &dyn CommandSender, args: &[String]) -> Vec<String> {
        let prefix = args.last().map(|s| s.to_lowercase()).unwrap_or_default();
        lock(&self.players)
            .iter()
            .filter(|p| p.to_lowercase().starts_with(&prefix))
            .cloned()
            .collect()
    }

    fn open_storage(&self, path: &Path, kind: StorageKind) -> Result<Arc<dyn StorageObject>> {
        debug!(path = %path.display(), %kind, "Opening in-memory storage");
        Ok(Arc::new(MemoryStorage::new(kind)))
    }
}
