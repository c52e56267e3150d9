//! One loaded package and its lifecycle state machine.
//!
//! ```text
//! Created -> Loaded -> Enabled <-> Disabled -> Unloaded
//!    \          \
//!     +----------+--> Failed
//! ```

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use mlua::{Function, Lua, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::config::PluginConfig;
use super::storage::{StorageKind, StorageObject};
use crate::bridge::{
    CommandEvent, CommandHandler, CommandSpec, EventHandle, EventHandler, SenderHandle,
};
use crate::error_log::ErrorLog;
use crate::host::{CommandSender, Host};
use crate::package::{PackageDescriptor, PackageSource};
use crate::script::{ForeignTypePolicy, Scheduler, ScriptEnvironment};
use crate::state::ProcessState;
use crate::{LuaCordError, Result};

/// Lifecycle state of a plugin instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    Created,
    Loaded,
    Enabled,
    Disabled,
    Unloaded,
    Failed,
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PluginState::Created => "Created",
            PluginState::Loaded => "Loaded",
            PluginState::Enabled => "Enabled",
            PluginState::Disabled => "Disabled",
            PluginState::Unloaded => "Unloaded",
            PluginState::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Which lifecycle callback a script is registering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Load,
    Enable,
    Disable,
}

impl Lifecycle {
    pub fn as_str(self) -> &'static str {
        match self {
            Lifecycle::Load => "onLoad",
            Lifecycle::Enable => "onEnable",
            Lifecycle::Disable => "onDisable",
        }
    }
}

#[derive(Default)]
struct Callbacks {
    on_load: Option<Function>,
    on_enable: Option<Function>,
    on_disable: Option<Function>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// State shared between an instance, its script bridge and its host
/// bindings.
///
/// Script closures and host bindings hold a `Weak` reference, so dropping
/// the owning [`PluginInstance`] is enough to make them inert.
pub struct InstanceCore {
    id: Uuid,
    descriptor: PackageDescriptor,
    source: Arc<PackageSource>,
    data_folder: PathBuf,
    state: Mutex<PluginState>,
    callbacks: Mutex<Callbacks>,
    commands: Mutex<Vec<Arc<ScriptCommand>>>,
    events: Mutex<Vec<(String, Function)>>,
    naggable: AtomicBool,
    config: Mutex<PluginConfig>,
    storage: Mutex<HashMap<String, Arc<dyn StorageObject>>>,
    scheduler: Mutex<Option<Arc<Scheduler>>>,
    budget: Arc<AtomicU64>,
    error_log: Arc<ErrorLog>,
    host: Arc<dyn Host>,
    foreign_policy: Arc<ForeignTypePolicy>,
}

impl InstanceCore {
    /// Unique id of this instance, used as the event-bus owner key.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &PackageDescriptor {
        &self.descriptor
    }

    pub fn source(&self) -> &Arc<PackageSource> {
        &self.source
    }

    pub fn data_folder(&self) -> &Path {
        &self.data_folder
    }

    pub fn state(&self) -> PluginState {
        *lock(&self.state)
    }

    fn set_state(&self, state: PluginState) {
        *lock(&self.state) = state;
    }

    fn expect_state(&self, action: &'static str, allowed: &[PluginState]) -> Result<PluginState> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(state)
        } else {
            Err(LuaCordError::InvalidTransition {
                plugin: self.name().to_string(),
                action,
                state: state.to_string(),
            })
        }
    }

    /// Whether commands and events may reach script code.
    pub fn is_enabled(&self) -> bool {
        self.state() == PluginState::Enabled
    }

    /// Whether background work started by the script may still run.
    pub fn is_live(&self) -> bool {
        matches!(
            self.state(),
            PluginState::Created | PluginState::Loaded | PluginState::Enabled
        )
    }

    pub fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }

    pub fn error_log(&self) -> &Arc<ErrorLog> {
        &self.error_log
    }

    pub fn foreign_policy(&self) -> &Arc<ForeignTypePolicy> {
        &self.foreign_policy
    }

    /// Instruction counter read by the environment's budget hook.
    pub fn budget(&self) -> &Arc<AtomicU64> {
        &self.budget
    }

    /// Run script code at an instance boundary.
    ///
    /// The instruction budget is reset first. A failure is logged, pushed
    /// to the error log and returned as [`LuaCordError::ScriptRuntime`].
    pub fn guard<R>(&self, context: &str, f: impl FnOnce() -> mlua::Result<R>) -> Result<R> {
        self.budget.store(0, Ordering::SeqCst);
        f().map_err(|e| {
            error!(plugin = %self.name(), context, error = %e, "Script error");
            self.error_log.record(&e, Some(self.name()));
            LuaCordError::script(self.name(), &e)
        })
    }

    /// Record a non-script failure that belongs to this instance.
    pub fn report(&self, err: &LuaCordError) {
        self.error_log.record(err, Some(self.name()));
    }

    pub fn set_callback(&self, which: Lifecycle, callback: Function) {
        let mut callbacks = lock(&self.callbacks);
        let slot = match which {
            Lifecycle::Load => &mut callbacks.on_load,
            Lifecycle::Enable => &mut callbacks.on_enable,
            Lifecycle::Disable => &mut callbacks.on_disable,
        };
        *slot = Some(callback);
    }

    fn callback(&self, which: Lifecycle) -> Option<Function> {
        let callbacks = lock(&self.callbacks);
        match which {
            Lifecycle::Load => callbacks.on_load.clone(),
            Lifecycle::Enable => callbacks.on_enable.clone(),
            Lifecycle::Disable => callbacks.on_disable.clone(),
        }
    }

    fn run_callback(&self, which: Lifecycle) {
        // Failures are already logged by the guard.
        if let Some(callback) = self.callback(which) {
            let _ = self.guard(which.as_str(), || callback.call::<()>(()));
        }
    }

    /// Bind a command and put it into the host command table.
    pub fn add_command(
        self: &Arc<Self>,
        spec: CommandSpec,
        callback: Function,
    ) -> Result<Arc<ScriptCommand>> {
        let command = Arc::new(ScriptCommand {
            spec,
            owner: self.name().to_string(),
            core: Arc::downgrade(self),
            callback: Mutex::new(Some(callback)),
            completer: Mutex::new(None),
        });
        let bound = self
            .host
            .commands()
            .register(self.name(), Arc::clone(&command) as Arc<dyn CommandHandler>)?;
        debug!(plugin = %self.name(), labels = ?bound, "Command bound");
        lock(&self.commands).push(Arc::clone(&command));
        Ok(command)
    }

    /// Names of the commands bound by this instance.
    pub fn command_names(&self) -> Vec<String> {
        lock(&self.commands)
            .iter()
            .map(|c| c.spec.name.clone())
            .collect()
    }

    fn event_handler(self: &Arc<Self>, event_type: &str, callback: Function) -> EventHandler {
        let core = Arc::downgrade(self);
        let context = format!("event {event_type}");
        Arc::new(move |event| {
            let Some(core) = core.upgrade() else {
                return Ok(());
            };
            if !core.is_enabled() {
                return Ok(());
            }
            core.guard(&context, || callback.call::<()>(EventHandle(event.clone())))
        })
    }

    /// Bind a script callback to a host event type.
    ///
    /// The binding goes live immediately when the instance is enabled,
    /// otherwise on the next enable.
    pub fn register_event(self: &Arc<Self>, name: &str, callback: Function) -> Result<()> {
        let event_type = self.host.resolve_event(name).ok_or_else(|| {
            LuaCordError::HostRegistration(format!(
                "There was an issue trying to register the event {name}. \
                 Is it a valid event name and properly capitalized?"
            ))
        })?;

        let mut events = lock(&self.events);
        if self.is_enabled() {
            let handler = self.event_handler(&event_type, callback.clone());
            self.host
                .events()
                .subscribe(self.id, self.name(), &event_type, handler);
        }
        events.push((event_type, callback));
        Ok(())
    }

    /// Number of event bindings registered by the script.
    pub fn event_binding_count(&self) -> usize {
        lock(&self.events).len()
    }

    pub fn is_naggable(&self) -> bool {
        self.naggable.load(Ordering::SeqCst)
    }

    pub fn set_naggable(&self, naggable: bool) {
        self.naggable.store(naggable, Ordering::SeqCst);
    }

    /// Exclusive access to the instance config.
    pub fn config(&self) -> MutexGuard<'_, PluginConfig> {
        lock(&self.config)
    }

    /// Storage object for a data-folder file, opened once per path.
    pub fn storage_object(&self, path: &str) -> Result<Arc<dyn StorageObject>> {
        let kind = StorageKind::from_path(path).ok_or_else(|| {
            LuaCordError::Storage(format!(
                "The provided file {path} for a storage object was not a JSON or YAML file."
            ))
        })?;

        let mut cache = lock(&self.storage);
        if let Some(storage) = cache.get(path) {
            return Ok(Arc::clone(storage));
        }
        let file = self.data_folder.join(path.trim_start_matches('/'));
        let storage = self.host.open_storage(&file, kind)?;
        cache.insert(path.to_string(), Arc::clone(&storage));
        Ok(storage)
    }

    /// Copy a package resource into the data folder, keeping only its file
    /// name. Returns `false` when the package has no such resource.
    pub fn export_resource(&self, path: &str, replace: bool) -> Result<bool> {
        let Some(bytes) = self.source.resource_bytes(path) else {
            warn!(plugin = %self.name(), path, "Cannot export missing resource");
            return Ok(false);
        };
        let file_name = Path::new(path)
            .file_name()
            .ok_or_else(|| LuaCordError::NotFound(format!("resource {path}")))?;
        let target = self.data_folder.join(file_name);

        if target.exists() && !replace {
            debug!(plugin = %self.name(), target = %target.display(), "Resource already exported");
            return Ok(true);
        }
        fs::create_dir_all(&self.data_folder)?;
        fs::write(&target, bytes)?;
        Ok(true)
    }

    /// The instance scheduler, started on first use.
    pub fn scheduler(&self) -> Result<Arc<Scheduler>> {
        let mut slot = lock(&self.scheduler);
        if let Some(scheduler) = slot.as_ref() {
            return Ok(Arc::clone(scheduler));
        }
        if !self.is_live() {
            return Err(LuaCordError::Scheduler(format!(
                "{} is {}",
                self.name(),
                self.state()
            )));
        }
        let scheduler = Arc::new(Scheduler::start(self.name())?);
        *slot = Some(Arc::clone(&scheduler));
        Ok(scheduler)
    }

    fn shutdown_scheduler(&self) {
        if let Some(scheduler) = lock(&self.scheduler).take() {
            scheduler.shutdown();
        }
    }

    fn bind_commands(&self) {
        let commands = lock(&self.commands).clone();
        for command in commands {
            let prefixed = format!("{}:{}", self.name().to_lowercase(), command.spec.name);
            if self.host.commands().contains(&prefixed) {
                continue;
            }
            if let Err(e) = self.host.commands().register(self.name(), command) {
                warn!(plugin = %self.name(), error = %e, "Failed to bind command");
                self.report(&e);
            }
        }
    }

    fn unbind_commands(&self, quiet: bool) {
        let names = self.command_names();
        for name in names {
            match self.host.commands().unregister(self.name(), &name) {
                Ok(removed) => debug!(plugin = %self.name(), command = %name, removed, "Command unbound"),
                Err(e) if quiet => debug!(plugin = %self.name(), error = %e, "Command was not bound"),
                Err(e) => {
                    warn!(plugin = %self.name(), error = %e, "Failed to unbind command");
                    self.report(&e);
                }
            }
        }
    }
}

/// A command bound from script code.
pub struct ScriptCommand {
    spec: CommandSpec,
    owner: String,
    core: Weak<InstanceCore>,
    callback: Mutex<Option<Function>>,
    completer: Mutex<Option<Function>>,
}

impl ScriptCommand {
    /// Install the tab-completion callback.
    pub fn set_completer(&self, completer: Function) {
        *lock(&self.completer) = Some(completer);
    }

    fn clear(&self) {
        lock(&self.callback).take();
        lock(&self.completer).take();
    }

    fn live_core(&self) -> Result<Arc<InstanceCore>> {
        let core = self
            .core
            .upgrade()
            .ok_or_else(|| LuaCordError::NotFound(format!("plugin {}", self.owner)))?;
        core.expect_state("run commands", &[PluginState::Enabled])?;
        Ok(core)
    }
}

impl CommandHandler for ScriptCommand {
    fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    fn owner(&self) -> &str {
        &self.owner
    }

    fn is_available(&self) -> bool {
        self.core.upgrade().is_some_and(|core| core.is_enabled())
    }

    fn execute(&self, sender: Arc<dyn CommandSender>, label: &str, args: Vec<String>) -> Result<()> {
        let core = self.live_core()?;
        let Some(callback) = lock(&self.callback).clone() else {
            return Err(LuaCordError::NotFound(format!("command {}", self.spec.name)));
        };
        let context = format!("command /{}", self.spec.name);
        core.guard(&context, || {
            callback.call::<()>(CommandEvent::new(sender, label, args))
        })
    }

    fn tab_complete(
        &self,
        sender: Arc<dyn CommandSender>,
        label: &str,
        args: &[String],
    ) -> Option<Vec<String>> {
        let core = self.live_core().ok()?;
        let completer = lock(&self.completer).clone()?;
        let context = format!("tab completion /{}", self.spec.name);
        let value = core
            .guard(&context, || {
                completer.call::<Value>((SenderHandle(sender), label.to_string(), args.to_vec()))
            })
            .ok()?;

        let Value::Table(table) = value else {
            return None;
        };
        table
            .sequence_values::<String>()
            .collect::<mlua::Result<Vec<_>>>()
            .ok()
    }
}

/// One loaded package with its script environment.
pub struct PluginInstance {
    core: Arc<InstanceCore>,
    environment: Mutex<Option<ScriptEnvironment>>,
}

impl PluginInstance {
    /// Parse the package, load its config and build its environment.
    pub fn create(source: PackageSource, state: &ProcessState) -> Result<Self> {
        let descriptor = source.read_descriptor()?;
        let data_folder = state.config().loader.data_dir().join(&descriptor.name);

        let config = match PluginConfig::open(&data_folder, &source) {
            Ok(config) => config,
            Err(e) => {
                error!(plugin = %descriptor.name, error = %e, "Failed to load config");
                state.error_log().record(&e, Some(&descriptor.name));
                PluginConfig::empty(&data_folder)
            }
        };

        let core = Arc::new(InstanceCore {
            id: Uuid::new_v4(),
            descriptor,
            source: Arc::new(source),
            data_folder,
            state: Mutex::new(PluginState::Created),
            callbacks: Mutex::new(Callbacks::default()),
            commands: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            naggable: AtomicBool::new(true),
            config: Mutex::new(config),
            storage: Mutex::new(HashMap::new()),
            scheduler: Mutex::new(None),
            budget: Arc::new(AtomicU64::new(0)),
            error_log: Arc::clone(state.error_log()),
            host: Arc::clone(state.host()),
            foreign_policy: Arc::clone(state.foreign_policy()),
        });

        let environment = ScriptEnvironment::build(&core, state.environment_options())?;
        debug!(plugin = %core.name(), id = %core.id, "Instance created");
        Ok(Self {
            core,
            environment: Mutex::new(Some(environment)),
        })
    }

    pub fn core(&self) -> &Arc<InstanceCore> {
        &self.core
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn descriptor(&self) -> &PackageDescriptor {
        self.core.descriptor()
    }

    pub fn state(&self) -> PluginState {
        self.core.state()
    }

    pub fn is_dev(&self) -> bool {
        self.core.source.is_dev()
    }

    /// Location of the backing package.
    pub fn path(&self) -> &Path {
        self.core.source.path()
    }

    /// Handle to the script state, if the environment is still alive.
    pub fn lua(&self) -> Option<Lua> {
        lock(&self.environment).as_ref().map(|env| env.lua().clone())
    }

    /// Look up a script global. Intended for diagnostics and tests.
    pub fn global<T: mlua::FromLua>(&self, name: &str) -> Option<T> {
        self.lua()?.globals().get::<T>(name).ok()
    }

    /// Created -> Loaded: evaluate the entry script, then run `onLoad`.
    ///
    /// An entry-script failure moves the instance to `Failed`. An `onLoad`
    /// failure is only logged.
    pub fn load(&self) -> Result<()> {
        self.core.expect_state("load", &[PluginState::Created])?;
        let main = self.core.descriptor.main.clone();

        let result = match (self.core.source.resource_bytes(&main), self.lua()) {
            (Some(chunk), Some(lua)) => self.core.guard(&main, || {
                lua.load(chunk).set_name(format!("@{main}")).exec()
            }),
            (None, _) => Err(LuaCordError::Descriptor(format!(
                "entry script {main} is missing from the package"
            ))),
            (_, None) => Err(LuaCordError::InvalidTransition {
                plugin: self.name().to_string(),
                action: "load",
                state: "released".to_string(),
            }),
        };
        if let Err(e) = result {
            self.core.set_state(PluginState::Failed);
            return Err(e);
        }

        self.core.set_state(PluginState::Loaded);
        self.core.run_callback(Lifecycle::Load);
        info!(plugin = %self.descriptor().full_name(), "Plugin loaded");
        Ok(())
    }

    /// Loaded/Disabled -> Enabled: run `onEnable`, then bind commands and
    /// install every event binding registered so far.
    pub fn enable(&self) -> Result<()> {
        self.core
            .expect_state("enable", &[PluginState::Loaded, PluginState::Disabled])?;
        self.core.run_callback(Lifecycle::Enable);

        {
            let events = lock(&self.core.events);
            self.core.set_state(PluginState::Enabled);
            for (event_type, callback) in events.iter() {
                let handler = self.core.event_handler(event_type, callback.clone());
                self.core
                    .host
                    .events()
                    .subscribe(self.core.id, self.name(), event_type, handler);
            }
        }
        self.core.bind_commands();

        info!(plugin = %self.descriptor().full_name(), "Plugin enabled");
        Ok(())
    }

    /// Enabled -> Disabled: run `onDisable`, remove every host binding and
    /// stop the scheduler.
    pub fn disable(&self) -> Result<()> {
        self.core.expect_state("disable", &[PluginState::Enabled])?;
        {
            let _events = lock(&self.core.events);
            self.core.set_state(PluginState::Disabled);
        }
        self.core.run_callback(Lifecycle::Disable);

        let removed = self.core.host.events().unsubscribe_owner(self.core.id);
        self.core.unbind_commands(false);
        self.core.shutdown_scheduler();

        info!(plugin = %self.name(), listeners = removed, "Plugin disabled");
        Ok(())
    }

    /// Drop every binding and the script environment. The instance ends in
    /// `Unloaded` and can never run again.
    pub fn release(&self) -> Result<()> {
        let state = self.core.expect_state(
            "release",
            &[
                PluginState::Created,
                PluginState::Loaded,
                PluginState::Disabled,
                PluginState::Failed,
            ],
        )?;
        if state != PluginState::Disabled {
            // Commands are bound as soon as the script adds them.
            self.core.unbind_commands(true);
        }
        self.core.set_state(PluginState::Unloaded);
        self.core.shutdown_scheduler();

        *lock(&self.core.callbacks) = Callbacks::default();
        for command in lock(&self.core.commands).drain(..) {
            command.clear();
        }
        lock(&self.core.events).clear();
        lock(&self.core.storage).clear();

        if let Some(environment) = lock(&self.environment).take() {
            environment.release();
        }
        debug!(plugin = %self.name(), "Instance released");
        Ok(())
    }
}

impl fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginInstance")
            .field("name", &self.name())
            .field("state", &self.state())
            .field("path", &self.path())
            .finish()
    }
}
