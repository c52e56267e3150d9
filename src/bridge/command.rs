//! Command table and dispatch.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use mlua::{UserData, UserDataMethods};
use tracing::{debug, warn};

use crate::host::{CommandSender, SenderKind};
use crate::{LuaCordError, Result};

/// Sent when the sender lacks the command permission.
pub const ERROR_NO_PERMISSION: &str = "ERROR! No permission.";
/// Sent when fewer arguments than `min_args` were given.
pub const ERROR_MISSING_ARGS: &str = "ERROR! Missing args.";
/// Sent when more arguments than `max_args` were given.
pub const ERROR_TOO_MANY_ARGS: &str = "ERROR! Too many args.";

/// Static shape of a bound command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    /// Primary label, stored lowercase.
    pub name: String,
    pub description: String,
    pub usage: String,
    pub aliases: Vec<String>,
    pub permission: Option<String>,
    pub permission_message: Option<String>,
    pub min_args: usize,
    /// `None` means unbounded.
    pub max_args: Option<usize>,
    pub run_async: bool,
}

impl CommandSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_lowercase(),
            description: String::new(),
            usage: String::new(),
            aliases: Vec::new(),
            permission: None,
            permission_message: None,
            min_args: 0,
            max_args: None,
            run_async: false,
        }
    }
}

/// Something that can run a bound command.
pub trait CommandHandler: Send + Sync {
    fn spec(&self) -> &CommandSpec;

    /// Name of the owning plugin.
    fn owner(&self) -> &str;

    /// Whether the owner currently accepts invocations.
    fn is_available(&self) -> bool;

    fn execute(&self, sender: Arc<dyn CommandSender>, label: &str, args: Vec<String>) -> Result<()>;

    /// Completion candidates, or `None` to use the host default.
    fn tab_complete(
        &self,
        sender: Arc<dyn CommandSender>,
        label: &str,
        args: &[String],
    ) -> Option<Vec<String>>;
}

/// Result of [`CommandMap::dispatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The callback ran to completion on the calling thread.
    Executed,
    /// The callback was handed to a worker thread.
    Dispatched,
    /// No command is bound to the label.
    Unknown,
    /// The owning plugin is not enabled.
    Unavailable,
    NoPermission,
    MissingArgs,
    TooManyArgs,
    /// The callback raised an error.
    Failed(String),
}

/// Split `/label arg1 arg2` into its lowercase label and arguments.
pub fn split_command_line(line: &str) -> (String, Vec<String>) {
    let mut parts = line.trim().trim_start_matches('/').split_whitespace();
    let label = parts.next().unwrap_or_default().to_lowercase();
    (label, parts.map(str::to_string).collect())
}

/// Label → handler table shared by every plugin.
#[derive(Default)]
pub struct CommandMap {
    known: Mutex<BTreeMap<String, Arc<dyn CommandHandler>>>,
}

impl CommandMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Arc<dyn CommandHandler>>> {
        self.known.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bind a handler under its name and aliases.
    ///
    /// `<prefix>:<name>` is always bound. Bare labels already taken by
    /// another plugin are skipped. Returns the labels that were bound.
    pub fn register(&self, prefix: &str, handler: Arc<dyn CommandHandler>) -> Result<Vec<String>> {
        let spec = handler.spec();
        let prefixed = format!("{}:{}", prefix.to_lowercase(), spec.name);
        let mut known = self.lock();

        if known.contains_key(&prefixed) {
            return Err(LuaCordError::HostRegistration(format!(
                "command {prefixed} is already registered"
            )));
        }

        let mut bound = vec![prefixed.clone()];
        known.insert(prefixed, Arc::clone(&handler));

        let labels = std::iter::once(&spec.name).chain(spec.aliases.iter());
        for label in labels {
            let label = label.to_lowercase();
            if known.contains_key(&label) {
                debug!(label = %label, owner = handler.owner(), "Command label already taken");
                continue;
            }
            known.insert(label.clone(), Arc::clone(&handler));
            bound.push(label);
        }
        Ok(bound)
    }

    /// Remove every label bound to the command `name` owned by `owner`.
    pub fn unregister(&self, owner: &str, name: &str) -> Result<usize> {
        let mut known = self.lock();
        let before = known.len();
        known.retain(|_, h| !(h.owner() == owner && h.spec().name == name));
        let removed = before - known.len();
        if removed == 0 {
            return Err(LuaCordError::HostRegistration(format!(
                "command {name} of {owner} is not registered"
            )));
        }
        Ok(removed)
    }

    pub fn contains(&self, label: &str) -> bool {
        self.lock().contains_key(&label.to_lowercase())
    }

    pub fn get(&self, label: &str) -> Option<Arc<dyn CommandHandler>> {
        self.lock().get(&label.to_lowercase()).cloned()
    }

    /// Every bound label.
    pub fn labels(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Run a command line on behalf of `sender`.
    ///
    /// Permission is checked first, then argument bounds. Async commands
    /// return [`CommandOutcome::Dispatched`] immediately.
    pub fn dispatch(&self, sender: Arc<dyn CommandSender>, line: &str) -> CommandOutcome {
        let (label, args) = split_command_line(line);
        let Some(handler) = self.get(&label) else {
            return CommandOutcome::Unknown;
        };
        if !handler.is_available() {
            return CommandOutcome::Unavailable;
        }

        let spec = handler.spec();
        if let Some(permission) = &spec.permission {
            if !sender.has_permission(permission) {
                let message = spec
                    .permission_message
                    .as_deref()
                    .unwrap_or(ERROR_NO_PERMISSION);
                sender.send_message(message);
                return CommandOutcome::NoPermission;
            }
        }

        if spec.max_args.is_some_and(|max| args.len() > max) {
            sender.send_message(ERROR_TOO_MANY_ARGS);
            return CommandOutcome::TooManyArgs;
        }
        if args.len() < spec.min_args {
            sender.send_message(ERROR_MISSING_ARGS);
            return CommandOutcome::MissingArgs;
        }

        if spec.run_async {
            let name = format!("luacord-cmd-{}", spec.name);
            let spawned = thread::Builder::new().name(name).spawn(move || {
                // Failures are recorded by the handler.
                let _ = handler.execute(sender, &label, args);
            });
            return match spawned {
                Ok(_) => CommandOutcome::Dispatched,
                Err(e) => {
                    warn!(error = %e, "Failed to spawn async command worker");
                    CommandOutcome::Failed(e.to_string())
                }
            };
        }

        match handler.execute(sender, &label, args) {
            Ok(()) => CommandOutcome::Executed,
            Err(e) => CommandOutcome::Failed(e.to_string()),
        }
    }

    /// Completion candidates from the bound handler, if it supplies any.
    pub fn completions(
        &self,
        sender: Arc<dyn CommandSender>,
        label: &str,
        args: &[String],
    ) -> Option<Vec<String>> {
        let handler = self.get(label)?;
        if !handler.is_available() {
            return None;
        }
        handler.tab_complete(sender, label, args)
    }
}

/// Script view of a command sender.
pub struct SenderHandle(pub Arc<dyn CommandSender>);

impl UserData for SenderHandle {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("getName", |_, this, ()| Ok(this.0.name()));
        methods.add_method("sendMessage", |_, this, message: String| {
            this.0.send_message(&message);
            Ok(())
        });
        methods.add_method("hasPermission", |_, this, permission: String| {
            Ok(this.0.has_permission(&permission))
        });
        methods.add_method("isPlayer", |_, this, ()| {
            Ok(this.0.kind() == SenderKind::Player)
        });
    }
}

/// Value passed to command callbacks.
pub struct CommandEvent {
    sender: Arc<dyn CommandSender>,
    command: String,
    args: Vec<String>,
}

impl CommandEvent {
    pub fn new(sender: Arc<dyn CommandSender>, command: &str, args: Vec<String>) -> Self {
        Self {
            sender,
            command: command.to_string(),
            args,
        }
    }
}

impl UserData for CommandEvent {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("isPlayerSender", |_, this, ()| {
            Ok(this.sender.kind() == SenderKind::Player)
        });
        methods.add_method("isConsoleSender", |_, this, ()| {
            Ok(this.sender.kind() == SenderKind::Console)
        });
        methods.add_method("isBlockSender", |_, this, ()| {
            Ok(this.sender.kind() == SenderKind::Block)
        });
        methods.add_method("isEntitySender", |_, this, ()| Ok(this.sender.kind().is_entity()));
        methods.add_method("getSender", |_, this, ()| {
            Ok(SenderHandle(Arc::clone(&this.sender)))
        });
        methods.add_method("getArgs", |_, this, ()| Ok(this.args.clone()));
        methods.add_method("getCommand", |_, this, ()| Ok(this.command.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        messages: Mutex<Vec<String>>,
        permissions: Vec<String>,
    }

    impl CommandSender for Recorder {
        fn name(&self) -> String {
            "tester".to_string()
        }

        fn kind(&self) -> SenderKind {
            SenderKind::Player
        }

        fn has_permission(&self, permission: &str) -> bool {
            self.permissions.iter().any(|p| p == permission)
        }

        fn send_message(&self, message: &str) {
            self.messages.lock().unwrap().push(message.to_string());
        }
    }

    struct Counting {
        spec: CommandSpec,
        calls: AtomicUsize,
    }

    impl CommandHandler for Counting {
        fn spec(&self) -> &CommandSpec {
            &self.spec
        }

        fn owner(&self) -> &str {
            "Owner"
        }

        fn is_available(&self) -> bool {
            true
        }

        fn execute(&self, _: Arc<dyn CommandSender>, _: &str, _: Vec<String>) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn tab_complete(
            &self,
            _: Arc<dyn CommandSender>,
            _: &str,
            _: &[String],
        ) -> Option<Vec<String>> {
            None
        }
    }

    fn sender(permissions: &[&str]) -> Arc<Recorder> {
        Arc::new(Recorder {
            messages: Mutex::new(Vec::new()),
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
        })
    }

    fn handler(spec: CommandSpec) -> Arc<Counting> {
        Arc::new(Counting {
            spec,
            calls: AtomicUsize::new(0),
        })
    }

    #[test]
    fn test_split_command_line() {
        let (label, args) = split_command_line("/Warp  home now");
        assert_eq!(label, "warp");
        assert_eq!(args, vec!["home", "now"]);
    }

    #[test]
    fn test_argument_bounds() {
        let map = CommandMap::new();
        let mut spec = CommandSpec::new("warp");
        spec.min_args = 1;
        spec.max_args = Some(1);
        let cmd = handler(spec);
        map.register("owner", cmd.clone()).unwrap();
        let s = sender(&[]);

        assert_eq!(map.dispatch(s.clone(), "warp"), CommandOutcome::MissingArgs);
        assert_eq!(map.dispatch(s.clone(), "warp a b"), CommandOutcome::TooManyArgs);
        assert_eq!(cmd.calls.load(Ordering::SeqCst), 0);

        assert_eq!(map.dispatch(s.clone(), "warp a"), CommandOutcome::Executed);
        assert_eq!(cmd.calls.load(Ordering::SeqCst), 1);

        let messages = s.messages.lock().unwrap();
        assert_eq!(*messages, vec![ERROR_MISSING_ARGS, ERROR_TOO_MANY_ARGS]);
    }

    #[test]
    fn test_permission_checked_first() {
        let map = CommandMap::new();
        let mut spec = CommandSpec::new("ban");
        spec.permission = Some("mod.ban".to_string());
        spec.permission_message = Some("Moderators only".to_string());
        spec.min_args = 1;
        let cmd = handler(spec);
        map.register("owner", cmd.clone()).unwrap();

        let outsider = sender(&[]);
        assert_eq!(map.dispatch(outsider.clone(), "ban"), CommandOutcome::NoPermission);
        assert_eq!(*outsider.messages.lock().unwrap(), vec!["Moderators only"]);

        let moderator = sender(&["mod.ban"]);
        assert_eq!(map.dispatch(moderator, "ban steve"), CommandOutcome::Executed);
        assert_eq!(cmd.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_aliases_and_prefix() {
        let map = CommandMap::new();
        let mut spec = CommandSpec::new("home");
        spec.aliases = vec!["h".to_string()];
        let bound = map.register("Homes", handler(spec)).unwrap();

        assert_eq!(bound, vec!["homes:home", "home", "h"]);
        assert!(map.contains("HOME"));

        let other = handler(CommandSpec::new("home"));
        let bound = map.register("Other", other).unwrap();
        assert_eq!(bound, vec!["other:home"]);
    }

    #[test]
    fn test_unregister() {
        let map = CommandMap::new();
        let mut spec = CommandSpec::new("home");
        spec.aliases = vec!["h".to_string()];
        map.register("owner", handler(spec)).unwrap();

        assert_eq!(map.unregister("Owner", "home").unwrap(), 3);
        assert!(map.labels().is_empty());
        assert!(matches!(
            map.unregister("Owner", "home"),
            Err(LuaCordError::HostRegistration(_))
        ));
    }

    #[test]
    fn test_unknown_command() {
        let map = CommandMap::new();
        assert_eq!(map.dispatch(sender(&[]), "nothing"), CommandOutcome::Unknown);
    }
}
