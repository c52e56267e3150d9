//! Host event values and the listener bus.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use mlua::{UserData, UserDataMethods, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::value::ScriptValue;
use crate::Result;

#[derive(Debug)]
struct EventData {
    name: String,
    fields: BTreeMap<String, ScriptValue>,
    cancellable: bool,
    cancelled: bool,
}

/// An event raised by the host.
///
/// Clones share state, so a listener that sets a field or cancels the
/// event is visible to the raiser and to later listeners.
#[derive(Debug, Clone)]
pub struct Event {
    inner: Arc<Mutex<EventData>>,
}

impl Event {
    /// Create a non-cancellable event of the given type.
    pub fn new(name: impl Into<String>) -> Self {
        Self::build(name.into(), false)
    }

    /// Create an event listeners may cancel.
    pub fn cancellable(name: impl Into<String>) -> Self {
        Self::build(name.into(), true)
    }

    fn build(name: String, cancellable: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(EventData {
                name,
                fields: BTreeMap::new(),
                cancellable,
                cancelled: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EventData> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attach a field.
    pub fn with_field(self, key: &str, value: impl Into<ScriptValue>) -> Self {
        self.set_field(key, value.into());
        self
    }

    /// Event type name.
    pub fn name(&self) -> String {
        self.lock().name.clone()
    }

    pub fn field(&self, key: &str) -> Option<ScriptValue> {
        self.lock().fields.get(key).cloned()
    }

    pub fn set_field(&self, key: &str, value: ScriptValue) {
        self.lock().fields.insert(key.to_string(), value);
    }

    pub fn is_cancellable(&self) -> bool {
        self.lock().cancellable
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// Cancel or un-cancel. Ignored for non-cancellable events.
    pub fn set_cancelled(&self, cancelled: bool) {
        let mut data = self.lock();
        if data.cancellable {
            data.cancelled = cancelled;
        }
    }
}

/// Script view of an [`Event`].
pub struct EventHandle(pub Event);

impl UserData for EventHandle {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("getEventName", |_, this, ()| Ok(this.0.name()));

        methods.add_method("get", |lua, this, key: String| match this.0.field(&key) {
            Some(value) => value.to_lua(lua),
            None => Ok(Value::Nil),
        });

        methods.add_method("set", |_, this, (key, value): (String, Value)| {
            this.0.set_field(&key, ScriptValue::from_lua(value)?);
            Ok(())
        });

        methods.add_method("isCancellable", |_, this, ()| Ok(this.0.is_cancellable()));
        methods.add_method("isCancelled", |_, this, ()| Ok(this.0.is_cancelled()));
        methods.add_method("setCancelled", |_, this, cancelled: bool| {
            this.0.set_cancelled(cancelled);
            Ok(())
        });
    }
}

/// Listener callback. Errors are reported by the bus and never stop
/// dispatch to later listeners.
pub type EventHandler = Arc<dyn Fn(&Event) -> Result<()> + Send + Sync>;

struct Listener {
    owner: Uuid,
    plugin: String,
    event_type: String,
    handler: EventHandler,
}

/// Outcome of one [`EventBus::raise`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Listeners that were called.
    pub invoked: usize,
    /// Listeners that returned an error.
    pub failed: usize,
}

/// Ordered registry of event listeners.
#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<Vec<Listener>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Listener>> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a listener for `event_type`.
    pub fn subscribe(&self, owner: Uuid, plugin: &str, event_type: &str, handler: EventHandler) {
        debug!(plugin, event_type, "Subscribing event listener");
        self.lock().push(Listener {
            owner,
            plugin: plugin.to_string(),
            event_type: event_type.to_string(),
            handler,
        });
    }

    /// Remove every listener registered by `owner`. Returns how many were
    /// removed.
    pub fn unsubscribe_owner(&self, owner: Uuid) -> usize {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|l| l.owner != owner);
        before - listeners.len()
    }

    /// Listeners registered for `event_type`.
    pub fn listener_count(&self, event_type: &str) -> usize {
        self.lock()
            .iter()
            .filter(|l| l.event_type == event_type)
            .count()
    }

    /// Listeners registered by `owner`.
    pub fn owner_listener_count(&self, owner: Uuid) -> usize {
        self.lock().iter().filter(|l| l.owner == owner).count()
    }

    /// Deliver `event` to every listener of its type in registration order.
    ///
    /// The listener list is snapshotted first, so handlers may subscribe or
    /// unsubscribe without deadlocking; changes apply to the next raise.
    pub fn raise(&self, event: &Event) -> DispatchReport {
        let event_type = event.name();
        let targets: Vec<(String, EventHandler)> = self
            .lock()
            .iter()
            .filter(|l| l.event_type == event_type)
            .map(|l| (l.plugin.clone(), Arc::clone(&l.handler)))
            .collect();

        let mut report = DispatchReport::default();
        for (plugin, handler) in targets {
            report.invoked += 1;
            if let Err(e) = handler(event) {
                report.failed += 1;
                warn!(plugin = %plugin, event = %event_type, error = %e, "Event listener failed");
            }
        }
        report
    }
}
