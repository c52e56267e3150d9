//! Process-wide state shared by every component.
//!
//! One [`ProcessState`] is built at host startup and handed to the loader
//! and to every plugin instance. [`ProcessState::teardown`] at host
//! shutdown releases every instance; nothing survives a restart.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::config::Config;
use crate::error_log::ErrorLog;
use crate::host::Host;
use crate::plugin::{PluginInstance, PluginState};
use crate::script::{EnvironmentOptions, ForeignTypePolicy};

/// Shared services plus the registry of loaded instances.
pub struct ProcessState {
    config: Config,
    host: Arc<dyn Host>,
    error_log: Arc<ErrorLog>,
    foreign_policy: Arc<ForeignTypePolicy>,
    environment_options: EnvironmentOptions,
    registry: Mutex<Vec<Arc<PluginInstance>>>,
}

impl ProcessState {
    pub fn new(config: Config, host: Arc<dyn Host>) -> Self {
        let foreign_policy = Arc::new(ForeignTypePolicy::new(&config.foreign_types));
        let environment_options = EnvironmentOptions::from_config(&config);
        Self {
            config,
            host,
            error_log: Arc::new(ErrorLog::new()),
            foreign_policy,
            environment_options,
            registry: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
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

    pub fn environment_options(&self) -> &EnvironmentOptions {
        &self.environment_options
    }

    /// The registry lock. Host deregistration during unload happens while
    /// this is held.
    pub(crate) fn registry(&self) -> MutexGuard<'_, Vec<Arc<PluginInstance>>> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registered instances in load order.
    pub fn plugins(&self) -> Vec<Arc<PluginInstance>> {
        self.registry().clone()
    }

    /// Find an instance by case-insensitive name.
    pub fn find(&self, name: &str) -> Option<Arc<PluginInstance>> {
        self.registry()
            .iter()
            .find(|p| p.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Release every instance and empty the registry.
    ///
    /// Enabled instances are disabled first, most recently loaded first.
    pub fn teardown(&self) {
        let instances: Vec<_> = self.registry().drain(..).rev().collect();
        for instance in instances {
            if instance.state() == PluginState::Enabled {
                if let Err(e) = instance.disable() {
                    warn!(plugin = %instance.name(), error = %e, "Failed to disable during teardown");
                }
            }
            if let Err(e) = instance.release() {
                warn!(plugin = %instance.name(), error = %e, "Failed to release during teardown");
            }
        }
        debug!("Process state torn down");
    }
}
