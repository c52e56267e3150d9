//! Per-instance Lua state with sandboxing.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use mlua::{HookTriggers, Lua, Value, VmState};
use tracing::debug;

use super::api::PluginApi;
use super::foreign::ForeignAccess;
use super::require::{clear_module_cache, install_module_cache, install_require};
use super::utilities::Utilities;
use crate::config::Config;
use crate::plugin::InstanceCore;
use crate::{LuaCordError, Result};

/// Instructions between two budget checks.
const BUDGET_CHECK_INTERVAL: u32 = 1_000;

/// Resource limits for script execution.
#[derive(Debug, Clone, Default)]
pub struct ResourceLimits {
    /// Maximum number of instructions per invocation (0 = unlimited).
    pub max_instructions: u64,
    /// Maximum memory in bytes (0 = unlimited).
    pub max_memory: usize,
}

/// Settings applied to every environment the factory builds.
#[derive(Debug, Clone)]
pub struct EnvironmentOptions {
    pub limits: ResourceLimits,
    /// Globals removed before any script runs.
    pub restricted_globals: Vec<String>,
}

impl EnvironmentOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            limits: ResourceLimits {
                max_instructions: config.scripting.max_instructions,
                max_memory: config.max_memory_bytes(),
            },
            restricted_globals: config.scripting.restricted_globals.clone(),
        }
    }
}

impl Default for EnvironmentOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// The isolated global namespace of one plugin instance.
pub struct ScriptEnvironment {
    lua: Lua,
}

impl ScriptEnvironment {
    /// Build a fresh environment for `core`.
    ///
    /// Installs, in order: resource limits, the module cache with
    /// `require_local`/`require`, `import`/`newInstance`, then the
    /// `plugin`, `logger`, `config` and `util` bridge objects.
    pub fn build(core: &Arc<InstanceCore>, options: &EnvironmentOptions) -> Result<Self> {
        let lua = Lua::new();
        let name = core.name().to_string();
        let wrap = |e: mlua::Error| LuaCordError::script(&name, &e);

        if options.limits.max_memory > 0 {
            lua.set_memory_limit(options.limits.max_memory).map_err(wrap)?;
        }

        let limit = options.limits.max_instructions;
        if limit > 0 {
            let count = Arc::clone(core.budget());
            lua.set_hook(
                HookTriggers::new().every_nth_instruction(BUDGET_CHECK_INTERVAL),
                move |_lua, _debug| {
                    let current = count.fetch_add(u64::from(BUDGET_CHECK_INTERVAL), Ordering::SeqCst)
                        + u64::from(BUDGET_CHECK_INTERVAL);
                    if current > limit {
                        Err(mlua::Error::RuntimeError(
                            "Script exceeded instruction limit".to_string(),
                        ))
                    } else {
                        Ok(VmState::Continue)
                    }
                },
            );
        }

        let globals = lua.globals();
        for global in &options.restricted_globals {
            globals.set(global.as_str(), Value::Nil).map_err(wrap)?;
        }

        install_module_cache(&lua).map_err(wrap)?;
        install_require(&lua, Arc::clone(core.source())).map_err(wrap)?;

        let foreign = ForeignAccess::new(
            core.name(),
            Arc::clone(core.host()),
            Arc::clone(core.foreign_policy()),
            Arc::clone(core.error_log()),
        );
        foreign.register(&lua).map_err(wrap)?;
        PluginApi::new(core).register(&lua).map_err(wrap)?;
        Utilities::new(core, foreign).register(&lua).map_err(wrap)?;

        debug!(plugin = %name, "Script environment built");
        Ok(Self { lua })
    }

    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    /// Clear the module cache and drop the namespace.
    pub fn release(self) {
        // Best effort; the state is dropped either way.
        let _ = clear_module_cache(&self.lua);
        self.lua.remove_hook();
        drop(self.lua);
    }
}
