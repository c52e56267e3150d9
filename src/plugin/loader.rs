//! Package discovery and lifecycle orchestration.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{debug, error, info, warn};

use super::instance::{PluginInstance, PluginState};
use crate::bridge::{Event, PLUGIN_DISABLE_EVENT, PLUGIN_ENABLE_EVENT, PLUGIN_LOAD_EVENT};
use crate::config::LoadMode;
use crate::package::PackageSource;
use crate::state::ProcessState;
use crate::version::is_out_of_date;
use crate::{LuaCordError, Result};

/// Outcome of a startup scan.
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    /// Names of loaded plugins (file names in delegated mode).
    pub loaded: Vec<String>,
    /// File names of packages that failed to load.
    pub failed: Vec<String>,
    /// File names of packages whose load was cancelled.
    pub skipped: Vec<String>,
    pub elapsed: Duration,
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// Lifecycle manager for script packages.
pub struct Loader {
    state: Arc<ProcessState>,
    pattern: Regex,
}

impl Loader {
    pub fn new(state: Arc<ProcessState>) -> Result<Self> {
        let pattern = Regex::new(&state.config().loader.file_pattern)
            .map_err(|e| LuaCordError::Config(format!("invalid package file pattern: {e}")))?;
        Ok(Self { state, pattern })
    }

    pub fn state(&self) -> &Arc<ProcessState> {
        &self.state
    }

    /// Whether `path` names a package file.
    pub fn is_candidate(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| self.pattern.is_match(n))
    }

    /// Candidate packages in the plugin directory, ordered by file name.
    pub fn candidates(&self) -> Result<Vec<PathBuf>> {
        let dir = PathBuf::from(&self.state.config().loader.plugins_dir);
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
            return Ok(Vec::new());
        }

        let mut candidates = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if self.is_candidate(&path) {
                candidates.push(path);
            }
        }
        candidates.sort_by_key(|p| p.file_name().map(|n| n.to_os_string()));
        Ok(candidates)
    }

    fn record_failure(&self, path: &Path, err: &LuaCordError) {
        error!(package = %file_name(path), error = %err, "Failed to load package");
        // Script errors were recorded at the instance boundary.
        if !matches!(err, LuaCordError::ScriptRuntime { .. }) {
            self.state.error_log().record(err, None);
        }
    }

    /// Load every candidate package.
    ///
    /// In direct mode each package goes through Created -> Loaded; in
    /// delegated mode it is handed to the host. A failing package never
    /// stops the scan.
    pub fn scan(&self) -> ScanReport {
        let start = Instant::now();
        let mut report = ScanReport::default();

        let candidates = match self.candidates() {
            Ok(candidates) => candidates,
            Err(e) => {
                error!(error = %e, "Failed to list the plugin directory");
                self.state.error_log().record(&e, None);
                report.elapsed = start.elapsed();
                return report;
            }
        };

        let mode = self.state.config().loader.mode;
        for path in candidates {
            if self.state.config().debug {
                info!(package = %file_name(&path), ?mode, "Loading package");
            }
            match mode {
                LoadMode::Direct => match self.load_path(&path) {
                    Ok(Some(instance)) => report.loaded.push(instance.name().to_string()),
                    Ok(None) => report.skipped.push(file_name(&path)),
                    Err(e) => {
                        self.record_failure(&path, &e);
                        report.failed.push(file_name(&path));
                    }
                },
                LoadMode::Delegated => match self.state.host().delegate_load(&path) {
                    Ok(()) => report.loaded.push(file_name(&path)),
                    Err(e) => {
                        self.record_failure(&path, &e);
                        report.failed.push(file_name(&path));
                    }
                },
            }
        }

        report.elapsed = start.elapsed();
        info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "Loaded packages in {}ms",
            report.elapsed.as_millis()
        );
        report
    }

    /// Created -> Loaded for one package, then register it.
    ///
    /// Returns `None` when a listener cancelled the load event.
    fn load_path(&self, path: &Path) -> Result<Option<Arc<PluginInstance>>> {
        let event = Event::cancellable(PLUGIN_LOAD_EVENT).with_field("file", file_name(path));
        self.state.host().raise_event(&event);
        if event.is_cancelled() {
            info!(package = %file_name(path), "Package load cancelled");
            return Ok(None);
        }

        let source = PackageSource::open(path)?;
        let instance = Arc::new(PluginInstance::create(source, &self.state)?);
        if self.state.find(instance.name()).is_some() {
            let _ = instance.release();
            return Err(LuaCordError::DuplicatePlugin(instance.name().to_string()));
        }

        if let Err(e) = instance.load() {
            let _ = instance.release();
            return Err(e);
        }

        let mut registry = self.state.registry();
        if registry.iter().any(|p| p.name().eq_ignore_ascii_case(instance.name())) {
            drop(registry);
            let _ = instance.release();
            return Err(LuaCordError::DuplicatePlugin(instance.name().to_string()));
        }
        if let Err(e) = self.state.host().register_plugin(instance.name()) {
            drop(registry);
            let _ = instance.release();
            return Err(e);
        }
        registry.push(Arc::clone(&instance));
        Ok(Some(instance))
    }

    /// Loaded/Disabled -> Enabled, unless a listener cancels the enable
    /// event. Returns whether the instance was enabled.
    pub fn enable(&self, instance: &PluginInstance) -> Result<bool> {
        let event = Event::cancellable(PLUGIN_ENABLE_EVENT).with_field("plugin", instance.name());
        self.state.host().raise_event(&event);
        if event.is_cancelled() {
            info!(plugin = %instance.name(), "Plugin enable cancelled");
            return Ok(false);
        }
        instance.enable()?;
        Ok(true)
    }

    /// Enable every loaded instance in load order. Returns how many were
    /// enabled.
    pub fn enable_all(&self) -> usize {
        let mut enabled = 0;
        for instance in self.state.plugins() {
            if instance.state() != PluginState::Loaded {
                continue;
            }
            match self.enable(&instance) {
                Ok(true) => enabled += 1,
                Ok(false) => {}
                Err(e) => {
                    error!(plugin = %instance.name(), error = %e, "Failed to enable plugin");
                    self.state.error_log().record(&e, Some(instance.name()));
                }
            }
        }
        enabled
    }

    /// Enabled -> Disabled, then announce it.
    pub fn disable(&self, instance: &PluginInstance) -> Result<()> {
        instance.disable()?;
        let event = Event::new(PLUGIN_DISABLE_EVENT).with_field("plugin", instance.name());
        self.state.host().raise_event(&event);
        Ok(())
    }

    /// Disable every enabled instance, most recently loaded first.
    pub fn disable_all(&self) {
        for instance in self.state.plugins().into_iter().rev() {
            if instance.state() != PluginState::Enabled {
                continue;
            }
            if let Err(e) = self.disable(&instance) {
                warn!(plugin = %instance.name(), error = %e, "Failed to disable plugin");
                self.state.error_log().record(&e, Some(instance.name()));
            }
        }
    }

    /// Load and enable one package after startup.
    ///
    /// Returns `None` when the load was cancelled.
    pub fn load_and_enable(&self, path: &Path) -> Result<Option<Arc<PluginInstance>>> {
        let instance = match self.load_path(path) {
            Ok(Some(instance)) => instance,
            Ok(None) => return Ok(None),
            Err(e) => {
                self.record_failure(path, &e);
                return Err(e);
            }
        };
        self.enable(&instance)?;
        Ok(Some(instance))
    }

    /// Write an embedded package archive under the temp directory, then
    /// load and enable it.
    pub fn load_embedded(&self, name: &str, bytes: &[u8]) -> Result<Option<Arc<PluginInstance>>> {
        let file = Path::new(name)
            .file_name()
            .ok_or_else(|| LuaCordError::NotFound(format!("embedded package {name}")))?;
        let dir = PathBuf::from(&self.state.config().loader.temp_dir);
        fs::create_dir_all(&dir)?;
        let path = dir.join(file);
        fs::write(&path, bytes)?;
        debug!(path = %path.display(), "Unpacked embedded package");
        self.load_and_enable(&path)
    }

    /// Disabled -> Unloaded for a developer package.
    ///
    /// The host lookup and the registry are updated under the registry
    /// lock. Archive packages are rejected with
    /// [`LuaCordError::NotUnloadable`].
    pub fn unload(&self, name: &str) -> Result<()> {
        let instance = self
            .state
            .find(name)
            .ok_or_else(|| LuaCordError::NotFound(format!("plugin {name}")))?;
        if !instance.is_dev() {
            return Err(LuaCordError::NotUnloadable(instance.name().to_string()));
        }

        if instance.state() == PluginState::Enabled {
            self.disable(&instance)?;
        }

        {
            let mut registry = self.state.registry();
            if let Err(e) = self.state.host().deregister_plugin(instance.name()) {
                warn!(plugin = %instance.name(), error = %e, "Host deregistration failed");
                self.state.error_log().record(&e, Some(instance.name()));
            }
            registry.retain(|p| !Arc::ptr_eq(p, &instance));
        }

        instance.release()?;
        info!(plugin = %instance.name(), "Plugin unloaded");
        Ok(())
    }

    /// Unload a developer package and load it again from the same path.
    ///
    /// If the fresh load fails nothing stays registered under the name. If
    /// a listener cancels the fresh enable, the new instance stays
    /// registered as `Loaded` and [`LuaCordError::Cancelled`] is returned.
    pub fn reload(&self, name: &str) -> Result<Arc<PluginInstance>> {
        let instance = self
            .state
            .find(name)
            .ok_or_else(|| LuaCordError::NotFound(format!("plugin {name}")))?;
        let path = instance.path().to_path_buf();
        let previous = instance.descriptor().version.clone();
        drop(instance);

        self.unload(name)?;
        let fresh = self
            .load_and_enable(&path)?
            .ok_or_else(|| LuaCordError::Cancelled(format!("reload of {name}")))?;
        if fresh.state() != PluginState::Enabled {
            warn!(plugin = %fresh.name(), "Reloaded plugin was left disabled");
            return Err(LuaCordError::Cancelled(format!("enable of {}", fresh.name())));
        }

        if is_out_of_date(&fresh.descriptor().version, &previous) {
            warn!(
                plugin = %fresh.name(),
                previous = %previous,
                current = %fresh.descriptor().version,
                "Reloaded an older version"
            );
        }
        info!(plugin = %fresh.descriptor().full_name(), "Plugin reloaded");
        Ok(fresh)
    }

    /// Disable everything and release the process state.
    pub fn shutdown(&self) {
        self.disable_all();
        self.state.teardown();
        info!("Loader shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::host::StandaloneHost;
    use tempfile::TempDir;

    fn loader(temp: &TempDir, pattern: Option<&str>) -> Loader {
        let mut config = Config::default();
        config.loader.plugins_dir = temp.path().join("plugins").display().to_string();
        if let Some(pattern) = pattern {
            config.loader.file_pattern = pattern.to_string();
        }
        let state = Arc::new(ProcessState::new(config, Arc::new(StandaloneHost::new())));
        Loader::new(state).unwrap()
    }

    #[test]
    fn test_candidates_are_filtered_and_sorted() {
        let temp = TempDir::new().unwrap();
        let loader = loader(&temp, None);
        let dir = temp.path().join("plugins");
        fs::create_dir_all(dir.join("b.lkt")).unwrap();
        fs::write(dir.join("a.lkt"), b"").unwrap();
        fs::write(dir.join("notes.txt"), b"").unwrap();
        fs::write(dir.join("c.lkt.bak"), b"").unwrap();

        let names: Vec<String> = loader
            .candidates()
            .unwrap()
            .iter()
            .map(|p| file_name(p))
            .collect();
        assert_eq!(names, vec!["a.lkt", "b.lkt"]);
    }

    #[test]
    fn test_missing_plugin_dir_is_created() {
        let temp = TempDir::new().unwrap();
        let loader = loader(&temp, None);

        assert!(loader.candidates().unwrap().is_empty());
        assert!(temp.path().join("plugins").is_dir());
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.loader.plugins_dir = temp.path().display().to_string();
        config.loader.file_pattern = "([".to_string();
        let state = Arc::new(ProcessState::new(config, Arc::new(StandaloneHost::new())));

        assert!(matches!(Loader::new(state), Err(LuaCordError::Config(_))));
    }

    #[test]
    fn test_custom_pattern() {
        let temp = TempDir::new().unwrap();
        let loader = loader(&temp, Some(r"^(.*)\.lua\.zip$"));
        assert!(loader.is_candidate(Path::new("plugins/shop.lua.zip")));
        assert!(!loader.is_candidate(Path::new("plugins/shop.lkt")));
    }

    #[test]
    fn test_unload_unknown_plugin() {
        let temp = TempDir::new().unwrap();
        let loader = loader(&temp, None);
        assert!(matches!(loader.unload("ghost"), Err(LuaCordError::NotFound(_))));
        assert!(matches!(loader.reload("ghost"), Err(LuaCordError::NotFound(_))));
    }
}
