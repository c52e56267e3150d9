//! Configuration module for LuaCord.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use regex::Regex;

use crate::{LuaCordError, Result};

/// How packages are taken through their lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LoadMode {
    /// LuaCord loads and enables every package itself.
    #[default]
    Direct,
    /// Packages are handed to the host's native plugin manager.
    Delegated,
}

/// Package discovery configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoaderConfig {
    /// Directory scanned for packages.
    #[serde(default = "default_plugins_dir")]
    pub plugins_dir: String,
    /// Root of per-plugin data folders (defaults to `plugins_dir`).
    #[serde(default)]
    pub data_dir: Option<String>,
    /// File names matching this pattern are candidate packages.
    #[serde(default = "default_file_pattern")]
    pub file_pattern: String,
    /// Lifecycle ownership.
    #[serde(default)]
    pub mode: LoadMode,
    /// Where embedded packages are unpacked before loading.
    #[serde(default = "default_temp_dir")]
    pub temp_dir: String,
}

fn default_plugins_dir() -> String {
    "plugins".to_string()
}

fn default_file_pattern() -> String {
    r"^(.*)\.lkt$".to_string()
}

fn default_temp_dir() -> String {
    ".luacord-temp".to_string()
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            plugins_dir: default_plugins_dir(),
            data_dir: None,
            file_pattern: default_file_pattern(),
            mode: LoadMode::default(),
            temp_dir: default_temp_dir(),
        }
    }
}

impl LoaderConfig {
    /// Effective data directory.
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(self.data_dir.as_deref().unwrap_or(&self.plugins_dir))
    }
}

/// Script sandbox limits.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptingConfig {
    /// Memory limit per plugin in MB (0 = unlimited).
    #[serde(default)]
    pub max_memory_mb: usize,
    /// Instruction budget per script invocation (0 = unlimited).
    #[serde(default)]
    pub max_instructions: u64,
    /// Globals removed from every environment.
    #[serde(default = "default_restricted_globals")]
    pub restricted_globals: Vec<String>,
}

fn default_restricted_globals() -> Vec<String> {
    vec!["dofile".to_string(), "loadfile".to_string()]
}

impl Default for ScriptingConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: 0,
            max_instructions: 0,
            restricted_globals: default_restricted_globals(),
        }
    }
}

/// Foreign-object construction policy.
#[derive(Debug, Clone, Deserialize)]
pub struct ForeignTypesConfig {
    /// Expansion of the `$` prefix.
    #[serde(default = "default_host_namespace")]
    pub host_namespace: String,
    /// Expansion of the `#` prefix.
    #[serde(default = "default_internal_namespace")]
    pub internal_namespace: String,
    /// Namespaces scripts may construct types from.
    #[serde(default = "default_allowed_prefixes")]
    pub allowed_prefixes: Vec<String>,
}

fn default_host_namespace() -> String {
    "org.bukkit".to_string()
}

fn default_internal_namespace() -> String {
    "luacord.environment".to_string()
}

fn default_allowed_prefixes() -> Vec<String> {
    vec![default_host_namespace(), default_internal_namespace()]
}

impl Default for ForeignTypesConfig {
    fn default() -> Self {
        Self {
            host_namespace: default_host_namespace(),
            internal_namespace: default_internal_namespace(),
            allowed_prefixes: default_allowed_prefixes(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Path to the log file.
    #[serde(default = "default_log_file")]
    pub file: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "logs/luacord.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Verbose loader diagnostics. Does not expose the Lua `debug`
    /// library to scripts.
    #[serde(default)]
    pub debug: bool,
    /// Package discovery.
    #[serde(default)]
    pub loader: LoaderConfig,
    /// Sandbox limits.
    #[serde(default)]
    pub scripting: ScriptingConfig,
    /// Foreign-object policy.
    #[serde(default)]
    pub foreign_types: ForeignTypesConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(LuaCordError::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML file and apply environment variable overrides.
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| LuaCordError::Config(format!("config parse error: {e}")))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - `LUACORD_PLUGINS_DIR`: Override the package directory
    /// - `LUACORD_LOG_LEVEL`: Override the log level
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("LUACORD_PLUGINS_DIR") {
            if !dir.is_empty() {
                self.loader.plugins_dir = dir;
            }
        }
        if let Ok(level) = std::env::var("LUACORD_LOG_LEVEL") {
            if !level.is_empty() {
                self.logging.level = level;
            }
        }
    }

    /// Validate the configuration.
    ///
    /// Returns an error if:
    /// - The package file pattern does not compile
    /// - A foreign namespace is empty
    pub fn validate(&self) -> Result<()> {
        Regex::new(&self.loader.file_pattern).map_err(|e| {
            LuaCordError::Config(format!(
                "loader.file_pattern '{}' is not a valid pattern: {e}",
                self.loader.file_pattern
            ))
        })?;

        if self.foreign_types.host_namespace.trim().is_empty()
            || self.foreign_types.internal_namespace.trim().is_empty()
        {
            return Err(LuaCordError::Config(
                "foreign_types namespaces must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Memory limit in bytes (0 = unlimited).
    pub fn max_memory_bytes(&self) -> usize {
        self.scripting.max_memory_mb * 1024 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert!(!config.debug);
        assert_eq!(config.loader.plugins_dir, "plugins");
        assert_eq!(config.loader.data_dir(), PathBuf::from("plugins"));
        assert_eq!(config.loader.file_pattern, r"^(.*)\.lkt$");
        assert_eq!(config.loader.mode, LoadMode::Direct);
        assert_eq!(config.loader.temp_dir, ".luacord-temp");

        assert_eq!(config.scripting.max_memory_mb, 0);
        assert_eq!(config.scripting.max_instructions, 0);
        assert_eq!(config.scripting.restricted_globals, vec!["dofile", "loadfile"]);

        assert_eq!(config.foreign_types.host_namespace, "org.bukkit");
        assert_eq!(config.foreign_types.internal_namespace, "luacord.environment");
        assert_eq!(
            config.foreign_types.allowed_prefixes,
            vec!["org.bukkit", "luacord.environment"]
        );

        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.file, "logs/luacord.log");
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
debug = true

[loader]
plugins_dir = "server/plugins"
data_dir = "server/data"
file_pattern = '^(.*)\.lua\.zip$'
mode = "delegated"
temp_dir = "tmp"

[scripting]
max_memory_mb = 16
max_instructions = 5000000
restricted_globals = ["dofile", "loadfile", "load"]

[foreign_types]
host_namespace = "net.minecraft"
internal_namespace = "luacord.internal"
allowed_prefixes = ["net.minecraft.world"]

[logging]
level = "debug"
file = "logs/test.log"
"#;

        let config = Config::parse(toml).unwrap();

        assert!(config.debug);
        assert_eq!(config.loader.plugins_dir, "server/plugins");
        assert_eq!(config.loader.data_dir(), PathBuf::from("server/data"));
        assert_eq!(config.loader.file_pattern, r"^(.*)\.lua\.zip$");
        assert_eq!(config.loader.mode, LoadMode::Delegated);
        assert_eq!(config.loader.temp_dir, "tmp");
        assert_eq!(config.scripting.max_memory_mb, 16);
        assert_eq!(config.max_memory_bytes(), 16 * 1024 * 1024);
        assert_eq!(config.scripting.max_instructions, 5_000_000);
        assert_eq!(config.scripting.restricted_globals.len(), 3);
        assert_eq!(config.foreign_types.host_namespace, "net.minecraft");
        assert_eq!(config.foreign_types.allowed_prefixes, vec!["net.minecraft.world"]);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_parse_partial_config() {
        let toml = r#"
[loader]
plugins_dir = "custom"
"#;

        let config = Config::parse(toml).unwrap();

        assert_eq!(config.loader.plugins_dir, "custom");
        assert_eq!(config.loader.data_dir(), PathBuf::from("custom"));
        assert_eq!(config.loader.mode, LoadMode::Direct);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_empty_config() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.loader.plugins_dir, "plugins");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_invalid_config() {
        let toml = "this is not valid toml [[[";
        let result = Config::parse(toml);

        assert!(result.is_err());
        if let Err(LuaCordError::Config(msg)) = result {
            assert!(msg.contains("config parse error"));
        } else {
            panic!("Expected Config error");
        }
    }

    #[test]
    fn test_parse_unknown_mode() {
        let result = Config::parse("[loader]\nmode = \"sideways\"\n");
        assert!(matches!(result, Err(LuaCordError::Config(_))));
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = Config::load("nonexistent.toml");

        assert!(result.is_err());
        assert!(matches!(result, Err(LuaCordError::Io(_))));
    }

    #[test]
    fn test_apply_env_overrides() {
        let original_dir = std::env::var("LUACORD_PLUGINS_DIR").ok();
        let original_level = std::env::var("LUACORD_LOG_LEVEL").ok();

        std::env::set_var("LUACORD_PLUGINS_DIR", "env-plugins");
        std::env::set_var("LUACORD_LOG_LEVEL", "");

        let mut config = Config::default();
        config.logging.level = "warn".to_string();
        config.apply_env_overrides();

        assert_eq!(config.loader.plugins_dir, "env-plugins");
        // Empty values do not override.
        assert_eq!(config.logging.level, "warn");

        match original_dir {
            Some(val) => std::env::set_var("LUACORD_PLUGINS_DIR", val),
            None => std::env::remove_var("LUACORD_PLUGINS_DIR"),
        }
        match original_level {
            Some(val) => std::env::set_var("LUACORD_LOG_LEVEL", val),
            None => std::env::remove_var("LUACORD_LOG_LEVEL"),
        }
    }

    #[test]
    fn test_validate_bad_pattern() {
        let mut config = Config::default();
        config.loader.file_pattern = "([".to_string();

        let result = config.validate();
        assert!(matches!(result, Err(LuaCordError::Config(msg)) if msg.contains("file_pattern")));
    }

    #[test]
    fn test_validate_empty_namespace() {
        let mut config = Config::default();
        config.foreign_types.host_namespace = " ".to_string();
        assert!(config.validate().is_err());
    }
}
