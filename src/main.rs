use std::sync::Arc;

use tracing::{error, info};

use luacord::{Config, Loader, ProcessState, StandaloneHost};

fn main() {
    // Load configuration
    let config = match Config::load_with_env("config.toml") {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config.toml: {e}");
            eprintln!("Using default configuration.");
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        }
    };

    // Initialize logging
    if let Err(e) = luacord::logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        // Fall back to console-only logging
        luacord::logging::init_console_only(&config.logging.level);
    }

    if let Err(e) = config.validate() {
        error!("{e}");
        std::process::exit(1);
    }

    info!("LuaCord - Lua plugin host");
    info!(
        "Loading packages from {} ({:?} mode)",
        config.loader.plugins_dir, config.loader.mode
    );

    let state = Arc::new(ProcessState::new(config, Arc::new(StandaloneHost::new())));
    let loader = match Loader::new(Arc::clone(&state)) {
        Ok(loader) => loader,
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    let report = loader.scan();
    let enabled = loader.enable_all();
    info!(enabled, failed = report.failed.len(), "Startup complete");

    for plugin in state.plugins() {
        let descriptor = plugin.descriptor();
        match &descriptor.description {
            Some(description) => info!("{} - {}", descriptor.full_name(), description),
            None => info!("{}", descriptor.full_name()),
        }
    }
    if let Some(errors) = state.error_log().errors() {
        for entry in errors {
            error!(plugin = ?entry.plugin, causes = ?entry.causes, "{}", entry.message);
        }
    }

    loader.shutdown();
}
