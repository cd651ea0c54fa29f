//! Server Configuration
//!
//! Locates and loads the application configuration.

use kuba_cardinality::config::ApplicationConfig;
use kuba_cardinality::Result;
use std::path::Path;

/// Environment variable naming the configuration file
pub const CONFIG_ENV: &str = "CE_CONFIG";

/// Default configuration file in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "application.toml";

/// Load configuration
///
/// Priority:
/// 1. `--config` path
/// 2. `CE_CONFIG` environment variable
/// 3. `./application.toml`
/// 4. Default configuration with `CE_*` overrides
///
/// An explicitly named file that fails to load is an error; a broken
/// `application.toml` falls back to defaults.
pub fn load_config(cli_path: Option<&Path>) -> Result<(ApplicationConfig, String)> {
    let explicit = cli_path
        .map(|p| p.display().to_string())
        .or_else(|| std::env::var(CONFIG_ENV).ok());

    if let Some(path) = explicit {
        let config = ApplicationConfig::load(&path)?;
        eprintln!("[config] Loaded configuration from: {}", path);
        return Ok((config, path));
    }

    if Path::new(DEFAULT_CONFIG_FILE).exists() {
        match ApplicationConfig::load(DEFAULT_CONFIG_FILE) {
            Ok(config) => {
                eprintln!("[config] Loaded configuration from {}", DEFAULT_CONFIG_FILE);
                return Ok((config, DEFAULT_CONFIG_FILE.to_string()));
            },
            Err(e) => {
                eprintln!(
                    "[config] Failed to parse {}: {}. Using defaults.",
                    DEFAULT_CONFIG_FILE, e
                );
            },
        }
    }

    eprintln!("[config] Using default configuration");
    Ok((ApplicationConfig::from_env()?, "defaults".to_string()))
}
