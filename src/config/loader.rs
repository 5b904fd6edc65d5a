//! Configuration Loader
//!
//! Layers configuration sources in a fixed order: built-in defaults, an
//! optional TOML file, then `CYCLE_`-prefixed environment variables using `__`
//! as the section separator (for example `CYCLE_HEALTH__HEARTBEAT_TIMEOUT_SECONDS`).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use super::error::{ConfigResult, ConfigurationError};
use super::CycleConfig;

const ENV_PREFIX: &str = "CYCLE";

/// Loaded, validated configuration plus where it came from
#[derive(Debug)]
pub struct ConfigManager {
    config: CycleConfig,
    source_file: Option<PathBuf>,
    environment: String,
}

impl ConfigManager {
    /// Load configuration from an optional file and the process environment
    pub fn load(path: Option<&Path>) -> ConfigResult<Arc<ConfigManager>> {
        Self::load_with_options(path, true)
    }

    /// Load configuration from an optional file only, ignoring the environment.
    /// Useful for tests that must not be affected by the host's variables.
    pub fn load_from_file(path: Option<&Path>) -> ConfigResult<Arc<ConfigManager>> {
        Self::load_with_options(path, false)
    }

    fn load_with_options(path: Option<&Path>, include_env: bool) -> ConfigResult<Arc<ConfigManager>> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            if !path.is_file() {
                return Err(ConfigurationError::ConfigFileNotFound(path.to_path_buf()));
            }
            debug!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        if include_env {
            builder = builder.add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("orchestrator.modules"),
            );
        }

        let config: CycleConfig = builder.build()?.try_deserialize()?;
        config.validate()?;

        let environment = Self::detect_environment();
        info!(
            environment = %environment,
            source = ?path.map(|p| p.display().to_string()),
            modules = ?config.orchestrator.modules,
            database = ?config.database.sanitized_url(),
            "Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            source_file: path.map(Path::to_path_buf),
            environment,
        }))
    }

    /// Wrap an already-built configuration after validating it
    pub fn from_config(config: CycleConfig) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            source_file: None,
            environment: Self::detect_environment(),
        }))
    }

    pub fn config(&self) -> &CycleConfig {
        &self.config
    }

    pub fn source_file(&self) -> Option<&Path> {
        self.source_file.as_deref()
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Configuration as JSON with the database URL masked
    pub fn debug_config(&self) -> serde_json::Value {
        let mut value = serde_json::json!(self.config);
        if let Some(database) = value.get_mut("database") {
            database["url"] = serde_json::json!(self.config.database.sanitized_url());
        }
        value
    }

    pub(crate) fn detect_environment() -> String {
        std::env::var("CYCLE_ENV")
            .or_else(|_| std::env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
    }
}
