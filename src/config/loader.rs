//! Configuration loader with file resolution and environment override support.

use super::error::{ConfigError, ConfigResult};
use super::schema::{Config, LogFormat};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

/// Environment variable prefix for overrides
const ENV_PREFIX: &str = "SPWRAP";

const CONFIG_FILE_NAME: &str = "spwrap.toml";

/// Environment variable for explicit config path
const CONFIG_PATH_ENV: &str = "SPWRAP_CONFIG";

/// Configuration loader with resolution and override logic.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    /// Resolved config file path (if any)
    pub config_path: Option<PathBuf>,
    pub config: Config,
}

impl ConfigLoader {
    /// Load configuration using standard resolution order.
    ///
    /// Resolution priority (highest to lowest):
    /// 1. `SPWRAP_CONFIG` environment variable (explicit path)
    /// 2. `./spwrap.toml`
    /// 3. `spwrap.toml` in the platform config directory
    /// 4. Built-in defaults
    ///
    /// Environment variables override file values, and the result is
    /// validated.
    pub fn load() -> ConfigResult<Self> {
        let config_path = resolve_config_path();

        let mut config = match config_path {
            Some(ref path) => load_from_file(path)?,
            None => Config::default(),
        };

        apply_env_overrides(&mut config)?;
        config.validate()?;

        Ok(Self { config_path, config })
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(ConfigError::NotFound(path));
        }
        let mut config = load_from_file(&path)?;
        apply_env_overrides(&mut config)?;
        config.validate()?;

        Ok(Self {
            config_path: Some(path),
            config,
        })
    }

    /// Create a loader with default configuration (no file).
    pub fn with_defaults() -> Self {
        let mut config = Config::default();
        // Malformed overrides are ignored here; `load` reports them
        if let Err(err) = apply_env_overrides(&mut config) {
            debug!("Ignoring environment override: {}", err);
        }

        Self {
            config_path: None,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn into_config(self) -> Config {
        self.config
    }

    /// Save the current configuration to the file it was loaded from.
    pub fn save(&self) -> ConfigResult<()> {
        let path = self
            .config_path
            .as_ref()
            .ok_or(ConfigError::NoPath)?;

        save_to_file(&self.config, path)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        save_to_file(&self.config, path.as_ref())
    }

    /// Reload configuration from file (if path is set).
    pub fn reload(&mut self) -> ConfigResult<()> {
        if let Some(ref path) = self.config_path {
            let mut config = load_from_file(path)?;
            apply_env_overrides(&mut config)?;
            config.validate()?;
            self.config = config;
        }
        Ok(())
    }
}

/// Resolve the configuration file path using standard locations.
pub fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
        debug!("{} points at missing file {}", CONFIG_PATH_ENV, path.display());
    }

    let cwd_config = PathBuf::from(CONFIG_FILE_NAME);
    if cwd_config.exists() {
        return Some(cwd_config);
    }

    get_default_config_path().filter(|path| path.exists())
}

/// Platform config directory for spwrap, e.g. `~/.config/spwrap`.
pub fn get_default_config_dir() -> Option<PathBuf> {
    ProjectDirs::from("", "", "spwrap").map(|dirs| dirs.config_dir().to_path_buf())
}

pub fn get_default_config_path() -> Option<PathBuf> {
    get_default_config_dir().map(|d| d.join(CONFIG_FILE_NAME))
}

fn load_from_file(path: &Path) -> ConfigResult<Config> {
    debug!("Loading configuration from {}", path.display());
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;

    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn save_to_file(config: &Config, path: &Path) -> ConfigResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
            path: path.to_path_buf(),
            source: e,
        })?;
    }

    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content).map_err(|e| ConfigError::Write {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Read `SPWRAP_<name>`, falling back to a legacy variable.
fn env_value(name: &str, legacy: Option<&str>) -> Option<(String, String)> {
    let var = format!("{ENV_PREFIX}_{name}");
    if let Ok(value) = std::env::var(&var) {
        return Some((var, value));
    }
    let legacy = legacy?;
    std::env::var(legacy).ok().map(|value| (legacy.to_string(), value))
}

fn parse_env<T: FromStr>(var: String, value: &str, what: &str) -> ConfigResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::env(var, format!("Invalid {what}")))
}

/// Apply environment variable overrides to the configuration.
///
/// Variables follow the pattern `SPWRAP_<SECTION>_<KEY>`, for example
/// `SPWRAP_SERIAL_DEFAULT_BAUD=9600` or `SPWRAP_TESTING_PORT=/dev/ttyUSB0`.
/// `TEST_PORT`, `TEST_BAUD`, `TEST_TIMEOUT` and `LOOPBACK_ENABLED` are
/// honoured for the testing section.
fn apply_env_overrides(config: &mut Config) -> ConfigResult<()> {
    if let Some((var, val)) = env_value("SERIAL_DEFAULT_BAUD", None) {
        config.serial.default_baud = parse_env(var, &val, "baud rate")?;
    }
    if let Some((var, val)) = env_value("SERIAL_DEFAULT_TIMEOUT_MS", None) {
        config.serial.default_timeout_ms = parse_env(var, &val, "timeout")?;
    }

    if let Some((_, val)) = env_value("LOGGING_LEVEL", None) {
        config.logging.level = val;
    }
    if let Some((var, val)) = env_value("LOGGING_FORMAT", None) {
        config.logging.format = LogFormat::from_str(&val)
            .map_err(|message| ConfigError::env(var, message))?;
    }

    if let Some((_, val)) = env_value("TESTING_PORT", Some("TEST_PORT")) {
        config.testing.port = Some(val);
    }
    if let Some((var, val)) = env_value("TESTING_BAUD", Some("TEST_BAUD")) {
        config.testing.baud = parse_env(var, &val, "baud rate")?;
    }
    if let Some((var, val)) = env_value("TESTING_TIMEOUT_MS", Some("TEST_TIMEOUT")) {
        config.testing.timeout_ms = parse_env(var, &val, "timeout")?;
    }
    if let Some((_, val)) = env_value("TESTING_LOOPBACK_ENABLED", Some("LOOPBACK_ENABLED")) {
        config.testing.loopback_enabled = val.eq_ignore_ascii_case("true") || val == "1";
    }

    Ok(())
}
