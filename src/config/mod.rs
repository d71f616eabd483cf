//! Application settings for the `spwrap` binary and hardware tests.
//!
//! Settings are TOML with environment variable overrides.
//!
//! # Configuration Resolution
//!
//! 1. `SPWRAP_CONFIG` environment variable (explicit path)
//! 2. `./spwrap.toml` (current directory)
//! 3. `spwrap.toml` in the platform config directory
//!    (`~/.config/spwrap/` on Linux, `%APPDATA%\spwrap\config\` on Windows)
//! 4. Built-in defaults (no file required)
//!
//! # Environment Overrides
//!
//! The pattern is `SPWRAP_<SECTION>_<KEY>`:
//! - `SPWRAP_SERIAL_DEFAULT_BAUD=9600`
//! - `SPWRAP_LOGGING_FORMAT=json`
//! - `SPWRAP_TESTING_PORT=/dev/ttyUSB0`
//!
//! `TEST_PORT`, `TEST_BAUD`, `TEST_TIMEOUT` and `LOOPBACK_ENABLED` also feed
//! the `[testing]` section.
//!
//! # Example
//!
//! ```no_run
//! use spwrap::config::ConfigLoader;
//!
//! let loader = ConfigLoader::load()?;
//! let device = loader.config().serial.resolve_port("gps");
//! println!("default baud for {device}: {}", loader.config().serial.default_baud);
//! # Ok::<(), spwrap::config::ConfigError>(())
//! ```

mod error;
mod loader;
mod schema;

pub use error::{ConfigError, ConfigResult};
pub use loader::{
    get_default_config_dir, get_default_config_path, resolve_config_path, ConfigLoader,
};
pub use schema::{Config, LogFormat, LoggingConfig, SerialConfig, TestingConfig};
