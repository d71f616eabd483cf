//! Configuration schema definitions.
//!
//! Every section carries serde defaults, so a file only needs the keys it
//! changes.

use super::error::{ConfigError, ConfigResult};
use crate::error::Result;
use crate::port::Configuration;
use crate::transport::{Setting, SharedTransport};
use crate::types::{FlowControl, Parity};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Line defaults and port aliases
    pub serial: SerialConfig,
    /// Log level and output format for the CLI
    pub logging: LoggingConfig,
    /// Hardware test settings
    pub testing: TestingConfig,
}

impl Config {
    /// Check every section for values the driver would reject.
    pub fn validate(&self) -> ConfigResult<()> {
        self.serial.validate()?;
        let baud = Setting::Baudrate(self.testing.baud);
        if baud.validate().is_err() {
            return Err(ConfigError::OutOfRange {
                key: "testing.baud",
                setting: baud,
            });
        }
        Ok(())
    }
}

/// Serial line defaults section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub default_baud: u32,
    /// Data bits, 5 to 8
    pub default_bits: u8,
    pub default_parity: Parity,
    /// Stop bits, 1 or 2
    pub default_stopbits: u8,
    pub default_flowcontrol: FlowControl,
    /// Timeout for blocking reads and writes; 0 waits indefinitely
    pub default_timeout_ms: u64,
    /// Short names for device paths
    #[serde(default)]
    pub port_aliases: HashMap<String, String>,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            default_baud: 115200,
            default_bits: 8,
            default_parity: Parity::None,
            default_stopbits: 1,
            default_flowcontrol: FlowControl::None,
            default_timeout_ms: 1000,
            port_aliases: HashMap::new(),
        }
    }
}

impl SerialConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Resolve a port name through aliases
    pub fn resolve_port(&self, name: &str) -> String {
        self.port_aliases
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let checks = [
            ("serial.default_baud", Setting::Baudrate(self.default_baud)),
            ("serial.default_bits", Setting::Bits(self.default_bits)),
            ("serial.default_stopbits", Setting::StopBits(self.default_stopbits)),
        ];
        for (key, setting) in checks {
            if setting.validate().is_err() {
                return Err(ConfigError::OutOfRange { key, setting });
            }
        }
        Ok(())
    }

    /// Build a driver configuration record holding these defaults.
    pub fn to_configuration(&self, transport: SharedTransport) -> Result<Configuration> {
        let config = Configuration::create_with(transport)?;
        config.set_baudrate(self.default_baud)?;
        config.set_bits(self.default_bits)?;
        config.set_parity(self.default_parity)?;
        config.set_stopbits(self.default_stopbits)?;
        config.set_flowcontrol(self.default_flowcontrol)?;
        Ok(config)
    }
}

/// Logging configuration section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: LogFormat::Compact,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    /// Multi-line with colors
    Pretty,
    #[default]
    Compact,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}

/// Hardware testing configuration section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestingConfig {
    /// Device used by hardware tests; they skip when unset
    pub port: Option<String>,
    pub baud: u32,
    /// Whether TX is wired to RX on the test port
    pub loopback_enabled: bool,
    pub timeout_ms: u64,
}

impl Default for TestingConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud: 115200,
            loopback_enabled: false,
            timeout_ms: 2000,
        }
    }
}

impl TestingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
