use crate::transport::Setting;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Why `spwrap.toml` could not be loaded, checked or saved.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("settings file {0} does not exist")]
    NotFound(PathBuf),

    #[error("cannot read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{path} is not a valid spwrap.toml: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("cannot encode settings as TOML: {0}")]
    Encode(#[from] toml::ser::Error),

    #[error("cannot write settings file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A line default the driver would refuse.
    #[error("{key}: {setting:?} is out of range")]
    OutOfRange { key: &'static str, setting: Setting },

    /// An environment override that does not parse.
    #[error("{var}: {message}")]
    Env { var: String, message: String },

    #[error("settings were not loaded from a file; use save_to")]
    NoPath,
}

impl ConfigError {
    pub(crate) fn env(var: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Env {
            var: var.into(),
            message: message.into(),
        }
    }

    /// The `section.key` a rejected value came from.
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::OutOfRange { key, .. } => Some(*key),
            Self::Env { var, .. } => Some(var.as_str()),
            _ => None,
        }
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;
