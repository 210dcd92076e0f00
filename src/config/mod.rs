//! Configuration loading and validation.
//!
//! Mirrors `examples/original_source/src/qbouncer/config.py`: a sectioned
//! document on disk, overlaid with `QBOUNCER_<SECTION>_<FIELD>` environment
//! variables, overlaid on struct defaults, producing a single immutable,
//! fully validated [`Config`].

mod loader;
mod model;
mod raw;

pub use model::{
    Config, KillswitchConfig, NatPmpConfig, QBittorrentConfig, ServiceConfig, WireGuardConfig,
};

use std::fmt;

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    FileNotFound(std::path::PathBuf),

    #[error("failed to read configuration file {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML in configuration file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: &'static str, reason: String },

    #[error("unknown killswitch user {user:?}: {reason}")]
    UnknownUser { user: String, reason: String },
}

/// A masked [`fmt::Debug`] wrapper so secrets never land in logs.
pub(crate) struct Masked;

impl fmt::Debug for Masked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "***")
    }
}
