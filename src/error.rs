//! Error kinds shared across the crate.
//!
//! Each collaborator owns a focused error enum (see its module); this file
//! aggregates them into the top-level error `main` uses to pick an exit
//! code and format a diagnostic.

use crate::config::ConfigError;
use crate::killswitch::KillswitchError;
use crate::natpmp::NatPmpError;
use crate::qbt::QBittorrentError;
use crate::vpn::WireGuardError;

/// Top-level error returned by the binary entry point.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    WireGuard(#[from] WireGuardError),

    #[error(transparent)]
    NatPmp(#[from] NatPmpError),

    #[error(transparent)]
    QBittorrent(#[from] QBittorrentError),

    #[error(transparent)]
    Killswitch(#[from] KillswitchError),

    #[error("unexpected error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
