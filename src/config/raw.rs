//! TOML document shape. Every field is optional: absence means "fall
//! through to the environment, then to the default".

use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub(crate) struct RawDocument {
    pub wireguard: RawWireGuard,
    pub natpmp: RawNatPmp,
    pub qbittorrent: RawQBittorrent,
    pub service: RawService,
    pub killswitch: RawKillswitch,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub(crate) struct RawWireGuard {
    pub interface: Option<String>,
    pub health_check_host: Option<String>,
    pub health_check_interval: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub(crate) struct RawNatPmp {
    pub gateway: Option<String>,
    pub refresh_interval: Option<u64>,
    pub lease_lifetime: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub(crate) struct RawQBittorrent {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub use_https: Option<bool>,
    pub verify_tls: Option<bool>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub interface_binding: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub(crate) struct RawService {
    pub log_level: Option<String>,
    pub state_file_path: Option<String>,
    pub max_consecutive_failures: Option<u32>,
    pub failure_backoff_base: Option<u64>,
    pub failure_backoff_max: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub(crate) struct RawKillswitch {
    pub enabled: Option<bool>,
    pub user_name: Option<String>,
}
