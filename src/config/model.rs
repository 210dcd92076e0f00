use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use super::Masked;

/// Fully validated, immutable configuration for a supervisor run.
#[derive(Clone)]
pub struct Config {
    pub wireguard: WireGuardConfig,
    pub natpmp: NatPmpConfig,
    pub qbittorrent: QBittorrentConfig,
    pub service: ServiceConfig,
    pub killswitch: KillswitchConfig,
}

#[derive(Debug, Clone)]
pub struct WireGuardConfig {
    pub interface_name: String,
    pub health_check_host: Ipv4Addr,
    pub health_check_interval_secs: u64,
}

impl WireGuardConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

#[derive(Debug, Clone)]
pub struct NatPmpConfig {
    pub gateway: Ipv4Addr,
    pub refresh_interval_secs: u64,
    pub lease_lifetime_secs: u64,
}

impl NatPmpConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn lease_lifetime(&self) -> Duration {
        Duration::from_secs(self.lease_lifetime_secs)
    }
}

#[derive(Clone)]
pub struct QBittorrentConfig {
    pub host: String,
    pub port: u16,
    pub use_https: bool,
    pub verify_tls: bool,
    pub username: String,
    pub password: String,
    pub interface_binding: String,
}

impl QBittorrentConfig {
    pub fn base_url(&self) -> String {
        let scheme = if self.use_https { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for QBittorrentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QBittorrentConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("use_https", &self.use_https)
            .field("verify_tls", &self.verify_tls)
            .field("username", &self.username)
            .field("password", &Masked)
            .field("interface_binding", &self.interface_binding)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub log_level: String,
    pub state_file_path: PathBuf,
    pub max_consecutive_failures: u32,
    pub failure_backoff_base_secs: u64,
    pub failure_backoff_max_secs: u64,
}

impl ServiceConfig {
    pub fn failure_backoff_base(&self) -> Duration {
        Duration::from_secs(self.failure_backoff_base_secs)
    }

    pub fn failure_backoff_max(&self) -> Duration {
        Duration::from_secs(self.failure_backoff_max_secs)
    }
}

#[derive(Debug, Clone)]
pub struct KillswitchConfig {
    pub enabled: bool,
    pub user_name: String,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("wireguard", &self.wireguard)
            .field("natpmp", &self.natpmp)
            .field("qbittorrent", &self.qbittorrent)
            .field("service", &self.service)
            .field("killswitch", &self.killswitch)
            .finish()
    }
}

impl Default for WireGuardConfig {
    fn default() -> Self {
        Self {
            interface_name: "wg2".to_string(),
            health_check_host: Ipv4Addr::new(10, 2, 0, 1),
            health_check_interval_secs: 30,
        }
    }
}

impl Default for NatPmpConfig {
    fn default() -> Self {
        Self {
            gateway: Ipv4Addr::new(10, 2, 0, 1),
            refresh_interval_secs: 60,
            lease_lifetime_secs: 120,
        }
    }
}

impl Default for QBittorrentConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 80,
            use_https: false,
            verify_tls: true,
            username: String::new(),
            password: String::new(),
            interface_binding: "wg2".to_string(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
            state_file_path: PathBuf::from("/var/lib/qbouncer/state.json"),
            max_consecutive_failures: 5,
            failure_backoff_base_secs: 5,
            failure_backoff_max_secs: 300,
        }
    }
}

impl Default for KillswitchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            user_name: "qbittorrent".to_string(),
        }
    }
}
