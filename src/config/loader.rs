use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use regex::Regex;
use tracing::debug;

use super::raw::RawDocument;
use super::{Config, ConfigError, KillswitchConfig, NatPmpConfig, QBittorrentConfig};
use super::{ServiceConfig, WireGuardConfig};

const INTERFACE_RE: &str = r"^[A-Za-z][A-Za-z0-9_-]{0,14}$";
const VALID_LOG_LEVELS: &[&str] = &["DEBUG", "INFO", "WARNING", "ERROR"];

impl Config {
    /// Load configuration from an optional TOML file, environment variables,
    /// and defaults, in that priority order (env wins, then file, then
    /// default), then validate the result.
    pub fn load(config_path: Option<&Path>) -> Result<Config, ConfigError> {
        let doc = match config_path {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::FileNotFound(path.to_path_buf()));
                }
                let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                toml::from_str::<RawDocument>(&content)?
            }
            None => RawDocument::default(),
        };

        let wireguard = WireGuardConfig {
            interface_name: resolve_string(
                "QBOUNCER_WIREGUARD_INTERFACE",
                doc.wireguard.interface,
                WireGuardConfig::default().interface_name,
            ),
            health_check_host: resolve_parsed(
                "QBOUNCER_WIREGUARD_HEALTH_CHECK_HOST",
                doc.wireguard.health_check_host,
                WireGuardConfig::default().health_check_host,
            )?,
            health_check_interval_secs: resolve_parsed(
                "QBOUNCER_WIREGUARD_HEALTH_CHECK_INTERVAL",
                doc.wireguard.health_check_interval,
                WireGuardConfig::default().health_check_interval_secs,
            )?,
        };

        let natpmp = NatPmpConfig {
            gateway: resolve_parsed(
                "QBOUNCER_NATPMP_GATEWAY",
                doc.natpmp.gateway,
                NatPmpConfig::default().gateway,
            )?,
            refresh_interval_secs: resolve_parsed(
                "QBOUNCER_NATPMP_REFRESH_INTERVAL",
                doc.natpmp.refresh_interval,
                NatPmpConfig::default().refresh_interval_secs,
            )?,
            lease_lifetime_secs: resolve_parsed(
                "QBOUNCER_NATPMP_LEASE_LIFETIME",
                doc.natpmp.lease_lifetime,
                NatPmpConfig::default().lease_lifetime_secs,
            )?,
        };

        let qbittorrent = QBittorrentConfig {
            host: resolve_string(
                "QBOUNCER_QBITTORRENT_HOST",
                doc.qbittorrent.host,
                QBittorrentConfig::default().host,
            ),
            port: resolve_parsed(
                "QBOUNCER_QBITTORRENT_PORT",
                doc.qbittorrent.port,
                QBittorrentConfig::default().port,
            )?,
            use_https: resolve_bool(
                "QBOUNCER_QBITTORRENT_USE_HTTPS",
                doc.qbittorrent.use_https,
                QBittorrentConfig::default().use_https,
            ),
            verify_tls: resolve_bool(
                "QBOUNCER_QBITTORRENT_VERIFY_TLS",
                doc.qbittorrent.verify_tls,
                QBittorrentConfig::default().verify_tls,
            ),
            username: resolve_string(
                "QBOUNCER_QBITTORRENT_USERNAME",
                doc.qbittorrent.username,
                QBittorrentConfig::default().username,
            ),
            password: resolve_string(
                "QBOUNCER_QBITTORRENT_PASSWORD",
                doc.qbittorrent.password,
                QBittorrentConfig::default().password,
            ),
            interface_binding: resolve_string(
                "QBOUNCER_QBITTORRENT_INTERFACE_BINDING",
                doc.qbittorrent.interface_binding,
                QBittorrentConfig::default().interface_binding,
            ),
        };

        let service = ServiceConfig {
            log_level: resolve_string(
                "QBOUNCER_SERVICE_LOG_LEVEL",
                doc.service.log_level,
                ServiceConfig::default().log_level,
            )
            .to_uppercase(),
            state_file_path: PathBuf::from(resolve_string(
                "QBOUNCER_SERVICE_STATE_FILE_PATH",
                doc.service.state_file_path,
                ServiceConfig::default()
                    .state_file_path
                    .to_string_lossy()
                    .into_owned(),
            )),
            max_consecutive_failures: resolve_parsed(
                "QBOUNCER_SERVICE_MAX_CONSECUTIVE_FAILURES",
                doc.service.max_consecutive_failures,
                ServiceConfig::default().max_consecutive_failures,
            )?,
            failure_backoff_base_secs: resolve_parsed(
                "QBOUNCER_SERVICE_FAILURE_BACKOFF_BASE",
                doc.service.failure_backoff_base,
                ServiceConfig::default().failure_backoff_base_secs,
            )?,
            failure_backoff_max_secs: resolve_parsed(
                "QBOUNCER_SERVICE_FAILURE_BACKOFF_MAX",
                doc.service.failure_backoff_max,
                ServiceConfig::default().failure_backoff_max_secs,
            )?,
        };

        let killswitch = KillswitchConfig {
            enabled: resolve_bool(
                "QBOUNCER_KILLSWITCH_ENABLED",
                doc.killswitch.enabled,
                KillswitchConfig::default().enabled,
            ),
            user_name: resolve_string(
                "QBOUNCER_KILLSWITCH_USER_NAME",
                doc.killswitch.user_name,
                KillswitchConfig::default().user_name,
            ),
        };

        let config = Config {
            wireguard,
            natpmp,
            qbittorrent,
            service,
            killswitch,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let interface_re = Regex::new(INTERFACE_RE).expect("static regex is valid");

        if !interface_re.is_match(&self.wireguard.interface_name) {
            return Err(ConfigError::InvalidValue {
                key: "wireguard.interface",
                reason: format!(
                    "{:?} must start with a letter and contain only alphanumerics, '-' or '_', 1-15 chars",
                    self.wireguard.interface_name
                ),
            });
        }
        if !interface_re.is_match(&self.qbittorrent.interface_binding) {
            return Err(ConfigError::InvalidValue {
                key: "qbittorrent.interface_binding",
                reason: format!(
                    "{:?} must start with a letter and contain only alphanumerics, '-' or '_', 1-15 chars",
                    self.qbittorrent.interface_binding
                ),
            });
        }

        if self.wireguard.health_check_interval_secs < 1 {
            return Err(ConfigError::InvalidValue {
                key: "wireguard.health_check_interval",
                reason: "must be at least 1 second".to_string(),
            });
        }
        if self.natpmp.refresh_interval_secs < 1 {
            return Err(ConfigError::InvalidValue {
                key: "natpmp.refresh_interval",
                reason: "must be at least 1 second".to_string(),
            });
        }
        if self.natpmp.lease_lifetime_secs < 1 {
            return Err(ConfigError::InvalidValue {
                key: "natpmp.lease_lifetime",
                reason: "must be at least 1 second".to_string(),
            });
        }
        if self.natpmp.refresh_interval_secs >= self.natpmp.lease_lifetime_secs {
            return Err(ConfigError::InvalidValue {
                key: "natpmp.refresh_interval",
                reason: format!(
                    "refresh_interval ({}s) must be less than lease_lifetime ({}s)",
                    self.natpmp.refresh_interval_secs, self.natpmp.lease_lifetime_secs
                ),
            });
        }

        if self.qbittorrent.port == 0 {
            return Err(ConfigError::InvalidValue {
                key: "qbittorrent.port",
                reason: "must be 1-65535".to_string(),
            });
        }

        if self.service.max_consecutive_failures < 1 {
            return Err(ConfigError::InvalidValue {
                key: "service.max_consecutive_failures",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.service.failure_backoff_base_secs < 1 {
            return Err(ConfigError::InvalidValue {
                key: "service.failure_backoff_base",
                reason: "must be at least 1 second".to_string(),
            });
        }
        if self.service.failure_backoff_max_secs < self.service.failure_backoff_base_secs {
            return Err(ConfigError::InvalidValue {
                key: "service.failure_backoff_max",
                reason: "must be >= failure_backoff_base".to_string(),
            });
        }

        if !VALID_LOG_LEVELS.contains(&self.service.log_level.as_str()) {
            return Err(ConfigError::InvalidValue {
                key: "service.log_level",
                reason: format!(
                    "{:?} must be one of {VALID_LOG_LEVELS:?}",
                    self.service.log_level
                ),
            });
        }

        if self.killswitch.enabled {
            resolve_uid(&self.killswitch.user_name)?;
        }

        Ok(())
    }
}

/// Resolve a local UID for `user`, shelling out to `id -u` the same way the
/// rest of the crate defers kernel/user-database questions to host tools.
fn resolve_uid(user: &str) -> Result<u32, ConfigError> {
    let output = std::process::Command::new("id")
        .arg("-u")
        .arg(user)
        .output()
        .map_err(|e| ConfigError::UnknownUser {
            user: user.to_string(),
            reason: format!("failed to execute `id`: {e}"),
        })?;

    if !output.status.success() {
        return Err(ConfigError::UnknownUser {
            user: user.to_string(),
            reason: "no such local user".to_string(),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .trim()
        .parse::<u32>()
        .map_err(|_| ConfigError::UnknownUser {
            user: user.to_string(),
            reason: "unexpected output from `id -u`".to_string(),
        })
}

fn resolve_string(env_key: &'static str, file_value: Option<String>, default: String) -> String {
    if let Ok(v) = env::var(env_key) {
        debug!(key = env_key, "overriding configuration from environment");
        return v;
    }
    file_value.unwrap_or(default)
}

fn resolve_bool(env_key: &'static str, file_value: Option<bool>, default: bool) -> bool {
    if let Ok(v) = env::var(env_key) {
        debug!(key = env_key, "overriding configuration from environment");
        return parse_bool(&v);
    }
    file_value.unwrap_or(default)
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

fn resolve_parsed<T>(
    env_key: &'static str,
    file_value: Option<T>,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Ok(v) = env::var(env_key) {
        debug!(key = env_key, "overriding configuration from environment");
        return v.parse::<T>().map_err(|e| ConfigError::InvalidValue {
            key: "environment override",
            reason: format!("{env_key}={v:?}: {e}"),
        });
    }
    Ok(file_value.unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn base_toml() -> &'static str {
        r#"
        [wireguard]
        interface = "wg2"
        health_check_host = "10.2.0.1"
        health_check_interval = 30

        [natpmp]
        gateway = "10.2.0.1"
        refresh_interval = 60
        lease_lifetime = 120

        [qbittorrent]
        host = "localhost"
        port = 8080

        [service]
        max_consecutive_failures = 5
        "#
    }

    #[test]
    fn loads_defaults_when_no_file_given() {
        let config = Config::load(None).expect("defaults must validate");
        assert_eq!(config.wireguard.interface_name, "wg2");
        assert_eq!(config.natpmp.gateway, Ipv4Addr::new(10, 2, 0, 1));
    }

    #[test]
    fn rejects_refresh_interval_not_less_than_lease_lifetime() {
        let toml = r#"
        [natpmp]
        gateway = "10.2.0.1"
        refresh_interval = 120
        lease_lifetime = 120
        "#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, toml).unwrap();

        let err = Config::load(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "natpmp.refresh_interval", .. }));
    }

    #[test]
    fn rejects_invalid_interface_name() {
        let toml = r#"
        [wireguard]
        interface = "2bad"
        "#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, toml).unwrap();

        let err = Config::load(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "wireguard.interface", .. }));
    }

    #[test]
    fn rejects_unknown_keys() {
        let toml = r#"
        [wireguard]
        bogus_field = true
        "#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, toml).unwrap();

        let err = Config::load(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }

    #[test]
    fn parses_full_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, base_toml()).unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.qbittorrent.port, 8080);
        assert_eq!(config.natpmp.refresh_interval_secs, 60);
    }
}
