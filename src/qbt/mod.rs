//! qBittorrent Web API adapter.
//!
//! Grounded on `examples/George-Miao-qbit/src/lib.rs`'s `Qbit::request`:
//! lazy login, a single cookie held behind a mutex, and a 403-triggers-
//! re-auth-then-retry-once loop. The preferences semantics (partial merge,
//! not a full overwrite) follow
//! `examples/original_source/src/qbouncer/qbittorrent.py`.

use std::sync::Mutex;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tap::Tap;
use tracing::{debug, trace, warn};

use crate::config::QBittorrentConfig;

#[derive(Debug, thiserror::Error)]
pub enum QBittorrentError {
    #[error("http error talking to qBittorrent: {0}")]
    Http(#[from] reqwest::Error),

    #[error("qBittorrent rejected the configured credentials")]
    AuthenticationFailed,

    #[error("qBittorrent API returned unexpected status {0}")]
    UnexpectedStatus(StatusCode),

    #[error("could not parse response from qBittorrent: {0}")]
    Decode(#[from] serde_json::Error),
}

type Result<T> = std::result::Result<T, QBittorrentError>;

/// Maps a non-2xx response to `QBittorrentError::UnexpectedStatus`, per the
/// spec's "non-2xx with body" error mapping; on success the response is
/// passed through unconsumed so the caller can still read its body.
async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(QBittorrentError::UnexpectedStatus(response.status()))
    }
}

/// Thin client over qBittorrent's Web API, holding a single session cookie.
pub struct QBittorrentClient {
    http: Client,
    base_url: String,
    username: String,
    password: String,
    cookie: Mutex<Option<String>>,
}

impl QBittorrentClient {
    pub fn new(config: &QBittorrentConfig) -> Result<Self> {
        let mut builder = Client::builder().timeout(Duration::from_secs(10));
        if !config.verify_tls {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder.build()?;
        Ok(Self {
            http,
            base_url: config.base_url(),
            username: config.username.clone(),
            password: config.password.clone(),
            cookie: Mutex::new(None),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v2/{path}", self.base_url)
    }

    fn cookie(&self) -> Option<String> {
        self.cookie.lock().unwrap().clone()
    }

    async fn ensure_authenticated(&self, force: bool) -> Result<()> {
        if self.username.is_empty() {
            trace!("no username configured, skipping authentication");
            return Ok(());
        }
        if !force && self.cookie().is_some() {
            trace!("already authenticated, skipping login");
            return Ok(());
        }

        debug!("logging in to qBittorrent");
        let response = self
            .http
            .post(self.url("auth/login"))
            .form(&[("username", &self.username), ("password", &self.password)])
            .send()
            .await?;

        if response.status() == StatusCode::FORBIDDEN {
            return Err(QBittorrentError::AuthenticationFailed);
        }

        let cookie = response
            .headers()
            .get(reqwest::header::SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let body = response.text().await?;
        if body.trim() != "Ok." {
            return Err(QBittorrentError::AuthenticationFailed);
        }

        *self.cookie.lock().unwrap() = cookie.or_else(|| Some(String::new()));
        debug!("login succeeded");
        Ok(())
    }

    /// Issues a GET, retrying once with a forced re-login if the session
    /// cookie turned out to be stale (a 403 from qBittorrent).
    async fn get(&self, path: &str) -> Result<reqwest::Response> {
        for attempt in 0..2 {
            self.ensure_authenticated(attempt != 0).await?;
            let mut request = self.http.get(self.url(path));
            if let Some(cookie) = self.cookie() {
                request = request.header(reqwest::header::COOKIE, cookie);
            }
            let response = request
                .send()
                .await?
                .tap(|response| trace!(status = %response.status(), "qBittorrent response"));
            if response.status() == StatusCode::FORBIDDEN && !self.username.is_empty() {
                warn!("session cookie rejected, retrying with fresh login");
                continue;
            }
            return ensure_success(response).await;
        }
        Err(QBittorrentError::AuthenticationFailed)
    }

    /// Issues a form-encoded POST, same retry-once-on-403 behavior as `get`.
    async fn post_form(&self, path: &str, form: &[(&str, &str)]) -> Result<reqwest::Response> {
        for attempt in 0..2 {
            self.ensure_authenticated(attempt != 0).await?;
            let mut request = self.http.post(self.url(path)).form(form);
            if let Some(cookie) = self.cookie() {
                request = request.header(reqwest::header::COOKIE, cookie);
            }
            let response = request
                .send()
                .await?
                .tap(|response| trace!(status = %response.status(), "qBittorrent response"));
            if response.status() == StatusCode::FORBIDDEN && !self.username.is_empty() {
                warn!("session cookie rejected, retrying with fresh login");
                continue;
            }
            return ensure_success(response).await;
        }
        Err(QBittorrentError::AuthenticationFailed)
    }

    pub async fn get_preferences(&self) -> Result<Value> {
        let response = self.get("app/preferences").await?;
        Ok(response.json().await?)
    }

    /// Merges `patch` into qBittorrent's current preferences via a single
    /// `setPreferences` call. qBittorrent itself only applies the keys
    /// present in the JSON body, so unrelated settings are left untouched.
    pub async fn set_preferences(&self, patch: &Value) -> Result<()> {
        let body = serde_json::to_string(patch)?;
        self.post_form("app/setPreferences", &[("json", &body)])
            .await?;
        Ok(())
    }

    pub async fn get_listening_port(&self) -> Result<u16> {
        let prefs = self.get_preferences().await?;
        prefs
            .get("listen_port")
            .and_then(Value::as_u64)
            .map(|p| p as u16)
            .ok_or_else(|| {
                QBittorrentError::Decode(<serde_json::Error as serde::de::Error>::custom(
                    "listen_port missing from preferences",
                ))
            })
    }

    pub async fn set_listening_port(&self, port: u16) -> Result<()> {
        self.set_preferences(&json!({ "listen_port": port })).await
    }

    pub async fn get_network_interface(&self) -> Result<String> {
        let prefs = self.get_preferences().await?;
        Ok(prefs
            .get("current_network_interface")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }

    pub async fn set_network_interface(&self, interface: &str) -> Result<()> {
        self.set_preferences(&json!({ "current_network_interface": interface }))
            .await
    }

    pub async fn verify_interface_binding(&self, expected_interface: &str) -> Result<bool> {
        let current = self.get_network_interface().await?;
        Ok(current == expected_interface)
    }

    /// Applies both the listening port and the bound interface in a single
    /// `setPreferences` call, so qBittorrent never observes one applied
    /// without the other.
    pub async fn update_port_and_interface(&self, port: u16, interface: &str) -> Result<()> {
        self.set_preferences(&json!({
            "listen_port": port,
            "current_network_interface": interface,
        }))
        .await
    }

    pub async fn get_version(&self) -> String {
        match self.get("app/version").await {
            Ok(response) => response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string()),
            Err(_) => "unknown".to_string(),
        }
    }

    /// True if qBittorrent answers within a short timeout; swallows any
    /// error rather than propagating it, since this is used purely as a
    /// liveness probe.
    pub async fn is_reachable(&self) -> bool {
        let attempt = tokio::time::timeout(Duration::from_secs(5), self.get("app/version")).await;
        matches!(attempt, Ok(Ok(response)) if response.status().is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preferences_patch_only_contains_touched_keys() {
        let patch = json!({ "listen_port": 51413 });
        assert_eq!(patch.as_object().unwrap().len(), 1);
    }

    #[test]
    fn base_url_scheme_reflects_use_https() {
        let mut config = QBittorrentConfig::default();
        config.use_https = true;
        config.host = "qbt.internal".to_string();
        config.port = 8080;
        assert_eq!(config.base_url(), "https://qbt.internal:8080");
    }
}
