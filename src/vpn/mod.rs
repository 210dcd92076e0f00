//! VPN health monitoring.
//!
//! Shells out to `ip` and `ping` the same way
//! `examples/original_source/src/qbouncer/wireguard.py` does: this crate
//! never touches netlink directly, it asks the host tools what they think is
//! true. `wg` is consulted only for the advisory handshake-freshness signal;
//! its absence is not fatal.

use std::net::Ipv4Addr;
use std::process::Stdio;
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Errors raised by the VPN monitor.
///
/// Only the absence of required tooling (`ip`, `ping`) or a command that
/// fails to spawn at all is treated as an error; a down interface or failed
/// ping is a normal, expected outcome reported through `is_healthy`.
#[derive(Debug, thiserror::Error)]
pub enum WireGuardError {
    #[error("required tool `{tool}` is not available: {source}")]
    ToolUnavailable {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Polls the state of a WireGuard-style tunnel interface.
pub struct VpnMonitor {
    interface: String,
    health_check_host: Ipv4Addr,
}

impl VpnMonitor {
    pub fn new(interface: impl Into<String>, health_check_host: Ipv4Addr) -> Self {
        Self {
            interface: interface.into(),
            health_check_host,
        }
    }

    /// True when the interface is up, holds an IPv4 address, and a single
    /// ICMP probe over it to `health_check_host` succeeds.
    pub async fn is_healthy(&self) -> Result<bool, WireGuardError> {
        if !self.is_interface_up().await? {
            return Ok(false);
        }
        if self.get_interface_ip().await?.is_none() {
            return Ok(false);
        }
        self.check_connectivity(Duration::from_secs(5)).await
    }

    /// Blocks until `is_healthy` returns true or `timeout` elapses, polling
    /// every `poll_interval`. Returns false on timeout.
    pub async fn wait_until_healthy(
        &self,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<bool, WireGuardError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.is_healthy().await? {
                return Ok(true);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(false);
            }
            sleep(poll_interval).await;
        }
    }

    async fn is_interface_up(&self) -> Result<bool, WireGuardError> {
        let output = Command::new("ip")
            .args(["link", "show", &self.interface])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await
            .map_err(|source| WireGuardError::ToolUnavailable { tool: "ip", source })?;

        if !output.status.success() {
            return Ok(false);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout.contains("state UP") || stdout.contains(",UP,") || stdout.contains("<UP,"))
    }

    async fn get_interface_ip(&self) -> Result<Option<Ipv4Addr>, WireGuardError> {
        let output = Command::new("ip")
            .args(["-4", "addr", "show", &self.interface])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await
            .map_err(|source| WireGuardError::ToolUnavailable { tool: "ip", source })?;

        if !output.status.success() {
            return Ok(None);
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let re = Regex::new(r"inet\s+(\d+\.\d+\.\d+\.\d+)").expect("static regex is valid");
        Ok(re
            .captures(&stdout)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok()))
    }

    async fn check_connectivity(&self, timeout: Duration) -> Result<bool, WireGuardError> {
        let output = Command::new("ping")
            .args([
                "-c",
                "1",
                "-W",
                &timeout.as_secs().to_string(),
                "-I",
                &self.interface,
                &self.health_check_host.to_string(),
            ])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await
            .map_err(|source| WireGuardError::ToolUnavailable {
                tool: "ping",
                source,
            })?;
        Ok(output.status.success())
    }

    /// Advisory freshness check of the WireGuard handshake timer. Returns
    /// `None` whenever `wg` is missing, fails, or reports no handshake yet
    /// — none of which should interrupt the monitor loop.
    pub async fn is_handshake_fresh(&self, max_age: Duration) -> Option<bool> {
        let age = self.get_latest_handshake_age().await?;
        Some(age <= max_age)
    }

    async fn get_latest_handshake_age(&self) -> Option<Duration> {
        let output = Command::new("wg")
            .args(["show", &self.interface, "latest-handshakes"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await
            .inspect_err(|e| debug!(error = %e, "`wg` unavailable, skipping handshake check"))
            .ok()?;

        if !output.status.success() {
            return None;
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let epoch_secs: u64 = stdout.split_whitespace().nth(1)?.parse().ok()?;
        if epoch_secs == 0 {
            return None;
        }
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .ok()?
            .as_secs();
        Some(Duration::from_secs(now.saturating_sub(epoch_secs)))
    }
}

/// Polls `is_healthy` until it returns true or `timeout` elapses, logging
/// each unsuccessful attempt. Exposed as a standalone entry point mirroring
/// the library-level helper in the original implementation.
pub async fn wait_for_interface(
    monitor: &VpnMonitor,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<bool, WireGuardError> {
    let healthy = monitor.wait_until_healthy(timeout, poll_interval).await?;
    if !healthy {
        warn!(timeout_secs = timeout.as_secs(), "VPN did not become healthy in time");
    }
    Ok(healthy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_inet_address_from_ip_addr_show_output() {
        let sample = "3: wg2: <POINTOPOINT,UP,LOWER_UP> mtu 1420 qdisc noqueue state UNKNOWN group default qlen 1000\n    inet 10.2.0.5/32 scope global wg2\n       valid_lft forever preferred_lft forever\n";
        let re = Regex::new(r"inet\s+(\d+\.\d+\.\d+\.\d+)").unwrap();
        let ip: Ipv4Addr = re
            .captures(sample)
            .and_then(|c| c.get(1))
            .unwrap()
            .as_str()
            .parse()
            .unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 2, 0, 5));
    }

    #[test]
    fn detects_up_state_variants() {
        assert!("state UP".contains("state UP"));
        assert!("<POINTOPOINT,UP,LOWER_UP>".contains(",UP,"));
        assert!("<UP,LOWER_UP>".contains("<UP,"));
    }
}
