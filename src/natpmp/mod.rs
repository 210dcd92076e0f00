//! NAT-PMP port mapping via the `natpmpc` CLI.
//!
//! Mirrors `examples/original_source/src/qbouncer/natpmp.py`: this crate
//! doesn't speak the NAT-PMP wire protocol itself, it parses `natpmpc`'s
//! stdout the same way the Python original does, and asks for private port
//! `1` with public port `0` every time so the gateway is always the one
//! picking the public port.

use std::net::Ipv4Addr;
use std::process::Stdio;
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;
use tokio::time::timeout as with_timeout;
use tracing::{debug, info, warn};

const LEASE_TIMEOUT: Duration = Duration::from_secs(30);
const QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Private port requested of the gateway. The original always asks for `1`
/// and lets the gateway assign whatever public port it likes; there is no
/// meaningful "private port" for a NAT-PMP client sitting behind a VPN
/// tunnel with no local listener on that port.
const REQUESTED_PRIVATE_PORT: &str = "1";

#[derive(Debug, thiserror::Error)]
pub enum NatPmpError {
    #[error("`natpmpc` is not available: {0}")]
    ToolUnavailable(std::io::Error),

    #[error("`natpmpc` timed out after {0:?}")]
    Timeout(Duration),

    #[error("natpmpc exited with status {status}: {stderr}")]
    CommandFailed { status: i32, stderr: String },

    #[error("could not parse a mapped port from natpmpc output: {0:?}")]
    UnparsablePort(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    fn as_flag(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub protocol: Protocol,
    pub private_port: u16,
    pub public_port: u16,
    pub lifetime_secs: u32,
}

/// Client for requesting and refreshing NAT-PMP port mappings against a
/// single gateway.
pub struct NatPmpClient {
    gateway: Ipv4Addr,
}

impl NatPmpClient {
    pub fn new(gateway: Ipv4Addr) -> Self {
        Self { gateway }
    }

    /// Requests a mapping for a single protocol, asking the gateway to pick
    /// the public port.
    async fn request_mapping(
        &self,
        protocol: Protocol,
        lifetime: Duration,
    ) -> Result<PortMapping, NatPmpError> {
        let args = vec![
            "-a".to_string(),
            REQUESTED_PRIVATE_PORT.to_string(),
            "0".to_string(),
            protocol.as_flag().to_string(),
            lifetime.as_secs().to_string(),
            "-g".to_string(),
            self.gateway.to_string(),
        ];
        let stdout = run_natpmpc(&args, LEASE_TIMEOUT).await?;
        parse_mapping(&stdout, protocol)
    }

    /// Requests a TCP mapping followed by a UDP mapping (the order the
    /// original checks in) and returns both. A mismatched public port
    /// between the two is logged, never treated as a failure: the caller
    /// treats the TCP port as authoritative.
    async fn request_both_protocols(
        &self,
        lifetime: Duration,
    ) -> Result<(PortMapping, PortMapping), NatPmpError> {
        let tcp = self.request_mapping(Protocol::Tcp, lifetime).await?;
        let udp = self.request_mapping(Protocol::Udp, lifetime).await?;

        if tcp.public_port != udp.public_port {
            warn!(
                tcp_port = tcp.public_port,
                udp_port = udp.public_port,
                "TCP and UDP public ports differ, using TCP"
            );
        }

        Ok((tcp, udp))
    }

    /// Requests fresh TCP and UDP mappings and returns the TCP public port,
    /// per the `refresh` contract.
    pub async fn refresh(&self, lifetime: Duration) -> Result<(u16, PortMapping, PortMapping), NatPmpError> {
        let (tcp, udp) = self.request_both_protocols(lifetime).await?;
        info!(port = tcp.public_port, lifetime = tcp.lifetime_secs, "NAT-PMP mapping obtained");
        Ok((tcp.public_port, tcp, udp))
    }

    pub async fn get_public_ip(&self) -> Option<Ipv4Addr> {
        let args = vec!["-g".to_string(), self.gateway.to_string()];
        let stdout = run_natpmpc(&args, QUERY_TIMEOUT).await.ok()?;
        let re = Regex::new(r"Public IP address\s*:\s*(\d+\.\d+\.\d+\.\d+)")
            .expect("static regex is valid");
        re.captures(&stdout)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }

    /// Releases a mapping early by requesting it again with a zero
    /// lifetime, as the NAT-PMP spec prescribes. Never raises: a failed
    /// release just leaves the lease to expire on its own.
    pub async fn release(&self, port: u16, protocol: Protocol) -> bool {
        let args = vec![
            "-a".to_string(),
            port.to_string(),
            "0".to_string(),
            protocol.as_flag().to_string(),
            "0".to_string(),
            "-g".to_string(),
            self.gateway.to_string(),
        ];
        run_natpmpc(&args, QUERY_TIMEOUT).await.is_ok()
    }
}

async fn run_natpmpc(args: &[String], timeout_duration: Duration) -> Result<String, NatPmpError> {
    let mut command = Command::new("natpmpc");
    command
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!(?args, "running natpmpc");

    let output = with_timeout(timeout_duration, command.output())
        .await
        .map_err(|_| NatPmpError::Timeout(timeout_duration))?
        .map_err(NatPmpError::ToolUnavailable)?;

    if !output.status.success() {
        return Err(NatPmpError::CommandFailed {
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parses `natpmpc` stdout with the pinned regular expression from the
/// NAT-PMP contract. Any departure from this exact wording is a parse
/// failure, not a best-effort fallback — relying on external tool stdout is
/// already fragile enough without guessing at alternate phrasings.
fn parse_mapping(stdout: &str, protocol: Protocol) -> Result<PortMapping, NatPmpError> {
    let re = Regex::new(
        r"Mapped public port (\d+) protocol (TCP|UDP) to local port (\d+) lifetime (\d+)",
    )
    .expect("static regex is valid");

    let captures = re
        .captures(stdout)
        .ok_or_else(|| NatPmpError::UnparsablePort(stdout.to_string()))?;

    let public_port: u16 = captures
        .get(1)
        .and_then(|m| m.as_str().parse().ok())
        .ok_or_else(|| NatPmpError::UnparsablePort(stdout.to_string()))?;
    let private_port: u16 = captures
        .get(3)
        .and_then(|m| m.as_str().parse().ok())
        .ok_or_else(|| NatPmpError::UnparsablePort(stdout.to_string()))?;
    let lifetime_secs: u32 = captures
        .get(4)
        .and_then(|m| m.as_str().parse().ok())
        .ok_or_else(|| NatPmpError::UnparsablePort(stdout.to_string()))?;

    Ok(PortMapping {
        protocol,
        private_port,
        public_port,
        lifetime_secs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_typical_natpmpc_mapping_output() {
        let sample =
            "Mapped public port 54321 protocol UDP to local port 1 lifetime 120\n";
        let mapping = parse_mapping(sample, Protocol::Udp).unwrap();
        assert_eq!(mapping.public_port, 54321);
        assert_eq!(mapping.private_port, 1);
        assert_eq!(mapping.lifetime_secs, 120);
    }

    #[test]
    fn parses_public_ip() {
        let sample = "Public IP address : 203.0.113.42\n";
        let re = Regex::new(r"Public IP address\s*:\s*(\d+\.\d+\.\d+\.\d+)").unwrap();
        let ip: Ipv4Addr = re
            .captures(sample)
            .and_then(|c| c.get(1))
            .unwrap()
            .as_str()
            .parse()
            .unwrap();
        assert_eq!(ip, Ipv4Addr::new(203, 0, 113, 42));
    }

    #[test]
    fn unparsable_output_is_an_error() {
        let err = parse_mapping("garbage", Protocol::Tcp).unwrap_err();
        assert!(matches!(err, NatPmpError::UnparsablePort(_)));
    }

    #[test]
    fn mismatched_tcp_and_udp_ports_is_not_itself_a_parse_error() {
        let tcp = "Mapped public port 100 protocol TCP to local port 1 lifetime 60\n";
        let udp = "Mapped public port 200 protocol UDP to local port 1 lifetime 60\n";
        let tcp_mapping = parse_mapping(tcp, Protocol::Tcp).unwrap();
        let udp_mapping = parse_mapping(udp, Protocol::Udp).unwrap();
        assert_ne!(tcp_mapping.public_port, udp_mapping.public_port);
    }
}
