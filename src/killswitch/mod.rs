//! iptables killswitch.
//!
//! Grounded on `examples/original_source/src/qbouncer/killswitch.py`: a
//! dedicated chain in the `filter` table, jumped to from `OUTPUT`, that
//! confines one local user's traffic to loopback, established/related
//! traffic, and the VPN interface, rejecting everything else. Idempotent
//! the same way: every install step checks first with `-C`/`-L` and every
//! teardown step loops until the thing it's removing is gone.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout as with_timeout;
use tracing::{debug, warn};

const CHAIN_NAME: &str = "QBOUNCER-KS";
const TABLE: &str = "filter";
const IPTABLES_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum KillswitchError {
    #[error("`iptables` is not available: {0}")]
    ToolUnavailable(std::io::Error),

    #[error("`iptables` timed out after {0:?}")]
    Timeout(Duration),

    #[error("iptables command failed: {args:?}: {stderr}")]
    CommandFailed { args: Vec<String>, stderr: String },

    #[error("could not resolve uid for user {user:?}: {reason}")]
    UnknownUser { user: String, reason: String },
}

/// Installs and tears down the `QBOUNCER-KS` iptables chain confining a
/// single user's outbound traffic to a VPN interface.
pub struct KillswitchManager {
    user_name: String,
    interface: String,
}

impl KillswitchManager {
    pub fn new(user_name: impl Into<String>, interface: impl Into<String>) -> Self {
        Self {
            user_name: user_name.into(),
            interface: interface.into(),
        }
    }

    /// Idempotently (re)installs the killswitch: tears down any existing
    /// chain first so a `setup` after an interface change doesn't leave
    /// stale rules behind, then rebuilds it from scratch.
    pub async fn setup(&self) -> Result<(), KillswitchError> {
        self.cleanup().await;

        let uid = resolve_uid(&self.user_name).await?;

        if !self.chain_exists().await? {
            self.run(&["-t", TABLE, "-N", CHAIN_NAME]).await?;
        }

        self.add_chain_rule(&["-o", "lo", "-j", "ACCEPT"]).await?;
        self.add_chain_rule(&["-m", "state", "--state", "ESTABLISHED,RELATED", "-j", "ACCEPT"])
            .await?;
        self.add_chain_rule(&["-o", &self.interface, "-j", "ACCEPT"])
            .await?;
        self.add_chain_rule(&["-j", "REJECT"]).await?;

        self.add_jump_rule(uid).await?;

        debug!(user = %self.user_name, interface = %self.interface, "killswitch installed");
        Ok(())
    }

    /// Tears the killswitch down: flush the chain, remove every jump rule
    /// pointing at it, then delete it. Best-effort — failures are logged,
    /// never propagated, so a partially-applied install doesn't wedge
    /// shutdown.
    pub async fn cleanup(&self) {
        if let Err(e) = self.flush_chain().await {
            warn!(error = %e, "failed to flush killswitch chain during cleanup");
        }
        if let Err(e) = self.remove_jump_rules().await {
            warn!(error = %e, "failed to remove killswitch jump rule during cleanup");
        }
        if let Err(e) = self.delete_chain().await {
            debug!(error = %e, "failed to delete killswitch chain during cleanup (may not exist)");
        }
    }

    /// True if the chain exists and currently has a jump rule pointing at
    /// it from `OUTPUT`.
    pub async fn is_active(&self) -> Result<bool, KillswitchError> {
        Ok(self.chain_exists().await? && self.jump_rule_exists().await?)
    }

    /// True if the killswitch is active, its interface-allow rule matches
    /// the interface we were constructed with, and the catch-all REJECT
    /// rule is still present; used by the supervisor to detect drift after
    /// a reconfiguration or external tampering.
    pub async fn verify(&self) -> Result<bool, KillswitchError> {
        if !self.is_active().await? {
            return Ok(false);
        }
        if !self.rule_exists(&["-o", &self.interface, "-j", "ACCEPT"]).await? {
            return Ok(false);
        }
        self.rule_exists(&["-j", "REJECT"]).await
    }

    async fn chain_exists(&self) -> Result<bool, KillswitchError> {
        let args = ["-t", TABLE, "-L", CHAIN_NAME, "-n"];
        Ok(self.run_checked(&args).await?)
    }

    async fn jump_rule_exists(&self) -> Result<bool, KillswitchError> {
        let uid = resolve_uid(&self.user_name).await?;
        self.jump_rule_exists_for_uid(uid).await
    }

    async fn jump_rule_exists_for_uid(&self, uid: u32) -> Result<bool, KillswitchError> {
        let uid_arg = format!("--uid-owner={uid}");
        let args = [
            "-t", TABLE, "-C", "OUTPUT", "-m", "owner", &uid_arg, "-j", CHAIN_NAME,
        ];
        self.run_checked(&args).await
    }

    async fn rule_exists(&self, rule: &[&str]) -> Result<bool, KillswitchError> {
        let mut args = vec!["-t", TABLE, "-C", CHAIN_NAME];
        args.extend_from_slice(rule);
        self.run_checked(&args).await
    }

    async fn add_chain_rule(&self, rule: &[&str]) -> Result<(), KillswitchError> {
        if self.rule_exists(rule).await? {
            return Ok(());
        }
        let mut args = vec!["-t", TABLE, "-A", CHAIN_NAME];
        args.extend_from_slice(rule);
        self.run(&args).await
    }

    /// Inserts the jump rule at position 1 of `OUTPUT`, not appends, so it
    /// always runs before any other rule already present there.
    async fn add_jump_rule(&self, uid: u32) -> Result<(), KillswitchError> {
        if self.jump_rule_exists_for_uid(uid).await? {
            return Ok(());
        }
        let uid_arg = format!("--uid-owner={uid}");
        let args = [
            "-t", TABLE, "-I", "OUTPUT", "1", "-m", "owner", &uid_arg, "-j", CHAIN_NAME,
        ];
        self.run(&args).await
    }

    async fn flush_chain(&self) -> Result<(), KillswitchError> {
        if !self.chain_exists().await.unwrap_or(false) {
            return Ok(());
        }
        self.run(&["-t", TABLE, "-F", CHAIN_NAME]).await
    }

    async fn remove_jump_rules(&self) -> Result<(), KillswitchError> {
        let Ok(uid) = resolve_uid(&self.user_name).await else {
            return Ok(());
        };
        let uid_arg = format!("--uid-owner={uid}");
        while self.jump_rule_exists_for_uid(uid).await.unwrap_or(false) {
            self.run(&[
                "-t", TABLE, "-D", "OUTPUT", "-m", "owner", &uid_arg, "-j", CHAIN_NAME,
            ])
            .await?;
        }
        Ok(())
    }

    async fn delete_chain(&self) -> Result<(), KillswitchError> {
        if !self.chain_exists().await.unwrap_or(false) {
            return Ok(());
        }
        self.run(&["-t", TABLE, "-X", CHAIN_NAME]).await
    }

    /// Runs an iptables command expected to only ever succeed or fail,
    /// propagating non-check failures as errors.
    async fn run(&self, args: &[&str]) -> Result<(), KillswitchError> {
        let args_owned: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        let output = exec_iptables(args).await?;
        if !output.status.success() {
            return Err(KillswitchError::CommandFailed {
                args: args_owned,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }

    /// Runs an iptables `-C`/`-L` style check, where a non-zero exit just
    /// means "not present" rather than an error.
    async fn run_checked(&self, args: &[&str]) -> Result<bool, KillswitchError> {
        let output = exec_iptables(args).await?;
        Ok(output.status.success())
    }
}

async fn exec_iptables(args: &[&str]) -> Result<std::process::Output, KillswitchError> {
    debug!(?args, "running iptables");
    let mut command = Command::new("iptables");
    command.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());

    with_timeout(IPTABLES_TIMEOUT, command.output())
        .await
        .map_err(|_| KillswitchError::Timeout(IPTABLES_TIMEOUT))?
        .map_err(KillswitchError::ToolUnavailable)
}

async fn resolve_uid(user: &str) -> Result<u32, KillswitchError> {
    let output = Command::new("id")
        .arg("-u")
        .arg(user)
        .output()
        .await
        .map_err(|e| KillswitchError::UnknownUser {
            user: user.to_string(),
            reason: format!("failed to execute `id`: {e}"),
        })?;

    if !output.status.success() {
        return Err(KillswitchError::UnknownUser {
            user: user.to_string(),
            reason: "no such local user".to_string(),
        });
    }

    String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse()
        .map_err(|_| KillswitchError::UnknownUser {
            user: user.to_string(),
            reason: "unexpected output from `id -u`".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_name_and_table_match_expected_constants() {
        assert_eq!(CHAIN_NAME, "QBOUNCER-KS");
        assert_eq!(TABLE, "filter");
    }

    #[test]
    fn manager_stores_user_and_interface() {
        let manager = KillswitchManager::new("qbittorrent", "wg2");
        assert_eq!(manager.user_name, "qbittorrent");
        assert_eq!(manager.interface, "wg2");
    }
}
