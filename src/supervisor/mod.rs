//! The supervisor state machine.
//!
//! Grounded on `examples/original_source/src/qbouncer/service.py`'s
//! `QBouncerService`: a single loop that ticks through
//! `WAITING_VPN -> WAITING_QBT -> MAPPING_PORT -> CONFIGURING -> MONITORING`,
//! falling back to `RECOVERING` after too many consecutive failures, until a
//! signal requests `SHUTTING_DOWN`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::killswitch::KillswitchManager;
use crate::natpmp::NatPmpClient;
use crate::notify::sd_notify;
use crate::qbt::QBittorrentClient;
use crate::state::ServiceStateData;
use crate::vpn::VpnMonitor;

/// How often `_wait_for_qbittorrent` re-polls while qBittorrent hasn't come
/// up yet. The original hardcodes this rather than making it configurable,
/// and there's no reason for a supervisor restart loop to do otherwise.
const QBT_AVAILABILITY_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Initializing,
    WaitingVpn,
    WaitingQbt,
    MappingPort,
    Configuring,
    Monitoring,
    Recovering,
    ShuttingDown,
}

/// Orchestrates VPN monitoring, NAT-PMP port mapping, qBittorrent
/// configuration, and the optional killswitch behind one state machine.
pub struct Supervisor {
    config: Config,
    vpn: VpnMonitor,
    natpmp: NatPmpClient,
    qbt: QBittorrentClient,
    killswitch: Option<KillswitchManager>,
    state: ServiceState,
    state_data: ServiceStateData,
    shutdown_requested: Arc<AtomicBool>,
    shutdown_notify: Arc<tokio::sync::Notify>,
}

impl Supervisor {
    pub fn new(config: Config) -> Result<Self, crate::Error> {
        let vpn = VpnMonitor::new(
            config.wireguard.interface_name.clone(),
            config.wireguard.health_check_host,
        );
        let natpmp = NatPmpClient::new(config.natpmp.gateway);
        let qbt = QBittorrentClient::new(&config.qbittorrent)?;
        let killswitch = config.killswitch.enabled.then(|| {
            KillswitchManager::new(
                config.killswitch.user_name.clone(),
                config.wireguard.interface_name.clone(),
            )
        });
        let state_data = ServiceStateData::load(&config.service.state_file_path);

        Ok(Self {
            config,
            vpn,
            natpmp,
            qbt,
            killswitch,
            state: ServiceState::Initializing,
            state_data,
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(tokio::sync::Notify::new()),
        })
    }

    /// Runs the supervisor loop until a shutdown signal arrives, then tears
    /// down the killswitch, persists final state, and returns.
    pub async fn run(&mut self) -> Result<(), crate::Error> {
        self.setup_signal_handlers();

        info!(
            wireguard_interface = %self.config.wireguard.interface_name,
            natpmp_gateway = %self.config.natpmp.gateway,
            qbittorrent = %self.config.qbittorrent.base_url(),
            killswitch = self.killswitch.is_some(),
            "starting qbouncer"
        );

        self.state = ServiceState::WaitingVpn;
        sd_notify("READY=1");

        while self.state != ServiceState::ShuttingDown {
            if self.shutdown_requested.load(Ordering::SeqCst) {
                self.state = ServiceState::ShuttingDown;
                break;
            }

            self.tick().await;
            sd_notify("WATCHDOG=1");
        }

        self.cleanup().await;
        Ok(())
    }

    fn setup_signal_handlers(&self) {
        let flag = Arc::clone(&self.shutdown_requested);
        let notify = Arc::clone(&self.shutdown_notify);
        tokio::spawn(async move {
            let mut sigterm =
                signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
            let mut sigint =
                signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM, initiating shutdown"),
                _ = sigint.recv() => info!("received SIGINT, initiating shutdown"),
            }
            flag.store(true, Ordering::SeqCst);
            notify.notify_one();
        });
    }

    /// Sleeps for `duration`, but wakes early if a shutdown signal arrives,
    /// so a tick's sleep never delays reacting to SIGTERM/SIGINT.
    async fn interruptible_sleep(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.shutdown_notify.notified() => {
                debug!("sleep interrupted by shutdown signal");
            }
        }
    }

    #[instrument(skip(self), fields(state = ?self.state))]
    async fn tick(&mut self) {
        match self.state {
            ServiceState::Initializing => self.state = ServiceState::WaitingVpn,
            ServiceState::WaitingVpn => self.wait_for_vpn().await,
            ServiceState::WaitingQbt => self.wait_for_qbittorrent().await,
            ServiceState::MappingPort => self.request_port_mapping().await,
            ServiceState::Configuring => self.configure_qbittorrent().await,
            ServiceState::Monitoring => self.monitor().await,
            ServiceState::Recovering => self.recover().await,
            ServiceState::ShuttingDown => {}
        }
    }

    async fn wait_for_vpn(&mut self) {
        info!(interface = %self.config.wireguard.interface_name, "waiting for VPN interface");

        let healthy = match self.vpn.is_healthy().await {
            Ok(h) => h,
            Err(e) => {
                warn!(error = %e, "VPN health check failed");
                false
            }
        };

        if !healthy {
            self.interruptible_sleep(self.config.wireguard.health_check_interval()).await;
            return;
        }

        info!("VPN is healthy");

        if let Some(killswitch) = &self.killswitch {
            if let Err(e) = killswitch.setup().await {
                error!(error = %e, "failed to set up killswitch");
                self.handle_failure();
                return;
            }
        }

        self.state_data.consecutive_failures = 0;
        self.state = ServiceState::WaitingQbt;
    }

    async fn wait_for_qbittorrent(&mut self) {
        info!(
            url = %self.config.qbittorrent.base_url(),
            "waiting for qBittorrent to become reachable"
        );

        if self.qbt.is_reachable().await {
            let version = self.qbt.get_version().await;
            info!(version = %version, "qBittorrent is reachable");
            self.state_data.consecutive_failures = 0;
            self.state = ServiceState::MappingPort;
        } else {
            self.interruptible_sleep(QBT_AVAILABILITY_POLL_INTERVAL).await;
        }
    }

    async fn request_port_mapping(&mut self) {
        debug!("requesting NAT-PMP port mapping");

        let old_port = self.state_data.current_port;

        let mapping = self.natpmp.refresh(self.config.natpmp.lease_lifetime()).await;

        match mapping {
            Ok((new_port, _tcp, _udp)) => {
                self.state_data.current_port = Some(new_port);
                self.state_data.last_port_refresh = Some(Utc::now());
                self.state_data.consecutive_failures = 0;

                if old_port != Some(new_port) {
                    info!(port = new_port, "port mapping obtained");
                    self.state = ServiceState::Configuring;
                } else {
                    match self.qbt.get_listening_port().await {
                        Ok(qbt_port) if qbt_port == new_port => {
                            debug!(port = new_port, "port unchanged");
                            self.state = ServiceState::Monitoring;
                        }
                        Ok(qbt_port) => {
                            warn!(expected = new_port, actual = qbt_port, "qBittorrent port drifted");
                            self.state = ServiceState::Configuring;
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to verify qBittorrent port");
                            self.state = ServiceState::Configuring;
                        }
                    }
                }

                self.state_data.save(&self.config.service.state_file_path);
            }
            Err(e) => {
                error!(error = %e, "NAT-PMP error");
                self.handle_failure();
                self.state = ServiceState::WaitingVpn;
            }
        }
    }

    async fn configure_qbittorrent(&mut self) {
        let Some(desired_port) = self.state_data.current_port else {
            error!("no port available for configuration");
            self.state = ServiceState::MappingPort;
            return;
        };

        let current_port = match self.qbt.get_listening_port().await {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "qBittorrent configuration error");
                self.handle_failure();
                return;
            }
        };
        let current_interface = match self.qbt.get_network_interface().await {
            Ok(i) => i,
            Err(e) => {
                error!(error = %e, "qBittorrent configuration error");
                self.handle_failure();
                return;
            }
        };

        let needs_update = current_port != desired_port
            || current_interface != self.config.qbittorrent.interface_binding;

        if needs_update {
            info!(
                port = desired_port,
                interface = %self.config.qbittorrent.interface_binding,
                "updating qBittorrent configuration"
            );
            if let Err(e) = self
                .qbt
                .update_port_and_interface(desired_port, &self.config.qbittorrent.interface_binding)
                .await
            {
                error!(error = %e, "qBittorrent configuration error");
                self.handle_failure();
                return;
            }
            info!("qBittorrent configuration updated");
        }

        self.state_data.consecutive_failures = 0;
        self.state = ServiceState::Monitoring;
    }

    async fn monitor(&mut self) {
        let now = Utc::now();

        let vpn_check_due = self
            .state_data
            .last_vpn_check
            .map(|last| {
                (now - last).num_seconds() as u64
                    >= self.config.wireguard.health_check_interval_secs
            })
            .unwrap_or(true);

        if vpn_check_due {
            match self.vpn.is_healthy().await {
                Ok(true) => self.state_data.last_vpn_check = Some(now),
                Ok(false) => {
                    warn!("VPN health check failed");
                    self.state = ServiceState::WaitingVpn;
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "VPN health check failed");
                    self.state = ServiceState::WaitingVpn;
                    return;
                }
            }
        }

        let refresh_due = self
            .state_data
            .last_port_refresh
            .map(|last| {
                (now - last).num_seconds() as u64 >= self.config.natpmp.refresh_interval_secs
            })
            .unwrap_or(true);

        if refresh_due {
            self.state = ServiceState::MappingPort;
            return;
        }

        if !self.qbt.is_reachable().await {
            warn!("qBittorrent is no longer reachable");
            self.state = ServiceState::WaitingQbt;
            return;
        }
        match self
            .qbt
            .verify_interface_binding(&self.config.qbittorrent.interface_binding)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!("qBittorrent interface binding changed, reconfiguring");
                self.state = ServiceState::Configuring;
                return;
            }
            Err(e) => {
                warn!(error = %e, "failed to verify qBittorrent");
                self.state = ServiceState::WaitingQbt;
                return;
            }
        }

        if let Some(killswitch) = &self.killswitch {
            match killswitch.verify().await {
                Ok(true) => {}
                Ok(false) => {
                    warn!("killswitch rules missing, re-establishing");
                    if let Err(e) = killswitch.setup().await {
                        error!(error = %e, "failed to re-establish killswitch");
                        self.handle_failure();
                    }
                }
                Err(e) => {
                    error!(error = %e, "failed to verify killswitch");
                    self.handle_failure();
                }
            }
        }

        let sleep_for = self
            .config
            .wireguard
            .health_check_interval()
            .min(self.config.natpmp.refresh_interval());
        self.interruptible_sleep(sleep_for).await;
    }

    async fn recover(&mut self) {
        warn!(
            consecutive_failures = self.state_data.consecutive_failures,
            "in recovery mode"
        );

        let backoff = self.calculate_backoff();
        info!(backoff_secs = backoff.as_secs(), "backing off");
        self.interruptible_sleep(backoff).await;

        self.state = ServiceState::WaitingVpn;
    }

    fn handle_failure(&mut self) {
        self.state_data.consecutive_failures += 1;
        warn!(count = self.state_data.consecutive_failures, "failure count incremented");

        if self.state_data.consecutive_failures >= self.config.service.max_consecutive_failures {
            error!(
                max = self.config.service.max_consecutive_failures,
                "max consecutive failures reached, entering recovery"
            );
            self.state = ServiceState::Recovering;
        }
    }

    fn calculate_backoff(&self) -> Duration {
        let base = self.config.service.failure_backoff_base_secs as f64;
        let max_delay = self.config.service.failure_backoff_max_secs as f64;
        let exponent = self.state_data.consecutive_failures.min(32);

        let delay = (base * 2f64.powi(exponent as i32)).min(max_delay);
        let jitter = rand::thread_rng().gen_range(0.0..(delay * 0.1).max(0.0001));
        Duration::from_secs((delay + jitter) as u64)
    }

    async fn cleanup(&mut self) {
        info!("shutting down");

        if let Some(killswitch) = &self.killswitch {
            killswitch.cleanup().await;
        }

        self.state_data.save(&self.config.service.state_file_path);
        sd_notify("STOPPING=1");

        info!("shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn test_config() -> Config {
        Config {
            wireguard: crate::config::WireGuardConfig::default(),
            natpmp: crate::config::NatPmpConfig::default(),
            qbittorrent: crate::config::QBittorrentConfig::default(),
            service: crate::config::ServiceConfig {
                max_consecutive_failures: 3,
                failure_backoff_base_secs: 4,
                failure_backoff_max_secs: 60,
                ..crate::config::ServiceConfig::default()
            },
            killswitch: crate::config::KillswitchConfig::default(),
        }
    }

    fn test_supervisor() -> Supervisor {
        let config = test_config();
        Supervisor {
            vpn: VpnMonitor::new(config.wireguard.interface_name.clone(), Ipv4Addr::LOCALHOST),
            natpmp: NatPmpClient::new(config.natpmp.gateway),
            qbt: QBittorrentClient::new(&config.qbittorrent).unwrap(),
            killswitch: None,
            state: ServiceState::Initializing,
            state_data: ServiceStateData::default(),
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(tokio::sync::Notify::new()),
            config,
        }
    }

    #[test]
    fn backoff_doubles_per_failure_up_to_the_cap() {
        let mut supervisor = test_supervisor();

        supervisor.state_data.consecutive_failures = 0;
        let delay0 = supervisor.calculate_backoff().as_secs_f64();
        assert!((4.0..4.5).contains(&delay0));

        supervisor.state_data.consecutive_failures = 1;
        let delay1 = supervisor.calculate_backoff().as_secs_f64();
        assert!((8.0..9.0).contains(&delay1));

        supervisor.state_data.consecutive_failures = 10;
        let delay_capped = supervisor.calculate_backoff().as_secs_f64();
        assert!(delay_capped <= 66.0);
    }

    #[test]
    fn handle_failure_enters_recovery_at_threshold() {
        let mut supervisor = test_supervisor();
        supervisor.state = ServiceState::Monitoring;

        supervisor.handle_failure();
        assert_eq!(supervisor.state, ServiceState::Monitoring);
        supervisor.handle_failure();
        assert_eq!(supervisor.state, ServiceState::Monitoring);
        supervisor.handle_failure();
        assert_eq!(supervisor.state, ServiceState::Recovering);
    }
}
