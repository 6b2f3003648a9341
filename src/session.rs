//! Session orchestration
//!
//! The state machine tying everything together. Start-up is linear: parse
//! the descriptor, reclaim the SOCKS port, spawn and confirm the relay
//! client, reset the TUN interface, spawn the tunnel adapter, install the
//! routes. From there a supervision loop polls both children once a second
//! until one of them dies or the user interrupts, and teardown unwinds
//! whatever was actually applied, in every exit path.
//!
//! Teardown is unconditional and best-effort: a failing step never stops
//! the remaining steps, and the relay client is never left orphaned after a
//! mid-setup fault.

use crate::config::SessionConfig;
use crate::descriptor;
use crate::install;
use crate::net::{NetError, NetworkConfigurator, NetworkState, RelayRoute};
use crate::process::{self, ManagedProcess, ProcessKind, SpawnError};
use crate::state::SessionRecord;
use std::path::PathBuf;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("no connection descriptor configured; set SS_URL or `descriptor` in the config file")]
    MissingDescriptor,
    #[error(transparent)]
    Parse(#[from] descriptor::ParseError),
    #[error("required binary `{0}` not found; run `sstun install-deps`")]
    MissingBinary(&'static str),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error(transparent)]
    Net(#[from] NetError),
    #[error("{kind} exited unexpectedly; see {}", .log.display())]
    ProcessDied { kind: ProcessKind, log: PathBuf },
}

/// Lifecycle phases of one session. Linear on the happy path; `Degraded`
/// marks a detected runtime fault before teardown begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    ParsingConfig,
    StartingRelay,
    ConfiguringNetwork,
    StartingTunnel,
    RoutingActive,
    Running,
    Degraded,
    TearingDown,
    Stopped,
}

/// One live VPN session. Exactly one per invocation of `start`; nothing is
/// shared across invocations except the on-disk [`SessionRecord`].
pub struct Session {
    config: SessionConfig,
    state: SessionState,
    network: NetworkState,
    relay: Option<ManagedProcess>,
    adapter: Option<ManagedProcess>,
    record_saved: bool,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            state: SessionState::Idle,
            network: NetworkState::default(),
            relay: None,
            adapter: None,
            record_saved: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Bring the session up, supervise it until it ends, and tear it down.
    ///
    /// Every exit path runs teardown against the accumulated state, so a
    /// fault after the relay client is live cannot orphan it.
    pub async fn run(&mut self) -> Result<(), SessionError> {
        match self.start().await {
            Ok(()) => {
                let outcome = self.supervise().await;
                self.teardown().await;
                outcome
            }
            Err(e) => {
                self.teardown().await;
                Err(e)
            }
        }
    }

    async fn start(&mut self) -> Result<(), SessionError> {
        self.state = SessionState::ParsingConfig;
        let url = self
            .config
            .descriptor_url
            .clone()
            .ok_or(SessionError::MissingDescriptor)?;
        let descriptor = descriptor::parse(&url)?;
        info!(
            "relay: {} ({}), method {}",
            descriptor.host, descriptor.resolved_addr, descriptor.method
        );

        // Preconditions before any mutation
        let relay_bin = install::find_binary(
            ProcessKind::RelayClient.binary_name(),
            &self.config.bin_dir,
        )
        .ok_or(SessionError::MissingBinary("sslocal"))?;
        let adapter_bin = install::find_binary(
            ProcessKind::TunnelAdapter.binary_name(),
            &self.config.bin_dir,
        )
        .ok_or(SessionError::MissingBinary("tun2socks"))?;

        process::reclaim_port(self.config.socks_port).await;

        self.state = SessionState::StartingRelay;
        info!("starting relay client");
        let relay = ManagedProcess::spawn(
            ProcessKind::RelayClient,
            &relay_bin,
            &process::relay_client_args(&descriptor, self.config.socks_port),
            &self.config.relay_log_path(),
        )?;
        // register before confirming so teardown covers a half-started relay
        let relay = self.relay.insert(relay);
        relay.confirm_started().await?;

        self.state = SessionState::ConfiguringNetwork;
        let net = NetworkConfigurator::new();
        net.reset_interface(
            &self.config.tun_device,
            &self.config.tun_addr,
            &mut self.network,
        )?;

        self.state = SessionState::StartingTunnel;
        info!("starting tunnel adapter");
        // a stale adapter from a crashed session would fight over the device
        process::kill_matching(
            &ProcessKind::TunnelAdapter
                .match_pattern(self.config.socks_port, &self.config.tun_device),
        );
        let adapter = ManagedProcess::spawn(
            ProcessKind::TunnelAdapter,
            &adapter_bin,
            &process::tunnel_adapter_args(&self.config.tun_device, self.config.socks_port),
            &self.config.adapter_log_path(),
        )?;
        self.adapter = Some(adapter);

        net.install_host_route(&descriptor.resolved_addr, &mut self.network);
        net.install_split_routes(&self.config.tun_device, &mut self.network)?;
        self.state = SessionState::RoutingActive;

        let record = SessionRecord::new(
            self.config.tun_device.clone(),
            self.config.socks_port,
            self.network
                .relay_host_route
                .as_ref()
                .map(|r| r.destination.clone()),
        );
        match record.save() {
            Ok(()) => self.record_saved = true,
            Err(e) => warn!("could not persist session record: {}", e),
        }

        info!("VPN connected, press Ctrl+C to stop");
        self.state = SessionState::Running;
        Ok(())
    }

    /// Poll both children at a fixed interval until one exits or the user
    /// interrupts. `Ok(())` means a clean interrupt; `Err` a runtime fault.
    /// Interrupt latency is bounded by the poll interval.
    async fn supervise(&mut self) -> Result<(), SessionError> {
        let mut poll = tokio::time::interval(process::POLL_INTERVAL);
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    if let Some(fault) = self.check_children() {
                        self.state = SessionState::Degraded;
                        return Err(fault);
                    }
                }
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        warn!("could not listen for interrupt: {}", e);
                    }
                    info!("interrupt received, stopping");
                    return Ok(());
                }
            }
        }
    }

    /// A dead child is a fatal runtime fault; a half-failed VPN session
    /// must not silently continue, and no restart is attempted.
    fn check_children(&mut self) -> Option<SessionError> {
        for proc in [&mut self.relay, &mut self.adapter].into_iter().flatten() {
            if !proc.is_alive() {
                error!(
                    "{} exited unexpectedly ({:?})",
                    proc.kind(),
                    proc.last_exit_status()
                );
                return Some(SessionError::ProcessDied {
                    kind: proc.kind(),
                    log: proc.log_path().to_path_buf(),
                });
            }
        }
        None
    }

    /// Terminate both children, unwind the network state, drop the session
    /// record. Safe to call with any subset of resources acquired.
    pub async fn teardown(&mut self) {
        self.state = SessionState::TearingDown;
        info!("cleaning up session resources");

        if let Some(mut relay) = self.relay.take() {
            relay.terminate().await;
        }
        if let Some(mut adapter) = self.adapter.take() {
            adapter.terminate().await;
        }

        NetworkConfigurator::new().teardown(&self.config.tun_device, &mut self.network);

        if self.record_saved {
            if let Err(e) = SessionRecord::delete() {
                warn!("could not remove session record: {}", e);
            }
            self.record_saved = false;
        }

        self.state = SessionState::Stopped;
        info!("session stopped");
    }
}

/// OS-derived view of session activity. Probed fresh every time, no shared
/// in-memory state.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub tun_device: String,
    pub tun_up: bool,
    pub relay_running: bool,
    pub adapter_running: bool,
    pub relay_binary: Option<PathBuf>,
    pub adapter_binary: Option<PathBuf>,
}

impl StatusReport {
    /// Active means interface plus both processes are present.
    pub fn active(&self) -> bool {
        self.tun_up && self.relay_running && self.adapter_running
    }
}

/// Answer "is a session currently active" purely from OS-visible signals:
/// interface existence and command-line pattern matches.
pub fn probe_status(config: &SessionConfig) -> StatusReport {
    let tun_up = std::process::Command::new("ip")
        .args(["link", "show", &config.tun_device])
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false);

    let relay_running = process::pattern_running(
        &ProcessKind::RelayClient.match_pattern(config.socks_port, &config.tun_device),
    );
    let adapter_running = process::pattern_running(
        &ProcessKind::TunnelAdapter.match_pattern(config.socks_port, &config.tun_device),
    );

    StatusReport {
        tun_device: config.tun_device.clone(),
        tun_up,
        relay_running,
        adapter_running,
        relay_binary: install::find_binary("sslocal", &config.bin_dir),
        adapter_binary: install::find_binary("tun2socks", &config.bin_dir),
    }
}

/// Out-of-band stop, usable from an invocation that never held the live
/// session. Kills both command-line patterns, deletes the interface, and
/// best-effort removes the relay host route.
pub fn stop(config: &SessionConfig) {
    info!("stopping VPN session");

    // The host route survives interface deletion, so its target is needed:
    // from the session record if one was persisted, else re-derived from
    // the configured descriptor. Either source may be absent; then the
    // route cleanup silently no-ops.
    let relay_addr = match SessionRecord::load() {
        Ok(Some(record)) => record.relay_addr,
        Ok(None) => config
            .descriptor_url
            .as_deref()
            .and_then(|url| descriptor::parse(url).ok())
            .map(|d| d.resolved_addr),
        Err(e) => {
            warn!("unreadable session record: {}", e);
            None
        }
    };

    info!("stopping processes");
    process::kill_matching(
        &ProcessKind::RelayClient.match_pattern(config.socks_port, &config.tun_device),
    );
    process::kill_matching(
        &ProcessKind::TunnelAdapter.match_pattern(config.socks_port, &config.tun_device),
    );

    info!("removing interface {}", config.tun_device);
    let mut state = NetworkState {
        tun_created: true,
        relay_host_route: relay_addr.map(|destination| RelayRoute {
            destination,
            // gateway is irrelevant for deletion
            gateway: String::new(),
        }),
        ..Default::default()
    };
    NetworkConfigurator::new().teardown(&config.tun_device, &mut state);

    if let Err(e) = SessionRecord::delete() {
        warn!("could not remove session record: {}", e);
    }
    info!("VPN stopped, traffic flows directly again");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_config(bin_dir: &Path) -> SessionConfig {
        let vars: HashMap<String, String> = HashMap::new();
        let mut config = SessionConfig::from_sources(None, move |key| {
            vars.get(key).cloned().ok_or(std::env::VarError::NotPresent)
        });
        config.bin_dir = bin_dir.to_path_buf();
        config
    }

    #[test]
    fn test_new_session_is_idle() {
        let temp = TempDir::new().unwrap();
        let session = Session::new(test_config(temp.path()));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_run_without_descriptor_fails_cleanly() {
        let temp = TempDir::new().unwrap();
        let mut session = Session::new(test_config(temp.path()));

        let result = session.run().await;
        assert!(matches!(result, Err(SessionError::MissingDescriptor)));
        // teardown always runs, even when nothing was set up
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(session.network.is_clean());
    }

    #[tokio::test]
    async fn test_run_with_malformed_descriptor_fails_before_any_mutation() {
        let temp = TempDir::new().unwrap();
        let mut config = test_config(temp.path());
        config.descriptor_url = Some("ss://no-at-sign-here:8388".to_string());
        let mut session = Session::new(config);

        let result = session.run().await;
        assert!(matches!(result, Err(SessionError::Parse(_))));
        assert!(session.relay.is_none());
        assert!(session.network.is_clean());
    }

    #[tokio::test]
    async fn test_supervision_detects_child_exit() {
        let temp = TempDir::new().unwrap();
        let mut session = Session::new(test_config(temp.path()));

        // stand-ins for the real children: the relay dies after half a
        // second, the adapter would live on
        session.relay = Some(
            ManagedProcess::spawn(
                ProcessKind::RelayClient,
                Path::new("sh"),
                &["-c".to_string(), "sleep 0.5".to_string()],
                &temp.path().join("relay.log"),
            )
            .unwrap(),
        );
        session.adapter = Some(
            ManagedProcess::spawn(
                ProcessKind::TunnelAdapter,
                Path::new("sleep"),
                &["30".to_string()],
                &temp.path().join("adapter.log"),
            )
            .unwrap(),
        );
        session.state = SessionState::Running;

        // fault must surface within roughly one poll interval of the exit
        let outcome = tokio::time::timeout(Duration::from_secs(5), session.supervise())
            .await
            .expect("supervision loop should have noticed the dead child");
        match outcome {
            Err(SessionError::ProcessDied { kind, .. }) => {
                assert_eq!(kind, ProcessKind::RelayClient);
            }
            other => panic!("expected ProcessDied, got {other:?}"),
        }
        assert_eq!(session.state(), SessionState::Degraded);

        session.teardown().await;
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(session.relay.is_none());
        assert!(session.adapter.is_none());
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let mut session = Session::new(test_config(temp.path()));

        session.teardown().await;
        assert_eq!(session.state(), SessionState::Stopped);
        session.teardown().await;
        assert_eq!(session.state(), SessionState::Stopped);
    }
}
