//! Child process supervision
//!
//! The session runs two external binaries: the relay client (`sslocal`,
//! exposing a local SOCKS proxy) and the tunnel adapter (`tun2socks`,
//! shoveling packets between the TUN device and that proxy). This module
//! spawns them with their output captured to log files, polls their
//! liveness, and terminates them gracefully with a bounded SIGKILL
//! escalation.
//!
//! Also here: the best-effort port reaper that clears a stale listener off
//! the local SOCKS port before the relay client binds it.

use crate::descriptor::ConnectionDescriptor;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// How long the relay client gets before its single liveness check.
pub const STARTUP_CONFIRM_DELAY: Duration = Duration::from_secs(1);
/// Liveness poll cadence for the supervision loop.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Grace period between SIGTERM and SIGKILL.
const GRACEFUL_EXIT_WAIT: Duration = Duration::from_secs(2);
/// How much captured output to surface when a child dies at start-up.
const LOG_TAIL_BYTES: u64 = 2048;

#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("failed to open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to launch {kind}: {source}")]
    Launch {
        kind: ProcessKind,
        source: std::io::Error,
    },
    #[error("{kind} exited during start-up ({status}); last output:\n{log_tail}")]
    ExitedAtStartup {
        kind: ProcessKind,
        status: String,
        log_tail: String,
    },
}

/// The two supervised children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessKind {
    RelayClient,
    TunnelAdapter,
}

impl ProcessKind {
    pub fn binary_name(self) -> &'static str {
        match self {
            ProcessKind::RelayClient => "sslocal",
            ProcessKind::TunnelAdapter => "tun2socks",
        }
    }

    /// Command-line pattern (for pgrep/pkill -f) identifying this process
    /// from an invocation with no shared in-memory state.
    pub fn match_pattern(self, socks_port: u16, tun_device: &str) -> String {
        match self {
            ProcessKind::RelayClient => format!("sslocal.*:{}", socks_port),
            ProcessKind::TunnelAdapter => format!("tun2socks.*{}", tun_device),
        }
    }
}

impl std::fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.binary_name())
    }
}

/// Arguments for the relay client: server endpoint, cipher, secret, local
/// SOCKS bind, UDP relay enabled.
pub fn relay_client_args(descriptor: &ConnectionDescriptor, socks_port: u16) -> Vec<String> {
    vec![
        "-s".to_string(),
        format!("{}:{}", descriptor.host, descriptor.port),
        "-m".to_string(),
        descriptor.method.clone(),
        "-k".to_string(),
        descriptor.password.clone(),
        "-b".to_string(),
        format!("127.0.0.1:{}", socks_port),
        "-U".to_string(),
    ]
}

/// Arguments for the tunnel adapter: TUN device and SOCKS proxy URL.
pub fn tunnel_adapter_args(tun_device: &str, socks_port: u16) -> Vec<String> {
    vec![
        "-device".to_string(),
        tun_device.to_string(),
        "-proxy".to_string(),
        format!("socks5://127.0.0.1:{}", socks_port),
    ]
}

/// One supervised child. At most one live instance per [`ProcessKind`] per
/// session; only the supervisor mutates it.
pub struct ManagedProcess {
    kind: ProcessKind,
    child: Child,
    log_path: PathBuf,
    last_exit: Option<ExitStatus>,
}

impl ManagedProcess {
    /// Launch the child with stdout and stderr appended to `log_path`.
    /// Returns as soon as the process is spawned.
    pub fn spawn(
        kind: ProcessKind,
        program: &Path,
        args: &[String],
        log_path: &Path,
    ) -> Result<Self, SpawnError> {
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .map_err(|source| SpawnError::LogFile {
                path: log_path.to_path_buf(),
                source,
            })?;
        let log_err = log.try_clone().map_err(|source| SpawnError::LogFile {
            path: log_path.to_path_buf(),
            source,
        })?;

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            // last-resort guard: if the controlling process dies without
            // teardown, the child must not outlive it
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SpawnError::Launch { kind, source })?;

        info!(
            "{} started (pid {:?}), logging to {}",
            kind,
            child.id(),
            log_path.display()
        );

        Ok(Self {
            kind,
            child,
            log_path: log_path.to_path_buf(),
            last_exit: None,
        })
    }

    pub fn kind(&self) -> ProcessKind {
        self.kind
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Non-blocking liveness check.
    pub fn is_alive(&mut self) -> bool {
        if self.last_exit.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                self.last_exit = Some(status);
                false
            }
            Err(e) => {
                warn!("could not poll {}: {}", self.kind, e);
                false
            }
        }
    }

    pub fn last_exit_status(&self) -> Option<ExitStatus> {
        self.last_exit
    }

    /// Wait out the start-up confirmation delay, then check liveness once.
    /// An already-exited child is a fatal start-up error carrying the tail
    /// of its captured log.
    pub async fn confirm_started(&mut self) -> Result<(), SpawnError> {
        tokio::time::sleep(STARTUP_CONFIRM_DELAY).await;
        if self.is_alive() {
            debug!("{} confirmed alive", self.kind);
            return Ok(());
        }
        let status = self
            .last_exit
            .map(|s| s.to_string())
            .unwrap_or_else(|| "status unknown".to_string());
        Err(SpawnError::ExitedAtStartup {
            kind: self.kind,
            status,
            log_tail: read_log_tail(&self.log_path),
        })
    }

    /// Graceful termination: SIGTERM, bounded wait, then SIGKILL.
    /// Idempotent; terminating an already-exited child is a no-op.
    pub async fn terminate(&mut self) {
        if !self.is_alive() {
            debug!("{} already exited, nothing to terminate", self.kind);
            return;
        }

        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;
            debug!("sending SIGTERM to {} (pid {})", self.kind, pid);
            // ESRCH here just means the child beat us to exiting
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }

        match tokio::time::timeout(GRACEFUL_EXIT_WAIT, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!("{} terminated ({})", self.kind, status);
                self.last_exit = Some(status);
            }
            Ok(Err(e)) => warn!("waiting for {} failed: {}", self.kind, e),
            Err(_) => {
                warn!("{} ignored SIGTERM, killing", self.kind);
                let _ = self.child.kill().await;
                if let Ok(status) = self.child.try_wait() {
                    self.last_exit = status;
                }
            }
        }
    }
}

/// Last chunk of a child's log file, for error reporting.
fn read_log_tail(path: &Path) -> String {
    let Ok(content) = std::fs::read(path) else {
        return String::from("<log unavailable>");
    };
    let skip = content.len().saturating_sub(LOG_TAIL_BYTES as usize);
    String::from_utf8_lossy(&content[skip..]).trim().to_string()
}

/// `true` when `port` can be bound on localhost.
pub fn port_available(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Clear a stale listener off `port` before the relay client binds it.
///
/// Purely an optimization against bind conflicts from a crashed session;
/// every failure is swallowed because the relay client's own start-up
/// confirmation catches the downstream effect.
pub async fn reclaim_port(port: u16) {
    if port_available(port) {
        return;
    }
    warn!("port {} is busy, reclaiming it", port);
    let _ = std::process::Command::new("fuser")
        .args(["-k", &format!("{}/tcp", port)])
        .output();
    // grace period for the old listener to die
    tokio::time::sleep(Duration::from_secs(1)).await;
}

/// `true` when a process matching `pattern` (full command line) is running.
pub fn pattern_running(pattern: &str) -> bool {
    std::process::Command::new("pgrep")
        .args(["-f", pattern])
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Kill every process matching `pattern`. Best-effort.
pub fn kill_matching(pattern: &str) {
    let _ = std::process::Command::new("pkill")
        .args(["-f", pattern])
        .output();
}
