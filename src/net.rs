//! Kernel network state management
//!
//! Creates and destroys the TUN interface, assigns its address, and manages
//! the split-tunnel routing table through ip(8). Everything applied to the
//! host is recorded in [`NetworkState`] so teardown undoes exactly what was
//! done, even after a partial start-up.
//!
//! Commands go through the [`CommandRunner`] seam; tests substitute a
//! recording runner so routing logic is exercised without root.

use std::process::Command;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum NetError {
    #[error("failed to run `{command}`: {source}")]
    CommandFailed {
        command: String,
        source: std::io::Error,
    },
    #[error("`{command}` failed: {stderr}")]
    CommandRejected { command: String, stderr: String },
}

/// Outcome of one shell command.
pub struct CmdOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Seam for issuing ip(8) commands.
pub trait CommandRunner {
    fn run(&self, program: &str, args: &[&str]) -> std::io::Result<CmdOutput>;
}

/// Runs commands against the real system.
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> std::io::Result<CmdOutput> {
        let output = Command::new(program).args(args).output()?;
        Ok(CmdOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Host-specific route keeping relay traffic out of the tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRoute {
    pub destination: String,
    pub gateway: String,
}

/// What has actually been applied to the host. Every set field corresponds
/// to a real kernel-visible change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkState {
    pub tun_created: bool,
    pub tun_address_assigned: bool,
    pub relay_host_route: Option<RelayRoute>,
    pub split_routes_installed: bool,
}

impl NetworkState {
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }
}

pub struct NetworkConfigurator<R: CommandRunner = SystemRunner> {
    runner: R,
}

impl NetworkConfigurator<SystemRunner> {
    pub fn new() -> Self {
        Self {
            runner: SystemRunner,
        }
    }
}

impl Default for NetworkConfigurator<SystemRunner> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: CommandRunner> NetworkConfigurator<R> {
    pub fn with_runner(runner: R) -> Self {
        Self { runner }
    }

    /// Delete any stale interface of the same name, then create a fresh TUN
    /// device, assign its address, and bring it up.
    ///
    /// The unconditional delete absorbs leftovers from a crashed session;
    /// "does not exist" is not an error. Create, assign, and up failures are
    /// fatal to session start.
    pub fn reset_interface(
        &self,
        device: &str,
        cidr: &str,
        state: &mut NetworkState,
    ) -> Result<(), NetError> {
        info!("resetting interface {}", device);
        self.best_effort("ip", &["link", "delete", device]);

        self.checked("ip", &["tuntap", "add", "dev", device, "mode", "tun"])?;
        state.tun_created = true;

        self.checked("ip", &["addr", "add", cidr, "dev", device])?;
        state.tun_address_assigned = true;

        self.checked("ip", &["link", "set", "dev", device, "up"])?;
        info!("interface {} up with {}", device, cidr);
        Ok(())
    }

    /// Gateway of the current default route, if one exists.
    pub fn default_gateway(&self) -> Option<String> {
        let output = self.runner.run("ip", &["route", "show", "default"]).ok()?;
        if !output.success {
            return None;
        }
        parse_default_gateway(&output.stdout)
    }

    /// Pin the relay's traffic to the pre-session default gateway so it is
    /// never captured by the split routes.
    ///
    /// Best-effort: without a default gateway the step is skipped, which
    /// risks a routing loop on some networks but is not fatal.
    pub fn install_host_route(&self, destination: &str, state: &mut NetworkState) {
        let Some(gateway) = self.default_gateway() else {
            warn!("no default gateway found, skipping relay host route");
            return;
        };

        // replace, not add: a stale route from a previous session must not
        // make this fail
        match self.checked("ip", &["route", "replace", destination, "via", &gateway]) {
            Ok(()) => {
                info!("host route installed: {} via {}", destination, gateway);
                state.relay_host_route = Some(RelayRoute {
                    destination: destination.to_string(),
                    gateway,
                });
            }
            Err(e) => warn!("could not install relay host route: {}", e),
        }
    }

    /// Route the two half-ranges through the TUN device. This captures all
    /// traffic while leaving the original default route entry untouched,
    /// which keeps rollback to plain interface deletion.
    pub fn install_split_routes(
        &self,
        device: &str,
        state: &mut NetworkState,
    ) -> Result<(), NetError> {
        self.checked("ip", &["route", "replace", "0.0.0.0/1", "dev", device])?;
        self.checked("ip", &["route", "replace", "128.0.0.0/1", "dev", device])?;
        state.split_routes_installed = true;
        info!("split-tunnel routes installed via {}", device);
        Ok(())
    }

    /// Undo whatever `state` says was applied. Unconditional and
    /// best-effort: a failing step is logged and the rest still runs, and a
    /// second invocation against a clean host does nothing.
    pub fn teardown(&self, device: &str, state: &mut NetworkState) {
        if state.tun_created {
            // deleting the interface also drops the split routes bound to it
            self.best_effort("ip", &["link", "delete", device]);
            state.tun_created = false;
            state.tun_address_assigned = false;
            state.split_routes_installed = false;
        }

        if let Some(route) = state.relay_host_route.take() {
            self.best_effort("ip", &["route", "del", &route.destination]);
        }

        debug!("network teardown complete for {}", device);
    }

    fn checked(&self, program: &str, args: &[&str]) -> Result<(), NetError> {
        let command = render(program, args);
        debug!("running: {}", command);
        let output = self
            .runner
            .run(program, args)
            .map_err(|source| NetError::CommandFailed {
                command: command.clone(),
                source,
            })?;
        if !output.success {
            return Err(NetError::CommandRejected {
                command,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    fn best_effort(&self, program: &str, args: &[&str]) {
        let command = render(program, args);
        debug!("running (best-effort): {}", command);
        match self.runner.run(program, args) {
            Ok(output) if !output.success => {
                debug!("`{}` reported: {}", command, output.stderr.trim());
            }
            Ok(_) => {}
            Err(e) => warn!("could not run `{}`: {}", command, e),
        }
    }
}

fn render(program: &str, args: &[&str]) -> String {
    format!("{} {}", program, args.join(" "))
}

/// Extract the gateway address from `ip route show default` output.
fn parse_default_gateway(output: &str) -> Option<String> {
    for line in output.lines() {
        let mut tokens = line.split_whitespace();
        if tokens.next() != Some("default") {
            continue;
        }
        let mut tokens = tokens.peekable();
        while let Some(token) = tokens.next() {
            if token == "via" {
                return tokens.next().map(|gw| gw.to_string());
            }
        }
    }
    None
}
