use clap::{Parser, Subcommand};
use sstun::config::PRESERVED_ENV_VARS;
use sstun::{Session, SessionConfig};
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "sstun")]
#[command(about = "Personal split-tunnel VPN manager wrapping Shadowsocks and tun2socks")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the VPN session and supervise it until interrupted
    Start {
        /// Download sslocal/tun2socks first if they are missing
        #[arg(long)]
        install_deps: bool,
        /// Re-exec through sudo when not running as root (default)
        #[arg(long, overrides_with = "no_sudo")]
        sudo: bool,
        /// Fail instead of escalating through sudo
        #[arg(long)]
        no_sudo: bool,
    },
    /// Stop any running session and clean up interface and routes
    Stop {
        /// Re-exec through sudo when not running as root (default)
        #[arg(long, overrides_with = "no_sudo")]
        sudo: bool,
        /// Fail instead of escalating through sudo
        #[arg(long)]
        no_sudo: bool,
    },
    /// Show session state derived from the live system
    Status,
    /// Download sslocal and tun2socks into the portable bin directory
    InstallDeps,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Start {
            install_deps,
            no_sudo,
            ..
        } => {
            ensure_root(!no_sudo);
            let config = SessionConfig::resolve()?;

            if install_deps {
                if let Err(e) = sstun::install::install_all(&config.bin_dir).await {
                    error!("dependency installation failed: {}", e);
                    std::process::exit(1);
                }
            }

            let mut session = Session::new(config);
            if let Err(e) = session.run().await {
                error!("{}", e);
                std::process::exit(1);
            }
        }
        Commands::Stop { no_sudo, .. } => {
            ensure_root(!no_sudo);
            let config = SessionConfig::resolve()?;
            sstun::stop(&config);
        }
        Commands::Status => {
            let config = SessionConfig::resolve()?;
            let report = sstun::probe_status(&config);

            let render_bin = |path: &Option<std::path::PathBuf>| match path {
                Some(p) => p.display().to_string(),
                None => "not found".to_string(),
            };
            println!(
                "Session: {}",
                if report.active() { "active" } else { "inactive" }
            );
            println!(
                "  {}: {}",
                report.tun_device,
                if report.tun_up { "up" } else { "down" }
            );
            println!(
                "  sslocal: {} ({})",
                render_bin(&report.relay_binary),
                if report.relay_running { "running" } else { "stopped" }
            );
            println!(
                "  tun2socks: {} ({})",
                render_bin(&report.adapter_binary),
                if report.adapter_running { "running" } else { "stopped" }
            );
            println!("  bin dir: {}", config.bin_dir.display());
        }
        Commands::InstallDeps => {
            if nix::unistd::geteuid().is_root() {
                info!("hint: install-deps usually works better without sudo");
            }
            let config = SessionConfig::resolve()?;
            match sstun::install::install_all(&config.bin_dir).await {
                Ok(deps) => {
                    println!("Dependencies installed");
                    println!("  bin dir:   {}", deps.bin_dir.display());
                    println!("  sslocal:   {}", deps.sslocal.display());
                    println!("  tun2socks: {}", deps.tun2socks.display());
                }
                Err(e) => {
                    error!("dependency installation failed: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

/// Exit or escalate when not running as root. With escalation allowed the
/// process replaces itself with `sudo <current invocation>`, preserving the
/// session-relevant environment variables.
fn ensure_root(allow_sudo: bool) {
    if nix::unistd::geteuid().is_root() {
        return;
    }
    if allow_sudo {
        reexec_with_sudo();
    }
    error!("root privileges required; re-run under sudo or drop --no-sudo");
    std::process::exit(1);
}

fn reexec_with_sudo() -> ! {
    use std::os::unix::process::CommandExt;

    info!("root required, re-running under sudo");
    let exe = std::env::current_exe().unwrap_or_else(|_| "sstun".into());
    let err = std::process::Command::new("sudo")
        .arg(format!("--preserve-env={}", PRESERVED_ENV_VARS.join(",")))
        .arg("--")
        .arg(exe)
        .args(std::env::args_os().skip(1))
        .exec();

    // exec only returns on failure
    error!("could not exec sudo: {}", err);
    std::process::exit(1);
}
