//! Session configuration resolution
//!
//! Settings come from three layers, strongest first:
//!
//! 1. Environment variables (`SS_URL`, `TUN_DEV`, `TUN_ADDR`, `SOCKS_PORT`,
//!    `SSTUN_BIN_DIR`)
//! 2. An optional TOML file at `~/.config/sstun/config.toml`
//! 3. Built-in defaults (`tun0`, `10.255.0.2/24`, port 1080)
//!
//! When running under sudo, "home" means the invoking user's home, not
//! `/root`, so the config file and portable binaries are found where the
//! user actually installed them.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub const ENV_DESCRIPTOR: &str = "SS_URL";
pub const ENV_TUN_DEV: &str = "TUN_DEV";
pub const ENV_TUN_ADDR: &str = "TUN_ADDR";
pub const ENV_SOCKS_PORT: &str = "SOCKS_PORT";
pub const ENV_BIN_DIR: &str = "SSTUN_BIN_DIR";

/// Environment variables preserved across a sudo re-exec.
pub const PRESERVED_ENV_VARS: &[&str] = &[
    ENV_DESCRIPTOR,
    ENV_TUN_DEV,
    ENV_TUN_ADDR,
    ENV_SOCKS_PORT,
    ENV_BIN_DIR,
];

const DEFAULT_TUN_DEVICE: &str = "tun0";
const DEFAULT_TUN_ADDR: &str = "10.255.0.2/24";
const DEFAULT_SOCKS_PORT: u16 = 1080;
const APP_DIRNAME: &str = "sstun";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
}

/// Resolved settings for one session. Read-only to every component.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// TUN interface name, e.g. "tun0"
    pub tun_device: String,
    /// CIDR address assigned to the TUN interface
    pub tun_addr: String,
    /// Local port the relay client's SOCKS proxy binds to
    pub socks_port: u16,
    /// The `ss://` connection descriptor, if configured
    pub descriptor_url: Option<String>,
    /// Directory holding portable sslocal/tun2socks binaries
    pub bin_dir: PathBuf,
}

/// Optional on-disk overrides, all fields individually omissible.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    pub tun_device: Option<String>,
    pub tun_addr: Option<String>,
    pub socks_port: Option<u16>,
    pub descriptor: Option<String>,
    pub bin_dir: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

impl SessionConfig {
    /// Resolve configuration from the config file and process environment.
    pub fn resolve() -> Result<Self, ConfigError> {
        let file = match config_file_path() {
            Some(path) if path.exists() => {
                debug!("loading config file {}", path.display());
                Some(FileConfig::load(&path)?)
            }
            _ => None,
        };
        Ok(Self::from_sources(file, |key| env::var(key)))
    }

    /// Layer env vars over file values over defaults. The env getter is
    /// injectable for tests.
    pub fn from_sources<F>(file: Option<FileConfig>, get_var: F) -> Self
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        let file = file.unwrap_or_default();

        let tun_device = get_var(ENV_TUN_DEV)
            .ok()
            .or(file.tun_device)
            .unwrap_or_else(|| DEFAULT_TUN_DEVICE.to_string());

        let tun_addr = get_var(ENV_TUN_ADDR)
            .ok()
            .or(file.tun_addr)
            .unwrap_or_else(|| DEFAULT_TUN_ADDR.to_string());

        let socks_port = get_var(ENV_SOCKS_PORT)
            .ok()
            .and_then(|v| v.parse().ok())
            .or(file.socks_port)
            .unwrap_or(DEFAULT_SOCKS_PORT);

        let descriptor_url = get_var(ENV_DESCRIPTOR).ok().or(file.descriptor);

        let bin_dir = get_var(ENV_BIN_DIR)
            .ok()
            .or(file.bin_dir)
            .map(|p| expand_home(&p))
            .unwrap_or_else(default_bin_dir);

        Self {
            tun_device,
            tun_addr,
            socks_port,
            descriptor_url,
            bin_dir,
        }
    }

    /// Log file capturing the relay client's combined stdout/stderr.
    pub fn relay_log_path(&self) -> PathBuf {
        PathBuf::from("/tmp/sstun-sslocal.log")
    }

    /// Log file capturing the tunnel adapter's combined stdout/stderr.
    pub fn adapter_log_path(&self) -> PathBuf {
        PathBuf::from("/tmp/sstun-tun2socks.log")
    }
}

/// Home directory of the invoking user.
///
/// Under sudo `dirs::home_dir()` reports `/root`; portable binaries and the
/// config file live in the original user's home, looked up via `SUDO_USER`.
pub fn effective_home() -> Option<PathBuf> {
    #[cfg(unix)]
    if let Ok(sudo_user) = env::var("SUDO_USER") {
        if sudo_user != "root" {
            if let Ok(Some(user)) = nix::unistd::User::from_name(&sudo_user) {
                return Some(user.dir);
            }
        }
    }
    dirs::home_dir()
}

/// `$XDG_DATA_HOME/sstun/bin` (or `~/.local/share/sstun/bin`) of the
/// invoking user.
pub fn default_bin_dir() -> PathBuf {
    let data_home = env::var("XDG_DATA_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| effective_home().map(|h| h.join(".local").join("share")))
        .unwrap_or_else(|| PathBuf::from("/usr/local/share"));
    data_home.join(APP_DIRNAME).join("bin")
}

fn config_file_path() -> Option<PathBuf> {
    let config_home = env::var("XDG_CONFIG_HOME")
        .ok()
        .map(PathBuf::from)
        .or_else(|| effective_home().map(|h| h.join(".config")))?;
    Some(config_home.join(APP_DIRNAME).join("config.toml"))
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = effective_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn make_getter(
        vars: HashMap<String, String>,
    ) -> impl Fn(&str) -> Result<String, env::VarError> {
        move |key: &str| vars.get(key).cloned().ok_or(env::VarError::NotPresent)
    }

    #[test]
    fn test_defaults_without_sources() {
        let config = SessionConfig::from_sources(None, make_getter(HashMap::new()));
        assert_eq!(config.tun_device, "tun0");
        assert_eq!(config.tun_addr, "10.255.0.2/24");
        assert_eq!(config.socks_port, 1080);
        assert!(config.descriptor_url.is_none());
    }

    #[test]
    fn test_env_overrides_file() {
        let file = FileConfig {
            tun_device: Some("tun9".to_string()),
            socks_port: Some(9090),
            ..Default::default()
        };
        let mut vars = HashMap::new();
        vars.insert(ENV_TUN_DEV.to_string(), "tun5".to_string());

        let config = SessionConfig::from_sources(Some(file), make_getter(vars));
        // env wins over file
        assert_eq!(config.tun_device, "tun5");
        // file wins over default
        assert_eq!(config.socks_port, 9090);
    }

    #[test]
    fn test_file_values_used_when_env_absent() {
        let file = FileConfig {
            tun_addr: Some("10.99.0.2/24".to_string()),
            descriptor: Some("ss://abc@host:1".to_string()),
            ..Default::default()
        };
        let config = SessionConfig::from_sources(Some(file), make_getter(HashMap::new()));
        assert_eq!(config.tun_addr, "10.99.0.2/24");
        assert_eq!(config.descriptor_url.as_deref(), Some("ss://abc@host:1"));
    }

    #[test]
    fn test_invalid_env_port_falls_through() {
        let mut vars = HashMap::new();
        vars.insert(ENV_SOCKS_PORT.to_string(), "not-a-port".to_string());
        let config = SessionConfig::from_sources(None, make_getter(vars));
        assert_eq!(config.socks_port, 1080);
    }

    #[test]
    fn test_bin_dir_env_override() {
        let mut vars = HashMap::new();
        vars.insert(ENV_BIN_DIR.to_string(), "/opt/sstun/bin".to_string());
        let config = SessionConfig::from_sources(None, make_getter(vars));
        assert_eq!(config.bin_dir, PathBuf::from("/opt/sstun/bin"));
    }

    #[test]
    fn test_file_config_parses_toml() {
        let parsed: FileConfig = toml::from_str(
            r#"
            tun_device = "tun7"
            socks_port = 1081
            "#,
        )
        .unwrap();
        assert_eq!(parsed.tun_device.as_deref(), Some("tun7"));
        assert_eq!(parsed.socks_port, Some(1081));
        assert!(parsed.descriptor.is_none());
    }

    #[test]
    fn test_log_paths_are_distinct() {
        let config = SessionConfig::from_sources(None, make_getter(HashMap::new()));
        assert_ne!(config.relay_log_path(), config.adapter_log_path());
    }
}
