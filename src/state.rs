//! Persisted session record
//!
//! A small JSON file written once the session reaches routing-active, so a
//! later `sstun stop` from a fresh process can remove the relay host route
//! without re-parsing the descriptor. Absence of the file is not an error;
//! stop and status both degrade gracefully without it.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::debug;

const STATE_FILE: &str = "/run/sstun/session.json";

#[derive(Error, Debug)]
pub enum StateError {
    #[error("failed to access state file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("failed to parse state file: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// What a running session left behind for later invocations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionRecord {
    /// TUN interface the session created
    pub tun_device: String,
    /// Local SOCKS port the relay client bound
    pub socks_port: u16,
    /// Resolved relay address a host route was installed for, if any
    pub relay_addr: Option<String>,
    /// Unix timestamp of session start
    pub started_at: u64,
}

impl SessionRecord {
    pub fn new(tun_device: String, socks_port: u16, relay_addr: Option<String>) -> Self {
        let started_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            tun_device,
            socks_port,
            relay_addr,
            started_at,
        }
    }

    pub fn default_path() -> PathBuf {
        PathBuf::from(STATE_FILE)
    }

    pub fn save(&self) -> Result<(), StateError> {
        self.save_to(&Self::default_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), StateError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        debug!("session record saved to {}", path.display());
        Ok(())
    }

    /// Load the record if one exists. Missing file means no session was
    /// recorded, which is a normal condition, not an error.
    pub fn load() -> Result<Option<Self>, StateError> {
        Self::load_from(&Self::default_path())
    }

    pub fn load_from(path: &Path) -> Result<Option<Self>, StateError> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Remove the record. Idempotent.
    pub fn delete() -> Result<(), StateError> {
        Self::delete_at(&Self::default_path())
    }

    pub fn delete_at(path: &Path) -> Result<(), StateError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
