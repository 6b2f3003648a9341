//! Portable dependency installation
//!
//! Downloads pinned releases of the two external binaries into the user's
//! bin directory: `sslocal` from shadowsocks-rust (a `.tar.xz`) and
//! `tun2socks` (a `.zip`). Both installs are skipped when the binary is
//! already present, in the bin dir or anywhere on `PATH`.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

const SS_VERSION: &str = "1.24.0";
const T2S_VERSION: &str = "v2.5.2";

#[derive(Error, Debug)]
pub enum InstallError {
    #[error("architecture {0} is not covered by the release archives")]
    UnsupportedArch(String),
    #[error("download failed: {0}")]
    Download(#[from] reqwest::Error),
    #[error("archive error: {0}")]
    Archive(String),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Install locations of both dependencies.
#[derive(Debug, Clone)]
pub struct InstalledDeps {
    pub bin_dir: PathBuf,
    pub sslocal: PathBuf,
    pub tun2socks: PathBuf,
}

/// Release-archive architecture labels: (shadowsocks, tun2socks).
pub fn release_arch(machine: &str) -> Result<(&'static str, &'static str), InstallError> {
    match machine {
        "x86_64" | "amd64" => Ok(("x86_64", "amd64")),
        "aarch64" | "arm64" => Ok(("aarch64", "arm64")),
        other => Err(InstallError::UnsupportedArch(other.to_string())),
    }
}

fn current_arch() -> Result<(&'static str, &'static str), InstallError> {
    release_arch(std::env::consts::ARCH)
}

pub fn relay_release_url(ss_arch: &str) -> String {
    format!(
        "https://github.com/shadowsocks/shadowsocks-rust/releases/download/v{SS_VERSION}/shadowsocks-v{SS_VERSION}.{ss_arch}-unknown-linux-gnu.tar.xz"
    )
}

pub fn adapter_release_url(t2s_arch: &str) -> String {
    format!(
        "https://github.com/xjasonlyu/tun2socks/releases/download/{T2S_VERSION}/tun2socks-linux-{t2s_arch}.zip"
    )
}

/// Locate an executable: the bin dir first, then a `PATH` scan.
pub fn find_binary(name: &str, bin_dir: &Path) -> Option<PathBuf> {
    let local = bin_dir.join(name);
    if is_executable(&local) {
        return Some(local);
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Ensure both binaries exist under `bin_dir`, downloading what is missing.
pub async fn install_all(bin_dir: &Path) -> Result<InstalledDeps, InstallError> {
    let sslocal = install_relay_client(bin_dir).await?;
    let tun2socks = install_tunnel_adapter(bin_dir).await?;
    Ok(InstalledDeps {
        bin_dir: bin_dir.to_path_buf(),
        sslocal,
        tun2socks,
    })
}

async fn install_relay_client(bin_dir: &Path) -> Result<PathBuf, InstallError> {
    if let Some(existing) = find_binary("sslocal", bin_dir) {
        info!("sslocal already installed at {}", existing.display());
        return Ok(existing);
    }

    let (ss_arch, _) = current_arch()?;
    let url = relay_release_url(ss_arch);
    info!("installing sslocal v{}", SS_VERSION);

    let scratch = tempfile::tempdir()?;
    let archive = scratch.path().join("shadowsocks.tar.xz");
    download(&url, &archive).await?;

    // xz-compressed tar, extract just the one member we need
    let status = std::process::Command::new("tar")
        .arg("-xJf")
        .arg(&archive)
        .arg("-C")
        .arg(scratch.path())
        .arg("sslocal")
        .status()?;
    if !status.success() {
        return Err(InstallError::Archive(
            "tar could not extract sslocal".to_string(),
        ));
    }

    let payload = std::fs::read(scratch.path().join("sslocal"))?;
    let dest = bin_dir.join("sslocal");
    write_executable(&dest, &payload)?;
    info!("sslocal installed to {}", dest.display());
    Ok(dest)
}

async fn install_tunnel_adapter(bin_dir: &Path) -> Result<PathBuf, InstallError> {
    if let Some(existing) = find_binary("tun2socks", bin_dir) {
        info!("tun2socks already installed at {}", existing.display());
        return Ok(existing);
    }

    let (_, t2s_arch) = current_arch()?;
    let url = adapter_release_url(t2s_arch);
    info!("installing tun2socks {}", T2S_VERSION);

    let scratch = tempfile::tempdir()?;
    let archive = scratch.path().join("tun2socks.zip");
    download(&url, &archive).await?;

    // the zip holds a single arch-suffixed binary that gets renamed here
    let member = format!("tun2socks-linux-{t2s_arch}");
    let file = std::fs::File::open(&archive)?;
    let mut zip = zip::ZipArchive::new(file)?;
    let name = zip
        .file_names()
        .find(|n| *n == member || n.ends_with(&format!("/{member}")))
        .map(String::from)
        .ok_or_else(|| InstallError::Archive(format!("{member} not found in archive")))?;

    let mut entry = zip.by_name(&name)?;
    let mut payload = Vec::new();
    std::io::copy(&mut entry, &mut payload)?;

    let dest = bin_dir.join("tun2socks");
    write_executable(&dest, &payload)?;
    info!("tun2socks installed to {}", dest.display());
    Ok(dest)
}

async fn download(url: &str, dest: &Path) -> Result<(), InstallError> {
    info!("downloading {}", url);
    let response = reqwest::get(url).await?.error_for_status()?;
    let bytes = response.bytes().await?;
    std::fs::write(dest, &bytes)?;
    Ok(())
}

fn write_executable(dest: &Path, payload: &[u8]) -> Result<(), InstallError> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(dest, payload)?;
    std::fs::set_permissions(dest, std::fs::Permissions::from_mode(0o755))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_release_arch_mapping() {
        assert_eq!(release_arch("x86_64").unwrap(), ("x86_64", "amd64"));
        assert_eq!(release_arch("amd64").unwrap(), ("x86_64", "amd64"));
        assert_eq!(release_arch("aarch64").unwrap(), ("aarch64", "arm64"));
        assert_eq!(release_arch("arm64").unwrap(), ("aarch64", "arm64"));
    }

    #[test]
    fn test_release_arch_rejects_unknown() {
        let result = release_arch("riscv64");
        assert!(matches!(result, Err(InstallError::UnsupportedArch(_))));
    }

    #[test]
    fn test_release_urls_carry_pinned_versions() {
        let relay = relay_release_url("x86_64");
        assert!(relay.contains("shadowsocks-rust/releases/download/v1.24.0/"));
        assert!(relay.ends_with("shadowsocks-v1.24.0.x86_64-unknown-linux-gnu.tar.xz"));

        let adapter = adapter_release_url("amd64");
        assert!(adapter.contains("tun2socks/releases/download/v2.5.2/"));
        assert!(adapter.ends_with("tun2socks-linux-amd64.zip"));
    }

    #[test]
    fn test_find_binary_prefers_bin_dir() {
        let temp = TempDir::new().unwrap();
        let local = temp.path().join("fakebin");
        write_executable(&local, b"#!/bin/sh\n").unwrap();

        assert_eq!(find_binary("fakebin", temp.path()), Some(local));
    }

    #[test]
    fn test_find_binary_requires_exec_bit() {
        let temp = TempDir::new().unwrap();
        let local = temp.path().join("notexec");
        std::fs::write(&local, b"data").unwrap();
        std::fs::set_permissions(&local, std::fs::Permissions::from_mode(0o644)).unwrap();

        assert_eq!(find_binary("notexec", temp.path()), None);
    }

    #[test]
    fn test_find_binary_missing_everywhere() {
        let temp = TempDir::new().unwrap();
        assert_eq!(
            find_binary("sstun-no-such-binary-2b7f", temp.path()),
            None
        );
    }

    #[test]
    fn test_write_executable_sets_mode() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("nested").join("tool");
        write_executable(&dest, b"payload").unwrap();

        let mode = dest.metadata().unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
        assert_eq!(std::fs::read(&dest).unwrap(), b"payload");
    }
}
