//! Key-credential files
//!
//! One private key per local user and region, named `{user}-{region}.pem`
//! and kept in the user's download directory unless `PEM_FILE` says
//! otherwise.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::info;

pub const KEY_EXTENSION: &str = "pem";

/// Cloud-side key pair name for a user and region
pub fn key_pair_name(user: &str, region: &str) -> String {
    format!("{}-{}", user, region)
}

/// Default key location: the download directory, else `~/Downloads`, else the
/// working directory
pub fn default_key_path(
    download_dir: Option<PathBuf>,
    home_dir: Option<PathBuf>,
    user: &str,
    region: &str,
) -> PathBuf {
    let dir = download_dir
        .or_else(|| home_dir.map(|h| h.join("Downloads")))
        .unwrap_or_default();
    dir.join(format!("{}.{}", key_pair_name(user, region), KEY_EXTENSION))
}

/// Key pair name implied by a key file path
pub fn key_name_from_path(path: &Path) -> Option<String> {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
}

/// Write fresh key material, readable by the owner only. Never overwrites an
/// existing file.
pub fn write_key_file(path: &Path, material: &str) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(material.as_bytes())?;
    if !material.ends_with('\n') {
        file.write_all(b"\n")?;
    }
    file.sync_all()?;
    info!("Wrote key file {}", path.display());
    Ok(())
}
