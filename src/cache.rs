//! Versioned artifact cache for host-side hypervisor helper binaries.
//!
//! Guarantees a binary exists at its destination path at the expected
//! version before it is first needed. The warm path (correct binary already
//! installed) is a single version probe with no locking and no network
//! access. The install path downloads into a temp file in the destination
//! directory and atomically renames it into place, so a concurrent reader
//! never observes a partially written binary.
//!
//! Installs are single-flight per destination path: a process-global lock
//! registry collapses concurrent installs of the same artifact into one
//! download, and every caller observes the same fully installed result.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use tracing::{debug, info};

use crate::version;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Distinct failure conditions reported to the caller. None of them leave a
/// half-written file at the destination path.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("downloading {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("installing {dest}: {source}")]
    Install {
        dest: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("version probe for {path} failed: {source}")]
    Probe {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("{binary} reports version {actual}, expected {expected}")]
    Verification {
        binary: String,
        expected: String,
        actual: String,
    },
}

/// Reports the version of the binary at `path` (typically by running it
/// with `--version` and parsing the output).
pub type VersionProbe = Arc<dyn Fn(&Path) -> anyhow::Result<String> + Send + Sync>;

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

pub struct Cache {
    binary_name: String,
    download_url: String,
    dest_dir: PathBuf,
    expected_version: String,
    get_version: VersionProbe,
}

impl Cache {
    pub fn new(
        binary_name: impl Into<String>,
        download_url: impl Into<String>,
        dest_dir: impl Into<PathBuf>,
        expected_version: impl Into<String>,
        get_version: VersionProbe,
    ) -> Self {
        Self {
            binary_name: binary_name.into(),
            download_url: download_url.into(),
            dest_dir: dest_dir.into(),
            expected_version: expected_version.into(),
            get_version,
        }
    }

    /// Cache for the pinned vfkit hypervisor helper.
    ///
    /// The probe runs `vfkit --version` and takes the last whitespace-
    /// separated token (`vfkit version: 0.6.1`).
    pub fn for_vfkit(dest_dir: impl Into<PathBuf>) -> Self {
        Self::new(
            "vfkit",
            version::vfkit_download_url(),
            dest_dir,
            version::VFKIT_VERSION,
            Arc::new(|path| {
                let output = std::process::Command::new(path)
                    .arg("--version")
                    .output()
                    .map_err(|e| anyhow::anyhow!("spawn {}: {e}", path.display()))?;
                let stdout = String::from_utf8_lossy(&output.stdout);
                stdout
                    .split_whitespace()
                    .last()
                    .map(str::to_owned)
                    .ok_or_else(|| anyhow::anyhow!("empty --version output"))
            }),
        )
    }

    /// Final path of the installed binary.
    pub fn dest_path(&self) -> PathBuf {
        self.dest_dir.join(&self.binary_name)
    }

    /// Ensure the binary exists at its destination at the expected version,
    /// downloading and installing it if needed. Returns the final path.
    pub async fn ensure(&self) -> Result<PathBuf, CacheError> {
        let dest = self.dest_path();

        // Warm path: correct version already installed.
        if self.is_current().await {
            debug!(binary = %self.binary_name, path = %dest.display(), "cache hit");
            return Ok(dest);
        }

        let lock = install_lock(&dest);
        let _guard = lock.lock().await;

        // A concurrent caller may have installed while we waited.
        if self.is_current().await {
            debug!(binary = %self.binary_name, "cache filled by concurrent install");
            return Ok(dest);
        }

        self.download_and_install().await?;

        // Trust nothing: re-probe the installed file.
        let actual = self.probe(&dest).await.map_err(|source| CacheError::Probe {
            path: dest.clone(),
            source,
        })?;
        if actual != self.expected_version {
            return Err(CacheError::Verification {
                binary: self.binary_name.clone(),
                expected: self.expected_version.clone(),
                actual,
            });
        }

        info!(
            binary = %self.binary_name,
            version = %self.expected_version,
            path = %dest.display(),
            "artifact installed"
        );
        Ok(dest)
    }

    /// Lock-free warm-path check: file present and probe reports the
    /// expected version. Missing file, unreadable file, probe failure, and
    /// version mismatch all fall through to the install path.
    async fn is_current(&self) -> bool {
        let dest = self.dest_path();
        if !dest.exists() {
            return false;
        }
        matches!(self.probe(&dest).await, Ok(actual) if actual == self.expected_version)
    }

    async fn probe(&self, path: &Path) -> anyhow::Result<String> {
        let probe = Arc::clone(&self.get_version);
        let path = path.to_path_buf();
        // Probes run a subprocess; keep them off the async workers.
        tokio::task::spawn_blocking(move || probe(&path))
            .await
            .map_err(|e| anyhow::anyhow!("version probe task failed: {e}"))?
    }

    async fn download_and_install(&self) -> Result<(), CacheError> {
        debug!(
            binary = %self.binary_name,
            url = %self.download_url,
            "downloading artifact"
        );

        let response = reqwest::get(&self.download_url)
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|source| CacheError::Download {
                url: self.download_url.clone(),
                source,
            })?;
        let bytes = response.bytes().await.map_err(|source| CacheError::Download {
            url: self.download_url.clone(),
            source,
        })?;

        let dest_dir = self.dest_dir.clone();
        let dest = self.dest_path();
        let dest_for_install = dest.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            std::fs::create_dir_all(&dest_dir)?;

            // Temp file in the destination directory: same filesystem, so
            // the final rename is atomic.
            let mut tmp = tempfile::NamedTempFile::new_in(&dest_dir)?;
            tmp.write_all(&bytes)?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                tmp.as_file()
                    .set_permissions(std::fs::Permissions::from_mode(0o755))?;
            }

            tmp.persist(&dest_for_install).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| CacheError::Install {
            dest: dest.clone(),
            source: std::io::Error::other(e),
        })?
        .map_err(|source| CacheError::Install { dest, source })
    }
}

// ---------------------------------------------------------------------------
// Per-destination install locks
// ---------------------------------------------------------------------------

fn install_lock(dest: &Path) -> Arc<tokio::sync::Mutex<()>> {
    static LOCKS: OnceLock<Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>> =
        OnceLock::new();
    LOCKS
        .get_or_init(Mutex::default)
        .lock()
        .expect("install lock registry poisoned")
        .entry(dest.to_path_buf())
        .or_default()
        .clone()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
