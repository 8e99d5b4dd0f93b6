//! Application directory structure for corral.
//!
//! Provides a single `CorralPaths` struct that resolves all standard
//! directories and ensures they exist on first launch. Follows macOS
//! conventions:
//!
//! - Config:  `~/.config/corral/`  (human-editable, XDG-style)
//! - Data:    `~/Library/Application Support/dev.corral.corral/`
//! - Cache:   `~/Library/Caches/dev.corral.corral/`
//! - Logs:    `~/Library/Logs/corral/`
//!
//! On non-macOS, falls back to XDG paths. The control-plane socket lives in
//! the data directory so its permissions follow the user's home directory.

use std::path::{Path, PathBuf};

use tracing::info;

const BUNDLE_ID: &str = "dev.corral.corral";
const APP_NAME: &str = "corral";

/// All resolved application directory paths.
#[derive(Debug, Clone)]
pub struct CorralPaths {
    /// Human-editable config: `~/.config/corral/`
    pub config: PathBuf,
    /// Machine-managed application data root
    pub data: PathBuf,
    /// Version-pinned hypervisor helper binaries (vfkit)
    pub bin: PathBuf,
    /// Per-instance VM state: disk image, SSH keys, bundle metadata
    pub machine: PathBuf,
    /// Regenerable cache data (downloaded bundles)
    pub cache: PathBuf,
    /// Daemon logs
    pub logs: PathBuf,
}

impl CorralPaths {
    /// Resolve all paths from the user's home directory.
    /// Does not create any directories — call `ensure()` for that.
    pub fn resolve() -> Option<Self> {
        let home = std::env::var("HOME").ok().map(PathBuf::from)?;

        let config = resolve_config_dir(&home);
        let data = resolve_data_dir(&home);
        let cache = resolve_cache_dir(&home);
        let logs = resolve_log_dir(&home);

        Some(Self {
            config,
            bin: data.join("bin"),
            machine: data.join("machine"),
            data,
            cache,
            logs,
        })
    }

    /// Path of the control-plane unix socket.
    pub fn socket_path(&self) -> PathBuf {
        self.data.join("corral.sock")
    }

    /// Create all directories that don't already exist.
    /// Applies Time Machine exclusions to regenerable directories on macOS.
    pub fn ensure(&self) -> std::io::Result<()> {
        let dirs = [
            &self.config,
            &self.data,
            &self.bin,
            &self.machine,
            &self.cache,
            &self.logs,
        ];

        for dir in &dirs {
            std::fs::create_dir_all(dir)?;
            info!("ensured directory: {}", dir.display());
        }

        // Exclude large/regenerable directories from Time Machine
        #[cfg(target_os = "macos")]
        {
            let tm_exclude = [&self.bin, &self.cache];
            for dir in &tm_exclude {
                exclude_from_time_machine(dir);
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Platform-specific path resolution
// ---------------------------------------------------------------------------

fn resolve_config_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".config").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_data_dir(home: &Path) -> PathBuf {
    home.join("Library")
        .join("Application Support")
        .join(BUNDLE_ID)
}

#[cfg(not(target_os = "macos"))]
fn resolve_data_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".local").join("share").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_cache_dir(home: &Path) -> PathBuf {
    home.join("Library").join("Caches").join(BUNDLE_ID)
}

#[cfg(not(target_os = "macos"))]
fn resolve_cache_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CACHE_HOME") {
        PathBuf::from(xdg).join(APP_NAME)
    } else {
        home.join(".cache").join(APP_NAME)
    }
}

#[cfg(target_os = "macos")]
fn resolve_log_dir(home: &Path) -> PathBuf {
    home.join("Library").join("Logs").join(APP_NAME)
}

#[cfg(not(target_os = "macos"))]
fn resolve_log_dir(home: &Path) -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
        PathBuf::from(xdg).join(APP_NAME).join("logs")
    } else {
        home.join(".local").join("share").join(APP_NAME).join("logs")
    }
}

// ---------------------------------------------------------------------------
// Time Machine exclusion (macOS only)
// ---------------------------------------------------------------------------

#[cfg(target_os = "macos")]
fn exclude_from_time_machine(path: &Path) {
    use std::process::Command;
    match Command::new("tmutil")
        .args(["addexclusion", &path.to_string_lossy()])
        .output()
    {
        Ok(output) if output.status.success() => {
            info!("TM-excluded: {}", path.display());
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("tmutil addexclusion failed for {}: {}", path.display(), stderr.trim());
        }
        Err(e) => {
            warn!("failed to run tmutil for {}: {e}", path.display());
        }
    }
}
