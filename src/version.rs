//! Static build identifiers and pinned helper-binary versions.
//!
//! Everything here is baked in at compile time; the `version` control-plane
//! command reports these values verbatim.

/// Daemon version, taken from the crate manifest.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Short git commit sha injected by `build.rs` (`"unknown"` outside a
/// checkout).
pub fn commit_sha() -> &'static str {
    env!("CORRAL_COMMIT_SHA")
}

/// Version of the OpenShift bundle this build provisions.
pub const BUNDLE_VERSION: &str = "4.19.0";

/// Pinned version of the vfkit hypervisor helper.
pub const VFKIT_VERSION: &str = "0.6.1";

/// Release URL for the pinned vfkit binary.
pub fn vfkit_download_url() -> String {
    format!("https://github.com/crc-org/vfkit/releases/download/v{VFKIT_VERSION}/vfkit")
}
