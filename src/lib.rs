//! corral: local control plane for a single-node cluster-in-a-VM.
//!
//! A long-running daemon (`corral-daemon`) serves structured commands over a
//! unix-domain socket, drives the guest VM over SSH, and pins the host-side
//! `vfkit` helper binary through a versioned artifact cache.
//!
//! Module map:
//!
//! - [`api`] — the control-plane socket server (one JSON request/response
//!   per connection).
//! - [`ssh`] — remote execution inside the guest via a pluggable driver.
//! - [`cache`] — versioned download-and-verify cache for helper binaries.
//! - [`machine`] — the cluster client abstraction and its vfkit-backed
//!   implementation.
//! - [`config`] — schema-validated daemon configuration store.

pub mod api;
pub mod cache;
pub mod config;
pub mod logging;
pub mod machine;
pub mod paths;
pub mod ssh;
pub mod version;
