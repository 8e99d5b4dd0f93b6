//! corral-daemon: local control-plane daemon for the corral VM.
//!
//! Binds the control socket, pins the vfkit helper binary, wires the SSH
//! runner and cluster client, and serves commands until killed.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::UnixListener;
use tracing::info;

use corral::{api, cache, config, logging, machine, paths, ssh, version};

/// Local control-plane daemon for the corral VM.
#[derive(Parser, Debug)]
#[command(name = "corral-daemon", version, about = "corral control-plane daemon")]
struct Args {
    /// Control socket path (defaults to the data directory)
    #[arg(long)]
    socket: Option<std::path::PathBuf>,

    /// Name of the managed VM instance
    #[arg(long, default_value = "corral")]
    name: String,

    /// Port of the vfkit REST management API
    #[arg(long, default_value_t = 8081)]
    vfkit_rest_port: u16,

    /// Host-side port forwarded to the guest's sshd
    #[arg(long, default_value_t = 2222)]
    ssh_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let paths = paths::CorralPaths::resolve().context("HOME is not set")?;
    paths.ensure().context("create application directories")?;
    let _log_guard = logging::init(&paths.logs);

    info!(
        version = version::version(),
        commit = version::commit_sha(),
        "corral-daemon starting"
    );

    // The vfkit helper must be present and version-pinned before the VM can
    // be created or controlled.
    let vfkit = cache::Cache::for_vfkit(&paths.bin);
    let vfkit_path = vfkit.ensure().await.context("ensure vfkit helper")?;
    info!(path = %vfkit_path.display(), version = version::VFKIT_VERSION, "vfkit helper ready");

    let store = Arc::new(
        config::Store::load(paths.config.join("corral.toml")).context("load configuration")?,
    );

    let driver = Arc::new(ssh::OpenSshDriver::new("127.0.0.1", args.ssh_port, "core"));
    let runner = Arc::new(ssh::Runner::new(driver, paths.machine.join("id_ecdsa")));
    let client = Arc::new(machine::VfkitClient::new(
        args.name.clone(),
        args.vfkit_rest_port,
        runner,
    )?);

    let socket = args.socket.unwrap_or_else(|| paths.socket_path());
    // A stale socket from a previous run blocks the bind.
    let _ = std::fs::remove_file(&socket);
    let listener = UnixListener::bind(&socket)
        .with_context(|| format!("bind control socket {}", socket.display()))?;
    info!(socket = %socket.display(), "control plane listening");

    api::Server::new(listener, client, store, args.name).serve().await
}
