//! Cluster client abstraction over the managed VM.
//!
//! The control plane depends only on the [`ClusterClient`] contract: a
//! status snapshot and an existence check by name. The concrete
//! [`VfkitClient`] reads VM power state from the vfkit REST endpoint
//! (`GET /vm/state`) and probes workload health and disk usage through the
//! SSH [`Runner`](crate::ssh::Runner).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ssh::Runner;
use crate::version;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Snapshot of VM and cluster health, produced fresh on every `status`
/// request. Field names are fixed by the client wire protocol.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClusterStatusResult {
    pub name: String,
    /// VM power state ("Running", "Stopped", ...).
    pub crc_status: String,
    /// Workload-platform health ("Running", "Unreachable", ...).
    pub openshift_status: String,
    pub openshift_version: String,
    /// Bytes used on the guest root filesystem.
    pub disk_use: u64,
    /// Bytes total on the guest root filesystem.
    pub disk_size: u64,
    pub success: bool,
    pub error: String,
}

// ---------------------------------------------------------------------------
// Client contract
// ---------------------------------------------------------------------------

/// VM/cluster lifecycle and status, shared by all connection handlers.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn status(&self) -> Result<ClusterStatusResult>;
    async fn exists(&self, name: &str) -> Result<bool>;
}

// ---------------------------------------------------------------------------
// vfkit-backed client
// ---------------------------------------------------------------------------

/// Client driving a vfkit-hosted guest.
pub struct VfkitClient {
    name: String,
    rest_port: u16,
    http: reqwest::Client,
    runner: Arc<Runner>,
}

#[derive(Debug, Deserialize)]
struct VmStateBody {
    state: String,
}

impl VfkitClient {
    pub fn new(name: impl Into<String>, rest_port: u16, runner: Arc<Runner>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("build http client")?;
        Ok(Self { name: name.into(), rest_port, http, runner })
    }

    /// VM power state from the vfkit REST API. A connection error means the
    /// vfkit process is not running, which is a valid "Stopped" answer
    /// rather than a failure.
    async fn vm_state(&self) -> Result<String> {
        let url = format!("http://localhost:{}/vm/state", self.rest_port);
        let response = match self.http.get(&url).send().await {
            Ok(response) => response,
            Err(e) if e.is_connect() => {
                debug!(port = self.rest_port, "vfkit REST endpoint unreachable");
                return Ok("Stopped".to_owned());
            }
            Err(e) => return Err(e).context("query vfkit REST state"),
        };

        if !response.status().is_success() {
            bail!("vfkit REST state returned HTTP {}", response.status().as_u16());
        }

        let body: VmStateBody = response.json().await.context("decode vfkit state body")?;
        // vfkit reports Virtualization.framework state names
        // ("VirtualMachineStateRunning"); collapse to the wire vocabulary.
        Ok(if body.state.ends_with("Running") {
            "Running".to_owned()
        } else {
            "Stopped".to_owned()
        })
    }

    /// Guest root filesystem usage in bytes, via `df` over SSH.
    async fn disk_usage(&self) -> Result<(u64, u64)> {
        let runner = self.runner.clone();
        let output = tokio::task::spawn_blocking(move || {
            runner.run("df -B1 --output=size,used /sysroot | tail -1")
        })
        .await
        .context("disk usage task failed")??;

        let mut fields = output.split_whitespace();
        let size = fields
            .next()
            .and_then(|f| f.parse().ok())
            .context("parse disk size from df output")?;
        let used = fields
            .next()
            .and_then(|f| f.parse().ok())
            .context("parse disk use from df output")?;
        Ok((used, size))
    }

    /// Workload health: the kube-apiserver healthz endpoint inside the
    /// guest, probed over SSH.
    async fn workload_status(&self) -> Result<String> {
        let runner = self.runner.clone();
        let output = tokio::task::spawn_blocking(move || {
            runner.run("curl -k -s -o /dev/null -w '%{http_code}' https://localhost:6443/healthz")
        })
        .await
        .context("workload probe task failed")??;

        Ok(if output.trim() == "200" {
            "Running".to_owned()
        } else {
            "Unreachable".to_owned()
        })
    }
}

#[async_trait]
impl ClusterClient for VfkitClient {
    async fn status(&self) -> Result<ClusterStatusResult> {
        let crc_status = self.vm_state().await?;

        if crc_status != "Running" {
            return Ok(ClusterStatusResult {
                name: self.name.clone(),
                crc_status,
                success: true,
                ..Default::default()
            });
        }

        let (disk_use, disk_size) = self.disk_usage().await?;
        let openshift_status = self.workload_status().await?;

        Ok(ClusterStatusResult {
            name: self.name.clone(),
            crc_status,
            openshift_status,
            openshift_version: version::BUNDLE_VERSION.to_owned(),
            disk_use,
            disk_size,
            success: true,
            error: String::new(),
        })
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(name == self.name)
    }
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------

/// Canned [`ClusterClient`] used by the daemon's own tests.
pub struct FakeClient {
    failing: bool,
}

impl FakeClient {
    /// Healthy client returning [`FakeClient::canned_status`].
    pub fn new() -> Self {
        Self { failing: false }
    }

    /// Client whose `status` always fails with "broken".
    pub fn failing() -> Self {
        Self { failing: true }
    }

    /// The status every healthy `FakeClient` reports.
    pub fn canned_status() -> ClusterStatusResult {
        ClusterStatusResult {
            name: "corral".to_owned(),
            crc_status: "Running".to_owned(),
            openshift_status: "Running".to_owned(),
            openshift_version: "4.19.0".to_owned(),
            disk_use: 10_000_000_000,
            disk_size: 20_000_000_000,
            success: true,
            error: String::new(),
        }
    }
}

impl Default for FakeClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterClient for FakeClient {
    async fn status(&self) -> Result<ClusterStatusResult> {
        if self.failing {
            bail!("broken");
        }
        Ok(Self::canned_status())
    }

    async fn exists(&self, _name: &str) -> Result<bool> {
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_result_serializes_with_wire_field_names() {
        let status = FakeClient::canned_status();
        let json = serde_json::to_value(&status).unwrap();

        assert_eq!(json["Name"], "corral");
        assert_eq!(json["CrcStatus"], "Running");
        assert_eq!(json["OpenshiftStatus"], "Running");
        assert_eq!(json["OpenshiftVersion"], "4.19.0");
        assert_eq!(json["DiskUse"], 10_000_000_000u64);
        assert_eq!(json["DiskSize"], 20_000_000_000u64);
        assert_eq!(json["Success"], true);
        assert_eq!(json["Error"], "");
    }

    #[test]
    fn default_status_is_zero_valued() {
        let status = ClusterStatusResult::default();
        assert_eq!(status.name, "");
        assert_eq!(status.disk_use, 0);
        assert_eq!(status.disk_size, 0);
        assert!(!status.success);
    }

    #[tokio::test]
    async fn failing_fake_reports_broken() {
        let client = FakeClient::failing();
        let err = client.status().await.unwrap_err();
        assert_eq!(err.to_string(), "broken");
    }
}
