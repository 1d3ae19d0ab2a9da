//! Remote GPU pod provisioning.
//!
//! [`ComputeProvider`] is the lifecycle contract the fleet manager consumes;
//! [`runpod::RunPodClient`] implements it against RunPod's GraphQL API.

pub mod runpod;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::types::PodId;

pub use runpod::RunPodClient;

/// Lifecycle status as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PodState {
    Pending,
    Running,
    Exited,
    Stopped,
    Unknown(String),
}

impl PodState {
    /// Only running pods may receive work.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl From<&str> for PodState {
    fn from(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PENDING" | "CREATED" => Self::Pending,
            "RUNNING" => Self::Running,
            "EXITED" => Self::Exited,
            "STOPPED" | "TERMINATED" => Self::Stopped,
            _ => Self::Unknown(raw.to_string()),
        }
    }
}

impl From<String> for PodState {
    fn from(raw: String) -> Self {
        Self::from(raw.as_str())
    }
}

impl From<PodState> for String {
    fn from(state: PodState) -> Self {
        state.to_string()
    }
}

impl fmt::Display for PodState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("PENDING"),
            Self::Running => f.write_str("RUNNING"),
            Self::Exited => f.write_str("EXITED"),
            Self::Stopped => f.write_str("STOPPED"),
            Self::Unknown(raw) => f.write_str(raw),
        }
    }
}

/// Shape of a pod to deploy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PodSpec {
    pub gpu_type: String,
    pub image_name: String,
    pub container_disk_gb: u32,
    pub volume_gb: u32,
    /// Exposed ports, in the provider's `port/proto` notation.
    pub ports: String,
    pub cloud_type: String,
}

impl Default for PodSpec {
    fn default() -> Self {
        Self {
            gpu_type: "NVIDIA RTX 3090".to_string(),
            image_name: "comfyui:latest".to_string(),
            container_disk_gb: 50,
            volume_gb: 100,
            ports: "8188/http".to_string(),
            cloud_type: "SECURE".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployedPod {
    pub id: PodId,
    pub status: PodState,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatusReport {
    pub id: PodId,
    pub status: PodState,
    pub uptime_seconds: u64,
    pub gpu_label: String,
}

#[async_trait]
pub trait ComputeProvider: Send + Sync {
    async fn deploy(&self, spec: &PodSpec) -> Result<DeployedPod>;
    async fn status(&self, id: &PodId) -> Result<PodStatusReport>;
    async fn stop(&self, id: &PodId) -> Result<()>;
    async fn resume(&self, id: &PodId) -> Result<DeployedPod>;
    async fn terminate(&self, id: &PodId) -> Result<()>;

    /// Bounded-time liveness probe of the service running on the pod.
    async fn health_check(&self, id: &PodId) -> bool;

    async fn list(&self) -> Result<Vec<PodStatusReport>>;

    /// Base URL of the generation service on the pod.
    fn pod_url(&self, id: &PodId) -> String;

    /// Poll until the pod reports running and passes its liveness probe.
    ///
    /// Returns `Ok(false)` when `timeout` elapses first.
    async fn wait_for_ready(&self, id: &PodId, timeout: Duration, poll: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;

        while Instant::now() < deadline {
            let report = self.status(id).await?;
            if report.status.is_running() && self.health_check(id).await {
                return Ok(true);
            }
            debug!(pod_id = %id, status = %report.status, "Pod not ready yet");
            tokio::time::sleep(poll).await;
        }

        Ok(false)
    }
}

/// Accrued cost of a pod that has been up for `uptime` at `hourly_rate`.
pub fn accrued_cost(uptime: Duration, hourly_rate: f64) -> f64 {
    uptime.as_secs_f64() / 3600.0 * hourly_rate
}
