// Work execution against a selected pod

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::types::PodId;

/// Where a unit of work is sent once the fleet has picked a pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodTarget {
    pub id: PodId,
    pub url: String,
}

#[async_trait]
pub trait PodExecutor<P, R>: Send + Sync {
    async fn execute(&self, pod: &PodTarget, payload: &P) -> Result<R>;
}

/// Posts a JSON workflow to the generation service running on the pod.
pub struct HttpPodExecutor {
    client: Client,
}

impl HttpPodExecutor {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("render-orchestrator/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodExecutor<Value, Value> for HttpPodExecutor {
    async fn execute(&self, pod: &PodTarget, payload: &Value) -> Result<Value> {
        let url = format!("{}/prompt", pod.url.trim_end_matches('/'));
        debug!(pod_id = %pod.id, "Submitting work to {}", url);

        let response = self.client.post(&url).json(payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Pod {} returned {}: {}", pod.id, status, body);
        }

        Ok(response.json().await?)
    }
}
