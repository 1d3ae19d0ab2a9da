// RunPod GraphQL client

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{ComputeProvider, DeployedPod, PodSpec, PodState, PodStatusReport};
use crate::types::PodId;

const RUNPOD_API_ENDPOINT: &str = "https://api.runpod.io/graphql";
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RunPodClient {
    api_key: String,
    endpoint: String,
    client: Client,
}

impl RunPodClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("render-orchestrator/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            api_key: api_key.into(),
            endpoint: RUNPOD_API_ENDPOINT.to_string(),
            client,
        })
    }

    /// Build from `RUNPOD_API_KEY`.
    pub fn from_env() -> Result<Self> {
        let key = std::env::var("RUNPOD_API_KEY").context("RUNPOD_API_KEY is not set")?;
        Self::new(key)
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    async fn graphql<T: DeserializeOwned>(&self, query: &str, variables: Value) -> Result<T> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("RunPod API error: {}", status);
        }

        let body: GraphQlResponse<T> = response.json().await?;
        if let Some(errors) = body.errors {
            anyhow::bail!("RunPod GraphQL error: {}", errors);
        }
        body.data.context("RunPod response carried no data")
    }
}

#[derive(Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    errors: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodNode {
    id: String,
    desired_status: String,
    #[serde(default)]
    runtime: Option<PodRuntime>,
    #[serde(default)]
    machine: Option<PodMachine>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodRuntime {
    #[serde(default)]
    uptime_in_seconds: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodMachine {
    gpu_display_name: Option<String>,
}

impl From<PodNode> for PodStatusReport {
    fn from(node: PodNode) -> Self {
        Self {
            id: PodId::new(node.id),
            status: PodState::from(node.desired_status),
            uptime_seconds: node.runtime.map_or(0, |r| r.uptime_in_seconds),
            gpu_label: node
                .machine
                .and_then(|m| m.gpu_display_name)
                .unwrap_or_else(|| "Unknown".to_string()),
        }
    }
}

const DEPLOY_MUTATION: &str = r#"
mutation Deploy($input: PodFindAndDeployOnDemandInput!) {
  podFindAndDeployOnDemand(input: $input) { id desiredStatus imageName machineId }
}"#;

const STATUS_QUERY: &str = r#"
query Pod($podId: String!) {
  pod(input: { podId: $podId }) {
    id desiredStatus
    runtime { uptimeInSeconds }
    machine { gpuDisplayName }
  }
}"#;

const STOP_MUTATION: &str = r#"
mutation Stop($podId: String!) {
  podStop(input: { podId: $podId }) { id desiredStatus }
}"#;

const RESUME_MUTATION: &str = r#"
mutation Resume($podId: String!) {
  podResume(input: { podId: $podId }) { id desiredStatus }
}"#;

const TERMINATE_MUTATION: &str = r#"
mutation Terminate($podId: String!) {
  podTerminate(input: { podId: $podId })
}"#;

const LIST_QUERY: &str = r#"
query Pods {
  myself {
    pods { id desiredStatus runtime { uptimeInSeconds } machine { gpuDisplayName } }
  }
}"#;

#[async_trait]
impl ComputeProvider for RunPodClient {
    async fn deploy(&self, spec: &PodSpec) -> Result<DeployedPod> {
        info!("Deploying RunPod pod ({}, {})", spec.gpu_type, spec.image_name);

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Data {
            pod_find_and_deploy_on_demand: PodNode,
        }

        let input = json!({
            "cloudType": spec.cloud_type,
            "gpuTypeId": spec.gpu_type,
            "containerDiskInGb": spec.container_disk_gb,
            "volumeInGb": spec.volume_gb,
            "imageName": spec.image_name,
            "ports": spec.ports,
        });
        let data: Data = self.graphql(DEPLOY_MUTATION, json!({ "input": input })).await?;
        let node = data.pod_find_and_deploy_on_demand;
        let id = PodId::new(node.id);

        Ok(DeployedPod {
            url: self.pod_url(&id),
            status: PodState::from(node.desired_status),
            id,
        })
    }

    async fn status(&self, id: &PodId) -> Result<PodStatusReport> {
        #[derive(Deserialize)]
        struct Data {
            pod: Option<PodNode>,
        }

        let data: Data = self.graphql(STATUS_QUERY, json!({ "podId": id })).await?;
        let node = data
            .pod
            .with_context(|| format!("Pod {} not found", id))?;
        Ok(node.into())
    }

    async fn stop(&self, id: &PodId) -> Result<()> {
        info!(pod_id = %id, "Stopping pod");
        let _: Value = self.graphql(STOP_MUTATION, json!({ "podId": id })).await?;
        Ok(())
    }

    async fn resume(&self, id: &PodId) -> Result<DeployedPod> {
        info!(pod_id = %id, "Resuming pod");

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Data {
            pod_resume: PodNode,
        }

        let data: Data = self.graphql(RESUME_MUTATION, json!({ "podId": id })).await?;
        Ok(DeployedPod {
            id: PodId::new(data.pod_resume.id),
            status: PodState::from(data.pod_resume.desired_status),
            url: self.pod_url(id),
        })
    }

    async fn terminate(&self, id: &PodId) -> Result<()> {
        info!(pod_id = %id, "Terminating pod");
        let _: Value = self.graphql(TERMINATE_MUTATION, json!({ "podId": id })).await?;
        Ok(())
    }

    async fn health_check(&self, id: &PodId) -> bool {
        let url = format!("{}/system_stats", self.pod_url(id));
        match self.client.get(&url).timeout(HEALTH_TIMEOUT).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(pod_id = %id, "Health probe failed: {}", e);
                false
            }
        }
    }

    async fn list(&self) -> Result<Vec<PodStatusReport>> {
        #[derive(Deserialize)]
        struct Myself {
            pods: Vec<PodNode>,
        }
        #[derive(Deserialize)]
        struct Data {
            myself: Myself,
        }

        let data: Data = self.graphql(LIST_QUERY, json!({})).await?;
        if data.myself.pods.is_empty() {
            warn!("RunPod account has no pods");
        }
        Ok(data.myself.pods.into_iter().map(Into::into).collect())
    }

    fn pod_url(&self, id: &PodId) -> String {
        format!("https://{}-8188.proxy.runpod.net", id)
    }
}
