// Health probes for each backend class

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::fleet::PodFleetManager;
use crate::provider::ComputeProvider;
use crate::types::PodId;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Liveness check for one backend.
///
/// `Err` means the backend could not be reached at all; `Ok(false)` means it
/// answered but is not fit to serve.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> Result<bool>;
}

/// GET against a health endpoint; healthy on any 2xx.
pub struct HttpHealthProbe {
    client: Client,
    url: String,
}

impl HttpHealthProbe {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder().timeout(PROBE_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self) -> Result<bool> {
        let response = self.client.get(&self.url).send().await?;
        debug!("Health probe {} answered {}", self.url, response.status());
        Ok(response.status().is_success())
    }
}

/// Cloud backend: any healthy fleet pod, else the statically configured pod.
pub struct CloudProbe {
    fleet: Option<PodFleetManager>,
    provider: Option<Arc<dyn ComputeProvider>>,
    static_pod: Option<PodId>,
}

impl CloudProbe {
    pub fn new(
        fleet: Option<PodFleetManager>,
        provider: Option<Arc<dyn ComputeProvider>>,
        static_pod: Option<PodId>,
    ) -> Self {
        Self {
            fleet,
            provider,
            static_pod,
        }
    }
}

#[async_trait]
impl HealthProbe for CloudProbe {
    async fn probe(&self) -> Result<bool> {
        if let Some(fleet) = &self.fleet {
            if fleet.has_healthy_pod().await {
                return Ok(true);
            }
        }
        match (&self.provider, &self.static_pod) {
            (Some(provider), Some(pod)) => Ok(provider.health_check(pod).await),
            _ => Ok(false),
        }
    }
}

/// Hosted API: healthy iff a usable credential is configured.
pub struct CredentialProbe {
    present: bool,
}

impl CredentialProbe {
    pub fn new(credential: Option<&str>) -> Self {
        let present = credential
            .map(str::trim)
            .is_some_and(|c| !c.is_empty() && !(c.starts_with("${") && c.ends_with('}')));
        Self { present }
    }
}

#[async_trait]
impl HealthProbe for CredentialProbe {
    async fn probe(&self) -> Result<bool> {
        Ok(self.present)
    }
}
