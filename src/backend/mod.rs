//! Backend selection with health-checked fallback and cost reporting.

mod probe;

pub use probe::{CloudProbe, CredentialProbe, HealthProbe, HttpHealthProbe};

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::config::{BackendConfig, BackendsConfig};
use crate::error::{BackendError, BackendFailure};
use crate::fleet::PodFleetManager;
use crate::provider::{ComputeProvider, PodState};
use crate::types::PodId;

const CLOUD_READY_TIMEOUT: Duration = Duration::from_secs(300);
const CLOUD_READY_POLL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    Cloud,
    Gemini,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [Self::Local, Self::Cloud, Self::Gemini];

    /// Whether serving depends on hardware or pods we run ourselves.
    pub fn requires_infrastructure(self) -> bool {
        !matches!(self, Self::Gemini)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Local => "local",
            Self::Cloud => "cloud",
            Self::Gemini => "gemini",
        })
    }
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "cloud" => Ok(Self::Cloud),
            "gemini" => Ok(Self::Gemini),
            other => Err(anyhow::anyhow!("unknown backend `{}`", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatus {
    pub backend: BackendKind,
    /// False when the probe could not reach the backend at all.
    pub available: bool,
    pub healthy: bool,
    pub response_time_ms: Option<u64>,
    pub last_checked: DateTime<Utc>,
}

/// Outcome of a served operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Execution<T> {
    pub result: T,
    pub backend: BackendKind,
    pub cost: f64,
}

pub struct BackendSelector {
    config: BackendsConfig,
    probes: HashMap<BackendKind, Arc<dyn HealthProbe>>,
    provider: Option<Arc<dyn ComputeProvider>>,
    cache: RwLock<HashMap<BackendKind, BackendStatus>>,
    preferred: Mutex<Option<BackendKind>>,
    last_used: Mutex<Option<BackendKind>>,
}

impl BackendSelector {
    /// A selector with no probes; every backend reads as unavailable until
    /// one is registered with [`with_probe`](Self::with_probe).
    pub fn new(config: BackendsConfig) -> Self {
        Self {
            config,
            probes: HashMap::new(),
            provider: None,
            cache: RwLock::new(HashMap::new()),
            preferred: Mutex::new(None),
            last_used: Mutex::new(None),
        }
    }

    /// Wire the standard probes: HTTP for local, fleet/pod for cloud,
    /// credential presence for the hosted API.
    pub fn from_config(
        config: BackendsConfig,
        fleet: Option<PodFleetManager>,
        provider: Option<Arc<dyn ComputeProvider>>,
    ) -> Result<Self> {
        let local = HttpHealthProbe::new(config.local_health_url.clone())?;
        let cloud = CloudProbe::new(
            fleet,
            provider.clone(),
            config.cloud_pod_id.as_deref().map(PodId::from),
        );
        let gemini = CredentialProbe::new(config.gemini_api_key.as_deref());

        Ok(Self::new(config)
            .with_probe(BackendKind::Local, Arc::new(local))
            .with_probe(BackendKind::Cloud, Arc::new(cloud))
            .with_probe(BackendKind::Gemini, Arc::new(gemini))
            .with_provider(provider))
    }

    pub fn with_probe(mut self, kind: BackendKind, probe: Arc<dyn HealthProbe>) -> Self {
        self.probes.insert(kind, probe);
        self
    }

    pub fn with_provider(mut self, provider: Option<Arc<dyn ComputeProvider>>) -> Self {
        self.provider = provider;
        self
    }

    pub fn priority_order(&self) -> &[BackendKind] {
        &self.config.backend_priority_order
    }

    pub fn config_for(&self, kind: BackendKind) -> &BackendConfig {
        self.config.config_for(kind)
    }

    pub fn cost_estimate(&self, kind: BackendKind) -> f64 {
        self.config_for(kind).cost_per_unit
    }

    /// Probe `kind` now and refresh its cache entry.
    pub async fn check_health(&self, kind: BackendKind) -> BackendStatus {
        let started = Instant::now();
        let outcome = match self.probes.get(&kind) {
            Some(probe) => probe.probe().await,
            None => Err(anyhow::anyhow!("no health probe registered")),
        };

        let status = match outcome {
            Ok(healthy) => BackendStatus {
                backend: kind,
                available: true,
                healthy,
                response_time_ms: Some(started.elapsed().as_millis() as u64),
                last_checked: Utc::now(),
            },
            Err(e) => {
                warn!(backend = %kind, "Health check failed: {}", e);
                BackendStatus {
                    backend: kind,
                    available: false,
                    healthy: false,
                    response_time_ms: None,
                    last_checked: Utc::now(),
                }
            }
        };

        self.cache.write().insert(kind, status.clone());
        status
    }

    pub fn cached_status(&self, kind: BackendKind) -> Option<BackendStatus> {
        self.cache.read().get(&kind).cloned()
    }

    pub async fn all_statuses(&self) -> Vec<BackendStatus> {
        let (local, cloud, gemini) = tokio::join!(
            self.check_health(BackendKind::Local),
            self.check_health(BackendKind::Cloud),
            self.check_health(BackendKind::Gemini),
        );
        vec![local, cloud, gemini]
    }

    pub fn set_preferred(&self, kind: Option<BackendKind>) {
        *self.preferred.lock() = kind;
    }

    pub fn preferred(&self) -> Option<BackendKind> {
        *self.preferred.lock()
    }

    pub fn last_used(&self) -> Option<BackendKind> {
        *self.last_used.lock()
    }

    fn mark_used(&self, kind: BackendKind) {
        *self.last_used.lock() = Some(kind);
    }

    /// The backend chosen when nothing is healthy: the first one in priority
    /// order with no infrastructure of ours behind it.
    fn last_resort(&self) -> BackendKind {
        self.priority_order()
            .iter()
            .copied()
            .find(|k| !k.requires_infrastructure())
            .unwrap_or(BackendKind::Gemini)
    }

    /// Pick a backend to use. A forced choice is returned unchecked and
    /// becomes the sticky preference.
    pub async fn select_backend(&self, forced: Option<BackendKind>) -> BackendKind {
        if let Some(kind) = forced {
            self.set_preferred(Some(kind));
            return kind;
        }

        if let Some(preferred) = self.preferred() {
            if self.check_health(preferred).await.healthy {
                self.mark_used(preferred);
                return preferred;
            }
        }

        for &kind in self.priority_order() {
            if self.check_health(kind).await.healthy {
                self.mark_used(kind);
                return kind;
            }
        }

        let fallback = self.last_resort();
        warn!("All backends unavailable, falling back to {}", fallback);
        self.mark_used(fallback);
        fallback
    }

    fn attempt_order(&self, preferred: Option<BackendKind>) -> Vec<BackendKind> {
        let mut order = Vec::with_capacity(BackendKind::ALL.len());
        order.extend(preferred);
        order.extend(
            self.priority_order()
                .iter()
                .copied()
                .filter(|k| Some(*k) != preferred),
        );
        order
    }

    /// Run `operation` on the first backend that is healthy and succeeds.
    ///
    /// Only the serving backend's cost is reported.
    pub async fn execute_with_fallback<T, F, Fut>(
        &self,
        preferred: Option<BackendKind>,
        mut operation: F,
    ) -> Result<Execution<T>, BackendError>
    where
        F: FnMut(BackendKind, BackendConfig) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut failures = Vec::new();

        for kind in self.attempt_order(preferred) {
            if !self.check_health(kind).await.healthy {
                failures.push(BackendFailure {
                    backend: kind,
                    reason: "health check failed".to_string(),
                });
                continue;
            }

            let config = self.config_for(kind).clone();
            let cost = config.cost_per_unit;
            info!(backend = %kind, "Attempting operation");
            match operation(kind, config).await {
                Ok(result) => {
                    self.mark_used(kind);
                    return Ok(Execution {
                        result,
                        backend: kind,
                        cost,
                    });
                }
                Err(e) => {
                    error!(backend = %kind, "Backend failed: {}", e);
                    failures.push(BackendFailure {
                        backend: kind,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Err(BackendError::AllBackendsFailed(failures))
    }

    /// Make sure the configured cloud pod is running, resuming it if stopped.
    pub async fn ensure_cloud_running(&self) -> bool {
        let (Some(provider), Some(pod)) = (&self.provider, self.config.cloud_pod_id.as_deref())
        else {
            warn!("No cloud pod configured");
            return false;
        };
        let pod = PodId::from(pod);

        let result: Result<bool> = async {
            let report = provider.status(&pod).await?;
            match report.status {
                PodState::Running => Ok(provider.health_check(&pod).await),
                PodState::Exited | PodState::Stopped => {
                    info!(pod_id = %pod, "Resuming stopped pod");
                    provider.resume(&pod).await?;
                    provider
                        .wait_for_ready(&pod, CLOUD_READY_TIMEOUT, CLOUD_READY_POLL)
                        .await
                }
                _ => Ok(false),
            }
        }
        .await;

        result.unwrap_or_else(|e| {
            error!(pod_id = %pod, "Failed to ensure cloud backend running: {}", e);
            false
        })
    }
}
