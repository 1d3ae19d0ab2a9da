//! Service wiring: queue, fleet and backend selector under one owner.
//!
//! The [`Orchestrator`] is constructed explicitly by the application entry
//! point. It drains the queue's process jobs into the fleet and attaches the
//! fleet's autoscaler to the queue's events.


use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use tokio::task::AbortHandle;
use tracing::{debug, info};

use crate::backend::{BackendKind, BackendSelector, BackendStatus};
use crate::config::{OrchestratorConfig, QueueConfig};
use crate::core::events::QueueEvent;
use crate::core::executor::PodExecutor;
use crate::core::queue::{EnqueueOptions, ProcessJobs, QueueMetrics, RequestQueue};
use crate::error::QueueError;
use crate::fleet::{FleetMetrics, PodFleetManager};
use crate::provider::ComputeProvider;
use crate::types::RequestId;

/// Result of a request that went through the queue.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOutcome<R> {
    pub request_id: RequestId,
    pub result: R,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorStatus {
    pub queue: QueueMetrics,
    pub fleet: FleetMetrics,
    /// Last known health of each backend; not re-probed.
    pub backends: Vec<BackendStatus>,
    pub last_backend: Option<BackendKind>,
}

pub struct Orchestrator<P, R> {
    queue: RequestQueue<P, R>,
    fleet: PodFleetManager,
    backends: Arc<BackendSelector>,
    worker: AbortHandle,
}

impl<P, R> Orchestrator<P, R>
where
    P: Send + Sync + 'static,
    R: Clone + Send + 'static,
{
    /// Build every component from configuration.
    pub fn new(
        config: OrchestratorConfig,
        provider: Arc<dyn ComputeProvider>,
        executor: Arc<dyn PodExecutor<P, R>>,
    ) -> Result<Self> {
        let fleet = PodFleetManager::new(config.fleet, provider.clone(), config.pod);
        let backends =
            BackendSelector::from_config(config.backends, Some(fleet.clone()), Some(provider))?;
        Ok(Self::from_parts(config.queue, fleet, backends, executor))
    }

    /// Assemble from pre-built components.
    pub fn from_parts(
        queue_config: QueueConfig,
        fleet: PodFleetManager,
        backends: BackendSelector,
        executor: Arc<dyn PodExecutor<P, R>>,
    ) -> Self {
        let (queue, jobs) = RequestQueue::new(queue_config);
        fleet.attach_autoscaler(queue.subscribe());
        let worker = spawn_worker(jobs, fleet.clone(), executor);
        info!("Orchestrator started");

        Self {
            queue,
            fleet,
            backends: Arc::new(backends),
            worker,
        }
    }

    pub fn queue(&self) -> &RequestQueue<P, R> {
        &self.queue
    }

    pub fn fleet(&self) -> &PodFleetManager {
        &self.fleet
    }

    pub fn backends(&self) -> &Arc<BackendSelector> {
        &self.backends
    }

    /// Enqueue `payload` and wait for its terminal outcome.
    pub async fn execute_with_queue(
        &self,
        payload: P,
        options: EnqueueOptions,
    ) -> Result<QueuedOutcome<R>, QueueError> {
        let request_id = self.queue.enqueue(payload, options)?;
        let result = self.queue.wait_for_completion(&request_id).await?;
        Ok(QueuedOutcome { request_id, result })
    }

    pub fn cancel(&self, id: &RequestId) -> bool {
        self.queue.cancel(id)
    }

    pub fn subscribe_queue(&self) -> tokio::sync::broadcast::Receiver<QueueEvent> {
        self.queue.subscribe()
    }

    pub fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            queue: self.queue.metrics(),
            fleet: self.fleet.metrics(),
            backends: BackendKind::ALL
                .iter()
                .filter_map(|kind| self.backends.cached_status(*kind))
                .collect(),
            last_backend: self.backends.last_used(),
        }
    }

    /// Stop taking jobs and release every pod.
    pub async fn shutdown(&self) {
        self.worker.abort();
        self.fleet.shutdown().await;
        info!("Orchestrator stopped");
    }
}

/// Consume process jobs, running each on the fleet in its own task.
fn spawn_worker<P, R>(
    mut jobs: ProcessJobs<P, R>,
    fleet: PodFleetManager,
    executor: Arc<dyn PodExecutor<P, R>>,
) -> AbortHandle
where
    P: Send + Sync + 'static,
    R: Clone + Send + 'static,
{
    let handle = tokio::spawn(async move {
        while let Some(job) = jobs.recv().await {
            let fleet = fleet.clone();
            let executor = executor.clone();
            tokio::spawn(async move {
                debug!(request_id = %job.request_id, attempt = job.attempt, "Processing request");
                match fleet.execute(&*executor, &*job.payload).await {
                    Ok(result) => job.completion.succeed(result),
                    Err(e) => job.completion.fail(format!("{:#}", e)),
                }
            });
        }
        debug!("Process worker stopped");
    });
    handle.abort_handle()
}
