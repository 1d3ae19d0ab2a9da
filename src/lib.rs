// Core modules
pub mod config;
pub mod error;
pub mod types;
pub mod core;
pub mod provider;

// Orchestration layers
pub mod backend;
pub mod fleet;
pub mod orchestrator;
pub mod api;

#[cfg(test)]
mod testing;

// Re-export key types
pub use backend::{BackendKind, BackendSelector, BackendStatus, Execution, HealthProbe};
pub use config::{BackendsConfig, FleetConfig, OrchestratorConfig, QueueConfig};
pub use crate::core::{
    EnqueueOptions, FleetEvent, HttpPodExecutor, PodExecutor, PodTarget, QueueEvent,
    RequestQueue, RequestStatus,
};
pub use error::{BackendError, FleetError, QueueError};
pub use fleet::{FleetMetrics, PodFleetManager};
pub use orchestrator::{Orchestrator, OrchestratorStatus, QueuedOutcome};
pub use provider::{ComputeProvider, PodSpec, PodState, RunPodClient};
pub use types::{PodId, Priority, RequestId};
