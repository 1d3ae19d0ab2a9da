// Typed lifecycle signals for the queue and the pod fleet

use serde::Serialize;

use crate::config::{FleetConfig, QueueConfig};
use crate::error::QueueError;
use crate::types::{PodId, Priority, RequestId};

/// Queue occupancy at the moment an event was emitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub pending: usize,
    pub processing: usize,
}

#[derive(Debug, Clone)]
pub enum QueueEvent {
    Enqueued {
        id: RequestId,
        priority: Priority,
        depth: QueueDepth,
    },
    Processing {
        id: RequestId,
        attempt: u32,
        depth: QueueDepth,
    },
    Completed {
        id: RequestId,
        depth: QueueDepth,
    },
    /// Terminal failure after retries were exhausted (or a non-retriable error).
    Failed {
        id: RequestId,
        error: QueueError,
        depth: QueueDepth,
    },
    Cancelled {
        id: RequestId,
        depth: QueueDepth,
    },
    /// An attempt failed; `will_retry` tells whether it was requeued.
    Error {
        id: RequestId,
        error: QueueError,
        retries: u32,
        will_retry: bool,
    },
    ConfigUpdated(QueueConfig),
}

impl QueueEvent {
    pub fn depth(&self) -> Option<QueueDepth> {
        match self {
            Self::Enqueued { depth, .. }
            | Self::Processing { depth, .. }
            | Self::Completed { depth, .. }
            | Self::Failed { depth, .. }
            | Self::Cancelled { depth, .. } => Some(*depth),
            Self::Error { .. } | Self::ConfigUpdated(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleDirection {
    Up,
    Down,
}

#[derive(Debug, Clone)]
pub enum FleetEvent {
    ScaledUp { pod_id: PodId, total_pods: usize },
    ScaledDown { pod_id: PodId, total_pods: usize },
    PodUnhealthy { pod_id: PodId, reason: String },
    ScaleError { direction: ScaleDirection, error: String },
    ConfigUpdated(FleetConfig),
}
