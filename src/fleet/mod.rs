//! Pod fleet management: autoscaling and least-loaded routing.
//!
//! The fleet owns every [`PodHandle`]; callers only ever see snapshots
//! ([`PodMetrics`]) or a [`PodTarget`]. Work routed through
//! [`PodFleetManager::execute`] holds a lease on its pod for the duration of
//! the call, so active-request accounting survives the pod being evicted
//! mid-flight.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::FleetConfig;
use crate::core::events::{FleetEvent, QueueDepth, QueueEvent, ScaleDirection};
use crate::core::executor::{PodExecutor, PodTarget};
use crate::error::FleetError;
use crate::provider::{ComputeProvider, PodSpec, PodState, PodStatusReport, accrued_cost};
use crate::types::PodId;

const EVENT_CAPACITY: usize = 64;
const RESPONSE_WINDOW: usize = 100;

struct PodHandle {
    id: PodId,
    url: String,
    status: PodState,
    /// Set while a scale-down stop call is in flight.
    stopping: bool,
    active_requests: usize,
    total_processed: u64,
    last_used: Instant,
    last_used_at: DateTime<Utc>,
    uptime: Duration,
    cost_accumulated: f64,
}

impl PodHandle {
    fn routable(&self) -> bool {
        self.status.is_running() && !self.stopping
    }

    fn target(&self) -> PodTarget {
        PodTarget {
            id: self.id.clone(),
            url: self.url.clone(),
        }
    }

    fn touch(&mut self) {
        self.last_used = Instant::now();
        self.last_used_at = Utc::now();
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodMetrics {
    pub pod_id: PodId,
    pub status: PodState,
    pub stopping: bool,
    pub active_requests: usize,
    pub total_processed: u64,
    pub uptime_seconds: u64,
    pub last_used: DateTime<Utc>,
    pub cost_accumulated: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetMetrics {
    pub active_pods: usize,
    pub total_pods: usize,
    pub provisioning_pods: usize,
    pub pod_metrics: Vec<PodMetrics>,
    pub total_cost: f64,
    pub average_response_time_ms: f64,
    pub requests_per_minute: f64,
}

struct FleetState {
    config: Arc<FleetConfig>,
    pods: HashMap<PodId, PodHandle>,
    /// Scale-ups that have reserved a slot but not registered a pod yet.
    provisioning: usize,
    last_auto_scale_up: Option<Instant>,
    last_auto_scale_down: Option<Instant>,
    /// Set once by `shutdown`; no pod is registered afterwards.
    shut_down: bool,
    response_times: VecDeque<Duration>,
    request_count: u64,
}

impl FleetState {
    fn committed_pods(&self) -> usize {
        self.pods.len() + self.provisioning
    }

    fn serving_pods(&self) -> usize {
        self.pods.values().filter(|p| !p.stopping).count()
    }

    fn least_loaded_mut(&mut self) -> Option<&mut PodHandle> {
        self.pods
            .values_mut()
            .filter(|p| p.routable())
            .min_by_key(|p| p.active_requests)
    }

    /// Least recently used pod with no work that has been idle long enough.
    fn idle_candidate(&self, now: Instant) -> Option<PodId> {
        let idle_timeout = self.config.pod_idle_timeout();
        self.pods
            .values()
            .filter(|p| {
                !p.stopping
                    && p.active_requests == 0
                    && now.saturating_duration_since(p.last_used) >= idle_timeout
            })
            .min_by_key(|p| p.last_used)
            .map(|p| p.id.clone())
    }

    fn record_response(&mut self, elapsed: Duration) {
        if self.response_times.len() == RESPONSE_WINDOW {
            self.response_times.pop_front();
        }
        self.response_times.push_back(elapsed);
        self.request_count += 1;
    }
}

fn cooldown_elapsed(last: Option<Instant>, cooldown: Duration, now: Instant) -> bool {
    last.is_none_or(|t| now.saturating_duration_since(t) >= cooldown)
}

struct Inner {
    state: Mutex<FleetState>,
    provider: Arc<dyn ComputeProvider>,
    pod_spec: PodSpec,
    events: broadcast::Sender<FleetEvent>,
    started: Instant,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// Returns a reserved provisioning slot on drop unless it was committed.
struct ProvisionSlot {
    inner: Arc<Inner>,
    armed: bool,
}

impl Drop for ProvisionSlot {
    fn drop(&mut self) {
        if self.armed {
            let mut st = self.inner.state.lock();
            st.provisioning = st.provisioning.saturating_sub(1);
        }
    }
}

/// Active-request claim on a pod, released on drop.
struct PodLease {
    inner: Arc<Inner>,
    target: PodTarget,
    started: Instant,
    succeeded: bool,
}

impl Drop for PodLease {
    fn drop(&mut self) {
        let mut guard = self.inner.state.lock();
        let st = &mut *guard;
        // The pod may have been evicted while the work was running.
        if let Some(pod) = st.pods.get_mut(&self.target.id) {
            pod.active_requests = pod.active_requests.saturating_sub(1);
            pod.touch();
            if self.succeeded {
                pod.total_processed += 1;
            }
        }
        if self.succeeded {
            st.record_response(self.started.elapsed());
        }
    }
}

#[derive(Clone)]
pub struct PodFleetManager {
    inner: Arc<Inner>,
}

impl PodFleetManager {
    /// Create the manager and start its health-check loop on the current runtime.
    pub fn new(config: FleetConfig, provider: Arc<dyn ComputeProvider>, pod_spec: PodSpec) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(Inner {
            state: Mutex::new(FleetState {
                config: Arc::new(config),
                pods: HashMap::new(),
                provisioning: 0,
                shut_down: false,
                last_auto_scale_up: None,
                last_auto_scale_down: None,
                response_times: VecDeque::with_capacity(RESPONSE_WINDOW),
                request_count: 0,
            }),
            provider,
            pod_spec,
            events,
            started: Instant::now(),
            tasks: Mutex::new(Vec::new()),
        });

        let fleet = Self { inner };
        fleet.start_health_checks();
        fleet
    }

    fn start_health_checks(&self) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            loop {
                let interval = match weak.upgrade() {
                    Some(inner) => inner.state.lock().config.health_check_interval(),
                    None => break,
                };
                tokio::time::sleep(interval).await;
                match weak.upgrade() {
                    Some(inner) => PodFleetManager { inner }.run_health_checks().await,
                    None => break,
                }
            }
        });
        self.inner.tasks.lock().push(handle.abort_handle());
    }

    /// React to queue depth signals with automatic scaling decisions.
    pub fn attach_autoscaler(&self, mut events: broadcast::Receiver<QueueEvent>) {
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            loop {
                let depth = match events.recv().await {
                    Ok(
                        QueueEvent::Enqueued { depth, .. }
                        | QueueEvent::Completed { depth, .. }
                        | QueueEvent::Failed { depth, .. }
                        | QueueEvent::Cancelled { depth, .. },
                    ) => depth,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Autoscaler skipped {} queue events", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                PodFleetManager { inner }.check_scaling(depth);
            }
            debug!("Autoscaler stopped");
        });
        self.inner.tasks.lock().push(handle.abort_handle());
    }

    /// Decide on an automatic scaling action and run it in the background.
    ///
    /// The decision and its cooldown stamp happen under one lock, so
    /// concurrent signals cannot both commit to the same action.
    pub fn check_scaling(&self, depth: QueueDepth) -> Option<ScaleDirection> {
        let direction = {
            let mut st = self.inner.state.lock();
            let cfg = st.config.clone();
            let now = Instant::now();

            if st.shut_down {
                None
            } else if depth.pending >= cfg.scale_up_threshold
                && st.committed_pods() < cfg.max_pods
                && cooldown_elapsed(st.last_auto_scale_up, cfg.scale_up_cooldown(), now)
            {
                st.last_auto_scale_up = Some(now);
                Some(ScaleDirection::Up)
            } else if depth.pending <= cfg.scale_down_threshold
                && depth.processing == 0
                && st.serving_pods() > cfg.min_pods
                && st.idle_candidate(now).is_some()
                && cooldown_elapsed(st.last_auto_scale_down, cfg.scale_down_cooldown(), now)
            {
                st.last_auto_scale_down = Some(now);
                Some(ScaleDirection::Down)
            } else {
                None
            }
        };

        match direction {
            Some(ScaleDirection::Up) => {
                info!(
                    "Queue length {} reached scale-up threshold, scaling up",
                    depth.pending
                );
                let fleet = self.clone();
                tokio::spawn(async move {
                    fleet.scale_up().await;
                });
            }
            Some(ScaleDirection::Down) => {
                info!(
                    "Queue length {} at or below scale-down threshold, scaling down",
                    depth.pending
                );
                let fleet = self.clone();
                tokio::spawn(async move {
                    fleet.scale_down().await;
                });
            }
            None => {}
        }
        direction
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: FleetEvent) {
        let _ = self.inner.events.send(event);
    }

    pub fn config(&self) -> Arc<FleetConfig> {
        self.inner.state.lock().config.clone()
    }

    pub fn update_config(&self, config: FleetConfig) {
        self.inner.state.lock().config = Arc::new(config.clone());
        info!("Fleet configuration updated");
        self.emit(FleetEvent::ConfigUpdated(config));
    }

    pub fn provider(&self) -> Arc<dyn ComputeProvider> {
        self.inner.provider.clone()
    }

    /// Pods currently tracked, including any being stopped.
    pub fn pod_count(&self) -> usize {
        self.inner.state.lock().pods.len()
    }

    /// Add one pod. Returns `None` at capacity or when provisioning fails.
    pub async fn scale_up(&self) -> Option<PodId> {
        match self.try_scale_up().await {
            Ok(id) => Some(id),
            Err(FleetError::AtCapacity { max }) => {
                info!("Already at max pods ({})", max);
                None
            }
            Err(FleetError::ShutDown) => {
                debug!("Fleet is shut down, not scaling up");
                None
            }
            Err(e) => {
                error!("Failed to scale up: {}", e);
                self.emit(FleetEvent::ScaleError {
                    direction: ScaleDirection::Up,
                    error: e.to_string(),
                });
                None
            }
        }
    }

    async fn try_scale_up(&self) -> Result<PodId, FleetError> {
        let (mut slot, cfg) = {
            let mut st = self.inner.state.lock();
            let cfg = st.config.clone();
            if st.shut_down {
                return Err(FleetError::ShutDown);
            }
            if st.committed_pods() >= cfg.max_pods {
                return Err(FleetError::AtCapacity { max: cfg.max_pods });
            }
            st.provisioning += 1;
            info!(
                "Scaling up (current: {}/{})",
                st.committed_pods() - 1,
                cfg.max_pods
            );
            (
                ProvisionSlot {
                    inner: self.inner.clone(),
                    armed: true,
                },
                cfg,
            )
        };

        let provider = &self.inner.provider;
        let deployed = provider
            .deploy(&self.inner.pod_spec)
            .await
            .map_err(|e| FleetError::Provisioning(e.to_string()))?;

        let ready = provider
            .wait_for_ready(&deployed.id, cfg.provision_timeout(), cfg.readiness_poll())
            .await;
        match ready {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                let reason = match ready {
                    Err(e) => format!("pod {} readiness check failed: {}", deployed.id, e),
                    _ => format!("pod {} did not become ready in time", deployed.id),
                };
                if let Err(e) = provider.terminate(&deployed.id).await {
                    warn!(pod_id = %deployed.id, "Failed to terminate unready pod: {}", e);
                }
                return Err(FleetError::Provisioning(reason));
            }
        }

        let total_pods = {
            let mut st = self.inner.state.lock();
            // Release the reservation in the same critical section as the insert.
            st.provisioning = st.provisioning.saturating_sub(1);
            slot.armed = false;
            if st.shut_down {
                None
            } else {
                st.pods.insert(
                    deployed.id.clone(),
                    PodHandle {
                        id: deployed.id.clone(),
                        url: deployed.url.clone(),
                        status: PodState::Running,
                        stopping: false,
                        active_requests: 0,
                        total_processed: 0,
                        last_used: Instant::now(),
                        last_used_at: Utc::now(),
                        uptime: Duration::ZERO,
                        cost_accumulated: 0.0,
                    },
                );
                Some(st.pods.len())
            }
        };

        // Shutdown has already released the pool; this pod is ours to stop.
        let Some(total_pods) = total_pods else {
            info!(pod_id = %deployed.id, "Fleet shut down while provisioning, stopping new pod");
            if let Err(e) = provider.stop(&deployed.id).await {
                error!(pod_id = %deployed.id, "Failed to stop pod: {}", e);
            }
            return Err(FleetError::ShutDown);
        };

        info!(pod_id = %deployed.id, "Scaled up to {} pods", total_pods);
        self.emit(FleetEvent::ScaledUp {
            pod_id: deployed.id.clone(),
            total_pods,
        });
        Ok(deployed.id)
    }

    /// Stop and remove the least recently used idle pod.
    pub async fn scale_down(&self) -> bool {
        let candidate = {
            let mut st = self.inner.state.lock();
            if st.shut_down {
                return false;
            }
            if st.serving_pods() <= st.config.min_pods {
                debug!("Already at min pods");
                return false;
            }
            let Some(id) = st.idle_candidate(Instant::now()) else {
                debug!("No idle pods to remove");
                return false;
            };
            if let Some(pod) = st.pods.get_mut(&id) {
                pod.stopping = true;
            }
            id
        };

        info!(pod_id = %candidate, "Scaling down");
        match self.inner.provider.stop(&candidate).await {
            Ok(()) => {
                let total_pods = {
                    let mut st = self.inner.state.lock();
                    st.pods.remove(&candidate);
                    st.pods.len()
                };
                info!("Scaled down to {} pods", total_pods);
                self.emit(FleetEvent::ScaledDown {
                    pod_id: candidate,
                    total_pods,
                });
                true
            }
            Err(e) => {
                if let Some(pod) = self.inner.state.lock().pods.get_mut(&candidate) {
                    pod.stopping = false;
                }
                let err = FleetError::Provider(e.to_string());
                error!(pod_id = %candidate, "Failed to scale down: {}", err);
                self.emit(FleetEvent::ScaleError {
                    direction: ScaleDirection::Down,
                    error: err.to_string(),
                });
                false
            }
        }
    }

    /// The routable pod with the fewest active requests, without side effects.
    pub fn least_loaded(&self) -> Option<PodTarget> {
        self.inner
            .state
            .lock()
            .least_loaded_mut()
            .map(|p| p.target())
    }

    /// Provision a pod when none is routable.
    pub async fn ensure_capacity(&self) -> Result<PodTarget, FleetError> {
        if let Some(target) = self.least_loaded() {
            return Ok(target);
        }
        let id = self.scale_up().await.ok_or(FleetError::NoPodsAvailable)?;
        self.inner
            .state
            .lock()
            .pods
            .get(&id)
            .filter(|p| p.routable())
            .map(PodHandle::target)
            .ok_or(FleetError::NoPodsAvailable)
    }

    /// Least-loaded routable pod, provisioning one when the pool has none.
    pub async fn select_pod(&self) -> Option<PodTarget> {
        self.ensure_capacity().await.ok()
    }

    fn acquire(&self, started: Instant) -> Option<PodLease> {
        let mut st = self.inner.state.lock();
        let pod = st.least_loaded_mut()?;
        pod.active_requests += 1;
        pod.touch();
        Some(PodLease {
            inner: self.inner.clone(),
            target: pod.target(),
            started,
            succeeded: false,
        })
    }

    /// Run `payload` on the least-loaded pod, provisioning one if needed.
    pub async fn execute<E, P, R>(&self, executor: &E, payload: &P) -> anyhow::Result<R>
    where
        E: PodExecutor<P, R> + ?Sized,
        P: Sync,
    {
        let started = Instant::now();
        let mut lease = match self.acquire(started) {
            Some(lease) => lease,
            None => {
                self.ensure_capacity().await?;
                self.acquire(started).ok_or(FleetError::NoPodsAvailable)?
            }
        };

        debug!(pod_id = %lease.target.id, "Executing request on pod");
        let result = executor.execute(&lease.target, payload).await;
        lease.succeeded = result.is_ok();
        result
    }

    /// Probe every tracked pod once and evict the ones that fail.
    pub async fn run_health_checks(&self) {
        let ids: Vec<PodId> = {
            let st = self.inner.state.lock();
            st.pods
                .values()
                .filter(|p| !p.stopping)
                .map(|p| p.id.clone())
                .collect()
        };
        if ids.is_empty() {
            return;
        }

        let mut probes = JoinSet::new();
        for id in ids {
            let provider = self.inner.provider.clone();
            probes.spawn(async move {
                let healthy = provider.health_check(&id).await;
                let status = provider.status(&id).await;
                (id, healthy, status)
            });
        }

        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((id, healthy, status)) => self.apply_health(id, healthy, status),
                Err(e) => warn!("Health probe task failed: {}", e),
            }
        }
    }

    fn apply_health(&self, id: PodId, healthy: bool, status: anyhow::Result<PodStatusReport>) {
        let reason = match status {
            Ok(report) if healthy && report.status.is_running() => {
                let mut st = self.inner.state.lock();
                let hourly = st.config.pod_hourly_cost;
                if let Some(pod) = st.pods.get_mut(&id) {
                    pod.status = report.status;
                    pod.uptime = Duration::from_secs(report.uptime_seconds);
                    pod.cost_accumulated = accrued_cost(pod.uptime, hourly);
                }
                return;
            }
            Ok(report) if !healthy => format!("liveness probe failed (status {})", report.status),
            Ok(report) => format!("pod status is {}", report.status),
            Err(e) => format!("status query failed: {}", e),
        };

        let removed = {
            let mut st = self.inner.state.lock();
            // A scale-down may have claimed the pod while it was being probed.
            match st.pods.get(&id) {
                Some(pod) if !pod.stopping => st.pods.remove(&id).is_some(),
                _ => false,
            }
        };
        if removed {
            warn!(pod_id = %id, "Pod is unhealthy, removing from pool: {}", reason);
            self.emit(FleetEvent::PodUnhealthy { pod_id: id, reason });
        }
    }

    pub fn metrics(&self) -> FleetMetrics {
        let st = self.inner.state.lock();

        let mut pod_metrics: Vec<PodMetrics> = st
            .pods
            .values()
            .map(|p| PodMetrics {
                pod_id: p.id.clone(),
                status: p.status.clone(),
                stopping: p.stopping,
                active_requests: p.active_requests,
                total_processed: p.total_processed,
                uptime_seconds: p.uptime.as_secs(),
                last_used: p.last_used_at,
                cost_accumulated: p.cost_accumulated,
            })
            .collect();
        pod_metrics.sort_by(|a, b| a.pod_id.as_str().cmp(b.pod_id.as_str()));

        let average_response_time_ms = if st.response_times.is_empty() {
            0.0
        } else {
            let total: Duration = st.response_times.iter().sum();
            total.as_secs_f64() * 1000.0 / st.response_times.len() as f64
        };

        let uptime_ms = self.inner.started.elapsed().as_secs_f64() * 1000.0;
        let requests_per_minute = if uptime_ms > 0.0 {
            st.request_count as f64 / uptime_ms * 60_000.0
        } else {
            0.0
        };

        FleetMetrics {
            active_pods: st.pods.values().filter(|p| p.routable()).count(),
            total_pods: st.pods.len(),
            provisioning_pods: st.provisioning,
            total_cost: pod_metrics.iter().map(|p| p.cost_accumulated).sum(),
            pod_metrics,
            average_response_time_ms,
            requests_per_minute,
        }
    }

    /// Whether any routable pod currently passes its liveness probe.
    pub async fn has_healthy_pod(&self) -> bool {
        let ids: Vec<PodId> = {
            let st = self.inner.state.lock();
            st.pods
                .values()
                .filter(|p| p.routable())
                .map(|p| p.id.clone())
                .collect()
        };
        for id in ids {
            if self.inner.provider.health_check(&id).await {
                return true;
            }
        }
        false
    }

    /// Stop every tracked pod, then cancel background tasks. Later scale-ups
    /// are refused.
    pub async fn shutdown(&self) {
        info!("Shutting down pod fleet");

        // Scale-ups that finish after this point stop their own pod.
        let ids: Vec<PodId> = {
            let mut st = self.inner.state.lock();
            st.shut_down = true;
            for pod in st.pods.values_mut() {
                pod.stopping = true;
            }
            st.pods.keys().cloned().collect()
        };
        let mut stops = JoinSet::new();
        for id in ids {
            let provider = self.inner.provider.clone();
            stops.spawn(async move {
                let result = provider.stop(&id).await;
                (id, result)
            });
        }
        while let Some(joined) = stops.join_next().await {
            match joined {
                Ok((id, Err(e))) => error!(pod_id = %id, "Failed to stop pod: {}", e),
                Ok((id, Ok(()))) => debug!(pod_id = %id, "Pod stopped"),
                Err(e) => error!("Stop task failed: {}", e),
            }
        }

        self.inner.state.lock().pods.clear();
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{EchoExecutor, MockProvider};

    fn config(min_pods: usize, max_pods: usize) -> FleetConfig {
        FleetConfig {
            min_pods,
            max_pods,
            readiness_poll_ms: 10,
            provision_timeout_ms: 1_000,
            ..FleetConfig::default()
        }
    }

    fn fleet(cfg: FleetConfig) -> (PodFleetManager, Arc<MockProvider>) {
        let provider = Arc::new(MockProvider::new());
        let fleet = PodFleetManager::new(cfg, provider.clone(), PodSpec::default());
        (fleet, provider)
    }

    #[tokio::test(start_paused = true)]
    async fn test_scale_up_respects_max_pods() {
        let (fleet, _provider) = fleet(config(0, 3));
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(fleet.scale_up().await.unwrap());
        }
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids.dedup();
        assert_eq!(ids.len(), 3);

        assert!(fleet.scale_up().await.is_none());
        assert_eq!(fleet.pod_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_scale_up_cannot_overshoot() {
        let (fleet, provider) = fleet(config(0, 2));
        provider.set_deploy_delay(Duration::from_millis(100));

        let attempts: Vec<_> = (0..5)
            .map(|_| {
                let fleet = fleet.clone();
                tokio::spawn(async move { fleet.scale_up().await })
            })
            .collect();
        let mut created = 0;
        for attempt in attempts {
            if attempt.await.unwrap().is_some() {
                created += 1;
            }
        }
        assert_eq!(created, 2);
        assert_eq!(fleet.pod_count(), 2);
        assert_eq!(provider.deploy_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_provisioning_emits_error_and_cleans_up() {
        let (fleet, provider) = fleet(config(0, 2));
        let mut events = fleet.subscribe();
        provider.set_ready_after_polls(u32::MAX);

        assert!(fleet.scale_up().await.is_none());
        assert_eq!(fleet.pod_count(), 0);
        assert_eq!(fleet.metrics().provisioning_pods, 0);
        assert_eq!(provider.terminated().len(), 1);
        assert!(matches!(
            events.recv().await.unwrap(),
            FleetEvent::ScaleError {
                direction: ScaleDirection::Up,
                ..
            }
        ));

        provider.set_fail_deploy(true);
        assert!(fleet.scale_up().await.is_none());
        assert_eq!(fleet.metrics().provisioning_pods, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scale_down_prefers_least_recently_used_idle_pod() {
        let (fleet, provider) = fleet(config(1, 3));
        let first = fleet.scale_up().await.unwrap();
        tokio::time::advance(Duration::from_secs(60)).await;
        let second = fleet.scale_up().await.unwrap();

        // Nothing has been idle for the full timeout yet.
        assert!(!fleet.scale_down().await);

        tokio::time::advance(fleet.config().pod_idle_timeout()).await;
        assert!(fleet.scale_down().await);
        assert_eq!(provider.stopped(), vec![first]);

        // At min pods now.
        tokio::time::advance(fleet.config().pod_idle_timeout()).await;
        assert!(!fleet.scale_down().await);
        assert_eq!(fleet.pod_count(), 1);
        assert_eq!(fleet.least_loaded().unwrap().id, second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_stop_keeps_pod() {
        let (fleet, provider) = fleet(config(0, 2));
        let id = fleet.scale_up().await.unwrap();
        tokio::time::advance(fleet.config().pod_idle_timeout()).await;

        provider.set_fail_stop(true);
        assert!(!fleet.scale_down().await);
        assert_eq!(fleet.pod_count(), 1);
        assert_eq!(fleet.least_loaded().unwrap().id, id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_select_pod_provisions_on_empty_pool() {
        let (fleet, provider) = fleet(config(0, 2));
        assert!(fleet.least_loaded().is_none());

        let target = fleet.select_pod().await.unwrap();
        assert_eq!(provider.deploy_calls(), 1);

        // A routable pod exists now, so selection does not provision again.
        assert_eq!(fleet.select_pod().await.unwrap(), target);
        assert_eq!(provider.deploy_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_balances_and_tracks_metrics() {
        let (fleet, _provider) = fleet(config(0, 2));
        let a = fleet.scale_up().await.unwrap();
        let b = fleet.scale_up().await.unwrap();
        let executor = EchoExecutor::with_delay(Duration::from_millis(50));

        let one = "one".to_string();
        let two = "two".to_string();
        let (r1, r2) = tokio::join!(fleet.execute(&executor, &one), fleet.execute(&executor, &two));
        let mut used = vec![r1.unwrap(), r2.unwrap()];
        used.sort();
        let mut expected = vec![a.to_string(), b.to_string()];
        expected.sort();
        assert_eq!(used, expected);

        let metrics = fleet.metrics();
        assert_eq!(metrics.total_pods, 2);
        assert!(metrics.pod_metrics.iter().all(|p| p.active_requests == 0));
        assert!(metrics.pod_metrics.iter().all(|p| p.total_processed == 1));
        assert!(metrics.average_response_time_ms >= 50.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_failure_releases_lease() {
        let (fleet, _provider) = fleet(config(0, 1));
        fleet.scale_up().await.unwrap();
        let executor = EchoExecutor::failing("pod rejected the workflow");

        let err = fleet.execute(&executor, &"x".to_string()).await.unwrap_err();
        assert!(err.to_string().contains("rejected"));

        let metrics = fleet.metrics();
        assert_eq!(metrics.pod_metrics[0].active_requests, 0);
        assert_eq!(metrics.pod_metrics[0].total_processed, 0);
        assert_eq!(metrics.average_response_time_ms, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_evicts_and_accrues_cost() {
        let (fleet, provider) = fleet(config(0, 3));
        let mut events = fleet.subscribe();
        let healthy = fleet.scale_up().await.unwrap();
        let sick = fleet.scale_up().await.unwrap();
        let exited = fleet.scale_up().await.unwrap();

        provider.set_uptime(&healthy, 3600);
        provider.mark_unhealthy(&sick);
        provider.set_state(&exited, PodState::Exited);

        fleet.run_health_checks().await;

        let metrics = fleet.metrics();
        assert_eq!(metrics.total_pods, 1);
        assert_eq!(metrics.pod_metrics[0].pod_id, healthy);
        assert!((metrics.total_cost - 0.34).abs() < 1e-9);

        let mut evicted = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let FleetEvent::PodUnhealthy { pod_id, .. } = event {
                evicted.push(pod_id);
            }
        }
        evicted.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        let mut expected = vec![sick, exited];
        expected.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        assert_eq!(evicted, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_loop_runs_on_interval() {
        let (fleet, provider) = fleet(config(0, 1));
        let id = fleet.scale_up().await.unwrap();
        provider.mark_unhealthy(&id);

        tokio::time::sleep(fleet.config().health_check_interval() + Duration::from_millis(10)).await;
        assert_eq!(fleet.pod_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_autoscaler_honours_thresholds_and_cooldown() {
        let (fleet, _provider) = fleet(FleetConfig {
            scale_up_threshold: 3,
            scale_down_threshold: 0,
            ..config(0, 3)
        });

        let busy = QueueDepth {
            pending: 3,
            processing: 1,
        };
        assert_eq!(fleet.check_scaling(busy), Some(ScaleDirection::Up));
        // Cooldown blocks a second automatic scale-up.
        assert_eq!(fleet.check_scaling(busy), None);

        tokio::time::advance(fleet.config().scale_up_cooldown()).await;
        assert_eq!(fleet.check_scaling(busy), Some(ScaleDirection::Up));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fleet.pod_count(), 2);

        // Manual scaling is not cooldown-gated.
        assert!(fleet.scale_up().await.is_some());

        let idle = QueueDepth::default();
        assert_eq!(fleet.check_scaling(idle), None);
        tokio::time::advance(fleet.config().pod_idle_timeout()).await;
        assert_eq!(fleet.check_scaling(idle), Some(ScaleDirection::Down));
        assert_eq!(fleet.check_scaling(idle), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_automatic_scale_down_waits_for_idle_queue_and_min_pods() {
        let (fleet, provider) = fleet(FleetConfig {
            scale_down_threshold: 0,
            ..config(1, 3)
        });
        fleet.scale_up().await.unwrap();
        fleet.scale_up().await.unwrap();
        tokio::time::advance(fleet.config().pod_idle_timeout()).await;

        // Both pods are idle, but a request is still processing.
        let in_flight = QueueDepth {
            pending: 0,
            processing: 1,
        };
        assert_eq!(fleet.check_scaling(in_flight), None);
        assert_eq!(fleet.pod_count(), 2);

        // The refusal did not start the cooldown.
        assert_eq!(
            fleet.check_scaling(QueueDepth::default()),
            Some(ScaleDirection::Down)
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fleet.pod_count(), 1);
        assert_eq!(provider.stopped().len(), 1);

        // Idle and past the cooldown, but already at min pods.
        let cfg = fleet.config();
        tokio::time::advance(cfg.scale_down_cooldown() + cfg.pod_idle_timeout()).await;
        assert_eq!(fleet.check_scaling(QueueDepth::default()), None);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fleet.pod_count(), 1);
        assert_eq!(provider.stopped().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_provisioning_stops_new_pod() {
        let (fleet, provider) = fleet(config(0, 2));
        provider.set_deploy_delay(Duration::from_millis(100));

        let provisioning = {
            let fleet = fleet.clone();
            tokio::spawn(async move { fleet.scale_up().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fleet.metrics().provisioning_pods, 1);

        fleet.shutdown().await;
        assert!(provisioning.await.unwrap().is_none());
        assert_eq!(fleet.pod_count(), 0);
        assert_eq!(fleet.metrics().provisioning_pods, 0);
        assert_eq!(provider.stopped(), vec![PodId::new("pod-1")]);

        // Nothing provisions after shutdown, by hand or automatically.
        assert!(fleet.scale_up().await.is_none());
        assert!(fleet.select_pod().await.is_none());
        let pressure = QueueDepth {
            pending: 50,
            processing: 0,
        };
        assert_eq!(fleet.check_scaling(pressure), None);
        assert_eq!(provider.deploy_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_all_pods_despite_failures() {
        let (fleet, provider) = fleet(config(0, 2));
        fleet.scale_up().await.unwrap();
        fleet.scale_up().await.unwrap();
        provider.set_fail_stop(true);

        fleet.shutdown().await;
        assert_eq!(fleet.pod_count(), 0);
    }

    #[test]
    fn test_fleet_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PodFleetManager>();
    }
}
