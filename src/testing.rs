//! In-crate test doubles for the provider, executor and health-probe seams.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::backend::HealthProbe;
use crate::core::executor::{PodExecutor, PodTarget};
use crate::provider::{ComputeProvider, DeployedPod, PodSpec, PodState, PodStatusReport};
use crate::types::PodId;

struct MockPod {
    state: PodState,
    polls: u32,
    uptime_seconds: u64,
}

#[derive(Default)]
struct MockState {
    next_id: u32,
    pods: HashMap<PodId, MockPod>,
    ready_after_polls: u32,
    deploy_delay: Duration,
    fail_deploy: bool,
    fail_stop: bool,
    unhealthy: HashSet<PodId>,
    deploy_calls: usize,
    stopped: Vec<PodId>,
    resumed: Vec<PodId>,
    terminated: Vec<PodId>,
}

/// Scriptable in-memory pod provider.
///
/// Deployed pods report `PENDING` until they have been polled
/// `ready_after_polls` times, then `RUNNING`.
#[derive(Default)]
pub struct MockProvider {
    state: Mutex<MockState>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready_after_polls(&self, polls: u32) {
        self.state.lock().ready_after_polls = polls;
    }

    pub fn set_deploy_delay(&self, delay: Duration) {
        self.state.lock().deploy_delay = delay;
    }

    pub fn set_fail_deploy(&self, fail: bool) {
        self.state.lock().fail_deploy = fail;
    }

    pub fn set_fail_stop(&self, fail: bool) {
        self.state.lock().fail_stop = fail;
    }

    pub fn mark_unhealthy(&self, id: &PodId) {
        self.state.lock().unhealthy.insert(id.clone());
    }

    pub fn set_state(&self, id: &PodId, state: PodState) {
        if let Some(pod) = self.state.lock().pods.get_mut(id) {
            pod.state = state;
        }
    }

    pub fn set_uptime(&self, id: &PodId, seconds: u64) {
        if let Some(pod) = self.state.lock().pods.get_mut(id) {
            pod.uptime_seconds = seconds;
        }
    }

    /// Register an existing pod, as if created outside the fleet.
    pub fn insert_pod(&self, id: &PodId, state: PodState) {
        self.state.lock().pods.insert(
            id.clone(),
            MockPod {
                state,
                polls: 0,
                uptime_seconds: 0,
            },
        );
    }

    pub fn deploy_calls(&self) -> usize {
        self.state.lock().deploy_calls
    }

    pub fn stopped(&self) -> Vec<PodId> {
        self.state.lock().stopped.clone()
    }

    pub fn resumed(&self) -> Vec<PodId> {
        self.state.lock().resumed.clone()
    }

    pub fn terminated(&self) -> Vec<PodId> {
        self.state.lock().terminated.clone()
    }
}

#[async_trait]
impl ComputeProvider for MockProvider {
    async fn deploy(&self, _spec: &PodSpec) -> Result<DeployedPod> {
        let delay = {
            let mut st = self.state.lock();
            st.deploy_calls += 1;
            if st.fail_deploy {
                anyhow::bail!("no GPU capacity available");
            }
            st.deploy_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let id = {
            let mut st = self.state.lock();
            st.next_id += 1;
            let id = PodId::new(format!("pod-{}", st.next_id));
            st.pods.insert(
                id.clone(),
                MockPod {
                    state: PodState::Pending,
                    polls: 0,
                    uptime_seconds: 0,
                },
            );
            id
        };

        Ok(DeployedPod {
            url: self.pod_url(&id),
            status: PodState::Pending,
            id,
        })
    }

    async fn status(&self, id: &PodId) -> Result<PodStatusReport> {
        let mut guard = self.state.lock();
        let st = &mut *guard;
        let pod = st
            .pods
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("Pod {} not found", id))?;

        if pod.state == PodState::Pending {
            if pod.polls >= st.ready_after_polls {
                pod.state = PodState::Running;
            } else {
                pod.polls += 1;
            }
        }

        Ok(PodStatusReport {
            id: id.clone(),
            status: pod.state.clone(),
            uptime_seconds: pod.uptime_seconds,
            gpu_label: "Mock GPU".to_string(),
        })
    }

    async fn stop(&self, id: &PodId) -> Result<()> {
        let mut st = self.state.lock();
        if st.fail_stop {
            anyhow::bail!("stop rejected for {}", id);
        }
        if let Some(pod) = st.pods.get_mut(id) {
            pod.state = PodState::Stopped;
        }
        st.stopped.push(id.clone());
        Ok(())
    }

    async fn resume(&self, id: &PodId) -> Result<DeployedPod> {
        let mut st = self.state.lock();
        let pod = st
            .pods
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("Pod {} not found", id))?;
        pod.state = PodState::Pending;
        pod.polls = 0;
        st.resumed.push(id.clone());
        drop(st);

        Ok(DeployedPod {
            id: id.clone(),
            status: PodState::Pending,
            url: self.pod_url(id),
        })
    }

    async fn terminate(&self, id: &PodId) -> Result<()> {
        let mut st = self.state.lock();
        st.pods.remove(id);
        st.terminated.push(id.clone());
        Ok(())
    }

    async fn health_check(&self, id: &PodId) -> bool {
        let st = self.state.lock();
        !st.unhealthy.contains(id) && st.pods.get(id).is_some_and(|p| p.state.is_running())
    }

    async fn list(&self) -> Result<Vec<PodStatusReport>> {
        let st = self.state.lock();
        let mut pods: Vec<_> = st
            .pods
            .iter()
            .map(|(id, pod)| PodStatusReport {
                id: id.clone(),
                status: pod.state.clone(),
                uptime_seconds: pod.uptime_seconds,
                gpu_label: "Mock GPU".to_string(),
            })
            .collect();
        pods.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        Ok(pods)
    }

    fn pod_url(&self, id: &PodId) -> String {
        format!("http://{}.pods.test", id)
    }
}

/// Returns the id of the pod it ran on, or a fixed error.
pub struct EchoExecutor {
    delay: Duration,
    failure: Option<String>,
    calls: AtomicUsize,
}

impl EchoExecutor {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            failure: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            delay: Duration::ZERO,
            failure: Some(message.to_string()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PodExecutor<String, String> for EchoExecutor {
    async fn execute(&self, pod: &PodTarget, _payload: &String) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.failure {
            Some(message) => anyhow::bail!("{}", message),
            None => Ok(pod.id.to_string()),
        }
    }
}

/// Health probe with a fixed answer that counts how often it ran.
#[derive(Clone)]
pub struct StaticProbe {
    healthy: Arc<Mutex<bool>>,
    calls: Arc<AtomicUsize>,
}

impl StaticProbe {
    pub fn new(healthy: bool) -> Self {
        Self {
            healthy: Arc::new(Mutex::new(healthy)),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        *self.healthy.lock() = healthy;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for StaticProbe {
    async fn probe(&self) -> Result<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(*self.healthy.lock())
    }
}
