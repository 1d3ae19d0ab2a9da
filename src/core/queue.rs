// Priority request queue with bounded concurrency, retries and timeouts

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{Notify, broadcast, mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::core::events::{QueueDepth, QueueEvent};
use crate::error::QueueError;
use crate::types::{Priority, RequestId};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Per-request admission options; unset fields take the queue defaults.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: Priority,
    pub max_retries: Option<u32>,
    pub timeout: Option<Duration>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Read-only view of a tracked request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestInfo<R> {
    pub id: RequestId,
    pub priority: Priority,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retries: u32,
    pub max_retries: u32,
    pub timeout_ms: u64,
    pub result: Option<R>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMetrics {
    pub total_requests: usize,
    pub pending_requests: usize,
    pub processing_requests: usize,
    pub completed_requests: usize,
    pub failed_requests: usize,
    pub average_wait_time_ms: f64,
    pub average_processing_time_ms: f64,
    pub current_queue_length: usize,
}

/// One-shot completion callback handed to the process handler.
///
/// Consuming `succeed`/`fail`/`complete` resolves the attempt once. Dropping
/// an unresolved handle reports a handler failure.
pub struct Completion<R> {
    callback: Option<Box<dyn FnOnce(Result<R, QueueError>) + Send>>,
}

impl<R> Completion<R> {
    pub fn succeed(self, result: R) {
        self.complete(Ok(result));
    }

    pub fn fail(self, error: impl fmt::Display) {
        self.complete(Err(QueueError::Handler(error.to_string())));
    }

    pub fn complete(mut self, outcome: Result<R, QueueError>) {
        if let Some(callback) = self.callback.take() {
            callback(outcome);
        }
    }
}

impl<R> Drop for Completion<R> {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            callback(Err(QueueError::Handler(
                "process handler dropped the request without completing it".to_string(),
            )));
        }
    }
}

impl<R> fmt::Debug for Completion<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("resolved", &self.callback.is_none())
            .finish()
    }
}

/// A dequeued request handed to the external process handler.
#[derive(Debug)]
pub struct ProcessJob<P, R> {
    pub request_id: RequestId,
    pub priority: Priority,
    /// 1-based attempt number; retries reuse the request id.
    pub attempt: u32,
    pub payload: Arc<P>,
    pub completion: Completion<R>,
}

/// Receiving side of the process signal. Exactly one consumer should drain it.
pub type ProcessJobs<P, R> = mpsc::UnboundedReceiver<ProcessJob<P, R>>;

struct Record<P, R> {
    id: RequestId,
    priority: Priority,
    status: RequestStatus,
    payload: Arc<P>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    enqueued: Instant,
    attempt_started: Option<Instant>,
    retries: u32,
    max_retries: u32,
    timeout: Duration,
    attempt: u32,
    last_error: Option<QueueError>,
    outcome: Option<Result<R, QueueError>>,
    timer: Option<AbortHandle>,
    waiters: Vec<oneshot::Sender<Result<R, QueueError>>>,
}

impl<P, R: Clone> Record<P, R> {
    fn info(&self) -> RequestInfo<R> {
        RequestInfo {
            id: self.id.clone(),
            priority: self.priority,
            status: self.status,
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            retries: self.retries,
            max_retries: self.max_retries,
            timeout_ms: self.timeout.as_millis() as u64,
            result: self.outcome.as_ref().and_then(|o| o.as_ref().ok().cloned()),
            error: self.last_error.as_ref().map(|e| e.to_string()),
        }
    }

    fn settle(&mut self, outcome: Result<R, QueueError>) {
        self.completed_at = Some(Utc::now());
        match &outcome {
            Ok(_) => self.status = RequestStatus::Completed,
            Err(err) => {
                self.status = RequestStatus::Failed;
                self.last_error = Some(err.clone());
            }
        }
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
        self.outcome = Some(outcome);
    }
}

struct PendingSlot {
    id: RequestId,
    weight: u32,
}

#[derive(Default)]
struct Timings {
    wait_total: Duration,
    wait_samples: u64,
    processing_total: Duration,
    processing_samples: u64,
}

impl Timings {
    fn average_ms(total: Duration, samples: u64) -> f64 {
        if samples == 0 {
            0.0
        } else {
            total.as_secs_f64() * 1000.0 / samples as f64
        }
    }
}

struct QueueState<P, R> {
    config: Arc<QueueConfig>,
    records: HashMap<RequestId, Record<P, R>>,
    pending: VecDeque<PendingSlot>,
    processing: usize,
    completed: usize,
    failed: usize,
    timings: Timings,
}

impl<P, R> QueueState<P, R> {
    fn depth(&self) -> QueueDepth {
        QueueDepth {
            pending: self.pending.len(),
            processing: self.processing,
        }
    }

    /// Position after the last pending slot of equal or higher weight, which
    /// keeps FIFO order within a priority class.
    fn insert_position(&self, weight: u32) -> usize {
        self.pending
            .iter()
            .rposition(|slot| slot.weight >= weight)
            .map_or(0, |i| i + 1)
    }
}

struct Shared<P, R> {
    state: Mutex<QueueState<P, R>>,
    events: broadcast::Sender<QueueEvent>,
    jobs: mpsc::UnboundedSender<ProcessJob<P, R>>,
    wake: Arc<Notify>,
    runtime: Handle,
}

impl<P, R> Drop for Shared<P, R> {
    fn drop(&mut self) {
        // Lets the dispatcher observe that the queue is gone and exit.
        self.wake.notify_one();
    }
}

impl<P, R> Shared<P, R>
where
    P: Send + Sync + 'static,
    R: Clone + Send + 'static,
{
    fn emit(&self, event: QueueEvent) {
        let _ = self.events.send(event);
    }

    /// Move pending requests into processing while capacity allows.
    fn pump(self: &Arc<Self>) {
        let mut undeliverable = Vec::new();
        {
            let mut guard = self.state.lock();
            let st = &mut *guard;

            while st.processing < st.config.max_concurrent {
                let Some(slot) = st.pending.pop_front() else {
                    break;
                };
                let Some(record) = st.records.get_mut(&slot.id) else {
                    continue;
                };
                if record.status != RequestStatus::Pending {
                    continue;
                }

                let now = Instant::now();
                if record.attempt_started.is_none() {
                    st.timings.wait_total += now.saturating_duration_since(record.enqueued);
                    st.timings.wait_samples += 1;
                    record.started_at = Some(Utc::now());
                }
                record.status = RequestStatus::Processing;
                record.attempt += 1;
                record.attempt_started = Some(now);
                st.processing += 1;

                let id = record.id.clone();
                let attempt = record.attempt;
                let timeout = record.timeout;
                let weak = Arc::downgrade(self);
                let timer = self.runtime.spawn({
                    let weak = weak.clone();
                    let id = id.clone();
                    async move {
                        tokio::time::sleep(timeout).await;
                        if let Some(shared) = weak.upgrade() {
                            debug!(request_id = %id, attempt, "Request attempt timed out");
                            shared.finish(&id, attempt, Err(QueueError::RequestTimeout));
                        }
                    }
                });
                record.timer = Some(timer.abort_handle());

                let job = ProcessJob {
                    request_id: id.clone(),
                    priority: record.priority,
                    attempt,
                    payload: record.payload.clone(),
                    completion: Self::completion(weak, id.clone(), attempt),
                };

                let depth = st.depth();
                self.emit(QueueEvent::Processing {
                    id,
                    attempt,
                    depth,
                });

                // Sent under the lock so handlers observe dispatch order.
                if let Err(mpsc::error::SendError(job)) = self.jobs.send(job) {
                    undeliverable.push(job);
                }
            }
        }

        for job in undeliverable {
            warn!(request_id = %job.request_id, "No process handler attached to the queue");
            job.completion.fail("no process handler is attached to the queue");
        }
    }

    fn completion(weak: Weak<Self>, id: RequestId, attempt: u32) -> Completion<R> {
        Completion {
            callback: Some(Box::new(move |outcome| {
                if let Some(shared) = weak.upgrade() {
                    shared.finish(&id, attempt, outcome);
                }
            })),
        }
    }

    /// Apply the outcome of one processing attempt.
    fn finish(self: &Arc<Self>, id: &RequestId, attempt: u32, outcome: Result<R, QueueError>) {
        {
            let mut guard = self.state.lock();
            let st = &mut *guard;

            let Some(record) = st.records.get_mut(id) else {
                return;
            };
            if record.status != RequestStatus::Processing || record.attempt != attempt {
                debug!(request_id = %id, attempt, "Ignoring completion of a superseded attempt");
                return;
            }
            if let Some(timer) = record.timer.take() {
                timer.abort();
            }
            st.processing -= 1;

            match outcome {
                Ok(result) => {
                    if let Some(started) = record.attempt_started {
                        st.timings.processing_total += started.elapsed();
                        st.timings.processing_samples += 1;
                    }
                    record.settle(Ok(result));
                    st.completed += 1;
                    let depth = st.depth();
                    self.emit(QueueEvent::Completed {
                        id: id.clone(),
                        depth,
                    });
                }
                Err(error) => {
                    let will_retry = error.is_retriable() && record.retries < record.max_retries;
                    if will_retry {
                        record.retries += 1;
                    }
                    self.emit(QueueEvent::Error {
                        id: id.clone(),
                        error: error.clone(),
                        retries: record.retries,
                        will_retry,
                    });

                    if will_retry {
                        info!(
                            request_id = %id,
                            "Retrying request (retry {}/{}) after: {}",
                            record.retries,
                            record.max_retries,
                            error
                        );
                        record.status = RequestStatus::Pending;
                        record.last_error = Some(error);
                        let weight = st.config.priority_weights.weight(record.priority);
                        st.pending.push_front(PendingSlot {
                            id: id.clone(),
                            weight,
                        });
                    } else {
                        warn!(request_id = %id, "Request failed: {}", error);
                        record.settle(Err(error.clone()));
                        st.failed += 1;
                        let depth = st.depth();
                        self.emit(QueueEvent::Failed {
                            id: id.clone(),
                            error,
                            depth,
                        });
                    }
                }
            }
        }

        self.pump();
    }
}

/// Priority request queue.
///
/// Requests are ordered by priority weight with FIFO tie-break and handed to
/// a single process handler through [`ProcessJobs`]; at most
/// `max_concurrent` are ever in processing. Cloning yields another handle to
/// the same queue.
pub struct RequestQueue<P, R> {
    shared: Arc<Shared<P, R>>,
}

impl<P, R> Clone for RequestQueue<P, R> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<P, R> RequestQueue<P, R>
where
    P: Send + Sync + 'static,
    R: Clone + Send + 'static,
{
    /// Create a queue and the receiver its process handler must drain.
    ///
    /// Must be called from within a Tokio runtime; the dispatcher and the
    /// per-request timers are spawned on it.
    pub fn new(config: QueueConfig) -> (Self, ProcessJobs<P, R>) {
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let wake = Arc::new(Notify::new());
        let runtime = Handle::current();

        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                config: Arc::new(config),
                records: HashMap::new(),
                pending: VecDeque::new(),
                processing: 0,
                completed: 0,
                failed: 0,
                timings: Timings::default(),
            }),
            events,
            jobs: jobs_tx,
            wake: wake.clone(),
            runtime: runtime.clone(),
        });

        let weak = Arc::downgrade(&shared);
        runtime.spawn(async move {
            loop {
                wake.notified().await;
                match weak.upgrade() {
                    Some(shared) => shared.pump(),
                    None => break,
                }
            }
            debug!("Queue dispatcher stopped");
        });

        (Self { shared }, jobs_rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.shared.events.subscribe()
    }

    /// Admit a request. Dispatch happens on the next scheduler turn, so a
    /// burst of enqueues is ordered before any of it starts.
    pub fn enqueue(&self, payload: P, options: EnqueueOptions) -> Result<RequestId, QueueError> {
        let id = {
            let mut guard = self.shared.state.lock();
            let st = &mut *guard;

            if st.pending.len() >= st.config.max_queue_size {
                return Err(QueueError::QueueFull {
                    max: st.config.max_queue_size,
                });
            }

            let id = RequestId::generate();
            let record = Record {
                id: id.clone(),
                priority: options.priority,
                status: RequestStatus::Pending,
                payload: Arc::new(payload),
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
                enqueued: Instant::now(),
                attempt_started: None,
                retries: 0,
                max_retries: options.max_retries.unwrap_or(st.config.default_max_retries),
                timeout: options.timeout.unwrap_or_else(|| st.config.default_timeout()),
                attempt: 0,
                last_error: None,
                outcome: None,
                timer: None,
                waiters: Vec::new(),
            };
            st.records.insert(id.clone(), record);

            let weight = st.config.priority_weights.weight(options.priority);
            let position = st.insert_position(weight);
            st.pending.insert(
                position,
                PendingSlot {
                    id: id.clone(),
                    weight,
                },
            );

            let depth = st.depth();
            self.shared.emit(QueueEvent::Enqueued {
                id: id.clone(),
                priority: options.priority,
                depth,
            });
            id
        };

        debug!(request_id = %id, priority = %options.priority, "Request enqueued");
        self.shared.wake.notify_one();
        Ok(id)
    }

    /// Cancel a pending request. Processing and finished requests are left alone.
    pub fn cancel(&self, id: &RequestId) -> bool {
        let mut guard = self.shared.state.lock();
        let st = &mut *guard;

        let Some(index) = st.pending.iter().position(|slot| &slot.id == id) else {
            return false;
        };
        st.pending.remove(index);

        if let Some(record) = st.records.get_mut(id) {
            record.settle(Err(QueueError::Cancelled));
        }
        st.failed += 1;

        let depth = st.depth();
        self.shared.emit(QueueEvent::Cancelled {
            id: id.clone(),
            depth,
        });
        info!(request_id = %id, "Request cancelled");
        true
    }

    /// Resolve with the request's result once it reaches a terminal state.
    pub async fn wait_for_completion(&self, id: &RequestId) -> Result<R, QueueError> {
        let receiver = {
            let mut guard = self.shared.state.lock();
            let record = guard
                .records
                .get_mut(id)
                .ok_or_else(|| QueueError::NotFound(id.clone()))?;

            if let Some(outcome) = &record.outcome {
                return outcome.clone();
            }
            let (tx, rx) = oneshot::channel();
            record.waiters.push(tx);
            rx
        };

        receiver.await.unwrap_or(Err(QueueError::Closed))
    }

    pub fn get_request(&self, id: &RequestId) -> Option<RequestInfo<R>> {
        self.shared.state.lock().records.get(id).map(Record::info)
    }

    pub fn metrics(&self) -> QueueMetrics {
        let st = self.shared.state.lock();
        QueueMetrics {
            total_requests: st.records.len(),
            pending_requests: st.pending.len(),
            processing_requests: st.processing,
            completed_requests: st.completed,
            failed_requests: st.failed,
            average_wait_time_ms: Timings::average_ms(st.timings.wait_total, st.timings.wait_samples),
            average_processing_time_ms: Timings::average_ms(
                st.timings.processing_total,
                st.timings.processing_samples,
            ),
            current_queue_length: st.pending.len(),
        }
    }

    pub fn depth(&self) -> QueueDepth {
        self.shared.state.lock().depth()
    }

    pub fn queue_length(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    pub fn processing_count(&self) -> usize {
        self.shared.state.lock().processing
    }

    pub fn is_full(&self) -> bool {
        let st = self.shared.state.lock();
        st.pending.len() >= st.config.max_queue_size
    }

    pub fn is_at_max_concurrent(&self) -> bool {
        let st = self.shared.state.lock();
        st.processing >= st.config.max_concurrent
    }

    pub fn config(&self) -> Arc<QueueConfig> {
        self.shared.state.lock().config.clone()
    }

    /// Replace the whole configuration and fill any newly available slots.
    pub fn update_config(&self, config: QueueConfig) {
        {
            let mut st = self.shared.state.lock();
            st.config = Arc::new(config.clone());
            self.shared.emit(QueueEvent::ConfigUpdated(config));
        }
        self.shared.pump();
    }

    pub fn set_max_concurrent(&self, max_concurrent: usize) {
        let mut config = (*self.config()).clone();
        config.max_concurrent = max_concurrent;
        info!("Queue max concurrency set to {}", max_concurrent);
        self.update_config(config);
    }

    /// Drop finished records and reset aggregate timings.
    pub fn clear_history(&self) {
        let mut guard = self.shared.state.lock();
        let st = &mut *guard;
        st.records.retain(|_, record| !record.status.is_terminal());
        st.completed = 0;
        st.failed = 0;
        st.timings = Timings::default();
    }
}
