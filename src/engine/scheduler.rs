//! Batch scheduler
//!
//! One lane task per `(model_id, device)` pair. An idle lane waits for a
//! submission, then keeps collecting for the batch window (or until the batch
//! is full) before running decode rounds. Between rounds it admits newly
//! queued requests and detaches the ones whose caller gave up.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::InitOptions;
use crate::device::{DeviceId, DevicePool};
use crate::error::{InferenceError, SchedulerError};
use crate::model::ModelHandle;

use super::cache::CacheLease;
use super::executor::{ActiveRequest, Executor, Generation, GenerationRequest, Submission};

/// Identity of a lane
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LaneKey {
    pub model_id: String,
    /// Index of the device in the pool
    pub device: usize,
}

struct Lane {
    device: DeviceId,
    sender: mpsc::UnboundedSender<Submission>,
    task: JoinHandle<()>,
}

/// Routes requests to lanes and owns the lane tasks
pub struct BatchScheduler {
    lanes: HashMap<LaneKey, Lane>,
    shutdown: CancellationToken,
    failed: Arc<AtomicBool>,
}

impl BatchScheduler {
    /// Spawn one lane per model and device on `runtime`.
    pub fn start(
        runtime: &tokio::runtime::Handle,
        models: &[Arc<ModelHandle>],
        devices: &DevicePool,
        options: &InitOptions,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let failed = Arc::new(AtomicBool::new(false));
        let mut lanes = HashMap::new();

        for model in models {
            for (index, device) in devices.devices().iter().enumerate() {
                let (sender, receiver) = mpsc::unbounded_channel();
                let lane = LaneLoop {
                    name: format!("{}@{}", model.id(), device.id()),
                    executor: Arc::new(Executor::new(Arc::clone(model), Arc::clone(device))),
                    receiver,
                    window: options.batch_window(),
                    max_batch: model.max_batch_size(),
                    shutdown: shutdown.child_token(),
                    failed: Arc::clone(&failed),
                };
                let task = runtime.spawn(lane.run());
                lanes.insert(
                    LaneKey {
                        model_id: model.id().to_string(),
                        device: index,
                    },
                    Lane {
                        device: device.id(),
                        sender,
                        task,
                    },
                );
            }
        }

        tracing::info!("Started {} scheduler lane(s)", lanes.len());
        Self {
            lanes,
            shutdown,
            failed,
        }
    }

    /// Queue a request on the lane of its conversation's model and device,
    /// and wait for the result.
    ///
    /// Dropping the returned future, or cancelling `cancel`, detaches the
    /// request: the lane stops decoding it and restores its cache.
    pub async fn submit(
        &self,
        lease: CacheLease,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<Generation, SchedulerError> {
        let key = LaneKey {
            model_id: lease.key().model_id.clone(),
            device: lease.device(),
        };
        let lane = self.lanes.get(&key).ok_or_else(|| SchedulerError::NoLane {
            model_id: key.model_id.clone(),
            device: key.device,
        })?;

        let (reply, receiver) = oneshot::channel();
        lane.sender
            .send(Submission {
                request,
                lease,
                cancel,
                reply,
            })
            .map_err(|_| SchedulerError::LaneClosed)?;

        receiver.await.map_err(|_| SchedulerError::LaneClosed)?
    }

    /// Whether a lane hit an unrecoverable device failure
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// Devices with a lane for `model_id`
    pub fn lane_devices(&self, model_id: &str) -> Vec<DeviceId> {
        let mut devices: Vec<DeviceId> = self
            .lanes
            .iter()
            .filter(|(key, _)| key.model_id == model_id)
            .map(|(_, lane)| lane.device)
            .collect();
        devices.sort();
        devices
    }

    /// Stop every lane. Queued and in-flight requests observe `LaneClosed`.
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        for lane in self.lanes.values() {
            lane.task.abort();
        }
        tracing::debug!("Stopped {} scheduler lane(s)", self.lanes.len());
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Drop for BatchScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for BatchScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchScheduler")
            .field("lanes", &self.lanes.len())
            .field("failed", &self.is_failed())
            .finish()
    }
}

struct LaneLoop {
    name: String,
    executor: Arc<Executor>,
    receiver: mpsc::UnboundedReceiver<Submission>,
    window: Duration,
    max_batch: usize,
    shutdown: CancellationToken,
    failed: Arc<AtomicBool>,
}

impl LaneLoop {
    async fn run(mut self) {
        let mut waiting: VecDeque<Submission> = VecDeque::new();
        let mut active: Vec<ActiveRequest> = Vec::new();
        let mut next_id: u64 = 0;

        tracing::debug!("Lane {} started", self.name);

        loop {
            if active.is_empty() && waiting.is_empty() {
                let first = tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    submission = self.receiver.recv() => match submission {
                        Some(s) => s,
                        None => break,
                    },
                };
                waiting.push_back(first);
                self.collect_window(&mut waiting).await;
            }

            while let Ok(s) = self.receiver.try_recv() {
                waiting.push_back(s);
            }
            if self.shutdown.is_cancelled() {
                break;
            }

            waiting.retain(|s| !s.is_abandoned());
            let (abandoned, kept): (Vec<_>, Vec<_>) =
                active.into_iter().partition(ActiveRequest::is_abandoned);
            abandoned.into_iter().for_each(ActiveRequest::detach);
            active = kept;

            // Continuous batching: top up to the batch limit
            let mut live: usize = active.iter().map(ActiveRequest::live_sequences).sum();
            while let Some(front) = waiting.front() {
                let n = front.sequences();
                if live > 0 && live + n > self.max_batch {
                    break;
                }
                if let Some(submission) = waiting.pop_front() {
                    live += n;
                    active.push(self.executor.admit(next_id, submission));
                    next_id += 1;
                }
            }
            if active.is_empty() {
                continue;
            }

            let executor = Arc::clone(&self.executor);
            let mut batch = std::mem::take(&mut active);
            let joined = tokio::task::spawn_blocking(move || {
                // A panicking round keeps its batch so the caches can be rolled back
                let result = panic::catch_unwind(AssertUnwindSafe(|| executor.step(&mut batch)))
                    .unwrap_or_else(|cause| Err(InferenceError::Device(panic_message(&*cause))));
                (batch, result)
            })
            .await;

            let (batch, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    // The batch went down with the worker; callers see LaneClosed
                    tracing::error!("Lane {} round aborted: {}", self.name, e);
                    continue;
                }
            };

            match result {
                Ok(()) => {
                    for req in batch {
                        if req.is_done() {
                            req.finish();
                        } else {
                            active.push(req);
                        }
                    }
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!("Lane {} lost its device: {}", self.name, e);
                    self.failed.store(true, Ordering::Release);
                    for req in batch {
                        req.fail(SchedulerError::Inference(e.clone()));
                    }
                    for s in waiting.drain(..) {
                        s.reject(SchedulerError::Inference(e.clone()));
                    }
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        "Lane {} round failed for {} request(s): {}",
                        self.name,
                        batch.len(),
                        e
                    );
                    for req in batch {
                        req.fail(SchedulerError::Inference(e.clone()));
                    }
                }
            }
        }

        tracing::debug!("Lane {} stopped", self.name);
    }

    /// Keep receiving until the window closes or the batch is full.
    async fn collect_window(&mut self, waiting: &mut VecDeque<Submission>) {
        let deadline = Instant::now() + self.window;
        let mut queued: usize = waiting.iter().map(Submission::sequences).sum();
        while queued < self.max_batch {
            match tokio::time::timeout_at(deadline, self.receiver.recv()).await {
                Ok(Some(s)) => {
                    queued += s.sequences();
                    waiting.push_back(s);
                }
                _ => break,
            }
        }
    }
}

fn panic_message(cause: &(dyn Any + Send)) -> String {
    let detail = cause
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| cause.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown cause");
    format!("round panicked: {}", detail)
}
