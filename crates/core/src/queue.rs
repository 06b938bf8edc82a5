//! Single-consumer queue for work that runs after a response has been sent.
//!
//! Jobs run strictly in enqueue order, one at a time. A failing or panicking job is
//! recorded as `Errored` and the worker moves on to the next one.

use crate::config::QueueConfig;
use crate::traits::Computation;
use crate::{ComputationJob, JobError, JobPayload, JobState, JobStatus};
use chrono::Utc;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info};
use uuid::Uuid;

struct JobHistory {
    entries: HashMap<Uuid, JobStatus>,
    order: VecDeque<Uuid>,
    cap: usize,
}

impl JobHistory {
    fn new(cap: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            cap: cap.max(1),
        }
    }

    fn record_queued(&mut self, job: &ComputationJob) {
        self.entries.insert(
            job.job_id,
            JobStatus {
                state: JobState::Queued,
                enqueued_at: job.enqueued_at,
                started_at: None,
                finished_at: None,
                error: None,
            },
        );
        self.order.push_back(job.job_id);
    }

    fn forget(&mut self, job_id: Uuid) {
        self.entries.remove(&job_id);
        self.order.retain(|id| *id != job_id);
    }

    fn mark_processing(&mut self, job_id: Uuid) {
        if let Some(status) = self.entries.get_mut(&job_id) {
            status.state = JobState::Processing;
            status.started_at = Some(Utc::now());
        }
    }

    fn mark_finished(&mut self, job_id: Uuid, failure: Option<String>) {
        if let Some(status) = self.entries.get_mut(&job_id) {
            status.state = if failure.is_some() {
                JobState::Errored
            } else {
                JobState::Completed
            };
            status.finished_at = Some(Utc::now());
            status.error = failure;
        }
    }

    /// Drops the oldest finished entries until the map fits the cap. Jobs still queued
    /// or running are never evicted.
    fn evict(&mut self) -> usize {
        let mut evicted = 0;
        while self.entries.len() > self.cap {
            let oldest_finished = self.order.iter().position(|id| {
                self.entries
                    .get(id)
                    .map_or(true, |status| status.state.is_terminal())
            });
            let Some(position) = oldest_finished else {
                break;
            };
            if let Some(job_id) = self.order.remove(position) {
                self.entries.remove(&job_id);
                evicted += 1;
            }
        }
        evicted
    }
}

pub struct ComputationQueue {
    sender: Mutex<Option<UnboundedSender<ComputationJob>>>,
    history: Arc<Mutex<JobHistory>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ComputationQueue {
    /// Spawns the worker on the current tokio runtime.
    pub fn init(computation: Arc<dyn Computation>, config: QueueConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let history = Arc::new(Mutex::new(JobHistory::new(config.history_cap)));
        let worker = tokio::spawn(drain(receiver, computation, Arc::clone(&history)));

        Self {
            sender: Mutex::new(Some(sender)),
            history,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Never waits on the worker.
    pub fn enqueue(&self, job: ComputationJob) -> Result<Uuid, JobError> {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = sender.as_ref() else {
            return Err(JobError::QueueClosed);
        };

        let job_id = job.job_id;
        lock(&self.history).record_queued(&job);
        if sender.send(job).is_err() {
            lock(&self.history).forget(job_id);
            return Err(JobError::QueueClosed);
        }

        debug!(%job_id, "computation job queued");
        Ok(job_id)
    }

    pub fn submit(&self, payload: JobPayload) -> Result<Uuid, JobError> {
        self.enqueue(ComputationJob::new(payload))
    }

    pub fn state(&self, job_id: Uuid) -> Option<JobState> {
        lock(&self.history).entries.get(&job_id).map(|status| status.state)
    }

    pub fn status(&self, job_id: Uuid) -> Option<JobStatus> {
        lock(&self.history).entries.get(&job_id).cloned()
    }

    /// Known jobs in enqueue order.
    pub fn snapshot(&self) -> Vec<(Uuid, JobStatus)> {
        let history = lock(&self.history);
        history
            .order
            .iter()
            .filter_map(|id| history.entries.get(id).map(|status| (*id, status.clone())))
            .collect()
    }

    pub fn pending(&self) -> usize {
        lock(&self.history)
            .entries
            .values()
            .filter(|status| !status.state.is_terminal())
            .count()
    }

    /// Stops accepting jobs and waits for the worker to finish everything already queued.
    pub async fn shutdown(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if let Err(join_error) = worker.await {
                error!(error = %join_error, "computation worker ended abnormally");
            }
        }
    }
}

fn lock(history: &Mutex<JobHistory>) -> MutexGuard<'_, JobHistory> {
    history.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn drain(
    mut receiver: UnboundedReceiver<ComputationJob>,
    computation: Arc<dyn Computation>,
    history: Arc<Mutex<JobHistory>>,
) {
    info!(computation = computation.name(), "computation worker started");

    while let Some(mut job) = receiver.recv().await {
        let job_id = job.job_id;
        job.state = JobState::Processing;
        lock(&history).mark_processing(job_id);
        debug!(%job_id, "computation job started");

        let task_computation = Arc::clone(&computation);
        let outcome = tokio::spawn(async move { task_computation.run(&job).await }).await;
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(job_error)) => Some(job_error),
            Err(join_error) => Some(JobError::Panicked(join_message(join_error))),
        };

        match &failure {
            None => debug!(%job_id, "computation job completed"),
            Some(job_error) => error!(
                %job_id,
                computation = computation.name(),
                error = %job_error,
                "computation job failed"
            ),
        }

        let mut records = lock(&history);
        records.mark_finished(job_id, failure.map(|job_error| job_error.to_string()));
        let evicted = records.evict();
        if evicted > 0 {
            debug!(evicted, "evicted finished jobs from history");
        }
    }

    info!("computation worker stopped");
}

fn join_message(join_error: JoinError) -> String {
    if !join_error.is_panic() {
        return join_error.to_string();
    }
    panic_text(join_error.into_panic())
}

fn panic_text(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => payload
            .downcast_ref::<&str>()
            .map(|message| (*message).to_string())
            .unwrap_or_else(|| "unknown panic".to_string()),
    }
}
