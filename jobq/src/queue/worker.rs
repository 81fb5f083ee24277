//! Worker loop: poll, lock, run, close.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::Result;
use crate::config::QueueConfig;
use crate::domain::Job;
use crate::queue::{ExecutionOutcome, JobManager, JobRunner};

/// Interval between heartbeats of a running job.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Running job count per queue, for per-queue limits.
#[derive(Debug, Default)]
struct QueueSlots {
    running: Mutex<HashMap<String, usize>>,
}

impl QueueSlots {
    fn acquire(&self, queue: &str) {
        *self.running.lock().entry(queue.to_string()).or_default() += 1;
    }

    fn release(&self, queue: &str) {
        let mut running = self.running.lock();
        if let Some(count) = running.get_mut(queue) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                running.remove(queue);
            }
        }
    }

    /// Queues at or above their configured limit.
    fn saturated(&self, config: &QueueConfig) -> Vec<String> {
        self.running
            .lock()
            .iter()
            .filter(|(queue, count)| config.queue_limit(queue).is_some_and(|limit| **count >= limit))
            .map(|(queue, _)| queue.clone())
            .collect()
    }
}

/// Polls the queue and runs locked jobs through a [`JobRunner`].
pub struct Worker {
    manager: Arc<JobManager>,
    runner: Arc<dyn JobRunner>,
    config: QueueConfig,
    semaphore: Arc<Semaphore>,
    slots: Arc<QueueSlots>,
    cancellation_token: Mutex<CancellationToken>,
    tasks: Mutex<Option<JoinSet<()>>>,
}

impl Worker {
    pub fn new(manager: Arc<JobManager>, runner: Arc<dyn JobRunner>, config: QueueConfig) -> Self {
        Self {
            manager,
            runner,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_jobs)),
            config,
            slots: Arc::new(QueueSlots::default()),
            cancellation_token: Mutex::new(CancellationToken::new()),
            tasks: Mutex::new(None),
        }
    }

    pub fn worker_name(&self) -> &str {
        &self.config.worker_name
    }

    /// Recover jobs left RUNNING under this worker's name, then start polling.
    ///
    /// The loop stops when `cancel` (or [`stop`](Self::stop)) fires; running
    /// jobs see the cancellation through the token passed to the runner.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        self.config.validate()?;
        self.manager
            .recover_stale_jobs(&self.config.worker_name)
            .await?;

        let token = cancel.child_token();
        *self.cancellation_token.lock() = token.clone();

        let poller = Poller {
            manager: self.manager.clone(),
            runner: self.runner.clone(),
            config: self.config.clone(),
            semaphore: self.semaphore.clone(),
            slots: self.slots.clone(),
            cancel: token,
        };

        info!(
            worker = %self.config.worker_name,
            max_concurrent_jobs = self.config.max_concurrent_jobs,
            "Starting worker"
        );

        let mut tasks = JoinSet::new();
        tasks.spawn(poller.run());
        *self.tasks.lock() = Some(tasks);
        Ok(())
    }

    /// Stop polling and wait for running jobs to finish.
    pub async fn stop(&self) {
        info!(worker = %self.config.worker_name, "Stopping worker");
        self.cancellation_token.lock().cancel();

        let tasks = self.tasks.lock().take();
        if let Some(mut tasks) = tasks {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    error!(worker = %self.config.worker_name, error = %e, "Worker task panicked");
                }
            }
        }

        info!(worker = %self.config.worker_name, "Worker stopped");
    }

    /// Jobs currently executing.
    pub fn active_count(&self) -> usize {
        self.config.max_concurrent_jobs - self.semaphore.available_permits()
    }

    pub fn is_running(&self) -> bool {
        self.tasks.lock().is_some() && !self.cancellation_token.lock().is_cancelled()
    }
}

struct Poller {
    manager: Arc<JobManager>,
    runner: Arc<dyn JobRunner>,
    config: QueueConfig,
    semaphore: Arc<Semaphore>,
    slots: Arc<QueueSlots>,
    cancel: CancellationToken,
}

impl Poller {
    async fn run(self) {
        let worker_name = self.config.worker_name.clone();
        let mut jobs = JoinSet::new();
        debug!(worker = %worker_name, "Polling started");

        loop {
            while let Some(result) = jobs.try_join_next() {
                if let Err(e) = result {
                    error!(worker = %worker_name, error = %e, "Job task panicked");
                }
            }

            self.fill(&mut jobs).await;

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }

        debug!(worker = %worker_name, running = jobs.len(), "Polling stopped, waiting for running jobs");
        while let Some(result) = jobs.join_next().await {
            if let Err(e) = result {
                error!(worker = %worker_name, error = %e, "Job task panicked");
            }
        }
    }

    /// Lock and spawn jobs while permits are available.
    async fn fill(&self, jobs: &mut JoinSet<()>) {
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                trace!(worker = %self.config.worker_name, "All job slots busy");
                return;
            };

            let mut excluded_queues = self.config.excluded_queues.clone();
            excluded_queues.extend(self.slots.saturated(&self.config));

            let job = match self
                .manager
                .acquire_next(
                    &self.config.worker_name,
                    Vec::new(),
                    &excluded_queues,
                    &self.config.restricted_queues,
                )
                .await
            {
                Ok(Some(job)) => job,
                Ok(None) => return,
                Err(e) => {
                    error!(worker = %self.config.worker_name, error = %e, "Failed to acquire job");
                    return;
                }
            };

            self.slots.acquire(&job.queue);
            jobs.spawn(execute(
                self.manager.clone(),
                self.runner.clone(),
                self.slots.clone(),
                self.cancel.clone(),
                job,
                permit,
            ));
        }
    }
}

async fn execute(
    manager: Arc<JobManager>,
    runner: Arc<dyn JobRunner>,
    slots: Arc<QueueSlots>,
    cancel: CancellationToken,
    mut job: Job,
    _permit: OwnedSemaphorePermit,
) {
    let queue = job.queue.clone();

    if let Err(e) = manager.mark_running(&mut job).await {
        error!(job_id = %job.id, error = %e, "Failed to mark job running");
        if let Err(e) = manager.release_lock(&mut job).await {
            warn!(job_id = %job.id, error = %e, "Failed to release job lock");
        }
        slots.release(&queue);
        return;
    }
    debug!(job_id = %job.id, command = %job.command, "Running job");

    let snapshot = job.clone();
    let run = runner.run(&snapshot, cancel);
    tokio::pin!(run);

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;
    let result = loop {
        tokio::select! {
            result = &mut run => break result,
            _ = heartbeat.tick() => {
                if let Err(e) = manager.touch(&mut job).await {
                    warn!(job_id = %job.id, error = %e, "Heartbeat failed");
                }
            }
        }
    };

    let outcome = match result.and_then(ExecutionOutcome::validate) {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(job_id = %job.id, error = %e, "Runner failed");
            ExecutionOutcome::failed(e.to_string())
        }
    };

    if let Err(e) = manager.record_outcome(&mut job, outcome).await {
        error!(job_id = %job.id, error = %e, "Failed to record job outcome");
    }
    slots.release(&queue);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_slots_saturation() {
        let mut config = QueueConfig::default();
        config.queue_options.insert(
            "video".to_string(),
            crate::config::QueueOptions {
                max_concurrent_jobs: 1,
            },
        );
        let slots = QueueSlots::default();

        slots.acquire("mail");
        slots.acquire("mail");
        assert!(slots.saturated(&config).is_empty());

        slots.acquire("video");
        assert_eq!(slots.saturated(&config), vec!["video".to_string()]);

        slots.release("video");
        assert!(slots.saturated(&config).is_empty());
        slots.release("video");
    }
}
