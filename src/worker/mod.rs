//! Bounded pool of workers fed from a FIFO job queue.
//!
//! Idle workers publish a handle into the pool channel, the dispatcher pairs the
//! next queued job with the next idle worker. A full pool simply leaves jobs in
//! the queue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::job::{DesiredState, JobRunner};
use crate::model::{JobId, JobStatus};
use crate::registry::http::RetryPolicy;
use crate::store::JobStore;

pub const QUEUE_CAPACITY: usize = 1024;

struct WorkerHandle {
    id: usize,
    intake: mpsc::Sender<JobId>,
}

struct Shared {
    runner: Arc<dyn JobRunner>,
    store: Arc<dyn JobStore>,
    queue: mpsc::Sender<JobId>,
    running: Mutex<HashMap<JobId, DesiredState>>,
    retry_backoff: RetryPolicy,
    quit: CancellationToken,
}

impl Shared {
    fn running(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, DesiredState>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn run_one(self: &Arc<Self>, worker: usize, job_id: JobId) {
        let desired = DesiredState::default();
        self.running().insert(job_id, desired.clone());
        // Shutdown cancels before it collects the running jobs, so a job
        // registered after that collection sees the cancellation here.
        if self.quit.is_cancelled() {
            desired.set(JobStatus::Stopped);
        }
        tracing::debug!(worker, job_id, "picked up job");

        let result = self.runner.run(job_id, desired).await;
        self.running().remove(&job_id);

        match result {
            Ok(JobStatus::Retrying) => self.schedule_retry(job_id).await,
            Ok(status) => tracing::info!(worker, job_id, "job ended as {}", status),
            Err(e) => {
                tracing::error!(worker, job_id, "job failed to run: {}", e);
                if let Err(e) = self.store.update_job_status(job_id, JobStatus::Error).await {
                    tracing::debug!(job_id, "unable to mark job as failed: {}", e);
                }
            }
        }
    }

    async fn schedule_retry(self: &Arc<Self>, job_id: JobId) {
        let attempt = match self.store.increment_retry_count(job_id).await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(job_id, "unable to record retry: {}", e);
                return;
            }
        };
        let delay = self
            .retry_backoff
            .backoff(usize::try_from(attempt.saturating_sub(1)).unwrap_or(0));
        tracing::info!(job_id, attempt, "retrying job in {:?}", delay);

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = shared.quit.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if shared.queue.send(job_id).await.is_err() {
                        tracing::debug!(job_id, "queue closed before retry");
                    }
                }
            }
        });
    }
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    size: usize,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn start(
        size: usize,
        runner: Arc<dyn JobRunner>,
        store: Arc<dyn JobStore>,
    ) -> Result<WorkerPool> {
        WorkerPool::start_with_backoff(size, runner, store, RetryPolicy::default())
    }

    /// Like [`WorkerPool::start`], with the delay before a `Retrying` job is queued again
    /// taken from `retry_backoff`.
    pub fn start_with_backoff(
        size: usize,
        runner: Arc<dyn JobRunner>,
        store: Arc<dyn JobStore>,
        retry_backoff: RetryPolicy,
    ) -> Result<WorkerPool> {
        if size == 0 {
            return Err(Error::Configuration(
                "the worker pool needs at least one worker".to_string(),
            ));
        }
        let (queue_tx, queue_rx) = mpsc::channel::<JobId>(QUEUE_CAPACITY);
        let (idle_tx, idle_rx) = mpsc::channel::<WorkerHandle>(size);
        let shared = Arc::new(Shared {
            runner,
            store,
            queue: queue_tx,
            running: Mutex::new(HashMap::new()),
            retry_backoff,
            quit: CancellationToken::new(),
        });

        let mut tasks = Vec::with_capacity(size + 1);
        for id in 0..size {
            tasks.push(tokio::spawn(worker_loop(
                id,
                Arc::clone(&shared),
                idle_tx.clone(),
            )));
        }
        tasks.push(tokio::spawn(dispatch_loop(
            queue_rx,
            idle_rx,
            shared.quit.clone(),
        )));

        Ok(WorkerPool {
            shared,
            size,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub async fn submit(&self, job_id: JobId) -> Result<()> {
        self.shared
            .queue
            .send(job_id)
            .await
            .map_err(|_| Error::Internal("the worker pool is shut down".to_string()))
    }

    pub fn is_running(&self, job_id: JobId) -> bool {
        self.shared.running().contains_key(&job_id)
    }

    /// Routes a stop, cancel or error request. A running job picks it up at its next
    /// state boundary, a queued job is moved to `status` right away.
    pub async fn stop_job(&self, job_id: JobId, status: JobStatus) -> Result<()> {
        let desired = self.shared.running().get(&job_id).cloned();
        match desired {
            Some(desired) => {
                desired.set(status);
                self.shared.store.set_desired_status(job_id, Some(status)).await
            }
            None => request_stop(self.shared.store.as_ref(), job_id, status).await,
        }
    }

    /// Asks running jobs to stop, then waits for every worker to return.
    pub async fn shutdown(&self) {
        self.shared.quit.cancel();
        let running: Vec<(JobId, DesiredState)> = self
            .shared
            .running()
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        for (job_id, desired) in running {
            tracing::info!(job_id, "stopping job for shutdown");
            desired.set(JobStatus::Stopped);
        }

        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for t in tasks {
            if let Err(e) = t.await {
                tracing::warn!("worker task ended abnormally: {}", e);
            }
        }
    }
}

/// Stop request for a job no worker of this process is running. Pending and
/// retrying jobs are settled immediately, anything else is left to whoever runs it.
pub async fn request_stop(store: &dyn JobStore, job_id: JobId, status: JobStatus) -> Result<()> {
    let job = store.get_job(job_id).await?;
    if job.status.is_terminal() {
        return Ok(());
    }
    if matches!(job.status, JobStatus::Pending | JobStatus::Retrying) {
        match store.update_job_status(job_id, status).await {
            Ok(_) | Err(Error::Conflict(_)) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
    store.set_desired_status(job_id, Some(status)).await
}

async fn worker_loop(id: usize, shared: Arc<Shared>, idle: mpsc::Sender<WorkerHandle>) {
    let (intake_tx, mut intake_rx) = mpsc::channel::<JobId>(1);
    loop {
        let handle = WorkerHandle {
            id,
            intake: intake_tx.clone(),
        };
        if idle.send(handle).await.is_err() {
            break;
        }
        let job_id = tokio::select! {
            _ = shared.quit.cancelled() => break,
            job = intake_rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        shared.run_one(id, job_id).await;
    }
    tracing::debug!(worker = id, "worker exited");
}

async fn dispatch_loop(
    mut queue: mpsc::Receiver<JobId>,
    mut idle: mpsc::Receiver<WorkerHandle>,
    quit: CancellationToken,
) {
    loop {
        let job_id = tokio::select! {
            _ = quit.cancelled() => break,
            job = queue.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        let worker = tokio::select! {
            _ = quit.cancelled() => break,
            worker = idle.recv() => match worker {
                Some(worker) => worker,
                None => break,
            },
        };
        tracing::trace!(worker = worker.id, job_id, "dispatching");
        if worker.intake.send(job_id).await.is_err() {
            tracing::warn!(job_id, "worker {} went away before taking the job", worker.id);
        }
    }
}
