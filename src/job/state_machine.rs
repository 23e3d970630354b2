use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::model::{JobId, JobStatus};
use crate::store::JobStore;

use super::logger::JobLogger;

/// What a handler wants to happen after its state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    To(JobStatus),
    /// Take the only successor of the current state.
    Continue,
}

/// Stop, cancel or error requested from outside the worker running the job.
/// Read at state boundaries only.
#[derive(Debug, Clone, Default)]
pub struct DesiredState(Arc<Mutex<Option<JobStatus>>>);

impl DesiredState {
    pub fn set(&self, status: JobStatus) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = Some(status);
    }

    pub fn peek(&self) -> Option<JobStatus> {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn take(&self) -> Option<JobStatus> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

#[async_trait::async_trait]
pub trait Handler<C: Send>: Send + Sync {
    async fn enter(&self, ctx: &mut C) -> Result<Transition>;

    async fn exit(&self, _ctx: &mut C) -> Result<()> {
        Ok(())
    }
}

/// States reachable from anywhere.
pub const FORCED_STATES: [JobStatus; 4] = [
    JobStatus::Error,
    JobStatus::Stopped,
    JobStatus::Canceled,
    JobStatus::Retrying,
];

/// The machine hands control back once it reaches one of these.
fn halts(status: JobStatus) -> bool {
    status.is_terminal() || status == JobStatus::Retrying
}

pub struct StateMachine<C: Send> {
    job_id: JobId,
    store: Arc<dyn JobStore>,
    logger: JobLogger,
    desired: DesiredState,
    handlers: HashMap<JobStatus, Box<dyn Handler<C>>>,
    transitions: HashMap<JobStatus, Vec<JobStatus>>,
    current: JobStatus,
    can_retry: bool,
}

impl<C: Send> StateMachine<C> {
    pub fn new(
        job_id: JobId,
        current: JobStatus,
        store: Arc<dyn JobStore>,
        logger: JobLogger,
        desired: DesiredState,
    ) -> StateMachine<C> {
        StateMachine {
            job_id,
            store,
            logger,
            desired,
            handlers: HashMap::new(),
            transitions: HashMap::new(),
            current,
            can_retry: false,
        }
    }

    pub fn with_handler(mut self, state: JobStatus, handler: impl Handler<C> + 'static) -> Self {
        self.handlers.insert(state, Box::new(handler));
        self
    }

    pub fn with_transition(mut self, from: JobStatus, to: JobStatus) -> Self {
        let successors = self.transitions.entry(from).or_default();
        if !successors.contains(&to) {
            successors.push(to);
        }
        self
    }

    /// Retryable handler failures move the job to `Retrying` instead of `Error`.
    pub fn with_retry(mut self, can_retry: bool) -> Self {
        self.can_retry = can_retry;
        self
    }

    pub fn current(&self) -> JobStatus {
        self.current
    }

    pub fn successors(&self, state: JobStatus) -> &[JobStatus] {
        self.transitions
            .get(&state)
            .map(|e| e.as_slice())
            .unwrap_or_default()
    }

    pub fn is_valid(&self, from: JobStatus, to: JobStatus) -> bool {
        FORCED_STATES.contains(&to) || self.successors(from).contains(&to)
    }

    /// A pending stop, cancel or error request, from this process or recorded in the store.
    async fn desired_now(&self) -> Option<JobStatus> {
        if let Some(s) = self.desired.take() {
            return Some(s);
        }
        match self.store.get_job(self.job_id).await {
            Ok(job) => job.desired_status.filter(|s| FORCED_STATES.contains(s)),
            Err(e) => {
                tracing::warn!(job_id = self.job_id, "unable to read desired status: {}", e);
                None
            }
        }
    }

    async fn on_failure(&self, e: Error) -> JobStatus {
        if self.can_retry && e.is_retryable() {
            self.logger
                .warn(format!("[{}] {}, the job will be retried", e.kind(), e))
                .await;
            JobStatus::Retrying
        } else {
            self.logger.error(format!("[{}] {}", e.kind(), e)).await;
            JobStatus::Error
        }
    }

    async fn next_state(&self, ctx: &mut C) -> JobStatus {
        let handler = match self.handlers.get(&self.current) {
            Some(h) => h,
            None => {
                return self
                    .on_failure(Error::Internal(format!("no handler for state {}", self.current)))
                    .await
            }
        };
        match handler.enter(ctx).await {
            Ok(Transition::To(next)) => next,
            Ok(Transition::Continue) => match self.successors(self.current) {
                [only] => *only,
                other => {
                    self.on_failure(Error::Internal(format!(
                        "continue from {} is ambiguous, it has {} successors",
                        self.current,
                        other.len()
                    )))
                    .await
                }
            },
            Err(e) => self.on_failure(e).await,
        }
    }

    /// Persists the move to `next`. Returns the status the job actually ended up in,
    /// which differs from `next` when somebody else already finished the job.
    async fn persist(&mut self, next: JobStatus) -> Result<JobStatus> {
        match self.store.update_job_status(self.job_id, next).await {
            Ok(job) => {
                tracing::debug!(job_id = self.job_id, "{} -> {}", self.current, job.status);
                self.current = job.status;
            }
            Err(Error::Conflict(m)) => {
                tracing::debug!(job_id = self.job_id, "{}", m);
                self.current = self.store.get_job(self.job_id).await?.status;
            }
            Err(e) => return Err(e),
        }
        Ok(self.current)
    }

    /// Moves to `first`, then runs handlers until the job reaches a terminal
    /// status or `Retrying`. Returns that status.
    pub async fn start(&mut self, first: JobStatus, ctx: &mut C) -> Result<JobStatus> {
        let first = self.desired_now().await.unwrap_or(first);
        if !self.is_valid(self.current, first) {
            return Err(Error::Internal(format!(
                "job {} cannot start from {}",
                self.job_id, self.current
            )));
        }
        self.persist(first).await?;

        while !halts(self.current) {
            let next = match self.desired_now().await {
                Some(d) => d,
                None => {
                    let next = self.next_state(ctx).await;
                    // A request that came in while the handler ran wins.
                    self.desired_now().await.unwrap_or(next)
                }
            };

            if let Some(handler) = self.handlers.get(&self.current) {
                if let Err(e) = handler.exit(ctx).await {
                    tracing::warn!(job_id = self.job_id, "exit of {} failed: {}", self.current, e);
                }
            }

            let next = if self.is_valid(self.current, next) {
                next
            } else {
                self.on_failure(Error::Internal(format!(
                    "invalid transition {} -> {}",
                    self.current, next
                )))
                .await
            };
            self.persist(next).await?;
        }
        Ok(self.current)
    }
}
