//! Persistence consumed by the engine: jobs, their logs, policies and targets.

mod sqlite;

pub use sqlite::SqliteStore;

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{
    Health, Job, JobId, JobLog, JobStatus, LogLevel, NewJob, Policy, PolicyId, Target, TargetId,
};

/// Outcome of [`JobStore::create_job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Created {
    New(JobId),
    /// The same job was created within the re-trigger window.
    Existing(JobId),
}

impl Created {
    pub fn id(&self) -> JobId {
        match self {
            Created::New(id) | Created::Existing(id) => *id,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Created::New(_))
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobQuery {
    pub policy_id: Option<PolicyId>,
    pub status: Option<JobStatus>,
    pub limit: Option<i64>,
}

#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    /// Creates a pending job unless one for the same policy, repository and
    /// operation was created less than `retrigger_window` ago.
    async fn create_job(&self, job: NewJob, retrigger_window: Duration) -> Result<Created>;

    async fn get_job(&self, id: JobId) -> Result<Job>;

    /// Newest first.
    async fn list_jobs(&self, query: &JobQuery) -> Result<Vec<Job>>;

    /// Moves a job to `status`. Jobs already in a terminal status are left
    /// alone and the call fails with `Conflict`.
    async fn update_job_status(&self, id: JobId, status: JobStatus) -> Result<Job>;

    /// Records a stop or cancel request for a job owned by a running engine.
    async fn set_desired_status(&self, id: JobId, status: Option<JobStatus>) -> Result<()>;

    /// Returns the new retry count.
    async fn increment_retry_count(&self, id: JobId) -> Result<i64>;

    /// Puts every job left in a non terminal status back to `Pending` and
    /// returns their ids, oldest first.
    async fn reset_interrupted_jobs(&self) -> Result<Vec<JobId>>;

    /// The stored timestamp never goes backwards within a job.
    async fn append_job_log(
        &self,
        id: JobId,
        level: LogLevel,
        message: &str,
        ts: DateTime<Utc>,
    ) -> Result<JobLog>;

    /// Log lines with an id greater than `after`.
    async fn job_logs(&self, id: JobId, after: i64) -> Result<Vec<JobLog>>;

    async fn get_policy(&self, id: PolicyId) -> Result<Policy>;

    async fn list_policies(&self) -> Result<Vec<Policy>>;

    /// Inserts the policy, or replaces the stored one when `policy.id` is set.
    async fn save_policy(&self, policy: &Policy) -> Result<PolicyId>;

    async fn set_policy_enabled(&self, id: PolicyId, enabled: bool) -> Result<()>;

    /// Fails with `Conflict` while the policy has unfinished jobs.
    async fn delete_policy(&self, id: PolicyId) -> Result<()>;

    async fn get_target(&self, id: TargetId) -> Result<Target>;

    async fn list_targets(&self) -> Result<Vec<Target>>;

    async fn save_target(&self, target: &Target) -> Result<TargetId>;

    async fn set_target_health(&self, id: TargetId, health: Health) -> Result<()>;

    /// Fails with `Conflict` while a policy refers to the target.
    async fn delete_target(&self, id: TargetId) -> Result<()>;
}
