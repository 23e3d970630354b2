//! Running one replication job: the state graph, its handlers and the job log.

pub mod actions;
pub mod handlers;
pub mod logger;
pub mod state_machine;

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use crate::adapter::AdapterRegistry;
use crate::error::{Error, Result};
use crate::model::{Job, JobId, JobStatus, Operation, Target, TargetId, LOCAL_TARGET_ID};
use crate::store::JobStore;

pub use actions::ActionsTaken;
pub use handlers::{PendingManifest, ReplicationContext};
pub use logger::{job_log_path, JobLogger};
pub use state_machine::{DesiredState, Handler, StateMachine, Transition, FORCED_STATES};

/// Pending → Running → Check → PullManifest ⇄ TransferBlob → PushManifest,
/// PullManifest → Finished once no tags are left.
pub fn transfer_machine(
    job_id: JobId,
    current: JobStatus,
    store: Arc<dyn JobStore>,
    logger: JobLogger,
    desired: DesiredState,
) -> StateMachine<ReplicationContext> {
    StateMachine::new(job_id, current, store, logger, desired)
        .with_transition(JobStatus::Pending, JobStatus::Running)
        .with_transition(JobStatus::Retrying, JobStatus::Running)
        .with_transition(JobStatus::Running, JobStatus::Check)
        .with_transition(JobStatus::Check, JobStatus::PullManifest)
        .with_transition(JobStatus::PullManifest, JobStatus::TransferBlob)
        .with_transition(JobStatus::PullManifest, JobStatus::Finished)
        .with_transition(JobStatus::TransferBlob, JobStatus::PushManifest)
        .with_transition(JobStatus::PushManifest, JobStatus::PullManifest)
        .with_handler(JobStatus::Running, handlers::Start)
        .with_handler(JobStatus::Check, handlers::Check)
        .with_handler(JobStatus::PullManifest, handlers::PullManifest)
        .with_handler(JobStatus::TransferBlob, handlers::TransferBlob)
        .with_handler(JobStatus::PushManifest, handlers::PushManifest)
}

/// Pending → Running → Delete → Finished.
pub fn delete_machine(
    job_id: JobId,
    current: JobStatus,
    store: Arc<dyn JobStore>,
    logger: JobLogger,
    desired: DesiredState,
) -> StateMachine<ReplicationContext> {
    StateMachine::new(job_id, current, store, logger, desired)
        .with_transition(JobStatus::Pending, JobStatus::Running)
        .with_transition(JobStatus::Retrying, JobStatus::Running)
        .with_transition(JobStatus::Running, JobStatus::Delete)
        .with_transition(JobStatus::Delete, JobStatus::Finished)
        .with_handler(JobStatus::Running, handlers::Start)
        .with_handler(JobStatus::Delete, handlers::Delete)
}

/// Runs a job until it halts, returning the status it halted in.
#[async_trait::async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job_id: JobId, desired: DesiredState) -> Result<JobStatus>;
}

/// Loads the job, its policy and both targets, then drives the state machine.
pub struct Runner {
    store: Arc<dyn JobStore>,
    adapters: Arc<AdapterRegistry>,
    local_target: Target,
    log_dir: Option<PathBuf>,
    retry_limit: i64,
}

impl Runner {
    pub fn new(
        store: Arc<dyn JobStore>,
        adapters: Arc<AdapterRegistry>,
        local_target: Target,
    ) -> Runner {
        Runner {
            store,
            adapters,
            local_target,
            log_dir: None,
            retry_limit: 0,
        }
    }

    pub fn with_log_dir(mut self, log_dir: Option<PathBuf>) -> Runner {
        self.log_dir = log_dir;
        self
    }

    pub fn with_retry_limit(mut self, retry_limit: i64) -> Runner {
        self.retry_limit = retry_limit;
        self
    }

    async fn target(&self, id: TargetId) -> Result<Target> {
        if id == LOCAL_TARGET_ID {
            return Ok(self.local_target.clone());
        }
        self.store.get_target(id).await.map_err(|e| {
            if e.is_not_found() {
                Error::Configuration(format!("target {} does not exist", id))
            } else {
                e
            }
        })
    }

    /// `None` when the policy behind the job is disabled.
    async fn context(
        &self,
        job: &Job,
        logger: JobLogger,
        desired: DesiredState,
    ) -> Result<Option<ReplicationContext>> {
        let policy = self.store.get_policy(job.policy_id).await.map_err(|e| {
            if e.is_not_found() {
                Error::Configuration(format!("policy {} does not exist", job.policy_id))
            } else {
                e
            }
        })?;
        if !policy.enabled {
            return Ok(None);
        }

        let (source_id, destination_id) = policy.endpoints();
        let source = self.adapters.create(&self.target(source_id).await?)?;
        let destination = self.adapters.create(&self.target(destination_id).await?)?;

        Ok(Some(ReplicationContext {
            operation: job.operation,
            source,
            destination,
            source_repository: job.repository.clone(),
            dest_repository: job.dest_repository().to_string(),
            tags: job.tags().iter().cloned().collect::<VecDeque<_>>(),
            override_existing: policy.override_existing,
            manifest: None,
            blobs: Vec::new(),
            blobs_existence: HashMap::new(),
            actions: ActionsTaken::default(),
            logger,
            desired,
        }))
    }

    /// Moves a job that never got to run straight to `status`.
    async fn settle(&self, job_id: JobId, status: JobStatus) -> Result<JobStatus> {
        match self.store.update_job_status(job_id, status).await {
            Ok(job) => Ok(job.status),
            Err(Error::Conflict(_)) => Ok(self.store.get_job(job_id).await?.status),
            Err(e) => Err(e),
        }
    }
}

#[async_trait::async_trait]
impl JobRunner for Runner {
    async fn run(&self, job_id: JobId, desired: DesiredState) -> Result<JobStatus> {
        let job = self.store.get_job(job_id).await?;
        if job.status.is_terminal() {
            return Ok(job.status);
        }
        let logger = JobLogger::open(job_id, self.store.clone(), self.log_dir.as_deref()).await;

        let mut ctx = match self.context(&job, logger.clone(), desired.clone()).await {
            Ok(Some(ctx)) => ctx,
            Ok(None) => {
                logger
                    .info(format!("policy {} is disabled, canceling", job.policy_id))
                    .await;
                return self.settle(job_id, JobStatus::Canceled).await;
            }
            Err(e) => {
                logger.error(format!("[{}] {}", e.kind(), e)).await;
                return self.settle(job_id, JobStatus::Error).await;
            }
        };

        let build = match job.operation {
            Operation::Transfer => transfer_machine,
            Operation::Delete => delete_machine,
        };
        let mut machine = build(job_id, job.status, self.store.clone(), logger, desired)
            .with_retry(job.retry_count < self.retry_limit);
        machine.start(JobStatus::Running, &mut ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::AdapterContext;
    use crate::model::{JobParameters, NewJob, Policy, RegistryType};
    use crate::store::SqliteStore;
    use std::time::Duration;

    fn local() -> Target {
        Target {
            id: LOCAL_TARGET_ID,
            name: "local".to_string(),
            registry_type: RegistryType::DockerRegistry,
            url: "http://127.0.0.1:1".to_string(),
            insecure: true,
            credential: None,
            options: Default::default(),
            health: Default::default(),
        }
    }

    async fn setup(policy: serde_json::Value) -> (Arc<dyn JobStore>, Runner, JobId) {
        let store: Arc<dyn JobStore> = Arc::new(SqliteStore::in_memory().await.unwrap());
        let mut target = local();
        target.id = 0;
        target.name = "remote".to_string();
        let target_id = store.save_target(&target).await.unwrap();
        let mut policy: Policy = serde_json::from_value(policy).unwrap();
        policy.target_id = target_id;
        let policy_id = store.save_policy(&policy).await.unwrap();
        let job_id = store
            .create_job(
                NewJob {
                    policy_id,
                    repository: "library/alpine".to_string(),
                    operation: Operation::Transfer,
                    parameters: JobParameters::default(),
                },
                Duration::ZERO,
            )
            .await
            .unwrap()
            .id();
        let adapters = Arc::new(AdapterRegistry::with_defaults(AdapterContext::default()));
        let runner = Runner::new(store.clone(), adapters, local());
        (store, runner, job_id)
    }

    #[tokio::test]
    async fn test_graphs() {
        let store: Arc<dyn JobStore> = Arc::new(SqliteStore::in_memory().await.unwrap());
        let logger = JobLogger::open(1, store.clone(), None).await;
        let m = transfer_machine(
            1,
            JobStatus::Pending,
            store.clone(),
            logger.clone(),
            DesiredState::default(),
        );
        assert_eq!(
            m.successors(JobStatus::PullManifest),
            &[JobStatus::TransferBlob, JobStatus::Finished]
        );
        assert!(m.is_valid(JobStatus::TransferBlob, JobStatus::Stopped));
        assert!(m.is_valid(JobStatus::Retrying, JobStatus::Running));
        assert!(!m.is_valid(JobStatus::Check, JobStatus::PushManifest));

        let d = delete_machine(1, JobStatus::Pending, store, logger, DesiredState::default());
        assert_eq!(d.successors(JobStatus::Running), &[JobStatus::Delete]);
        assert!(!d.is_valid(JobStatus::Running, JobStatus::Check));
    }

    #[tokio::test]
    async fn test_disabled_policy_cancels() {
        let (store, runner, id) =
            setup(serde_json::json!({"name": "p", "target_id": 0, "enabled": false})).await;
        let status = runner.run(id, DesiredState::default()).await.unwrap();
        assert_eq!(status, JobStatus::Canceled);
        assert_eq!(store.get_job(id).await.unwrap().status, JobStatus::Canceled);
    }

    #[tokio::test]
    async fn test_empty_tags_finish_without_touching_registries() {
        // Both endpoints point at a closed port, any registry call would fail the job.
        let (store, runner, id) = setup(serde_json::json!({"name": "p", "target_id": 0})).await;
        let status = runner.run(id, DesiredState::default()).await.unwrap();
        assert_eq!(status, JobStatus::Finished);
        let job = store.get_job(id).await.unwrap();
        assert_eq!(job.previous_status, Some(JobStatus::PullManifest));
    }

    #[tokio::test]
    async fn test_missing_policy_is_a_configuration_error() {
        let (store, runner, _) = setup(serde_json::json!({"name": "p", "target_id": 0})).await;
        let id = store
            .create_job(
                NewJob {
                    policy_id: 42,
                    repository: "library/busybox".to_string(),
                    operation: Operation::Delete,
                    parameters: JobParameters::default(),
                },
                Duration::ZERO,
            )
            .await
            .unwrap()
            .id();
        let status = runner.run(id, DesiredState::default()).await.unwrap();
        assert_eq!(status, JobStatus::Error);
        let logs = store.job_logs(id, 0).await.unwrap();
        assert!(logs.last().unwrap().message.starts_with("[ConfigurationError]"));
    }
}
