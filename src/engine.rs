//! Control surface of the replication engine.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::adapter::{AdapterContext, AdapterRegistry};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::job::Runner;
use crate::model::{
    Health, Job, JobId, JobLog, JobStatus, Operation, Policy, PolicyId, Target, TargetId,
    LOCAL_TARGET_ID,
};
use crate::registry::auth::TokenUrlRewrite;
use crate::registry::http::{RetryPolicy, Transport};
use crate::scheduler::{due_policies, next_tick, Scheduler};
use crate::store::{Created, JobQuery, JobStore, SqliteStore};
use crate::worker::{request_stop, WorkerPool};

const JOB_POLL_INTERVAL: Duration = Duration::from_millis(100);
const LOG_FOLLOW_INTERVAL: Duration = Duration::from_millis(500);
/// Longest the cron loop sleeps before looking at the policies again.
const CRON_RELOAD_INTERVAL: Duration = Duration::from_secs(60);

/// Adapter context shared by every adapter of one engine.
pub fn adapter_context(settings: &Settings) -> AdapterContext {
    let token_rewrite = match (&settings.ext_endpoint, &settings.token_url) {
        (Some(public), Some(internal)) => Some(TokenUrlRewrite {
            public_prefix: public.clone(),
            internal_prefix: internal.clone(),
        }),
        _ => None,
    };
    AdapterContext {
        transport: Transport::new(),
        retry_policy: RetryPolicy {
            deadline: settings.request_timeout(),
            ..RetryPolicy::default()
        },
        token_rewrite,
    }
}

pub struct Engine {
    settings: Settings,
    store: Arc<dyn JobStore>,
    adapters: Arc<AdapterRegistry>,
    scheduler: Arc<Scheduler>,
    pool: Arc<WorkerPool>,
    quit: CancellationToken,
    cron: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Opens the store named by the settings and starts the workers.
    pub async fn start(settings: Settings) -> Result<Engine> {
        settings.validate()?;
        let store = SqliteStore::connect(&settings.database_url).await?;
        Engine::with_store(settings, Arc::new(store)).await
    }

    pub async fn with_store(settings: Settings, store: Arc<dyn JobStore>) -> Result<Engine> {
        let adapters = AdapterRegistry::with_defaults(adapter_context(&settings));
        Engine::with_adapters(settings, store, adapters).await
    }

    /// Seeds the store from the settings, starts the pool and queues again the
    /// jobs a previous process left unfinished.
    pub async fn with_adapters(
        settings: Settings,
        store: Arc<dyn JobStore>,
        adapters: AdapterRegistry,
    ) -> Result<Engine> {
        settings.validate()?;
        for target in settings.registries.iter() {
            store.save_target(target).await?;
        }
        for policy in settings.policies.iter() {
            store.save_policy(policy).await?;
        }

        let adapters = Arc::new(adapters);
        let local_target = settings.local_target();
        let runner = Runner::new(store.clone(), adapters.clone(), local_target.clone())
            .with_log_dir(settings.job_log_dir.clone())
            .with_retry_limit(settings.job_retry_limit);
        let pool = WorkerPool::start(settings.max_job_workers, Arc::new(runner), store.clone())?;
        let scheduler = Scheduler::new(
            store.clone(),
            adapters.clone(),
            local_target,
            settings.retrigger_window(),
        );

        let engine = Engine {
            settings,
            store,
            adapters,
            scheduler: Arc::new(scheduler),
            pool: Arc::new(pool),
            quit: CancellationToken::new(),
            cron: Mutex::new(None),
        };

        let interrupted = engine.store.reset_interrupted_jobs().await?;
        if !interrupted.is_empty() {
            tracing::info!("re-queueing {} interrupted jobs", interrupted.len());
        }
        for id in interrupted {
            engine.pool.submit(id).await?;
        }
        Ok(engine)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    /// Event trigger: one job for one repository of a policy.
    pub async fn enqueue(
        &self,
        policy_id: PolicyId,
        repository: &str,
        operation: Operation,
        tags: Vec<String>,
    ) -> Result<JobId> {
        let created = self
            .scheduler
            .event(policy_id, repository, operation, tags)
            .await?;
        if created.is_new() {
            self.pool.submit(created.id()).await?;
        } else {
            tracing::debug!(job_id = created.id(), "job was just created, not queueing again");
        }
        Ok(created.id())
    }

    /// Manual trigger: one job per repository, every matching repository when none are given.
    pub async fn trigger(&self, policy_id: PolicyId, repositories: &[String]) -> Result<Vec<JobId>> {
        submit_all(
            &self.pool,
            self.scheduler.trigger(policy_id, repositories).await?,
        )
        .await
    }

    pub async fn stop(&self, job_id: JobId) -> Result<()> {
        self.pool.stop_job(job_id, JobStatus::Stopped).await
    }

    pub async fn cancel(&self, job_id: JobId) -> Result<()> {
        self.pool.stop_job(job_id, JobStatus::Canceled).await
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Job> {
        self.store.get_job(job_id).await
    }

    pub async fn list_jobs(&self, query: &JobQuery) -> Result<Vec<Job>> {
        self.store.list_jobs(query).await
    }

    pub fn job_log(&self, job_id: JobId, follow: bool) -> BoxStream<'static, Result<JobLog>> {
        follow_job_log(self.store.clone(), job_id, follow)
    }

    /// Polls until the job reaches a terminal status.
    pub async fn wait_for_job(&self, job_id: JobId, timeout: Duration) -> Result<Job> {
        wait_for_job(self.store.as_ref(), job_id, timeout).await
    }

    /// Validates and stores a policy, returning its id.
    pub async fn save_policy(&self, policy: &Policy) -> Result<PolicyId> {
        self.scheduler.validate(policy).await?;
        self.store.save_policy(policy).await
    }

    pub async fn set_policy_enabled(&self, policy_id: PolicyId, enabled: bool) -> Result<()> {
        self.store.set_policy_enabled(policy_id, enabled).await
    }

    pub async fn delete_policy(&self, policy_id: PolicyId) -> Result<()> {
        self.store.delete_policy(policy_id).await
    }

    pub async fn target(&self, target_id: TargetId) -> Result<Target> {
        if target_id == LOCAL_TARGET_ID {
            return Ok(self.settings.local_target());
        }
        self.store.get_target(target_id).await
    }

    /// Pings a target and records the result.
    pub async fn health_check(&self, target_id: TargetId) -> Result<Health> {
        let target = self.target(target_id).await?;
        let health = self.adapters.create(&target)?.health_check().await;
        if target_id != LOCAL_TARGET_ID {
            self.store.set_target_health(target_id, health).await?;
        }
        Ok(health)
    }

    /// Starts expanding scheduled policies on their cron ticks. Policies are
    /// reloaded on every wake up, ticks missed while the engine was down are skipped.
    pub fn spawn_cron(&self) {
        let store = self.store.clone();
        let scheduler = self.scheduler.clone();
        let pool = self.pool.clone();
        let quit = self.quit.clone();

        let task = tokio::spawn(async move {
            let mut last = Utc::now();
            loop {
                let policies = match store.list_policies().await {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!("unable to load policies: {}", e);
                        Vec::new()
                    }
                };
                let mut wait = CRON_RELOAD_INTERVAL;
                if let Some(next) = next_tick(&policies, last) {
                    if let Ok(until_next) = (next - Utc::now()).to_std() {
                        wait = wait.min(until_next);
                    } else {
                        wait = Duration::ZERO;
                    }
                }
                tokio::select! {
                    _ = quit.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }

                let now = Utc::now();
                for (tick, policy_id) in due_policies(&policies, last, now) {
                    tracing::info!(policy = policy_id, "scheduled trigger for {}", tick);
                    let created = match scheduler.trigger(policy_id, &[]).await {
                        Ok(created) => created,
                        Err(e) => {
                            tracing::error!(policy = policy_id, "scheduled trigger failed: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = submit_all(&pool, created).await {
                        tracing::error!(policy = policy_id, "unable to queue jobs: {}", e);
                    }
                }
                last = now;
            }
        });

        let mut guard = self.cron.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = guard.replace(task) {
            old.abort();
        }
    }

    /// Stops the cron loop, asks running jobs to stop and waits for the workers.
    pub async fn shutdown(&self) {
        self.quit.cancel();
        let cron = self
            .cron
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = cron {
            if let Err(e) = task.await {
                tracing::warn!("cron task ended abnormally: {}", e);
            }
        }
        self.pool.shutdown().await;
    }
}

async fn submit_all(pool: &WorkerPool, created: Vec<Created>) -> Result<Vec<JobId>> {
    let mut ids = Vec::with_capacity(created.len());
    for c in created {
        if c.is_new() {
            pool.submit(c.id()).await?;
        }
        ids.push(c.id());
    }
    Ok(ids)
}

/// Stop request from outside the engine process, see [`request_stop`].
pub async fn stop_job(store: &dyn JobStore, job_id: JobId, status: JobStatus) -> Result<()> {
    if !crate::job::FORCED_STATES.contains(&status) || status == JobStatus::Retrying {
        return Err(Error::Configuration(format!(
            "{} cannot be requested for a job",
            status
        )));
    }
    request_stop(store, job_id, status).await
}

pub async fn wait_for_job(store: &dyn JobStore, job_id: JobId, timeout: Duration) -> Result<Job> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let job = store.get_job(job_id).await?;
        if job.status.is_terminal() {
            return Ok(job);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::Timeout(timeout));
        }
        tokio::time::sleep(JOB_POLL_INTERVAL).await;
    }
}

/// Log lines of a job in order. With `follow` the stream keeps polling until
/// the job is terminal and every line has been read.
pub fn follow_job_log(
    store: Arc<dyn JobStore>,
    job_id: JobId,
    follow: bool,
) -> BoxStream<'static, Result<JobLog>> {
    async_stream::try_stream! {
        let mut after = 0;
        loop {
            // Read the status first so lines written before it turned terminal are not missed.
            let done = !follow || store.get_job(job_id).await?.status.is_terminal();
            for line in store.job_logs(job_id, after).await? {
                after = line.id;
                yield line;
            }
            if done {
                break;
            }
            tokio::time::sleep(LOG_FOLLOW_INTERVAL).await;
        }
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobParameters, LogLevel, NewJob};
    use futures::TryStreamExt;

    #[test]
    fn test_adapter_context_from_settings() {
        let settings = Settings {
            ext_endpoint: Some("https://harbor.example.com".to_string()),
            token_url: Some("http://core:8080".to_string()),
            request_timeout_secs: 5,
            ..Settings::default()
        };
        let ctx = adapter_context(&settings);
        assert_eq!(ctx.deadline(), Duration::from_secs(5));
        let rewrite = ctx.token_rewrite.unwrap();
        assert_eq!(
            rewrite.apply("https://harbor.example.com/service/token"),
            "http://core:8080/service/token"
        );
    }

    #[tokio::test]
    async fn test_follow_job_log_ends_with_the_job() {
        let store: Arc<dyn JobStore> = Arc::new(SqliteStore::in_memory().await.unwrap());
        let id = store
            .create_job(
                NewJob {
                    policy_id: 1,
                    repository: "library/alpine".to_string(),
                    operation: Operation::Transfer,
                    parameters: JobParameters::default(),
                },
                Duration::ZERO,
            )
            .await
            .unwrap()
            .id();
        store
            .append_job_log(id, LogLevel::Info, "first", Utc::now())
            .await
            .unwrap();

        let writer = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            writer
                .append_job_log(id, LogLevel::Info, "second", Utc::now())
                .await
                .unwrap();
            writer.update_job_status(id, JobStatus::Finished).await.unwrap();
        });

        let lines: Vec<JobLog> = follow_job_log(store.clone(), id, true)
            .try_collect()
            .await
            .unwrap();
        let messages: Vec<&str> = lines.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second"]);

        let once: Vec<JobLog> = follow_job_log(store, id, false).try_collect().await.unwrap();
        assert_eq!(once.len(), 2);
    }

    #[tokio::test]
    async fn test_stop_job_settles_pending_jobs() {
        let store: Arc<dyn JobStore> = Arc::new(SqliteStore::in_memory().await.unwrap());
        let id = store
            .create_job(
                NewJob {
                    policy_id: 1,
                    repository: "library/alpine".to_string(),
                    operation: Operation::Transfer,
                    parameters: JobParameters::default(),
                },
                Duration::ZERO,
            )
            .await
            .unwrap()
            .id();
        assert!(stop_job(store.as_ref(), id, JobStatus::Finished).await.is_err());
        stop_job(store.as_ref(), id, JobStatus::Canceled).await.unwrap();
        let job = wait_for_job(store.as_ref(), id, Duration::from_secs(1)).await.unwrap();
        assert_eq!(job.status, JobStatus::Canceled);
    }
}
