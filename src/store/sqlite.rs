use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, QueryBuilder, Sqlite};
use uuid::Uuid;

use super::{Created, JobQuery, JobStore};
use crate::error::{Error, Result};
use crate::model::{
    Credential, Health, Job, JobId, JobLog, JobParameters, JobStatus, LogLevel, NewJob, Operation,
    Policy, PolicyId, Target, TargetId,
};

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| Error::Internal(format!("timestamp {} out of range", ms)))
}

fn parse_opt<T: FromStr<Err = Error>>(value: Option<String>) -> Result<Option<T>> {
    value.map(|v| v.parse()).transpose()
}

fn unique_violation(e: sqlx::Error, what: impl FnOnce() -> String) -> Error {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => Error::Conflict(what()),
        _ => e.into(),
    }
}

/// Tags a job must cover once `new` is folded into `existing`, or `None` when
/// `existing` already covers them. An empty delete list means every tag.
fn merge_tags(operation: Operation, existing: &[String], new: &[String]) -> Option<Vec<String>> {
    if operation == Operation::Delete && existing.is_empty() {
        return None;
    }
    if operation == Operation::Delete && new.is_empty() {
        return Some(Vec::new());
    }
    let missing: Vec<&String> = new.iter().filter(|t| !existing.contains(t)).collect();
    if missing.is_empty() {
        return None;
    }
    let mut merged = existing.to_vec();
    merged.extend(missing.into_iter().cloned());
    Some(merged)
}

#[derive(FromRow)]
struct JobRow {
    id: i64,
    policy_id: i64,
    repository: String,
    operation: String,
    status: String,
    previous_status: Option<String>,
    desired_status: Option<String>,
    uuid: String,
    parameters: String,
    retry_count: i64,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<JobRow> for Job {
    type Error = Error;

    fn try_from(row: JobRow) -> Result<Job> {
        Ok(Job {
            id: row.id,
            policy_id: row.policy_id,
            repository: row.repository,
            operation: row.operation.parse()?,
            status: row.status.parse()?,
            previous_status: parse_opt(row.previous_status)?,
            desired_status: parse_opt(row.desired_status)?,
            uuid: Uuid::parse_str(&row.uuid)
                .map_err(|e| Error::Internal(format!("job {} has a bad uuid: {}", row.id, e)))?,
            parameters: serde_json::from_str(&row.parameters)?,
            retry_count: row.retry_count,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
        })
    }
}

#[derive(FromRow)]
struct JobLogRow {
    id: i64,
    job_id: i64,
    level: String,
    message: String,
    ts: i64,
}

impl TryFrom<JobLogRow> for JobLog {
    type Error = Error;

    fn try_from(row: JobLogRow) -> Result<JobLog> {
        Ok(JobLog {
            id: row.id,
            job_id: row.job_id,
            level: row.level.parse()?,
            message: row.message,
            timestamp: from_millis(row.ts)?,
        })
    }
}

#[derive(FromRow)]
struct PolicyRow {
    id: i64,
    name: String,
    project: String,
    target_id: i64,
    direction: String,
    dest_namespace: Option<String>,
    trigger_spec: String,
    filters: String,
    enabled: bool,
    override_existing: bool,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<PolicyRow> for Policy {
    type Error = Error;

    fn try_from(row: PolicyRow) -> Result<Policy> {
        Ok(Policy {
            id: row.id,
            name: row.name,
            project: row.project,
            target_id: row.target_id,
            direction: row.direction.parse()?,
            dest_namespace: row.dest_namespace,
            trigger: serde_json::from_str(&row.trigger_spec)?,
            filters: serde_json::from_str(&row.filters)?,
            enabled: row.enabled,
            override_existing: row.override_existing,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
        })
    }
}

#[derive(FromRow)]
struct TargetRow {
    id: i64,
    name: String,
    registry_type: String,
    url: String,
    insecure: bool,
    access_key: Option<String>,
    access_secret: Option<String>,
    options: String,
    health: String,
}

impl TryFrom<TargetRow> for Target {
    type Error = Error;

    fn try_from(row: TargetRow) -> Result<Target> {
        let credential = match (row.access_key, row.access_secret) {
            (Some(access_key), Some(access_secret)) => Some(Credential {
                access_key,
                access_secret,
            }),
            _ => None,
        };
        let options: BTreeMap<String, String> = serde_json::from_str(&row.options)?;
        Ok(Target {
            id: row.id,
            name: row.name,
            registry_type: row.registry_type.parse()?,
            url: row.url,
            insecure: row.insecure,
            credential,
            options,
            health: row.health.parse()?,
        })
    }
}

/// [`JobStore`] on SQLite, migrated on connect.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens `url` (`sqlite://path.db` or `sqlite::memory:`), creating the
    /// database file when it is missing.
    pub async fn connect(url: &str) -> Result<SqliteStore> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        // Every connection to an in-memory database sees its own database.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(options).await?;

        tracing::debug!("running store migrations on {}", url);
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(SqliteStore { pool })
    }

    pub async fn in_memory() -> Result<SqliteStore> {
        SqliteStore::connect("sqlite::memory:").await
    }
}

#[async_trait::async_trait]
impl JobStore for SqliteStore {
    async fn create_job(&self, job: NewJob, retrigger_window: Duration) -> Result<Created> {
        let now = now_millis();
        let window = i64::try_from(retrigger_window.as_millis()).unwrap_or(i64::MAX);
        let mut tx = self.pool.begin().await?;

        if window > 0 {
            let existing: Option<(i64, String, String)> = sqlx::query_as(
                "SELECT id, status, parameters FROM jobs
                 WHERE policy_id = ? AND repository = ? AND operation = ? AND created_at > ?
                 ORDER BY id DESC LIMIT 1",
            )
            .bind(job.policy_id)
            .bind(&job.repository)
            .bind(job.operation.as_str())
            .bind(now.saturating_sub(window))
            .fetch_optional(&mut *tx)
            .await?;
            if let Some((id, status, parameters)) = existing {
                let status: JobStatus = status.parse()?;
                let mut parameters: JobParameters = serde_json::from_str(&parameters)?;
                let same_destination = parameters.dest_repository == job.parameters.dest_repository;
                match merge_tags(job.operation, &parameters.tags, &job.parameters.tags) {
                    _ if !same_destination => {}
                    None => {
                        tx.commit().await?;
                        return Ok(Created::Existing(id));
                    }
                    // Tags can still be added to a job nobody has picked up.
                    Some(tags) if status == JobStatus::Pending => {
                        parameters.tags = tags;
                        sqlx::query("UPDATE jobs SET parameters = ?, updated_at = ? WHERE id = ?")
                            .bind(serde_json::to_string(&parameters)?)
                            .bind(now)
                            .bind(id)
                            .execute(&mut *tx)
                            .await?;
                        tx.commit().await?;
                        tracing::debug!(job_id = id, "merged re-triggered tags into pending job");
                        return Ok(Created::Existing(id));
                    }
                    Some(_) => {}
                }
            }
        }

        // Keeps (policy_id, repository, created_at) unique for jobs created in the same millisecond.
        let (created_at,): (i64,) = sqlx::query_as(
            "SELECT MAX(?, COALESCE(MAX(created_at) + 1, 0)) FROM jobs
             WHERE policy_id = ? AND repository = ?",
        )
        .bind(now)
        .bind(job.policy_id)
        .bind(&job.repository)
        .fetch_one(&mut *tx)
        .await?;

        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO jobs
                (policy_id, repository, operation, status, uuid, parameters, retry_count, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?)
             RETURNING id",
        )
        .bind(job.policy_id)
        .bind(&job.repository)
        .bind(job.operation.as_str())
        .bind(JobStatus::Pending.as_str())
        .bind(Uuid::new_v4().to_string())
        .bind(serde_json::to_string(&job.parameters)?)
        .bind(created_at)
        .bind(created_at)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(Created::New(id))
    }

    async fn get_job(&self, id: JobId) -> Result<Job> {
        let row: Option<JobRow> = sqlx::query_as("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or_else(|| Error::NotFound(format!("job {}", id)))?
            .try_into()
    }

    async fn list_jobs(&self, query: &JobQuery) -> Result<Vec<Job>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM jobs WHERE 1 = 1");
        if let Some(policy_id) = query.policy_id {
            qb.push(" AND policy_id = ").push_bind(policy_id);
        }
        if let Some(status) = query.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        qb.push(" ORDER BY id DESC");
        if let Some(limit) = query.limit {
            qb.push(" LIMIT ").push_bind(limit);
        }
        let rows: Vec<JobRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(Job::try_from).collect()
    }

    async fn update_job_status(&self, id: JobId, status: JobStatus) -> Result<Job> {
        let row: Option<JobRow> = sqlx::query_as(
            "UPDATE jobs
             SET previous_status = status, status = ?, updated_at = MAX(updated_at + 1, ?)
             WHERE id = ? AND status NOT IN ('finished', 'stopped', 'canceled', 'error')
             RETURNING *",
        )
        .bind(status.as_str())
        .bind(now_millis())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => row.try_into(),
            None => {
                let current = self.get_job(id).await?;
                Err(Error::Conflict(format!(
                    "job {} is already {}, refusing to move it to {}",
                    id, current.status, status
                )))
            }
        }
    }

    async fn set_desired_status(&self, id: JobId, status: Option<JobStatus>) -> Result<()> {
        let done = sqlx::query("UPDATE jobs SET desired_status = ? WHERE id = ?")
            .bind(status.map(|s| s.as_str()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(Error::NotFound(format!("job {}", id)));
        }
        Ok(())
    }

    async fn increment_retry_count(&self, id: JobId) -> Result<i64> {
        let row: Option<(i64,)> = sqlx::query_as(
            "UPDATE jobs SET retry_count = retry_count + 1 WHERE id = ? RETURNING retry_count",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| r.0)
            .ok_or_else(|| Error::NotFound(format!("job {}", id)))
    }

    async fn reset_interrupted_jobs(&self) -> Result<Vec<JobId>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            "UPDATE jobs
             SET previous_status = status, status = 'pending', desired_status = NULL,
                 updated_at = MAX(updated_at + 1, ?)
             WHERE status NOT IN ('finished', 'stopped', 'canceled', 'error')
             RETURNING id",
        )
        .bind(now_millis())
        .fetch_all(&self.pool)
        .await?;
        let mut ids: Vec<JobId> = rows.into_iter().map(|r| r.0).collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn append_job_log(
        &self,
        id: JobId,
        level: LogLevel,
        message: &str,
        ts: DateTime<Utc>,
    ) -> Result<JobLog> {
        let row: JobLogRow = sqlx::query_as(
            "INSERT INTO job_logs (job_id, level, message, ts)
             VALUES (?1, ?2, ?3, MAX(?4, COALESCE((SELECT MAX(ts) FROM job_logs WHERE job_id = ?1), 0)))
             RETURNING id, job_id, level, message, ts",
        )
        .bind(id)
        .bind(level.as_str())
        .bind(message)
        .bind(ts.timestamp_millis())
        .fetch_one(&self.pool)
        .await?;
        row.try_into()
    }

    async fn job_logs(&self, id: JobId, after: i64) -> Result<Vec<JobLog>> {
        let rows: Vec<JobLogRow> = sqlx::query_as(
            "SELECT id, job_id, level, message, ts FROM job_logs
             WHERE job_id = ? AND id > ? ORDER BY id",
        )
        .bind(id)
        .bind(after)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(JobLog::try_from).collect()
    }

    async fn get_policy(&self, id: PolicyId) -> Result<Policy> {
        let row: Option<PolicyRow> = sqlx::query_as("SELECT * FROM policies WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or_else(|| Error::NotFound(format!("policy {}", id)))?
            .try_into()
    }

    async fn list_policies(&self) -> Result<Vec<Policy>> {
        let rows: Vec<PolicyRow> = sqlx::query_as("SELECT * FROM policies ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Policy::try_from).collect()
    }

    async fn save_policy(&self, policy: &Policy) -> Result<PolicyId> {
        let now = now_millis();
        let id = (policy.id != 0).then_some(policy.id);
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO policies
                (id, name, project, target_id, direction, dest_namespace, trigger_spec, filters,
                 enabled, override_existing, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (id) DO UPDATE SET
                name = excluded.name,
                project = excluded.project,
                target_id = excluded.target_id,
                direction = excluded.direction,
                dest_namespace = excluded.dest_namespace,
                trigger_spec = excluded.trigger_spec,
                filters = excluded.filters,
                enabled = excluded.enabled,
                override_existing = excluded.override_existing,
                updated_at = MAX(policies.updated_at + 1, excluded.updated_at)
             RETURNING id",
        )
        .bind(id)
        .bind(&policy.name)
        .bind(&policy.project)
        .bind(policy.target_id)
        .bind(policy.direction.as_str())
        .bind(&policy.dest_namespace)
        .bind(serde_json::to_string(&policy.trigger)?)
        .bind(serde_json::to_string(&policy.filters)?)
        .bind(policy.enabled)
        .bind(policy.override_existing)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| unique_violation(e, || format!("policy name '{}' is taken", policy.name)))?;
        Ok(id)
    }

    async fn set_policy_enabled(&self, id: PolicyId, enabled: bool) -> Result<()> {
        let done = sqlx::query(
            "UPDATE policies SET enabled = ?, updated_at = MAX(updated_at + 1, ?) WHERE id = ?",
        )
        .bind(enabled)
        .bind(now_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(Error::NotFound(format!("policy {}", id)));
        }
        Ok(())
    }

    async fn delete_policy(&self, id: PolicyId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let (running,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM jobs
             WHERE policy_id = ? AND status NOT IN ('finished', 'stopped', 'canceled', 'error')",
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        if running > 0 {
            return Err(Error::Conflict(format!(
                "policy {} still has {} unfinished jobs",
                id, running
            )));
        }
        let done = sqlx::query("DELETE FROM policies WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if done.rows_affected() == 0 {
            return Err(Error::NotFound(format!("policy {}", id)));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_target(&self, id: TargetId) -> Result<Target> {
        let row: Option<TargetRow> = sqlx::query_as("SELECT * FROM targets WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or_else(|| Error::NotFound(format!("target {}", id)))?
            .try_into()
    }

    async fn list_targets(&self) -> Result<Vec<Target>> {
        let rows: Vec<TargetRow> = sqlx::query_as("SELECT * FROM targets ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Target::try_from).collect()
    }

    async fn save_target(&self, target: &Target) -> Result<TargetId> {
        let now = now_millis();
        let id = (target.id != 0).then_some(target.id);
        let (access_key, access_secret) = match &target.credential {
            Some(c) => (Some(c.access_key.as_str()), Some(c.access_secret.as_str())),
            None => (None, None),
        };
        let (id,): (i64,) = sqlx::query_as(
            "INSERT INTO targets
                (id, name, registry_type, url, insecure, access_key, access_secret, options, health,
                 created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (id) DO UPDATE SET
                name = excluded.name,
                registry_type = excluded.registry_type,
                url = excluded.url,
                insecure = excluded.insecure,
                access_key = excluded.access_key,
                access_secret = excluded.access_secret,
                options = excluded.options,
                updated_at = MAX(targets.updated_at + 1, excluded.updated_at)
             RETURNING id",
        )
        .bind(id)
        .bind(&target.name)
        .bind(target.registry_type.as_str())
        .bind(&target.url)
        .bind(target.insecure)
        .bind(access_key)
        .bind(access_secret)
        .bind(serde_json::to_string(&target.options)?)
        .bind(target.health.as_str())
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| unique_violation(e, || format!("target name '{}' is taken", target.name)))?;
        Ok(id)
    }

    async fn set_target_health(&self, id: TargetId, health: Health) -> Result<()> {
        let done = sqlx::query("UPDATE targets SET health = ? WHERE id = ?")
            .bind(health.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(Error::NotFound(format!("target {}", id)));
        }
        Ok(())
    }

    async fn delete_target(&self, id: TargetId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let (used,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM policies WHERE target_id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        if used > 0 {
            return Err(Error::Conflict(format!(
                "target {} is used by {} policies",
                id, used
            )));
        }
        let done = sqlx::query("DELETE FROM targets WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if done.rows_affected() == 0 {
            return Err(Error::NotFound(format!("target {}", id)));
        }
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Direction, Filter, JobParameters, Operation, RegistryType, Trigger};

    fn new_job(repository: &str) -> NewJob {
        NewJob {
            policy_id: 1,
            repository: repository.to_string(),
            operation: Operation::Transfer,
            parameters: JobParameters {
                tags: vec!["v1".to_string()],
                dest_repository: None,
            },
        }
    }

    fn policy(name: &str) -> Policy {
        Policy {
            id: 0,
            name: name.to_string(),
            project: "library".to_string(),
            target_id: 1,
            direction: Direction::Push,
            dest_namespace: None,
            trigger: Trigger::Scheduled {
                cron: "*/5 * * * *".to_string(),
            },
            filters: vec![Filter::Name {
                pattern: "library/**".to_string(),
            }],
            enabled: true,
            override_existing: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_create_job_dedupes_within_window() {
        let store = SqliteStore::in_memory().await.unwrap();
        let window = Duration::from_secs(60);
        let first = store.create_job(new_job("library/alpine"), window).await.unwrap();
        assert!(first.is_new());
        let again = store.create_job(new_job("library/alpine"), window).await.unwrap();
        assert_eq!(again, Created::Existing(first.id()));
        let other = store.create_job(new_job("library/busybox"), window).await.unwrap();
        assert!(other.is_new());

        // No window: a second job in the same millisecond still gets its own row.
        let a = store.create_job(new_job("team/app"), Duration::ZERO).await.unwrap();
        let b = store.create_job(new_job("team/app"), Duration::ZERO).await.unwrap();
        assert_ne!(a.id(), b.id());
        let (a, b) = (store.get_job(a.id()).await.unwrap(), store.get_job(b.id()).await.unwrap());
        assert!(b.created_at > a.created_at);
        assert_eq!(b.status, JobStatus::Pending);
        assert_eq!(b.tags(), &["v1".to_string()]);
    }

    #[tokio::test]
    async fn test_retrigger_merges_tags_into_pending_job() {
        let store = SqliteStore::in_memory().await.unwrap();
        let window = Duration::from_secs(60);
        let with_tags = |tags: &[&str]| NewJob {
            parameters: JobParameters {
                tags: tags.iter().map(|t| t.to_string()).collect(),
                dest_repository: None,
            },
            ..new_job("library/alpine")
        };

        let first = store.create_job(with_tags(&["v1"]), window).await.unwrap();
        let again = store.create_job(with_tags(&["v2", "v1"]), window).await.unwrap();
        assert_eq!(again, Created::Existing(first.id()));
        let job = store.get_job(first.id()).await.unwrap();
        assert_eq!(job.tags(), &["v1".to_string(), "v2".to_string()]);

        // Once running, covered tags are still absorbed but new ones get a job.
        store.update_job_status(first.id(), JobStatus::Running).await.unwrap();
        let covered = store.create_job(with_tags(&["v2"]), window).await.unwrap();
        assert_eq!(covered, Created::Existing(first.id()));
        let later = store.create_job(with_tags(&["v3"]), window).await.unwrap();
        assert!(later.is_new());
        assert_eq!(store.get_job(later.id()).await.unwrap().tags(), &["v3".to_string()]);
    }

    #[test]
    fn test_merge_tags() {
        let tags = |t: &[&str]| t.iter().map(|e| e.to_string()).collect::<Vec<_>>();
        assert_eq!(merge_tags(Operation::Transfer, &tags(&["a"]), &tags(&["a"])), None);
        assert_eq!(
            merge_tags(Operation::Transfer, &tags(&["a"]), &tags(&["b", "a"])),
            Some(tags(&["a", "b"]))
        );
        assert_eq!(merge_tags(Operation::Delete, &[], &tags(&["a"])), None);
        assert_eq!(merge_tags(Operation::Delete, &tags(&["a"]), &[]), Some(Vec::new()));
        assert_eq!(merge_tags(Operation::Transfer, &tags(&["a"]), &[]), None);
    }

    #[tokio::test]
    async fn test_terminal_status_is_final() {
        let store = SqliteStore::in_memory().await.unwrap();
        let id = store
            .create_job(new_job("library/alpine"), Duration::ZERO)
            .await
            .unwrap()
            .id();
        let running = store.update_job_status(id, JobStatus::Running).await.unwrap();
        let stopped = store.update_job_status(id, JobStatus::Stopped).await.unwrap();
        assert_eq!(stopped.previous_status, Some(JobStatus::Running));
        assert!(stopped.updated_at > running.updated_at);

        let r = store.update_job_status(id, JobStatus::Running).await;
        assert!(matches!(r, Err(Error::Conflict(_))));
        assert_eq!(store.get_job(id).await.unwrap().status, JobStatus::Stopped);

        let r = store.update_job_status(999, JobStatus::Running).await;
        assert!(matches!(r, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_log_timestamps_never_go_backwards() {
        let store = SqliteStore::in_memory().await.unwrap();
        let id = store
            .create_job(new_job("library/alpine"), Duration::ZERO)
            .await
            .unwrap()
            .id();
        let now = Utc::now();
        store
            .append_job_log(id, LogLevel::Info, "first", now)
            .await
            .unwrap();
        let second = store
            .append_job_log(id, LogLevel::Warn, "second", now - chrono::Duration::seconds(5))
            .await
            .unwrap();
        assert_eq!(second.timestamp.timestamp_millis(), now.timestamp_millis());

        let logs = store.job_logs(id, 0).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[1].level, LogLevel::Warn);
        assert!(store.job_logs(id, logs[1].id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reset_interrupted_jobs() {
        let store = SqliteStore::in_memory().await.unwrap();
        let a = store.create_job(new_job("a/a"), Duration::ZERO).await.unwrap().id();
        let b = store.create_job(new_job("b/b"), Duration::ZERO).await.unwrap().id();
        store.update_job_status(a, JobStatus::TransferBlob).await.unwrap();
        store.set_desired_status(a, Some(JobStatus::Stopped)).await.unwrap();
        store.update_job_status(b, JobStatus::Finished).await.unwrap();

        assert_eq!(store.reset_interrupted_jobs().await.unwrap(), vec![a]);
        let job = store.get_job(a).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.desired_status, None);
        assert_eq!(store.increment_retry_count(a).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_policy_lifecycle() {
        let store = SqliteStore::in_memory().await.unwrap();
        let id = store.save_policy(&policy("nightly")).await.unwrap();
        let mut stored = store.get_policy(id).await.unwrap();
        assert_eq!(stored.trigger, policy("nightly").trigger);
        assert!(!stored.override_existing);

        stored.dest_namespace = Some("mirror".to_string());
        assert_eq!(store.save_policy(&stored).await.unwrap(), id);
        assert_eq!(
            store.get_policy(id).await.unwrap().dest_namespace.as_deref(),
            Some("mirror")
        );
        assert!(matches!(
            store.save_policy(&policy("nightly")).await,
            Err(Error::Conflict(_))
        ));

        let job = NewJob {
            policy_id: id,
            ..new_job("library/alpine")
        };
        let job_id = store.create_job(job, Duration::ZERO).await.unwrap().id();
        assert!(matches!(store.delete_policy(id).await, Err(Error::Conflict(_))));
        store.update_job_status(job_id, JobStatus::Finished).await.unwrap();
        store.delete_policy(id).await.unwrap();
        assert!(store.get_policy(id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_target_round_trip() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut target = Target {
            id: 0,
            name: "hub".to_string(),
            registry_type: RegistryType::DockerHub,
            url: "https://registry-1.docker.io".to_string(),
            insecure: false,
            credential: Some(Credential {
                access_key: "user".to_string(),
                access_secret: "secret".to_string(),
            }),
            options: [("api_url".to_string(), "https://hub.docker.com".to_string())]
                .into_iter()
                .collect(),
            health: Health::Unknown,
        };
        target.id = store.save_target(&target).await.unwrap();
        store.set_target_health(target.id, Health::Healthy).await.unwrap();
        let stored = store.get_target(target.id).await.unwrap();
        assert_eq!(stored.health, Health::Healthy);
        assert_eq!(stored.credential, target.credential);
        assert_eq!(stored.option("api_url"), Some("https://hub.docker.com"));

        let mut p = policy("to-hub");
        p.target_id = target.id;
        store.save_policy(&p).await.unwrap();
        assert!(matches!(
            store.delete_target(target.id).await,
            Err(Error::Conflict(_))
        ));
    }
}
