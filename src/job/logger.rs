use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::model::{JobId, LogLevel};
use crate::store::JobStore;

pub fn job_log_path(dir: &Path, job_id: JobId) -> PathBuf {
    dir.join(format!("job_{}.log", job_id))
}

/// Writes the log of one job to the store, to `<dir>/job_<id>.log` when a log
/// directory is configured, and to `tracing`.
///
/// Failing to record a line never fails the job, it is only reported.
#[derive(Clone)]
pub struct JobLogger {
    job_id: JobId,
    store: Arc<dyn JobStore>,
    file: Option<Arc<Mutex<File>>>,
}

impl JobLogger {
    pub async fn open(job_id: JobId, store: Arc<dyn JobStore>, dir: Option<&Path>) -> JobLogger {
        let file = match dir {
            None => None,
            Some(dir) => match open_append(dir, job_id).await {
                Ok(f) => Some(Arc::new(Mutex::new(f))),
                Err(e) => {
                    tracing::warn!(job_id, "unable to open job log file in {:?}: {}", dir, e);
                    None
                }
            },
        };
        JobLogger {
            job_id,
            store,
            file,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub async fn info(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Info, message.as_ref()).await
    }

    pub async fn warn(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Warn, message.as_ref()).await
    }

    pub async fn error(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Error, message.as_ref()).await
    }

    pub async fn log(&self, level: LogLevel, message: &str) {
        let job_id = self.job_id;
        match level {
            LogLevel::Info => tracing::info!(job_id, "{}", message),
            LogLevel::Warn => tracing::warn!(job_id, "{}", message),
            LogLevel::Error => tracing::error!(job_id, "{}", message),
        }

        let now = Utc::now();
        if let Err(e) = self.store.append_job_log(job_id, level, message, now).await {
            tracing::warn!(job_id, "failed to store job log line: {}", e);
        }

        if let Some(file) = &self.file {
            let line = format!(
                "{} [{}] {}\n",
                now.to_rfc3339_opts(SecondsFormat::Millis, true),
                level.as_str().to_uppercase(),
                message
            );
            let mut file = file.lock().await;
            let written = async {
                file.write_all(line.as_bytes()).await?;
                file.flush().await
            }
            .await;
            if let Err(e) = written {
                tracing::warn!(job_id, "failed to write job log file: {}", e);
            }
        }
    }
}

async fn open_append(dir: &Path, job_id: JobId) -> std::io::Result<File> {
    tokio::fs::create_dir_all(dir).await?;
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(job_log_path(dir, job_id))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobParameters, NewJob, Operation};
    use crate::store::SqliteStore;
    use std::time::Duration;

    #[tokio::test]
    async fn test_lines_reach_store_and_file() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
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
        let dir = tempfile::tempdir().unwrap();
        let logger = JobLogger::open(id, store.clone(), Some(dir.path())).await;
        logger.info("blob pushed sha256:aa").await;
        logger.error("[RegistryError] boom").await;

        let logs = store.job_logs(id, 0).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[1].level, LogLevel::Error);

        let content = std::fs::read_to_string(job_log_path(dir.path(), id)).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("[INFO] blob pushed sha256:aa"));
        assert!(lines[1].ends_with("[ERROR] [RegistryError] boom"));
    }
}
