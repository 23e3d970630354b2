use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use console::style;
use futures::StreamExt;
use tracing_subscriber::EnvFilter;

use registry_replication::config::{EnvOverrides, Settings};
use registry_replication::engine::{self, Engine};
use registry_replication::model::{Job, JobStatus, Operation};
use registry_replication::store::{JobQuery, JobStore, SqliteStore};

#[derive(Parser, Debug)]
#[clap(name = "replication app")]
struct Opt {
    /// JSON settings file, defaults apply when omitted.
    #[clap(long)]
    config: Option<PathBuf>,

    #[clap(flatten)]
    overrides: EnvOverrides,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the worker pool and the cron scheduler until interrupted.
    Serve,
    /// Run a policy now and wait for its jobs.
    Trigger {
        #[clap(long)]
        policy: i64,
        #[clap(long = "repository")]
        repositories: Vec<String>,
        #[clap(long, default_value_t = 3600)]
        timeout_secs: u64,
    },
    /// Queue one job for one repository and wait for it.
    Enqueue {
        #[clap(long)]
        policy: i64,
        #[clap(long)]
        repository: String,
        #[clap(long, default_value = "transfer")]
        operation: String,
        #[clap(long = "tag")]
        tags: Vec<String>,
        #[clap(long, default_value_t = 3600)]
        timeout_secs: u64,
    },
    /// Ask a job to stop, or cancel it with --cancel.
    Stop {
        #[clap(long)]
        job: i64,
        #[clap(long)]
        cancel: bool,
    },
    Jobs {
        #[clap(long)]
        policy: Option<i64>,
        #[clap(long)]
        status: Option<String>,
        #[clap(long, default_value_t = 50)]
        limit: i64,
    },
    Logs {
        #[clap(long)]
        job: i64,
        #[clap(long)]
        follow: bool,
    },
}

fn styled_status(status: JobStatus) -> String {
    match status {
        JobStatus::Finished => style(status).green().to_string(),
        JobStatus::Error => style(status).red().bold().to_string(),
        JobStatus::Stopped | JobStatus::Canceled => style(status).yellow().to_string(),
        other => style(other).cyan().to_string(),
    }
}

fn print_job(job: &Job) {
    let tags = job.tags().join(",");
    println!(
        "{:>6}  {:<16} {:<9} {} -> {}  [{}]  {}",
        job.id,
        styled_status(job.status),
        job.operation,
        job.repository,
        job.dest_repository(),
        tags,
        job.updated_at.format("%Y-%m-%d %H:%M:%S")
    );
}

async fn wait_all(engine: &Engine, ids: &[i64], timeout: Duration) -> Result<(), anyhow::Error> {
    let mut failed = 0;
    for id in ids {
        let job = engine
            .wait_for_job(*id, timeout)
            .await
            .with_context(|| format!("Waiting for job {}", id))?;
        if job.status != JobStatus::Finished {
            failed += 1;
        }
        print_job(&job);
    }
    println!(
        "{} jobs, {} finished, {} did not",
        ids.len(),
        style(ids.len() - failed).green(),
        style(failed).red()
    );
    if failed > 0 {
        bail!("{} jobs did not finish", failed);
    }
    Ok(())
}

async fn open_store(settings: &Settings) -> Result<Arc<dyn JobStore>, anyhow::Error> {
    let store = SqliteStore::connect(&settings.database_url)
        .await
        .with_context(|| format!("Opening job store at {}", settings.database_url))?;
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let opt = Opt::parse();
    if let Some(path) = &opt.config {
        if !path.exists() {
            bail!("Path for config passed in does not exist: {:#?}", path);
        }
    }
    let settings = Settings::load(opt.config.as_deref(), &opt.overrides)
        .with_context(|| format!("Loading settings from {:?}", opt.config))?;

    match opt.command {
        Command::Serve => {
            let engine = Engine::start(settings).await?;
            engine.spawn_cron();
            tracing::info!(
                "serving with {} workers, ctrl-c to stop",
                engine.settings().max_job_workers
            );
            tokio::signal::ctrl_c().await?;
            tracing::info!("shutting down");
            engine.shutdown().await;
        }
        Command::Trigger {
            policy,
            repositories,
            timeout_secs,
        } => {
            let engine = Engine::start(settings).await?;
            let ids = engine.trigger(policy, &repositories).await?;
            println!("policy {} started {} jobs", policy, ids.len());
            let result = wait_all(&engine, &ids, Duration::from_secs(timeout_secs)).await;
            engine.shutdown().await;
            result?;
        }
        Command::Enqueue {
            policy,
            repository,
            operation,
            tags,
            timeout_secs,
        } => {
            let operation: Operation = operation.parse()?;
            let engine = Engine::start(settings).await?;
            let id = engine.enqueue(policy, &repository, operation, tags).await?;
            println!("queued job {}", id);
            let result = wait_all(&engine, &[id], Duration::from_secs(timeout_secs)).await;
            engine.shutdown().await;
            result?;
        }
        Command::Stop { job, cancel } => {
            let store = open_store(&settings).await?;
            let status = if cancel {
                JobStatus::Canceled
            } else {
                JobStatus::Stopped
            };
            engine::stop_job(store.as_ref(), job, status).await?;
            println!("requested {} for job {}", status, job);
        }
        Command::Jobs {
            policy,
            status,
            limit,
        } => {
            let store = open_store(&settings).await?;
            let status = status.map(|s| s.parse::<JobStatus>()).transpose()?;
            let jobs = store
                .list_jobs(&JobQuery {
                    policy_id: policy,
                    status,
                    limit: Some(limit),
                })
                .await?;
            for job in jobs.iter() {
                print_job(job);
            }
        }
        Command::Logs { job, follow } => {
            let store = open_store(&settings).await?;
            let mut lines = engine::follow_job_log(store, job, follow);
            while let Some(line) = lines.next().await {
                let line = line?;
                println!(
                    "{} [{}] {}",
                    line.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
                    line.level.as_str().to_uppercase(),
                    line.message
                );
            }
        }
    }

    Ok(())
}
