//! Engine settings: a JSON file with defaults for every field, overridable from
//! the environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{Credential, Policy, RegistryType, Target, Trigger, LOCAL_TARGET_ID};
use crate::scheduler::parse_cron;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub max_job_workers: usize,
    pub local_registry_url: String,
    pub local_registry_credential: Option<Credential>,
    pub local_registry_insecure: bool,
    pub job_log_dir: Option<PathBuf>,
    /// Public address of the token service, rewritten to `token_url` when the
    /// engine runs next to it.
    pub ext_endpoint: Option<String>,
    pub token_url: Option<String>,
    pub database_url: String,
    pub request_timeout_secs: u64,
    pub retrigger_window_ms: u64,
    pub job_retry_limit: i64,
    /// Upserted into the store at start, matched by id.
    pub registries: Vec<Target>,
    pub policies: Vec<Policy>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            max_job_workers: 10,
            local_registry_url: "http://registry:5000".to_string(),
            local_registry_credential: None,
            local_registry_insecure: false,
            job_log_dir: None,
            ext_endpoint: None,
            token_url: None,
            database_url: "sqlite://replication.db".to_string(),
            request_timeout_secs: 60,
            retrigger_window_ms: 1000,
            job_retry_limit: 0,
            registries: Vec::new(),
            policies: Vec::new(),
        }
    }
}

/// Environment overrides, flattened into each binary's command line.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct EnvOverrides {
    #[clap(long, env = "MAX_JOB_WORKERS")]
    pub max_job_workers: Option<usize>,

    #[clap(long, env = "LOCAL_REGISTRY_URL")]
    pub local_registry_url: Option<String>,

    #[clap(long, env = "JOB_LOG_DIR")]
    pub job_log_dir: Option<PathBuf>,

    #[clap(long, env = "EXT_ENDPOINT")]
    pub ext_endpoint: Option<String>,

    #[clap(long, env = "TOKEN_URL")]
    pub token_url: Option<String>,

    #[clap(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,
}

impl Settings {
    pub fn parse_file(f: impl AsRef<Path>) -> Result<Settings> {
        use std::fs::File;
        use std::io::BufReader;

        let file = File::open(f.as_ref())?;
        let reader = BufReader::new(file);
        let settings: Settings = serde_json::from_reader(reader)?;
        Ok(settings)
    }

    /// File settings when a path is given, defaults otherwise, then the overrides.
    pub fn load(path: Option<&Path>, overrides: &EnvOverrides) -> Result<Settings> {
        let mut settings = match path {
            Some(p) => Settings::parse_file(p)?,
            None => Settings::default(),
        };
        settings.apply(overrides);
        settings.validate()?;
        Ok(settings)
    }

    pub fn apply(&mut self, overrides: &EnvOverrides) {
        if let Some(v) = overrides.max_job_workers {
            self.max_job_workers = v;
        }
        if let Some(v) = &overrides.local_registry_url {
            self.local_registry_url = v.clone();
        }
        if let Some(v) = &overrides.job_log_dir {
            self.job_log_dir = Some(v.clone());
        }
        if let Some(v) = &overrides.ext_endpoint {
            self.ext_endpoint = Some(v.clone());
        }
        if let Some(v) = &overrides.token_url {
            self.token_url = Some(v.clone());
        }
        if let Some(v) = &overrides.database_url {
            self.database_url = v.clone();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_job_workers < 1 {
            return Err(Error::Configuration(
                "max_job_workers must be at least 1".to_string(),
            ));
        }
        check_url("local_registry_url", &self.local_registry_url)?;
        if let Some(u) = &self.ext_endpoint {
            check_url("ext_endpoint", u)?;
        }
        if let Some(u) = &self.token_url {
            check_url("token_url", u)?;
        }
        if self.ext_endpoint.is_some() != self.token_url.is_some() {
            return Err(Error::Configuration(
                "ext_endpoint and token_url must be set together".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::Configuration(
                "request_timeout_secs must be positive".to_string(),
            ));
        }

        let mut ids = Vec::new();
        for r in self.registries.iter() {
            if r.id == LOCAL_TARGET_ID {
                return Err(Error::Configuration(format!(
                    "registry '{}' needs an id other than {}",
                    r.name, LOCAL_TARGET_ID
                )));
            }
            if ids.contains(&r.id) {
                return Err(Error::Configuration(format!("duplicate registry id {}", r.id)));
            }
            ids.push(r.id);
            check_url(&r.name, &r.url)?;
        }
        for p in self.policies.iter() {
            if p.id == 0 {
                return Err(Error::Configuration(format!(
                    "policy '{}' needs an explicit id",
                    p.name
                )));
            }
            if let Trigger::Scheduled { cron } = &p.trigger {
                parse_cron(cron)?;
            }
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retrigger_window(&self) -> Duration {
        Duration::from_millis(self.retrigger_window_ms)
    }

    /// The local registry as a target, with the reserved id.
    pub fn local_target(&self) -> Target {
        Target {
            id: LOCAL_TARGET_ID,
            name: "local".to_string(),
            registry_type: RegistryType::DockerRegistry,
            url: self.local_registry_url.clone(),
            insecure: self.local_registry_insecure,
            credential: self.local_registry_credential.clone(),
            options: Default::default(),
            health: Default::default(),
        }
    }
}

fn check_url(field: &str, url: &str) -> Result<()> {
    let uri: http::Uri = url
        .parse()
        .map_err(|e| Error::Configuration(format!("{}: invalid url '{}': {}", field, url, e)))?;
    match uri.scheme_str() {
        Some("http") | Some("https") if uri.authority().is_some() => Ok(()),
        _ => Err(Error::Configuration(format!(
            "{}: '{}' is not an absolute http(s) url",
            field, url
        ))),
    }
}
