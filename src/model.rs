//! Records the engine persists and passes around.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

pub type JobId = i64;
pub type PolicyId = i64;
pub type TargetId = i64;

/// Id reserved for the local registry, which is not stored as a target.
pub const LOCAL_TARGET_ID: TargetId = 0;

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(Error::Configuration(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RegistryType {
    DockerRegistry,
    Harbor,
    DockerHub,
    Gitlab,
    GithubGhcr,
    VolcengineCr,
}
string_enum!(RegistryType {
    DockerRegistry => "docker-registry",
    Harbor => "harbor",
    DockerHub => "docker-hub",
    Gitlab => "gitlab",
    GithubGhcr => "github-ghcr",
    VolcengineCr => "volcengine-cr",
});

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_key: String,
    pub access_secret: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_key", &self.access_key)
            .field("access_secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}
string_enum!(Health {
    Unknown => "unknown",
    Healthy => "healthy",
    Unhealthy => "unhealthy",
});

/// A remote registry endpoint together with the credential used to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    #[serde(default)]
    pub id: TargetId,
    pub name: String,
    #[serde(rename = "type")]
    pub registry_type: RegistryType,
    pub url: String,
    #[serde(default)]
    pub insecure: bool,
    #[serde(default)]
    pub credential: Option<Credential>,
    /// Vendor specific settings such as `api_url` or `region`.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default)]
    pub health: Health,
}

impl Target {
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(|e| e.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Manual,
    Scheduled,
    Event,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    Manual,
    Scheduled { cron: String },
    Event,
}

impl Default for Trigger {
    fn default() -> Self {
        Trigger::Manual
    }
}

impl Trigger {
    pub fn trigger_type(&self) -> TriggerType {
        match self {
            Trigger::Manual => TriggerType::Manual,
            Trigger::Scheduled { .. } => TriggerType::Scheduled,
            Trigger::Event => TriggerType::Event,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterType {
    Name,
    Tag,
    Label,
    Resource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Decoration {
    #[default]
    Matches,
    Excludes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    #[default]
    Image,
    Chart,
    Artifact,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Filter {
    Name {
        pattern: String,
    },
    Tag {
        pattern: String,
        #[serde(default)]
        decoration: Decoration,
    },
    Label {
        labels: Vec<String>,
        #[serde(default)]
        decoration: Decoration,
    },
    Resource {
        kind: ResourceType,
    },
}

impl Filter {
    pub fn filter_type(&self) -> FilterType {
        match self {
            Filter::Name { .. } => FilterType::Name,
            Filter::Tag { .. } => FilterType::Tag,
            Filter::Label { .. } => FilterType::Label,
            Filter::Resource { .. } => FilterType::Resource,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Local registry to the target.
    #[default]
    Push,
    /// Target to the local registry.
    Pull,
}
string_enum!(Direction {
    Push => "push",
    Pull => "pull",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default)]
    pub id: PolicyId,
    pub name: String,
    /// Project (namespace) in the local registry the policy belongs to.
    #[serde(default)]
    pub project: String,
    pub target_id: TargetId,
    #[serde(default)]
    pub direction: Direction,
    /// Replaces the namespace of every repository on the destination.
    #[serde(default)]
    pub dest_namespace: Option<String>,
    #[serde(default)]
    pub trigger: Trigger,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Overwrite destination tags that point at a different digest.
    #[serde(rename = "override", default = "default_true")]
    pub override_existing: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl Policy {
    pub fn name_pattern(&self) -> Option<&str> {
        self.filters.iter().find_map(|f| match f {
            Filter::Name { pattern } => Some(pattern.as_str()),
            _ => None,
        })
    }

    /// Source and destination target ids, `LOCAL_TARGET_ID` standing for the local registry.
    pub fn endpoints(&self) -> (TargetId, TargetId) {
        match self.direction {
            Direction::Push => (LOCAL_TARGET_ID, self.target_id),
            Direction::Pull => (self.target_id, LOCAL_TARGET_ID),
        }
    }

    /// Repository name on the destination for a source repository.
    pub fn destination_repository(&self, repository: &str) -> String {
        match &self.dest_namespace {
            None => repository.to_string(),
            Some(ns) => {
                let name = repository
                    .split_once('/')
                    .map(|(_, rest)| rest)
                    .unwrap_or(repository);
                format!("{}/{}", ns.trim_matches('/'), name)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Transfer,
    Delete,
}
string_enum!(Operation {
    Transfer => "transfer",
    Delete => "delete",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Check,
    PullManifest,
    TransferBlob,
    PushManifest,
    Delete,
    Finished,
    Stopped,
    Canceled,
    Error,
    Retrying,
}
string_enum!(JobStatus {
    Pending => "pending",
    Running => "running",
    Check => "check",
    PullManifest => "pull_manifest",
    TransferBlob => "transfer_blob",
    PushManifest => "push_manifest",
    Delete => "delete",
    Finished => "finished",
    Stopped => "stopped",
    Canceled => "canceled",
    Error => "error",
    Retrying => "retrying",
});

impl JobStatus {
    pub const TERMINAL: [JobStatus; 4] = [
        JobStatus::Finished,
        JobStatus::Stopped,
        JobStatus::Canceled,
        JobStatus::Error,
    ];

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }
}

/// Extra job inputs kept as a json blob next to the job row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct JobParameters {
    #[serde(default)]
    pub tags: Vec<String>,
    /// Defaults to the source repository name.
    #[serde(default)]
    pub dest_repository: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub policy_id: PolicyId,
    pub repository: String,
    pub operation: Operation,
    pub status: JobStatus,
    pub previous_status: Option<JobStatus>,
    pub desired_status: Option<JobStatus>,
    pub uuid: Uuid,
    pub parameters: JobParameters,
    pub retry_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn tags(&self) -> &[String] {
        &self.parameters.tags
    }

    pub fn dest_repository(&self) -> &str {
        self.parameters
            .dest_repository
            .as_deref()
            .unwrap_or(&self.repository)
    }
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub policy_id: PolicyId,
    pub repository: String,
    pub operation: Operation,
    pub parameters: JobParameters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}
string_enum!(LogLevel {
    Info => "info",
    Warn => "warn",
    Error => "error",
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLog {
    pub id: i64,
    pub job_id: JobId,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// One tag of a repository as seen by an adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub tag: String,
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub kind: ResourceType,
    #[serde(default)]
    pub is_accessory: bool,
}

impl Artifact {
    pub fn tagged(tag: impl Into<String>) -> Artifact {
        Artifact {
            tag: tag.into(),
            digest: None,
            media_type: None,
            labels: Vec::new(),
            kind: ResourceType::Image,
            is_accessory: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub repository: String,
    pub artifacts: Vec<Artifact>,
}

impl Resource {
    pub fn tags(&self) -> Vec<String> {
        self.artifacts.iter().map(|e| e.tag.clone()).collect()
    }
}
