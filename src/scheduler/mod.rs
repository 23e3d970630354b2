//! Turns policies into jobs: manual and event triggers on request, scheduled
//! triggers from cron expressions.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::adapter::{Adapter, AdapterRegistry};
use crate::error::{Error, Result};
use crate::model::{
    Filter, JobParameters, NewJob, Operation, Policy, PolicyId, Resource, Target, TargetId,
    Trigger, LOCAL_TARGET_ID,
};
use crate::store::{Created, JobStore};

/// Parses a cron expression. Five field expressions get a leading seconds field.
pub fn parse_cron(expression: &str) -> Result<Schedule> {
    let expression = expression.trim();
    let normalized = if expression.split_whitespace().count() == 5 {
        format!("0 {}", expression)
    } else {
        expression.to_string()
    };
    Schedule::from_str(&normalized)
        .map_err(|e| Error::Configuration(format!("invalid cron '{}': {}", expression, e)))
}

fn schedule_of(policy: &Policy) -> Option<Schedule> {
    if !policy.enabled {
        return None;
    }
    match &policy.trigger {
        Trigger::Scheduled { cron } => match parse_cron(cron) {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::warn!(policy = policy.id, "{}", e);
                None
            }
        },
        _ => None,
    }
}

/// Earliest tick of any enabled scheduled policy strictly after `after`.
pub fn next_tick(policies: &[Policy], after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    policies
        .iter()
        .filter_map(schedule_of)
        .filter_map(|s| s.after(&after).next())
        .min()
}

/// Every tick of every enabled scheduled policy in `(after, until]`, oldest
/// first. A policy that missed several ticks shows up once per tick.
pub fn due_policies(
    policies: &[Policy],
    after: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Vec<(DateTime<Utc>, PolicyId)> {
    let mut due: Vec<(DateTime<Utc>, PolicyId)> = policies
        .iter()
        .filter_map(|p| schedule_of(p).map(|s| (p.id, s)))
        .flat_map(|(id, s)| {
            s.after(&after)
                .take_while(|t| *t <= until)
                .map(|t| (t, id))
                .collect::<Vec<_>>()
        })
        .collect();
    due.sort();
    due
}

/// The policy's filters with the name filter replaced by a literal repository.
fn filters_for_repository(filters: &[Filter], repository: &str) -> Vec<Filter> {
    let mut out: Vec<Filter> = filters
        .iter()
        .filter(|f| !matches!(f, Filter::Name { .. }))
        .cloned()
        .collect();
    out.push(Filter::Name {
        pattern: repository.to_string(),
    });
    out
}

fn new_job(policy: &Policy, operation: Operation, repository: &str, tags: Vec<String>) -> NewJob {
    let dest = policy.destination_repository(repository);
    NewJob {
        policy_id: policy.id,
        repository: repository.to_string(),
        operation,
        parameters: JobParameters {
            tags,
            dest_repository: if dest == repository { None } else { Some(dest) },
        },
    }
}

pub struct Scheduler {
    store: Arc<dyn JobStore>,
    adapters: Arc<AdapterRegistry>,
    local_target: Target,
    retrigger_window: Duration,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        adapters: Arc<AdapterRegistry>,
        local_target: Target,
        retrigger_window: Duration,
    ) -> Scheduler {
        Scheduler {
            store,
            adapters,
            local_target,
            retrigger_window,
        }
    }

    async fn target(&self, id: TargetId) -> Result<Target> {
        if id == LOCAL_TARGET_ID {
            return Ok(self.local_target.clone());
        }
        self.store.get_target(id).await
    }

    pub async fn endpoints(&self, policy: &Policy) -> Result<(Arc<dyn Adapter>, Arc<dyn Adapter>)> {
        let (source, destination) = policy.endpoints();
        let source = self.adapters.create(&self.target(source).await?)?;
        let destination = self.adapters.create(&self.target(destination).await?)?;
        Ok((source, destination))
    }

    /// Rejects policies the remote adapter cannot serve.
    pub async fn validate(&self, policy: &Policy) -> Result<()> {
        let target = self.target(policy.target_id).await.map_err(|e| {
            if e.is_not_found() {
                Error::Configuration(format!("target {} does not exist", policy.target_id))
            } else {
                e
            }
        })?;
        let info = self.adapters.info(target.registry_type)?;
        let trigger = policy.trigger.trigger_type();
        if !info.supported_triggers.contains(&trigger) {
            return Err(Error::Configuration(format!(
                "{} does not support {:?} triggers",
                target.registry_type, trigger
            )));
        }
        if let Trigger::Scheduled { cron } = &policy.trigger {
            parse_cron(cron)?;
        }
        let (source, _) = policy.endpoints();
        let source = self.target(source).await?;
        self.adapters
            .info(source.registry_type)?
            .check_filters(&policy.filters)
    }

    /// Resolves the repositories and tags a transfer of `policy` covers. An explicit
    /// repository list replaces the policy's name filter. Destination namespaces
    /// are prepared before the jobs are returned.
    pub async fn expand(&self, policy: &Policy, repositories: &[String]) -> Result<Vec<NewJob>> {
        let (source, destination) = self.endpoints(policy).await?;
        source.info().check_filters(&policy.filters)?;

        let resources: Vec<Resource> = if repositories.is_empty() {
            source.fetch_artifacts(&policy.filters).await?
        } else {
            let mut out = Vec::new();
            for repository in repositories {
                let filters = filters_for_repository(&policy.filters, repository);
                out.extend(source.fetch_artifacts(&filters).await?);
            }
            out
        };
        tracing::info!(
            policy = policy.id,
            "{} repositories to replicate",
            resources.len()
        );

        let dest_resources: Vec<Resource> = resources
            .iter()
            .map(|r| Resource {
                repository: policy.destination_repository(&r.repository),
                artifacts: r.artifacts.clone(),
            })
            .collect();
        if !dest_resources.is_empty() {
            destination.prepare_for_push(&dest_resources).await?;
        }

        Ok(resources
            .iter()
            .map(|r| new_job(policy, Operation::Transfer, &r.repository, r.tags()))
            .collect())
    }

    /// Manual or scheduled run of a policy: one job per repository.
    pub async fn trigger(&self, policy_id: PolicyId, repositories: &[String]) -> Result<Vec<Created>> {
        let policy = self.store.get_policy(policy_id).await?;
        if !policy.enabled {
            return Err(Error::Configuration(format!(
                "policy {} is disabled",
                policy_id
            )));
        }
        let mut created = Vec::new();
        for job in self.expand(&policy, repositories).await? {
            created.push(self.store.create_job(job, self.retrigger_window).await?);
        }
        Ok(created)
    }

    /// A push or delete seen on the source registry. A transfer with no tags
    /// resolves them through the policy's tag filters, a delete with no tags
    /// removes every tag at the destination.
    pub async fn event(
        &self,
        policy_id: PolicyId,
        repository: &str,
        operation: Operation,
        tags: Vec<String>,
    ) -> Result<Created> {
        let policy = self.store.get_policy(policy_id).await?;
        if !policy.enabled {
            return Err(Error::Configuration(format!(
                "policy {} is disabled",
                policy_id
            )));
        }
        let tags = if tags.is_empty() && operation == Operation::Transfer {
            let (source, _) = self.endpoints(&policy).await?;
            let filters = filters_for_repository(&policy.filters, repository);
            source
                .fetch_artifacts(&filters)
                .await?
                .into_iter()
                .find(|r| r.repository == repository)
                .map(|r| r.tags())
                .unwrap_or_default()
        } else {
            tags
        };
        self.store
            .create_job(
                new_job(&policy, operation, repository, tags),
                self.retrigger_window,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn policy(id: PolicyId, trigger: Trigger, enabled: bool) -> Policy {
        let mut p: Policy = serde_json::from_value(serde_json::json!({
            "name": format!("p{}", id),
            "target_id": 1,
        }))
        .unwrap();
        p.id = id;
        p.trigger = trigger;
        p.enabled = enabled;
        p
    }

    fn every_five_minutes() -> Trigger {
        Trigger::Scheduled {
            cron: "*/5 * * * *".to_string(),
        }
    }

    #[test]
    fn test_parse_cron() {
        assert!(parse_cron("*/5 * * * *").is_ok());
        assert!(parse_cron("0 0 3 * * *").is_ok());
        assert!(matches!(
            parse_cron("every tuesday"),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_due_policies_fire_once_per_tick() {
        let policies = vec![
            policy(1, every_five_minutes(), true),
            policy(2, every_five_minutes(), false),
            policy(3, Trigger::Manual, true),
        ];
        let after = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();

        assert_eq!(
            next_tick(&policies, after),
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 10, 5, 0).unwrap())
        );
        let until = Utc.with_ymd_and_hms(2024, 3, 1, 10, 4, 59).unwrap();
        assert!(due_policies(&policies, after, until).is_empty());

        let until = Utc.with_ymd_and_hms(2024, 3, 1, 10, 5, 0).unwrap();
        assert_eq!(
            due_policies(&policies, after, until),
            vec![(Utc.with_ymd_and_hms(2024, 3, 1, 10, 5, 0).unwrap(), 1)]
        );

        // Six ticks passed, six runs.
        let until = Utc.with_ymd_and_hms(2024, 3, 1, 10, 30, 0).unwrap();
        let due = due_policies(&policies, after, until);
        assert_eq!(due.len(), 6);
        assert!(due.iter().all(|(_, id)| *id == 1));
        assert_eq!(due[5].0, until);
        assert!(due.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_filters_for_repository_replace_name() {
        let filters = vec![
            Filter::Name {
                pattern: "library/**".to_string(),
            },
            Filter::Tag {
                pattern: "*latest*".to_string(),
                decoration: crate::model::Decoration::Excludes,
            },
        ];
        let out = filters_for_repository(&filters, "team/app");
        assert_eq!(out.len(), 2);
        assert_eq!(
            crate::adapter::filter::name_pattern(&out),
            Some("team/app")
        );
    }

    #[test]
    fn test_new_job_keeps_dest_repository_only_when_renamed() {
        let mut p = policy(1, Trigger::Manual, true);
        let job = new_job(&p, Operation::Transfer, "library/alpine", vec!["3.19".to_string()]);
        assert_eq!(job.parameters.dest_repository, None);
        p.dest_namespace = Some("mirror".to_string());
        let job = new_job(&p, Operation::Delete, "library/alpine", Vec::new());
        assert_eq!(
            job.parameters.dest_repository.as_deref(),
            Some("mirror/alpine")
        );
    }
}
