//! Applies policy filters to repositories and artifacts.

use std::future::Future;

use crate::error::{Error, Result};
use crate::glob;
use crate::model::{Artifact, Decoration, Filter, Resource};

use super::runner::LimitedRunner;

pub fn name_pattern(filters: &[Filter]) -> Option<&str> {
    filters.iter().find_map(|f| match f {
        Filter::Name { pattern } if !pattern.is_empty() => Some(pattern.as_str()),
        _ => None,
    })
}

pub fn filter_repositories(repositories: Vec<String>, filters: &[Filter]) -> Result<Vec<String>> {
    let pattern = match name_pattern(filters) {
        None => return Ok(repositories),
        Some(p) => glob::compile(p)?,
    };
    Ok(repositories
        .into_iter()
        .filter(|r| pattern.is_match(r))
        .collect())
}

fn keep(decoration: Decoration, matched: bool) -> bool {
    match decoration {
        Decoration::Matches => matched,
        Decoration::Excludes => !matched,
    }
}

/// Applies the tag, label and resource filters, every filter has to accept an artifact.
pub fn filter_artifacts(artifacts: Vec<Artifact>, filters: &[Filter]) -> Result<Vec<Artifact>> {
    let mut artifacts = artifacts;
    for f in filters {
        artifacts = match f {
            Filter::Name { .. } => artifacts,
            Filter::Tag {
                pattern,
                decoration,
            } => {
                if pattern.is_empty() {
                    artifacts
                } else {
                    let re = glob::compile(pattern)?;
                    artifacts
                        .into_iter()
                        .filter(|a| keep(*decoration, re.is_match(&a.tag)))
                        .collect()
                }
            }
            Filter::Label { labels, decoration } => {
                if labels.is_empty() {
                    artifacts
                } else {
                    artifacts
                        .into_iter()
                        .filter(|a| match decoration {
                            Decoration::Matches => labels.iter().all(|l| a.labels.contains(l)),
                            Decoration::Excludes => !labels.iter().any(|l| a.labels.contains(l)),
                        })
                        .collect()
                }
            }
            Filter::Resource { kind } => artifacts.into_iter().filter(|a| a.kind == *kind).collect(),
        };
    }
    Ok(artifacts)
}

/// Narrows `repositories` by the name filter, lists the artifacts of the rest
/// through `list` and keeps the resources with at least one artifact left.
pub async fn collect_resources<F, Fut>(
    runner: &LimitedRunner,
    repositories: Vec<String>,
    filters: &[Filter],
    list: F,
) -> Result<Vec<Resource>>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<Vec<Artifact>>>,
{
    let repositories = filter_repositories(repositories, filters)?;
    tracing::debug!("collecting artifacts of {} repositories", repositories.len());
    let listed = runner
        .run(repositories, |repository| {
            let listing = list(repository.clone());
            async move { Ok::<_, Error>((repository, listing.await?)) }
        })
        .await?;

    let mut resources = Vec::new();
    for (repository, mut artifacts) in listed {
        artifacts.sort_by(|a, b| a.tag.cmp(&b.tag));
        let artifacts = filter_artifacts(artifacts, filters)?;
        if !artifacts.is_empty() {
            resources.push(Resource {
                repository,
                artifacts,
            });
        }
    }
    Ok(resources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceType;

    fn tags(names: &[&str]) -> Vec<Artifact> {
        names.iter().map(|e| Artifact::tagged(*e)).collect()
    }

    #[test]
    fn test_tag_excludes() {
        let filters = vec![Filter::Tag {
            pattern: "*latest*".to_string(),
            decoration: Decoration::Excludes,
        }];
        let out = filter_artifacts(tags(&["dev", "v1", "v2", "latest"]), &filters).unwrap();
        let names: Vec<&str> = out.iter().map(|e| e.tag.as_str()).collect();
        assert_eq!(names, vec!["dev", "v1", "v2"]);
    }

    #[test]
    fn test_labels_and_resource_kind() {
        let mut signed = Artifact::tagged("v1");
        signed.labels = vec!["signed".to_string(), "prod".to_string()];
        let mut chart = Artifact::tagged("c1");
        chart.kind = ResourceType::Chart;
        chart.labels = vec!["prod".to_string()];
        let all = vec![signed, chart, Artifact::tagged("v2")];

        let matches = vec![Filter::Label {
            labels: vec!["prod".to_string()],
            decoration: Decoration::Matches,
        }];
        assert_eq!(filter_artifacts(all.clone(), &matches).unwrap().len(), 2);

        let excludes = vec![
            Filter::Label {
                labels: vec!["signed".to_string()],
                decoration: Decoration::Excludes,
            },
            Filter::Resource {
                kind: ResourceType::Image,
            },
        ];
        let out = filter_artifacts(all, &excludes).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].tag, "v2");
    }

    #[tokio::test]
    async fn test_collect_resources_drops_empty_repositories() {
        let filters = vec![
            Filter::Name {
                pattern: "team/**".to_string(),
            },
            Filter::Tag {
                pattern: "v*".to_string(),
                decoration: Decoration::Matches,
            },
        ];
        let repositories = vec![
            "team/app".to_string(),
            "team/docs".to_string(),
            "other/app".to_string(),
        ];
        let resources = collect_resources(
            &LimitedRunner::default(),
            repositories,
            &filters,
            |repository| async move {
                Ok(match repository.as_str() {
                    "team/app" => tags(&["v2", "latest", "v1"]),
                    _ => tags(&["latest"]),
                })
            },
        )
        .await
        .unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].repository, "team/app");
        assert_eq!(resources[0].tags(), vec!["v1", "v2"]);
    }
}
