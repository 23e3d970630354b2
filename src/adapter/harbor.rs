//! Harbor: V2 for the transfer, the project API for namespaces and artifacts.

use std::collections::BTreeSet;
use std::sync::Arc;

use http::{Method, StatusCode, Uri};
use hyper::Body;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::filter::{collect_resources, name_pattern};
use super::native::NativeAdapter;
use super::{namespace_of, Adapter, AdapterContext, AdapterInfo, LimitedRunner};
use crate::error::{Error, Result};
use crate::glob;
use crate::model::{
    Artifact, Filter, FilterType, RegistryType, Resource, ResourceType, Target, TriggerType,
};
use crate::registry::auth::BasicAuthorizer;
use crate::registry::http::util::{error_from_response, read_json};
use crate::registry::http::HttpCli;
use crate::registry::HttpRegistry;

const PAGE_SIZE: usize = 100;
/// How often a 409 on project creation is answered with another lookup.
const CONFLICT_RECHECKS: usize = 2;

const ROLE_PROJECT_ADMIN: i64 = 1;
const ROLE_DEVELOPER: i64 = 2;
const ROLE_GUEST: i64 = 3;
const ROLE_LIMITED_GUEST: i64 = 5;

pub fn info() -> AdapterInfo {
    let mut info = AdapterInfo::images(
        RegistryType::Harbor,
        &[
            FilterType::Name,
            FilterType::Tag,
            FilterType::Label,
            FilterType::Resource,
        ],
        &[TriggerType::Manual, TriggerType::Scheduled, TriggerType::Event],
    );
    info.supported_resource_types = vec![ResourceType::Image, ResourceType::Artifact];
    info
}

pub fn create(target: &Target, ctx: &AdapterContext) -> Result<Arc<dyn Adapter>> {
    Ok(Arc::new(HarborAdapter::new(target, ctx)?))
}

#[derive(Debug, Deserialize)]
struct Project {
    name: String,
    #[serde(default)]
    current_user_role_id: i64,
    #[serde(default)]
    current_user_role_ids: Vec<i64>,
}

impl Project {
    fn roles(&self) -> BTreeSet<i64> {
        let mut roles: BTreeSet<i64> = self.current_user_role_ids.iter().copied().collect();
        if self.current_user_role_id != 0 {
            roles.insert(self.current_user_role_id);
        }
        roles
    }
}

#[derive(Debug, Deserialize)]
struct Repository {
    name: String,
}

#[derive(Debug, Deserialize)]
struct NamedRef {
    name: String,
}

#[derive(Debug, Deserialize)]
struct HarborArtifact {
    digest: String,
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    tags: Option<Vec<NamedRef>>,
    #[serde(default)]
    labels: Option<Vec<NamedRef>>,
}

impl HarborArtifact {
    fn into_artifacts(self) -> Vec<Artifact> {
        let kind = match self.kind.as_deref() {
            Some("CHART") => ResourceType::Chart,
            Some("IMAGE") | None => ResourceType::Image,
            Some(_) => ResourceType::Artifact,
        };
        let labels: Vec<String> = self
            .labels
            .unwrap_or_default()
            .into_iter()
            .map(|e| e.name)
            .collect();
        self.tags
            .unwrap_or_default()
            .into_iter()
            .map(|t| Artifact {
                tag: t.name,
                digest: Some(self.digest.clone()),
                media_type: self.media_type.clone(),
                labels: labels.clone(),
                kind,
                is_accessory: false,
            })
            .collect()
    }
}

enum Lookup {
    Found(Project),
    Missing,
    Unauthorized,
}

pub struct HarborAdapter {
    native: NativeAdapter,
    api: HttpCli,
    runner: LimitedRunner,
}

impl HarborAdapter {
    pub fn new(target: &Target, ctx: &AdapterContext) -> Result<HarborAdapter> {
        let native = NativeAdapter::new(target, ctx)?;
        let mut api = ctx.api_client(target);
        if let Some(credential) = &target.credential {
            api = api.with_modifier(Arc::new(BasicAuthorizer::new(credential)?));
        }
        Ok(HarborAdapter {
            native,
            api,
            runner: LimitedRunner::default(),
        })
    }

    fn api_uri(&self, path_and_query: &str) -> Result<Uri> {
        let base = self.native.registry().registry_uri().to_string();
        Ok(format!("{}/api/v2.0{}", base.trim_end_matches('/'), path_and_query).parse()?)
    }

    async fn get_json<T: DeserializeOwned>(&self, path_and_query: &str) -> Result<T> {
        let uri = self.api_uri(path_and_query)?;
        let response = self.api.request_simple(&uri, Method::GET).await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        read_json(response).await
    }

    /// Follows `page`/`page_size` until a short page comes back.
    async fn get_pages<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>> {
        let chr = if path.contains('?') { '&' } else { '?' };
        let mut out = Vec::new();
        let mut page = 1;
        loop {
            let items: Vec<T> = self
                .get_json(&format!("{}{}page={}&page_size={}", path, chr, page, PAGE_SIZE))
                .await?;
            let done = items.len() < PAGE_SIZE;
            out.extend(items);
            if done {
                return Ok(out);
            }
            page += 1;
        }
    }

    async fn lookup_project(&self, name: &str) -> Result<Lookup> {
        let uri = self.api_uri(&format!(
            "/projects?name={}&page_size={}",
            urlencoding::encode(name),
            PAGE_SIZE
        ))?;
        let response = self.api.request_simple(&uri, Method::GET).await?;
        match response.status() {
            StatusCode::UNAUTHORIZED => Ok(Lookup::Unauthorized),
            StatusCode::NOT_FOUND => Ok(Lookup::Missing),
            s if s.is_success() => {
                // The name query is a fuzzy match.
                let projects: Option<Vec<Project>> = read_json(response).await?;
                Ok(projects
                    .unwrap_or_default()
                    .into_iter()
                    .find(|p| p.name == name)
                    .map(Lookup::Found)
                    .unwrap_or(Lookup::Missing))
            }
            _ => Err(error_from_response(response).await),
        }
    }

    /// `true` when created, `false` when someone else created it first.
    async fn create_project(&self, name: &str) -> Result<bool> {
        let uri = self.api_uri("/projects")?;
        let body = serde_json::to_vec(&serde_json::json!({
            "project_name": name,
            "metadata": { "public": "false" },
        }))?;
        let response = self
            .api
            .request(&uri, body, |body, c| async move {
                c.method(Method::POST)
                    .header(http::header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body))
                    .map_err(|e| e.into())
            })
            .await?;
        match response.status() {
            StatusCode::CREATED | StatusCode::OK => Ok(true),
            StatusCode::CONFLICT => Ok(false),
            _ => Err(error_from_response(response).await),
        }
    }

    async fn check_role(&self, project: &Project, repository: &str) -> Result<()> {
        let roles = project.roles();
        if roles.contains(&ROLE_PROJECT_ADMIN) || roles.contains(&ROLE_DEVELOPER) {
            return Ok(());
        }
        if !roles.is_empty()
            && roles
                .iter()
                .all(|r| *r == ROLE_GUEST || *r == ROLE_LIMITED_GUEST)
        {
            return Err(Error::Auth(format!(
                "read only role {:?} on project {}",
                roles, project.name
            )));
        }
        self.native.registry().check_push_access(repository).await
    }

    async fn candidate_repositories(&self, filters: &[Filter]) -> Result<Vec<String>> {
        let pattern = name_pattern(filters);
        if let Some(paths) = pattern.and_then(glob::specific_paths) {
            return Ok(paths);
        }
        let projects: Vec<String> = match pattern.and_then(glob::specific_namespaces) {
            Some(namespaces) => namespaces,
            None => self
                .get_pages::<Project>("/projects")
                .await?
                .into_iter()
                .map(|p| p.name)
                .collect(),
        };
        let per_project = self
            .runner
            .run(projects, |project| async move {
                let repositories: Vec<Repository> = match self
                    .get_pages(&format!(
                        "/projects/{}/repositories",
                        urlencoding::encode(&project)
                    ))
                    .await
                {
                    Err(e) if e.is_not_found() => Vec::new(),
                    other => other?,
                };
                Ok::<_, Error>(repositories.into_iter().map(|r| r.name).collect::<Vec<_>>())
            })
            .await?;
        Ok(per_project.into_iter().flatten().collect())
    }

    async fn list_artifacts(&self, repository: &str) -> Result<Vec<Artifact>> {
        let (project, rest) = match repository.split_once('/') {
            Some(p) => p,
            None => return Ok(Vec::new()),
        };
        // Harbor routes repository names with slashes only when encoded twice.
        let encoded = urlencoding::encode(&urlencoding::encode(rest)).into_owned();
        let path = format!(
            "/projects/{}/repositories/{}/artifacts?with_tag=true&with_label=true",
            urlencoding::encode(project),
            encoded
        );
        let artifacts: Vec<HarborArtifact> = match self.get_pages(&path).await {
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            other => other?,
        };
        Ok(artifacts
            .into_iter()
            .flat_map(|a| a.into_artifacts())
            .collect())
    }
}

#[async_trait::async_trait]
impl Adapter for HarborAdapter {
    fn info(&self) -> AdapterInfo {
        info()
    }

    fn registry(&self) -> &HttpRegistry {
        self.native.registry()
    }

    async fn fetch_artifacts(&self, filters: &[Filter]) -> Result<Vec<Resource>> {
        let repositories = self.candidate_repositories(filters).await?;
        collect_resources(&self.runner, repositories, filters, |repository| async move {
            self.list_artifacts(&repository).await
        })
        .await
    }

    async fn prepare_for_push(&self, resources: &[Resource]) -> Result<()> {
        let mut seen = BTreeSet::new();
        for r in resources {
            if seen.insert(namespace_of(&r.repository).to_string()) {
                self.ensure_namespace(&r.repository).await?;
            }
        }
        Ok(())
    }

    async fn ensure_namespace(&self, repository: &str) -> Result<()> {
        let namespace = namespace_of(repository);
        for _ in 0..=CONFLICT_RECHECKS {
            match self.lookup_project(namespace).await? {
                Lookup::Unauthorized => {
                    tracing::debug!(
                        "project lookup for {} was unauthorized, checking write access directly",
                        namespace
                    );
                    return self.native.registry().check_push_access(repository).await;
                }
                Lookup::Found(project) => return self.check_role(&project, repository).await,
                Lookup::Missing => {
                    if self.create_project(namespace).await? {
                        tracing::info!("created project {}", namespace);
                        return Ok(());
                    }
                    tracing::debug!("project {} was created concurrently, checking again", namespace);
                }
            }
        }
        Err(Error::Conflict(format!(
            "project {} kept conflicting on creation",
            namespace
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_roles() {
        let p: Project = serde_json::from_str(
            r#"{"name":"library","current_user_role_id":3,"current_user_role_ids":[3,2]}"#,
        )
        .unwrap();
        assert_eq!(p.roles().into_iter().collect::<Vec<_>>(), vec![2, 3]);
        let p: Project = serde_json::from_str(r#"{"name":"library"}"#).unwrap();
        assert!(p.roles().is_empty());
    }

    #[test]
    fn test_artifact_expands_to_one_entry_per_tag() {
        let a: HarborArtifact = serde_json::from_str(
            r#"{"digest":"sha256:aa","type":"IMAGE","tags":[{"name":"v1"},{"name":"v2"}],"labels":[{"name":"prod"}]}"#,
        )
        .unwrap();
        let artifacts = a.into_artifacts();
        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[1].tag, "v2");
        assert_eq!(artifacts[1].labels, vec!["prod".to_string()]);
        assert_eq!(artifacts[0].digest.as_deref(), Some("sha256:aa"));
    }
}
