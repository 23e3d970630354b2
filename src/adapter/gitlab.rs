//! GitLab container registry: REST API v4 for enumeration and deletion.

use std::sync::Arc;

use http::header::{HeaderName, HeaderValue};
use http::{Method, StatusCode, Uri};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::filter::collect_resources;
use super::{Adapter, AdapterContext, AdapterInfo, ApiHeaders, LimitedRunner};
use crate::error::{Error, Result};
use crate::model::{Artifact, Filter, FilterType, RegistryType, Resource, Target, TriggerType};
use crate::registry::http::util::{error_from_response, read_json};
use crate::registry::http::HttpCli;
use crate::registry::HttpRegistry;

const PER_PAGE: usize = 100;

pub fn info() -> AdapterInfo {
    AdapterInfo::images(
        RegistryType::Gitlab,
        &[FilterType::Name, FilterType::Tag],
        &[TriggerType::Manual, TriggerType::Scheduled],
    )
}

pub fn create(target: &Target, ctx: &AdapterContext) -> Result<Arc<dyn Adapter>> {
    Ok(Arc::new(GitlabAdapter::new(target, ctx)?))
}

/// `https://registry.gitlab.example.com` is served by `https://gitlab.example.com`.
pub fn derive_api_url(registry_url: &str) -> Result<String> {
    let uri = registry_url.parse::<Uri>()?;
    let host = uri
        .host()
        .ok_or_else(|| Error::Configuration(format!("registry url {:?} has no host", registry_url)))?;
    let host = host.strip_prefix("registry.").unwrap_or(host);
    let scheme = uri.scheme_str().unwrap_or("https");
    Ok(match uri.port_u16() {
        Some(port) => format!("{}://{}:{}", scheme, host, port),
        None => format!("{}://{}", scheme, host),
    })
}

#[derive(Debug, Clone, Deserialize)]
struct Project {
    id: i64,
    path_with_namespace: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RegistryRepository {
    id: i64,
    path: String,
}

#[derive(Debug, Deserialize)]
struct Tag {
    name: String,
}

pub struct GitlabAdapter {
    registry: HttpRegistry,
    api: HttpCli,
    api_base: String,
    runner: LimitedRunner,
}

impl GitlabAdapter {
    pub fn new(target: &Target, ctx: &AdapterContext) -> Result<GitlabAdapter> {
        let registry = ctx.registry_for(target, &target.url, Vec::new())?;
        let api_base = match target.option("api_url") {
            Some(u) => u.trim_end_matches('/').to_string(),
            None => derive_api_url(&target.url)?,
        };
        let mut api = ctx.api_client(target);
        if let Some(credential) = &target.credential {
            let mut header = HeaderValue::from_str(&credential.access_secret)
                .map_err(|e| Error::Configuration(format!("invalid gitlab token: {}", e)))?;
            header.set_sensitive(true);
            let headers = ApiHeaders::new(&api_base)?.with(HeaderName::from_static("private-token"), header);
            api = api.with_modifier(Arc::new(headers));
        }
        Ok(GitlabAdapter {
            registry,
            api,
            api_base,
            runner: LimitedRunner::default(),
        })
    }

    fn api_uri(&self, path_and_query: &str) -> Result<Uri> {
        Ok(format!("{}/api/v4{}", self.api_base, path_and_query).parse()?)
    }

    /// Follows `X-Next-Page` until it comes back empty.
    async fn get_all<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>> {
        let chr = if path.contains('?') { '&' } else { '?' };
        let mut out = Vec::new();
        let mut page = "1".to_string();
        loop {
            let uri = self.api_uri(&format!(
                "{}{}per_page={}&page={}",
                path, chr, PER_PAGE, page
            ))?;
            let response = self.api.request_simple(&uri, Method::GET).await?;
            match response.status() {
                s if s.is_success() => {}
                StatusCode::NOT_FOUND => return Err(Error::NotFound(path.to_string())),
                _ => return Err(error_from_response(response).await),
            }
            let next = response
                .headers()
                .get("x-next-page")
                .and_then(|e| e.to_str().ok())
                .map(|e| e.trim().to_string())
                .unwrap_or_default();
            let items: Vec<T> = read_json(response).await?;
            out.extend(items);
            if next.is_empty() {
                return Ok(out);
            }
            page = next;
        }
    }

    async fn projects(&self) -> Result<Vec<Project>> {
        self.get_all("/projects?membership=true&simple=true").await
    }

    async fn registry_repositories(&self, project: &Project) -> Result<Vec<RegistryRepository>> {
        self.get_all(&format!("/projects/{}/registry/repositories", project.id))
            .await
    }

    /// The project owning `repository`, the longest matching path prefix wins.
    async fn project_of(&self, repository: &str) -> Result<Project> {
        let parts: Vec<&str> = repository.split('/').collect();
        for end in (1..=parts.len()).rev() {
            let candidate = parts[..end].join("/");
            let uri = self.api_uri(&format!("/projects/{}", urlencoding::encode(&candidate)))?;
            let response = self.api.request_simple(&uri, Method::GET).await?;
            match response.status() {
                s if s.is_success() => return read_json(response).await,
                StatusCode::NOT_FOUND => continue,
                _ => return Err(error_from_response(response).await),
            }
        }
        Err(Error::NotFound(format!("gitlab project for {}", repository)))
    }

    async fn locate(&self, repository: &str) -> Result<(Project, RegistryRepository)> {
        let project = self.project_of(repository).await?;
        let found = self
            .registry_repositories(&project)
            .await?
            .into_iter()
            .find(|r| r.path == repository)
            .ok_or_else(|| Error::NotFound(format!("registry repository {}", repository)))?;
        Ok((project, found))
    }

    async fn tags_of(&self, project_id: i64, repository_id: i64) -> Result<Vec<String>> {
        let tags: Vec<Tag> = self
            .get_all(&format!(
                "/projects/{}/registry/repositories/{}/tags",
                project_id, repository_id
            ))
            .await?;
        let mut tags: Vec<String> = tags.into_iter().map(|t| t.name).collect();
        tags.sort();
        Ok(tags)
    }
}

#[async_trait::async_trait]
impl Adapter for GitlabAdapter {
    fn info(&self) -> AdapterInfo {
        info()
    }

    fn registry(&self) -> &HttpRegistry {
        &self.registry
    }

    async fn fetch_artifacts(&self, filters: &[Filter]) -> Result<Vec<Resource>> {
        let projects = self.projects().await?;
        let per_project = self
            .runner
            .run(projects, |project| async move {
                match self.registry_repositories(&project).await {
                    Ok(repositories) => Ok(repositories
                        .into_iter()
                        .map(|r| (r.path, (project.id, r.id)))
                        .collect::<Vec<_>>()),
                    Err(e) if e.is_not_found() => Ok(Vec::new()),
                    Err(e) => Err(e),
                }
            })
            .await?;
        let ids: std::collections::BTreeMap<String, (i64, i64)> =
            per_project.into_iter().flatten().collect();
        let ids = &ids;
        collect_resources(
            &self.runner,
            ids.keys().cloned().collect(),
            filters,
            |repository| async move {
                let (project_id, repository_id) = ids[&repository];
                Ok::<_, Error>(
                    self.tags_of(project_id, repository_id)
                        .await?
                        .into_iter()
                        .map(Artifact::tagged)
                        .collect::<Vec<_>>(),
                )
            },
        )
        .await
    }

    /// GitLab repositories live under projects, which pushes cannot create.
    async fn prepare_for_push(&self, resources: &[Resource]) -> Result<()> {
        for r in resources {
            self.ensure_namespace(&r.repository).await?;
        }
        Ok(())
    }

    async fn ensure_namespace(&self, repository: &str) -> Result<()> {
        match self.project_of(repository).await {
            Ok(project) => {
                tracing::debug!(
                    "{} belongs to gitlab project {}",
                    repository,
                    project.path_with_namespace
                );
                self.registry.check_push_access(repository).await
            }
            Err(e) if e.is_not_found() => Err(Error::Configuration(format!(
                "no gitlab project matches {}, create it first",
                repository
            ))),
            Err(e) => Err(e),
        }
    }

    async fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        let (project, found) = self.locate(repository).await?;
        self.tags_of(project.id, found.id).await
    }

    async fn delete_tag(&self, repository: &str, tag: &str) -> Result<()> {
        let (project, found) = self.locate(repository).await?;
        let uri = self.api_uri(&format!(
            "/projects/{}/registry/repositories/{}/tags/{}",
            project.id,
            found.id,
            urlencoding::encode(tag)
        ))?;
        let response = self.api.request_simple(&uri, Method::DELETE).await?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(Error::NotFound(format!("{}:{}", repository, tag))),
            _ => Err(error_from_response(response).await),
        }
    }
}
