//! DockerHub: the Hub API enumerates and prepares namespaces, V2 moves content.
//! Every call passes through a shared [`RateLimitGuard`].

use std::collections::BTreeSet;
use std::sync::Arc;

use http::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use http::{Method, Request, Response, StatusCode, Uri};
use hyper::Body;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::Mutex;

use super::filter::{collect_resources, name_pattern};
use super::{
    namespace_of, Adapter, AdapterContext, AdapterInfo, LimitedRunner, PathComponents,
};
use crate::container_specs::is_digest;
use crate::error::{Error, Result};
use crate::glob;
use crate::model::{
    Artifact, Credential, Filter, FilterType, RegistryType, Resource, Target, TriggerType,
};
use crate::registry::http::util::{dump_body_to_string, error_from_response, read_json};
use crate::registry::http::{HttpCli, Modifier, RequestSummary};
use crate::registry::ratelimit::RateLimitGuard;
use crate::registry::HttpRegistry;

pub const DEFAULT_API_URL: &str = "https://hub.docker.com";
const PAGE_SIZE: usize = 100;

pub fn info() -> AdapterInfo {
    let mut info = AdapterInfo::images(
        RegistryType::DockerHub,
        &[FilterType::Name, FilterType::Tag],
        &[TriggerType::Manual, TriggerType::Scheduled],
    );
    info.repository_path_components = PathComponents::ExactlyTwo;
    info
}

pub fn create(target: &Target, ctx: &AdapterContext) -> Result<Arc<dyn Adapter>> {
    Ok(Arc::new(DockerHubAdapter::new(target, ctx)?))
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct NamespacesResponse {
    #[serde(default)]
    namespaces: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default)]
    next: Option<String>,
    #[serde(default = "Vec::new")]
    results: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct HubRepository {
    name: String,
    #[serde(default)]
    namespace: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HubTag {
    name: String,
}

/// Logs into the Hub API once and sends the JWT with every API call.
struct HubLogin {
    client: HttpCli,
    login_uri: Uri,
    credential: Credential,
    token: Mutex<Option<HeaderValue>>,
}

impl HubLogin {
    async fn login(&self) -> Result<HeaderValue> {
        let body = serde_json::to_vec(&serde_json::json!({
            "username": self.credential.access_key,
            "password": self.credential.access_secret,
        }))?;
        let response = self
            .client
            .request(&self.login_uri, body, |body, c| async move {
                c.method(Method::POST)
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from(body))
                    .map_err(|e| e.into())
            })
            .await?;
        if !response.status().is_success() {
            return Err(match error_from_response(response).await {
                Error::Registry { status, detail } if status.is_client_error() => {
                    Error::Auth(format!("docker hub login failed: {} {}", status, detail))
                }
                other => other,
            });
        }
        let login: LoginResponse = read_json(response).await?;
        let mut header = HeaderValue::from_str(&format!("JWT {}", login.token))
            .map_err(|e| Error::Auth(format!("docker hub returned an unusable token: {}", e)))?;
        header.set_sensitive(true);
        Ok(header)
    }
}

#[async_trait::async_trait]
impl Modifier for HubLogin {
    async fn modify(&self, request: &mut Request<Body>) -> Result<()> {
        if request.uri().authority() != self.login_uri.authority() {
            return Ok(());
        }
        let mut token = self.token.lock().await;
        let header = match &*token {
            Some(h) => h.clone(),
            None => {
                let h = self.login().await?;
                *token = Some(h.clone());
                h
            }
        };
        request.headers_mut().insert(AUTHORIZATION, header);
        Ok(())
    }

    async fn on_unauthorized(
        &self,
        _request: &RequestSummary,
        _response: &Response<Body>,
    ) -> Result<bool> {
        *self.token.lock().await = None;
        Ok(true)
    }
}

pub struct DockerHubAdapter {
    registry: HttpRegistry,
    api: HttpCli,
    api_base: String,
    username: Option<String>,
    runner: LimitedRunner,
}

impl DockerHubAdapter {
    pub fn new(target: &Target, ctx: &AdapterContext) -> Result<DockerHubAdapter> {
        let guard: Arc<dyn Modifier> = Arc::new(RateLimitGuard::default());
        let registry = ctx.registry_for(target, &target.url, vec![guard.clone()])?;

        let api_base = target
            .option("api_url")
            .unwrap_or(DEFAULT_API_URL)
            .trim_end_matches('/')
            .to_string();
        let mut api = ctx.api_client(target).with_modifier(guard);
        if let Some(credential) = &target.credential {
            let login = HubLogin {
                client: api.clone(),
                login_uri: format!("{}/v2/users/login/", api_base).parse()?,
                credential: credential.clone(),
                token: Mutex::new(None),
            };
            api = api.with_modifier(Arc::new(login));
        }

        Ok(DockerHubAdapter {
            registry,
            api,
            api_base,
            username: target.credential.as_ref().map(|c| c.access_key.clone()),
            runner: LimitedRunner::default(),
        })
    }

    fn api_uri(&self, path: &str) -> Result<Uri> {
        Ok(format!("{}{}", self.api_base, path).parse()?)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let uri = self.api_uri(path)?;
        let response = self.api.request_simple(&uri, Method::GET).await?;
        match response.status() {
            s if s.is_success() => read_json(response).await,
            StatusCode::NOT_FOUND => Err(Error::NotFound(path.to_string())),
            _ => Err(error_from_response(response).await),
        }
    }

    async fn get_all_pages<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>> {
        let mut out = Vec::new();
        let mut page = 1;
        loop {
            let p: Page<T> = self
                .get_json(&format!("{}?page={}&page_size={}", path, page, PAGE_SIZE))
                .await?;
            out.extend(p.results);
            match p.next {
                Some(n) if !n.is_empty() => page += 1,
                _ => return Ok(out),
            }
        }
    }

    async fn list_namespaces(&self) -> Result<Vec<String>> {
        let r: NamespacesResponse = self.get_json("/v2/repositories/namespaces/").await?;
        Ok(r.namespaces)
    }

    async fn namespace_exists(&self, namespace: &str) -> Result<bool> {
        match self
            .get_json::<serde_json::Value>(&format!("/v2/orgs/{}/", namespace))
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_namespace(&self, namespace: &str) -> Result<()> {
        if self.username.as_deref() == Some(namespace) {
            // Personal namespaces always exist and cannot be created.
            return Ok(());
        }
        if self.namespace_exists(namespace).await? {
            tracing::debug!("namespace {} already exists on docker hub", namespace);
            return Ok(());
        }
        let body = serde_json::to_vec(&serde_json::json!({
            "orgname": namespace,
            "full_name": namespace,
            "company": namespace,
        }))?;
        let uri = self.api_uri("/v2/orgs/")?;
        let mut response = self
            .api
            .request(&uri, body, |body, c| async move {
                c.method(Method::POST)
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from(body))
                    .map_err(|e| e.into())
            })
            .await?;
        let status = response.status();
        if status.is_success() {
            tracing::info!("created namespace {} on docker hub", namespace);
            return Ok(());
        }
        let body = dump_body_to_string(&mut response).await.unwrap_or_default();
        if status == StatusCode::CONFLICT || body.contains("already exists") {
            return Ok(());
        }
        Err(Error::registry(status, &body))
    }

    async fn candidate_namespaces(&self, filters: &[Filter]) -> Result<Vec<String>> {
        match name_pattern(filters).and_then(glob::specific_namespaces) {
            Some(namespaces) => Ok(namespaces),
            None => self.list_namespaces().await,
        }
    }

    async fn list_repositories(&self, namespace: &str) -> Result<Vec<String>> {
        let repositories: Vec<HubRepository> = match self
            .get_all_pages(&format!("/v2/repositories/{}/", namespace))
            .await
        {
            Err(e) if e.is_not_found() => Vec::new(),
            other => other?,
        };
        Ok(repositories
            .into_iter()
            .map(|r| {
                format!(
                    "{}/{}",
                    r.namespace.as_deref().unwrap_or(namespace),
                    r.name
                )
            })
            .collect())
    }

    async fn hub_tags(&self, repository: &str) -> Result<Vec<String>> {
        self.info().check_repository(repository)?;
        let tags: Vec<HubTag> = self
            .get_all_pages(&format!("/v2/repositories/{}/tags/", repository))
            .await?;
        let mut tags: Vec<String> = tags.into_iter().map(|t| t.name).collect();
        tags.sort();
        Ok(tags)
    }
}

#[async_trait::async_trait]
impl Adapter for DockerHubAdapter {
    fn info(&self) -> AdapterInfo {
        info()
    }

    fn registry(&self) -> &HttpRegistry {
        &self.registry
    }

    async fn fetch_artifacts(&self, filters: &[Filter]) -> Result<Vec<Resource>> {
        let namespaces = self.candidate_namespaces(filters).await?;
        let mut repositories = Vec::new();
        for namespace in namespaces {
            repositories.extend(self.list_repositories(&namespace).await?);
        }
        collect_resources(&self.runner, repositories, filters, |repository| async move {
            match self.hub_tags(&repository).await {
                Ok(tags) => Ok(tags.into_iter().map(Artifact::tagged).collect()),
                Err(e) if e.is_not_found() => Ok(Vec::new()),
                Err(e) => Err(e),
            }
        })
        .await
    }

    async fn prepare_for_push(&self, resources: &[Resource]) -> Result<()> {
        let mut namespaces = BTreeSet::new();
        for r in resources {
            self.info().check_repository(&r.repository)?;
            namespaces.insert(namespace_of(&r.repository).to_string());
        }
        for namespace in namespaces {
            self.create_namespace(&namespace).await?;
        }
        Ok(())
    }

    async fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        self.hub_tags(repository).await
    }

    async fn delete_manifest(&self, repository: &str, reference: &str) -> Result<()> {
        if is_digest(reference) {
            return Err(Error::Configuration(format!(
                "docker hub only deletes by tag, got {}@{}",
                repository, reference
            )));
        }
        match self.delete_tag(repository, reference).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    async fn delete_tag(&self, repository: &str, tag: &str) -> Result<()> {
        self.info().check_repository(repository)?;
        let uri = self.api_uri(&format!("/v2/repositories/{}/tags/{}/", repository, tag))?;
        let response = self.api.request_simple(&uri, Method::DELETE).await?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(Error::NotFound(format!("{}:{}", repository, tag))),
            _ => Err(error_from_response(response).await),
        }
    }
}
