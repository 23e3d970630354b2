//! Pluggable registry adapters.
//!
//! Every adapter exposes the raw V2 client used for the actual transfer plus
//! the vendor specific calls needed to enumerate repositories, prepare the
//! destination and delete tags.

pub mod dockerhub;
pub mod filter;
pub mod ghcr;
pub mod gitlab;
pub mod harbor;
pub mod native;
pub mod runner;
pub mod volcengine;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::container_specs::is_digest;
use crate::error::{Error, Result};
use crate::model::{
    Filter, FilterType, Health, RegistryType, Resource, ResourceType, Target, TriggerType,
};
use crate::registry::auth::{StandardAuthorizer, TokenUrlRewrite};
use crate::registry::http::{HttpCli, Modifier, RetryPolicy, Transport};
use crate::registry::{HttpRegistry, ManifestStore};

pub use runner::{LimitedRunner, MAX_CONCURRENCY};

/// How many path components a repository name may have on a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PathComponents {
    Free,
    ExactlyTwo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdapterInfo {
    pub registry_type: RegistryType,
    pub supported_resource_types: Vec<ResourceType>,
    pub supported_filters: Vec<FilterType>,
    pub supported_triggers: Vec<TriggerType>,
    pub repository_path_components: PathComponents,
}

impl AdapterInfo {
    pub(crate) fn images(
        registry_type: RegistryType,
        supported_filters: &[FilterType],
        supported_triggers: &[TriggerType],
    ) -> AdapterInfo {
        AdapterInfo {
            registry_type,
            supported_resource_types: vec![ResourceType::Image],
            supported_filters: supported_filters.to_vec(),
            supported_triggers: supported_triggers.to_vec(),
            repository_path_components: PathComponents::Free,
        }
    }

    /// Rejects filters the adapter cannot evaluate.
    pub fn check_filters(&self, filters: &[Filter]) -> Result<()> {
        for f in filters {
            if !self.supported_filters.contains(&f.filter_type()) {
                return Err(Error::Configuration(format!(
                    "{} does not support {:?} filters",
                    self.registry_type,
                    f.filter_type()
                )));
            }
        }
        Ok(())
    }

    pub fn check_repository(&self, repository: &str) -> Result<()> {
        if self.repository_path_components == PathComponents::ExactlyTwo
            && repository.split('/').count() != 2
        {
            return Err(Error::Configuration(format!(
                "{} only supports repositories in the form <namespace>/<name>, got '{}'",
                self.registry_type, repository
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
pub trait Adapter: Send + Sync {
    fn info(&self) -> AdapterInfo;

    /// V2 client for manifests and blobs.
    fn registry(&self) -> &HttpRegistry;

    async fn health_check(&self) -> Health {
        match self.registry().ping().await {
            Ok(()) => Health::Healthy,
            Err(e) => {
                tracing::warn!("health check of {} failed: {}", self.registry().registry_uri(), e);
                Health::Unhealthy
            }
        }
    }

    async fn fetch_artifacts(&self, filters: &[Filter]) -> Result<Vec<Resource>>;

    /// Creates the namespaces and repositories the resources will be pushed to.
    async fn prepare_for_push(&self, resources: &[Resource]) -> Result<()>;

    /// Makes sure the namespace of `repository` exists and can be written to.
    async fn ensure_namespace(&self, repository: &str) -> Result<()> {
        let namespace = namespace_of(repository);
        let prepared = self
            .prepare_for_push(&[Resource {
                repository: repository.to_string(),
                artifacts: Vec::new(),
            }])
            .await;
        let checked = match prepared {
            Ok(()) => self.registry().check_push_access(repository).await,
            Err(e) => Err(e),
        };
        checked.map_err(|e| match e {
            Error::Auth(m) => Error::Auth(format!("namespace {}: {}", namespace, m)),
            other => other,
        })
    }

    async fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        let mut tags = self.registry().list_tags(repository).await?;
        tags.sort();
        Ok(tags)
    }

    async fn delete_manifest(&self, repository: &str, reference: &str) -> Result<()> {
        if is_digest(reference) {
            return self.registry().delete_manifest(repository, reference).await;
        }
        match self.registry().manifest_exist(repository, reference).await? {
            Some(digest) => self.registry().delete_manifest(repository, &digest).await,
            None => Ok(()),
        }
    }

    async fn delete_tag(&self, repository: &str, tag: &str) -> Result<()> {
        self.registry().delete_tag(repository, tag).await
    }
}

/// The first path component of a repository name.
pub fn namespace_of(repository: &str) -> &str {
    repository.split('/').next().unwrap_or(repository)
}

/// Shared pieces every adapter of one engine is built from.
#[derive(Clone)]
pub struct AdapterContext {
    pub transport: Transport,
    pub retry_policy: RetryPolicy,
    pub token_rewrite: Option<TokenUrlRewrite>,
}

impl Default for AdapterContext {
    fn default() -> Self {
        AdapterContext {
            transport: Transport::new(),
            retry_policy: RetryPolicy::default(),
            token_rewrite: None,
        }
    }
}

impl AdapterContext {
    pub fn deadline(&self) -> Duration {
        self.retry_policy.deadline
    }

    /// Plain client for vendor APIs, without the V2 authorizer.
    pub fn api_client(&self, target: &Target) -> HttpCli {
        HttpCli::new(self.transport.client(target.insecure)).with_policy(self.retry_policy.clone())
    }

    /// V2 client for `url` authorized through challenge discovery, with any
    /// extra modifiers run before the authorizer.
    pub fn registry_for(
        &self,
        target: &Target,
        url: &str,
        extra: Vec<Arc<dyn Modifier>>,
    ) -> Result<HttpRegistry> {
        let base = HttpRegistry::new(url, self.api_client(target))?;
        let authorizer = StandardAuthorizer::new(
            self.transport.client(target.insecure),
            base.registry_uri().clone(),
            target.credential.clone(),
        )
        .with_token_rewrite(self.token_rewrite.clone())
        .with_deadline(self.deadline());

        let mut client = self.api_client(target);
        for m in extra {
            client = client.with_modifier(m);
        }
        client = client.with_modifier(Arc::new(authorizer));
        HttpRegistry::new(url, client)
    }
}

/// Fixed headers for calls to one vendor API host.
pub(crate) struct ApiHeaders {
    authority: Option<http::uri::Authority>,
    headers: http::HeaderMap,
}

impl ApiHeaders {
    pub(crate) fn new(api_base: &str) -> Result<ApiHeaders> {
        Ok(ApiHeaders {
            authority: api_base.parse::<http::Uri>()?.authority().cloned(),
            headers: http::HeaderMap::new(),
        })
    }

    pub(crate) fn with(mut self, name: http::header::HeaderName, value: http::HeaderValue) -> ApiHeaders {
        self.headers.insert(name, value);
        self
    }
}

#[async_trait::async_trait]
impl Modifier for ApiHeaders {
    async fn modify(&self, request: &mut http::Request<hyper::Body>) -> Result<()> {
        if request.uri().authority() == self.authority.as_ref() {
            for (name, value) in self.headers.iter() {
                request.headers_mut().insert(name.clone(), value.clone());
            }
        }
        Ok(())
    }
}

pub type AdapterFactory = fn(&Target, &AdapterContext) -> Result<Arc<dyn Adapter>>;

struct FactoryEntry {
    create: AdapterFactory,
    info: fn() -> AdapterInfo,
}

/// Adapter factories keyed by registry type.
pub struct AdapterRegistry {
    factories: BTreeMap<RegistryType, FactoryEntry>,
    context: AdapterContext,
}

impl AdapterRegistry {
    pub fn new(context: AdapterContext) -> AdapterRegistry {
        AdapterRegistry {
            factories: BTreeMap::new(),
            context,
        }
    }

    /// A registry with every built-in adapter registered.
    pub fn with_defaults(context: AdapterContext) -> AdapterRegistry {
        let mut r = AdapterRegistry::new(context);
        r.register(RegistryType::DockerRegistry, native::create, native::info);
        r.register(RegistryType::Harbor, harbor::create, harbor::info);
        r.register(RegistryType::DockerHub, dockerhub::create, dockerhub::info);
        r.register(RegistryType::Gitlab, gitlab::create, gitlab::info);
        r.register(RegistryType::GithubGhcr, ghcr::create, ghcr::info);
        r.register(RegistryType::VolcengineCr, volcengine::create, volcengine::info);
        r
    }

    pub fn register(
        &mut self,
        registry_type: RegistryType,
        create: AdapterFactory,
        info: fn() -> AdapterInfo,
    ) {
        self.factories
            .insert(registry_type, FactoryEntry { create, info });
    }

    pub fn supported_types(&self) -> Vec<RegistryType> {
        self.factories.keys().copied().collect()
    }

    pub fn info(&self, registry_type: RegistryType) -> Result<AdapterInfo> {
        self.factories
            .get(&registry_type)
            .map(|f| (f.info)())
            .ok_or_else(|| unsupported(registry_type))
    }

    pub fn context(&self) -> &AdapterContext {
        &self.context
    }

    pub fn create(&self, target: &Target) -> Result<Arc<dyn Adapter>> {
        let entry = self
            .factories
            .get(&target.registry_type)
            .ok_or_else(|| unsupported(target.registry_type))?;
        (entry.create)(target, &self.context)
    }
}

fn unsupported(registry_type: RegistryType) -> Error {
    Error::Configuration(format!("no adapter registered for {}", registry_type))
}
