//! Plain Docker Registry V2, enumerated through `/v2/_catalog`.

use std::sync::Arc;

use futures::TryStreamExt;

use super::filter::{collect_resources, name_pattern};
use super::{Adapter, AdapterContext, AdapterInfo, LimitedRunner};
use crate::error::Result;
use crate::glob;
use crate::model::{Artifact, Filter, FilterType, RegistryType, Resource, Target, TriggerType};
use crate::registry::{HttpRegistry, ManifestStore};

const CATALOG_PAGE_SIZE: usize = 100;

pub fn info() -> AdapterInfo {
    AdapterInfo::images(
        RegistryType::DockerRegistry,
        &[FilterType::Name, FilterType::Tag],
        &[TriggerType::Manual, TriggerType::Scheduled],
    )
}

pub fn create(target: &Target, ctx: &AdapterContext) -> Result<Arc<dyn Adapter>> {
    Ok(Arc::new(NativeAdapter::new(target, ctx)?))
}

pub struct NativeAdapter {
    registry: HttpRegistry,
    runner: LimitedRunner,
}

impl NativeAdapter {
    pub fn new(target: &Target, ctx: &AdapterContext) -> Result<NativeAdapter> {
        Ok(NativeAdapter::from_registry(ctx.registry_for(
            target,
            &target.url,
            Vec::new(),
        )?))
    }

    pub fn from_registry(registry: HttpRegistry) -> NativeAdapter {
        NativeAdapter {
            registry,
            runner: LimitedRunner::default(),
        }
    }

    /// Repositories a name filter can match. Literal patterns skip the catalog.
    pub async fn candidate_repositories(&self, filters: &[Filter]) -> Result<Vec<String>> {
        if let Some(paths) = name_pattern(filters).and_then(glob::specific_paths) {
            tracing::debug!("name filter is specific, skipping catalog: {:?}", paths);
            return Ok(paths);
        }
        self.registry
            .catalog(CATALOG_PAGE_SIZE)
            .try_collect()
            .await
    }

    pub async fn list_artifacts(&self, repository: &str) -> Result<Vec<Artifact>> {
        match self.registry.list_tags(repository).await {
            Ok(tags) => Ok(tags.into_iter().map(Artifact::tagged).collect()),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    pub async fn fetch_with_catalog(&self, filters: &[Filter]) -> Result<Vec<Resource>> {
        let repositories = self.candidate_repositories(filters).await?;
        collect_resources(&self.runner, repositories, filters, |repository| async move {
            self.list_artifacts(&repository).await
        })
        .await
    }
}

#[async_trait::async_trait]
impl Adapter for NativeAdapter {
    fn info(&self) -> AdapterInfo {
        info()
    }

    fn registry(&self) -> &HttpRegistry {
        &self.registry
    }

    async fn fetch_artifacts(&self, filters: &[Filter]) -> Result<Vec<Resource>> {
        self.fetch_with_catalog(filters).await
    }

    /// V2 registries create repositories on first push.
    async fn prepare_for_push(&self, _resources: &[Resource]) -> Result<()> {
        Ok(())
    }
}
