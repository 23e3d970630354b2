//! GitHub container registry. There is no catalog, so names have to be spelled
//! out, and tags are deleted through the GitHub Packages API.

use std::sync::Arc;

use http::header::{HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use http::{Method, StatusCode, Uri};
use serde::Deserialize;

use super::filter::{collect_resources, name_pattern};
use super::native::NativeAdapter;
use super::{Adapter, AdapterContext, AdapterInfo, ApiHeaders, LimitedRunner};
use crate::error::{Error, Result};
use crate::glob;
use crate::model::{Filter, FilterType, RegistryType, Resource, Target, TriggerType};
use crate::registry::http::util::{error_from_response, read_json};
use crate::registry::http::HttpCli;
use crate::registry::HttpRegistry;

pub const DEFAULT_API_URL: &str = "https://api.github.com";
const PER_PAGE: usize = 100;

pub fn info() -> AdapterInfo {
    AdapterInfo::images(
        RegistryType::GithubGhcr,
        &[FilterType::Name, FilterType::Tag],
        &[TriggerType::Manual, TriggerType::Scheduled],
    )
}

pub fn create(target: &Target, ctx: &AdapterContext) -> Result<Arc<dyn Adapter>> {
    Ok(Arc::new(GhcrAdapter::new(target, ctx)?))
}

#[derive(Debug, Default, Deserialize)]
struct ContainerMetadata {
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct VersionMetadata {
    #[serde(default)]
    container: ContainerMetadata,
}

#[derive(Debug, Deserialize)]
struct PackageVersion {
    id: i64,
    #[serde(default)]
    metadata: VersionMetadata,
}

pub struct GhcrAdapter {
    native: NativeAdapter,
    api: HttpCli,
    api_base: String,
    runner: LimitedRunner,
}

impl GhcrAdapter {
    pub fn new(target: &Target, ctx: &AdapterContext) -> Result<GhcrAdapter> {
        let native = NativeAdapter::new(target, ctx)?;
        let api_base = target
            .option("api_url")
            .unwrap_or(DEFAULT_API_URL)
            .trim_end_matches('/')
            .to_string();
        let mut headers = ApiHeaders::new(&api_base)?
            .with(ACCEPT, HeaderValue::from_static("application/vnd.github+json"))
            .with(USER_AGENT, HeaderValue::from_static("registry-replication"));
        if let Some(credential) = &target.credential {
            let mut header = HeaderValue::from_str(&format!("Bearer {}", credential.access_secret))
                .map_err(|e| Error::Configuration(format!("invalid github token: {}", e)))?;
            header.set_sensitive(true);
            headers = headers.with(AUTHORIZATION, header);
        }
        Ok(GhcrAdapter {
            native,
            api: ctx.api_client(target).with_modifier(Arc::new(headers)),
            api_base,
            runner: LimitedRunner::default(),
        })
    }

    fn api_uri(&self, path: &str) -> Result<Uri> {
        Ok(format!("{}{}", self.api_base, path).parse()?)
    }

    /// `owner/name/more` is package `name/more` owned by `owner`.
    fn split_package(repository: &str) -> Result<(&str, String)> {
        match repository.split_once('/') {
            Some((owner, package)) if !owner.is_empty() && !package.is_empty() => {
                Ok((owner, urlencoding::encode(package).into_owned()))
            }
            _ => Err(Error::Configuration(format!(
                "ghcr repositories are named <owner>/<package>, got '{}'",
                repository
            ))),
        }
    }

    /// Versions of the package, looked up as an organisation package first and
    /// a user package second. Returns the owner kind that answered.
    async fn versions(&self, owner: &str, package: &str) -> Result<(&'static str, Vec<PackageVersion>)> {
        for kind in ["orgs", "users"] {
            let mut versions = Vec::new();
            let mut page = 1;
            loop {
                let uri = self.api_uri(&format!(
                    "/{}/{}/packages/container/{}/versions?per_page={}&page={}",
                    kind, owner, package, PER_PAGE, page
                ))?;
                let response = self.api.request_simple(&uri, Method::GET).await?;
                match response.status() {
                    s if s.is_success() => {}
                    StatusCode::NOT_FOUND => break,
                    _ => return Err(error_from_response(response).await),
                }
                let items: Vec<PackageVersion> = read_json(response).await?;
                let done = items.len() < PER_PAGE;
                versions.extend(items);
                if done {
                    return Ok((kind, versions));
                }
                page += 1;
            }
        }
        Err(Error::NotFound(format!("package {}/{}", owner, package)))
    }
}

#[async_trait::async_trait]
impl Adapter for GhcrAdapter {
    fn info(&self) -> AdapterInfo {
        info()
    }

    fn registry(&self) -> &HttpRegistry {
        self.native.registry()
    }

    async fn fetch_artifacts(&self, filters: &[Filter]) -> Result<Vec<Resource>> {
        let repositories = match name_pattern(filters).and_then(glob::specific_paths) {
            Some(paths) => paths,
            None => {
                return Err(Error::Configuration(
                    "ghcr has no catalog, the name filter must list repositories explicitly"
                        .to_string(),
                ))
            }
        };
        collect_resources(&self.runner, repositories, filters, |repository| async move {
            self.native.list_artifacts(&repository).await
        })
        .await
    }

    /// Packages are created by the first push.
    async fn prepare_for_push(&self, _resources: &[Resource]) -> Result<()> {
        Ok(())
    }

    async fn delete_tag(&self, repository: &str, tag: &str) -> Result<()> {
        let (owner, package) = Self::split_package(repository)?;
        let (kind, versions) = self.versions(owner, &package).await?;
        let version = versions
            .into_iter()
            .find(|v| v.metadata.container.tags.iter().any(|t| t == tag))
            .ok_or_else(|| Error::NotFound(format!("{}:{}", repository, tag)))?;
        let uri = self.api_uri(&format!(
            "/{}/{}/packages/container/{}/versions/{}",
            kind, owner, package, version.id
        ))?;
        let response = self.api.request_simple(&uri, Method::DELETE).await?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(Error::NotFound(format!("{}:{}", repository, tag))),
            _ => Err(error_from_response(response).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_package() {
        let (owner, package) = GhcrAdapter::split_package("acme/tools/cli").unwrap();
        assert_eq!(owner, "acme");
        assert_eq!(package, "tools%2Fcli");
        assert!(GhcrAdapter::split_package("acme").is_err());
    }

    #[test]
    fn test_version_metadata() {
        let v: Vec<PackageVersion> = serde_json::from_str(
            r#"[{"id":7,"name":"sha256:aa","metadata":{"package_type":"container","container":{"tags":["v1","latest"]}}},{"id":8}]"#,
        )
        .unwrap();
        assert_eq!(v[0].id, 7);
        assert_eq!(v[0].metadata.container.tags, vec!["v1", "latest"]);
        assert!(v[1].metadata.container.tags.is_empty());
    }

    #[tokio::test]
    async fn test_wildcard_name_filter_is_rejected() {
        let target = Target {
            id: 1,
            name: "ghcr".to_string(),
            registry_type: RegistryType::GithubGhcr,
            url: "https://ghcr.io".to_string(),
            insecure: false,
            credential: None,
            options: Default::default(),
            health: Default::default(),
        };
        let adapter = GhcrAdapter::new(&target, &AdapterContext::default()).unwrap();
        let r = adapter
            .fetch_artifacts(&[Filter::Name {
                pattern: "acme/*".to_string(),
            }])
            .await;
        assert!(matches!(r, Err(Error::Configuration(_))));
    }
}
