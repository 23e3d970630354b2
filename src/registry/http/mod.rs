mod blob;
mod copy_operations;
pub mod http_cli;
pub(crate) mod util;

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use http::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use http::{Method, StatusCode, Uri};
use hyper::Body;
use serde::Deserialize;

use crate::container_specs::{normalize_content_type, sha256_digest, RawManifest, ACCEPTED_MANIFEST_TYPES};
use crate::error::{Error, Result};

pub use self::http_cli::{HttpCli, HyperClient, Modifier, RequestSummary, RetryPolicy, Transport};
use self::util::{error_from_response, parse_link_next, read_body_bytes, read_json};

pub(crate) const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";

/// A V2 registry reached through an [`HttpCli`] carrying its authorizer.
#[derive(Clone)]
pub struct HttpRegistry {
    registry_uri: Uri,
    http_client: HttpCli,
}

#[derive(Deserialize)]
struct CatalogPage {
    #[serde(default)]
    repositories: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct TagsPage {
    #[serde(default)]
    tags: Option<Vec<String>>,
}

fn digest_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(DOCKER_CONTENT_DIGEST)
        .and_then(|e| e.to_str().ok())
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty())
}

impl HttpRegistry {
    /// `registry_base` may omit the scheme, https is assumed then.
    pub fn new<S: AsRef<str>>(registry_base: S, http_client: HttpCli) -> Result<HttpRegistry> {
        let base = registry_base.as_ref().trim_end_matches('/');
        let mut uri_parts = base.parse::<Uri>()?.into_parts();
        if uri_parts.scheme.is_none() {
            uri_parts.scheme = Some(http::uri::Scheme::HTTPS);
        }
        if uri_parts.authority.is_none() {
            return Err(Error::Configuration(format!(
                "registry url {:?} has no host",
                registry_base.as_ref()
            )));
        }
        uri_parts.path_and_query = Some(http::uri::PathAndQuery::from_static("/"));
        Ok(HttpRegistry {
            registry_uri: Uri::from_parts(uri_parts)?,
            http_client,
        })
    }

    pub fn registry_uri(&self) -> &Uri {
        &self.registry_uri
    }

    pub fn http_client(&self) -> &HttpCli {
        &self.http_client
    }

    /// Two registries share an endpoint when scheme and authority match.
    pub fn same_endpoint(&self, other: &HttpRegistry) -> bool {
        self.registry_uri.scheme() == other.registry_uri.scheme()
            && self.registry_uri.authority() == other.registry_uri.authority()
    }

    pub(crate) fn v2_from_path<S: AsRef<str>>(&self, path: S) -> Result<Uri> {
        let path_ext = path.as_ref();
        if !path_ext.is_empty() && !path_ext.starts_with('/') {
            return Err(Error::Internal(format!(
                "invalid path reference {:?}, should start with a /",
                path_ext
            )));
        }
        let mut uri_builder = self.registry_uri.clone().into_parts();
        uri_builder.path_and_query = Some(format!("/v2{}", path_ext).try_into()?);
        Ok(Uri::from_parts(uri_builder)?)
    }

    pub(crate) fn repository_uri_from_path<S: AsRef<str>>(
        &self,
        repository: &str,
        path: S,
    ) -> Result<Uri> {
        let path_ext = path.as_ref();
        if !path_ext.starts_with('/') {
            return Err(Error::Internal(format!(
                "invalid path reference {:?}, should start with a /",
                path_ext
            )));
        }
        if repository.is_empty() || repository.starts_with('/') {
            return Err(Error::Configuration(format!(
                "invalid repository name {:?}",
                repository
            )));
        }
        self.v2_from_path(format!("/{}{}", repository, path_ext))
    }

    async fn manifest_request(
        &self,
        uri: &Uri,
        method: Method,
        accept: &[&str],
    ) -> Result<hyper::Response<Body>> {
        let accept = accept.join(", ");
        self.http_client
            .request(uri, (method, accept), |(method, accept), c| async move {
                c.method(method)
                    .header(ACCEPT, accept)
                    .body(Body::empty())
                    .map_err(|e| e.into())
            })
            .await
    }

    fn catalog_pages(&self, first: Uri) -> BoxStream<'_, Result<Vec<String>>> {
        stream::try_unfold(Some(first), move |next| async move {
            let uri = match next {
                None => return Ok(None),
                Some(u) => u,
            };
            let response = self.http_client.request_simple(&uri, Method::GET).await?;
            if !response.status().is_success() {
                return Err(error_from_response(response).await);
            }
            let next = parse_link_next(response.headers(), &uri)?;
            let page: CatalogPage = read_json(response).await?;
            Ok(Some((page.repositories.unwrap_or_default(), next)))
        })
        .boxed()
    }
}

#[async_trait::async_trait]
impl super::ManifestStore for HttpRegistry {
    async fn ping(&self) -> Result<()> {
        let uri = self.v2_from_path("/")?;
        let response = self.http_client.request_simple(&uri, Method::GET).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(error_from_response(response).await)
        }
    }

    fn catalog(&self, page_size: usize) -> BoxStream<'_, Result<String>> {
        let first = match self.v2_from_path(format!("/_catalog?n={}", page_size.max(1))) {
            Ok(u) => u,
            Err(e) => return stream::once(async move { Err(e) }).boxed(),
        };
        self.catalog_pages(first)
            .map_ok(|page| stream::iter(page.into_iter().map(Ok)))
            .try_flatten()
            .boxed()
    }

    async fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        let mut tags = Vec::new();
        let mut next = Some(self.repository_uri_from_path(repository, "/tags/list")?);
        while let Some(uri) = next.take() {
            let response = self.http_client.request_simple(&uri, Method::GET).await?;
            match response.status() {
                s if s.is_success() => {}
                StatusCode::NOT_FOUND => {
                    return Err(Error::NotFound(format!("repository {}", repository)))
                }
                _ => return Err(error_from_response(response).await),
            }
            next = parse_link_next(response.headers(), &uri)?;
            let page: TagsPage = read_json(response).await?;
            tags.extend(page.tags.unwrap_or_default());
        }
        Ok(tags)
    }

    async fn manifest_exist(&self, repository: &str, reference: &str) -> Result<Option<String>> {
        let uri = self.repository_uri_from_path(repository, format!("/manifests/{}", reference))?;
        let response = self
            .manifest_request(&uri, Method::HEAD, ACCEPTED_MANIFEST_TYPES)
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => match digest_header(response.headers()) {
                Some(d) => Ok(Some(d)),
                // Some registries omit the digest on HEAD, hash the body instead.
                None => self
                    .pull_manifest(repository, reference, ACCEPTED_MANIFEST_TYPES)
                    .await
                    .map(|m| Some(m.digest)),
            },
            _ => Err(error_from_response(response).await),
        }
    }

    async fn pull_manifest(
        &self,
        repository: &str,
        reference: &str,
        accept: &[&str],
    ) -> Result<RawManifest> {
        let uri = self.repository_uri_from_path(repository, format!("/manifests/{}", reference))?;
        let response = self.manifest_request(&uri, Method::GET, accept).await?;
        match response.status() {
            s if s.is_success() => {}
            StatusCode::NOT_FOUND => {
                return Err(Error::NotFound(format!(
                    "manifest {}:{}",
                    repository, reference
                )))
            }
            _ => return Err(error_from_response(response).await),
        }
        let media_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|e| e.to_str().ok())
            .map(normalize_content_type)
            .unwrap_or_default()
            .to_string();
        let digest = digest_header(response.headers());
        let payload = read_body_bytes(response).await?;
        let digest = digest.unwrap_or_else(|| sha256_digest(&payload));
        Ok(RawManifest {
            digest,
            media_type,
            payload,
        })
    }

    async fn push_manifest(
        &self,
        repository: &str,
        reference: &str,
        media_type: &str,
        payload: Bytes,
    ) -> Result<String> {
        let uri = self.repository_uri_from_path(repository, format!("/manifests/{}", reference))?;
        let response = self
            .http_client
            .request(
                &uri,
                (media_type.to_string(), payload.clone()),
                |(media_type, payload), c| async move {
                    c.method(Method::PUT)
                        .header(CONTENT_TYPE, media_type)
                        .body(Body::from(payload))
                        .map_err(|e| e.into())
                },
            )
            .await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        let digest = digest_header(response.headers()).unwrap_or_else(|| sha256_digest(&payload));
        tracing::debug!(
            repository,
            reference,
            digest = digest.as_str(),
            "uploaded manifest"
        );
        Ok(digest)
    }

    async fn delete_manifest(&self, repository: &str, digest: &str) -> Result<()> {
        let uri = self.repository_uri_from_path(repository, format!("/manifests/{}", digest))?;
        let response = self.http_client.request_simple(&uri, Method::DELETE).await?;
        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            _ => Err(error_from_response(response).await),
        }
    }
}
