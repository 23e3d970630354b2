//! Volcengine Container Registry. Enumeration, namespace creation and tag
//! deletion go through the signed OpenAPI, docker credentials are short lived
//! tokens issued by `GetAuthorizationToken`.

mod signer;

pub use signer::Signer;

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use http::{Method, Request, Response, Uri};
use hyper::Body;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;

use super::filter::{collect_resources, name_pattern};
use super::{namespace_of, Adapter, AdapterContext, AdapterInfo, LimitedRunner};
use crate::error::{Error, Result};
use crate::glob;
use crate::model::{Artifact, Credential, Filter, FilterType, RegistryType, Resource, Target, TriggerType};
use crate::registry::auth::{StandardAuthorizer, LATENCY_SLACK_SECS};
use crate::registry::http::util::{error_from_response, read_body_bytes};
use crate::registry::http::{HttpCli, HyperClient, Modifier, RequestSummary};
use crate::registry::HttpRegistry;

pub const DEFAULT_API_URL: &str = "https://open.volcengineapi.com";
const API_VERSION: &str = "2022-05-12";
const SERVICE: &str = "cr";
const PAGE_SIZE: usize = 100;
const REGISTRY_DOMAIN: &str = ".cr.volces.com";

pub fn info() -> AdapterInfo {
    AdapterInfo::images(
        RegistryType::VolcengineCr,
        &[FilterType::Name, FilterType::Tag],
        &[TriggerType::Manual, TriggerType::Scheduled],
    )
}

pub fn create(target: &Target, ctx: &AdapterContext) -> Result<Arc<dyn Adapter>> {
    Ok(Arc::new(VolcengineAdapter::new(target, ctx)?))
}

/// `{instance}-{region}.cr.volces.com`, where the region itself is `xx-name`.
pub fn parse_registry_host(host: &str) -> Option<(String, String)> {
    let prefix = host.strip_suffix(REGISTRY_DOMAIN)?;
    let mut parts = prefix.rsplitn(3, '-');
    let city = parts.next()?;
    let country = parts.next()?;
    let instance = parts.next()?;
    if city.is_empty() || country.is_empty() || instance.is_empty() {
        return None;
    }
    Some((instance.to_string(), format!("{}-{}", country, city)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ApiError {
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ResponseMetadata {
    #[serde(default)]
    request_id: String,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Envelope<T> {
    #[serde(default)]
    response_metadata: ResponseMetadata,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Page<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
    #[serde(default)]
    total_count: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Named {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TagItem {
    name: String,
    #[serde(default)]
    digest: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AuthorizationToken {
    username: String,
    token: String,
    expire_time: DateTime<Utc>,
}

fn api_error(action: &str, e: ApiError) -> Error {
    let detail = format!("{} failed with {}: {}", action, e.code, e.message);
    if e.code.contains("AlreadyExists") {
        Error::Conflict(detail)
    } else if e.code.contains("NotFound") {
        Error::NotFound(detail)
    } else if e.code.contains("AccessDenied")
        || e.code.contains("Unauthorized")
        || e.code.contains("Signature")
        || e.code.contains("AccessKey")
    {
        Error::Auth(detail)
    } else {
        Error::Internal(detail)
    }
}

/// Signed client for the registry OpenAPI of one instance.
struct OpenApi {
    client: HttpCli,
    endpoint: Uri,
    host: String,
    signer: Signer,
    instance: String,
}

impl OpenApi {
    async fn call<T: DeserializeOwned>(&self, action: &str, mut body: serde_json::Value) -> Result<T> {
        body["Registry"] = json!(self.instance);
        let query = format!("Action={}&Version={}", action, API_VERSION);
        let uri: Uri = format!(
            "{}/?{}",
            self.endpoint.to_string().trim_end_matches('/'),
            query
        )
        .parse()?;
        let payload = bytes::Bytes::from(serde_json::to_vec(&body)?);
        let signer = self.signer.clone();
        let host = self.host.clone();

        let response = self
            .client
            .request(&uri, payload, move |payload, mut c| {
                let signed = signer.sign(
                    "POST",
                    &host,
                    "/",
                    &query,
                    "application/json",
                    &payload,
                    Utc::now(),
                );
                async move {
                    for (name, value) in signed? {
                        c = c.header(name, value);
                    }
                    c.method(Method::POST)
                        .header(http::header::CONTENT_TYPE, "application/json")
                        .body(Body::from(payload))
                        .map_err(|e| e.into())
                }
            })
            .await?;

        let status = response.status();
        if status.is_server_error() || status == http::StatusCode::TOO_MANY_REQUESTS {
            return Err(error_from_response(response).await);
        }
        let raw = read_body_bytes(response).await?;
        let envelope: Envelope<T> = serde_json::from_slice(&raw).map_err(|e| {
            Error::registry(
                status,
                &format!("unreadable {} response ({}): {}", action, e, String::from_utf8_lossy(&raw)),
            )
        })?;
        if let Some(e) = envelope.response_metadata.error {
            tracing::debug!(
                "{} request {} failed",
                action,
                envelope.response_metadata.request_id
            );
            return Err(api_error(action, e));
        }
        envelope
            .result
            .ok_or_else(|| Error::registry(status, &format!("{} returned no result", action)))
    }

    /// Walks `PageNumber` until `TotalCount` items were seen or a page comes back empty.
    async fn list_all<T: DeserializeOwned>(&self, action: &str, body: serde_json::Value) -> Result<Vec<T>> {
        let mut out = Vec::new();
        let mut page = 1;
        loop {
            let mut request = body.clone();
            request["PageNumber"] = json!(page);
            request["PageSize"] = json!(PAGE_SIZE);
            let result: Page<T> = self.call(action, request).await?;
            let empty = result.items.is_empty();
            out.extend(result.items);
            if empty || out.len() >= result.total_count {
                return Ok(out);
            }
            page += 1;
        }
    }
}

struct IssuedCredential {
    expires_at: DateTime<Utc>,
    authorizer: Arc<StandardAuthorizer>,
}

/// Authorizes V2 calls with a temporary credential from
/// `GetAuthorizationToken`, renewed shortly before it expires.
struct TokenAuthorizer {
    api: Arc<OpenApi>,
    client: HyperClient,
    registry_uri: Uri,
    deadline: std::time::Duration,
    slack: ChronoDuration,
    current: Mutex<Option<IssuedCredential>>,
}

impl TokenAuthorizer {
    async fn authorizer(&self) -> Result<Arc<StandardAuthorizer>> {
        let mut current = self.current.lock().await;
        let now = Utc::now();
        if let Some(c) = current.as_ref() {
            if now + self.slack < c.expires_at {
                return Ok(c.authorizer.clone());
            }
        }
        let token: AuthorizationToken = self.api.call("GetAuthorizationToken", json!({})).await?;
        tracing::debug!(
            "issued registry token for {} valid until {}",
            self.registry_uri,
            token.expire_time
        );
        let authorizer = Arc::new(
            StandardAuthorizer::new(
                self.client.clone(),
                self.registry_uri.clone(),
                Some(Credential {
                    access_key: token.username,
                    access_secret: token.token,
                }),
            )
            .with_deadline(self.deadline),
        );
        *current = Some(IssuedCredential {
            expires_at: token.expire_time,
            authorizer: authorizer.clone(),
        });
        Ok(authorizer)
    }
}

#[async_trait::async_trait]
impl Modifier for TokenAuthorizer {
    async fn modify(&self, request: &mut Request<Body>) -> Result<()> {
        if request.uri().authority() != self.registry_uri.authority() {
            return Ok(());
        }
        self.authorizer().await?.modify(request).await
    }

    async fn on_unauthorized(
        &self,
        request: &RequestSummary,
        response: &Response<Body>,
    ) -> Result<bool> {
        let authorizer = match self.current.lock().await.as_ref() {
            Some(c) => c.authorizer.clone(),
            None => return Ok(false),
        };
        authorizer.on_unauthorized(request, response).await
    }
}

pub struct VolcengineAdapter {
    registry: HttpRegistry,
    api: Arc<OpenApi>,
    runner: LimitedRunner,
}

impl VolcengineAdapter {
    pub fn new(target: &Target, ctx: &AdapterContext) -> Result<VolcengineAdapter> {
        let registry_uri = target.url.parse::<Uri>()?;
        let parsed = registry_uri.host().and_then(parse_registry_host);
        let instance = target
            .option("instance")
            .map(str::to_string)
            .or_else(|| parsed.as_ref().map(|p| p.0.clone()))
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "cannot derive the volcengine instance from {}, set the 'instance' option",
                    target.url
                ))
            })?;
        let region = target
            .option("region")
            .map(str::to_string)
            .or_else(|| parsed.as_ref().map(|p| p.1.clone()))
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "cannot derive the volcengine region from {}, set the 'region' option",
                    target.url
                ))
            })?;
        let credential = target.credential.as_ref().ok_or_else(|| {
            Error::Configuration("volcengine targets need an access key pair".to_string())
        })?;

        let endpoint: Uri = target
            .option("api_url")
            .unwrap_or(DEFAULT_API_URL)
            .parse()?;
        let host = endpoint
            .authority()
            .map(|a| a.to_string())
            .ok_or_else(|| Error::Configuration(format!("api url {} has no host", endpoint)))?;
        let api = Arc::new(OpenApi {
            client: ctx.api_client(target),
            endpoint,
            host,
            signer: Signer::new(
                &credential.access_key,
                &credential.access_secret,
                &region,
                SERVICE,
            ),
            instance,
        });

        let base = HttpRegistry::new(&target.url, ctx.api_client(target))?;
        let authorizer = TokenAuthorizer {
            api: api.clone(),
            client: ctx.transport.client(target.insecure),
            registry_uri: base.registry_uri().clone(),
            deadline: ctx.deadline(),
            slack: ChronoDuration::seconds(LATENCY_SLACK_SECS),
            current: Mutex::new(None),
        };
        let registry = HttpRegistry::new(
            &target.url,
            ctx.api_client(target).with_modifier(Arc::new(authorizer)),
        )?;

        Ok(VolcengineAdapter {
            registry,
            api,
            runner: LimitedRunner::default(),
        })
    }

    fn split(repository: &str) -> Result<(&str, &str)> {
        match repository.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() => Ok((ns, name)),
            _ => Err(Error::Configuration(format!(
                "volcengine repositories are named <namespace>/<name>, got '{}'",
                repository
            ))),
        }
    }

    async fn namespaces(&self) -> Result<Vec<String>> {
        let items: Vec<Named> = self.api.list_all("ListNamespaces", json!({})).await?;
        Ok(items.into_iter().map(|n| n.name).collect())
    }

    async fn repositories(&self, namespace: &str) -> Result<Vec<String>> {
        let items: Vec<Named> = self
            .api
            .list_all(
                "ListRepositories",
                json!({ "Filter": { "Namespaces": [namespace] } }),
            )
            .await?;
        Ok(items
            .into_iter()
            .map(|r| format!("{}/{}", namespace, r.name))
            .collect())
    }

    async fn tags(&self, repository: &str) -> Result<Vec<TagItem>> {
        let (namespace, name) = Self::split(repository)?;
        self.api
            .list_all(
                "ListTags",
                json!({ "Namespace": namespace, "Repository": name }),
            )
            .await
    }

    async fn candidate_repositories(&self, filters: &[Filter]) -> Result<Vec<String>> {
        let pattern = name_pattern(filters);
        if let Some(paths) = pattern.and_then(glob::specific_paths) {
            return Ok(paths);
        }
        let namespaces = match pattern.and_then(glob::specific_namespaces) {
            Some(n) => n,
            None => self.namespaces().await?,
        };
        let per_namespace = self
            .runner
            .run(namespaces, |namespace| async move {
                match self.repositories(&namespace).await {
                    Err(e) if e.is_not_found() => Ok(Vec::new()),
                    other => other,
                }
            })
            .await?;
        Ok(per_namespace.into_iter().flatten().collect())
    }

    /// Create calls answered with `AlreadyExists` count as success.
    async fn create(&self, action: &str, body: serde_json::Value) -> Result<()> {
        match self.api.call::<serde_json::Value>(action, body).await {
            Ok(_) => Ok(()),
            Err(Error::Conflict(m)) => {
                tracing::debug!("{}", m);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait::async_trait]
impl Adapter for VolcengineAdapter {
    fn info(&self) -> AdapterInfo {
        info()
    }

    fn registry(&self) -> &HttpRegistry {
        &self.registry
    }

    async fn fetch_artifacts(&self, filters: &[Filter]) -> Result<Vec<Resource>> {
        let repositories = self.candidate_repositories(filters).await?;
        collect_resources(&self.runner, repositories, filters, |repository| async move {
            match self.tags(&repository).await {
                Ok(tags) => Ok(tags
                    .into_iter()
                    .map(|t| Artifact {
                        digest: t.digest,
                        ..Artifact::tagged(t.name)
                    })
                    .collect::<Vec<_>>()),
                Err(e) if e.is_not_found() => Ok(Vec::new()),
                Err(e) => Err(e),
            }
        })
        .await
    }

    async fn prepare_for_push(&self, resources: &[Resource]) -> Result<()> {
        let mut namespaces = BTreeSet::new();
        for r in resources {
            let (namespace, name) = Self::split(&r.repository)?;
            if namespaces.insert(namespace_of(&r.repository).to_string()) {
                self.create("CreateNamespace", json!({ "Name": namespace }))
                    .await?;
            }
            self.create(
                "CreateRepository",
                json!({ "Namespace": namespace, "Name": name }),
            )
            .await?;
        }
        Ok(())
    }

    async fn list_tags(&self, repository: &str) -> Result<Vec<String>> {
        let mut tags: Vec<String> = self
            .tags(repository)
            .await?
            .into_iter()
            .map(|t| t.name)
            .collect();
        tags.sort();
        Ok(tags)
    }

    async fn delete_tag(&self, repository: &str, tag: &str) -> Result<()> {
        let (namespace, name) = Self::split(repository)?;
        let _: serde_json::Value = self
            .api
            .call(
                "DeleteTags",
                json!({ "Namespace": namespace, "Repository": name, "Names": [tag] }),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_registry_host() {
        assert_eq!(
            parse_registry_host("my-team-cn-beijing.cr.volces.com"),
            Some(("my-team".to_string(), "cn-beijing".to_string()))
        );
        assert_eq!(parse_registry_host("cn-beijing.cr.volces.com"), None);
        assert_eq!(parse_registry_host("registry.example.com"), None);
    }

    #[test]
    fn test_envelope_error() {
        let e: Envelope<Page<Named>> = serde_json::from_str(
            r#"{"ResponseMetadata":{"RequestId":"r1","Action":"CreateNamespace","Error":{"Code":"AlreadyExists.Namespace","Message":"exists"}}}"#,
        )
        .unwrap();
        let err = api_error("CreateNamespace", e.response_metadata.error.unwrap());
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn test_page_and_token() {
        let e: Envelope<Page<TagItem>> = serde_json::from_str(
            r#"{"ResponseMetadata":{"RequestId":"r2"},"Result":{"Items":[{"Name":"v1","Digest":"sha256:aa"}],"TotalCount":1,"PageNumber":1,"PageSize":100}}"#,
        )
        .unwrap();
        let page = e.result.unwrap();
        assert_eq!(page.total_count, 1);
        assert_eq!(page.items[0].digest.as_deref(), Some("sha256:aa"));

        let t: AuthorizationToken = serde_json::from_str(
            r#"{"Username":"u","Token":"t","ExpireTime":"2024-03-01T10:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(t.username, "u");
        assert_eq!(t.expire_time.timestamp(), 1709287200);
    }

    #[test]
    fn test_adapter_requires_credentials() {
        let target = Target {
            id: 1,
            name: "volc".to_string(),
            registry_type: RegistryType::VolcengineCr,
            url: "https://acme-cn-beijing.cr.volces.com".to_string(),
            insecure: false,
            credential: None,
            options: Default::default(),
            health: Default::default(),
        };
        assert!(matches!(
            VolcengineAdapter::new(&target, &AdapterContext::default()),
            Err(Error::Configuration(_))
        ));
    }
}
