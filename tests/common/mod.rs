#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};

use registry_replication::config::Settings;
use registry_replication::container_specs::{sha256_digest, MEDIA_TYPE_SCHEMA2};
use registry_replication::model::{Credential, Policy, Target};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Counters {
    pub blob_heads: usize,
    pub blob_gets: usize,
    pub blob_puts: usize,
    pub upload_posts: usize,
    pub manifest_heads: usize,
    pub manifest_gets: usize,
    pub manifest_puts: usize,
    pub manifest_deletes: usize,
    pub project_creates: usize,
    pub upload_cancels: usize,
    pub token_requests: usize,
    pub unauthorized: usize,
    pub faults_served: usize,
}

/// A canned error answered instead of the real handler.
struct Fault {
    method: Method,
    path_contains: String,
    status: StatusCode,
    remaining: usize,
    retry_after: Option<u64>,
}

/// Token service guarding every `/v2/` route with bearer challenges.
struct TokenAuth {
    basic: String,
    issued: usize,
    valid: BTreeSet<String>,
}

#[derive(Default)]
struct State {
    /// (repository, tag or digest) -> (media type, payload)
    manifests: HashMap<(String, String), (String, Bytes)>,
    blobs: HashMap<(String, String), Bytes>,
    uploads: HashMap<String, String>,
    next_upload: usize,
    counters: Counters,
    blob_delay: Option<Duration>,
    harbor: bool,
    projects: BTreeSet<String>,
    /// Project creations answered with 409 after creating the project anyway,
    /// the way a concurrent creator would leave it.
    project_races: usize,
    faults: Vec<Fault>,
    auth: Option<TokenAuth>,
}

impl State {
    fn repositories(&self) -> Vec<String> {
        let repos: BTreeSet<String> = self.manifests.keys().map(|(r, _)| r.clone()).collect();
        repos.into_iter().collect()
    }

    fn tags(&self, repository: &str) -> Option<Vec<String>> {
        let mut tags: Vec<String> = self
            .manifests
            .keys()
            .filter(|(r, reference)| r == repository && !reference.starts_with("sha256:"))
            .map(|(_, t)| t.clone())
            .collect();
        if tags.is_empty()
            && !self.manifests.keys().any(|(r, _)| r == repository)
            && !self.blobs.keys().any(|(r, _)| r == repository)
        {
            return None;
        }
        tags.sort();
        Some(tags)
    }
}

/// An in-process Docker Registry V2, optionally with Harbor's project API.
#[derive(Clone)]
pub struct MockRegistry {
    addr: SocketAddr,
    state: Arc<Mutex<State>>,
}

pub struct Image {
    pub digest: String,
    pub layers: Vec<String>,
    pub config: String,
}

impl MockRegistry {
    pub fn start() -> MockRegistry {
        MockRegistry::start_with(false)
    }

    pub fn start_harbor() -> MockRegistry {
        MockRegistry::start_with(true)
    }

    fn start_with(harbor: bool) -> MockRegistry {
        let state = Arc::new(Mutex::new(State {
            harbor,
            ..Default::default()
        }));
        let service_state = state.clone();
        let make = make_service_fn(move |_| {
            let state = service_state.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let state = state.clone();
                    async move { Ok::<_, Infallible>(handle(state, req).await) }
                }))
            }
        });
        let server = Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0))).serve(make);
        let addr = server.local_addr();
        tokio::spawn(server);
        MockRegistry { addr, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn counters(&self) -> Counters {
        self.state().counters.clone()
    }

    pub fn reset_counters(&self) {
        self.state().counters = Counters::default();
    }

    pub fn set_blob_delay(&self, delay: Duration) {
        self.state().blob_delay = Some(delay);
    }

    pub fn set_project_races(&self, races: usize) {
        self.state().project_races = races;
    }

    pub fn has_project(&self, name: &str) -> bool {
        self.state().projects.contains(name)
    }

    pub fn add_project(&self, name: &str) {
        self.state().projects.insert(name.to_string());
    }

    pub fn has_blob(&self, repository: &str, digest: &str) -> bool {
        self.state()
            .blobs
            .contains_key(&(repository.to_string(), digest.to_string()))
    }

    pub fn tag_digest(&self, repository: &str, tag: &str) -> Option<String> {
        self.state()
            .manifests
            .get(&(repository.to_string(), tag.to_string()))
            .map(|(_, payload)| sha256_digest(payload))
    }

    pub fn tags(&self, repository: &str) -> Vec<String> {
        self.state().tags(repository).unwrap_or_default()
    }

    /// Stores a schema2 image whose layers have the given contents.
    pub fn add_image(&self, repository: &str, tag: &str, layers: &[&[u8]]) -> Image {
        let mut state = self.state();
        let config_payload = Bytes::from(format!(
            r#"{{"architecture":"amd64","os":"linux","config":{{"Labels":{{"tag":"{}"}}}}}}"#,
            tag
        ));
        let config = sha256_digest(&config_payload);
        let config_size = config_payload.len();
        state
            .blobs
            .insert((repository.to_string(), config.clone()), config_payload);

        let mut descriptors = Vec::new();
        let mut digests = Vec::new();
        for layer in layers {
            let payload = Bytes::copy_from_slice(layer);
            let digest = sha256_digest(&payload);
            descriptors.push(serde_json::json!({
                "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                "size": payload.len(),
                "digest": digest,
            }));
            state
                .blobs
                .insert((repository.to_string(), digest.clone()), payload);
            digests.push(digest);
        }

        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_SCHEMA2,
            "config": {
                "mediaType": "application/vnd.docker.container.image.v1+json",
                "size": config_size,
                "digest": config,
            },
            "layers": descriptors,
        });
        let payload = Bytes::from(serde_json::to_vec(&manifest).unwrap());
        let digest = sha256_digest(&payload);
        state.manifests.insert(
            (repository.to_string(), tag.to_string()),
            (MEDIA_TYPE_SCHEMA2.to_string(), payload.clone()),
        );
        state.manifests.insert(
            (repository.to_string(), digest.clone()),
            (MEDIA_TYPE_SCHEMA2.to_string(), payload),
        );
        Image {
            digest,
            layers: digests,
            config,
        }
    }

    /// Answers the next `times` requests whose method is `method` and whose path
    /// contains `path_contains` with `status`.
    pub fn fail_next(
        &self,
        method: Method,
        path_contains: &str,
        status: StatusCode,
        times: usize,
        retry_after: Option<u64>,
    ) {
        self.state().faults.push(Fault {
            method,
            path_contains: path_contains.to_string(),
            status,
            remaining: times,
            retry_after,
        });
    }

    /// Puts `/v2/` behind a bearer token service at `/token` that accepts the
    /// given basic credentials.
    pub fn require_token(&self, user: &str, password: &str) {
        use base64::prelude::*;

        self.state().auth = Some(TokenAuth {
            basic: format!(
                "Basic {}",
                BASE64_STANDARD.encode(format!("{}:{}", user, password))
            ),
            issued: 0,
            valid: BTreeSet::new(),
        });
    }

    /// Every token handed out so far stops being accepted.
    pub fn revoke_tokens(&self) {
        if let Some(auth) = self.state().auth.as_mut() {
            auth.valid.clear();
        }
    }

    pub fn remove_tag(&self, repository: &str, tag: &str) {
        self.state()
            .manifests
            .remove(&(repository.to_string(), tag.to_string()));
    }
}

fn respond(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::empty())
        .unwrap()
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&value).unwrap()))
        .unwrap()
}

fn registry_error(status: StatusCode, code: &str) -> Response<Body> {
    json_response(
        status,
        serde_json::json!({"errors": [{"code": code, "message": code.to_lowercase()}]}),
    )
}

fn query_param(query: &str, key: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        if k == key {
            urlencoding::decode(v).ok().map(|v| v.into_owned())
        } else {
            None
        }
    })
}

/// Digests a manifest points at, split into blobs and child manifests.
fn manifest_references(payload: &[u8]) -> (Vec<String>, Vec<String>) {
    let value: serde_json::Value = match serde_json::from_slice(payload) {
        Ok(v) => v,
        Err(_) => return (Vec::new(), Vec::new()),
    };
    let digests = |key: &str| -> Vec<String> {
        value
            .get(key)
            .and_then(|e| e.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|d| d.get("digest").and_then(|e| e.as_str()))
                    .map(|e| e.to_string())
                    .collect()
            })
            .unwrap_or_default()
    };
    let mut blobs = digests("layers");
    if let Some(config) = value
        .get("config")
        .and_then(|c| c.get("digest"))
        .and_then(|e| e.as_str())
    {
        blobs.push(config.to_string());
    }
    (blobs, digests("manifests"))
}

fn take_fault(state: &Mutex<State>, method: &Method, path: &str) -> Option<(StatusCode, Option<u64>)> {
    let mut s = state.lock().unwrap();
    let fault = s
        .faults
        .iter_mut()
        .find(|f| f.remaining > 0 && &f.method == method && path.contains(f.path_contains.as_str()))?;
    fault.remaining -= 1;
    let answer = (fault.status, fault.retry_after);
    s.counters.faults_served += 1;
    Some(answer)
}

fn unauthorized(realm: &str) -> Response<Body> {
    Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .header(
            "www-authenticate",
            format!(r#"Bearer realm="{}",service="mock-registry""#, realm),
        )
        .body(Body::from(
            r#"{"errors":[{"code":"UNAUTHORIZED","message":"authentication required"}]}"#,
        ))
        .unwrap()
}

/// `None` when the request may go on to the registry routes.
fn check_token(state: &Mutex<State>, req: &Request<Body>, path: &str) -> Option<Response<Body>> {
    let mut s = state.lock().unwrap();
    let header = req
        .headers()
        .get("authorization")
        .and_then(|e| e.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let host = req
        .headers()
        .get("host")
        .and_then(|e| e.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let auth = s.auth.as_mut()?;

    if path == "/token" {
        if header != auth.basic {
            return Some(registry_error(StatusCode::UNAUTHORIZED, "UNAUTHORIZED"));
        }
        auth.issued += 1;
        let token = format!("tok-{}", auth.issued);
        auth.valid.insert(token.clone());
        s.counters.token_requests += 1;
        return Some(json_response(
            StatusCode::OK,
            serde_json::json!({"token": token, "expires_in": 300}),
        ));
    }
    if !path.starts_with("/v2/") {
        return None;
    }
    let accepted = header
        .strip_prefix("Bearer ")
        .map(|t| auth.valid.contains(t))
        .unwrap_or(false);
    if accepted {
        return None;
    }
    s.counters.unauthorized += 1;
    Some(unauthorized(&format!("http://{}/token", host)))
}

async fn handle(state: Arc<Mutex<State>>, req: Request<Body>) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or_default().to_string();

    if let Some((status, retry_after)) = take_fault(&state, &method, &path) {
        let _ = hyper::body::to_bytes(req.into_body()).await;
        let mut response = registry_error(status, "INJECTED");
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert("retry-after", secs.to_string().parse().unwrap());
        }
        return response;
    }
    if let Some(response) = check_token(&state, &req, &path) {
        let _ = hyper::body::to_bytes(req.into_body()).await;
        return response;
    }

    if let Some(api) = path.strip_prefix("/api/v2.0") {
        let api = api.to_string();
        return handle_harbor(state, req, method, &api, &query).await;
    }
    let rest = match path.strip_prefix("/v2/") {
        Some(r) => r.to_string(),
        None => return respond(StatusCode::NOT_FOUND),
    };
    if rest.is_empty() {
        return respond(StatusCode::OK);
    }
    if rest == "_catalog" {
        let repositories = state.lock().unwrap().repositories();
        return json_response(StatusCode::OK, serde_json::json!({ "repositories": repositories }));
    }

    if let Some(repository) = rest.strip_suffix("/tags/list") {
        let tags = state.lock().unwrap().tags(repository);
        return match tags {
            Some(tags) => json_response(
                StatusCode::OK,
                serde_json::json!({"name": repository, "tags": tags}),
            ),
            None => registry_error(StatusCode::NOT_FOUND, "NAME_UNKNOWN"),
        };
    }

    if let Some((repository, session)) = rest.split_once("/blobs/uploads/") {
        return handle_upload(state, req, method, repository.to_string(), session.to_string(), &query)
            .await;
    }

    if let Some((repository, digest)) = rest.split_once("/blobs/") {
        let key = (repository.to_string(), digest.to_string());
        let (blob, delay) = {
            let mut s = state.lock().unwrap();
            match method {
                Method::HEAD => s.counters.blob_heads += 1,
                Method::GET => s.counters.blob_gets += 1,
                _ => {}
            }
            (s.blobs.get(&key).cloned(), s.blob_delay)
        };
        return match (method, blob) {
            (Method::HEAD, Some(b)) => Response::builder()
                .status(StatusCode::OK)
                .header("content-length", b.len())
                .header("docker-content-digest", digest)
                .body(Body::empty())
                .unwrap(),
            (Method::GET, Some(b)) => {
                if let Some(d) = delay {
                    tokio::time::sleep(d).await;
                }
                Response::builder()
                    .status(StatusCode::OK)
                    .header("content-length", b.len())
                    .header("docker-content-digest", digest)
                    .body(Body::from(b))
                    .unwrap()
            }
            (Method::DELETE, Some(_)) => {
                state.lock().unwrap().blobs.remove(&key);
                respond(StatusCode::ACCEPTED)
            }
            _ => registry_error(StatusCode::NOT_FOUND, "BLOB_UNKNOWN"),
        };
    }

    if let Some((repository, reference)) = rest.split_once("/manifests/") {
        return handle_manifest(state, req, method, repository.to_string(), reference.to_string())
            .await;
    }

    respond(StatusCode::NOT_FOUND)
}

async fn handle_upload(
    state: Arc<Mutex<State>>,
    req: Request<Body>,
    method: Method,
    repository: String,
    session: String,
    query: &str,
) -> Response<Body> {
    match method {
        Method::POST => {
            let mut s = state.lock().unwrap();
            s.counters.upload_posts += 1;
            if let (Some(digest), Some(from)) =
                (query_param(query, "mount"), query_param(query, "from"))
            {
                if let Some(blob) = s.blobs.get(&(from, digest.clone())).cloned() {
                    s.blobs.insert((repository.clone(), digest.clone()), blob);
                    return Response::builder()
                        .status(StatusCode::CREATED)
                        .header("location", format!("/v2/{}/blobs/{}", repository, digest))
                        .body(Body::empty())
                        .unwrap();
                }
            }
            s.next_upload += 1;
            let id = format!("upload-{}", s.next_upload);
            s.uploads.insert(id.clone(), repository.clone());
            Response::builder()
                .status(StatusCode::ACCEPTED)
                .header("location", format!("/v2/{}/blobs/uploads/{}", repository, id))
                .header("docker-upload-uuid", id)
                .body(Body::empty())
                .unwrap()
        }
        Method::PUT => {
            let digest = match query_param(query, "digest") {
                Some(d) => d,
                None => return registry_error(StatusCode::BAD_REQUEST, "DIGEST_INVALID"),
            };
            if !state.lock().unwrap().uploads.contains_key(&session) {
                return registry_error(StatusCode::NOT_FOUND, "BLOB_UPLOAD_UNKNOWN");
            }
            let body = match hyper::body::to_bytes(req.into_body()).await {
                Ok(b) => b,
                Err(_) => return respond(StatusCode::BAD_REQUEST),
            };
            if sha256_digest(&body) != digest {
                return registry_error(StatusCode::BAD_REQUEST, "DIGEST_INVALID");
            }
            let mut s = state.lock().unwrap();
            s.uploads.remove(&session);
            s.counters.blob_puts += 1;
            s.blobs.insert((repository.clone(), digest.clone()), body);
            Response::builder()
                .status(StatusCode::CREATED)
                .header("location", format!("/v2/{}/blobs/{}", repository, digest))
                .header("docker-content-digest", digest)
                .body(Body::empty())
                .unwrap()
        }
        Method::DELETE => {
            let mut s = state.lock().unwrap();
            if s.uploads.remove(&session).is_some() {
                s.counters.upload_cancels += 1;
            }
            respond(StatusCode::NO_CONTENT)
        }
        _ => respond(StatusCode::METHOD_NOT_ALLOWED),
    }
}

async fn handle_manifest(
    state: Arc<Mutex<State>>,
    req: Request<Body>,
    method: Method,
    repository: String,
    reference: String,
) -> Response<Body> {
    let key = (repository.clone(), reference.clone());
    match method {
        Method::HEAD | Method::GET => {
            let found = {
                let mut s = state.lock().unwrap();
                if method == Method::HEAD {
                    s.counters.manifest_heads += 1;
                } else {
                    s.counters.manifest_gets += 1;
                }
                s.manifests.get(&key).cloned()
            };
            match found {
                None => registry_error(StatusCode::NOT_FOUND, "MANIFEST_UNKNOWN"),
                Some((media_type, payload)) => {
                    let builder = Response::builder()
                        .status(StatusCode::OK)
                        .header("content-type", media_type)
                        .header("content-length", payload.len())
                        .header("docker-content-digest", sha256_digest(&payload));
                    if method == Method::HEAD {
                        builder.body(Body::empty()).unwrap()
                    } else {
                        builder.body(Body::from(payload)).unwrap()
                    }
                }
            }
        }
        Method::PUT => {
            let media_type = req
                .headers()
                .get("content-type")
                .and_then(|e| e.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let payload = match hyper::body::to_bytes(req.into_body()).await {
                Ok(b) => b,
                Err(_) => return respond(StatusCode::BAD_REQUEST),
            };
            let digest = sha256_digest(&payload);
            let (blobs, children) = manifest_references(&payload);
            let mut s = state.lock().unwrap();
            s.counters.manifest_puts += 1;
            if blobs
                .iter()
                .any(|b| !s.blobs.contains_key(&(repository.clone(), b.clone())))
            {
                return registry_error(StatusCode::BAD_REQUEST, "MANIFEST_BLOB_UNKNOWN");
            }
            if children
                .iter()
                .any(|c| !s.manifests.contains_key(&(repository.clone(), c.clone())))
            {
                return registry_error(StatusCode::BAD_REQUEST, "MANIFEST_UNKNOWN");
            }
            s.manifests
                .insert(key, (media_type.clone(), payload.clone()));
            s.manifests
                .insert((repository.clone(), digest.clone()), (media_type, payload));
            Response::builder()
                .status(StatusCode::CREATED)
                .header("location", format!("/v2/{}/manifests/{}", repository, digest))
                .header("docker-content-digest", digest)
                .body(Body::empty())
                .unwrap()
        }
        Method::DELETE => {
            let mut s = state.lock().unwrap();
            s.counters.manifest_deletes += 1;
            let before = s.manifests.len();
            s.manifests
                .retain(|(r, _), (_, payload)| r != &repository || sha256_digest(payload) != reference);
            if s.manifests.len() == before {
                registry_error(StatusCode::NOT_FOUND, "MANIFEST_UNKNOWN")
            } else {
                respond(StatusCode::ACCEPTED)
            }
        }
        _ => respond(StatusCode::METHOD_NOT_ALLOWED),
    }
}

async fn handle_harbor(
    state: Arc<Mutex<State>>,
    req: Request<Body>,
    method: Method,
    api: &str,
    query: &str,
) -> Response<Body> {
    if !state.lock().unwrap().harbor {
        return respond(StatusCode::NOT_FOUND);
    }
    match (method, api) {
        (Method::GET, "/projects") => {
            let s = state.lock().unwrap();
            let name = query_param(query, "name");
            // Harbor matches the name query fuzzily.
            let found: Vec<serde_json::Value> = s
                .projects
                .iter()
                .filter(|p| name.as_ref().map(|n| p.contains(n.as_str())).unwrap_or(true))
                .map(|p| serde_json::json!({"name": p, "current_user_role_id": 1}))
                .collect();
            json_response(StatusCode::OK, serde_json::Value::Array(found))
        }
        (Method::POST, "/projects") => {
            let body = hyper::body::to_bytes(req.into_body())
                .await
                .unwrap_or_default();
            let name = serde_json::from_slice::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v.get("project_name").and_then(|e| e.as_str()).map(|e| e.to_string()));
            let name = match name {
                Some(n) => n,
                None => return respond(StatusCode::BAD_REQUEST),
            };
            let mut s = state.lock().unwrap();
            s.counters.project_creates += 1;
            if s.project_races > 0 {
                s.project_races -= 1;
                s.projects.insert(name);
                return registry_error(StatusCode::CONFLICT, "CONFLICT");
            }
            if !s.projects.insert(name) {
                return registry_error(StatusCode::CONFLICT, "CONFLICT");
            }
            respond(StatusCode::CREATED)
        }
        _ => respond(StatusCode::NOT_FOUND),
    }
}

/// Settings for an engine replicating from `local` to the target with id 1.
pub fn settings(local: &MockRegistry, target: Target, policy: Policy) -> Settings {
    Settings {
        max_job_workers: 2,
        local_registry_url: local.url(),
        retrigger_window_ms: 0,
        request_timeout_secs: 10,
        registries: vec![target],
        policies: vec![policy],
        ..Settings::default()
    }
}

pub fn target(registry_type: &str, url: &str) -> Target {
    serde_json::from_value(serde_json::json!({
        "id": 1,
        "name": "remote",
        "type": registry_type,
        "url": url,
    }))
    .unwrap()
}

pub fn target_with_credential(registry_type: &str, url: &str, user: &str, password: &str) -> Target {
    let mut target = target(registry_type, url);
    target.credential = Some(Credential {
        access_key: user.to_string(),
        access_secret: password.to_string(),
    });
    target
}

pub fn policy(filters: serde_json::Value) -> Policy {
    serde_json::from_value(serde_json::json!({
        "id": 1,
        "name": "mirror",
        "target_id": 1,
        "filters": filters,
    }))
    .unwrap()
}
