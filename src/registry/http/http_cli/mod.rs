pub(crate) mod authentication_flow;
mod private_impl;

use std::sync::Arc;
use std::time::Duration;

use http::{Method, Request, Response, StatusCode, Uri};
use hyper::{Body, Client};

use crate::error::{Error, Result};
use crate::registry::ratelimit::retry_after;

use self::private_impl::{run_single_request, NoVerification};
use super::util::resolve_location;

pub type HyperClient = Client<hyper_rustls::HttpsConnector<hyper::client::HttpConnector>>;

/// The pair of connection pools every adapter of an engine shares.
#[derive(Clone)]
pub struct Transport {
    secure: HyperClient,
    insecure: HyperClient,
}

impl Transport {
    pub fn new() -> Transport {
        Transport {
            secure: build_client(false),
            insecure: build_client(true),
        }
    }

    pub fn client(&self, insecure: bool) -> HyperClient {
        if insecure {
            self.insecure.clone()
        } else {
            self.secure.clone()
        }
    }
}

impl Default for Transport {
    fn default() -> Self {
        Transport::new()
    }
}

fn build_client(insecure: bool) -> HyperClient {
    use hyper_rustls::ConfigBuilderExt;

    let builder = rustls::ClientConfig::builder().with_safe_defaults();
    let tls = if insecure {
        builder
            .with_custom_certificate_verifier(Arc::new(NoVerification))
            .with_no_client_auth()
    } else {
        builder.with_webpki_roots().with_no_client_auth()
    };

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_tls_config(tls)
        .https_or_http()
        .enable_http1()
        .build();

    Client::builder().build::<_, hyper::Body>(https)
}

/// Method and uri of a request that came back unauthorized.
#[derive(Debug, Clone)]
pub struct RequestSummary {
    pub method: Method,
    pub uri: Uri,
}

/// Hook installed on an [`HttpCli`]: authorizers, rate limit guards and vendor
/// signers all mutate outgoing requests through this trait.
#[async_trait::async_trait]
pub trait Modifier: Send + Sync {
    async fn modify(&self, request: &mut Request<Body>) -> Result<()>;

    /// Called once per request on a 401. Returning `true` replays the request.
    async fn on_unauthorized(
        &self,
        _request: &RequestSummary,
        _response: &Response<Body>,
    ) -> Result<bool> {
        Ok(false)
    }

    fn observe(&self, _response: &Response<Body>) {}
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub factor: u32,
    pub max_delay: Duration,
    /// 429 replays, not counted against `max_retries`.
    pub rate_limit_retries: usize,
    pub max_redirects: usize,
    pub deadline: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            factor: 2,
            max_delay: Duration::from_secs(30),
            rate_limit_retries: 2,
            max_redirects: 10,
            deadline: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exp = u32::try_from(attempt).unwrap_or(u32::MAX);
        let multiplier = self.factor.checked_pow(exp).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Clone)]
pub struct HttpCli {
    inner_client: HyperClient,
    modifiers: Vec<Arc<dyn Modifier>>,
    policy: RetryPolicy,
}

impl HttpCli {
    pub fn new(inner_client: HyperClient) -> HttpCli {
        HttpCli {
            inner_client,
            modifiers: Vec::new(),
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_modifier(mut self, modifier: Arc<dyn Modifier>) -> HttpCli {
        self.modifiers.push(modifier);
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> HttpCli {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn inner_client(&self) -> &HyperClient {
        &self.inner_client
    }

    pub async fn request_simple(&self, uri: &Uri, method: Method) -> Result<Response<Body>> {
        self.request(uri, method, |method, c| async move {
            c.method(method).body(Body::empty()).map_err(|e| e.into())
        })
        .await
    }

    pub async fn request<Fut, F, B>(
        &self,
        uri: &Uri,
        context: B,
        complete_request: F,
    ) -> Result<Response<Body>>
    where
        F: Fn(B, http::request::Builder) -> Fut + Send + Sync,
        Fut: std::future::Future<Output = Result<Request<Body>>> + Send,
        B: Send + 'static + Sync + Clone,
    {
        self.request_with_deadline(uri, context, complete_request, self.policy.deadline)
            .await
    }

    /// Issues a request built by `complete_request`, rebuilding it for every attempt.
    ///
    /// Redirects are followed, 5xx and connection failures are retried with
    /// exponential back-off, a 429 waits for `Retry-After`, and a 401 gives the
    /// modifiers one chance to refresh credentials. Any other response is handed
    /// back to the caller untouched.
    pub async fn request_with_deadline<Fut, F, B>(
        &self,
        uri: &Uri,
        context: B,
        complete_request: F,
        deadline: Duration,
    ) -> Result<Response<Body>>
    where
        F: Fn(B, http::request::Builder) -> Fut + Send + Sync,
        Fut: std::future::Future<Output = Result<Request<Body>>> + Send,
        B: Send + 'static + Sync + Clone,
    {
        let origin = uri.authority().cloned();
        let mut uri = uri.clone();
        let mut attempt = 0;
        let mut redirects = 0;
        let mut rate_limited = 0;
        let mut refreshed = false;
        let mut last_error: Option<Error> = None;

        loop {
            let builder = http::request::Builder::default().uri(uri.clone());
            let request = match complete_request(context.clone(), builder).await {
                Ok(r) => r,
                Err(e) => return Err(last_error.unwrap_or(e)),
            };
            let method = request.method().clone();
            let same_origin = uri.authority() == origin.as_ref();

            let response = match run_single_request(
                &self.inner_client,
                &self.modifiers,
                request,
                same_origin,
                deadline,
            )
            .await
            {
                Ok(r) => r,
                Err(e) if e.is_retryable() && attempt < self.policy.max_retries => {
                    let wait = self.policy.backoff(attempt);
                    tracing::debug!("{} {} failed with {}, retrying in {:?}", method, uri, e, wait);
                    attempt += 1;
                    last_error = Some(e);
                    tokio::time::sleep(wait).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            for m in self.modifiers.iter() {
                m.observe(&response);
            }

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED && same_origin && !refreshed {
                refreshed = true;
                let summary = RequestSummary {
                    method: method.clone(),
                    uri: uri.clone(),
                };
                let mut replay = false;
                for m in self.modifiers.iter() {
                    replay |= m.on_unauthorized(&summary, &response).await?;
                }
                if replay {
                    continue;
                }
                return Ok(response);
            }

            if status == StatusCode::TOO_MANY_REQUESTS && rate_limited < self.policy.rate_limit_retries
            {
                let wait = retry_after(response.headers(), chrono::Utc::now())
                    .unwrap_or_else(|| self.policy.backoff(rate_limited));
                rate_limited += 1;
                tracing::warn!(
                    "{} {} was rate limited, waiting {:?} before retrying",
                    method,
                    uri,
                    wait
                );
                tokio::time::sleep(wait).await;
                continue;
            }

            if status.is_redirection() && status != StatusCode::NOT_MODIFIED {
                if let Some(location) = response
                    .headers()
                    .get(http::header::LOCATION)
                    .and_then(|e| e.to_str().ok())
                {
                    if redirects < self.policy.max_redirects {
                        redirects += 1;
                        uri = resolve_location(&uri, location)?;
                        continue;
                    }
                }
            }

            if status.is_server_error() && attempt < self.policy.max_retries {
                let wait = self.policy.backoff(attempt);
                tracing::debug!("{} {} returned {}, retrying in {:?}", method, uri, status, wait);
                attempt += 1;
                last_error = Some(Error::registry(status, ""));
                tokio::time::sleep(wait).await;
                continue;
            }

            return Ok(response);
        }
    }

    /// A single attempt for requests whose body cannot be rebuilt. Nothing is
    /// replayed, but a 401 still lets the modifiers refresh credentials so that
    /// the caller's next attempt goes out with fresh ones.
    pub async fn send_once(
        &self,
        request: Request<Body>,
        apply_modifiers: bool,
        deadline: Duration,
    ) -> Result<Response<Body>> {
        let summary = RequestSummary {
            method: request.method().clone(),
            uri: request.uri().clone(),
        };
        let response = run_single_request(
            &self.inner_client,
            &self.modifiers,
            request,
            apply_modifiers,
            deadline,
        )
        .await?;
        for m in self.modifiers.iter() {
            m.observe(&response);
        }
        if response.status() == StatusCode::UNAUTHORIZED && apply_modifiers {
            for m in self.modifiers.iter() {
                m.on_unauthorized(&summary, &response).await?;
            }
        }
        Ok(response)
    }
}
