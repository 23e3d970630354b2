use std::sync::Arc;
use std::time::Duration;

use http::{Request, Response, StatusCode, Uri};
use hyper::Body;
use tokio::sync::Mutex;

use super::basic::BasicAuthorizer;
use super::bearer::{BearerAuthorizer, TokenUrlRewrite};
use super::challenge::{parse_challenges, Challenge};
use crate::error::{Error, Result};
use crate::model::Credential;
use crate::registry::http::util::dump_body_to_string;
use crate::registry::http::{HyperClient, Modifier, RequestSummary};

/// Outcome of `GET /v2/` without credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ping {
    Ok,
    Challenge(Vec<Challenge>),
}

pub async fn ping(client: &HyperClient, registry_uri: &Uri, deadline: Duration) -> Result<Ping> {
    let mut parts = registry_uri.clone().into_parts();
    parts.path_and_query = Some(http::uri::PathAndQuery::from_static("/v2/"));
    let uri = Uri::from_parts(parts)?;
    let request = Request::builder()
        .method(http::Method::GET)
        .uri(uri.clone())
        .body(Body::empty())?;
    let mut response = match tokio::time::timeout(deadline, client.request(request)).await {
        Err(_) => return Err(Error::Timeout(deadline)),
        Ok(r) => r?,
    };
    let status = response.status();
    if status.is_success() {
        return Ok(Ping::Ok);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Ok(Ping::Challenge(parse_challenges(response.headers())));
    }
    let body = dump_body_to_string(&mut response).await.unwrap_or_default();
    Err(Error::registry(status, &body))
}

enum Scheme {
    Basic(BasicAuthorizer),
    Bearer(BearerAuthorizer),
}

enum State {
    Undiscovered,
    Anonymous,
    Ready(Arc<Scheme>),
}

/// Pings the registry once, then authorizes every request with the scheme the
/// registry asked for.
pub struct StandardAuthorizer {
    client: HyperClient,
    registry_uri: Uri,
    credential: Option<Credential>,
    rewrite: Option<TokenUrlRewrite>,
    deadline: Duration,
    state: Mutex<State>,
}

impl StandardAuthorizer {
    pub fn new(
        client: HyperClient,
        registry_uri: Uri,
        credential: Option<Credential>,
    ) -> StandardAuthorizer {
        StandardAuthorizer {
            client,
            registry_uri,
            credential,
            rewrite: None,
            deadline: Duration::from_secs(60),
            state: Mutex::new(State::Undiscovered),
        }
    }

    pub fn with_token_rewrite(mut self, rewrite: Option<TokenUrlRewrite>) -> StandardAuthorizer {
        self.rewrite = rewrite;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> StandardAuthorizer {
        self.deadline = deadline;
        self
    }

    fn select(&self, challenges: &[Challenge]) -> Result<Option<Scheme>> {
        if let Some(bearer) = challenges.iter().find(|c| c.scheme == "bearer") {
            return Ok(Some(Scheme::Bearer(BearerAuthorizer::from_challenge(
                self.client.clone(),
                bearer,
                self.credential.clone(),
                self.rewrite.as_ref(),
                self.deadline,
            )?)));
        }
        if challenges.iter().any(|c| c.scheme == "basic") {
            return match &self.credential {
                Some(c) => Ok(Some(Scheme::Basic(BasicAuthorizer::new(c)?))),
                None => Err(Error::Auth(format!(
                    "{} requires basic credentials but none are configured",
                    self.registry_uri
                ))),
            };
        }
        if let Some(other) = challenges.first() {
            return Err(Error::ChallengesUnsupported(other.to_string()));
        }
        match &self.credential {
            Some(c) => Ok(Some(Scheme::Basic(BasicAuthorizer::new(c)?))),
            None => Ok(None),
        }
    }

    async fn scheme(&self) -> Result<Option<Arc<Scheme>>> {
        let mut state = self.state.lock().await;
        if let State::Undiscovered = *state {
            let discovered = match ping(&self.client, &self.registry_uri, self.deadline).await? {
                Ping::Ok => None,
                Ping::Challenge(challenges) => self.select(&challenges)?,
            };
            *state = match discovered {
                None => State::Anonymous,
                Some(s) => State::Ready(Arc::new(s)),
            };
        }
        Ok(match &*state {
            State::Ready(s) => Some(s.clone()),
            _ => None,
        })
    }
}

#[async_trait::async_trait]
impl Modifier for StandardAuthorizer {
    async fn modify(&self, request: &mut Request<Body>) -> Result<()> {
        if request.uri().authority() != self.registry_uri.authority() {
            return Ok(());
        }
        match self.scheme().await? {
            None => Ok(()),
            Some(s) => match s.as_ref() {
                Scheme::Basic(b) => b.modify(request).await,
                Scheme::Bearer(b) => b.modify(request).await,
            },
        }
    }

    async fn on_unauthorized(
        &self,
        request: &RequestSummary,
        response: &Response<Body>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        match &*state {
            State::Ready(s) => match s.as_ref() {
                Scheme::Bearer(b) => b.on_unauthorized(request, response).await,
                Scheme::Basic(_) => Ok(false),
            },
            // The ping was answered anonymously but this endpoint is protected.
            State::Anonymous | State::Undiscovered => {
                let challenges = parse_challenges(response.headers());
                match self.select(&challenges)? {
                    None => Ok(false),
                    Some(s) => {
                        *state = State::Ready(Arc::new(s));
                        Ok(true)
                    }
                }
            }
        }
    }
}
