use std::time::Duration;

use chrono::Utc;
use http::header::{HeaderValue, AUTHORIZATION};
use http::{Request, Response, Uri};
use hyper::Body;

use super::challenge::Challenge;
use super::scope::{parse_scopes, scopes_for_request, RequestScopes};
use super::token_cache::{CachedToken, TokenCache};
use crate::error::{Error, Result};
use crate::model::Credential;
use crate::registry::http::http_cli::authentication_flow::authenticate_request;
use crate::registry::http::{HyperClient, Modifier, RequestSummary};

/// Sends token requests to an internal address when the engine runs next to
/// the token service, instead of going through the public endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenUrlRewrite {
    pub public_prefix: String,
    pub internal_prefix: String,
}

impl TokenUrlRewrite {
    pub fn apply(&self, realm: &str) -> String {
        let public = self.public_prefix.trim_end_matches('/');
        match realm.strip_prefix(public) {
            Some(rest) if public.is_empty() || rest.is_empty() || rest.starts_with('/') => {
                format!("{}{}", self.internal_prefix.trim_end_matches('/'), rest)
            }
            _ => realm.to_string(),
        }
    }
}

pub struct BearerAuthorizer {
    client: HyperClient,
    realm: Uri,
    service: String,
    credential: Option<Credential>,
    cache: TokenCache,
    deadline: Duration,
}

impl BearerAuthorizer {
    pub fn new(
        client: HyperClient,
        realm: Uri,
        service: String,
        credential: Option<Credential>,
        deadline: Duration,
    ) -> BearerAuthorizer {
        BearerAuthorizer {
            client,
            realm,
            service,
            credential,
            cache: TokenCache::default(),
            deadline,
        }
    }

    pub fn from_challenge(
        client: HyperClient,
        challenge: &Challenge,
        credential: Option<Credential>,
        rewrite: Option<&TokenUrlRewrite>,
        deadline: Duration,
    ) -> Result<BearerAuthorizer> {
        let realm = challenge
            .parameter("realm")
            .ok_or_else(|| Error::Auth(format!("bearer challenge without realm: {}", challenge)))?;
        let realm = match rewrite {
            Some(r) => r.apply(realm),
            None => realm.to_string(),
        };
        let realm = realm
            .parse::<Uri>()
            .map_err(|e| Error::Auth(format!("invalid token realm {:?}: {}", realm, e)))?;
        let service = challenge.parameter("service").unwrap_or_default().to_string();
        Ok(BearerAuthorizer::new(
            client, realm, service, credential, deadline,
        ))
    }

    pub fn realm(&self) -> &Uri {
        &self.realm
    }

    pub async fn token(&self, scopes: &RequestScopes) -> Result<String> {
        let key = scopes.key();
        if scopes.cacheable {
            if let Some(token) = self.cache.get(&key, Utc::now()) {
                return Ok(token);
            }
        }

        let response = authenticate_request(
            &self.client,
            &self.realm,
            &self.service,
            &scopes.scopes,
            self.credential.as_ref(),
            self.deadline,
        )
        .await?;
        let token = response
            .token_value()
            .ok_or_else(|| Error::Auth("token service returned no token".to_string()))?
            .to_string();
        tracing::debug!("fetched bearer token for scopes '{}'", key);

        if scopes.cacheable {
            self.cache.put(
                &key,
                CachedToken {
                    token: token.clone(),
                    expires_at: response.expires_at(Utc::now()),
                },
            );
        }
        Ok(token)
    }
}

#[async_trait::async_trait]
impl Modifier for BearerAuthorizer {
    async fn modify(&self, request: &mut Request<Body>) -> Result<()> {
        let scopes = scopes_for_request(request);
        let token = self.token(&scopes).await?;
        let mut header = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| Error::Auth(format!("token is not a valid header value: {}", e)))?;
        header.set_sensitive(true);
        request.headers_mut().insert(AUTHORIZATION, header);
        Ok(())
    }

    async fn on_unauthorized(
        &self,
        request: &RequestSummary,
        _response: &Response<Body>,
    ) -> Result<bool> {
        let scopes = parse_scopes(&request.method, &request.uri);
        self.cache.invalidate(&scopes.key());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_url_rewrite() {
        let rewrite = TokenUrlRewrite {
            public_prefix: "https://harbor.example.com".to_string(),
            internal_prefix: "http://core:8080".to_string(),
        };
        assert_eq!(
            rewrite.apply("https://harbor.example.com/service/token"),
            "http://core:8080/service/token"
        );
        assert_eq!(
            rewrite.apply("https://auth.docker.io/token"),
            "https://auth.docker.io/token"
        );
        assert_eq!(
            rewrite.apply("https://harbor.example.com.evil/service/token"),
            "https://harbor.example.com.evil/service/token"
        );
    }
}
