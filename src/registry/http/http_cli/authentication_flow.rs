use std::time::Duration;

use chrono::{DateTime, Utc};
use http::{StatusCode, Uri};
use hyper::Body;
use serde::{Deserialize, Serialize};

use super::HyperClient;
use crate::error::{Error, Result};
use crate::model::Credential;
use crate::registry::auth::Scope;
use crate::registry::http::util::dump_body_to_string;

/// Token lifetime assumed when the token service omits `expires_in`.
const DEFAULT_EXPIRES_IN: u64 = 60;
const MAX_EXPIRES_IN: i64 = 86_400 * 365;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthResponse {
    pub token: Option<String>,
    pub access_token: Option<String>,
    pub expires_in: Option<u64>,
    pub issued_at: Option<String>,
}

impl AuthResponse {
    pub fn token_value(&self) -> Option<&str> {
        self.token
            .as_deref()
            .or(self.access_token.as_deref())
            .filter(|e| !e.is_empty())
    }

    pub fn expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let issued = self
            .issued_at
            .as_deref()
            .and_then(|e| DateTime::parse_from_rfc3339(e).ok())
            .map(|e| e.with_timezone(&Utc))
            .unwrap_or(now);
        let lifetime = self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN);
        let lifetime = i64::try_from(lifetime).unwrap_or(i64::MAX).min(MAX_EXPIRES_IN);
        issued + chrono::Duration::seconds(lifetime)
    }
}

pub(crate) fn token_request_uri(realm: &Uri, service: &str, scopes: &[Scope]) -> Result<Uri> {
    let mut parts = realm.clone().into_parts();
    let mut query_items = Vec::new();
    if !service.is_empty() {
        query_items.push(format!("service={}", urlencoding::encode(service)));
    }
    for scope in scopes {
        query_items.push(format!(
            "scope={}",
            urlencoding::encode(&scope.to_string())
        ));
    }
    let existing_path_and_query = parts
        .path_and_query
        .as_ref()
        .map(|e| e.as_str())
        .unwrap_or("/");
    let new_path_q = if query_items.is_empty() {
        existing_path_and_query.to_string()
    } else if existing_path_and_query.contains('?') {
        format!("{}&{}", existing_path_and_query, query_items.join("&"))
    } else {
        format!("{}?{}", existing_path_and_query, query_items.join("&"))
    };
    parts.path_and_query = Some(new_path_q.as_str().try_into().map_err(|e| {
        Error::Configuration(format!(
            "failed to build token request path from {:?}: {}",
            new_path_q, e
        ))
    })?);
    Ok(Uri::from_parts(parts)?)
}

/// Exchanges the credential (or nothing, for anonymous pulls) for a bearer token.
pub async fn authenticate_request(
    inner_client: &HyperClient,
    realm: &Uri,
    service: &str,
    scopes: &[Scope],
    credential: Option<&Credential>,
    deadline: Duration,
) -> Result<AuthResponse> {
    use base64::prelude::*;

    let new_uri = token_request_uri(realm, service, scopes)?;
    let builder = http::request::Builder::default()
        .method(http::Method::GET)
        .uri(new_uri.clone());
    let builder = if let Some(c) = credential {
        builder.header(
            http::header::AUTHORIZATION,
            format!(
                "Basic {}",
                BASE64_STANDARD.encode(format!("{}:{}", c.access_key, c.access_secret))
            ),
        )
    } else {
        builder
    };
    let request = builder.body(Body::empty())?;

    let mut response = match tokio::time::timeout(deadline, inner_client.request(request)).await {
        Err(_) => return Err(Error::Timeout(deadline)),
        Ok(r) => r?,
    };

    let status = response.status();
    let response_body = dump_body_to_string(&mut response).await.unwrap_or_default();
    if status.is_success() {
        let response_auth_info: AuthResponse = serde_json::from_str(&response_body)?;
        if response_auth_info.token_value().is_none() {
            return Err(Error::Auth(format!(
                "token service {} returned no token",
                realm
            )));
        }
        Ok(response_auth_info)
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        Err(Error::Auth(format!(
            "token service {} rejected the credential with {}",
            realm, status
        )))
    } else {
        Err(Error::registry(status, &response_body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_request_uri_carries_every_scope() {
        let realm: Uri = "https://auth.docker.io/token".parse().unwrap();
        let scopes = vec![
            Scope::repository("library/alpine", &["pull", "push"]),
            Scope::repository("library/busybox", &["pull"]),
        ];
        let uri = token_request_uri(&realm, "registry.docker.io", &scopes).unwrap();
        assert_eq!(
            uri.to_string(),
            "https://auth.docker.io/token?service=registry.docker.io\
             &scope=repository%3Alibrary%2Falpine%3Apull%2Cpush\
             &scope=repository%3Alibrary%2Fbusybox%3Apull"
        );
    }

    #[test]
    fn test_expiry_defaults() {
        let now = Utc::now();
        let resp = AuthResponse {
            token: Some("t".to_string()),
            access_token: None,
            expires_in: None,
            issued_at: None,
        };
        assert_eq!(resp.expires_at(now), now + chrono::Duration::seconds(60));

        let resp = AuthResponse {
            token: None,
            access_token: Some("a".to_string()),
            expires_in: Some(300),
            issued_at: Some("2024-01-01T00:00:00Z".to_string()),
        };
        assert_eq!(resp.token_value(), Some("a"));
        assert_eq!(
            resp.expires_at(now).to_rfc3339(),
            "2024-01-01T00:05:00+00:00"
        );
    }
}
