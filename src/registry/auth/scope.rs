use std::fmt;
use std::sync::OnceLock;

use http::{Method, Request, Uri};
use hyper::Body;
use regex::Regex;

/// A bearer token scope, `repository:<name>:<actions>` or `registry:catalog:*`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Scope {
    pub kind: String,
    pub name: String,
    pub actions: Vec<String>,
}

impl Scope {
    pub fn repository(name: &str, actions: &[&str]) -> Scope {
        Scope {
            kind: "repository".to_string(),
            name: name.to_string(),
            actions: actions.iter().map(|e| e.to_string()).collect(),
        }
    }

    pub fn catalog() -> Scope {
        Scope {
            kind: "registry".to_string(),
            name: "catalog".to_string(),
            actions: vec!["*".to_string()],
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.kind, self.name, self.actions.join(","))
    }
}

/// Request extension replacing the scopes derived from the request path.
#[derive(Debug, Clone)]
pub struct ScopeOverride(pub Vec<Scope>);

/// Scopes a request needs, and whether the resulting token may be cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestScopes {
    pub scopes: Vec<Scope>,
    pub cacheable: bool,
}

impl RequestScopes {
    /// Stable cache key for the scope set.
    pub fn key(&self) -> String {
        let mut parts: Vec<String> = self.scopes.iter().map(|e| e.to_string()).collect();
        parts.sort();
        parts.join(" ")
    }
}

struct PathPatterns {
    manifest: Regex,
    upload: Regex,
    blob: Regex,
    tags: Regex,
    catalog: Regex,
}

fn patterns() -> &'static PathPatterns {
    static RE: OnceLock<PathPatterns> = OnceLock::new();
    RE.get_or_init(|| PathPatterns {
        manifest: Regex::new(r"/v2/(.+)/manifests/[^/]+$").unwrap(),
        upload: Regex::new(r"/v2/(.+)/blobs/uploads(/.*)?$").unwrap(),
        blob: Regex::new(r"/v2/(.+)/blobs/[^/]+$").unwrap(),
        tags: Regex::new(r"/v2/(.+)/tags/list$").unwrap(),
        catalog: Regex::new(r"/v2/_catalog$").unwrap(),
    })
}

fn repository_of(path: &str) -> Option<String> {
    let p = patterns();
    [&p.manifest, &p.upload, &p.blob, &p.tags]
        .iter()
        .find_map(|re| re.captures(path))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn query_param(uri: &Uri, key: &str) -> Option<String> {
    uri.query()?.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        if k == key {
            urlencoding::decode(v).ok().map(|e| e.into_owned())
        } else {
            None
        }
    })
}

pub fn parse_scopes(method: &Method, uri: &Uri) -> RequestScopes {
    let path = uri.path().trim_end_matches('/');
    let repository = match repository_of(path) {
        Some(r) => r,
        None => {
            let scopes = if patterns().catalog.is_match(path) {
                vec![Scope::catalog()]
            } else {
                Vec::new()
            };
            return RequestScopes {
                scopes,
                cacheable: true,
            };
        }
    };

    let actions: &[&str] = match *method {
        Method::GET | Method::HEAD => &["pull"],
        Method::DELETE => &["delete"],
        _ => &["pull", "push"],
    };
    let mut scopes = vec![Scope::repository(&repository, actions)];
    let mut cacheable = true;
    // A cross repository mount needs pull access on the source as well. Such
    // tokens are one-offs and stay out of the cache.
    if let Some(from) = query_param(uri, "from") {
        if from != repository {
            scopes.push(Scope::repository(&from, &["pull"]));
            cacheable = false;
        }
    }
    RequestScopes { scopes, cacheable }
}

pub fn scopes_for_request(request: &Request<Body>) -> RequestScopes {
    if let Some(ScopeOverride(scopes)) = request.extensions().get::<ScopeOverride>() {
        return RequestScopes {
            scopes: scopes.clone(),
            cacheable: true,
        };
    }
    parse_scopes(request.method(), request.uri())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scopes(method: Method, uri: &str) -> RequestScopes {
        parse_scopes(&method, &uri.parse().unwrap())
    }

    #[test]
    fn test_scopes_follow_the_method() {
        let s = scopes(Method::HEAD, "https://r/v2/library/alpine/manifests/3.19");
        assert_eq!(s.key(), "repository:library/alpine:pull");
        assert!(s.cacheable);

        let s = scopes(Method::PUT, "https://r/v2/team/app/blobs/uploads/abc?digest=sha256:aa");
        assert_eq!(s.key(), "repository:team/app:pull,push");

        let s = scopes(Method::DELETE, "https://r/v2/team/app/manifests/sha256:aa");
        assert_eq!(s.key(), "repository:team/app:delete");

        let s = scopes(Method::GET, "https://r/v2/a/b/c/tags/list");
        assert_eq!(s.key(), "repository:a/b/c:pull");
    }

    #[test]
    fn test_catalog_and_ping() {
        assert_eq!(
            scopes(Method::GET, "https://r/v2/_catalog?n=100").key(),
            "registry:catalog:*"
        );
        assert!(scopes(Method::GET, "https://r/v2/").scopes.is_empty());
    }

    #[test]
    fn test_mount_adds_source_scope_and_disables_cache() {
        let s = scopes(
            Method::POST,
            "https://r/v2/team/app/blobs/uploads/?mount=sha256:aa&from=library%2Falpine",
        );
        assert!(!s.cacheable);
        assert_eq!(
            s.key(),
            "repository:library/alpine:pull repository:team/app:pull,push"
        );
    }
}
