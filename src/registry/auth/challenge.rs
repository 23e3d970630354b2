use std::collections::BTreeMap;
use std::sync::OnceLock;

use http::header::HeaderMap;
use regex::Regex;

use crate::error::{Error, Result};

/// One `Www-Authenticate` challenge, e.g. `Bearer realm="…",service="…"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// Lower-cased scheme name.
    pub scheme: String,
    pub parameters: BTreeMap<String, String>,
}

impl std::fmt::Display for Challenge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.scheme)?;
        for (k, v) in self.parameters.iter() {
            write!(f, " {}={:?}", k, v)?;
        }
        Ok(())
    }
}

fn parameter_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // key="quoted, value",key=bare
    RE.get_or_init(|| {
        Regex::new(r#"([A-Za-z0-9_\-]+)\s*=\s*("(?:[^"\\]|\\.)*"|[^",\s]*)"#).unwrap()
    })
}

impl Challenge {
    pub fn from_auth_header(auth_header: &str) -> Result<Self> {
        let auth_header = auth_header.trim();
        let (scheme, rest) = match auth_header.split_once(char::is_whitespace) {
            Some((s, r)) => (s, r),
            None => (auth_header, ""),
        };
        if scheme.is_empty() || scheme.contains('=') {
            return Err(Error::ChallengesUnsupported(format!(
                "malformed challenge '{}'",
                auth_header
            )));
        }

        let mut parameters = BTreeMap::new();
        for capture in parameter_regex().captures_iter(rest) {
            let (_, [key, value]) = capture.extract();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value)
                .replace("\\\"", "\"");
            parameters.insert(key.to_ascii_lowercase(), value);
        }

        Ok(Challenge {
            scheme: scheme.to_ascii_lowercase(),
            parameters,
        })
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(|e| e.as_str())
    }
}

/// Every parseable challenge found in the response headers.
pub fn parse_challenges(headers: &HeaderMap) -> Vec<Challenge> {
    headers
        .get_all(http::header::WWW_AUTHENTICATE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| Challenge::from_auth_header(v).ok())
        .collect()
}
