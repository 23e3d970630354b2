use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

/// Minimum headroom a cached token must have left before it is handed out.
pub const LATENCY_SLACK_SECS: i64 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Bearer tokens keyed by scope set.
#[derive(Debug)]
pub struct TokenCache {
    slack: Duration,
    entries: Mutex<HashMap<String, CachedToken>>,
}

impl Default for TokenCache {
    fn default() -> Self {
        TokenCache::new(Duration::seconds(LATENCY_SLACK_SECS))
    }
}

impl TokenCache {
    pub fn new(slack: Duration) -> TokenCache {
        TokenCache {
            slack,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, CachedToken>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The token for `key`, if it is still valid `slack` from now.
    pub fn get(&self, key: &str, now: DateTime<Utc>) -> Option<String> {
        let mut entries = self.entries();
        match entries.get(key) {
            Some(t) if now + self.slack < t.expires_at => Some(t.token.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: &str, token: CachedToken) {
        self.entries().insert(key.to_string(), token);
    }

    pub fn invalidate(&self, key: &str) {
        self.entries().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reuse_requires_slack_before_expiry() {
        let cache = TokenCache::default();
        let now = Utc::now();
        cache.put(
            "repository:a/b:pull",
            CachedToken {
                token: "t1".to_string(),
                expires_at: now + Duration::seconds(60),
            },
        );
        assert_eq!(cache.get("repository:a/b:pull", now).as_deref(), Some("t1"));
        assert_eq!(
            cache.get("repository:a/b:pull", now + Duration::seconds(49)).as_deref(),
            Some("t1")
        );
        // now + slack == expires_at is no longer valid
        assert_eq!(cache.get("repository:a/b:pull", now + Duration::seconds(50)), None);
        // and the stale entry is gone
        assert_eq!(cache.get("repository:a/b:pull", now), None);
    }

    #[test]
    fn test_scopes_must_match_exactly() {
        let cache = TokenCache::default();
        let now = Utc::now();
        cache.put(
            "repository:a/b:pull",
            CachedToken {
                token: "t1".to_string(),
                expires_at: now + Duration::seconds(300),
            },
        );
        assert_eq!(cache.get("repository:a/b:pull,push", now), None);
        cache.invalidate("repository:a/b:pull");
        assert_eq!(cache.get("repository:a/b:pull", now), None);
    }
}
