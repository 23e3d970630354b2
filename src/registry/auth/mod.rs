//! Request authorization for registry endpoints.
//!
//! A [`StandardAuthorizer`] pings the registry once, parses the
//! `Www-Authenticate` challenges and installs either a [`BasicAuthorizer`] or a
//! [`BearerAuthorizer`]. Bearer tokens are cached per scope set.

mod basic;
mod bearer;
pub mod challenge;
mod scope;
mod standard;
mod token_cache;

pub use basic::BasicAuthorizer;
pub use bearer::{BearerAuthorizer, TokenUrlRewrite};
pub use challenge::{parse_challenges, Challenge};
pub use scope::{parse_scopes, scopes_for_request, RequestScopes, Scope, ScopeOverride};
pub use standard::{ping, Ping, StandardAuthorizer};
pub use token_cache::{CachedToken, TokenCache, LATENCY_SLACK_SECS};
