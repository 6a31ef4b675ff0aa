use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::AuthError;

/// Reserved token value meaning "no valid credential available".
pub const DEGRADED_TOKEN: &str = "error";

/// The live Graph session. Immutable once built; a refresh produces a new value.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionContext {
    token: String,
    expires_at: DateTime<Utc>,
    base_url: String,
}

impl SessionContext {
    pub fn new<T: Into<String>, U: Into<String>>(token: T, expires_at: DateTime<Utc>, base_url: U) -> Self {
        SessionContext {
            token: token.into(),
            expires_at,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Sentinel context installed when no credential could be acquired.
    pub fn degraded<U: Into<String>>(base_url: U, now: DateTime<Utc>, ttl: Duration) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(10));
        SessionContext::new(DEGRADED_TOKEN, now + ttl, base_url)
    }

    pub fn token(&self) -> &str { &self.token }
    pub fn expires_at(&self) -> DateTime<Utc> { self.expires_at }
    pub fn base_url(&self) -> &str { &self.base_url }

    pub fn is_degraded(&self) -> bool { self.token == DEGRADED_TOKEN }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool { now >= self.expires_at }

    pub fn is_valid(&self, now: DateTime<Utc>) -> bool { is_valid(self, now) }

    /// Fail fast before any repository call so the sentinel never leaves the process.
    pub fn ensure_valid(&self, now: DateTime<Utc>) -> Result<&str, AuthError> {
        if self.is_valid(now) { Ok(&self.token) } else { Err(AuthError::SessionUnavailable) }
    }

    pub fn bearer(&self) -> String { format!("Bearer {}", self.token) }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("token", &redact_token(&self.token))
            .field("expires_at", &self.expires_at)
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// True iff the context carries a real token and `now` is before its expiry.
pub fn is_valid(ctx: &SessionContext, now: DateTime<Utc>) -> bool {
    ctx.token != DEGRADED_TOKEN && now < ctx.expires_at
}

/// Short, log-safe form of a bearer token.
pub fn redact_token(token: &str) -> String {
    if token == DEGRADED_TOKEN { return DEGRADED_TOKEN.to_string(); }
    let head: String = token.chars().take(4).collect();
    format!("{}***({} chars)", head, token.chars().count())
}
