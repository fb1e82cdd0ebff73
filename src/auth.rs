//! Bearer-token identity lookup.
//!
//! Tokens are opaque strings issued by the account service. The pipeline
//! only needs to turn one into a [`UserId`] or reject it.

use crate::core::UserId;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

/// Reasons a credential is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing credential")]
    Missing,

    #[error("invalid credential")]
    Invalid,

    #[error("credential expired at {0}")]
    Expired(DateTime<Utc>),

    #[error("identity lookup failed: {0}")]
    Backend(String),
}

/// Resolves bearer tokens to user identities.
pub trait Authenticator: Send + Sync {
    fn validate(&self, token: &str) -> Result<UserId, AuthError>;
}

/// A token grant: who it belongs to and when it stops working.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenGrant {
    pub user_id: UserId,
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenGrant {
    /// Check the grant against `now`.
    pub fn check(&self, now: DateTime<Utc>) -> Result<UserId, AuthError> {
        match self.expires_at {
            Some(expiry) if expiry <= now => Err(AuthError::Expired(expiry)),
            _ => Ok(self.user_id.clone()),
        }
    }
}

/// Generate a fresh opaque bearer token.
pub fn generate_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// In-memory token table.
#[derive(Debug, Default)]
pub struct TokenRegistry {
    grants: RwLock<HashMap<String, TokenGrant>>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a token for `user_id`, optionally expiring after `ttl`.
    pub fn issue(&self, user_id: UserId, ttl: Option<Duration>) -> String {
        let token = generate_token();
        self.insert(token.clone(), user_id, ttl.map(|ttl| Utc::now() + ttl));
        token
    }

    /// Register a known token.
    pub fn insert(&self, token: String, user_id: UserId, expires_at: Option<DateTime<Utc>>) {
        let mut grants = match self.grants.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        grants.insert(
            token,
            TokenGrant {
                user_id,
                expires_at,
            },
        );
    }

    pub fn revoke(&self, token: &str) -> bool {
        let mut grants = match self.grants.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        grants.remove(token).is_some()
    }
}

impl Authenticator for TokenRegistry {
    fn validate(&self, token: &str) -> Result<UserId, AuthError> {
        if token.trim().is_empty() {
            return Err(AuthError::Missing);
        }
        let grants = match self.grants.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        grants
            .get(token)
            .ok_or(AuthError::Invalid)?
            .check(Utc::now())
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if scheme.eq_ignore_ascii_case("bearer") {
        Some(token.trim())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issued_token_validates() {
        let registry = TokenRegistry::new();
        let token = registry.issue(UserId::new("42"), None);

        assert_eq!(registry.validate(&token), Ok(UserId::new("42")));
    }

    #[test]
    fn test_rejections() {
        let registry = TokenRegistry::new();
        assert_eq!(registry.validate(""), Err(AuthError::Missing));
        assert_eq!(registry.validate("nope"), Err(AuthError::Invalid));

        let past = Utc::now() - Duration::minutes(1);
        registry.insert("old".to_string(), UserId::new("7"), Some(past));
        assert_eq!(registry.validate("old"), Err(AuthError::Expired(past)));
    }

    #[test]
    fn test_revoke() {
        let registry = TokenRegistry::new();
        let token = registry.issue(UserId::new("42"), Some(Duration::hours(1)));

        assert!(registry.revoke(&token));
        assert!(!registry.revoke(&token));
        assert_eq!(registry.validate(&token), Err(AuthError::Invalid));
    }

    #[test]
    fn test_bearer_header_parsing() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("bearer  abc "), Some("abc"));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("abc"), None);
    }
}
