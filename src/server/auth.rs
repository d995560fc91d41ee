//! Who may open a session on the relay.

use http::header::AUTHORIZATION;
use http::HeaderMap;
use std::collections::HashSet;
use std::sync::Arc;

/// Outcome of checking an upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authentication {
    Granted,
    Denied(String),
}

impl Authentication {
    pub fn is_granted(&self) -> bool {
        matches!(self, Authentication::Granted)
    }
}

/// Consulted before a transport is upgraded into a session.
pub trait AuthProvider: Send + Sync {
    fn authenticate(&self, headers: &HeaderMap) -> Authentication;
}

/// Used when no tokens are configured.
pub struct AllowAll;

impl AuthProvider for AllowAll {
    fn authenticate(&self, _headers: &HeaderMap) -> Authentication {
        Authentication::Granted
    }
}

/// Accepts `Authorization: Bearer <token>` for any configured token.
pub struct ApiKeyProvider {
    tokens: HashSet<String>,
}

impl ApiKeyProvider {
    pub fn new<I, T>(tokens: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl AuthProvider for ApiKeyProvider {
    fn authenticate(&self, headers: &HeaderMap) -> Authentication {
        let Some(value) = headers.get(AUTHORIZATION) else {
            return Authentication::Denied("missing authorization header".to_string());
        };
        let Ok(value) = value.to_str() else {
            return Authentication::Denied("unreadable authorization header".to_string());
        };
        match bearer_token(value) {
            Some(token) if self.tokens.contains(token) => Authentication::Granted,
            Some(_) => Authentication::Denied("unknown token".to_string()),
            None => Authentication::Denied("expected a bearer token".to_string()),
        }
    }
}

fn bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

/// `AllowAll` unless at least one token is configured.
pub fn provider_for(tokens: &[String]) -> Arc<dyn AuthProvider> {
    let keys = ApiKeyProvider::new(
        tokens
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty()),
    );
    if keys.is_empty() {
        Arc::new(AllowAll)
    } else {
        Arc::new(keys)
    }
}
