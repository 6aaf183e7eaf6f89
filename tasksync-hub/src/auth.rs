//! Connection gate: credential validation for the `TaskSync` hub.
//!
//! Tokens are opaque strings presented at connection time, either as a
//! `token` query parameter or an `Authorization: Bearer` header. The gate
//! consumes only the validate/resolve contract; token issuance lives
//! elsewhere. A connection with a missing or invalid token is refused
//! outright -- there is no partial or degraded access.

use std::collections::HashMap;

use parking_lot::RwLock;
use uuid::Uuid;

/// The validate/extract contract the gate consumes.
///
/// Implementations must be cheap enough to call on every connection
/// attempt; per-invocation checks reuse the identity resolved here.
pub trait TokenValidator: Send + Sync {
    /// Returns `true` if the token is currently valid.
    fn validate(&self, token: &str) -> bool;

    /// Resolves the user id a valid token was issued for.
    fn resolve_user_id(&self, token: &str) -> Option<u64>;
}

/// Reference in-memory validator backed by a table of issued tokens.
///
/// Not a real credential system: tokens are random opaque strings with
/// no signature or expiry. The hub only depends on the
/// [`TokenValidator`] contract, so a signed-token implementation is a
/// drop-in replacement.
pub struct TokenRegistry {
    tokens: RwLock<HashMap<String, u64>>,
}

impl Default for TokenRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tokens: RwLock::new(HashMap::new()),
        }
    }

    /// Issues a fresh opaque token for the given user.
    pub fn issue(&self, user_id: u64) -> String {
        let token = format!("tok-{}", Uuid::now_v7().simple());
        self.tokens.write().insert(token.clone(), user_id);
        token
    }

    /// Registers a pre-existing token, e.g. one loaded from config.
    pub fn insert(&self, token: &str, user_id: u64) {
        self.tokens.write().insert(token.to_string(), user_id);
    }

    /// Revokes a previously issued token.
    pub fn revoke(&self, token: &str) -> bool {
        self.tokens.write().remove(token).is_some()
    }
}

impl TokenValidator for TokenRegistry {
    fn validate(&self, token: &str) -> bool {
        self.tokens.read().contains_key(token)
    }

    fn resolve_user_id(&self, token: &str) -> Option<u64> {
        self.tokens.read().get(token).copied()
    }
}

/// Extracts the credential from a request's query string or headers.
///
/// The query parameter `token` takes precedence; otherwise an
/// `Authorization: Bearer <token>` header is accepted.
#[must_use]
pub fn extract_token(query: Option<&str>, authorization: Option<&str>) -> Option<String> {
    if let Some(query) = query {
        for pair in query.split('&') {
            if let Some(value) = pair.strip_prefix("token=")
                && !value.is_empty()
            {
                return Some(value.to_string());
            }
        }
    }
    authorization
        .and_then(|h| h.strip_prefix("Bearer "))
        .filter(|t| !t.is_empty())
        .map(ToString::to_string)
}

/// Validates a token and resolves the connection's user identity.
///
/// Returns `None` (deny) if the token is absent, invalid, or cannot be
/// resolved -- the single boolean-deny failure mode of the gate.
#[must_use]
pub fn authenticate(validator: &dyn TokenValidator, token: Option<&str>) -> Option<u64> {
    let token = token?;
    if !validator.validate(token) {
        return None;
    }
    validator.resolve_user_id(token)
}
