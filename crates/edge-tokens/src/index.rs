use crate::{MirroredToken, TokenError, TokenResult, TokenType, UNSECURED_TOKEN};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    NotFound,
    Expired,
    InvalidType,
    InvalidEnvironment,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::NotFound => "not_found",
            RejectReason::Expired => "expired",
            RejectReason::InvalidType => "invalid_type",
            RejectReason::InvalidEnvironment => "invalid_environment",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a validation. Rejections keep the token, when one was found,
/// so callers can log which credential failed.
#[derive(Debug, Clone)]
pub enum TokenValidation {
    Valid(Arc<MirroredToken>),
    Rejected {
        reason: RejectReason,
        token: Option<Arc<MirroredToken>>,
    },
}

impl TokenValidation {
    pub fn is_valid(&self) -> bool {
        matches!(self, TokenValidation::Valid(_))
    }

    pub fn token(&self) -> Option<&Arc<MirroredToken>> {
        match self {
            TokenValidation::Valid(token) => Some(token),
            TokenValidation::Rejected { token, .. } => token.as_ref(),
        }
    }

    pub fn reason(&self) -> Option<RejectReason> {
        match self {
            TokenValidation::Valid(_) => None,
            TokenValidation::Rejected { reason, .. } => Some(*reason),
        }
    }

    fn rejected(reason: RejectReason, token: Option<&Arc<MirroredToken>>) -> Self {
        TokenValidation::Rejected {
            reason,
            token: token.cloned(),
        }
    }
}

/// One generation of the mirrored token set.
///
/// Both lookup maps are built together and never patched, so a lookup by
/// secret and a lookup by id always agree.
#[derive(Debug, Default)]
pub struct TokenIndex {
    by_secret: HashMap<String, Arc<MirroredToken>>,
    by_id: HashMap<u64, Arc<MirroredToken>>,
}

impl TokenIndex {
    pub fn build(tokens: Vec<MirroredToken>) -> TokenResult<Self> {
        let mut by_secret: HashMap<String, Arc<MirroredToken>> =
            HashMap::with_capacity(tokens.len());
        let mut by_id = HashMap::with_capacity(tokens.len());
        for token in tokens {
            let token = Arc::new(token);
            if let Some(existing) = by_secret.get(&token.secret) {
                return Err(TokenError::DuplicateSecret {
                    first: existing.id,
                    second: token.id,
                });
            }
            if by_id.contains_key(&token.id) {
                return Err(TokenError::DuplicateId { id: token.id });
            }
            by_id.insert(token.id, Arc::clone(&token));
            by_secret.insert(token.secret.clone(), token);
        }
        Ok(Self { by_secret, by_id })
    }

    pub fn len(&self) -> usize {
        self.by_secret.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_secret.is_empty()
    }

    pub fn get_by_secret(&self, secret: &str) -> Option<&Arc<MirroredToken>> {
        self.by_secret.get(secret)
    }

    pub fn get_by_id(&self, id: u64) -> Option<&Arc<MirroredToken>> {
        self.by_id.get(&id)
    }

    /// Synchronous validation against this generation.
    ///
    /// Order: unsecured token, unknown secret, expiry, type, environment.
    pub fn validate(
        &self,
        secret: &str,
        required: TokenType,
        environment: Option<&str>,
        now: DateTime<Utc>,
    ) -> TokenValidation {
        if secret == UNSECURED_TOKEN {
            return TokenValidation::Valid(Arc::new(MirroredToken::unsecured(now)));
        }
        let Some(token) = self.by_secret.get(secret) else {
            return TokenValidation::rejected(RejectReason::NotFound, None);
        };
        if token.is_expired(now) {
            return TokenValidation::rejected(RejectReason::Expired, Some(token));
        }
        if !token.token_type.satisfies(required) {
            return TokenValidation::rejected(RejectReason::InvalidType, Some(token));
        }
        if let Some(environment) = environment
            && !token.allows_environment(environment)
        {
            return TokenValidation::rejected(RejectReason::InvalidEnvironment, Some(token));
        }
        TokenValidation::Valid(Arc::clone(token))
    }
}
