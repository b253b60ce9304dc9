//! Mirrored access tokens.
//!
//! # Key invariants
//! - `secret` is unique across the mirrored set.
//! - `id == 0` is reserved for the synthesized unsecured token and is never
//!   usage-tracked.
use crate::TokenError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Environment list entry that grants every environment.
pub const ENVIRONMENT_WILDCARD: &str = "*";

/// Well-known secret that always validates; local and dev use only.
pub const UNSECURED_TOKEN: &str = "unsecured-edge-api-token";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Client,
    Server,
    Edge,
    All,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::Client => "client",
            TokenType::Server => "server",
            TokenType::Edge => "edge",
            TokenType::All => "all",
        }
    }

    /// `All` satisfies any requirement; otherwise the types must match.
    pub fn satisfies(&self, required: TokenType) -> bool {
        *self == TokenType::All || *self == required
    }
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenType {
    type Err = TokenError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.to_ascii_lowercase().as_str() {
            "client" => Ok(TokenType::Client),
            "server" => Ok(TokenType::Server),
            "edge" => Ok(TokenType::Edge),
            "all" => Ok(TokenType::All),
            _ => Err(TokenError::UnknownType(input.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirroredToken {
    pub id: u64,
    #[serde(rename = "tokenValue")]
    pub secret: String,
    #[serde(default)]
    pub token_name: Option<String>,
    pub token_type: TokenType,
    #[serde(default)]
    pub allow_all_environments: bool,
    #[serde(default)]
    pub environments: Vec<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MirroredToken {
    /// Builds the out-of-band unsecured token. It never enters the index.
    pub fn unsecured(now: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            secret: UNSECURED_TOKEN.to_string(),
            token_name: Some("unsecured".to_string()),
            token_type: TokenType::All,
            allow_all_environments: true,
            environments: vec![ENVIRONMENT_WILDCARD.to_string()],
            expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at < now)
    }

    pub fn allows_environment(&self, environment: &str) -> bool {
        self.allow_all_environments
            || self
                .environments
                .iter()
                .any(|env| env == ENVIRONMENT_WILDCARD || env == environment)
    }

    pub fn is_tracked(&self) -> bool {
        self.id != 0
    }
}
