// Events carried on the shared change channel.
use crate::EventParseError;
use serde::{Deserialize, Serialize};

pub const FLAGS_CHANGED: &str = "feature_flag.changed";
const TOKEN_EVENT_PREFIX: &str = "api_token.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Any token lifecycle event. Consumers resync the whole token set.
    TokensChanged { event_type: String },
    FlagsChanged {
        environment: String,
        changed_keys: Vec<String>,
    },
    /// Recognized envelope with a type this edge does not act on.
    Other(String),
}

#[derive(Debug, Deserialize, Serialize)]
struct RawEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct FlagsChangedData {
    environment: Option<String>,
    #[serde(default, rename = "changedKeys", alias = "changed_keys")]
    changed_keys: Vec<String>,
}

impl ChannelEvent {
    pub fn parse(payload: &str) -> Result<Self, EventParseError> {
        let raw: RawEvent = serde_json::from_str(payload)?;
        if raw.event_type.starts_with(TOKEN_EVENT_PREFIX) {
            return Ok(ChannelEvent::TokensChanged {
                event_type: raw.event_type,
            });
        }
        if raw.event_type == FLAGS_CHANGED {
            let data: FlagsChangedData = serde_json::from_value(raw.data)?;
            let environment = data
                .environment
                .filter(|env| !env.is_empty())
                .ok_or_else(|| EventParseError::MissingField {
                    event_type: raw.event_type.clone(),
                    field: "environment",
                })?;
            return Ok(ChannelEvent::FlagsChanged {
                environment,
                changed_keys: data.changed_keys,
            });
        }
        Ok(ChannelEvent::Other(raw.event_type))
    }

    pub fn event_type(&self) -> &str {
        match self {
            ChannelEvent::TokensChanged { event_type } => event_type,
            ChannelEvent::FlagsChanged { .. } => FLAGS_CHANGED,
            ChannelEvent::Other(event_type) => event_type,
        }
    }

    /// Encode in the same envelope the authority publishes.
    pub fn to_payload(&self) -> String {
        let data = match self {
            ChannelEvent::FlagsChanged {
                environment,
                changed_keys,
            } => serde_json::json!({
                "environment": environment,
                "changedKeys": changed_keys,
            }),
            _ => serde_json::Value::Null,
        };
        let raw = RawEvent {
            event_type: self.event_type().to_string(),
            data,
        };
        serde_json::to_string(&raw).unwrap_or_default()
    }
}
