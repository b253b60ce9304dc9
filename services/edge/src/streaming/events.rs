use chrono::{DateTime, Utc};
use serde::Serialize;

/// Event pushed to streaming clients. The `type` tag doubles as the SSE
/// event name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Connected {
        #[serde(rename = "connectionId")]
        connection_id: String,
        environment: String,
        revision: u64,
        timestamp: DateTime<Utc>,
    },
    FlagsChanged {
        revision: u64,
        #[serde(rename = "changedKeys")]
        changed_keys: Vec<String>,
        timestamp: DateTime<Utc>,
    },
    Heartbeat {
        timestamp: DateTime<Utc>,
    },
}

impl StreamEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Connected { .. } => "connected",
            StreamEvent::FlagsChanged { .. } => "flags_changed",
            StreamEvent::Heartbeat { .. } => "heartbeat",
        }
    }

    pub fn revision(&self) -> Option<u64> {
        match self {
            StreamEvent::Connected { revision, .. } | StreamEvent::FlagsChanged { revision, .. } => {
                Some(*revision)
            }
            StreamEvent::Heartbeat { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shape_uses_camel_case_fields() {
        let timestamp = Utc::now();
        let event = StreamEvent::FlagsChanged {
            revision: 2,
            changed_keys: vec!["checkout".to_string()],
            timestamp,
        };
        let value = serde_json::to_value(&event).expect("json");
        assert_eq!(value["type"], "flags_changed");
        assert_eq!(value["revision"], 2);
        assert_eq!(value["changedKeys"][0], "checkout");
        assert_eq!(event.name(), "flags_changed");

        let connected = StreamEvent::Connected {
            connection_id: "c1".to_string(),
            environment: "prod".to_string(),
            revision: 0,
            timestamp,
        };
        let value = serde_json::to_value(&connected).expect("json");
        assert_eq!(value["type"], "connected");
        assert_eq!(value["connectionId"], "c1");
        assert_eq!(connected.revision(), Some(0));
    }

    #[test]
    fn heartbeat_has_only_a_timestamp() {
        let value = serde_json::to_value(StreamEvent::Heartbeat {
            timestamp: Utc::now(),
        })
        .expect("json");
        let object = value.as_object().expect("object");
        assert_eq!(object.len(), 2);
        assert!(object.contains_key("timestamp"));
    }
}
