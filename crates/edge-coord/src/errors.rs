use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("coordination store connection failed: {0}")]
    Connection(String),
    #[error("coordination store command failed: {0}")]
    Command(String),
    #[error("subscribe to {channel} failed: {message}")]
    Subscribe { channel: String, message: String },
    #[error("invalid value for key {key}: {value}")]
    InvalidValue { key: String, value: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum EventParseError {
    #[error("event is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("event {event_type} is missing field {field}")]
    MissingField {
        event_type: String,
        field: &'static str,
    },
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_dropped() || err.is_connection_refusal() || err.is_io_error() {
            StoreError::Connection(err.to_string())
        } else {
            StoreError::Command(err.to_string())
        }
    }
}
