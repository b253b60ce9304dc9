use crate::{CoordinationStore, StoreError, StoreResult};

pub const DEFAULT_REVISION_PREFIX: &str = "edge:revision:";
pub const DEFAULT_CHANGE_CHANNEL: &str = "edge:changes";

/// Per-environment revision counters kept in the coordination store.
///
/// The counter is never cached locally; every read goes to the store so all
/// edge instances observe the same sequence.
#[derive(Debug, Clone)]
pub struct RevisionKeys {
    prefix: String,
}

impl RevisionKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn key(&self, environment: &str) -> String {
        format!("{}{}", self.prefix, environment)
    }

    /// Point-in-time read; an absent key reads as revision 0.
    pub async fn current(
        &self,
        store: &dyn CoordinationStore,
        environment: &str,
    ) -> StoreResult<u64> {
        let key = self.key(environment);
        match store.get(&key).await? {
            None => Ok(0),
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map_err(|_| StoreError::InvalidValue { key, value: raw }),
        }
    }

    /// Atomically advance the counter and return the new value.
    pub async fn advance(
        &self,
        store: &dyn CoordinationStore,
        environment: &str,
    ) -> StoreResult<u64> {
        let key = self.key(environment);
        let value = store.incr(&key).await?;
        u64::try_from(value).map_err(|_| StoreError::InvalidValue {
            key,
            value: value.to_string(),
        })
    }
}

impl Default for RevisionKeys {
    fn default() -> Self {
        Self::new(DEFAULT_REVISION_PREFIX)
    }
}
