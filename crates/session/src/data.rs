use std::collections::HashSet;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Dynamic attribute value stored in a session.
pub type AttributeValue = serde_json::Value;

/// Current wall-clock time in epoch milliseconds.
#[must_use]
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Coarse classification of an [`AttributeValue`].
///
/// Used by the replicate-on-get heuristic: values whose kind is configured as
/// immutable cannot be mutated through a returned reference, so reading them
/// never marks the session dirty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
}

impl ValueKind {
    /// Classify a value.
    #[must_use]
    pub fn of(value: &AttributeValue) -> Self {
        match value {
            AttributeValue::Null => Self::Null,
            AttributeValue::Bool(_) => Self::Bool,
            AttributeValue::Number(_) => Self::Number,
            AttributeValue::String(_) => Self::String,
            AttributeValue::Array(_) => Self::Array,
            AttributeValue::Object(_) => Self::Object,
        }
    }

    /// Kinds treated as immutable unless configured otherwise.
    #[must_use]
    pub fn default_immutable() -> HashSet<Self> {
        [Self::Null, Self::Bool, Self::Number, Self::String]
            .into_iter()
            .collect()
    }
}

/// Identity and metadata of one session.
///
/// `id` and `old_session_id` together describe at most one rename in flight:
/// `old_session_id` is set by a rename and cleared when the next request
/// cycle begins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionData {
    /// Current session id.
    pub id: String,
    /// Id before the rename performed in the current cycle, if any.
    pub old_session_id: Option<String>,
    /// Creation instant, epoch milliseconds.
    pub creation_time: i64,
    /// Last access instant, epoch milliseconds.
    pub last_accessed: i64,
    /// Last access instant before the most recent touch.
    pub previous_last_accessed: i64,
    /// Inactivity timeout in seconds; `<= 0` means the session never expires.
    pub max_inactive_interval: i32,
    /// `true` until the session has been committed once.
    pub is_new: bool,
    /// Node that served the session last (sticky mode).
    pub previous_owner: Option<String>,
    /// Attribute keys known to exist in the repository, fetched lazily.
    pub repository_keys: Option<HashSet<String>>,
    /// Attribute keys that always bypass the local cache.
    pub mandatory_remote_keys: HashSet<String>,
}

impl SessionData {
    /// Create metadata for a brand-new session.
    #[must_use]
    pub fn new(id: impl Into<String>, now: i64, max_inactive_interval: i32) -> Self {
        Self {
            id: id.into(),
            old_session_id: None,
            creation_time: now,
            last_accessed: now,
            previous_last_accessed: now,
            max_inactive_interval,
            is_new: true,
            previous_owner: None,
            repository_keys: None,
            mandatory_remote_keys: HashSet::new(),
        }
    }

    /// Rebuild metadata read back from a repository.
    #[must_use]
    pub fn existing(
        id: impl Into<String>,
        creation_time: i64,
        last_accessed: i64,
        max_inactive_interval: i32,
    ) -> Self {
        Self {
            id: id.into(),
            old_session_id: None,
            creation_time,
            last_accessed,
            previous_last_accessed: last_accessed,
            max_inactive_interval,
            is_new: false,
            previous_owner: None,
            repository_keys: None,
            mandatory_remote_keys: HashSet::new(),
        }
    }

    /// Absolute expiry instant in epoch milliseconds, or `None` if the
    /// session never expires.
    #[must_use]
    pub fn expires_at(&self) -> Option<i64> {
        (self.max_inactive_interval > 0)
            .then(|| self.last_accessed + i64::from(self.max_inactive_interval) * 1000)
    }

    /// Expiry instant computed from the access time before the last touch.
    #[must_use]
    pub fn previous_expires_at(&self) -> Option<i64> {
        (self.max_inactive_interval > 0)
            .then(|| self.previous_last_accessed + i64::from(self.max_inactive_interval) * 1000)
    }

    /// Whether the session has expired at `now` (epoch milliseconds).
    #[must_use]
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at().is_some_and(|at| now > at)
    }

    /// Whether the session has expired at the current wall-clock time.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_ms())
    }

    /// Record an access at `now`.
    pub fn touch(&mut self, now: i64) {
        self.previous_last_accessed = self.last_accessed;
        self.last_accessed = now;
    }

    /// Rename the session. Returns the previous id, or `None` when a rename
    /// already happened in this cycle.
    pub fn rename(&mut self, new_id: impl Into<String>) -> Option<String> {
        if self.old_session_id.is_some() {
            return None;
        }
        let old = std::mem::replace(&mut self.id, new_id.into());
        self.old_session_id = Some(old.clone());
        Some(old)
    }

    /// Start a new request cycle, allowing another rename.
    pub fn begin_cycle(&mut self) {
        self.old_session_id = None;
    }

    /// Whether `key` must always be read from and written to the repository.
    #[must_use]
    pub fn is_mandatory_remote(&self, key: &str) -> bool {
        self.mandatory_remote_keys.contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_is_strictly_after_deadline() {
        let data = SessionData::existing("s1", 1000, 1000, 500);
        assert_eq!(data.expires_at(), Some(501_000));
        assert!(!data.is_expired_at(1000));
        assert!(!data.is_expired_at(501_000));
        assert!(data.is_expired_at(1000 + 500_001));
    }

    #[test]
    fn non_positive_interval_never_expires() {
        let data = SessionData::existing("s1", 0, 0, 0);
        assert_eq!(data.expires_at(), None);
        assert!(!data.is_expired_at(i64::MAX));

        let data = SessionData::existing("s1", 0, 0, -1);
        assert!(!data.is_expired_at(i64::MAX));
    }

    #[test]
    fn touch_keeps_previous_access() {
        let mut data = SessionData::new("s1", 1000, 60);
        data.touch(5000);
        assert_eq!(data.previous_last_accessed, 1000);
        assert_eq!(data.last_accessed, 5000);
        assert_eq!(data.previous_expires_at(), Some(61_000));
        assert_eq!(data.expires_at(), Some(65_000));
    }

    #[test]
    fn rename_allowed_once_per_cycle() {
        let mut data = SessionData::new("A", 0, 60);
        assert_eq!(data.rename("B").as_deref(), Some("A"));
        assert_eq!(data.id, "B");
        assert_eq!(data.old_session_id.as_deref(), Some("A"));

        assert!(data.rename("C").is_none());
        assert_eq!(data.id, "B");

        data.begin_cycle();
        assert_eq!(data.rename("C").as_deref(), Some("B"));
    }

    #[test]
    fn value_kinds() {
        assert_eq!(ValueKind::of(&serde_json::json!("x")), ValueKind::String);
        assert_eq!(ValueKind::of(&serde_json::json!(1.5)), ValueKind::Number);
        assert_eq!(ValueKind::of(&serde_json::json!([1])), ValueKind::Array);
        assert_eq!(ValueKind::of(&serde_json::json!({"a": 1})), ValueKind::Object);
        let immutable = ValueKind::default_immutable();
        assert!(immutable.contains(&ValueKind::Bool));
        assert!(!immutable.contains(&ValueKind::Object));
    }
}
