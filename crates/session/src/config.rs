use std::collections::HashSet;

use serde::Deserialize;

use crate::data::ValueKind;
use crate::error::SessionError;

/// When attribute changes are scheduled for replication to the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationTrigger {
    /// Only `set_attribute` / `remove_attribute` mark an attribute changed.
    Set,
    /// Reading a value whose kind is not immutable also marks it changed,
    /// since the caller may mutate it without calling `set_attribute`.
    SetAndNonPrimitiveGet,
}

/// An encryption key kept for reading values sealed before a rotation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RetiredKey {
    /// Key id the values were sealed under.
    pub id: String,
    /// Key material, in the same forms as `encryption_key`.
    pub key: String,
}

/// Configuration of the session layer.
///
/// # Example
///
/// ```toml
/// [session]
/// namespace = "shop"
/// max_inactive_interval = 1800
/// sticky = true
/// node = "web-1"
/// replication_trigger = "set"
/// non_cacheable_attributes = ["cart"]
/// encryption_key = "current passphrase"
/// encryption_key_id = "2024-06"
///
/// [[session.retired_encryption_keys]]
/// id = "2023-11"
/// key = "previous passphrase"
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfiguration {
    /// Logical partition of the session keyspace.
    pub namespace: String,
    /// Default inactivity timeout in seconds; `<= 0` never expires.
    pub max_inactive_interval: i32,
    /// Sticky-session deployment: expiration favours the owning node.
    pub sticky: bool,
    /// Identifier of this node.
    pub node: String,
    /// Share one in-memory session across concurrent requests for the same id.
    pub allow_cache: bool,
    /// Write to the repository on every concurrent commit, not only the last.
    pub commit_on_all_concurrent: bool,
    /// Replication policy for attribute reads.
    pub replication_trigger: ReplicationTrigger,
    /// Value kinds that are not marked for replication when read.
    pub immutable_kinds: HashSet<ValueKind>,
    /// Attribute keys that always bypass the local cache.
    pub non_cacheable_attributes: HashSet<String>,
    /// Optional key enabling attribute encryption. Either 32 raw bytes as
    /// hex/base64, or a passphrase that is hashed into a key.
    pub encryption_key: Option<String>,
    /// Key id stamped on values sealed with `encryption_key`.
    pub encryption_key_id: String,
    /// Earlier keys, still accepted when reading.
    pub retired_encryption_keys: Vec<RetiredKey>,
}

impl Default for SessionConfiguration {
    fn default() -> Self {
        Self {
            namespace: "default".to_owned(),
            max_inactive_interval: 1800,
            sticky: false,
            node: default_node(),
            allow_cache: true,
            commit_on_all_concurrent: false,
            replication_trigger: ReplicationTrigger::SetAndNonPrimitiveGet,
            immutable_kinds: ValueKind::default_immutable(),
            non_cacheable_attributes: HashSet::new(),
            encryption_key: None,
            encryption_key_id: "k0".to_owned(),
            retired_encryption_keys: Vec::new(),
        }
    }
}

impl SessionConfiguration {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.namespace.is_empty() {
            return Err(SessionError::Config("namespace must not be empty".into()));
        }
        if self.namespace.contains(['{', '}', ':']) {
            return Err(SessionError::Config(format!(
                "namespace {:?} must not contain '{{', '}}' or ':'",
                self.namespace
            )));
        }
        if self.node.is_empty() {
            return Err(SessionError::Config("node must not be empty".into()));
        }
        if self.node.contains(['{', '}', ':']) {
            return Err(SessionError::Config(format!(
                "node {:?} must not contain '{{', '}}' or ':'",
                self.node
            )));
        }
        if self.encryption_key.as_deref().is_some_and(str::is_empty) {
            return Err(SessionError::Config(
                "encryption_key must not be empty when set".into(),
            ));
        }
        self.validate_key_ids()
    }

    fn validate_key_ids(&self) -> Result<(), SessionError> {
        if self.encryption_key.is_none() {
            if !self.retired_encryption_keys.is_empty() {
                return Err(SessionError::Config(
                    "retired_encryption_keys require an encryption_key".into(),
                ));
            }
            return Ok(());
        }
        let mut seen = HashSet::new();
        let ids = std::iter::once(self.encryption_key_id.as_str())
            .chain(self.retired_encryption_keys.iter().map(|k| k.id.as_str()));
        for id in ids {
            if id.is_empty() || id.len() > 255 {
                return Err(SessionError::Config(format!(
                    "encryption key id {id:?} must be 1 to 255 bytes"
                )));
            }
            if !seen.insert(id) {
                return Err(SessionError::Config(format!("duplicate encryption key id {id:?}")));
            }
        }
        if self.retired_encryption_keys.iter().any(|k| k.key.is_empty()) {
            return Err(SessionError::Config("retired encryption keys must not be empty".into()));
        }
        Ok(())
    }

    /// Whether reading `value` should mark the attribute changed.
    #[must_use]
    pub fn replicates_on_get(&self, value: &crate::AttributeValue) -> bool {
        self.replication_trigger == ReplicationTrigger::SetAndNonPrimitiveGet
            && !self.immutable_kinds.contains(&ValueKind::of(value))
    }
}

fn default_node() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}
