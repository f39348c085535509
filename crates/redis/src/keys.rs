//! Redis key scheme for sessions and their expiration indexes.
//!
//! Every key that belongs to one session carries the id inside braces, so in
//! cluster mode the session hash and its sentinel key hash to the same slot.

/// Prefix of reserved hash fields. Attribute names never start with it.
pub const META_PREFIX: &str = "#:";
pub const LAST_ACCESSED: &str = "#:lastAccessed";
pub const MAX_INACTIVE_INTERVAL: &str = "#:maxInactiveInterval";
pub const CREATION_TIME: &str = "#:creationTime";
pub const INVALID_SESSION: &str = "#:invalidSession";
pub const OWNER: &str = "#:owner";

/// Whether `field` is a reserved meta field rather than an attribute.
pub fn is_meta_field(field: &str) -> bool {
    field.starts_with(META_PREFIX)
}

/// Renders all keys for one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeys {
    namespace: String,
    prefix: String,
}

impl SessionKeys {
    /// Keys under `cairn:<namespace>:`.
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_owned(),
            prefix: format!("cairn:{namespace}:"),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `cairn:<ns>:{<id>}`
    pub fn session_key(&self, id: &str) -> String {
        format!("{}{{{id}}}", self.prefix)
    }

    /// Session id carried by a session key of this namespace.
    pub fn id_from_session_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('{'))
            .and_then(|rest| rest.strip_suffix('}'))
    }

    /// Sentinel key whose natural expiry signals the session's expiry.
    /// Sticky deployments include the owning node.
    pub fn expire_key(&self, id: &str, node: Option<&str>) -> String {
        match node {
            Some(node) => format!("{}expire:{node}:{{{id}}}", self.prefix),
            None => format!("{}expire:{{{id}}}", self.prefix),
        }
    }

    /// Split a sentinel key into `(node, id)`. Keys of other namespaces or
    /// shapes yield `None`.
    pub fn parse_expire_key<'a>(&self, key: &'a str) -> Option<(Option<&'a str>, &'a str)> {
        let rest = key.strip_prefix(self.prefix.as_str())?.strip_prefix("expire:")?;
        let open = rest.find('{')?;
        let id = rest[open + 1..].strip_suffix('}')?;
        let node = match &rest[..open] {
            "" => None,
            owner => Some(owner.strip_suffix(':')?),
        };
        Some((node, id))
    }

    /// Minute bucket listing sentinel keys expiring in that minute.
    pub fn expirations_bucket(&self, minute_ms: i64) -> String {
        format!("{}expirations:{minute_ms}", self.prefix)
    }

    /// Safety-net bucket listing session ids to expire unconditionally.
    pub fn forced_expirations_bucket(&self, minute_ms: i64) -> String {
        format!("{}forced-expirations:{minute_ms}", self.prefix)
    }

    /// Sorted set of every session scored by expiry instant.
    pub fn all_sessions_set(&self) -> String {
        format!("{}all-sessions-set:{}", self.prefix, self.namespace)
    }

    /// Channel carrying `old:new` id changes between nodes.
    pub fn redirection_channel(&self) -> String {
        format!("{}redirection", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_session_keys() {
        let keys = SessionKeys::new("shop");
        assert_eq!(keys.session_key("abc"), "cairn:shop:{abc}");
        assert_eq!(keys.id_from_session_key("cairn:shop:{abc}"), Some("abc"));
        assert_eq!(keys.id_from_session_key("cairn:other:{abc}"), None);
        assert_eq!(keys.all_sessions_set(), "cairn:shop:all-sessions-set:shop");
        assert_eq!(keys.redirection_channel(), "cairn:shop:redirection");
        assert_eq!(keys.expirations_bucket(60_000), "cairn:shop:expirations:60000");
    }

    #[test]
    fn expire_keys_round_trip_node() {
        let keys = SessionKeys::new("shop");
        let plain = keys.expire_key("abc", None);
        assert_eq!(plain, "cairn:shop:expire:{abc}");
        assert_eq!(keys.parse_expire_key(&plain), Some((None, "abc")));

        let sticky = keys.expire_key("abc.n1", Some("n1"));
        assert_eq!(sticky, "cairn:shop:expire:n1:{abc.n1}");
        assert_eq!(keys.parse_expire_key(&sticky), Some((Some("n1"), "abc.n1")));

        assert_eq!(keys.parse_expire_key("cairn:shop:{abc}"), None);
        assert_eq!(keys.parse_expire_key("elsewhere:expire:{abc}"), None);
    }

    #[test]
    fn meta_fields_share_prefix() {
        for field in [LAST_ACCESSED, MAX_INACTIVE_INTERVAL, CREATION_TIME, INVALID_SESSION, OWNER] {
            assert!(is_meta_field(field));
        }
        assert!(!is_meta_field("user"));
    }
}
