//! Topology-neutral view of the Redis commands the session repository uses.

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use redis::Pipeline;

use crate::config::ClusterMode;
use crate::error::StoreError;

/// Write command that may run inside [`RedisFacade::transaction`].
#[derive(Debug, Clone, PartialEq)]
pub enum TxOp {
    HDel { key: String, fields: Vec<String> },
    HMSet { key: String, fields: Vec<(String, Vec<u8>)> },
    Del { key: String },
    Set { key: String, value: Vec<u8> },
    PExpireAt { key: String, at_ms: i64 },
    Persist { key: String },
    SAdd { key: String, members: Vec<String> },
    SRem { key: String, members: Vec<String> },
    ZAdd { key: String, member: String, score: f64 },
    ZRem { key: String, member: String },
}

impl TxOp {
    /// Key the command writes.
    pub fn key(&self) -> &str {
        match self {
            Self::HDel { key, .. }
            | Self::HMSet { key, .. }
            | Self::Del { key }
            | Self::Set { key, .. }
            | Self::PExpireAt { key, .. }
            | Self::Persist { key }
            | Self::SAdd { key, .. }
            | Self::SRem { key, .. }
            | Self::ZAdd { key, .. }
            | Self::ZRem { key, .. } => key,
        }
    }

    /// Whether the command has nothing to do (empty field or member list).
    /// Redis rejects such commands, so they are dropped before sending.
    pub fn is_noop(&self) -> bool {
        match self {
            Self::HDel { fields, .. } => fields.is_empty(),
            Self::HMSet { fields, .. } => fields.is_empty(),
            Self::SAdd { members, .. } | Self::SRem { members, .. } => members.is_empty(),
            _ => false,
        }
    }

    pub(crate) fn append_to(&self, pipe: &mut Pipeline) {
        match self {
            Self::HDel { key, fields } => {
                pipe.cmd("HDEL").arg(key).arg(fields).ignore();
            }
            Self::HMSet { key, fields } => {
                let cmd = pipe.cmd("HSET").arg(key);
                for (field, value) in fields {
                    cmd.arg(field).arg(value.as_slice());
                }
                cmd.ignore();
            }
            Self::Del { key } => {
                pipe.cmd("DEL").arg(key).ignore();
            }
            Self::Set { key, value } => {
                pipe.cmd("SET").arg(key).arg(value.as_slice()).ignore();
            }
            Self::PExpireAt { key, at_ms } => {
                pipe.cmd("PEXPIREAT").arg(key).arg(*at_ms).ignore();
            }
            Self::Persist { key } => {
                pipe.cmd("PERSIST").arg(key).ignore();
            }
            Self::SAdd { key, members } => {
                pipe.cmd("SADD").arg(key).arg(members).ignore();
            }
            Self::SRem { key, members } => {
                pipe.cmd("SREM").arg(key).arg(members).ignore();
            }
            Self::ZAdd { key, member, score } => {
                pipe.cmd("ZADD").arg(key).arg(*score).arg(member).ignore();
            }
            Self::ZRem { key, member } => {
                pipe.cmd("ZREM").arg(key).arg(member).ignore();
            }
        }
    }
}

/// Result of `TYPE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyType {
    None,
    String,
    Hash,
    Set,
    List,
    ZSet,
    Other(String),
}

impl From<&str> for KeyType {
    fn from(s: &str) -> Self {
        match s {
            "none" => Self::None,
            "string" => Self::String,
            "hash" => Self::Hash,
            "set" => Self::Set,
            "list" => Self::List,
            "zset" => Self::ZSet,
            other => Self::Other(other.to_owned()),
        }
    }
}

/// Status reply of `RENAME`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenameReply {
    Ok,
    /// The source key does not exist.
    Err,
}

impl fmt::Display for RenameReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ok => "OK",
            Self::Err => "ERR",
        })
    }
}

/// One message received on a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    pub channel: String,
    /// Pattern that matched, for pattern subscriptions.
    pub pattern: Option<String>,
    pub payload: String,
}

/// Stream of messages; it ends when the underlying connection is lost.
pub type Subscription = BoxStream<'static, PubSubMessage>;

/// The Redis commands cairn needs, independent of deployment topology.
///
/// Values are raw bytes; members of sets and sorted sets and hash field
/// names are strings.
#[async_trait]
pub trait RedisFacade: Send + Sync {
    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Values of `fields`, positionally aligned.
    async fn hmget(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<Vec<u8>>>, StoreError>;

    async fn hget_all(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    async fn hkeys(&self, key: &str) -> Result<Vec<String>, StoreError>;

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<(), StoreError>;

    async fn hmset(&self, key: &str, fields: &[(String, Vec<u8>)]) -> Result<(), StoreError>;

    /// Set `field` only if absent. Returns whether it was set.
    async fn hsetnx(&self, key: &str, field: &str, value: &[u8]) -> Result<bool, StoreError>;

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<u64, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    async fn del(&self, keys: &[String]) -> Result<u64, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    async fn key_type(&self, key: &str) -> Result<KeyType, StoreError>;

    async fn pexpire(&self, key: &str, ttl_ms: i64) -> Result<bool, StoreError>;

    async fn pexpire_at(&self, key: &str, at_ms: i64) -> Result<bool, StoreError>;

    /// Remaining time to live in milliseconds; `-1` without expiry, `-2` when
    /// the key does not exist.
    async fn pttl(&self, key: &str) -> Result<i64, StoreError>;

    async fn persist(&self, key: &str) -> Result<bool, StoreError>;

    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64, StoreError>;

    async fn srem(&self, key: &str, members: &[String]) -> Result<u64, StoreError>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;

    async fn rpush(&self, key: &str, values: &[Vec<u8>]) -> Result<u64, StoreError>;

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<Vec<u8>>, StoreError>;

    async fn zadd(&self, key: &str, members: &[(f64, String)]) -> Result<u64, StoreError>;

    async fn zrem(&self, key: &str, members: &[String]) -> Result<u64, StoreError>;

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>, StoreError>;

    /// Every member with its score, lowest score first.
    async fn zrange_with_scores(&self, key: &str) -> Result<Vec<(String, f64)>, StoreError>;

    /// Atomically read and remove all members scored within `[min, max]`.
    async fn zpop_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>, StoreError>;

    async fn rename(&self, old_key: &str, new_key: &str) -> Result<RenameReply, StoreError>;

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError>;

    /// Open a dedicated subscription to `patterns` and `channels`.
    async fn subscribe(
        &self,
        patterns: &[String],
        channels: &[String],
    ) -> Result<Subscription, StoreError>;

    /// Apply `ops` in one MULTI/EXEC. In cluster mode only the ops on
    /// `pinned_key`'s slot are atomic; the rest follow in the same call.
    async fn transaction(&self, pinned_key: &str, ops: Vec<TxOp>) -> Result<(), StoreError>;

    /// Enable keyspace expiry events (`notify-keyspace-events Ex`).
    async fn configure_keyspace_notifications(&self) -> Result<(), StoreError>;

    fn mode(&self) -> ClusterMode;

    /// Release pooled connections.
    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_ops_are_detected() {
        assert!(TxOp::HDel { key: "k".into(), fields: vec![] }.is_noop());
        assert!(TxOp::SAdd { key: "k".into(), members: vec![] }.is_noop());
        assert!(!TxOp::Del { key: "k".into() }.is_noop());
        assert_eq!(TxOp::Persist { key: "p".into() }.key(), "p");
    }

    #[test]
    fn key_types_and_replies() {
        assert_eq!(KeyType::from("hash"), KeyType::Hash);
        assert_eq!(KeyType::from("stream"), KeyType::Other("stream".into()));
        assert_eq!(RenameReply::Ok.to_string(), "OK");
        assert_eq!(RenameReply::Err.to_string(), "ERR");
    }
}
