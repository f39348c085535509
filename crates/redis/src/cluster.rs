//! Redis Cluster topology and the helpers it needs: hash slots and the
//! emulated cross-slot rename.

use async_trait::async_trait;
use deadpool_redis::cluster::{Config, Connection, Pool};
use deadpool_redis::{PoolConfig, Runtime, Timeouts};
use tracing::debug;

use crate::config::{ClusterMode, RedisConfig};
use crate::error::StoreError;
use crate::facade::{KeyType, RedisFacade, RenameReply, TxOp};
use crate::store::Topology;

const SLOTS: u16 = 16384;

/// CRC16/XMODEM as used by Redis Cluster.
fn crc16(bytes: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &b in bytes {
        crc ^= u16::from(b) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 == 0 {
                crc << 1
            } else {
                (crc << 1) ^ 0x1021
            };
        }
    }
    crc
}

/// Hash slot of `key`. A non-empty `{tag}` restricts hashing to the tag.
pub fn key_slot(key: &str) -> u16 {
    let bytes = key.as_bytes();
    let hashed = bytes
        .iter()
        .position(|&b| b == b'{')
        .and_then(|open| {
            bytes[open + 1..]
                .iter()
                .position(|&b| b == b'}')
                .filter(|&len| len > 0)
                .map(|len| &bytes[open + 1..open + 1 + len])
        })
        .unwrap_or(bytes);
    crc16(hashed) % SLOTS
}

/// Rename across hash slots by copying the value, then deleting the source.
///
/// Copies by type (string, hash, set, list, sorted set) and carries the
/// remaining TTL over. Returns [`RenameReply::Err`] when `old_key` does not
/// exist.
///
/// Not atomic: a crash between copy and delete leaves both keys. The stale
/// source expires on its own TTL and the next touch rewrites the new key.
pub async fn cross_slot_rename<F>(facade: &F, old_key: &str, new_key: &str) -> Result<RenameReply, StoreError>
where
    F: RedisFacade + ?Sized,
{
    let kind = facade.key_type(old_key).await?;
    debug!(old_key, new_key, ?kind, "emulating cross-slot rename");
    let target = [new_key.to_owned()];
    match kind {
        KeyType::None => return Ok(RenameReply::Err),
        KeyType::String => {
            if let Some(value) = facade.get(old_key).await? {
                facade.set(new_key, &value).await?;
            }
        }
        KeyType::Hash => {
            let fields = facade.hget_all(old_key).await?;
            facade.del(&target).await?;
            facade.hmset(new_key, &fields).await?;
        }
        KeyType::Set => {
            let members = facade.smembers(old_key).await?;
            facade.del(&target).await?;
            facade.sadd(new_key, &members).await?;
        }
        KeyType::List => {
            let values = facade.lrange(old_key, 0, -1).await?;
            facade.del(&target).await?;
            facade.rpush(new_key, &values).await?;
        }
        KeyType::ZSet => {
            let members: Vec<(f64, String)> = facade
                .zrange_with_scores(old_key)
                .await?
                .into_iter()
                .map(|(member, score)| (score, member))
                .collect();
            facade.del(&target).await?;
            facade.zadd(new_key, &members).await?;
        }
        KeyType::Other(kind) => {
            return Err(StoreError::Unsupported(format!(
                "cross-slot rename of a {kind} key"
            )));
        }
    }
    let ttl = facade.pttl(old_key).await?;
    if ttl > 0 {
        facade.pexpire(new_key, ttl).await?;
    }
    facade.del(&[old_key.to_owned()]).await?;
    Ok(RenameReply::Ok)
}

/// Redis Cluster behind a `deadpool-redis` cluster pool.
pub struct ClusterTopology {
    pool: Pool,
    node_urls: Vec<String>,
}

impl ClusterTopology {
    pub fn new(config: &RedisConfig) -> Result<Self, StoreError> {
        let node_urls = config.urls();
        let mut cfg = Config::from_urls(node_urls.clone());
        let mut pool = PoolConfig::new(config.pool_size);
        pool.timeouts = Timeouts {
            wait: Some(config.connect_timeout),
            create: Some(config.connect_timeout),
            recycle: Some(config.connect_timeout),
        };
        cfg.pool = Some(pool);
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self { pool, node_urls })
    }
}

#[async_trait]
impl Topology for ClusterTopology {
    type Connection = Connection;

    async fn connection(&self) -> Result<Connection, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))
    }

    async fn clients(&self) -> Result<Vec<redis::Client>, StoreError> {
        self.node_urls
            .iter()
            .map(|url| redis::Client::open(url.as_str()).map_err(StoreError::from))
            .collect()
    }

    fn mode(&self) -> ClusterMode {
        ClusterMode::Cluster
    }

    fn partition(&self, pinned_key: &str, ops: Vec<TxOp>) -> (Vec<TxOp>, Vec<TxOp>) {
        let slot = key_slot(pinned_key);
        ops.into_iter().partition(|op| key_slot(op.key()) == slot)
    }

    fn needs_emulated_rename(&self, old_key: &str, new_key: &str) -> bool {
        key_slot(old_key) != key_slot(new_key)
    }

    fn close(&self) {
        self.pool.close();
    }
}

#[cfg(test)]
mod tests {
    use crate::memory::MemoryFacade;

    use super::*;

    #[test]
    fn slots_match_redis() {
        assert_eq!(key_slot("foo"), 12182);
        assert_eq!(key_slot("123456789"), 12739);
    }

    #[test]
    fn hash_tags_pin_slots() {
        assert_eq!(key_slot("cairn:a:{abc}"), key_slot("cairn:b:expire:{abc}"));
        assert_eq!(key_slot("{abc}"), key_slot("abc"));
        // Empty tags hash the whole key.
        assert_eq!(key_slot("{}x"), crc16(b"{}x") % SLOTS);
    }

    #[tokio::test]
    async fn hash_rename_copies_then_deletes() {
        let facade = MemoryFacade::with_mode(ClusterMode::Cluster);
        let (old, new) = ("cairn:s:{A}", "cairn:s:{B}");
        assert_ne!(key_slot(old), key_slot(new));
        facade
            .hmset(old, &[("user".into(), b"alice".to_vec())])
            .await
            .unwrap();
        facade.pexpire(old, 60_000).await.unwrap();
        facade.clear_journal();

        let reply = facade.rename(old, new).await.unwrap();
        assert_eq!(reply.to_string(), "OK");

        let commands = facade.commands();
        let position = |name: &str| commands.iter().position(|c| c == name).unwrap();
        assert!(position("TYPE") < position("HGETALL"));
        assert!(position("HGETALL") < position("HMSET"));
        assert_eq!(commands.last().map(String::as_str), Some("DEL"));

        assert!(!facade.exists(old).await.unwrap());
        assert_eq!(facade.hget(new, "user").await.unwrap(), Some(b"alice".to_vec()));
        assert!(facade.pttl(new).await.unwrap() > 0);
    }

    #[tokio::test]
    async fn missing_key_rename_is_err() {
        let facade = MemoryFacade::with_mode(ClusterMode::Cluster);
        let reply = facade.rename("cairn:s:{A}", "cairn:s:{B}").await.unwrap();
        assert_eq!(reply.to_string(), "ERR");
        assert_eq!(facade.commands(), vec!["TYPE"]);
    }

    #[tokio::test]
    async fn other_types_are_copied() {
        let facade = MemoryFacade::with_mode(ClusterMode::Cluster);
        facade.sadd("{a}set", &["x".into(), "y".into()]).await.unwrap();
        facade.rpush("{a}list", &[b"1".to_vec(), b"2".to_vec()]).await.unwrap();
        facade.zadd("{a}zset", &[(2.0, "m".into())]).await.unwrap();
        facade.set("{a}str", b"s").await.unwrap();

        for kind in ["set", "list", "zset", "str"] {
            let reply = facade
                .rename(&format!("{{a}}{kind}"), &format!("{{b}}{kind}"))
                .await
                .unwrap();
            assert_eq!(reply, RenameReply::Ok, "{kind}");
        }
        assert_eq!(facade.smembers("{b}set").await.unwrap(), vec!["x", "y"]);
        assert_eq!(
            facade.lrange("{b}list", 0, -1).await.unwrap(),
            vec![b"1".to_vec(), b"2".to_vec()]
        );
        assert_eq!(
            facade.zrange_with_scores("{b}zset").await.unwrap(),
            vec![("m".to_owned(), 2.0)]
        );
        assert_eq!(facade.get("{b}str").await.unwrap(), Some(b"s".to_vec()));
        assert_eq!(facade.keys().len(), 4);
    }
}
