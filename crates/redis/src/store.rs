use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionLike;
use redis::{Cmd, ErrorKind, FromRedisValue, Pipeline, RedisResult};
use tracing::{debug, warn};

use crate::cluster::cross_slot_rename;
use crate::config::{ClusterMode, RedisConfig};
use crate::error::StoreError;
use crate::facade::{KeyType, PubSubMessage, RedisFacade, RenameReply, Subscription, TxOp};

/// How a deployment topology hands out connections.
///
/// [`RedisStore`] implements every command once on top of this; topologies
/// only differ in where connections come from and, for cluster mode, in how
/// multi-key work is split by slot.
#[async_trait]
pub trait Topology: Send + Sync + 'static {
    type Connection: ConnectionLike + Send;

    /// A pooled connection for regular commands.
    async fn connection(&self) -> Result<Self::Connection, StoreError>;

    /// Clients for the data nodes, used for pub/sub and node-local
    /// configuration.
    async fn clients(&self) -> Result<Vec<redis::Client>, StoreError>;

    fn mode(&self) -> ClusterMode;

    /// Split transaction ops into those that can run atomically with
    /// `pinned_key` and the rest.
    fn partition(&self, _pinned_key: &str, ops: Vec<TxOp>) -> (Vec<TxOp>, Vec<TxOp>) {
        (ops, Vec::new())
    }

    /// Whether `RENAME old new` must be emulated.
    fn needs_emulated_rename(&self, _old_key: &str, _new_key: &str) -> bool {
        false
    }

    /// A command failed with a connection error.
    fn connection_failed(&self) {}

    fn close(&self);
}

/// [`RedisFacade`] over any [`Topology`].
///
/// Pool checkout is bounded by the pool's wait timeout; each command round
/// trip by the socket timeout.
pub struct RedisStore<T> {
    topology: T,
    connect_timeout: Duration,
    socket_timeout: Duration,
}

impl<T: Topology> RedisStore<T> {
    pub fn new(topology: T, config: &RedisConfig) -> Self {
        Self {
            topology,
            connect_timeout: config.connect_timeout,
            socket_timeout: config.socket_timeout,
        }
    }

    pub fn topology(&self) -> &T {
        &self.topology
    }

    /// Run `f` on a fresh connection within the socket timeout. The outer
    /// result carries connection and timeout failures; the inner one is the
    /// server's reply.
    async fn with_connection<R, F, Fut>(&self, f: F) -> Result<RedisResult<R>, StoreError>
    where
        F: FnOnce(T::Connection) -> Fut,
        Fut: Future<Output = RedisResult<R>>,
    {
        let conn = self.topology.connection().await?;
        match tokio::time::timeout(self.socket_timeout, f(conn)).await {
            Ok(Err(e)) if e.is_connection_dropped() || e.is_io_error() => {
                self.topology.connection_failed();
                Err(e.into())
            }
            Ok(reply) => Ok(reply),
            Err(_) => Err(StoreError::Timeout(self.socket_timeout)),
        }
    }

    async fn query<R: FromRedisValue>(&self, cmd: Cmd) -> Result<R, StoreError> {
        let reply = self
            .with_connection(|mut conn| async move { cmd.query_async(&mut conn).await })
            .await?;
        Ok(reply?)
    }

    async fn exec_pipeline(&self, pipe: Pipeline) -> Result<(), StoreError> {
        let reply: RedisResult<()> = self
            .with_connection(|mut conn| async move { pipe.query_async(&mut conn).await })
            .await?;
        Ok(reply?)
    }
}

fn score_arg(score: f64) -> String {
    if score == f64::INFINITY {
        "+inf".to_owned()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_owned()
    } else {
        score.to_string()
    }
}

fn to_message(msg: &redis::Msg) -> Option<PubSubMessage> {
    let payload: String = msg.get_payload().ok()?;
    let pattern = if msg.from_pattern() {
        msg.get_pattern::<String>().ok()
    } else {
        None
    };
    Some(PubSubMessage {
        channel: msg.get_channel_name().to_owned(),
        pattern,
        payload,
    })
}

#[async_trait]
impl<T: Topology> RedisFacade for RedisStore<T> {
    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut cmd = redis::cmd("HGET");
        cmd.arg(key).arg(field);
        self.query(cmd).await
    }

    async fn hmget(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<Vec<u8>>>, StoreError> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        let mut cmd = redis::cmd("HMGET");
        cmd.arg(key).arg(fields);
        self.query(cmd).await
    }

    async fn hget_all(&self, key: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(key);
        let fields: HashMap<String, Vec<u8>> = self.query(cmd).await?;
        Ok(fields.into_iter().collect())
    }

    async fn hkeys(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut cmd = redis::cmd("HKEYS");
        cmd.arg(key);
        self.query(cmd).await
    }

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key).arg(field).arg(value);
        let _: i64 = self.query(cmd).await?;
        Ok(())
    }

    async fn hmset(&self, key: &str, fields: &[(String, Vec<u8>)]) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(field).arg(value.as_slice());
        }
        let _: i64 = self.query(cmd).await?;
        Ok(())
    }

    async fn hsetnx(&self, key: &str, field: &str, value: &[u8]) -> Result<bool, StoreError> {
        let mut cmd = redis::cmd("HSETNX");
        cmd.arg(key).arg(field).arg(value);
        self.query(cmd).await
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<u64, StoreError> {
        if fields.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd("HDEL");
        cmd.arg(key).arg(fields);
        self.query(cmd).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.query(cmd).await
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        self.query(cmd).await
    }

    async fn del(&self, keys: &[String]) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        // One DEL per key keeps cluster mode free of cross-slot errors.
        let mut removed = 0;
        for key in keys {
            let mut cmd = redis::cmd("DEL");
            cmd.arg(key);
            let n: u64 = self.query(cmd).await?;
            removed += n;
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut cmd = redis::cmd("EXISTS");
        cmd.arg(key);
        self.query(cmd).await
    }

    async fn key_type(&self, key: &str) -> Result<KeyType, StoreError> {
        let mut cmd = redis::cmd("TYPE");
        cmd.arg(key);
        let kind: String = self.query(cmd).await?;
        Ok(KeyType::from(kind.as_str()))
    }

    async fn pexpire(&self, key: &str, ttl_ms: i64) -> Result<bool, StoreError> {
        let mut cmd = redis::cmd("PEXPIRE");
        cmd.arg(key).arg(ttl_ms);
        self.query(cmd).await
    }

    async fn pexpire_at(&self, key: &str, at_ms: i64) -> Result<bool, StoreError> {
        let mut cmd = redis::cmd("PEXPIREAT");
        cmd.arg(key).arg(at_ms);
        self.query(cmd).await
    }

    async fn pttl(&self, key: &str) -> Result<i64, StoreError> {
        let mut cmd = redis::cmd("PTTL");
        cmd.arg(key);
        self.query(cmd).await
    }

    async fn persist(&self, key: &str) -> Result<bool, StoreError> {
        let mut cmd = redis::cmd("PERSIST");
        cmd.arg(key);
        self.query(cmd).await
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64, StoreError> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd("SADD");
        cmd.arg(key).arg(members);
        self.query(cmd).await
    }

    async fn srem(&self, key: &str, members: &[String]) -> Result<u64, StoreError> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd("SREM");
        cmd.arg(key).arg(members);
        self.query(cmd).await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut cmd = redis::cmd("SMEMBERS");
        cmd.arg(key);
        self.query(cmd).await
    }

    async fn rpush(&self, key: &str, values: &[Vec<u8>]) -> Result<u64, StoreError> {
        if values.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd("RPUSH");
        cmd.arg(key);
        for value in values {
            cmd.arg(value.as_slice());
        }
        self.query(cmd).await
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<Vec<u8>>, StoreError> {
        let mut cmd = redis::cmd("LRANGE");
        cmd.arg(key).arg(start).arg(stop);
        self.query(cmd).await
    }

    async fn zadd(&self, key: &str, members: &[(f64, String)]) -> Result<u64, StoreError> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd("ZADD");
        cmd.arg(key);
        for (score, member) in members {
            cmd.arg(score_arg(*score)).arg(member);
        }
        self.query(cmd).await
    }

    async fn zrem(&self, key: &str, members: &[String]) -> Result<u64, StoreError> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd("ZREM");
        cmd.arg(key).arg(members);
        self.query(cmd).await
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>, StoreError> {
        let mut cmd = redis::cmd("ZRANGEBYSCORE");
        cmd.arg(key).arg(score_arg(min)).arg(score_arg(max));
        self.query(cmd).await
    }

    async fn zrange_with_scores(&self, key: &str) -> Result<Vec<(String, f64)>, StoreError> {
        let mut cmd = redis::cmd("ZRANGE");
        cmd.arg(key).arg(0).arg(-1).arg("WITHSCORES");
        self.query(cmd).await
    }

    async fn zpop_by_score(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>, StoreError> {
        let (min, max) = (score_arg(min), score_arg(max));
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(&min)
            .arg(&max)
            .cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg(&min)
            .arg(&max)
            .ignore();
        let reply: RedisResult<(Vec<String>,)> = self
            .with_connection(|mut conn| async move { pipe.query_async(&mut conn).await })
            .await?;
        let (members,) = reply?;
        Ok(members)
    }

    async fn rename(&self, old_key: &str, new_key: &str) -> Result<RenameReply, StoreError> {
        if self.topology.needs_emulated_rename(old_key, new_key) {
            return cross_slot_rename(self, old_key, new_key).await;
        }
        let mut cmd = redis::cmd("RENAME");
        cmd.arg(old_key).arg(new_key);
        let reply: RedisResult<()> = self
            .with_connection(|mut conn| async move { cmd.query_async(&mut conn).await })
            .await?;
        match reply {
            Ok(()) => Ok(RenameReply::Ok),
            Err(e) if e.kind() == ErrorKind::ResponseError && e.to_string().contains("no such key") => {
                Ok(RenameReply::Err)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), StoreError> {
        let mut cmd = redis::cmd("PUBLISH");
        cmd.arg(channel).arg(message);
        let receivers: i64 = self.query(cmd).await?;
        debug!(channel, receivers, "published");
        Ok(())
    }

    async fn subscribe(
        &self,
        patterns: &[String],
        channels: &[String],
    ) -> Result<Subscription, StoreError> {
        let clients = self.topology.clients().await?;
        let mut streams = Vec::with_capacity(clients.len());
        for (i, client) in clients.iter().enumerate() {
            let mut pubsub = tokio::time::timeout(self.connect_timeout, client.get_async_pubsub())
                .await
                .map_err(|_| StoreError::Timeout(self.connect_timeout))??;
            // Expiry events are node-local; regular channels reach every node.
            for pattern in patterns {
                pubsub.psubscribe(pattern).await?;
            }
            if i == 0 {
                for channel in channels {
                    pubsub.subscribe(channel).await?;
                }
            }
            streams.push(
                pubsub
                    .into_on_message()
                    .filter_map(|msg| futures::future::ready(to_message(&msg)))
                    .boxed(),
            );
        }
        Ok(futures::stream::select_all(streams).boxed())
    }

    async fn transaction(&self, pinned_key: &str, ops: Vec<TxOp>) -> Result<(), StoreError> {
        let ops: Vec<TxOp> = ops.into_iter().filter(|op| !op.is_noop()).collect();
        let (atomic, rest) = self.topology.partition(pinned_key, ops);
        if !atomic.is_empty() {
            let mut pipe = redis::pipe();
            pipe.atomic();
            for op in &atomic {
                op.append_to(&mut pipe);
            }
            self.exec_pipeline(pipe).await?;
        }
        for op in &rest {
            let mut pipe = redis::pipe();
            op.append_to(&mut pipe);
            self.exec_pipeline(pipe).await?;
        }
        Ok(())
    }

    async fn configure_keyspace_notifications(&self) -> Result<(), StoreError> {
        for client in self.topology.clients().await? {
            let mut conn = client.get_multiplexed_async_connection().await?;
            let mut cmd = redis::cmd("CONFIG");
            cmd.arg("SET").arg("notify-keyspace-events").arg("Ex");
            if let Err(e) = cmd.query_async::<()>(&mut conn).await {
                warn!(error = %e, "could not enable keyspace notifications");
            }
        }
        Ok(())
    }

    fn mode(&self) -> ClusterMode {
        self.topology.mode()
    }

    async fn close(&self) {
        self.topology.close();
    }
}
