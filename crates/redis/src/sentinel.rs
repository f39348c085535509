use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::sentinel::{Sentinel, SentinelNodeConnectionInfo};
use redis::{RedisConnectionInfo, TlsMode};
use secrecy::ExposeSecret;
use tracing::{info, warn};

use crate::config::{ClusterMode, RedisConfig};
use crate::error::StoreError;
use crate::store::Topology;

/// Master discovered through Redis Sentinel.
///
/// Commands share one multiplexed connection to the current master. A
/// connection error drops it, so the next command asks the sentinels again
/// and follows a failover.
pub struct SentinelTopology {
    sentinel: tokio::sync::Mutex<Sentinel>,
    master: String,
    node_info: SentinelNodeConnectionInfo,
    connect_timeout: Duration,
    current: Mutex<Option<MultiplexedConnection>>,
}

impl SentinelTopology {
    pub fn new(config: &RedisConfig) -> Result<Self, StoreError> {
        let sentinel = Sentinel::build(config.sentinel_urls())?;
        let node_info = SentinelNodeConnectionInfo {
            tls_mode: config.tls.then_some(TlsMode::Secure),
            redis_connection_info: Some(RedisConnectionInfo {
                db: config.database,
                password: config
                    .password
                    .as_ref()
                    .map(|p| p.expose_secret().to_owned()),
                ..RedisConnectionInfo::default()
            }),
        };
        Ok(Self {
            sentinel: tokio::sync::Mutex::new(sentinel),
            master: config.master.clone(),
            node_info,
            connect_timeout: config.connect_timeout,
            current: Mutex::new(None),
        })
    }

    async fn master_client(&self) -> Result<redis::Client, StoreError> {
        let mut sentinel = self.sentinel.lock().await;
        let client = tokio::time::timeout(
            self.connect_timeout,
            sentinel.async_master_for(&self.master, Some(&self.node_info)),
        )
        .await
        .map_err(|_| StoreError::Timeout(self.connect_timeout))??;
        Ok(client)
    }
}

#[async_trait]
impl Topology for SentinelTopology {
    type Connection = MultiplexedConnection;

    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        if let Some(conn) = self.current.lock().clone() {
            return Ok(conn);
        }
        let client = self.master_client().await?;
        let conn = tokio::time::timeout(
            self.connect_timeout,
            client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| StoreError::Timeout(self.connect_timeout))??;
        info!(master = %self.master, "connected to sentinel master");
        *self.current.lock() = Some(conn.clone());
        Ok(conn)
    }

    async fn clients(&self) -> Result<Vec<redis::Client>, StoreError> {
        Ok(vec![self.master_client().await?])
    }

    fn mode(&self) -> ClusterMode {
        ClusterMode::Sentinel
    }

    fn connection_failed(&self) {
        if self.current.lock().take().is_some() {
            warn!(master = %self.master, "master connection lost, will rediscover");
        }
    }

    fn close(&self) {
        self.current.lock().take();
    }
}
