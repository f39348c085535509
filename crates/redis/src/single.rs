use async_trait::async_trait;
use deadpool_redis::{Config, Connection, Pool, Runtime};

use crate::config::{ClusterMode, RedisConfig};
use crate::error::StoreError;
use crate::store::Topology;

/// One standalone Redis server behind a `deadpool-redis` pool.
pub struct SingleTopology {
    pool: Pool,
    url: String,
}

impl SingleTopology {
    /// Build the pool for the first configured host.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if the pool cannot be created.
    pub fn new(config: &RedisConfig) -> Result<Self, StoreError> {
        let url = config
            .urls()
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::Config("host list must not be empty".into()))?;
        let pool = Config::from_url(&url)
            .builder()
            .map(|b| {
                b.max_size(config.pool_size)
                    .wait_timeout(Some(config.connect_timeout))
                    .create_timeout(Some(config.connect_timeout))
                    .runtime(Runtime::Tokio1)
                    .build()
            })
            .map_err(|e| StoreError::Connection(e.to_string()))?
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self { pool, url })
    }
}

#[async_trait]
impl Topology for SingleTopology {
    type Connection = Connection;

    async fn connection(&self) -> Result<Connection, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))
    }

    async fn clients(&self) -> Result<Vec<redis::Client>, StoreError> {
        Ok(vec![redis::Client::open(self.url.as_str())?])
    }

    fn mode(&self) -> ClusterMode {
        ClusterMode::Single
    }

    fn close(&self) {
        self.pool.close();
    }
}
