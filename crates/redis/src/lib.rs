//! Redis backend for cairn sessions.
//!
//! Each session is one hash, `cairn:<namespace>:{<id>}`, holding encoded
//! attributes next to the reserved `#:` metadata fields. Commands go through
//! [`RedisFacade`], implemented by [`RedisStore`] over a single server, a
//! Sentinel-managed master or a cluster, and by [`MemoryFacade`] for tests.

mod cluster;
mod config;
mod error;
pub mod expiration;
mod facade;
pub mod keys;
pub mod memory;
mod repository;
mod sentinel;
mod single;
mod store;

use std::sync::Arc;

use tracing::info;

pub use cluster::{ClusterTopology, cross_slot_rename, key_slot};
pub use config::{ClusterMode, ExpirationKind, RedisConfig};
pub use error::StoreError;
pub use expiration::{ExpirationStrategy, StrategySettings};
pub use facade::{KeyType, PubSubMessage, RedisFacade, RenameReply, Subscription, TxOp};
pub use keys::{SessionKeys, is_meta_field};
pub use memory::MemoryFacade;
pub use repository::{RedisSessionRepository, RedisTransaction};
pub use sentinel::SentinelTopology;
pub use single::SingleTopology;
pub use store::{RedisStore, Topology};

/// Connect to Redis in the topology selected by `config.mode`.
pub fn connect(config: &RedisConfig) -> Result<Arc<dyn RedisFacade>, StoreError> {
    config.validate()?;
    let facade: Arc<dyn RedisFacade> = match config.mode {
        ClusterMode::Single => Arc::new(RedisStore::new(SingleTopology::new(config)?, config)),
        ClusterMode::Sentinel => Arc::new(RedisStore::new(SentinelTopology::new(config)?, config)),
        ClusterMode::Cluster => Arc::new(RedisStore::new(ClusterTopology::new(config)?, config)),
    };
    info!(mode = %config.mode, hosts = ?config.addresses(), "redis facade created");
    Ok(facade)
}
