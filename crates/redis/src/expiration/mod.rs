//! Proactive expiration of idle sessions.
//!
//! Sessions nobody requests again would otherwise live until their hash TTL
//! fires without any notification to the application. A strategy keeps an
//! index of upcoming expirations, folded into each commit through
//! [`ExpirationStrategy::session_touched`], and a background task that hands
//! due sessions to the [`ExpiredSessionHandler`].

pub mod backoff;
pub mod notification;
pub mod sorted_set;

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use cairn_session::{ExpiredSessionHandler, SessionData, TaskExecutor};

use crate::config::{ExpirationKind, RedisConfig};
use crate::error::StoreError;
use crate::facade::{RedisFacade, TxOp};
use crate::keys::SessionKeys;

pub use backoff::{BackoffPolicy, SubscriberSupervisor};
pub use notification::NotificationStrategy;
pub use sorted_set::SortedSetStrategy;

/// How long a session hash outlives its computed expiry, so the expiry
/// handler can still read it.
pub const SESSION_PERSISTENCE_SAFETY_MARGIN: Duration = Duration::from_secs(5 * 60);

const MINUTE_MS: i64 = 60_000;

/// The minute boundary strictly after `t_ms`.
pub fn round_up_to_next_minute(t_ms: i64) -> i64 {
    (t_ms.div_euclid(MINUTE_MS) + 1) * MINUTE_MS
}

/// The minute boundary at or before `t_ms`.
pub fn round_down_to_minute(t_ms: i64) -> i64 {
    t_ms.div_euclid(MINUTE_MS) * MINUTE_MS
}

pub(crate) fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Expiration bookkeeping shared by both algorithms.
#[async_trait]
pub trait ExpirationStrategy: Send + Sync {
    /// Index updates for a commit or touch of `data`. They run in the same
    /// transaction as the session write.
    fn session_touched(&self, data: &SessionData) -> Vec<TxOp>;

    /// Drop index entries of a deleted session.
    async fn session_deleted(&self, data: &SessionData) -> Result<(), StoreError>;

    /// Move index entries from `data.old_session_id` to `data.id`.
    async fn session_id_change(&self, data: &SessionData) -> Result<(), StoreError>;

    /// Clear the previous owner's entries after a sticky fail-over.
    async fn session_failover(&self, data: &SessionData) -> Result<(), StoreError>;

    /// Start the background task that reports due sessions to `handler`.
    async fn start(
        &self,
        handler: Weak<dyn ExpiredSessionHandler>,
        executor: &TaskExecutor,
    ) -> Result<(), StoreError>;

    async fn close(&self);
}

/// Node identity and tuning shared by the strategies.
#[derive(Debug, Clone)]
pub struct StrategySettings {
    pub sticky: bool,
    pub node: String,
    /// Default inactivity timeout in seconds, used to size sweep intervals.
    pub max_inactive_interval: i32,
    pub forced_expiration_grace: Duration,
    pub sorted_set_grace: Duration,
    pub sweep_ceiling: Duration,
    pub backoff: BackoffPolicy,
}

impl StrategySettings {
    /// Settings from the Redis configuration plus session identity.
    pub fn new(config: &RedisConfig, sticky: bool, node: &str, max_inactive_interval: i32) -> Self {
        Self {
            sticky,
            node: node.to_owned(),
            max_inactive_interval,
            forced_expiration_grace: config.forced_expiration_grace,
            sorted_set_grace: config.sorted_set_grace,
            sweep_ceiling: config.sweep_ceiling,
            backoff: BackoffPolicy::default(),
        }
    }

    /// This node, when expiration is node specific.
    pub(crate) fn owner(&self) -> Option<&str> {
        self.sticky.then_some(self.node.as_str())
    }
}

/// Build the strategy selected by `kind`.
pub fn strategy_for(
    kind: ExpirationKind,
    facade: Arc<dyn RedisFacade>,
    keys: SessionKeys,
    settings: StrategySettings,
) -> Arc<dyn ExpirationStrategy> {
    match kind {
        ExpirationKind::Notification => Arc::new(NotificationStrategy::new(facade, keys, settings)),
        ExpirationKind::SortedSet => Arc::new(SortedSetStrategy::new(facade, keys, settings)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_to_the_following_minute() {
        assert_eq!(round_up_to_next_minute(0), 60_000);
        assert_eq!(round_up_to_next_minute(1), 60_000);
        assert_eq!(round_up_to_next_minute(59_999), 60_000);
        assert_eq!(round_up_to_next_minute(60_000), 120_000);
        assert_eq!(round_up_to_next_minute(1_700_000_030_500), 1_700_000_040_000);
        assert_eq!(round_down_to_minute(119_999), 60_000);
    }
}
