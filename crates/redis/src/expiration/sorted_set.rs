//! Expiration through one sorted set scored by expiry instant.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use cairn_session::{ExpiredSessionHandler, SessionData, TaskExecutor, now_ms};
use tracing::{debug, info, warn};

use super::{ExpirationStrategy, SESSION_PERSISTENCE_SAFETY_MARGIN, StrategySettings, duration_ms};
use crate::error::StoreError;
use crate::facade::{RedisFacade, TxOp};
use crate::keys::SessionKeys;

/// Sorted-set expiration strategy.
///
/// Members are session ids, prefixed with the owning node in sticky mode.
/// A periodic sweep claims members whose score has passed and hands them to
/// the expiry handler. In sticky mode a node only sweeps its own members
/// right away; other nodes' members are left for a grace period so a
/// restarting owner can still serve them.
#[derive(Clone)]
pub struct SortedSetStrategy {
    facade: Arc<dyn RedisFacade>,
    keys: SessionKeys,
    settings: StrategySettings,
}

impl SortedSetStrategy {
    pub fn new(facade: Arc<dyn RedisFacade>, keys: SessionKeys, settings: StrategySettings) -> Self {
        Self {
            facade,
            keys,
            settings,
        }
    }

    fn member(&self, id: &str, node: Option<&str>) -> String {
        match node {
            Some(node) => format!("{node}:{id}"),
            None => id.to_owned(),
        }
    }

    fn own_member(&self, id: &str) -> String {
        self.member(id, self.settings.owner())
    }

    /// Session id of a member, ignoring the owner prefix in sticky mode.
    fn id_of<'a>(&self, member: &'a str) -> &'a str {
        if self.settings.sticky {
            member.split_once(':').map_or(member, |(_, id)| id)
        } else {
            member
        }
    }

    /// Sweep interval: a tenth of the session timeout, between one second
    /// and the configured ceiling.
    pub fn sweep_interval(&self) -> Duration {
        let ceiling = self.settings.sweep_ceiling.max(Duration::from_secs(1));
        match u64::try_from(self.settings.max_inactive_interval) {
            Ok(secs) if secs > 0 => Duration::from_secs(secs / 10).clamp(Duration::from_secs(1), ceiling),
            _ => ceiling,
        }
    }

    /// Claim and expire every due member at `now`. Returns the expired ids.
    pub async fn sweep(
        &self,
        now: i64,
        handler: &dyn ExpiredSessionHandler,
    ) -> Result<Vec<String>, StoreError> {
        let key = self.keys.all_sessions_set();
        #[allow(clippy::cast_precision_loss)]
        let due = now as f64;

        let claimed = if self.settings.sticky {
            let prefix = format!("{}:", self.settings.node);
            #[allow(clippy::cast_precision_loss)]
            let abandoned = (now - duration_ms(self.settings.sorted_set_grace)) as f64;
            let mut candidates: Vec<String> = self
                .facade
                .zrange_by_score(&key, f64::NEG_INFINITY, due)
                .await?
                .into_iter()
                .filter(|m| m.starts_with(&prefix))
                .collect();
            for member in self.facade.zrange_by_score(&key, f64::NEG_INFINITY, abandoned).await? {
                if !candidates.contains(&member) {
                    candidates.push(member);
                }
            }
            let mut claimed = Vec::with_capacity(candidates.len());
            for member in candidates {
                // Only the node whose ZREM succeeds expires the session.
                if self.facade.zrem(&key, std::slice::from_ref(&member)).await? == 1 {
                    claimed.push(member);
                }
            }
            claimed
        } else {
            self.facade.zpop_by_score(&key, f64::NEG_INFINITY, due).await?
        };

        let mut expired = Vec::with_capacity(claimed.len());
        for member in &claimed {
            let id = self.id_of(member);
            if let Err(e) = handler.session_expired(id).await {
                warn!(session_id = %id, error = %e, "expiring session failed");
            }
            expired.push(id.to_owned());
        }
        if !expired.is_empty() {
            debug!(count = expired.len(), "swept expired sessions");
        }
        Ok(expired)
    }
}

#[async_trait]
impl ExpirationStrategy for SortedSetStrategy {
    fn session_touched(&self, data: &SessionData) -> Vec<TxOp> {
        let key = self.keys.all_sessions_set();
        let member = self.own_member(&data.id);
        let session_key = self.keys.session_key(&data.id);
        match data.expires_at() {
            None => vec![
                TxOp::ZRem { key, member },
                TxOp::Persist { key: session_key },
            ],
            Some(expires_at) => {
                #[allow(clippy::cast_precision_loss)]
                let score = expires_at as f64;
                vec![
                    TxOp::ZAdd { key, member, score },
                    TxOp::PExpireAt {
                        key: session_key,
                        at_ms: expires_at + duration_ms(SESSION_PERSISTENCE_SAFETY_MARGIN),
                    },
                ]
            }
        }
    }

    async fn session_deleted(&self, data: &SessionData) -> Result<(), StoreError> {
        self.facade
            .zrem(&self.keys.all_sessions_set(), &[self.own_member(&data.id)])
            .await?;
        Ok(())
    }

    async fn session_id_change(&self, data: &SessionData) -> Result<(), StoreError> {
        let Some(old_id) = data.old_session_id.as_deref() else {
            return Ok(());
        };
        let mut ops = vec![TxOp::ZRem {
            key: self.keys.all_sessions_set(),
            member: self.own_member(old_id),
        }];
        ops.extend(self.session_touched(data));
        self.facade
            .transaction(&self.keys.session_key(&data.id), ops)
            .await
    }

    async fn session_failover(&self, data: &SessionData) -> Result<(), StoreError> {
        let Some(previous) = data.previous_owner.as_deref() else {
            return Ok(());
        };
        debug!(session_id = %data.id, previous_owner = previous, "dropping previous owner's index entry");
        self.facade
            .zrem(
                &self.keys.all_sessions_set(),
                &[self.member(&data.id, Some(previous))],
            )
            .await?;
        Ok(())
    }

    async fn start(
        &self,
        handler: Weak<dyn ExpiredSessionHandler>,
        executor: &TaskExecutor,
    ) -> Result<(), StoreError> {
        let interval = self.sweep_interval();
        let sweeper = self.clone();
        executor.schedule_at_fixed_rate("sorted-set-expiration-sweep", interval, interval, move || {
            let sweeper = sweeper.clone();
            let handler = handler.clone();
            async move {
                let Some(handler) = handler.upgrade() else {
                    return;
                };
                if let Err(e) = sweeper.sweep(now_ms(), handler.as_ref()).await {
                    warn!(error = %e, "expiration sweep failed");
                }
            }
        });
        info!(?interval, sticky = self.settings.sticky, "sorted-set expiration started");
        Ok(())
    }

    async fn close(&self) {
        debug!("sorted-set expiration stopped");
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use cairn_session::SessionError;
    use parking_lot::Mutex;

    use super::*;
    use crate::config::RedisConfig;
    use crate::memory::MemoryFacade;

    #[derive(Default)]
    struct Recorder {
        expired: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ExpiredSessionHandler for Recorder {
        async fn session_expired(&self, id: &str) -> Result<(), SessionError> {
            self.expired.lock().push(id.to_owned());
            Ok(())
        }

        async fn session_id_redirected(&self, _old_id: &str, _new_id: &str) {}
    }

    fn strategy(facade: &Arc<MemoryFacade>, node: &str, sticky: bool, max_inactive: i32) -> SortedSetStrategy {
        let settings = StrategySettings::new(&RedisConfig::default(), sticky, node, max_inactive);
        SortedSetStrategy::new(
            Arc::clone(facade) as Arc<dyn RedisFacade>,
            SessionKeys::new("test"),
            settings,
        )
    }

    async fn touch(facade: &MemoryFacade, strategy: &SortedSetStrategy, id: &str, last_accessed: i64) {
        let data = SessionData::existing(id, 0, last_accessed, 60);
        facade
            .transaction(id, strategy.session_touched(&data))
            .await
            .unwrap();
    }

    #[test]
    fn sweep_interval_is_clamped() {
        let facade = Arc::new(MemoryFacade::new());
        assert_eq!(strategy(&facade, "n", false, 1800).sweep_interval(), Duration::from_secs(60));
        assert_eq!(strategy(&facade, "n", false, 300).sweep_interval(), Duration::from_secs(30));
        assert_eq!(strategy(&facade, "n", false, 5).sweep_interval(), Duration::from_secs(1));
        assert_eq!(strategy(&facade, "n", false, 0).sweep_interval(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn sweep_pops_due_sessions_once() {
        let facade = Arc::new(MemoryFacade::new());
        facade.set_time(0);
        let strategy = strategy(&facade, "n1", false, 60);
        let recorder = Recorder::default();
        touch(&facade, &strategy, "due", 0).await;
        touch(&facade, &strategy, "later", 500_000).await;

        let expired = strategy.sweep(60_001, &recorder).await.unwrap();
        assert_eq!(expired, vec!["due"]);
        assert!(strategy.sweep(60_001, &recorder).await.unwrap().is_empty());
        assert_eq!(
            facade
                .zrange_with_scores("cairn:test:all-sessions-set:test")
                .await
                .unwrap(),
            vec![("later".to_owned(), 560_000.0)]
        );
    }

    #[tokio::test]
    async fn sticky_nodes_respect_the_grace_period() {
        let facade = Arc::new(MemoryFacade::new());
        facade.set_time(0);
        let owner = strategy(&facade, "n1", true, 60);
        let other = strategy(&facade, "n2", true, 60);
        let recorder = Recorder::default();
        touch(&facade, &owner, "s1", 0).await;

        // Due, but owned by n1 and still inside the grace window.
        assert!(other.sweep(61_000, &recorder).await.unwrap().is_empty());
        // Past the grace window any node may expire it.
        let expired = other.sweep(60_000 + 5 * 60_000 + 1, &recorder).await.unwrap();
        assert_eq!(expired, vec!["s1"]);

        touch(&facade, &owner, "s2", 0).await;
        assert_eq!(owner.sweep(61_000, &recorder).await.unwrap(), vec!["s2"]);
        assert_eq!(*recorder.expired.lock(), vec!["s1", "s2"]);
    }

    #[tokio::test]
    async fn id_change_moves_the_member() {
        let facade = Arc::new(MemoryFacade::new());
        facade.set_time(0);
        let strategy = strategy(&facade, "n1", false, 60);
        touch(&facade, &strategy, "old", 0).await;

        let mut data = SessionData::existing("old", 0, 0, 60);
        data.rename("new");
        strategy.session_id_change(&data).await.unwrap();
        let members: Vec<String> = facade
            .zrange_with_scores("cairn:test:all-sessions-set:test")
            .await
            .unwrap()
            .into_iter()
            .map(|(m, _)| m)
            .collect();
        assert_eq!(members, vec!["new"]);
    }

    #[tokio::test]
    async fn never_expiring_sessions_leave_the_index() {
        let facade = Arc::new(MemoryFacade::new());
        facade.set_time(0);
        let strategy = strategy(&facade, "n1", false, 60);
        touch(&facade, &strategy, "s1", 0).await;

        let data = SessionData::existing("s1", 0, 0, -1);
        facade
            .transaction("s1", strategy.session_touched(&data))
            .await
            .unwrap();
        assert!(!facade.exists("cairn:test:all-sessions-set:test").await.unwrap());
    }
}
