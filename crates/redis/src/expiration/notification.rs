//! Expiration through minute buckets and keyspace notifications.
//!
//! Each session gets a sentinel key that expires exactly when the session
//! does. Redis reports the expiry on `__keyevent@<db>__:expired`; the
//! subscriber turns that into a delete. Sentinels are also listed in a
//! bucket per minute, and a periodic task touches every sentinel of the
//! minute that just ended so Redis expires (and reports) the ones it has
//! not reached yet. Sticky deployments add a forced bucket a little later
//! as a safety net for sessions whose owner went away.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use cairn_session::{ExpiredSessionHandler, SessionData, TaskExecutor, now_ms};
use tracing::{debug, info, warn};

use super::backoff::SubscriberSupervisor;
use super::{
    ExpirationStrategy, MINUTE_MS, SESSION_PERSISTENCE_SAFETY_MARGIN, StrategySettings, duration_ms,
    round_down_to_minute, round_up_to_next_minute,
};
use crate::error::StoreError;
use crate::facade::{PubSubMessage, RedisFacade, TxOp};
use crate::keys::SessionKeys;

/// Pattern matching expiry events of every database.
pub const EXPIRED_EVENTS_PATTERN: &str = "__keyevent@*__:expired";

/// Bucket-and-notification expiration strategy.
#[derive(Clone)]
pub struct NotificationStrategy {
    facade: Arc<dyn RedisFacade>,
    keys: SessionKeys,
    settings: StrategySettings,
}

impl NotificationStrategy {
    pub fn new(facade: Arc<dyn RedisFacade>, keys: SessionKeys, settings: StrategySettings) -> Self {
        Self {
            facade,
            keys,
            settings,
        }
    }

    fn expire_key(&self, id: &str) -> String {
        self.keys.expire_key(id, self.settings.owner())
    }

    fn forced_bucket(&self, minute_ms: i64) -> String {
        self.keys
            .forced_expirations_bucket(minute_ms + duration_ms(self.settings.forced_expiration_grace))
    }

    /// Ops removing the index entries of `id` that expire at `expires_at`.
    fn unindex(&self, id: &str, expire_key: String, expires_at: Option<i64>) -> Vec<TxOp> {
        let mut ops = Vec::new();
        if let Some(at) = expires_at {
            let minute = round_up_to_next_minute(at);
            ops.push(TxOp::SRem {
                key: self.keys.expirations_bucket(minute),
                members: vec![expire_key.clone()],
            });
            if self.settings.sticky {
                ops.push(TxOp::SRem {
                    key: self.forced_bucket(minute),
                    members: vec![id.to_owned()],
                });
            }
        }
        ops.push(TxOp::Del { key: expire_key });
        ops
    }

    /// Touch every sentinel listed for `minute_ms` and hand sessions in the
    /// forced bucket of that minute to `handler`.
    pub async fn process_expirations(
        &self,
        minute_ms: i64,
        handler: &dyn ExpiredSessionHandler,
    ) -> Result<(), StoreError> {
        let bucket = self.keys.expirations_bucket(minute_ms);
        let sentinels = self.facade.smembers(&bucket).await?;
        for sentinel in &sentinels {
            // A read makes Redis expire the key if it is due, which emits the
            // notification the subscriber acts on.
            self.facade.exists(sentinel).await?;
        }
        self.facade.del(&[bucket]).await?;
        if !sentinels.is_empty() {
            debug!(minute = minute_ms, count = sentinels.len(), "checked expiring sessions");
        }

        if self.settings.sticky {
            let forced = self.keys.forced_expirations_bucket(minute_ms);
            let ids = self.facade.smembers(&forced).await?;
            for id in &ids {
                if let Err(e) = handler.session_expired(id).await {
                    warn!(session_id = %id, error = %e, "forced expiration failed");
                }
            }
            self.facade.del(&[forced]).await?;
        }
        Ok(())
    }

    /// Handle one expiry event. Returns the session id that was handed to
    /// `handler`, if the event concerned this node.
    pub async fn handle_expired_event(
        &self,
        message: &PubSubMessage,
        handler: &dyn ExpiredSessionHandler,
    ) -> Option<String> {
        let (node, id) = self.keys.parse_expire_key(&message.payload)?;
        if node != self.settings.owner() {
            return None;
        }
        if let Err(e) = handler.session_expired(id).await {
            warn!(session_id = %id, error = %e, "expiring session failed");
        }
        Some(id.to_owned())
    }
}

#[async_trait]
impl ExpirationStrategy for NotificationStrategy {
    fn session_touched(&self, data: &SessionData) -> Vec<TxOp> {
        let expire_key = self.expire_key(&data.id);
        let session_key = self.keys.session_key(&data.id);

        let Some(expires_at) = data.expires_at() else {
            return vec![
                TxOp::Del { key: expire_key },
                TxOp::Persist { key: session_key },
            ];
        };

        let minute = round_up_to_next_minute(expires_at);
        let mut ops = Vec::new();
        if !data.is_new
            && let Some(previous) = data.previous_expires_at()
            && round_up_to_next_minute(previous) != minute
        {
            ops.extend(
                self.unindex(&data.id, expire_key.clone(), Some(previous))
                    .into_iter()
                    .filter(|op| !matches!(op, TxOp::Del { .. })),
            );
        }

        let bucket = self.keys.expirations_bucket(minute);
        let margin = duration_ms(SESSION_PERSISTENCE_SAFETY_MARGIN);
        ops.push(TxOp::SAdd {
            key: bucket.clone(),
            members: vec![expire_key.clone()],
        });
        ops.push(TxOp::PExpireAt {
            key: bucket,
            at_ms: minute + margin,
        });
        if self.settings.sticky {
            let forced = self.forced_bucket(minute);
            ops.push(TxOp::SAdd {
                key: forced.clone(),
                members: vec![data.id.clone()],
            });
            ops.push(TxOp::PExpireAt {
                key: forced,
                at_ms: minute + duration_ms(self.settings.forced_expiration_grace) + margin,
            });
        }
        ops.push(TxOp::Set {
            key: expire_key.clone(),
            value: Vec::new(),
        });
        ops.push(TxOp::PExpireAt {
            key: expire_key,
            at_ms: expires_at,
        });
        ops.push(TxOp::PExpireAt {
            key: session_key,
            at_ms: expires_at + margin,
        });
        ops
    }

    async fn session_deleted(&self, data: &SessionData) -> Result<(), StoreError> {
        let ops = self.unindex(&data.id, self.expire_key(&data.id), data.expires_at());
        self.facade
            .transaction(&self.keys.session_key(&data.id), ops)
            .await
    }

    async fn session_id_change(&self, data: &SessionData) -> Result<(), StoreError> {
        let Some(old_id) = data.old_session_id.as_deref() else {
            return Ok(());
        };
        let mut ops = self.unindex(old_id, self.expire_key(old_id), data.expires_at());
        let mut fresh = data.clone();
        fresh.is_new = true;
        ops.extend(self.session_touched(&fresh));
        self.facade
            .transaction(&self.keys.session_key(&data.id), ops)
            .await
    }

    async fn session_failover(&self, data: &SessionData) -> Result<(), StoreError> {
        let Some(previous) = data.previous_owner.as_deref() else {
            return Ok(());
        };
        let stale = self.keys.expire_key(&data.id, Some(previous));
        let mut ops = vec![TxOp::Del { key: stale.clone() }];
        if let Some(at) = data.expires_at() {
            ops.push(TxOp::SRem {
                key: self.keys.expirations_bucket(round_up_to_next_minute(at)),
                members: vec![stale],
            });
        }
        debug!(session_id = %data.id, previous_owner = previous, "clearing previous owner's expiration");
        self.facade
            .transaction(&self.keys.session_key(&data.id), ops)
            .await
    }

    async fn start(
        &self,
        handler: Weak<dyn ExpiredSessionHandler>,
        executor: &TaskExecutor,
    ) -> Result<(), StoreError> {
        if let Err(e) = self.facade.configure_keyspace_notifications().await {
            warn!(
                error = %e,
                "could not enable keyspace notifications, expiry events depend on server configuration"
            );
        }

        let now = now_ms();
        let first = Duration::from_millis(
            u64::try_from(round_up_to_next_minute(now) - now).unwrap_or_default(),
        );
        let sweeper = self.clone();
        let sweep_handler = handler.clone();
        executor.schedule_at_fixed_rate(
            "notification-expiration-sweep",
            first,
            Duration::from_millis(MINUTE_MS.unsigned_abs()),
            move || {
                let sweeper = sweeper.clone();
                let handler = sweep_handler.clone();
                async move {
                    let Some(handler) = handler.upgrade() else {
                        return;
                    };
                    // The minute that just ended.
                    let minute = round_down_to_minute(now_ms());
                    if let Err(e) = sweeper.process_expirations(minute, handler.as_ref()).await {
                        warn!(error = %e, "expiration sweep failed");
                    }
                }
            },
        );

        let listener = self.clone();
        let tasks = executor.clone();
        let supervisor = SubscriberSupervisor::new(self.settings.backoff);
        executor.submit(
            "expired-events-subscriber",
            supervisor.run(
                "expired-events",
                Arc::clone(&self.facade),
                vec![EXPIRED_EVENTS_PATTERN.to_owned()],
                Vec::new(),
                executor.cancellation_token(),
                move |message| {
                    let listener = listener.clone();
                    let handler = handler.clone();
                    tasks.submit("expire-session", async move {
                        if let Some(handler) = handler.upgrade() {
                            listener.handle_expired_event(&message, handler.as_ref()).await;
                        }
                    });
                },
            ),
        );
        info!(sticky = self.settings.sticky, "notification expiration started");
        Ok(())
    }

    async fn close(&self) {
        debug!("notification expiration stopped");
    }
}
