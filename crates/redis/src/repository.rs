use std::collections::HashSet;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use cairn_session::{
    AttributeValue, CommitTransaction, ExpiredSessionHandler, SessionCodec, SessionConfiguration,
    SessionData, SessionError, SessionMetrics, SessionRepository, TaskExecutor, codec_for,
};
use tracing::{debug, info, warn};

use crate::config::RedisConfig;
use crate::expiration::{ExpirationStrategy, StrategySettings, SubscriberSupervisor, strategy_for};
use crate::facade::{RedisFacade, RenameReply, TxOp};
use crate::keys::{
    self, CREATION_TIME, INVALID_SESSION, LAST_ACCESSED, MAX_INACTIVE_INTERVAL, OWNER, SessionKeys,
};

const META_FIELDS: [&str; 5] = [
    LAST_ACCESSED,
    MAX_INACTIVE_INTERVAL,
    CREATION_TIME,
    INVALID_SESSION,
    OWNER,
];

fn parse_meta<T: std::str::FromStr>(field: &str, raw: &[u8]) -> Result<T, SessionError> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| SessionError::Serialization(format!("malformed {field}")))
}

/// Session repository storing one Redis hash per session.
///
/// Attributes are hash fields holding codec output; metadata lives in the
/// reserved `#:` fields. Expiration bookkeeping is delegated to an
/// [`ExpirationStrategy`] whose index updates ride in the same transaction
/// as each commit.
pub struct RedisSessionRepository {
    facade: Arc<dyn RedisFacade>,
    keys: SessionKeys,
    codec: Arc<dyn SessionCodec>,
    strategy: Arc<dyn ExpirationStrategy>,
    sticky: bool,
    node: String,
    metrics: Arc<SessionMetrics>,
    settings: StrategySettings,
}

impl RedisSessionRepository {
    /// Repository for `session`'s namespace over `facade`, with the
    /// expiration strategy selected in `redis`.
    pub fn new(
        facade: Arc<dyn RedisFacade>,
        session: &SessionConfiguration,
        redis: &RedisConfig,
        metrics: Arc<SessionMetrics>,
    ) -> Result<Self, SessionError> {
        session.validate()?;
        let keys = SessionKeys::new(&session.namespace);
        let settings = StrategySettings::new(
            redis,
            session.sticky,
            &session.node,
            session.max_inactive_interval,
        );
        let strategy = strategy_for(
            redis.expiration,
            Arc::clone(&facade),
            keys.clone(),
            settings.clone(),
        );
        Ok(Self {
            facade,
            keys,
            codec: codec_for(session)?,
            strategy,
            sticky: session.sticky,
            node: session.node.clone(),
            metrics,
            settings,
        })
    }

    pub fn keys(&self) -> &SessionKeys {
        &self.keys
    }

    pub fn strategy(&self) -> &Arc<dyn ExpirationStrategy> {
        &self.strategy
    }

    fn meta_fields(&self, data: &SessionData) -> Vec<(String, Vec<u8>)> {
        let mut fields = vec![
            (LAST_ACCESSED.to_owned(), data.last_accessed.to_string().into_bytes()),
            (
                MAX_INACTIVE_INTERVAL.to_owned(),
                data.max_inactive_interval.to_string().into_bytes(),
            ),
            (CREATION_TIME.to_owned(), data.creation_time.to_string().into_bytes()),
        ];
        if self.sticky {
            fields.push((OWNER.to_owned(), self.node.clone().into_bytes()));
        }
        fields
    }
}

#[async_trait]
impl SessionRepository for RedisSessionRepository {
    async fn get_session_data(&self, id: &str) -> Result<Option<SessionData>, SessionError> {
        let values = self
            .facade
            .hmget(&self.keys.session_key(id), &META_FIELDS)
            .await?;
        let [last_accessed, max_inactive, creation, invalid, owner]: [Option<Vec<u8>>; 5] = values
            .try_into()
            .map_err(|_| SessionError::Store("unexpected HMGET reply length".into()))?;

        if invalid.is_some() {
            debug!(session_id = %id, "session is being removed");
            return Ok(None);
        }
        let (Some(last_accessed), Some(max_inactive), Some(creation)) =
            (last_accessed, max_inactive, creation)
        else {
            return Ok(None);
        };

        let mut data = SessionData::existing(
            id,
            parse_meta(CREATION_TIME, &creation)?,
            parse_meta(LAST_ACCESSED, &last_accessed)?,
            parse_meta(MAX_INACTIVE_INTERVAL, &max_inactive)?,
        );
        data.previous_owner = owner.and_then(|o| String::from_utf8(o).ok());

        if self.sticky
            && let Some(previous) = data.previous_owner.as_deref()
            && previous != self.node
        {
            self.metrics.increment_failovers();
            info!(session_id = %id, previous_owner = previous, node = %self.node, "session failed over");
            if let Err(e) = self.strategy.session_failover(&data).await {
                warn!(session_id = %id, error = %e, "clearing previous owner's expiration failed");
            }
        }
        Ok(Some(data))
    }

    async fn store_session_data(&self, data: &SessionData) -> Result<(), SessionError> {
        let key = self.keys.session_key(&data.id);
        let mut ops = vec![TxOp::HMSet {
            key: key.clone(),
            fields: self.meta_fields(data),
        }];
        ops.extend(self.strategy.session_touched(data));
        self.facade.transaction(&key, ops).await?;
        Ok(())
    }

    async fn get_attribute_keys(&self, id: &str) -> Result<HashSet<String>, SessionError> {
        let fields = self.facade.hkeys(&self.keys.session_key(id)).await?;
        Ok(fields.into_iter().filter(|f| !keys::is_meta_field(f)).collect())
    }

    async fn get_session_attribute(
        &self,
        id: &str,
        key: &str,
    ) -> Result<Option<AttributeValue>, SessionError> {
        match self.facade.hget(&self.keys.session_key(id), key).await? {
            Some(bytes) => Ok(Some(self.codec.decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn set_session_attribute(
        &self,
        id: &str,
        key: &str,
        value: &AttributeValue,
    ) -> Result<(), SessionError> {
        let bytes = self.codec.encode(value)?;
        self.facade
            .hset(&self.keys.session_key(id), key, &bytes)
            .await?;
        Ok(())
    }

    async fn remove_session_attribute(&self, id: &str, key: &str) -> Result<(), SessionError> {
        self.facade
            .hdel(&self.keys.session_key(id), &[key.to_owned()])
            .await?;
        Ok(())
    }

    async fn remove(&self, data: &SessionData) -> Result<(), SessionError> {
        self.facade.del(&[self.keys.session_key(&data.id)]).await?;
        self.strategy.session_deleted(data).await?;
        debug!(session_id = %data.id, "session removed");
        Ok(())
    }

    async fn prepare_remove(&self, data: &SessionData) -> Result<bool, SessionError> {
        let won = self
            .facade
            .hsetnx(&self.keys.session_key(&data.id), INVALID_SESSION, b"1")
            .await?;
        Ok(won)
    }

    fn start_commit(&self, data: &SessionData) -> Box<dyn CommitTransaction> {
        Box::new(RedisTransaction {
            facade: Arc::clone(&self.facade),
            codec: Arc::clone(&self.codec),
            key: self.keys.session_key(&data.id),
            meta: self.meta_fields(data),
            touch: self.strategy.session_touched(data),
            to_set: Vec::new(),
            to_remove: Vec::new(),
        })
    }

    async fn session_id_change(&self, data: &SessionData) -> Result<(), SessionError> {
        let old_id = data
            .old_session_id
            .as_deref()
            .ok_or_else(|| SessionError::InvalidState("no rename in progress".into()))?;
        let reply = self
            .facade
            .rename(&self.keys.session_key(old_id), &self.keys.session_key(&data.id))
            .await?;
        if reply == RenameReply::Err {
            debug!(old_id, new_id = %data.id, "nothing stored under the old id yet");
        }
        self.strategy.session_id_change(data).await?;
        if let Err(e) = self
            .facade
            .publish(&self.keys.redirection_channel(), &format!("{old_id}:{}", data.id))
            .await
        {
            warn!(old_id, new_id = %data.id, error = %e, "publishing id change failed");
        }
        Ok(())
    }

    async fn start(
        &self,
        handler: Weak<dyn ExpiredSessionHandler>,
        executor: &TaskExecutor,
    ) -> Result<(), SessionError> {
        self.strategy.start(handler.clone(), executor).await?;

        let supervisor = SubscriberSupervisor::new(self.settings.backoff);
        let tasks = executor.clone();
        executor.submit(
            "redirection-subscriber",
            supervisor.run(
                "redirection",
                Arc::clone(&self.facade),
                Vec::new(),
                vec![self.keys.redirection_channel()],
                executor.cancellation_token(),
                move |message| {
                    let Some((old_id, new_id)) = message.payload.split_once(':') else {
                        warn!(payload = %message.payload, "malformed redirection message");
                        return;
                    };
                    let (old_id, new_id) = (old_id.to_owned(), new_id.to_owned());
                    let handler = handler.clone();
                    tasks.submit("session-redirect", async move {
                        if let Some(handler) = handler.upgrade() {
                            handler.session_id_redirected(&old_id, &new_id).await;
                        }
                    });
                },
            ),
        );
        info!(namespace = %self.keys.prefix(), mode = %self.facade.mode(), "redis session repository started");
        Ok(())
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.strategy.close().await;
        self.facade.close().await;
        info!("redis session repository closed");
        Ok(())
    }
}

/// Attribute writes for one session, applied as a single transaction.
pub struct RedisTransaction {
    facade: Arc<dyn RedisFacade>,
    codec: Arc<dyn SessionCodec>,
    key: String,
    meta: Vec<(String, Vec<u8>)>,
    touch: Vec<TxOp>,
    to_set: Vec<(String, Vec<u8>)>,
    to_remove: Vec<String>,
}

#[async_trait]
impl CommitTransaction for RedisTransaction {
    fn add_attribute(&mut self, key: &str, value: &AttributeValue) -> Result<(), SessionError> {
        let bytes = self.codec.encode(value)?;
        self.to_remove.retain(|k| k != key);
        self.to_set.push((key.to_owned(), bytes));
        Ok(())
    }

    fn remove_attribute(&mut self, key: &str) {
        self.to_set.retain(|(k, _)| k != key);
        self.to_remove.push(key.to_owned());
    }

    async fn commit(self: Box<Self>) -> Result<(), SessionError> {
        let Self {
            facade,
            key,
            meta,
            touch,
            mut to_set,
            to_remove,
            ..
        } = *self;
        to_set.extend(meta);
        let mut ops = vec![
            TxOp::HDel {
                key: key.clone(),
                fields: to_remove,
            },
            TxOp::HMSet {
                key: key.clone(),
                fields: to_set,
            },
        ];
        ops.extend(touch);
        facade.transaction(&key, ops).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use cairn_session::testing::run_repository_conformance_tests;
    use cairn_session::{RetiredKey, now_ms};
    use futures::StreamExt;
    use serde_json::json;

    use super::*;
    use crate::config::ClusterMode;
    use crate::memory::MemoryFacade;

    fn session_config(node: &str, sticky: bool) -> SessionConfiguration {
        SessionConfiguration {
            namespace: "test".into(),
            node: node.into(),
            sticky,
            ..SessionConfiguration::default()
        }
    }

    fn repository(
        facade: &Arc<MemoryFacade>,
        config: &SessionConfiguration,
    ) -> (RedisSessionRepository, Arc<SessionMetrics>) {
        let metrics = Arc::new(SessionMetrics::default());
        let repo = RedisSessionRepository::new(
            Arc::clone(facade) as Arc<dyn RedisFacade>,
            config,
            &RedisConfig::default(),
            Arc::clone(&metrics),
        )
        .unwrap();
        (repo, metrics)
    }

    #[tokio::test]
    async fn conformance() {
        let facade = Arc::new(MemoryFacade::new());
        let (repo, _) = repository(&facade, &session_config("n1", false));
        run_repository_conformance_tests(&repo).await.unwrap();
    }

    #[tokio::test]
    async fn conformance_on_a_cluster() {
        let facade = Arc::new(MemoryFacade::with_mode(ClusterMode::Cluster));
        let (repo, _) = repository(&facade, &session_config("n1", true));
        run_repository_conformance_tests(&repo).await.unwrap();
        assert!(facade.commands().contains(&"TYPE".to_owned()), "rename should be emulated");
    }

    #[tokio::test]
    async fn commit_is_one_transaction() {
        let facade = Arc::new(MemoryFacade::new());
        let (repo, _) = repository(&facade, &session_config("n1", false));
        let data = SessionData::new("s1", now_ms(), 1800);

        let mut tx = repo.start_commit(&data);
        tx.add_attribute("user", &json!("alice")).unwrap();
        tx.add_attribute("gone", &json!(1)).unwrap();
        tx.remove_attribute("gone");
        tx.commit().await.unwrap();

        let commands = facade.commands();
        assert_eq!(commands.iter().filter(|c| *c == "MULTI").count(), 1);
        assert_eq!(commands.last().map(String::as_str), Some("EXEC"));

        let fields: Vec<String> = facade
            .hget_all("cairn:test:{s1}")
            .await
            .unwrap()
            .into_iter()
            .map(|(f, _)| f)
            .collect();
        assert!(fields.contains(&"user".to_owned()));
        assert!(fields.contains(&LAST_ACCESSED.to_owned()));
        assert!(!fields.contains(&"gone".to_owned()));
        assert!(!fields.contains(&OWNER.to_owned()));
        assert_eq!(
            repo.get_attribute_keys("s1").await.unwrap(),
            HashSet::from(["user".to_owned()])
        );
    }

    #[tokio::test]
    async fn values_written_before_a_key_rotation_stay_readable() {
        let facade = Arc::new(MemoryFacade::new());
        let before = SessionConfiguration {
            encryption_key: Some("first".into()),
            encryption_key_id: "2023".into(),
            ..session_config("n1", false)
        };
        let (old_repo, _) = repository(&facade, &before);
        let data = SessionData::new("s1", now_ms(), 1800);
        let mut tx = old_repo.start_commit(&data);
        tx.add_attribute("user", &json!("alice")).unwrap();
        tx.commit().await.unwrap();

        let after = SessionConfiguration {
            encryption_key: Some("second".into()),
            encryption_key_id: "2024".into(),
            retired_encryption_keys: vec![RetiredKey {
                id: "2023".into(),
                key: "first".into(),
            }],
            ..session_config("n1", false)
        };
        let (rotated, _) = repository(&facade, &after);
        assert_eq!(
            rotated.get_session_attribute("s1", "user").await.unwrap(),
            Some(json!("alice"))
        );

        rotated
            .set_session_attribute("s1", "cart", &json!([1]))
            .await
            .unwrap();
        assert!(matches!(
            old_repo.get_session_attribute("s1", "cart").await,
            Err(SessionError::Crypto(_))
        ));
    }

    #[tokio::test]
    async fn incomplete_metadata_reads_as_absent() {
        let facade = Arc::new(MemoryFacade::new());
        let (repo, _) = repository(&facade, &session_config("n1", false));
        facade.hset("cairn:test:{half}", LAST_ACCESSED, b"1").await.unwrap();
        assert!(repo.get_session_data("half").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_metadata_is_an_error() {
        let facade = Arc::new(MemoryFacade::new());
        let (repo, _) = repository(&facade, &session_config("n1", false));
        facade
            .hmset(
                "cairn:test:{bad}",
                &[
                    (LAST_ACCESSED.to_owned(), b"yesterday".to_vec()),
                    (MAX_INACTIVE_INTERVAL.to_owned(), b"60".to_vec()),
                    (CREATION_TIME.to_owned(), b"0".to_vec()),
                ],
            )
            .await
            .unwrap();
        assert!(matches!(
            repo.get_session_data("bad").await,
            Err(SessionError::Serialization(_))
        ));
    }

    #[test]
    fn sticky_node_names_must_not_contain_separators() {
        let result = RedisSessionRepository::new(
            Arc::new(MemoryFacade::new()) as Arc<dyn RedisFacade>,
            &session_config("host:8080", true),
            &RedisConfig::default(),
            Arc::new(SessionMetrics::default()),
        );
        assert!(matches!(result, Err(SessionError::Config(_))));
    }

    #[tokio::test]
    async fn sticky_read_on_another_node_counts_a_failover() {
        let facade = Arc::new(MemoryFacade::new());
        let (first, _) = repository(&facade, &session_config("n1", true));
        let (second, metrics) = repository(&facade, &session_config("n2", true));

        let data = SessionData::new("s1", now_ms(), 1800);
        first.start_commit(&data).commit().await.unwrap();
        assert!(facade.exists("cairn:test:expire:n1:{s1}").await.unwrap());

        let read = first.get_session_data("s1").await.unwrap().unwrap();
        assert_eq!(read.previous_owner.as_deref(), Some("n1"));

        let read = second.get_session_data("s1").await.unwrap().unwrap();
        assert_eq!(read.previous_owner.as_deref(), Some("n1"));
        assert_eq!(metrics.snapshot().failovers, 1);
        assert!(!facade.exists("cairn:test:expire:n1:{s1}").await.unwrap());
    }

    #[tokio::test]
    async fn id_change_is_published() {
        let facade = Arc::new(MemoryFacade::new());
        let (repo, _) = repository(&facade, &session_config("n1", false));
        let mut redirects = facade
            .subscribe(&[], &[repo.keys().redirection_channel()])
            .await
            .unwrap();

        let mut data = SessionData::new("old", now_ms(), 1800);
        repo.start_commit(&data).commit().await.unwrap();
        data.rename("new");
        repo.session_id_change(&data).await.unwrap();

        let message = redirects.next().await.unwrap();
        assert_eq!(message.payload, "old:new");
        assert!(repo.get_session_data("new").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn id_change_before_first_commit_is_not_an_error() {
        let facade = Arc::new(MemoryFacade::new());
        let (repo, _) = repository(&facade, &session_config("n1", false));
        let mut data = SessionData::new("fresh", now_ms(), 1800);
        data.rename("renamed");
        repo.session_id_change(&data).await.unwrap();
        assert!(repo.get_session_data("renamed").await.unwrap().is_none());
    }
}
