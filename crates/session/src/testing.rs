//! Test doubles and the repository conformance suite.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;
use tracing::warn;

use crate::codec::{JsonCodec, SessionCodec};
use crate::data::{AttributeValue, SessionData, now_ms};
use crate::error::SessionError;
use crate::executor::TaskExecutor;
use crate::notifier::SessionNotifier;
use crate::repository::{CommitTransaction, ExpiredSessionHandler, SessionRepository};
use crate::session::Session;
use crate::tracking::{DEFAULT_SESSION_ATTRIBUTE, RequestContext, SessionTracking};

#[derive(Debug, Clone, Default)]
struct StoredSession {
    meta: Option<SessionData>,
    attributes: HashMap<String, Vec<u8>>,
    invalid: bool,
}

#[derive(Debug, Default)]
struct Counters {
    commits: AtomicU64,
    stores: AtomicU64,
    renames: AtomicU64,
    removes: AtomicU64,
}

/// In-process [`SessionRepository`] that counts the writes it receives.
///
/// Values go through a [`SessionCodec`] exactly as they would for a remote
/// store. With [`with_sweep_interval`](Self::with_sweep_interval), `start`
/// schedules a periodic scan that hands expired sessions to the handler.
pub struct MemoryRepository {
    sessions: Arc<DashMap<String, StoredSession>>,
    counters: Arc<Counters>,
    codec: Arc<dyn SessionCodec>,
    sweep_interval: Option<Duration>,
    removals_contended: bool,
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::with_codec(Arc::new(JsonCodec))
    }

    #[must_use]
    pub fn with_codec(codec: Arc<dyn SessionCodec>) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            counters: Arc::new(Counters::default()),
            codec,
            sweep_interval: None,
            removals_contended: false,
        }
    }

    #[must_use]
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    /// Make every `prepare_remove` lose, as if another node always reserved
    /// the removal first.
    #[must_use]
    pub fn with_contended_removals(mut self) -> Self {
        self.removals_contended = true;
        self
    }

    /// Number of commit transactions applied.
    #[must_use]
    pub fn commit_count(&self) -> u64 {
        self.counters.commits.load(Ordering::SeqCst)
    }

    /// Number of metadata-only writes.
    #[must_use]
    pub fn store_count(&self) -> u64 {
        self.counters.stores.load(Ordering::SeqCst)
    }

    /// Number of id changes received.
    #[must_use]
    pub fn rename_count(&self) -> u64 {
        self.counters.renames.load(Ordering::SeqCst)
    }

    /// Number of removals received.
    #[must_use]
    pub fn remove_count(&self) -> u64 {
        self.counters.removes.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Seed a stored session directly.
    pub fn insert(&self, data: &SessionData, attributes: &[(&str, AttributeValue)]) -> Result<(), SessionError> {
        let mut encoded = HashMap::new();
        for (key, value) in attributes {
            encoded.insert((*key).to_owned(), self.codec.encode(value)?);
        }
        self.sessions.insert(
            data.id.clone(),
            StoredSession {
                meta: Some(stored_meta(data)),
                attributes: encoded,
                invalid: false,
            },
        );
        Ok(())
    }
}

fn stored_meta(data: &SessionData) -> SessionData {
    let mut meta = SessionData::existing(
        data.id.clone(),
        data.creation_time,
        data.last_accessed,
        data.max_inactive_interval,
    );
    meta.previous_owner.clone_from(&data.previous_owner);
    meta
}

#[async_trait]
impl SessionRepository for MemoryRepository {
    async fn get_session_data(&self, id: &str) -> Result<Option<SessionData>, SessionError> {
        Ok(self
            .sessions
            .get(id)
            .filter(|s| !s.invalid)
            .and_then(|s| s.meta.clone()))
    }

    async fn store_session_data(&self, data: &SessionData) -> Result<(), SessionError> {
        self.counters.stores.fetch_add(1, Ordering::SeqCst);
        self.sessions.entry(data.id.clone()).or_default().meta = Some(stored_meta(data));
        Ok(())
    }

    async fn get_attribute_keys(&self, id: &str) -> Result<HashSet<String>, SessionError> {
        Ok(self
            .sessions
            .get(id)
            .map(|s| s.attributes.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_session_attribute(
        &self,
        id: &str,
        key: &str,
    ) -> Result<Option<AttributeValue>, SessionError> {
        let bytes = self
            .sessions
            .get(id)
            .and_then(|s| s.attributes.get(key).cloned());
        bytes.map(|b| self.codec.decode(&b)).transpose()
    }

    async fn set_session_attribute(
        &self,
        id: &str,
        key: &str,
        value: &AttributeValue,
    ) -> Result<(), SessionError> {
        let bytes = self.codec.encode(value)?;
        self.sessions
            .entry(id.to_owned())
            .or_default()
            .attributes
            .insert(key.to_owned(), bytes);
        Ok(())
    }

    async fn remove_session_attribute(&self, id: &str, key: &str) -> Result<(), SessionError> {
        if let Some(mut session) = self.sessions.get_mut(id) {
            session.attributes.remove(key);
        }
        Ok(())
    }

    async fn remove(&self, data: &SessionData) -> Result<(), SessionError> {
        self.counters.removes.fetch_add(1, Ordering::SeqCst);
        self.sessions.remove(&data.id);
        Ok(())
    }

    async fn prepare_remove(&self, data: &SessionData) -> Result<bool, SessionError> {
        if self.removals_contended {
            return Ok(false);
        }
        let mut session = self.sessions.entry(data.id.clone()).or_default();
        Ok(!std::mem::replace(&mut session.invalid, true))
    }

    fn start_commit(&self, data: &SessionData) -> Box<dyn CommitTransaction> {
        Box::new(MemoryTransaction {
            meta: stored_meta(data),
            sets: Vec::new(),
            removes: Vec::new(),
            sessions: Arc::clone(&self.sessions),
            counters: Arc::clone(&self.counters),
            codec: Arc::clone(&self.codec),
        })
    }

    async fn session_id_change(&self, data: &SessionData) -> Result<(), SessionError> {
        self.counters.renames.fetch_add(1, Ordering::SeqCst);
        let Some(old_id) = &data.old_session_id else {
            return Err(SessionError::InvalidState(format!(
                "session {} has no previous id",
                data.id
            )));
        };
        if let Some((_, mut session)) = self.sessions.remove(old_id) {
            if let Some(meta) = session.meta.as_mut() {
                meta.id.clone_from(&data.id);
            }
            self.sessions.insert(data.id.clone(), session);
        }
        Ok(())
    }

    async fn owned_session_ids(&self) -> Result<Option<Vec<String>>, SessionError> {
        Ok(Some(
            self.sessions
                .iter()
                .filter(|s| !s.invalid)
                .map(|s| s.key().clone())
                .collect(),
        ))
    }

    async fn start(
        &self,
        handler: Weak<dyn ExpiredSessionHandler>,
        executor: &TaskExecutor,
    ) -> Result<(), SessionError> {
        let Some(interval) = self.sweep_interval else {
            return Ok(());
        };
        let sessions = Arc::clone(&self.sessions);
        executor.schedule_at_fixed_rate("memory-expiration", interval, interval, move || {
            let sessions = Arc::clone(&sessions);
            let handler = handler.clone();
            async move {
                let now = now_ms();
                let expired: Vec<String> = sessions
                    .iter()
                    .filter(|s| s.meta.as_ref().is_some_and(|m| m.is_expired_at(now)))
                    .map(|s| s.key().clone())
                    .collect();
                let Some(handler) = handler.upgrade() else {
                    return;
                };
                for id in expired {
                    if let Err(e) = handler.session_expired(&id).await {
                        warn!(session_id = %id, error = %e, "failed to expire session");
                    }
                }
            }
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), SessionError> {
        Ok(())
    }
}

struct MemoryTransaction {
    meta: SessionData,
    sets: Vec<(String, Vec<u8>)>,
    removes: Vec<String>,
    sessions: Arc<DashMap<String, StoredSession>>,
    counters: Arc<Counters>,
    codec: Arc<dyn SessionCodec>,
}

#[async_trait]
impl CommitTransaction for MemoryTransaction {
    fn add_attribute(&mut self, key: &str, value: &AttributeValue) -> Result<(), SessionError> {
        self.sets.push((key.to_owned(), self.codec.encode(value)?));
        Ok(())
    }

    fn remove_attribute(&mut self, key: &str) {
        self.removes.push(key.to_owned());
    }

    async fn commit(self: Box<Self>) -> Result<(), SessionError> {
        let this = *self;
        this.counters.commits.fetch_add(1, Ordering::SeqCst);
        let mut session = this.sessions.entry(this.meta.id.clone()).or_default();
        for key in &this.removes {
            session.attributes.remove(key);
        }
        session.attributes.extend(this.sets);
        session.meta = Some(this.meta);
        Ok(())
    }
}

/// One recorded notifier callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifierEvent {
    Created(String),
    Destroyed { id: String, expired: bool },
    AttributeAdded { id: String, key: String },
    AttributeReplaced { id: String, key: String },
    AttributeRemoved { id: String, key: String },
    AttributeRestored { id: String, key: String },
    Stored(String),
    IdChanged { old_id: String, new_id: String },
}

/// [`SessionNotifier`] that records every callback in order.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<NotifierEvent>>,
}

impl RecordingNotifier {
    #[must_use]
    pub fn events(&self) -> Vec<NotifierEvent> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    fn push(&self, event: NotifierEvent) {
        self.events.lock().push(event);
    }
}

impl SessionNotifier for RecordingNotifier {
    fn session_created(&self, session: &Session) {
        self.push(NotifierEvent::Created(session.id()));
    }

    fn session_destroyed(&self, session: &Session, expired: bool) {
        self.push(NotifierEvent::Destroyed {
            id: session.id(),
            expired,
        });
    }

    fn attribute_added(&self, session: &Session, key: &str, _value: &AttributeValue) {
        self.push(NotifierEvent::AttributeAdded {
            id: session.id(),
            key: key.to_owned(),
        });
    }

    fn attribute_replaced(&self, session: &Session, key: &str, _old: &AttributeValue) {
        self.push(NotifierEvent::AttributeReplaced {
            id: session.id(),
            key: key.to_owned(),
        });
    }

    fn attribute_removed(&self, session: &Session, key: &str, _old: &AttributeValue) {
        self.push(NotifierEvent::AttributeRemoved {
            id: session.id(),
            key: key.to_owned(),
        });
    }

    fn attribute_restored(&self, session: &Session, key: &str, _value: &AttributeValue) {
        self.push(NotifierEvent::AttributeRestored {
            id: session.id(),
            key: key.to_owned(),
        });
    }

    fn session_stored(&self, session: &Session) {
        self.push(NotifierEvent::Stored(session.id()));
    }

    fn session_id_changed(&self, session: &Session, old_id: &str) {
        self.push(NotifierEvent::IdChanged {
            old_id: old_id.to_owned(),
            new_id: session.id(),
        });
    }
}

/// Minimal [`RequestContext`] backed by a map.
#[derive(Debug, Clone, Default)]
pub struct TestRequest {
    pub attributes: HashMap<String, String>,
    pub retrieved: Option<String>,
    pub forced: Option<String>,
}

impl TestRequest {
    /// A request presenting `id` under the default session attribute.
    #[must_use]
    pub fn with_session_id(id: &str) -> Self {
        let mut request = Self::default();
        request
            .attributes
            .insert(DEFAULT_SESSION_ATTRIBUTE.to_owned(), id.to_owned());
        request
    }
}

impl RequestContext for TestRequest {
    fn retrieved_id(&self) -> Option<String> {
        self.retrieved.clone()
    }

    fn set_retrieved_id(&mut self, id: &str) {
        self.retrieved = Some(id.to_owned());
    }

    fn forced_id(&self) -> Option<String> {
        self.forced.clone()
    }

    fn attribute(&self, name: &str) -> Option<String> {
        self.attributes.get(name).cloned()
    }

    fn set_attribute(&mut self, name: &str, value: &str) {
        self.attributes.insert(name.to_owned(), value.to_owned());
    }
}

/// Tracking that issues predictable ids `<prefix>-1`, `<prefix>-2`, ...
#[derive(Debug)]
pub struct FixedTracking {
    prefix: String,
    next: AtomicU64,
}

impl FixedTracking {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }
}

impl SessionTracking for FixedTracking {
    fn retrieve_id(&self, request: &dyn RequestContext) -> Option<String> {
        request.attribute(DEFAULT_SESSION_ATTRIBUTE)
    }

    fn new_session_id(&self) -> String {
        format!("{}-{}", self.prefix, self.next.fetch_add(1, Ordering::SeqCst))
    }

    fn propagate(&self, id: &str, request: &mut dyn RequestContext) {
        request.set_attribute(DEFAULT_SESSION_ATTRIBUTE, id);
    }
}

/// Run the session repository conformance suite.
///
/// Call this from a backend's tests with a fresh repository instance.
///
/// # Errors
///
/// Returns an error if a repository call fails; assertion failures panic.
pub async fn run_repository_conformance_tests(
    repo: &dyn SessionRepository,
) -> Result<(), SessionError> {
    test_missing_session(repo).await?;
    test_commit_and_read_back(repo).await?;
    test_commit_removes_attributes(repo).await?;
    test_direct_attribute_access(repo).await?;
    test_store_session_data(repo).await?;
    test_prepare_remove_once(repo).await?;
    test_remove(repo).await?;
    test_session_id_change(repo).await?;
    Ok(())
}

fn fresh(id: &str) -> SessionData {
    SessionData::new(id, now_ms(), 1800)
}

async fn commit_with(
    repo: &dyn SessionRepository,
    data: &SessionData,
    attributes: &[(&str, AttributeValue)],
) -> Result<(), SessionError> {
    let mut tx = repo.start_commit(data);
    for (key, value) in attributes {
        tx.add_attribute(key, value)?;
    }
    tx.commit().await
}

async fn test_missing_session(repo: &dyn SessionRepository) -> Result<(), SessionError> {
    assert!(
        repo.get_session_data("conformance-missing").await?.is_none(),
        "unknown session should be absent"
    );
    assert!(repo.get_attribute_keys("conformance-missing").await?.is_empty());
    Ok(())
}

async fn test_commit_and_read_back(repo: &dyn SessionRepository) -> Result<(), SessionError> {
    let data = fresh("conformance-commit");
    commit_with(
        repo,
        &data,
        &[("user", json!("alice")), ("cart", json!({"items": [1, 2]}))],
    )
    .await?;

    let stored = repo
        .get_session_data(&data.id)
        .await?
        .expect("committed session should be readable");
    assert!(!stored.is_new, "stored session should not be new");
    assert_eq!(stored.creation_time, data.creation_time);
    assert_eq!(stored.last_accessed, data.last_accessed);
    assert_eq!(stored.max_inactive_interval, 1800);

    assert_eq!(
        repo.get_session_attribute(&data.id, "user").await?,
        Some(json!("alice"))
    );
    assert_eq!(
        repo.get_session_attribute(&data.id, "cart").await?,
        Some(json!({"items": [1, 2]}))
    );
    let keys = repo.get_attribute_keys(&data.id).await?;
    assert_eq!(keys, HashSet::from(["user".to_owned(), "cart".to_owned()]));
    Ok(())
}

async fn test_commit_removes_attributes(repo: &dyn SessionRepository) -> Result<(), SessionError> {
    let data = fresh("conformance-remove-attr");
    commit_with(repo, &data, &[("a", json!(1)), ("b", json!(2))]).await?;

    let mut tx = repo.start_commit(&data);
    tx.remove_attribute("a");
    tx.add_attribute("c", &json!(3))?;
    tx.commit().await?;

    let keys = repo.get_attribute_keys(&data.id).await?;
    assert_eq!(keys, HashSet::from(["b".to_owned(), "c".to_owned()]));
    assert_eq!(repo.get_session_attribute(&data.id, "a").await?, None);
    Ok(())
}

async fn test_direct_attribute_access(repo: &dyn SessionRepository) -> Result<(), SessionError> {
    let data = fresh("conformance-direct");
    commit_with(repo, &data, &[]).await?;

    repo.set_session_attribute(&data.id, "flag", &json!(true)).await?;
    assert_eq!(
        repo.get_session_attribute(&data.id, "flag").await?,
        Some(json!(true))
    );
    repo.remove_session_attribute(&data.id, "flag").await?;
    assert_eq!(repo.get_session_attribute(&data.id, "flag").await?, None);
    Ok(())
}

async fn test_store_session_data(repo: &dyn SessionRepository) -> Result<(), SessionError> {
    let mut data = fresh("conformance-touch");
    commit_with(repo, &data, &[("k", json!("v"))]).await?;

    data.touch(data.last_accessed + 1000);
    repo.store_session_data(&data).await?;
    let stored = repo
        .get_session_data(&data.id)
        .await?
        .expect("touched session should be readable");
    assert_eq!(stored.last_accessed, data.last_accessed);
    assert_eq!(
        repo.get_session_attribute(&data.id, "k").await?,
        Some(json!("v")),
        "touch must not drop attributes"
    );
    Ok(())
}

async fn test_prepare_remove_once(repo: &dyn SessionRepository) -> Result<(), SessionError> {
    let data = fresh("conformance-prepare");
    commit_with(repo, &data, &[]).await?;

    assert!(repo.prepare_remove(&data).await?, "first remover should win");
    assert!(!repo.prepare_remove(&data).await?, "second remover should lose");
    assert!(
        repo.get_session_data(&data.id).await?.is_none(),
        "session reserved for removal should read as absent"
    );
    repo.remove(&data).await?;
    Ok(())
}

async fn test_remove(repo: &dyn SessionRepository) -> Result<(), SessionError> {
    let data = fresh("conformance-delete");
    commit_with(repo, &data, &[("x", json!(1))]).await?;
    repo.remove(&data).await?;
    assert!(repo.get_session_data(&data.id).await?.is_none());
    assert!(repo.get_attribute_keys(&data.id).await?.is_empty());
    Ok(())
}

async fn test_session_id_change(repo: &dyn SessionRepository) -> Result<(), SessionError> {
    let mut data = fresh("conformance-old");
    commit_with(repo, &data, &[("user", json!("bob"))]).await?;

    data.is_new = false;
    data.rename("conformance-new");
    repo.session_id_change(&data).await?;

    assert!(repo.get_session_data("conformance-old").await?.is_none());
    let moved = repo
        .get_session_data("conformance-new")
        .await?
        .expect("renamed session should be readable under the new id");
    assert_eq!(moved.id, "conformance-new");
    assert_eq!(
        repo.get_session_attribute("conformance-new", "user").await?,
        Some(json!("bob"))
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_repository_conformance() {
        let repo = MemoryRepository::new();
        run_repository_conformance_tests(&repo).await.unwrap();
        assert_eq!(repo.rename_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_prepare_remove_has_one_winner() {
        let repo = Arc::new(MemoryRepository::new());
        let data = fresh("race");
        repo.insert(&data, &[]).unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let repo = Arc::clone(&repo);
            let data = data.clone();
            handles.push(tokio::spawn(async move { repo.prepare_remove(&data).await }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn encrypted_values_round_trip_through_the_codec() {
        let config = crate::SessionConfiguration {
            encryption_key: Some("test-passphrase".into()),
            ..crate::SessionConfiguration::default()
        };
        let repo = MemoryRepository::with_codec(crate::codec::codec_for(&config).unwrap());
        let data = fresh("encrypted");
        repo.insert(&data, &[("card", json!("4111"))]).unwrap();
        assert_eq!(
            repo.get_session_attribute("encrypted", "card").await.unwrap(),
            Some(json!("4111"))
        );
    }
}
