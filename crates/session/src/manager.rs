use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::builder::SessionManagerBuilder;
use crate::config::SessionConfiguration;
use crate::data::{SessionData, now_ms};
use crate::error::SessionError;
use crate::executor::TaskExecutor;
use crate::factory::SessionFactory;
use crate::metrics::SessionMetrics;
use crate::notifier::SessionNotifier;
use crate::repository::{ExpiredSessionHandler, SessionRepository};
use crate::session::Session;
use crate::tracking::{RequestContext, SessionTracking};

/// Resolves, creates, commits and deletes sessions.
///
/// Always held in an [`Arc`]; sessions and the expiration machinery keep
/// only weak references back to it.
pub struct SessionManager {
    pub(crate) config: SessionConfiguration,
    pub(crate) repository: Arc<dyn SessionRepository>,
    pub(crate) factory: SessionFactory,
    pub(crate) notifier: Arc<dyn SessionNotifier>,
    pub(crate) tracking: Arc<dyn SessionTracking>,
    pub(crate) executor: TaskExecutor,
    pub(crate) metrics: Arc<SessionMetrics>,
    pub(crate) self_ref: Weak<SessionManager>,
    closed: AtomicBool,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("namespace", &self.config.namespace)
            .field("node", &self.config.node)
            .field("cached_sessions", &self.factory.cached_count())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Start building a manager over `repository`.
    pub fn builder(
        config: SessionConfiguration,
        repository: Arc<dyn SessionRepository>,
    ) -> SessionManagerBuilder {
        SessionManagerBuilder::new(config, repository)
    }

    pub(crate) fn new_cyclic(
        config: SessionConfiguration,
        repository: Arc<dyn SessionRepository>,
        notifier: Arc<dyn SessionNotifier>,
        tracking: Arc<dyn SessionTracking>,
        executor: TaskExecutor,
        metrics: Arc<SessionMetrics>,
    ) -> Arc<Self> {
        let factory = SessionFactory::new(config.allow_cache);
        Arc::new_cyclic(|self_ref| Self {
            config,
            repository,
            factory,
            notifier,
            tracking,
            executor,
            metrics,
            self_ref: self_ref.clone(),
            closed: AtomicBool::new(false),
        })
    }

    /// Start the repository's background expiration.
    pub async fn start(&self) -> Result<(), SessionError> {
        let handler: Weak<dyn ExpiredSessionHandler> = self.self_ref.clone();
        self.repository.start(handler, &self.executor).await?;
        info!(
            namespace = %self.config.namespace,
            node = %self.config.node,
            "session manager started"
        );
        Ok(())
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfiguration {
        &self.config
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<SessionMetrics> {
        &self.metrics
    }

    #[must_use]
    pub fn factory(&self) -> &SessionFactory {
        &self.factory
    }

    #[must_use]
    pub fn executor(&self) -> &TaskExecutor {
        &self.executor
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Look a session up by id.
    ///
    /// A session found past its expiry is invalidated on the spot and
    /// reported as absent. With `touch`, its last-access time is refreshed
    /// and persisted. A returned session is locked for use by the caller,
    /// which must commit it.
    pub async fn fetch_session(&self, id: &str, touch: bool) -> Result<Option<Session>, SessionError> {
        self.ensure_open()?;
        let mut data = match self.repository.get_session_data(id).await {
            Ok(Some(data)) => data,
            Ok(None) => {
                self.metrics.increment_missing();
                return Ok(None);
            }
            Err(e) => {
                self.metrics.increment_fetch_errors();
                return Err(e);
            }
        };

        if data.is_expired() {
            debug!(session_id = %id, "found expired session");
            self.metrics.increment_missing();
            let expired = Session::new(data, self.self_ref.clone());
            if let Err(e) = expired.invalidate_with(true).await {
                warn!(session_id = %id, error = %e, "failed to remove expired session");
            }
            return Ok(None);
        }

        if touch {
            data.touch(now_ms());
            self.repository.store_session_data(&data).await?;
        }
        self.prepare(&mut data);
        self.metrics.increment_retrieved();
        Ok(Some(self.factory.build(data, &self.self_ref)))
    }

    /// Resolve the session for a request.
    ///
    /// The id is taken from `force_id`, the request's forced id, the id
    /// already retrieved for this request, or the tracking strategy, in that
    /// order. When nothing is found and `create` is set, a new session is
    /// created under the forced id or a freshly issued one. The returned
    /// session is locked for use by this request.
    pub async fn get_session(
        &self,
        request: &mut dyn RequestContext,
        create: bool,
        force_id: Option<&str>,
    ) -> Result<Option<Session>, SessionError> {
        self.ensure_open()?;
        let forced = force_id.map(str::to_owned).or_else(|| request.forced_id());
        let id = match forced.clone().or_else(|| request.retrieved_id()) {
            Some(id) => Some(id),
            None => self.tracking.retrieve_id(&*request),
        };

        let mut session = match &id {
            Some(id) => self.fetch_session(id, true).await?,
            None => None,
        };
        if session.is_none() && create {
            let id = forced.unwrap_or_else(|| self.tracking.new_session_id());
            session = Some(self.new_session(&id));
        }

        if let Some(session) = &session {
            let id = session.id();
            request.set_retrieved_id(&id);
            self.tracking.propagate(&id, request);
        }
        Ok(session)
    }

    /// Create and register a new session with `id`, locked for use by the
    /// caller.
    pub fn new_session(&self, id: &str) -> Session {
        let mut data = SessionData::new(id, now_ms(), self.config.max_inactive_interval);
        self.prepare(&mut data);
        let session = self.factory.build(data, &self.self_ref);
        self.metrics.increment_created();
        self.notifier.session_created(&session);
        debug!(session_id = %id, "session created");
        session
    }

    /// Delete a session. With `expired`, the session is left alone if a
    /// concurrent access renewed it. Returns whether a session was removed.
    pub async fn delete(&self, id: &str, expired: bool) -> Result<bool, SessionError> {
        let Some(mut data) = self.repository.get_session_data(id).await? else {
            debug!(session_id = %id, "session to delete not found");
            return Ok(false);
        };
        if expired && !data.is_expired() {
            debug!(session_id = %id, "session no longer expired, keeping it");
            return Ok(false);
        }
        self.prepare(&mut data);
        let session = self.factory.for_removal(data, &self.self_ref);
        session.invalidate_with(expired).await?;
        Ok(true)
    }

    /// Delete a session in the background.
    pub fn delete_async(&self, id: &str, expired: bool) {
        let manager = self.self_ref.clone();
        let id = id.to_owned();
        self.executor.submit("delete-session", async move {
            let Some(manager) = manager.upgrade() else {
                return;
            };
            if let Err(e) = manager.delete(&id, expired).await {
                warn!(session_id = %id, error = %e, "background session delete failed");
            }
        });
    }

    /// Give `session` a new id. Returns the new id, or `None` if the session
    /// was already renamed in this request cycle.
    pub async fn switch_session_id(&self, session: &Session) -> Result<Option<String>, SessionError> {
        let new_id = self.tracking.new_session_id();
        let Some(old_id) = session.rename(&new_id) else {
            self.metrics.increment_id_change_conflicts();
            warn!(
                session_id = %session.id(),
                "session id already changed in this request, ignoring"
            );
            return Ok(None);
        };

        let data = session.data();
        self.repository.session_id_change(&data).await?;
        self.factory.session_id_change(session, &old_id);
        self.notifier.session_id_changed(session, &old_id);
        self.metrics.increment_id_changes();
        info!(old_id = %old_id, new_id = %new_id, "session id changed");
        Ok(Some(new_id))
    }

    /// Commit a session, logging and dropping any failure so that the
    /// request itself never fails on session persistence.
    pub async fn commit(&self, session: &Session) {
        if let Err(e) = self.try_commit(session).await {
            self.metrics.increment_commit_failures();
            error!(session_id = %session.id(), error = %e, "session commit failed");
        }
    }

    /// Commit a session, returning any failure.
    pub async fn try_commit(&self, session: &Session) -> Result<(), SessionError> {
        session.commit().await
    }

    /// Record that `session` lost an invalidation race.
    pub fn invalidation_conflict(&self, session: &Session, expired: bool) {
        self.metrics.increment_invalidation_conflicts();
        if expired {
            info!(session_id = %session.id(), "expired session already removed by another node");
        } else {
            warn!(session_id = %session.id(), "session invalidated concurrently");
        }
    }

    /// Shut down: clean up owned sessions where supported, close the
    /// repository and stop background work.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let snapshot = self.metrics.snapshot();
        info!(
            created = snapshot.created,
            deleted = snapshot.deleted,
            expired = snapshot.expired,
            committed = snapshot.committed,
            failovers = snapshot.failovers,
            "stopping session metrics reporting"
        );

        match self.repository.owned_session_ids().await {
            Ok(Some(ids)) => {
                info!(count = ids.len(), "removing sessions owned by this node");
                for id in ids {
                    if let Err(e) = self.delete(&id, false).await {
                        warn!(session_id = %id, error = %e, "failed to remove session on shutdown");
                    }
                }
            }
            Ok(None) => {
                info!("repository cannot enumerate owned sessions, skipping shutdown cleanup");
            }
            Err(e) => warn!(error = %e, "failed to list owned sessions"),
        }

        if let Err(e) = self.repository.close().await {
            warn!(error = %e, "failed to close session repository");
        }
        self.executor.shutdown().await;
        info!("session manager closed");
    }

    /// Close the manager and drop every cached session.
    pub async fn reset(&self) {
        self.close().await;
        self.factory.clear();
    }

    fn prepare(&self, data: &mut SessionData) {
        data.mandatory_remote_keys
            .clone_from(&self.config.non_cacheable_attributes);
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.is_closed() {
            Err(SessionError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ExpiredSessionHandler for SessionManager {
    async fn session_expired(&self, id: &str) -> Result<(), SessionError> {
        self.delete(id, true).await.map(|_| ())
    }

    async fn session_id_redirected(&self, old_id: &str, new_id: &str) {
        self.factory.remote_id_change(old_id, new_id);
    }
}
