use std::collections::HashSet;
use std::sync::Weak;

use async_trait::async_trait;

use crate::data::{AttributeValue, SessionData};
use crate::error::SessionError;
use crate::executor::TaskExecutor;

/// Durable storage for session metadata and attributes.
///
/// Implementations must be `Send + Sync` and safe for concurrent access from
/// many request tasks.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Load a session's metadata. Returns `None` if the session does not
    /// exist, is marked invalid, or was read while being torn down.
    async fn get_session_data(&self, id: &str) -> Result<Option<SessionData>, SessionError>;

    /// Persist metadata only (touch without attribute changes).
    async fn store_session_data(&self, data: &SessionData) -> Result<(), SessionError>;

    /// Names of all attributes stored for the session.
    async fn get_attribute_keys(&self, id: &str) -> Result<HashSet<String>, SessionError>;

    /// Read one attribute.
    async fn get_session_attribute(
        &self,
        id: &str,
        key: &str,
    ) -> Result<Option<AttributeValue>, SessionError>;

    /// Write one attribute immediately, outside any transaction.
    async fn set_session_attribute(
        &self,
        id: &str,
        key: &str,
        value: &AttributeValue,
    ) -> Result<(), SessionError>;

    /// Delete one attribute immediately.
    async fn remove_session_attribute(&self, id: &str, key: &str) -> Result<(), SessionError>;

    /// Delete the session and its expiration bookkeeping.
    async fn remove(&self, data: &SessionData) -> Result<(), SessionError>;

    /// Reserve the removal of a session. Exactly one concurrent caller
    /// receives `true`.
    async fn prepare_remove(&self, data: &SessionData) -> Result<bool, SessionError>;

    /// Begin accumulating a commit for the session described by `data`.
    fn start_commit(&self, data: &SessionData) -> Box<dyn CommitTransaction>;

    /// Move stored state from `data.old_session_id` to `data.id`.
    async fn session_id_change(&self, data: &SessionData) -> Result<(), SessionError>;

    /// Ids of sessions owned by this node, when the backend can enumerate
    /// them. `None` means enumeration is unsupported.
    async fn owned_session_ids(&self) -> Result<Option<Vec<String>>, SessionError> {
        Ok(None)
    }

    /// Start background expiration, reporting expired sessions to `handler`.
    async fn start(
        &self,
        handler: Weak<dyn ExpiredSessionHandler>,
        executor: &TaskExecutor,
    ) -> Result<(), SessionError>;

    /// Release connections and stop background work.
    async fn close(&self) -> Result<(), SessionError>;
}

/// Accumulated attribute writes for a single session, applied atomically by
/// [`commit`](Self::commit).
#[async_trait]
pub trait CommitTransaction: Send {
    /// Schedule an attribute write.
    ///
    /// # Errors
    ///
    /// Fails if the value cannot be encoded; the whole commit must then be
    /// abandoned.
    fn add_attribute(&mut self, key: &str, value: &AttributeValue) -> Result<(), SessionError>;

    /// Schedule an attribute deletion.
    fn remove_attribute(&mut self, key: &str);

    /// Apply all scheduled operations plus session metadata in one write.
    async fn commit(self: Box<Self>) -> Result<(), SessionError>;
}

/// Receives sessions the expiration machinery decided to reclaim.
#[async_trait]
pub trait ExpiredSessionHandler: Send + Sync {
    /// The session with `id` looks expired; delete it if it still is.
    async fn session_expired(&self, id: &str) -> Result<(), SessionError>;

    /// Another node renamed `old_id` to `new_id`.
    async fn session_id_redirected(&self, old_id: &str, new_id: &str);
}
