//! The per-request session facade.
//!
//! A [`Session`] is two reference-counted halves. The shared half holds the
//! metadata, the attribute map and the concurrency counters; every facade
//! handed out for the same id while the id is cached points at the same shared
//! half. The request half holds the flags that must stay private to one
//! request: whether it currently holds a use of the session and whether it
//! already committed. [`Session::wrap`] produces a new request half over an
//! existing shared half.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::data::{AttributeValue, SessionData};
use crate::error::SessionError;
use crate::manager::SessionManager;
use crate::repository::CommitTransaction;

/// Local view of one attribute.
///
/// `deleted` implies `value == None`. `changed` means the entry has not been
/// written since the last commit. `version` increases on every local
/// mutation so a commit only clears `changed` on entries it actually wrote.
#[derive(Debug, Clone, Default)]
pub(crate) struct Attribute {
    value: Option<AttributeValue>,
    deleted: bool,
    changed: bool,
    version: u64,
}

impl Attribute {
    fn restored(value: AttributeValue) -> Self {
        Self {
            value: Some(value),
            ..Self::default()
        }
    }

    fn set(&mut self, value: AttributeValue) -> Option<AttributeValue> {
        self.version += 1;
        self.changed = true;
        self.deleted = false;
        self.value.replace(value)
    }

    fn delete(&mut self) -> Option<AttributeValue> {
        self.version += 1;
        self.changed = true;
        self.deleted = true;
        self.value.take()
    }

    fn mark_changed(&mut self) {
        self.version += 1;
        self.changed = true;
    }
}

struct SharedSession {
    data: RwLock<SessionData>,
    attributes: DashMap<String, Attribute>,
    concurrent_uses: AtomicI32,
    dirty: AtomicBool,
    valid: AtomicBool,
    invalidated: AtomicBool,
    invalidation_deferred: AtomicBool,
    expired: AtomicBool,
    manager: Weak<SessionManager>,
}

#[derive(Default)]
struct RequestState {
    locked_for_use: AtomicBool,
    committed: AtomicBool,
}

/// A request's handle on one session.
///
/// Cloning a `Session` yields another handle for the *same* request. Use
/// [`wrap`](Self::wrap) to derive a handle for a different request.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SharedSession>,
    local: Arc<RequestState>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("valid", &self.is_valid())
            .field("dirty", &self.is_dirty())
            .field("concurrent_uses", &self.concurrent_uses())
            .field("locked_for_use", &self.is_locked_for_use())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(data: SessionData, manager: Weak<SessionManager>) -> Self {
        Self {
            shared: Arc::new(SharedSession {
                data: RwLock::new(data),
                attributes: DashMap::new(),
                concurrent_uses: AtomicI32::new(0),
                dirty: AtomicBool::new(false),
                valid: AtomicBool::new(true),
                invalidated: AtomicBool::new(false),
                invalidation_deferred: AtomicBool::new(false),
                expired: AtomicBool::new(false),
                manager,
            }),
            local: Arc::new(RequestState::default()),
        }
    }

    /// A handle for another request sharing this session's attributes and
    /// counters, with fresh per-request commit state.
    #[must_use]
    pub fn wrap(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            local: Arc::new(RequestState::default()),
        }
    }

    /// Whether both handles view the same shared session.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    #[must_use]
    pub fn id(&self) -> String {
        self.shared.data.read().id.clone()
    }

    /// Snapshot of the session metadata.
    #[must_use]
    pub fn data(&self) -> SessionData {
        self.shared.data.read().clone()
    }

    #[must_use]
    pub fn is_new(&self) -> bool {
        self.shared.data.read().is_new
    }

    #[must_use]
    pub fn creation_time(&self) -> i64 {
        self.shared.data.read().creation_time
    }

    #[must_use]
    pub fn last_accessed_time(&self) -> i64 {
        self.shared.data.read().last_accessed
    }

    #[must_use]
    pub fn max_inactive_interval(&self) -> i32 {
        self.shared.data.read().max_inactive_interval
    }

    /// Change the inactivity timeout; takes effect on the next commit.
    pub fn set_max_inactive_interval(&self, seconds: i32) {
        self.shared.data.write().max_inactive_interval = seconds;
        self.shared.dirty.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.shared.data.read().is_expired()
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.shared.valid.load(Ordering::SeqCst)
    }

    /// Whether uncommitted local changes exist.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.shared.dirty.load(Ordering::SeqCst)
    }

    /// Number of requests currently holding this session.
    #[must_use]
    pub fn concurrent_uses(&self) -> i32 {
        self.shared.concurrent_uses.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_locked_for_use(&self) -> bool {
        self.local.locked_for_use.load(Ordering::SeqCst)
    }

    /// Register this request as a user of the session. Idempotent per
    /// request; returns `true` on the first call.
    ///
    /// The first user of an idle session opens a new cycle, which allows one
    /// more id change.
    pub fn lock_for_use(&self) -> bool {
        if self
            .local
            .locked_for_use
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        if self.shared.concurrent_uses.fetch_add(1, Ordering::SeqCst) == 0 {
            self.shared.data.write().begin_cycle();
        }
        true
    }

    /// Read an attribute.
    ///
    /// Served from the local view when possible; otherwise loaded from the
    /// repository and cached. Reading a value whose kind is not configured
    /// as immutable marks it changed, since the caller may mutate it.
    pub async fn get_attribute(&self, key: &str) -> Result<Option<AttributeValue>, SessionError> {
        self.ensure_valid()?;
        let manager = self.manager()?;
        let remote = self.is_always_remote(key);

        if !remote {
            let cached = self.shared.attributes.get(key).map(|a| a.value.clone());
            match cached {
                Some(None) => return Ok(None),
                Some(Some(value)) => {
                    self.replicate_on_get(&manager, key, &value);
                    return Ok(Some(value));
                }
                None if !self.may_exist_remotely(key) => return Ok(None),
                None => {}
            }
        }

        let id = self.id();
        let Some(value) = manager.repository.get_session_attribute(&id, key).await? else {
            return Ok(None);
        };
        if !remote {
            match self.shared.attributes.entry(key.to_owned()) {
                Entry::Occupied(entry) => {
                    // Another request populated the entry while we were fetching.
                    let current = entry.get().value.clone();
                    drop(entry);
                    if let Some(current) = &current {
                        self.replicate_on_get(&manager, key, current);
                    }
                    return Ok(current);
                }
                Entry::Vacant(entry) => {
                    entry.insert(Attribute::restored(value.clone()));
                }
            }
        }
        manager.notifier.attribute_restored(self, key, &value);
        if !remote {
            self.replicate_on_get(&manager, key, &value);
        }
        Ok(Some(value))
    }

    /// Write an attribute. A `null` value removes it.
    pub async fn set_attribute(&self, key: &str, value: AttributeValue) -> Result<(), SessionError> {
        if value.is_null() {
            return self.remove_attribute(key).await;
        }
        self.ensure_valid()?;
        let manager = self.manager()?;
        let remote = self.is_always_remote(key);
        if remote {
            let id = self.id();
            manager
                .repository
                .set_session_attribute(&id, key, &value)
                .await?;
        }

        let old = {
            let mut entry = self.shared.attributes.entry(key.to_owned()).or_default();
            let old = entry.set(value.clone());
            if remote {
                entry.changed = false;
            }
            old
        };
        self.shared.dirty.store(true, Ordering::SeqCst);

        match old {
            Some(old) => manager.notifier.attribute_replaced(self, key, &old),
            None => manager.notifier.attribute_added(self, key, &value),
        }
        Ok(())
    }

    /// Remove an attribute.
    pub async fn remove_attribute(&self, key: &str) -> Result<(), SessionError> {
        self.ensure_valid()?;
        let manager = self.manager()?;
        let remote = self.is_always_remote(key);
        if remote {
            let id = self.id();
            manager.repository.remove_session_attribute(&id, key).await?;
        }

        let is_new = self.is_new();
        let old = match self.shared.attributes.entry(key.to_owned()) {
            Entry::Occupied(mut entry) => {
                let old = entry.get_mut().delete();
                if remote {
                    entry.get_mut().changed = false;
                }
                old
            }
            Entry::Vacant(entry) => {
                // Unknown locally but possibly stored; record a tombstone so the
                // commit deletes it.
                if !is_new && !remote {
                    let mut tombstone = Attribute::default();
                    tombstone.delete();
                    entry.insert(tombstone);
                }
                None
            }
        };
        self.shared.dirty.store(true, Ordering::SeqCst);

        if let Some(old) = old {
            manager.notifier.attribute_removed(self, key, &old);
        }
        Ok(())
    }

    /// Names of all live attributes, local and stored.
    pub async fn attribute_names(&self) -> Result<Vec<String>, SessionError> {
        self.ensure_valid()?;
        let manager = self.manager()?;
        let needs_keys = {
            let data = self.shared.data.read();
            !data.is_new && data.repository_keys.is_none()
        };
        if needs_keys {
            let id = self.id();
            let keys = manager.repository.get_attribute_keys(&id).await?;
            let mut data = self.shared.data.write();
            if data.repository_keys.is_none() {
                data.repository_keys = Some(keys);
            }
        }

        let mut names = self
            .shared
            .data
            .read()
            .repository_keys
            .clone()
            .unwrap_or_default();
        for entry in &self.shared.attributes {
            if entry.deleted {
                names.remove(entry.key());
            } else {
                names.insert(entry.key().clone());
            }
        }
        let mut names: Vec<String> = names.into_iter().collect();
        names.sort();
        Ok(names)
    }

    /// Invalidate the session as an administrative delete.
    pub async fn invalidate(&self) -> Result<(), SessionError> {
        self.invalidate_with(false).await
    }

    /// Invalidate the session.
    ///
    /// The removal is first reserved in the repository; a caller that loses
    /// that race hands the session to the manager's conflict handler. If
    /// another request still uses the session, the wipe is deferred to the
    /// last concurrent commit.
    pub async fn invalidate_with(&self, expired: bool) -> Result<(), SessionError> {
        self.ensure_valid()?;
        let manager = self.manager()?;
        let data = self.data();

        let won = manager.repository.prepare_remove(&data).await?;
        self.shared.valid.store(false, Ordering::SeqCst);
        if !won {
            manager.factory.discard(self);
            manager.invalidation_conflict(self, expired);
            return Ok(());
        }
        self.shared.invalidated.store(true, Ordering::SeqCst);
        self.shared.expired.store(expired, Ordering::SeqCst);

        let own_use = i32::from(self.is_locked_for_use());
        if self.concurrent_uses() - own_use > 0 {
            self.shared
                .invalidation_deferred
                .store(true, Ordering::SeqCst);
            debug!(session_id = %data.id, "session in use elsewhere, removal deferred");
            return Ok(());
        }
        self.wipe(&manager, expired).await
    }

    /// Finish this request's use of the session.
    ///
    /// Only the last concurrent user writes to the repository, unless the
    /// manager is configured to commit on every request. A deferred commit
    /// keeps all change flags so the last user still sees them.
    pub async fn commit(&self) -> Result<(), SessionError> {
        let manager = self.manager()?;
        let was_locked = self
            .local
            .locked_for_use
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        let remaining = if was_locked {
            self.shared.concurrent_uses.fetch_sub(1, Ordering::SeqCst) - 1
        } else {
            self.concurrent_uses()
        };
        let last = remaining <= 0;

        let result = if self.shared.invalidated.load(Ordering::SeqCst) {
            if last
                && self
                    .shared
                    .invalidation_deferred
                    .swap(false, Ordering::SeqCst)
            {
                let expired = self.shared.expired.load(Ordering::SeqCst);
                self.wipe(&manager, expired).await
            } else {
                Ok(())
            }
        } else if !self.is_valid() {
            Ok(())
        } else if self.is_dirty() || !self.local.committed.load(Ordering::SeqCst) {
            if last || manager.config.commit_on_all_concurrent {
                self.write(&manager).await
            } else {
                manager.metrics.increment_deferred_commits();
                debug!(
                    session_id = %self.id(),
                    remaining,
                    "commit deferred to last concurrent user"
                );
                Ok(())
            }
        } else {
            Ok(())
        };

        manager.factory.committed(self);
        result
    }

    pub(crate) fn rename(&self, new_id: &str) -> Option<String> {
        self.shared.data.write().rename(new_id)
    }

    /// Fold metadata read from the repository into a cached session.
    pub(crate) fn merge_metadata(&self, fresh: &SessionData) {
        let mut data = self.shared.data.write();
        if fresh.last_accessed > data.last_accessed {
            data.previous_last_accessed = data.last_accessed;
            data.last_accessed = fresh.last_accessed;
        }
        if data.previous_owner.is_none() {
            data.previous_owner.clone_from(&fresh.previous_owner);
        }
    }

    async fn write(&self, manager: &SessionManager) -> Result<(), SessionError> {
        manager.notifier.session_stored(self);
        self.shared.dirty.store(false, Ordering::SeqCst);
        let data = self.data();
        let mut tx = manager.repository.start_commit(&data);

        let outcome = match self.stage(tx.as_mut()) {
            Ok(written) => tx.commit().await.map(|()| written),
            Err(e) => Err(e),
        };
        let written = match outcome {
            Ok(written) => written,
            Err(e) => {
                self.shared.dirty.store(true, Ordering::SeqCst);
                return Err(e);
            }
        };

        for (key, version) in written {
            if let Some(mut attribute) = self.shared.attributes.get_mut(&key) {
                if attribute.version == version {
                    attribute.changed = false;
                }
            }
        }
        self.shared.data.write().is_new = false;
        self.local.committed.store(true, Ordering::SeqCst);
        manager.metrics.increment_committed();
        debug!(session_id = %data.id, "session committed");
        Ok(())
    }

    fn stage(&self, tx: &mut dyn CommitTransaction) -> Result<Vec<(String, u64)>, SessionError> {
        let mut written = Vec::new();
        for entry in &self.shared.attributes {
            if !entry.changed {
                continue;
            }
            if entry.deleted {
                tx.remove_attribute(entry.key());
            } else if let Some(value) = &entry.value {
                tx.add_attribute(entry.key(), value)?;
            }
            written.push((entry.key().clone(), entry.version));
        }
        Ok(written)
    }

    async fn wipe(&self, manager: &SessionManager, expired: bool) -> Result<(), SessionError> {
        let data = self.data();
        let removed: Vec<(String, AttributeValue)> = self
            .shared
            .attributes
            .iter()
            .filter_map(|a| a.value.clone().map(|v| (a.key().clone(), v)))
            .collect();
        self.shared.attributes.clear();
        for (key, value) in &removed {
            manager.notifier.attribute_removed(self, key, value);
        }
        manager.notifier.session_destroyed(self, expired);

        let result = manager.repository.remove(&data).await;
        manager.factory.discard(self);
        if expired {
            manager.metrics.increment_expired();
        } else {
            manager.metrics.increment_deleted();
        }
        info!(session_id = %data.id, expired, "session removed");
        result
    }

    fn replicate_on_get(&self, manager: &SessionManager, key: &str, value: &AttributeValue) {
        if !manager.config.replicates_on_get(value) {
            return;
        }
        if let Some(mut attribute) = self.shared.attributes.get_mut(key) {
            if !attribute.deleted {
                attribute.mark_changed();
            }
        }
        self.shared.dirty.store(true, Ordering::SeqCst);
    }

    fn is_always_remote(&self, key: &str) -> bool {
        self.shared.data.read().is_mandatory_remote(key)
    }

    fn may_exist_remotely(&self, key: &str) -> bool {
        let data = self.shared.data.read();
        !data.is_new
            && data
                .repository_keys
                .as_ref()
                .is_none_or(|keys| keys.contains(key))
    }

    fn ensure_valid(&self) -> Result<(), SessionError> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(SessionError::InvalidState(format!(
                "session {} has been invalidated",
                self.id()
            )))
        }
    }

    fn manager(&self) -> Result<Arc<SessionManager>, SessionError> {
        self.shared.manager.upgrade().ok_or(SessionError::Closed)
    }
}
