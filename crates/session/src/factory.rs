use std::sync::Weak;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use crate::data::SessionData;
use crate::manager::SessionManager;
use crate::session::Session;

/// Deduplicates sessions for requests that overlap on the same id.
///
/// With caching enabled the registry owns one shared session per id in use.
/// Concurrent requests receive [`wrap`](Session::wrap)ped handles of the
/// registered session, and the entry is evicted once the last of them
/// commits. With caching disabled every request gets an independent session.
#[derive(Debug)]
pub struct SessionFactory {
    cache: Option<DashMap<String, Session>>,
}

impl SessionFactory {
    #[must_use]
    pub fn new(allow_cache: bool) -> Self {
        Self {
            cache: allow_cache.then(DashMap::new),
        }
    }

    /// Return a handle for `data` locked for use by the calling request,
    /// reusing the registered session if another request already holds it.
    ///
    /// The use is taken while the registry entry is held, so eviction never
    /// observes an idle count for a handle that was already given out.
    pub(crate) fn build(&self, data: SessionData, manager: &Weak<SessionManager>) -> Session {
        let Some(cache) = &self.cache else {
            let session = Session::new(data, manager.clone());
            session.lock_for_use();
            return session;
        };
        match cache.entry(data.id.clone()) {
            Entry::Occupied(mut entry) if !entry.get().is_valid() => {
                let session = Session::new(data, manager.clone());
                session.lock_for_use();
                entry.insert(session.clone());
                session
            }
            Entry::Occupied(entry) => {
                let session = entry.get().wrap();
                session.lock_for_use();
                drop(entry);
                session.merge_metadata(&data);
                debug!(session_id = %data.id, "reusing session held by a concurrent request");
                session
            }
            Entry::Vacant(entry) => {
                let session = Session::new(data, manager.clone());
                session.lock_for_use();
                entry.insert(session.clone());
                session
            }
        }
    }

    /// Return an unlocked handle for removing `data`.
    ///
    /// A session in use by other requests is shared so that its removal is
    /// deferred to the last of them. Otherwise the handle is not registered.
    pub(crate) fn for_removal(&self, data: SessionData, manager: &Weak<SessionManager>) -> Session {
        let cached = self.cache.as_ref().and_then(|cache| {
            cache
                .get(&data.id)
                .filter(|entry| entry.is_valid())
                .map(|entry| entry.wrap())
        });
        cached.unwrap_or_else(|| Session::new(data, manager.clone()))
    }

    /// Called after every commit; evicts the session once no request uses it.
    pub fn committed(&self, session: &Session) {
        let Some(cache) = &self.cache else {
            return;
        };
        if session.concurrent_uses() > 0 {
            return;
        }
        let id = session.id();
        cache.remove_if(&id, |_, cached| {
            cached.ptr_eq(session) && cached.concurrent_uses() <= 0
        });
    }

    /// Re-key a session renamed locally from `old_id` to its current id.
    pub fn session_id_change(&self, session: &Session, old_id: &str) {
        let Some(cache) = &self.cache else {
            return;
        };
        cache.remove_if(old_id, |_, cached| cached.ptr_eq(session));
        match cache.entry(session.id()) {
            Entry::Occupied(entry) => {
                // A concurrent request registered the new id first.
                entry.get().merge_metadata(&session.data());
            }
            Entry::Vacant(entry) => {
                entry.insert(session.clone());
            }
        }
    }

    /// Another node renamed `old_id`; drop the stale local entry.
    pub fn remote_id_change(&self, old_id: &str, new_id: &str) {
        if let Some(cache) = &self.cache {
            if cache.remove(old_id).is_some() {
                debug!(old_id, new_id, "evicted session renamed on another node");
            }
        }
    }

    /// Forget a session that was removed.
    pub fn discard(&self, session: &Session) {
        if let Some(cache) = &self.cache {
            let id = session.id();
            cache.remove_if(&id, |_, cached| cached.ptr_eq(session));
        }
    }

    /// Drop every cached session.
    pub fn clear(&self) {
        if let Some(cache) = &self.cache {
            cache.clear();
        }
    }

    /// Number of sessions currently registered.
    #[must_use]
    pub fn cached_count(&self) -> usize {
        self.cache.as_ref().map_or(0, DashMap::len)
    }

    /// Whether a session is registered under `id`.
    #[must_use]
    pub fn is_cached(&self, id: &str) -> bool {
        self.cache.as_ref().is_some_and(|c| c.contains_key(id))
    }
}
