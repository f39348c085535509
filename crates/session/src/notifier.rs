use crate::data::AttributeValue;
use crate::session::Session;

/// Receives session lifecycle callbacks.
///
/// Every method defaults to a no-op. Callbacks run on the task performing
/// the operation, after internal locks are released, so an implementation may
/// read from the session it is handed.
pub trait SessionNotifier: Send + Sync {
    /// A new session was created.
    fn session_created(&self, _session: &Session) {}

    /// A session was destroyed; `expired` distinguishes TTL-driven expiry
    /// from an administrative delete.
    fn session_destroyed(&self, _session: &Session, _expired: bool) {}

    /// A new attribute key was set.
    fn attribute_added(&self, _session: &Session, _key: &str, _value: &AttributeValue) {}

    /// An existing attribute was overwritten; `old` is the previous value.
    fn attribute_replaced(&self, _session: &Session, _key: &str, _old: &AttributeValue) {}

    /// An attribute was removed; `old` is the value it held.
    fn attribute_removed(&self, _session: &Session, _key: &str, _old: &AttributeValue) {}

    /// An attribute was loaded from the repository into the local view.
    fn attribute_restored(&self, _session: &Session, _key: &str, _value: &AttributeValue) {}

    /// The session's changes are about to be written to the repository.
    fn session_stored(&self, _session: &Session) {}

    /// The session id changed from `old_id` to the session's current id.
    fn session_id_changed(&self, _session: &Session, _old_id: &str) {}
}

/// Notifier that ignores every callback.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl SessionNotifier for NoopNotifier {}
