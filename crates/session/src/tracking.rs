//! Request-side collaborators: the request-like object the manager reads ids
//! from, and the strategy that issues and propagates session ids.

use uuid::Uuid;

/// The per-request object a [`SessionManager`](crate::SessionManager) works against.
pub trait RequestContext: Send {
    /// Session id already resolved earlier in this request, if any.
    fn retrieved_id(&self) -> Option<String>;

    /// Remember the id resolved for this request.
    fn set_retrieved_id(&mut self, id: &str);

    /// Id the caller insists on using, overriding any tracked id.
    fn forced_id(&self) -> Option<String> {
        None
    }

    /// Read a request-scoped value (a cookie, header, or URL parameter).
    fn attribute(&self, name: &str) -> Option<String>;

    /// Set a request-scoped value that the web adapter turns into response
    /// state.
    fn set_attribute(&mut self, name: &str, value: &str);
}

/// Produces new session ids and moves them between request and response.
pub trait SessionTracking: Send + Sync {
    /// Extract the session id presented by the client.
    fn retrieve_id(&self, request: &dyn RequestContext) -> Option<String>;

    /// Allocate a fresh, unguessable session id.
    fn new_session_id(&self) -> String;

    /// Hand `id` back to the client.
    fn propagate(&self, id: &str, request: &mut dyn RequestContext);
}

/// Default request attribute carrying the session id.
pub const DEFAULT_SESSION_ATTRIBUTE: &str = "JSESSIONID";

/// Tracking strategy that issues random v4 UUIDs and carries them in a single
/// request attribute.
#[derive(Debug, Clone)]
pub struct UuidTracking {
    attribute: String,
    node_suffix: Option<String>,
}

impl Default for UuidTracking {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_ATTRIBUTE)
    }
}

impl UuidTracking {
    pub fn new(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            node_suffix: None,
        }
    }

    /// Append `.<node>` to every issued id so a load balancer can route
    /// sticky sessions.
    #[must_use]
    pub fn with_node_suffix(mut self, node: impl Into<String>) -> Self {
        self.node_suffix = Some(node.into());
        self
    }
}

impl SessionTracking for UuidTracking {
    fn retrieve_id(&self, request: &dyn RequestContext) -> Option<String> {
        request
            .attribute(&self.attribute)
            .filter(|id| !id.trim().is_empty())
    }

    fn new_session_id(&self) -> String {
        let id = Uuid::new_v4().simple().to_string();
        match &self.node_suffix {
            Some(node) => format!("{id}.{node}"),
            None => id,
        }
    }

    fn propagate(&self, id: &str, request: &mut dyn RequestContext) {
        request.set_attribute(&self.attribute, id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestRequest;

    #[test]
    fn issues_distinct_ids() {
        let tracking = UuidTracking::default();
        let a = tracking.new_session_id();
        let b = tracking.new_session_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn node_suffix_is_appended() {
        let tracking = UuidTracking::default().with_node_suffix("web-1");
        assert!(tracking.new_session_id().ends_with(".web-1"));
    }

    #[test]
    fn retrieve_and_propagate_use_the_same_attribute() {
        let tracking = UuidTracking::new("sid");
        let mut request = TestRequest::default();
        assert_eq!(tracking.retrieve_id(&request), None);

        tracking.propagate("abc", &mut request);
        assert_eq!(tracking.retrieve_id(&request).as_deref(), Some("abc"));

        request.set_attribute("sid", "  ");
        assert_eq!(tracking.retrieve_id(&request), None);
    }
}
