use std::sync::Arc;

use crate::config::SessionConfiguration;
use crate::error::SessionError;
use crate::executor::TaskExecutor;
use crate::manager::SessionManager;
use crate::metrics::SessionMetrics;
use crate::notifier::{NoopNotifier, SessionNotifier};
use crate::repository::SessionRepository;
use crate::tracking::{SessionTracking, UuidTracking};

/// Fluent builder for a [`SessionManager`].
///
/// Only the configuration and repository are required. The notifier
/// defaults to [`NoopNotifier`], tracking to [`UuidTracking`], and the
/// executor and metrics to fresh instances.
pub struct SessionManagerBuilder {
    config: SessionConfiguration,
    repository: Arc<dyn SessionRepository>,
    notifier: Option<Arc<dyn SessionNotifier>>,
    tracking: Option<Arc<dyn SessionTracking>>,
    executor: Option<TaskExecutor>,
    metrics: Option<Arc<SessionMetrics>>,
}

impl SessionManagerBuilder {
    pub fn new(config: SessionConfiguration, repository: Arc<dyn SessionRepository>) -> Self {
        Self {
            config,
            repository,
            notifier: None,
            tracking: None,
            executor: None,
            metrics: None,
        }
    }

    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn SessionNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    #[must_use]
    pub fn tracking(mut self, tracking: Arc<dyn SessionTracking>) -> Self {
        self.tracking = Some(tracking);
        self
    }

    /// Use an existing executor, typically one shared with the repository.
    #[must_use]
    pub fn executor(mut self, executor: TaskExecutor) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Share a metrics instance, typically the one the repository reports
    /// fail-overs into.
    #[must_use]
    pub fn metrics(mut self, metrics: Arc<SessionMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validate the configuration and construct the manager.
    pub fn build(self) -> Result<Arc<SessionManager>, SessionError> {
        self.config.validate()?;
        let tracking = self.tracking.unwrap_or_else(|| {
            let tracking = if self.config.sticky {
                UuidTracking::default().with_node_suffix(self.config.node.clone())
            } else {
                UuidTracking::default()
            };
            Arc::new(tracking)
        });
        Ok(SessionManager::new_cyclic(
            self.config,
            self.repository,
            self.notifier.unwrap_or_else(|| Arc::new(NoopNotifier)),
            tracking,
            self.executor.unwrap_or_default(),
            self.metrics.unwrap_or_default(),
        ))
    }
}
