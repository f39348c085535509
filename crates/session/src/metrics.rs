use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters tracking session lifecycle outcomes.
///
/// All counters use relaxed ordering. For a consistent point-in-time view,
/// call [`snapshot`](Self::snapshot).
#[derive(Debug, Default)]
pub struct SessionMetrics {
    /// Sessions created.
    pub created: AtomicU64,
    /// Sessions deleted administratively (invalidate or explicit delete).
    pub deleted: AtomicU64,
    /// Sessions deleted because they expired.
    pub expired: AtomicU64,
    /// Durable commits written to the repository.
    pub committed: AtomicU64,
    /// Commits deferred to the last concurrent finisher.
    pub deferred_commits: AtomicU64,
    /// Commits that failed and were dropped.
    pub commit_failures: AtomicU64,
    /// Sessions served by a node other than their previous owner.
    pub failovers: AtomicU64,
    /// Invalidations lost to a concurrent remover.
    pub invalidation_conflicts: AtomicU64,
    /// Successful session id changes.
    pub id_changes: AtomicU64,
    /// Id changes rejected because the session was already renamed.
    pub id_change_conflicts: AtomicU64,
    /// Sessions found in the repository.
    pub retrieved: AtomicU64,
    /// Lookups for ids that were absent or expired.
    pub missing: AtomicU64,
    /// Lookups that failed with a repository error.
    pub fetch_errors: AtomicU64,
}

impl SessionMetrics {
    pub fn increment_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_deleted(&self) {
        self.deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_committed(&self) {
        self.committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_deferred_commits(&self) {
        self.deferred_commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_commit_failures(&self) {
        self.commit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_failovers(&self) {
        self.failovers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_invalidation_conflicts(&self) {
        self.invalidation_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_id_changes(&self) {
        self.id_changes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_id_change_conflicts(&self) {
        self.id_change_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_retrieved(&self) {
        self.retrieved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_missing(&self) {
        self.missing.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_fetch_errors(&self) {
        self.fetch_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a point-in-time snapshot of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            created: self.created.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            deferred_commits: self.deferred_commits.load(Ordering::Relaxed),
            commit_failures: self.commit_failures.load(Ordering::Relaxed),
            failovers: self.failovers.load(Ordering::Relaxed),
            invalidation_conflicts: self.invalidation_conflicts.load(Ordering::Relaxed),
            id_changes: self.id_changes.load(Ordering::Relaxed),
            id_change_conflicts: self.id_change_conflicts.load(Ordering::Relaxed),
            retrieved: self.retrieved.load(Ordering::Relaxed),
            missing: self.missing.load(Ordering::Relaxed),
            fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
        }
    }
}

/// A plain data snapshot of [`SessionMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub created: u64,
    pub deleted: u64,
    pub expired: u64,
    pub committed: u64,
    pub deferred_commits: u64,
    pub commit_failures: u64,
    pub failovers: u64,
    pub invalidation_conflicts: u64,
    pub id_changes: u64,
    pub id_change_conflicts: u64,
    pub retrieved: u64,
    pub missing: u64,
    pub fetch_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_zero() {
        assert_eq!(SessionMetrics::default().snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn increment_and_snapshot() {
        let m = SessionMetrics::default();
        m.increment_created();
        m.increment_created();
        m.increment_deferred_commits();
        m.increment_failovers();
        m.increment_invalidation_conflicts();

        let snap = m.snapshot();
        assert_eq!(snap.created, 2);
        assert_eq!(snap.deferred_commits, 1);
        assert_eq!(snap.failovers, 1);
        assert_eq!(snap.invalidation_conflicts, 1);
        assert_eq!(snap.committed, 0);
    }
}
