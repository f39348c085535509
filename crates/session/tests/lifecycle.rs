//! Session lifecycle tests: attribute semantics, dirty tracking, expiry,
//! deletion and shutdown.

use std::sync::Arc;
use std::time::Duration;

use cairn_session::testing::{
    FixedTracking, MemoryRepository, NotifierEvent, RecordingNotifier, TestRequest,
};
use cairn_session::{
    SessionConfiguration, SessionData, SessionError, SessionManager, SessionNotifier,
    SessionRepository, now_ms,
};
use serde_json::json;

struct Harness {
    repo: Arc<MemoryRepository>,
    notifier: Arc<RecordingNotifier>,
    manager: Arc<SessionManager>,
}

impl Harness {
    fn new(config: SessionConfiguration) -> Self {
        Self::with_repo(MemoryRepository::new(), config)
    }

    fn with_repo(repo: MemoryRepository, config: SessionConfiguration) -> Self {
        let repo = Arc::new(repo);
        let notifier = Arc::new(RecordingNotifier::default());
        let manager = SessionManager::builder(config, Arc::clone(&repo) as Arc<dyn SessionRepository>)
            .notifier(Arc::clone(&notifier) as Arc<dyn SessionNotifier>)
            .tracking(Arc::new(FixedTracking::new("s")))
            .build()
            .expect("manager should build");
        Self {
            repo,
            notifier,
            manager,
        }
    }

    async fn request(&self, id: Option<&str>, create: bool) -> Option<cairn_session::Session> {
        let mut request = id.map_or_else(TestRequest::default, TestRequest::with_session_id);
        self.manager
            .get_session(&mut request, create, None)
            .await
            .expect("get_session")
    }
}

// -- Attributes --

mod attributes {
    use super::*;

    #[tokio::test]
    async fn set_get_remove() {
        let h = Harness::new(SessionConfiguration::default());
        let session = h.request(None, true).await.unwrap();
        assert_eq!(session.id(), "s-1");

        session.set_attribute("a", json!("x")).await.unwrap();
        assert_eq!(session.get_attribute("a").await.unwrap(), Some(json!("x")));

        session.remove_attribute("a").await.unwrap();
        assert_eq!(session.get_attribute("a").await.unwrap(), None);

        session.set_attribute("a", json!("y")).await.unwrap();
        session.set_attribute("a", json!(null)).await.unwrap();
        assert_eq!(session.get_attribute("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn stored_attributes_are_restored_lazily() {
        let h = Harness::new(SessionConfiguration::default());
        h.repo
            .insert(
                &SessionData::new("existing", now_ms(), 1800),
                &[("a", json!(1)), ("b", json!("two"))],
            )
            .unwrap();

        let session = h.request(Some("existing"), false).await.unwrap();
        assert_eq!(session.get_attribute("b").await.unwrap(), Some(json!("two")));
        assert_eq!(session.get_attribute("missing").await.unwrap(), None);
        assert!(h.notifier.events().contains(&NotifierEvent::AttributeRestored {
            id: "existing".into(),
            key: "b".into(),
        }));

        session.set_attribute("c", json!(true)).await.unwrap();
        session.remove_attribute("a").await.unwrap();
        assert_eq!(session.attribute_names().await.unwrap(), vec!["b", "c"]);

        h.manager.try_commit(&session).await.unwrap();
        assert_eq!(h.repo.get_session_attribute("existing", "a").await.unwrap(), None);
        assert_eq!(
            h.repo.get_session_attribute("existing", "c").await.unwrap(),
            Some(json!(true))
        );
    }

    #[tokio::test]
    async fn notifications_follow_mutations() {
        let h = Harness::new(SessionConfiguration::default());
        let session = h.request(None, true).await.unwrap();
        session.set_attribute("k", json!(1)).await.unwrap();
        session.set_attribute("k", json!(2)).await.unwrap();
        session.remove_attribute("k").await.unwrap();
        h.manager.try_commit(&session).await.unwrap();

        let id = "s-1".to_owned();
        assert_eq!(
            h.notifier.events(),
            vec![
                NotifierEvent::Created(id.clone()),
                NotifierEvent::AttributeAdded { id: id.clone(), key: "k".into() },
                NotifierEvent::AttributeReplaced { id: id.clone(), key: "k".into() },
                NotifierEvent::AttributeRemoved { id: id.clone(), key: "k".into() },
                NotifierEvent::Stored(id),
            ]
        );
    }

    #[tokio::test]
    async fn non_cacheable_attributes_write_through() {
        let config = SessionConfiguration {
            non_cacheable_attributes: ["live".to_owned()].into_iter().collect(),
            ..SessionConfiguration::default()
        };
        let h = Harness::new(config);
        let session = h.request(None, true).await.unwrap();

        session.set_attribute("live", json!(42)).await.unwrap();
        assert_eq!(
            h.repo.get_session_attribute("s-1", "live").await.unwrap(),
            Some(json!(42)),
            "written before any commit"
        );

        h.repo
            .set_session_attribute("s-1", "live", &json!(43))
            .await
            .unwrap();
        assert_eq!(session.get_attribute("live").await.unwrap(), Some(json!(43)));
    }
}

// -- Dirty tracking --

mod dirty {
    use super::*;

    #[tokio::test]
    async fn set_and_remove_mark_dirty_commit_clears() {
        let h = Harness::new(SessionConfiguration::default());
        let session = h.request(None, true).await.unwrap();
        assert!(!session.is_dirty());

        session.set_attribute("a", json!(1)).await.unwrap();
        assert!(session.is_dirty());
        h.manager.try_commit(&session).await.unwrap();
        assert!(!session.is_dirty());

        session.remove_attribute("a").await.unwrap();
        assert!(session.is_dirty());
        h.manager.try_commit(&session).await.unwrap();
        assert!(!session.is_dirty());
        assert_eq!(h.repo.get_session_attribute("s-1", "a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn reading_mutable_values_marks_dirty() {
        let h = Harness::new(SessionConfiguration::default());
        h.repo
            .insert(
                &SessionData::new("r", now_ms(), 1800),
                &[("name", json!("alice")), ("cart", json!({"items": []}))],
            )
            .unwrap();
        let session = h.request(Some("r"), false).await.unwrap();

        session.get_attribute("name").await.unwrap();
        assert!(!session.is_dirty(), "strings are immutable");

        session.get_attribute("cart").await.unwrap();
        assert!(session.is_dirty(), "objects may be mutated by the caller");
    }

    #[tokio::test]
    async fn set_trigger_never_marks_on_read() {
        let config = SessionConfiguration {
            replication_trigger: cairn_session::ReplicationTrigger::Set,
            ..SessionConfiguration::default()
        };
        let h = Harness::new(config);
        h.repo
            .insert(
                &SessionData::new("r", now_ms(), 1800),
                &[("cart", json!({"items": []}))],
            )
            .unwrap();
        let session = h.request(Some("r"), false).await.unwrap();
        session.get_attribute("cart").await.unwrap();
        assert!(!session.is_dirty());
    }
}

// -- Expiry and deletion --

mod expiry {
    use super::*;

    fn stale(id: &str) -> SessionData {
        let long_ago = now_ms() - 60_000;
        SessionData::existing(id, long_ago, long_ago, 1)
    }

    #[tokio::test]
    async fn expired_session_is_removed_on_access() {
        let h = Harness::new(SessionConfiguration::default());
        h.repo.insert(&stale("old"), &[]).unwrap();

        assert!(h.manager.fetch_session("old", true).await.unwrap().is_none());
        assert!(!h.repo.contains("old"));
        assert_eq!(h.manager.metrics().snapshot().expired, 1);
        assert!(h.notifier.events().contains(&NotifierEvent::Destroyed {
            id: "old".into(),
            expired: true,
        }));
    }

    #[tokio::test]
    async fn expiry_delete_spares_renewed_sessions() {
        let h = Harness::new(SessionConfiguration::default());
        h.repo
            .insert(&SessionData::new("live", now_ms(), 1800), &[])
            .unwrap();

        assert!(!h.manager.delete("live", true).await.unwrap());
        assert!(h.repo.contains("live"));

        assert!(h.manager.delete("live", false).await.unwrap());
        assert!(!h.repo.contains("live"));
        assert!(!h.manager.delete("live", false).await.unwrap());
    }

    #[tokio::test]
    async fn background_sweep_reclaims_idle_sessions() {
        let repo = MemoryRepository::new().with_sweep_interval(Duration::from_millis(20));
        let h = Harness::with_repo(repo, SessionConfiguration::default());
        h.repo.insert(&stale("idle"), &[]).unwrap();
        h.manager.start().await.unwrap();

        let reclaimed = tokio::time::timeout(Duration::from_secs(5), async {
            while h.repo.contains("idle") {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(reclaimed.is_ok(), "idle session should be swept");
        h.manager.close().await;
    }

    #[tokio::test]
    async fn async_delete_runs_in_background() {
        let h = Harness::new(SessionConfiguration::default());
        h.repo
            .insert(&SessionData::new("bye", now_ms(), 1800), &[])
            .unwrap();
        h.manager.delete_async("bye", false);

        let removed = tokio::time::timeout(Duration::from_secs(5), async {
            while h.repo.contains("bye") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(removed.is_ok());
    }
}

// -- Shutdown --

mod shutdown {
    use super::*;

    #[tokio::test]
    async fn close_removes_owned_sessions_and_rejects_requests() {
        let h = Harness::new(SessionConfiguration::default());
        for id in ["a", "b"] {
            h.repo
                .insert(&SessionData::new(id, now_ms(), 1800), &[])
                .unwrap();
        }

        h.manager.close().await;
        assert!(!h.repo.contains("a"));
        assert!(!h.repo.contains("b"));
        assert!(h.manager.is_closed());

        let mut request = TestRequest::default();
        let err = h
            .manager
            .get_session(&mut request, true, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Closed));
    }

    #[tokio::test]
    async fn sessions_outliving_the_manager_report_closed() {
        let h = Harness::new(SessionConfiguration::default());
        let session = h.request(None, true).await.unwrap();
        drop(h);
        let err = session.set_attribute("k", json!(1)).await.unwrap_err();
        assert!(matches!(err, SessionError::Closed));
    }
}
