//! Session manager running on the Redis repository over the in-memory
//! facade: commits, background expiry with both strategies, and id
//! redirection between nodes.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use cairn_redis::{ExpirationKind, MemoryFacade, RedisConfig, RedisFacade, RedisSessionRepository};
use cairn_session::testing::{FixedTracking, TestRequest};
use cairn_session::{Session, SessionConfiguration, SessionManager, SessionMetrics, SessionRepository};
use serde_json::json;

struct Node {
    manager: Arc<SessionManager>,
}

impl Node {
    fn new(facade: &Arc<MemoryFacade>, name: &str, max_inactive: i32, expiration: ExpirationKind) -> Self {
        let session = SessionConfiguration {
            namespace: "e2e".into(),
            node: name.into(),
            max_inactive_interval: max_inactive,
            ..SessionConfiguration::default()
        };
        let redis = RedisConfig {
            expiration,
            ..RedisConfig::default()
        };
        let metrics = Arc::new(SessionMetrics::default());
        let repository = RedisSessionRepository::new(
            Arc::clone(facade) as Arc<dyn RedisFacade>,
            &session,
            &redis,
            Arc::clone(&metrics),
        )
        .expect("repository should build");
        let manager = SessionManager::builder(session, Arc::new(repository) as Arc<dyn SessionRepository>)
            .tracking(Arc::new(FixedTracking::new(name)))
            .metrics(metrics)
            .build()
            .expect("manager should build");
        Self { manager }
    }

    async fn open(&self, id: &str, create: bool) -> Option<Session> {
        let mut request = TestRequest {
            forced: create.then(|| id.to_owned()),
            ..TestRequest::with_session_id(id)
        };
        self.manager
            .get_session(&mut request, create, None)
            .await
            .expect("get_session")
    }
}

async fn eventually<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let polled = tokio::time::timeout(Duration::from_secs(10), async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}

fn subscriptions(facade: &MemoryFacade) -> usize {
    facade.commands().iter().filter(|c| *c == "SUBSCRIBE").count()
}

#[tokio::test]
async fn committed_attributes_survive_the_request() {
    let facade = Arc::new(MemoryFacade::new());
    let node = Node::new(&facade, "a", 1800, ExpirationKind::Notification);

    let session = node.open("s1", true).await.unwrap();
    session.set_attribute("user", json!("alice")).await.unwrap();
    node.manager.commit(&session).await;
    assert!(facade.exists("cairn:e2e:{s1}").await.unwrap());

    let again = node.open("s1", false).await.unwrap();
    assert!(!again.is_new());
    assert_eq!(again.get_attribute("user").await.unwrap(), Some(json!("alice")));
}

#[tokio::test]
async fn keyspace_notification_expires_idle_sessions() {
    let facade = Arc::new(MemoryFacade::new());
    let node = Node::new(&facade, "a", 1, ExpirationKind::Notification);
    node.manager.start().await.unwrap();
    eventually("subscribers", || {
        let facade = Arc::clone(&facade);
        async move { subscriptions(&facade) >= 2 }
    })
    .await;

    let session = node.open("idle", true).await.unwrap();
    session.set_attribute("k", json!(1)).await.unwrap();
    node.manager.commit(&session).await;

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(facade.sweep_expired() >= 1);

    let metrics = Arc::clone(node.manager.metrics());
    eventually("expiry", || {
        let metrics = Arc::clone(&metrics);
        async move { metrics.snapshot().expired == 1 }
    })
    .await;
    assert!(!facade.exists("cairn:e2e:{idle}").await.unwrap());
    node.manager.close().await;
}

#[tokio::test]
async fn sorted_set_sweep_expires_idle_sessions() {
    let facade = Arc::new(MemoryFacade::new());
    let node = Node::new(&facade, "a", 1, ExpirationKind::SortedSet);
    node.manager.start().await.unwrap();

    let session = node.open("idle", true).await.unwrap();
    session.set_attribute("k", json!(1)).await.unwrap();
    node.manager.commit(&session).await;

    let metrics = Arc::clone(node.manager.metrics());
    eventually("expiry", || {
        let metrics = Arc::clone(&metrics);
        async move { metrics.snapshot().expired == 1 }
    })
    .await;
    assert!(!facade.exists("cairn:e2e:{idle}").await.unwrap());
    node.manager.close().await;
}

#[tokio::test]
async fn renamed_sessions_are_evicted_on_other_nodes() {
    let facade = Arc::new(MemoryFacade::new());
    let first = Node::new(&facade, "a", 1800, ExpirationKind::Notification);
    let second = Node::new(&facade, "b", 1800, ExpirationKind::Notification);
    first.manager.start().await.unwrap();
    second.manager.start().await.unwrap();
    eventually("subscribers", || {
        let facade = Arc::clone(&facade);
        async move { subscriptions(&facade) >= 4 }
    })
    .await;

    let created = first.open("shared", true).await.unwrap();
    first.manager.commit(&created).await;

    let held = second.open("shared", false).await.unwrap();
    assert!(second.manager.factory().is_cached("shared"));

    let renaming = first.open("shared", false).await.unwrap();
    let new_id = first.manager.switch_session_id(&renaming).await.unwrap();
    assert_eq!(new_id.as_deref(), Some("a-1"));

    let manager = Arc::clone(&second.manager);
    eventually("redirection", || {
        let manager = Arc::clone(&manager);
        async move { !manager.factory().is_cached("shared") }
    })
    .await;
    assert_eq!(held.id(), "shared");

    first.manager.close().await;
    second.manager.close().await;
}
