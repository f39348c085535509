use std::sync::Arc;

use cairn_redis::{RedisConfig, RedisSessionRepository, connect};
use cairn_session::{SessionManager, SessionMetrics, SessionRepository};
use tracing::info;

use crate::config::CairnConfig;

pub async fn run(config: &CairnConfig, redis: &RedisConfig) -> anyhow::Result<()> {
    let facade = connect(redis)?;
    let metrics = Arc::new(SessionMetrics::default());
    let repository = RedisSessionRepository::new(facade, &config.session, redis, Arc::clone(&metrics))?;
    let manager = SessionManager::builder(
        config.session.clone(),
        Arc::new(repository) as Arc<dyn SessionRepository>,
    )
    .metrics(metrics)
    .build()?;

    manager.start().await?;
    info!(
        namespace = %config.session.namespace,
        expiration = ?redis.expiration,
        "sweeping expired sessions, press Ctrl+C to stop"
    );

    shutdown_signal().await;
    manager.close().await;

    let snapshot = manager.metrics().snapshot();
    println!("Expired {} session(s).", snapshot.expired);
    Ok(())
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received SIGINT"),
        () = terminate => info!("received SIGTERM"),
    }
}
