//! Supervised pub/sub subscription with bounded Fibonacci reconnects.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::facade::{PubSubMessage, RedisFacade};

/// Reconnect policy for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Unit delay; the n-th retry waits `base * fib(n)`.
    pub base: Duration,
    pub max_delay: Duration,
    /// Consecutive failures tolerated before giving up.
    pub max_attempts: u32,
    /// A connection that stayed up this long resets the failure count.
    pub reset_window: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 10,
            reset_window: Duration::from_secs(10 * 60),
        }
    }
}

fn fibonacci(n: u32) -> u32 {
    let (mut a, mut b) = (0u32, 1u32);
    for _ in 0..n {
        (a, b) = (b, a.saturating_add(b));
    }
    a
}

/// Reconnect state of one subscription.
#[derive(Debug)]
pub struct SubscriberSupervisor {
    policy: BackoffPolicy,
    attempt: u32,
    last_connect: Option<Instant>,
}

impl SubscriberSupervisor {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            last_connect: None,
        }
    }

    /// Consecutive failures so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Record a successful subscription.
    pub fn connected(&mut self) {
        self.last_connect = Some(Instant::now());
    }

    /// Delay before the next attempt after a failure or disconnect, or
    /// `None` once the retry budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self
            .last_connect
            .take()
            .is_some_and(|at| at.elapsed() >= self.policy.reset_window)
        {
            self.attempt = 0;
        }
        self.attempt += 1;
        if self.attempt > self.policy.max_attempts {
            return None;
        }
        let delay = self.policy.base.saturating_mul(fibonacci(self.attempt));
        Some(delay.min(self.policy.max_delay))
    }

    /// Keep a subscription to `patterns` and `channels` open, passing every
    /// message to `on_message`, until `token` is cancelled or the retry
    /// budget is exhausted.
    pub async fn run<F>(
        mut self,
        name: &'static str,
        facade: Arc<dyn RedisFacade>,
        patterns: Vec<String>,
        channels: Vec<String>,
        token: CancellationToken,
        mut on_message: F,
    ) where
        F: FnMut(PubSubMessage) + Send,
    {
        loop {
            let subscribed = tokio::select! {
                () = token.cancelled() => return,
                subscribed = facade.subscribe(&patterns, &channels) => subscribed,
            };
            match subscribed {
                Ok(mut messages) => {
                    self.connected();
                    info!(subscriber = name, "subscribed");
                    loop {
                        tokio::select! {
                            () = token.cancelled() => return,
                            message = messages.next() => match message {
                                Some(message) => on_message(message),
                                None => break,
                            },
                        }
                    }
                    warn!(subscriber = name, "subscription lost");
                }
                Err(e) => {
                    warn!(subscriber = name, attempt = self.attempt + 1, error = %e, "subscribe failed");
                }
            }
            let Some(delay) = self.next_delay() else {
                error!(
                    subscriber = name,
                    attempts = self.attempt - 1,
                    "giving up on subscription, expiry events will no longer be received"
                );
                return;
            };
            debug!(subscriber = name, ?delay, "reconnecting");
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::memory::MemoryFacade;

    fn policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            max_attempts,
            reset_window: Duration::from_secs(60),
        }
    }

    #[test]
    fn fibonacci_delays_are_capped() {
        let mut supervisor = SubscriberSupervisor::new(policy(8));
        let delays: Vec<u128> = std::iter::from_fn(|| supervisor.next_delay())
            .map(|d| d.as_millis())
            .collect();
        assert_eq!(delays, vec![10, 10, 20, 30, 50, 50, 50, 50]);
    }

    #[tokio::test(start_paused = true)]
    async fn long_lived_connection_resets_attempts() {
        let mut supervisor = SubscriberSupervisor::new(policy(2));
        assert!(supervisor.next_delay().is_some());
        assert!(supervisor.next_delay().is_some());

        supervisor.connected();
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(supervisor.next_delay(), Some(Duration::from_millis(10)));
        assert_eq!(supervisor.attempt(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn short_connection_keeps_counting() {
        let mut supervisor = SubscriberSupervisor::new(policy(2));
        supervisor.next_delay();
        supervisor.connected();
        supervisor.next_delay();
        assert_eq!(supervisor.next_delay(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_budget() {
        let facade = Arc::new(MemoryFacade::new());
        facade.fail_next_subscriptions(100);
        let supervisor = SubscriberSupervisor::new(policy(3));

        let finished = tokio::time::timeout(
            Duration::from_secs(10),
            supervisor.run(
                "test",
                Arc::clone(&facade) as Arc<dyn RedisFacade>,
                vec![],
                vec!["chan".into()],
                CancellationToken::new(),
                |_| {},
            ),
        )
        .await;
        assert!(finished.is_ok(), "supervisor should stop on its own");
        let attempts = facade.commands().iter().filter(|c| *c == "SUBSCRIBE").count();
        assert_eq!(attempts, 4);
    }

    #[tokio::test]
    async fn reconnects_after_disconnect() {
        let facade = Arc::new(MemoryFacade::new());
        let received = Arc::new(Mutex::new(Vec::new()));
        let token = CancellationToken::new();

        let sink = Arc::clone(&received);
        let task = tokio::spawn(SubscriberSupervisor::new(policy(3)).run(
            "test",
            Arc::clone(&facade) as Arc<dyn RedisFacade>,
            vec![],
            vec!["chan".into()],
            token.clone(),
            move |m| sink.lock().push(m.payload),
        ));

        let subscribed = |n: usize| {
            let facade = Arc::clone(&facade);
            async move {
                while facade.commands().iter().filter(|c| *c == "SUBSCRIBE").count() < n {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
            }
        };
        let delivered = |n: usize| {
            let received = Arc::clone(&received);
            async move {
                while received.lock().len() < n {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
            }
        };

        tokio::time::timeout(Duration::from_secs(5), subscribed(1)).await.unwrap();
        facade.publish("chan", "first").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), delivered(1)).await.unwrap();

        facade.disconnect_subscribers();
        tokio::time::timeout(Duration::from_secs(5), subscribed(2)).await.unwrap();
        facade.publish("chan", "second").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), delivered(2)).await.unwrap();
        assert_eq!(*received.lock(), vec!["first", "second"]);

        token.cancel();
        task.await.unwrap();
    }
}
