//! Session lifecycle for cairn.
//!
//! A [`SessionManager`] resolves sessions for requests through a
//! [`SessionRepository`], shares one in-memory [`Session`] between requests
//! that overlap on the same id, and writes changes back once the last of
//! them commits.

pub mod builder;
pub mod codec;
pub mod config;
pub mod data;
pub mod error;
pub mod executor;
pub mod factory;
pub mod manager;
pub mod metrics;
pub mod notifier;
pub mod repository;
pub mod session;
pub mod testing;
pub mod tracking;

pub use builder::SessionManagerBuilder;
pub use codec::{EncryptingCodec, JsonCodec, SessionCodec, codec_for};
pub use config::{ReplicationTrigger, RetiredKey, SessionConfiguration};
pub use data::{AttributeValue, SessionData, ValueKind, now_ms};
pub use error::SessionError;
pub use executor::TaskExecutor;
pub use factory::SessionFactory;
pub use manager::SessionManager;
pub use metrics::{MetricsSnapshot, SessionMetrics};
pub use notifier::{NoopNotifier, SessionNotifier};
pub use repository::{CommitTransaction, ExpiredSessionHandler, SessionRepository};
pub use session::Session;
pub use tracking::{RequestContext, SessionTracking, UuidTracking};
