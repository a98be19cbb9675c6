//! Lease-based, at-least-once job queue.
//!
//! One [`QueueProvider`] contract, several stores behind it. All of them share
//! the lease arithmetic in [`record::LeaseRecord::lease`] and are held to the
//! same [`conformance`] checks.

pub mod factory;
pub mod in_memory;
pub mod postgres;
pub mod provider;
pub mod record;

#[cfg(feature = "redis")]
pub mod redis;

#[cfg(any(test, feature = "testing"))]
pub mod conformance;

/// Key prefix used by the redis backend unless configured otherwise.
pub const DEFAULT_KEY_PREFIX: &str = "auditflow:queue";

pub use factory::build_provider;
pub use in_memory::InMemoryQueue;
pub use postgres::PostgresQueue;
pub use provider::{ErrorClass, QueueError, QueueProvider};
pub use record::{LeasePolicy, LeaseRecord, LeaseState, LeasedJob};

#[cfg(feature = "redis")]
pub use self::redis::RedisQueue;
