//! Build a provider from configuration.

use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::info;

use crate::config::QueueBackend;

use super::in_memory::InMemoryQueue;
use super::postgres::PostgresQueue;
use super::provider::{QueueError, QueueProvider};
use super::record::LeasePolicy;

/// Open the configured backend.
///
/// Postgres connects and creates its table through `runtime`, so this must be
/// called outside of any async task.
pub fn build_provider(
    backend: &QueueBackend,
    policy: LeasePolicy,
    runtime: &Handle,
) -> Result<Arc<dyn QueueProvider>, QueueError> {
    let provider: Arc<dyn QueueProvider> = match backend {
        QueueBackend::Memory => Arc::new(InMemoryQueue::new().with_policy(policy)),
        QueueBackend::Postgres { database_url, table } => {
            let queue = PostgresQueue::connect(database_url, runtime.clone())?
                .with_table(table.as_str())?
                .with_policy(policy);
            runtime.block_on(queue.ensure_schema())?;
            Arc::new(queue)
        }
        QueueBackend::Redis { redis_url, key_prefix } => redis_provider(redis_url, key_prefix, policy)?,
    };

    info!(
        backend = provider.backend(),
        retry_attempts = policy.retry_attempts,
        lock_secs = policy.lock_duration.as_secs(),
        "queue provider ready"
    );
    Ok(provider)
}

#[cfg(feature = "redis")]
fn redis_provider(
    redis_url: &str,
    key_prefix: &str,
    policy: LeasePolicy,
) -> Result<Arc<dyn QueueProvider>, QueueError> {
    let queue = super::redis::RedisQueue::new(redis_url, Some(key_prefix.to_string()))?.with_policy(policy);
    Ok(Arc::new(queue))
}

#[cfg(not(feature = "redis"))]
fn redis_provider(
    _redis_url: &str,
    _key_prefix: &str,
    _policy: LeasePolicy,
) -> Result<Arc<dyn QueueProvider>, QueueError> {
    Err(QueueError::fatal("redis", "built without the `redis` feature"))
}
