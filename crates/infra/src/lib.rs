//! Infrastructure layer: queue backends, the queue worker, configuration and
//! the concrete collaborators behind the pipeline stages.

pub mod backoff;
pub mod config;
pub mod external;
pub mod queue;
pub mod worker;


pub use backoff::{Backoff, BackoffStrategy, RetryPolicy};
pub use config::{ConfigError, QueueBackend, WorkerConfig};
pub use queue::{ErrorClass, QueueError, QueueProvider, build_provider};
pub use worker::{QueueWorker, QueueWorkerConfig, WorkerError, WorkerHandle, WorkerStats};
