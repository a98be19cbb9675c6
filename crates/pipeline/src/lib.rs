//! Concurrent multi-stage job pipeline.
//!
//! Jobs enter the first stage as raw [`auditflow_core::Job`]s; every stage after
//! that receives a [`JobRunState`] snapshot from its upstream neighbour. Stages
//! run on their own threads, share one [`CancellationToken`] and report per-job
//! failures on side streams that the [`Pipeline`] merges.

pub mod cancel;
pub mod error;
pub mod orchestrator;
pub mod process;
pub mod stage;
pub mod stages;
pub mod state;

pub use cancel::CancellationToken;
pub use error::{PipelineError, StageError, TaskError};
pub use orchestrator::{Pipeline, RunningPipeline, merge_errors};
pub use process::{Inbound, Process};
pub use stage::{ErrorReport, ProcessStage, Stage, Task};
pub use state::{JobRunState, ResultMap, StageState};
