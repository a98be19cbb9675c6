//! Worker wiring: queue provider -> ingest -> audit -> response -> delete.

use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::{info, warn};

use auditflow_core::{DEFAULT_PAYLOAD_TYPE, Job};
use auditflow_infra::external::{LocalSource, ManifestAuditor};
use auditflow_infra::{QueueProvider, QueueWorker, QueueWorkerConfig, WorkerConfig, WorkerHandle, WorkerStats};
use auditflow_pipeline::stages::{AuditRunner, AuditStage, Ingest, IngestStage, Payloader, Respond, ResponseStage};
use auditflow_pipeline::{CancellationToken, JobRunState, Pipeline, PipelineError};

/// A wired but not yet started audit pipeline and its two open ends.
pub struct AuditPipeline {
    pub pipeline: Pipeline,
    /// Feeds the ingest stage.
    pub input: Sender<Job>,
    /// Job states the response stage finished with.
    pub completed: Receiver<JobRunState>,
}

/// Wire `ingest -> audit -> response` around `token`.
///
/// `payloader` answers for the default payload type.
pub fn build_pipeline<P>(config: &WorkerConfig, token: CancellationToken, payloader: P) -> Result<AuditPipeline, PipelineError>
where
    P: Payloader + 'static,
{
    let capacity = config.channel_capacity;
    let (input, jobs) = bounded(capacity);
    let (ingested_tx, ingested_rx) = bounded(capacity);
    let (audited_tx, audited_rx) = bounded(capacity);
    let (completed_tx, completed) = bounded(capacity);

    let mut pipeline = Pipeline::with_token(token);
    pipeline.add_stage(
        IngestStage::new(Ingest::new(&config.temp_folder).with_source(LocalSource::new()))
            .with_input(jobs)
            .with_output(ingested_tx),
    )?;
    pipeline.add_stage(
        AuditStage::new(AuditRunner::new().with_auditor(ManifestAuditor::new()))
            .with_input(ingested_rx)
            .with_output(audited_tx),
    )?;
    pipeline.add_stage(
        ResponseStage::new(Respond::new().with_payloader(DEFAULT_PAYLOAD_TYPE, payloader))
            .with_input(audited_rx)
            .with_output(completed_tx),
    )?;

    Ok(AuditPipeline {
        pipeline,
        input,
        completed,
    })
}

/// A running pipeline plus the queue worker feeding it.
pub struct Worker {
    provider: Arc<dyn QueueProvider>,
    queue_worker: WorkerHandle,
    error_log: Option<thread::JoinHandle<()>>,
}

/// Start the pipeline, its error logger and the queue worker.
pub fn start<P>(config: &WorkerConfig, provider: Arc<dyn QueueProvider>, payloader: P) -> anyhow::Result<Worker>
where
    P: Payloader + 'static,
{
    let token = CancellationToken::new();
    let AuditPipeline {
        pipeline,
        input,
        completed,
    } = build_pipeline(config, token.clone(), payloader)?;

    let running = pipeline.start()?;
    let error_log = thread::Builder::new()
        .name("pipeline-errors".into())
        .spawn(move || {
            // Per-job failures: the record stays leased and is retried after its lock expires.
            for err in running.errors() {
                warn!(stage = %err.stage, job = %err.title, error = %err.source, "job failed");
            }
        });
    let error_log = match error_log {
        Ok(join) => join,
        Err(e) => {
            token.cancel();
            return Err(e.into());
        }
    };

    let queue_worker = QueueWorker::new(provider.clone(), token.clone())
        .with_config(QueueWorkerConfig::from(config))
        .spawn(input, completed)
        .inspect_err(|_| token.cancel())?;

    info!(backend = provider.backend(), temp_folder = %config.temp_folder.display(), "worker running");
    Ok(Worker {
        provider,
        queue_worker,
        error_log: Some(error_log),
    })
}

impl Worker {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.queue_worker.cancellation_token()
    }

    pub fn stats(&self) -> WorkerStats {
        self.queue_worker.stats()
    }

    /// Stop everything, wait for the threads and close the provider.
    pub fn shutdown(mut self) -> anyhow::Result<()> {
        let outcome = self.queue_worker.shutdown();
        if let Some(join) = self.error_log.take() {
            let _ = join.join();
        }
        if let Err(e) = self.provider.close() {
            warn!(error = %e, "failed to close queue provider");
        }
        outcome?;
        Ok(())
    }
}
