//! Stage contract and the generic stage loop.
//!
//! A [`Stage`] is what the orchestrator wires and starts. Almost every stage is a
//! [`ProcessStage`]: a thread that pulls jobs from an input channel, runs a
//! [`Task`] (the stage's own unit of work) and forwards the updated state.
//!
//! ```text
//!  input ──► copy_fields ──► Task::execute ──ok──► output
//!                                   │
//!                                   └──err──► error report (loop continues)
//! ```

use std::marker::PhantomData;
use std::thread;

use crossbeam_channel::{Receiver, Sender, select};
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::error::{PipelineError, StageError, TaskError};
use crate::process::{Inbound, Process};
use crate::state::{JobRunState, StageState};

/// Sending half of a stage's error stream.
///
/// The stream closes when the stage loop exits and drops its report.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    tx: Sender<StageError>,
}

impl ErrorReport {
    pub fn new(tx: Sender<StageError>) -> Self {
        Self { tx }
    }

    /// Create a report and the stream that receives it.
    pub fn channel() -> (Self, Receiver<StageError>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self::new(tx), rx)
    }

    /// Publish a per-job error. Never blocks; a report nobody listens to is dropped.
    pub fn report(&self, err: StageError) {
        if let Err(crossbeam_channel::SendError(err)) = self.tx.send(err) {
            debug!(error = %err, "error report has no listener");
        }
    }
}

/// A runnable pipeline stage.
pub trait Stage: Send {
    fn name(&self) -> &str;

    /// Install the pipeline's shared cancellation token.
    fn set_cancellation(&mut self, token: CancellationToken);

    /// Validate wiring and start the stage loop in the background.
    ///
    /// Setup problems come back here, synchronously. Per-job failures go to
    /// `errors` and never stop the loop.
    fn run(self: Box<Self>, errors: ErrorReport) -> Result<(), PipelineError>;
}

/// A stage's own unit of work.
pub trait Task: Send + 'static {
    fn name(&self) -> &str;

    /// Check task-specific configuration before the loop starts.
    fn validate_setup(&self) -> Result<(), PipelineError> {
        Ok(())
    }

    /// Whether the stage refuses to start without a downstream sink.
    fn requires_output(&self) -> bool {
        true
    }

    /// Read the current job/results/files path and update them in place.
    fn execute(&mut self, process: &mut Process) -> Result<(), TaskError>;
}

/// Generic channel-driven stage running one [`Task`].
///
/// `I` is what arrives from upstream: a raw `Job` for the first stage, a
/// [`JobRunState`] for every other one.
pub struct ProcessStage<I, T> {
    process: Process,
    task: T,
    input: Option<Receiver<I>>,
    output: Option<Sender<JobRunState>>,
    token: Option<CancellationToken>,
    _inbound: PhantomData<fn() -> I>,
}

impl<I, T> ProcessStage<I, T>
where
    I: Inbound,
    T: Task,
{
    pub fn new(task: T) -> Self {
        Self {
            process: Process::new(),
            task,
            input: None,
            output: None,
            token: None,
            _inbound: PhantomData,
        }
    }

    pub fn with_input(mut self, input: Receiver<I>) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_output(mut self, output: Sender<JobRunState>) -> Self {
        self.output = Some(output);
        self
    }

    pub fn process(&self) -> &Process {
        &self.process
    }

    pub fn process_mut(&mut self) -> &mut Process {
        &mut self.process
    }

    pub fn task(&self) -> &T {
        &self.task
    }

    /// Run the task once against the current process state.
    pub fn perform(&mut self) -> Result<(), TaskError> {
        self.task.execute(&mut self.process)
    }

    fn serve(
        mut self,
        input: Receiver<I>,
        output: Option<Sender<JobRunState>>,
        token: CancellationToken,
        errors: ErrorReport,
    ) {
        let stage = self.task.name().to_string();
        info!(stage = %stage, "stage started");

        loop {
            let inbound = select! {
                recv(token.cancelled()) -> _ => break,
                recv(input) -> msg => match msg {
                    Ok(item) => item,
                    Err(_) => {
                        debug!(stage = %stage, "upstream closed");
                        break;
                    }
                },
            };

            if token.is_cancelled() {
                break;
            }

            inbound.load_into(&mut self.process);
            let title = self.process.message().title.clone();
            debug!(stage = %stage, job = %title, "processing job");

            if let Err(source) = self.perform() {
                let err = StageError::new(stage.as_str(), title, source);
                warn!(stage = %stage, error = %err, "job failed");
                errors.report(err);
                continue;
            }

            let Some(out) = output.as_ref() else {
                continue;
            };

            if token.is_cancelled() {
                break;
            }

            let snapshot = self.process.snapshot();
            select! {
                send(out, snapshot) -> res => {
                    if res.is_err() {
                        debug!(stage = %stage, "downstream closed");
                        break;
                    }
                },
                recv(token.cancelled()) -> _ => break,
            }
        }

        info!(stage = %stage, "stage stopped");
    }
}

impl<I, T> Stage for ProcessStage<I, T>
where
    I: Inbound,
    T: Task,
{
    fn name(&self) -> &str {
        self.task.name()
    }

    fn set_cancellation(&mut self, token: CancellationToken) {
        self.token = Some(token);
    }

    fn run(self: Box<Self>, errors: ErrorReport) -> Result<(), PipelineError> {
        let mut stage = *self;
        let name = stage.task.name().to_string();

        stage.task.validate_setup()?;

        let input = stage
            .input
            .take()
            .ok_or_else(|| PipelineError::setup(name.as_str(), "no input channel"))?;

        let output = stage.output.take();
        if output.is_none() && stage.task.requires_output() {
            return Err(PipelineError::setup(name.as_str(), "requires a next stage"));
        }

        let token = stage.token.take().unwrap_or_default();

        thread::Builder::new()
            .name(format!("stage-{name}"))
            .spawn(move || stage.serve(input, output, token, errors))
            .map_err(|e| PipelineError::spawn(format!("stage {name}"), e))?;

        Ok(())
    }
}

impl<I, T> StageState for ProcessStage<I, T> {
    fn message(&self) -> &auditflow_core::Job {
        self.process.message()
    }

    fn result(&self) -> &crate::state::ResultMap {
        self.process.result()
    }

    fn files_path(&self) -> Option<&std::path::Path> {
        self.process.files_path()
    }
}
