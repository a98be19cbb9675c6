//! Pipeline orchestrator: stage registration, startup and error fan-in.
//!
//! The orchestrator runs no business logic. It hands every stage the shared
//! cancellation token, starts them in registration order and merges their error
//! reports into one stream.

use std::fmt;
use std::thread;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error, info};

use crate::cancel::CancellationToken;
use crate::error::{PipelineError, StageError};
use crate::stage::{ErrorReport, Stage};

/// An ordered set of stages sharing one cancellation token.
pub struct Pipeline {
    stages: Vec<Box<dyn Stage>>,
    token: CancellationToken,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::with_token(CancellationToken::new())
    }

    /// Build a pipeline around an existing token (e.g. one the queue worker also holds).
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            stages: Vec::new(),
            token,
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn add_stage<S>(&mut self, stage: S) -> Result<(), PipelineError>
    where
        S: Stage + 'static,
    {
        self.add_boxed_stage(Some(Box::new(stage)))
    }

    /// Register a stage slot. An empty slot is rejected.
    pub fn add_boxed_stage(&mut self, stage: Option<Box<dyn Stage>>) -> Result<(), PipelineError> {
        let mut stage = stage.ok_or(PipelineError::MissingStage)?;
        stage.set_cancellation(self.token.clone());
        debug!(stage = stage.name(), position = self.stages.len(), "stage registered");
        self.stages.push(stage);
        Ok(())
    }

    /// Register several stage slots; every valid one is kept even if others fail.
    pub fn add_stages<I>(&mut self, stages: I) -> Result<(), PipelineError>
    where
        I: IntoIterator<Item = Option<Box<dyn Stage>>>,
    {
        let mut offered = 0;
        let mut failed = 0;
        for stage in stages {
            offered += 1;
            if self.add_boxed_stage(stage).is_err() {
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(PipelineError::StagesRejected { failed, offered });
        }
        Ok(())
    }

    /// Start every stage and return the merged error stream without blocking.
    ///
    /// A stage that fails to start aborts startup: later stages are not started
    /// and the shared token is cancelled so already-running stages wind down.
    pub fn start(self) -> Result<RunningPipeline, PipelineError> {
        let Pipeline { stages, token } = self;
        let mut streams = Vec::with_capacity(stages.len());

        for stage in stages {
            let name = stage.name().to_string();
            let (report, stream) = ErrorReport::channel();
            if let Err(err) = stage.run(report) {
                error!(stage = %name, error = %err, "stage failed to start");
                token.cancel();
                return Err(err);
            }
            streams.push(stream);
        }

        info!(stages = streams.len(), "pipeline started");
        let errors = merge_errors(streams).inspect_err(|_| token.cancel())?;

        Ok(RunningPipeline { errors, token })
    }

    /// Start every stage, then block until the first reported error or until
    /// every stage has stopped.
    ///
    /// Returning an error does not stop the stage loops; cancel the token for that.
    pub fn run(self) -> Result<(), PipelineError> {
        self.start()?.wait()
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field(
                "stages",
                &self.stages.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

/// A started pipeline: the merged error stream plus its token.
#[derive(Debug)]
pub struct RunningPipeline {
    errors: Receiver<StageError>,
    token: CancellationToken,
}

impl RunningPipeline {
    /// Merged error stream. Closes once every stage has stopped.
    pub fn errors(&self) -> &Receiver<StageError> {
        &self.errors
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Block until the first error (returned) or clean closure of the stream.
    pub fn wait(self) -> Result<(), PipelineError> {
        match self.errors.recv() {
            Ok(err) => Err(PipelineError::Stage(err)),
            Err(_) => {
                info!("pipeline error stream closed");
                Ok(())
            }
        }
    }
}

/// Fan several error streams into one.
///
/// One forwarding thread per input stream; the output closes only after every
/// forwarder has exited, i.e. after every input stream has closed.
pub fn merge_errors(streams: Vec<Receiver<StageError>>) -> Result<Receiver<StageError>, PipelineError> {
    let (tx, rx) = crossbeam_channel::unbounded();

    for (idx, stream) in streams.into_iter().enumerate() {
        let tx = tx.clone();
        thread::Builder::new()
            .name(format!("merge-errors-{idx}"))
            .spawn(move || forward_errors(stream, tx))
            .map_err(|e| PipelineError::spawn(format!("error forwarder {idx}"), e))?;
    }

    // The forwarders hold the only remaining senders.
    drop(tx);
    Ok(rx)
}

fn forward_errors(stream: Receiver<StageError>, out: Sender<StageError>) {
    for err in stream.iter() {
        if out.send(err).is_err() {
            // Nobody is listening any more.
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use auditflow_core::Job;
    use crossbeam_channel::bounded;

    use crate::error::TaskError;
    use crate::process::Process;
    use crate::stage::{ProcessStage, Task};
    use crate::state::{JobRunState, StageState};

    /// Stage double that only records whether it was started.
    struct Probe {
        name: &'static str,
        started: Arc<AtomicBool>,
        token: Option<CancellationToken>,
        broken: bool,
    }

    impl Probe {
        fn new(name: &'static str, broken: bool) -> (Self, Arc<AtomicBool>) {
            let started = Arc::new(AtomicBool::new(false));
            (
                Self {
                    name,
                    started: started.clone(),
                    token: None,
                    broken,
                },
                started,
            )
        }
    }

    impl Stage for Probe {
        fn name(&self) -> &str {
            self.name
        }

        fn set_cancellation(&mut self, token: CancellationToken) {
            self.token = Some(token);
        }

        fn run(self: Box<Self>, _errors: ErrorReport) -> Result<(), PipelineError> {
            if self.broken {
                return Err(PipelineError::setup(self.name, "no input channel"));
            }
            assert!(self.token.is_some(), "token injected before run");
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailOn(&'static str, &'static str);

    impl Task for FailOn {
        fn name(&self) -> &str {
            self.0
        }

        fn execute(&mut self, process: &mut Process) -> Result<(), TaskError> {
            if process.message().title == self.1 {
                return Err(TaskError::other("rejected"));
            }
            let visited = process.result().len();
            process.result_mut().insert(self.0, visited);
            Ok(())
        }
    }

    fn job(title: &str) -> Job {
        Job::new(title, "https://e", "/src", "local")
    }

    fn two_stage_pipeline(
        fail_title: &'static str,
    ) -> (Pipeline, Sender<Job>, Receiver<JobRunState>) {
        let (in_tx, in_rx) = bounded(8);
        let (mid_tx, mid_rx) = bounded(1);
        let (out_tx, out_rx) = bounded(8);

        let mut pipeline = Pipeline::new();
        pipeline
            .add_stage(
                ProcessStage::new(FailOn("first", fail_title))
                    .with_input(in_rx)
                    .with_output(mid_tx),
            )
            .unwrap();
        pipeline
            .add_stage(
                ProcessStage::<JobRunState, _>::new(FailOn("second", ""))
                    .with_input(mid_rx)
                    .with_output(out_tx),
            )
            .unwrap();
        (pipeline, in_tx, out_rx)
    }

    #[test]
    fn missing_stage_is_rejected() {
        let mut pipeline = Pipeline::new();
        let err = pipeline.add_boxed_stage(None).unwrap_err();
        assert!(matches!(err, PipelineError::MissingStage));
        assert!(pipeline.is_empty());
    }

    #[test]
    fn add_stages_reports_how_many_failed() {
        let (probe, _) = Probe::new("ok", false);
        let mut pipeline = Pipeline::new();

        let err = pipeline
            .add_stages(vec![Some(Box::new(probe) as Box<dyn Stage>), None])
            .unwrap_err();

        assert!(matches!(
            err,
            PipelineError::StagesRejected {
                failed: 1,
                offered: 2
            }
        ));
        assert_eq!(pipeline.len(), 1);
    }

    #[test]
    fn start_failure_stops_registration_order() {
        let (first, first_started) = Probe::new("first", false);
        let (broken, _) = Probe::new("broken", true);
        let (last, last_started) = Probe::new("last", false);

        let mut pipeline = Pipeline::new();
        let token = pipeline.cancellation_token();
        pipeline.add_stage(first).unwrap();
        pipeline.add_stage(broken).unwrap();
        pipeline.add_stage(last).unwrap();

        let err = pipeline.run().unwrap_err();

        assert!(err.is_setup());
        assert!(first_started.load(Ordering::SeqCst));
        assert!(!last_started.load(Ordering::SeqCst));
        assert!(token.is_cancelled());
    }

    #[test]
    fn run_returns_when_every_stream_closes() {
        let (a, _) = Probe::new("a", false);
        let (b, _) = Probe::new("b", false);
        let mut pipeline = Pipeline::new();
        pipeline.add_stage(a).unwrap();
        pipeline.add_stage(b).unwrap();

        // Probes drop their reports immediately.
        assert!(pipeline.run().is_ok());
    }

    #[test]
    fn first_error_is_returned_and_healthy_jobs_flow_through() {
        let (pipeline, input, output) = two_stage_pipeline("3");
        let token = pipeline.cancellation_token();

        let runner = thread::spawn(move || pipeline.run());
        for i in 1..=5 {
            input.send(job(&i.to_string())).unwrap();
        }

        let titles: Vec<String> = (0..4)
            .map(|_| output.recv_timeout(Duration::from_secs(2)).unwrap().job.title)
            .collect();
        assert_eq!(titles, vec!["1", "2", "4", "5"]);

        match runner.join().unwrap() {
            Err(PipelineError::Stage(err)) => {
                assert_eq!(err.stage, "first");
                assert_eq!(err.title, "3");
            }
            other => panic!("expected stage error, got {other:?}"),
        }
        assert!(output.recv_timeout(Duration::from_millis(50)).is_err());
        token.cancel();
    }

    #[test]
    fn results_accumulate_across_stages() {
        let (pipeline, input, output) = two_stage_pipeline("");
        let token = pipeline.cancellation_token();
        let _running = pipeline.start().unwrap();

        input.send(job("A")).unwrap();
        let state = output.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(state.result.get("first"), Some(&serde_json::json!(0)));
        assert_eq!(state.result.get("second"), Some(&serde_json::json!(1)));
        token.cancel();
    }

    #[test]
    fn cancellation_closes_merged_stream_and_stops_forwarding() {
        let (pipeline, input, output) = two_stage_pipeline("");
        let token = pipeline.cancellation_token();
        let running = pipeline.start().unwrap();

        token.cancel();

        let waiter = thread::spawn(move || running.wait());
        let started = std::time::Instant::now();
        assert!(waiter.join().unwrap().is_ok());
        assert!(started.elapsed() < Duration::from_secs(5));

        // Stage loops have exited; nothing reaches the output any more.
        let _ = input.send_timeout(job("late"), Duration::from_millis(20));
        assert!(output.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn merge_closes_only_after_every_input() {
        let (tx_a, rx_a) = crossbeam_channel::unbounded();
        let (tx_b, rx_b) = crossbeam_channel::unbounded::<StageError>();
        let merged = merge_errors(vec![rx_a, rx_b]).unwrap();

        drop(tx_a);
        assert!(merged.recv_timeout(Duration::from_millis(50)).is_err());
        assert!(!matches!(
            merged.recv_timeout(Duration::from_millis(1)),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected)
        ));

        tx_b.send(StageError::new("b", "job", TaskError::other("x")))
            .unwrap();
        assert_eq!(merged.recv_timeout(Duration::from_secs(1)).unwrap().stage, "b");

        drop(tx_b);
        assert!(matches!(
            merged.recv_timeout(Duration::from_secs(1)),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected)
        ));
    }
}
