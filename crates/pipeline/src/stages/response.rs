//! Response: build the job's payload and deliver it to the reporting endpoint.

use std::collections::HashMap;

use tracing::info;

use auditflow_core::Job;

use crate::error::{PipelineError, TaskError};
use crate::process::Process;
use crate::stage::{ProcessStage, Task};
use crate::state::{JobRunState, ResultMap, StageState};

/// Formats and delivers results for one payload type.
pub trait Payloader: Send {
    fn build_payload(&self, job: &Job, result: &ResultMap) -> Result<Vec<u8>, TaskError>;

    /// Deliver `payload` and return the raw reply body.
    fn send_payload(&self, endpoint: &str, payload: Vec<u8>) -> Result<Vec<u8>, TaskError>;
}

/// Terminal stage. Forwarding is optional: the queue worker listens on the
/// output when it needs to acknowledge jobs.
#[derive(Default)]
pub struct Respond {
    payloaders: HashMap<String, Box<dyn Payloader>>,
}

pub type ResponseStage = ProcessStage<JobRunState, Respond>;

impl Respond {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_payloader<P>(mut self, payload_type: impl Into<String>, payloader: P) -> Self
    where
        P: Payloader + 'static,
    {
        self.payloaders.insert(payload_type.into(), Box::new(payloader));
        self
    }
}

impl Task for Respond {
    fn name(&self) -> &str {
        "response"
    }

    fn validate_setup(&self) -> Result<(), PipelineError> {
        if self.payloaders.is_empty() {
            return Err(PipelineError::setup(
                self.name(),
                "need at least one payloader",
            ));
        }
        Ok(())
    }

    fn requires_output(&self) -> bool {
        false
    }

    fn execute(&mut self, process: &mut Process) -> Result<(), TaskError> {
        let job = process.message();
        let payload_type = job.payload_type_or_default().to_string();

        let payloader = self.payloaders.get(&payload_type).ok_or_else(|| {
            TaskError::payload(format!("no payloader for payload type '{payload_type}'"))
        })?;

        let payload = payloader.build_payload(job, process.result())?;
        let reply = payloader.send_payload(&job.response_api_endpoint, payload)?;
        info!(job = %job.title, payload_type = %payload_type, "payload submitted");

        let result = process.result_mut();
        result.insert("response", String::from_utf8_lossy(&reply).into_owned());
        result.insert(
            "responseMessage",
            format!("'{payload_type}' payload submitted successfully."),
        );
        result.insert("responseSuccess", true);
        Ok(())
    }
}
