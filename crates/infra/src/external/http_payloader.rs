//! JSON report payloader delivering over HTTP.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::blocking::Client;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::debug;

use auditflow_core::Job;
use auditflow_pipeline::stages::Payloader;
use auditflow_pipeline::{ResultMap, TaskError};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Report body sent to the job's `response_api_endpoint`.
#[derive(Debug, Serialize)]
struct AuditReport<'a> {
    title: &'a str,
    description: &'a str,
    checksum: &'a str,
    visibility: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    project_type: Option<&'a str>,
    source_url: &'a str,
    source_type: &'a str,
    request_client: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    project: Vec<&'a str>,
    standards: Vec<&'a str>,
    results: BTreeMap<&'a str, &'a JsonValue>,
}

/// Builds an [`AuditReport`] from the job results and POSTs it as JSON.
#[derive(Debug, Clone)]
pub struct HttpPayloader {
    client: Client,
    bearer_token: Option<String>,
}

impl HttpPayloader {
    pub fn new() -> Result<Self, TaskError> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| TaskError::payload(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            bearer_token: None,
        })
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }
}

impl Payloader for HttpPayloader {
    fn build_payload(&self, job: &Job, result: &ResultMap) -> Result<Vec<u8>, TaskError> {
        let checksum = result
            .get("checksum")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| TaskError::payload("checksum not found"))?;

        let results: BTreeMap<&str, &JsonValue> = job
            .audits
            .iter()
            .filter_map(|a| result.get(&a.kind).map(|v| (a.kind.as_str(), v)))
            .collect();
        if results.is_empty() {
            return Err(TaskError::payload("no audit results to send"));
        }

        let report = AuditReport {
            title: &job.title,
            description: &job.content,
            checksum,
            visibility: &job.visibility,
            project_type: job.project_type.as_deref(),
            source_url: &job.source_url,
            source_type: &job.source_type,
            request_client: &job.request_client,
            project: if job.slug.is_empty() { Vec::new() } else { vec![job.slug.as_str()] },
            standards: job.audits.iter().map(|a| a.kind.as_str()).collect(),
            results,
        };
        serde_json::to_vec(&report).map_err(|e| TaskError::payload(e.to_string()))
    }

    fn send_payload(&self, endpoint: &str, payload: Vec<u8>) -> Result<Vec<u8>, TaskError> {
        let mut request = self
            .client
            .post(endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .map_err(|e| TaskError::payload(format!("request to {endpoint} failed: {e}")))?;
        let status = response.status();
        let body = response
            .bytes()
            .map_err(|e| TaskError::payload(format!("failed to read reply from {endpoint}: {e}")))?;

        if !status.is_success() {
            return Err(TaskError::payload(format!(
                "{endpoint} returned {status}: {}",
                String::from_utf8_lossy(&body)
            )));
        }
        debug!(%endpoint, %status, bytes = body.len(), "payload delivered");
        Ok(body.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use auditflow_core::Audit;
    use serde_json::json;

    fn job() -> Job {
        Job::new("Plugin", "https://reports.example/api", "/src/plugin", "local")
            .with_slug("plugin")
            .with_audit(Audit::new("manifest"))
            .with_audit(Audit::new("phpcs"))
    }

    #[test]
    fn report_carries_job_fields_and_requested_results_only() {
        let mut result = ResultMap::new();
        result.insert("checksum", "abc123");
        result.insert("manifest", json!({"files": 2}));
        result.insert("files", json!(["a.php"]));

        let bytes = HttpPayloader::new().unwrap().build_payload(&job(), &result).unwrap();
        let report: JsonValue = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(report["title"], json!("Plugin"));
        assert_eq!(report["checksum"], json!("abc123"));
        assert_eq!(report["project"], json!(["plugin"]));
        assert_eq!(report["standards"], json!(["manifest", "phpcs"]));
        assert_eq!(report["results"], json!({"manifest": {"files": 2}}));
    }

    #[test]
    fn missing_checksum_or_results_is_an_error() {
        let payloader = HttpPayloader::new().unwrap();

        let mut no_checksum = ResultMap::new();
        no_checksum.insert("manifest", json!({}));
        assert!(payloader.build_payload(&job(), &no_checksum).is_err());

        let mut no_results = ResultMap::new();
        no_results.insert("checksum", "abc");
        assert!(matches!(
            payloader.build_payload(&job(), &no_results),
            Err(TaskError::Payload(_))
        ));
    }

    #[test]
    fn invalid_endpoint_is_a_payload_error() {
        let err = HttpPayloader::new()
            .unwrap()
            .send_payload("not a url", b"{}".to_vec())
            .unwrap_err();
        assert!(matches!(err, TaskError::Payload(_)));
    }
}
