//! Recipient executors: deliver a fired job's payload.
//!
//! [`HttpJobExecutor`] is the reference implementation: it turns the job's
//! recipient into one HTTP request, sends it under the job's deadline and
//! classifies the answer. It never returns without an [`ExecutionResult`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jobkeeper_core::config::HttpConfig;
use reqwest::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ExecutionError;
use crate::recipient::{HttpRecipient, Recipient, SinkRecipient};
use crate::types::Job;

/// Remaining-repeats hint sent with every delivery.
pub const LIMIT_HEADER: &str = "x-job-limit";
/// Job identifier, usable by recipients to deduplicate at-least-once deliveries.
pub const JOB_ID_HEADER: &str = "x-job-id";

/// Outcome of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    Success { code: u16 },
    Failure(ExecutionError),
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Success { .. })
    }
}

/// Delivers a job to its recipient.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: &Job) -> ExecutionResult;
}

pub struct HttpJobExecutor {
    client: reqwest::Client,
    default_timeout: Duration,
}

impl HttpJobExecutor {
    pub fn new(config: &HttpConfig, default_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .build()?;
        Ok(Self {
            client,
            default_timeout,
        })
    }

    fn build_request(&self, job: &Job) -> Result<reqwest::RequestBuilder, ExecutionError> {
        let limit = job.trigger.remaining_repeats().to_string();
        let request = match &job.recipient {
            Recipient::Http(recipient) => self.http_request(recipient)?,
            Recipient::Sink(recipient) => self.sink_request(recipient)?,
        };
        Ok(request
            .header(LIMIT_HEADER, limit)
            .header(JOB_ID_HEADER, job.id.as_str()))
    }

    fn http_request(
        &self,
        recipient: &HttpRecipient,
    ) -> Result<reqwest::RequestBuilder, ExecutionError> {
        let method = reqwest::Method::from_bytes(recipient.method.as_bytes())
            .map_err(|e| ExecutionError::InvalidRecipient(e.to_string()))?;
        let mut request = self
            .client
            .request(method, &recipient.url)
            .query(&recipient.query_params);
        for (name, value) in &recipient.headers {
            request = request.header(header_name(name)?, header_value(value)?);
        }
        if let Some(payload) = &recipient.payload {
            request = request.json(payload);
        }
        Ok(request)
    }

    fn sink_request(
        &self,
        recipient: &SinkRecipient,
    ) -> Result<reqwest::RequestBuilder, ExecutionError> {
        let mut request = self
            .client
            .post(&recipient.sink_url)
            .header("ce-specversion", header_value(&recipient.ce_specversion)?)
            .header("ce-id", Uuid::new_v4().to_string())
            .header("ce-type", header_value(&recipient.ce_type)?)
            .header("ce-source", header_value(&recipient.ce_source)?)
            .header("ce-time", Utc::now().to_rfc3339());
        for (name, value) in &recipient.ce_extensions {
            request = request.header(header_name(&format!("ce-{name}"))?, header_value(value)?);
        }
        if let Some(payload) = &recipient.payload {
            request = request
                .header(CONTENT_TYPE, "application/json")
                .body(payload.to_string());
        }
        Ok(request)
    }
}

#[async_trait]
impl JobExecutor for HttpJobExecutor {
    async fn execute(&self, job: &Job) -> ExecutionResult {
        let timeout = job.execution_timeout().unwrap_or(self.default_timeout);
        let request = match self.build_request(job) {
            Ok(request) => request.timeout(timeout),
            Err(e) => return ExecutionResult::Failure(e),
        };

        debug!(job_id = %job.id, url = %job.recipient.url(), "delivering job");

        let resp = match request.send().await {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => {
                warn!(job_id = %job.id, "recipient call timed out");
                return ExecutionResult::Failure(ExecutionError::Timeout {
                    ms: timeout.as_millis() as u64,
                });
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "recipient call failed");
                return ExecutionResult::Failure(ExecutionError::Transport(e.to_string()));
            }
        };

        let code = resp.status().as_u16();
        if resp.status().is_success() {
            return ExecutionResult::Success { code };
        }

        let body = resp.text().await.unwrap_or_default();
        warn!(job_id = %job.id, status = code, "recipient answered with an error");
        ExecutionResult::Failure(ExecutionError::Status { code, body })
    }
}

fn header_name(name: &str) -> Result<HeaderName, ExecutionError> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| ExecutionError::InvalidRecipient(format!("header '{name}': {e}")))
}

fn header_value(value: &str) -> Result<HeaderValue, ExecutionError> {
    HeaderValue::from_str(value)
        .map_err(|e| ExecutionError::InvalidRecipient(format!("header value: {e}")))
}
