use std::time;

use async_trait::async_trait;
use reqwest::header;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier of one started workflow execution.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExecutionHandle {
    pub execution_id: String,
}

#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("failed to build the workflow client: {0}")]
    ClientError(reqwest::Error),
    #[error("workflow trigger request failed: {0}")]
    RequestError(reqwest::Error),
    #[error("workflow trigger responded with status {status}: {body}")]
    StatusError {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("unreadable workflow trigger response: {0}")]
    ResponseError(reqwest::Error),
}

/// Starts the downstream workflow for a completed trip.
#[async_trait]
pub trait WorkflowTrigger: Send + Sync {
    async fn start(&self, trip_id: &str) -> Result<ExecutionHandle, TriggerError>;
}

#[derive(Serialize)]
struct StartExecution<'a> {
    workflow_id: &'a str,
    input: StartInput<'a>,
}

#[derive(Serialize)]
struct StartInput<'a> {
    trip_id: &'a str,
}

/// Starts executions by POSTing to a workflow service.
pub struct HttpWorkflowTrigger {
    client: reqwest::Client,
    url: String,
    workflow_id: String,
}

impl HttpWorkflowTrigger {
    pub fn new(
        url: &str,
        workflow_id: &str,
        request_timeout: time::Duration,
    ) -> Result<Self, TriggerError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("Trip Joiner")
            .timeout(request_timeout)
            .build()
            .map_err(TriggerError::ClientError)?;

        Ok(Self {
            client,
            url: url.to_owned(),
            workflow_id: workflow_id.to_owned(),
        })
    }
}

#[async_trait]
impl WorkflowTrigger for HttpWorkflowTrigger {
    async fn start(&self, trip_id: &str) -> Result<ExecutionHandle, TriggerError> {
        let body = StartExecution {
            workflow_id: &self.workflow_id,
            input: StartInput { trip_id },
        };

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(TriggerError::RequestError)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TriggerError::StatusError { status, body });
        }

        response
            .json::<ExecutionHandle>()
            .await
            .map_err(TriggerError::ResponseError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method, MockServer};
    use serde_json::json;

    fn trigger(server: &MockServer) -> HttpWorkflowTrigger {
        HttpWorkflowTrigger::new(
            &server.url("/executions"),
            "trip-aggregation",
            time::Duration::from_secs(2),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_start_posts_the_trip_id() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(Method::POST)
                    .path("/executions")
                    .header("content-type", "application/json")
                    .json_body(json!({
                        "workflow_id": "trip-aggregation",
                        "input": {"trip_id": "T1"}
                    }));
                then.status(200)
                    .json_body(json!({"execution_id": "exec-1"}));
            })
            .await;

        let handle = trigger(&server).start("T1").await.unwrap();

        assert_eq!(handle.execution_id, "exec-1");
        mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn test_error_status_is_a_trigger_error() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(Method::POST).path("/executions");
                then.status(503).body("unavailable");
            })
            .await;

        let error = trigger(&server).start("T1").await.unwrap_err();

        match error {
            TriggerError::StatusError { status, body } => {
                assert_eq!(status.as_u16(), 503);
                assert_eq!(body, "unavailable");
            }
            other => panic!("unexpected error: {}", other),
        }
        // No retry at this layer.
        mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn test_unreadable_response_is_a_trigger_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(Method::POST).path("/executions");
                then.status(200).body("started!");
            })
            .await;

        let error = trigger(&server).start("T1").await.unwrap_err();
        assert!(matches!(error, TriggerError::ResponseError(_)));
    }
}
