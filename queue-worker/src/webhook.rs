use std::time;

use async_trait::async_trait;
use queue_common::JobRef;
use reqwest::header;

use crate::error::WebhookError;
use crate::worker::JobHandler;

/// A `JobHandler` delivering every job's payload to a single webhook URL.
pub struct WebhookHandler {
    url: String,
    client: reqwest::Client,
}

impl WebhookHandler {
    pub fn new(url: &str, request_timeout: time::Duration) -> Result<Self, WebhookError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/octet-stream"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("queue-worker")
            .timeout(request_timeout)
            .build()
            .map_err(WebhookError::ClientError)?;

        Ok(Self {
            url: url.to_owned(),
            client,
        })
    }

    /// POST the payload of `job`, failing on transport errors and non-2xx responses.
    pub async fn deliver(&self, job: &JobRef) -> Result<(), WebhookError> {
        let response = self
            .client
            .post(&self.url)
            .header("x-job-id", job.id.to_string())
            .header("x-job-attempt", job.attempts.to_string())
            .body(job.payload.clone())
            .send()
            .await
            .map_err(WebhookError::RequestError)?;

        let status = response.status();
        if !status.is_success() {
            return Err(WebhookError::BadStatus(status));
        }

        Ok(())
    }
}

#[async_trait]
impl JobHandler for WebhookHandler {
    async fn handle(&self, job: JobRef) -> anyhow::Result<()> {
        Ok(self.deliver(&job).await?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use httpmock::prelude::*;

    use super::*;

    fn job_ref(payload: &[u8]) -> JobRef {
        JobRef {
            id: 7,
            queue_name: "webhooks".to_owned(),
            payload: payload.to_vec(),
            attempts: 2,
            max_attempts: 3,
            lease_expires_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_delivers_payload_with_job_headers() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/hook")
                    .header("content-type", "application/octet-stream")
                    .header("x-job-id", "7")
                    .header("x-job-attempt", "2")
                    .body("hello");
                then.status(204);
            })
            .await;

        let handler =
            WebhookHandler::new(&server.url("/hook"), time::Duration::from_secs(5)).unwrap();
        handler
            .handle(job_ref(b"hello"))
            .await
            .expect("delivery failed");

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_non_success_status_is_a_failure() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/hook");
                then.status(503);
            })
            .await;

        let handler =
            WebhookHandler::new(&server.url("/hook"), time::Duration::from_secs(5)).unwrap();
        let error = handler.deliver(&job_ref(b"hello")).await.unwrap_err();

        assert!(matches!(
            error,
            WebhookError::BadStatus(status) if status == reqwest::StatusCode::SERVICE_UNAVAILABLE
        ));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unreachable_webhook_is_a_failure() {
        // Nothing listens on the discard port.
        let handler =
            WebhookHandler::new("http://127.0.0.1:9/hook", time::Duration::from_secs(1)).unwrap();

        let error = handler.deliver(&job_ref(b"hello")).await.unwrap_err();
        assert!(matches!(error, WebhookError::RequestError(_)));
    }
}
