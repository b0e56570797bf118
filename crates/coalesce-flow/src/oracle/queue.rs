//! HTTP client for the Taskcluster queue's task-status endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;

use coalesce_core::JobId;

use super::{JobStatusOracle, OracleError};
use crate::error::{Error, Result};
use crate::notification::JobState;

/// Default timeout for one status request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: StatusBody,
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    state: JobState,
}

/// Oracle backed by `GET {root}/api/queue/v1/task/{job}/status`.
#[derive(Debug, Clone)]
pub struct QueueOracle {
    root_url: Url,
    client: reqwest::Client,
}

impl QueueOracle {
    /// Creates a client for the deployment at `root_url`; every request is
    /// bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `root_url` is not an absolute
    /// hierarchical URL or the HTTP client cannot be built.
    pub fn new(root_url: &str, timeout: Duration) -> Result<Self> {
        let root_url = Url::parse(root_url)
            .map_err(|e| Error::configuration(format!("invalid root url '{root_url}': {e}")))?;
        if root_url.cannot_be_a_base() {
            return Err(Error::configuration(format!(
                "root url '{root_url}' cannot carry a path"
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::configuration(format!("failed to build http client: {e}")))?;
        Ok(Self { root_url, client })
    }

    fn status_url(&self, job: &JobId) -> Url {
        let mut url = self.root_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["api", "queue", "v1", "task", job.as_str(), "status"]);
        }
        url
    }
}

#[async_trait]
impl JobStatusOracle for QueueOracle {
    async fn status(&self, job: &JobId) -> std::result::Result<JobState, OracleError> {
        let response = self
            .client
            .get(self.status_url(job))
            .send()
            .await
            .map_err(|e| OracleError::Transient(format!("status request failed: {e}")))?;

        match response.status() {
            status if status.is_success() => response
                .json::<StatusResponse>()
                .await
                .map(|body| body.status.state)
                .map_err(|e| OracleError::Transient(format!("invalid status response: {e}"))),
            StatusCode::NOT_FOUND => Err(OracleError::NotFound),
            status => Err(OracleError::Transient(format!(
                "status request returned {status}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::StatusCode as HttpStatus;
    use axum::routing::get;
    use axum::{Json, Router};

    async fn task_status(
        Path(job): Path<String>,
    ) -> std::result::Result<Json<serde_json::Value>, HttpStatus> {
        match job.as_str() {
            "pending-job" => Ok(Json(serde_json::json!({
                "status": {"taskId": "pending-job", "state": "pending", "runs": []}
            }))),
            "done-job" => Ok(Json(serde_json::json!({"status": {"state": "completed"}}))),
            "broken-job" => Err(HttpStatus::INTERNAL_SERVER_ERROR),
            _ => Err(HttpStatus::NOT_FOUND),
        }
    }

    async fn serve() -> String {
        let app = Router::new().route("/api/queue/v1/task/:job/status", get(task_status));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/")
    }

    fn job(s: &str) -> JobId {
        JobId::new(s).unwrap()
    }

    fn oracle(root: &str) -> QueueOracle {
        QueueOracle::new(root, DEFAULT_REQUEST_TIMEOUT).unwrap()
    }

    #[test]
    fn status_url_trims_trailing_slash() {
        assert_eq!(
            oracle("https://tc.example.com/").status_url(&job("abc")).as_str(),
            "https://tc.example.com/api/queue/v1/task/abc/status"
        );
        assert_eq!(
            oracle("https://tc.example.com/prefix").status_url(&job("abc")).as_str(),
            "https://tc.example.com/prefix/api/queue/v1/task/abc/status"
        );
    }

    #[test]
    fn job_id_is_percent_encoded_as_one_segment() {
        assert_eq!(
            oracle("https://tc.example.com").status_url(&job("a/b c?")).as_str(),
            "https://tc.example.com/api/queue/v1/task/a%2Fb%20c%3F/status"
        );
    }

    #[test]
    fn invalid_root_url_is_a_configuration_error() {
        for root in ["not a url", "mailto:ops@example.com"] {
            let err = QueueOracle::new(root, DEFAULT_REQUEST_TIMEOUT).unwrap_err();
            assert!(matches!(err, Error::Configuration { .. }), "{root}");
        }
    }

    #[tokio::test]
    async fn maps_http_responses() {
        let oracle = oracle(&serve().await);

        assert_eq!(oracle.status(&job("pending-job")).await, Ok(JobState::Pending));
        assert_eq!(oracle.status(&job("done-job")).await, Ok(JobState::Completed));
        assert_eq!(oracle.status(&job("missing-job")).await, Err(OracleError::NotFound));
        assert!(matches!(
            oracle.status(&job("broken-job")).await,
            Err(OracleError::Transient(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_oracle_is_transient() {
        let oracle = QueueOracle::new("http://127.0.0.1:9", Duration::from_millis(200)).unwrap();
        assert!(matches!(
            oracle.status(&job("abc")).await,
            Err(OracleError::Transient(_))
        ));
    }
}
