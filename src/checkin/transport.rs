//! Wire exchange with the coordination server.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

use super::CheckinError;
use crate::config::CheckinConfig;
use crate::jobs::{JobRequest, MeasurementResult};

/// Uploads results and returns the server's current job catalogue.
#[async_trait]
pub trait CheckinTransport: Send + Sync {
    async fn checkin(&self, results: &[MeasurementResult]) -> Result<Vec<JobRequest>, CheckinError>;
}

#[derive(Debug, Serialize)]
struct CheckinRequest<'a> {
    device_id: &'a str,
    results: &'a [MeasurementResult],
}

/// JSON over HTTP POST.
#[derive(Debug, Clone)]
pub struct HttpCheckinTransport {
    client: Client,
    url: String,
    device_id: String,
}

impl HttpCheckinTransport {
    pub fn new(cfg: &CheckinConfig) -> Result<Self, CheckinError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_sec.max(1)))
            .user_agent(concat!("crowdprobe/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(CheckinError::Request)?;
        Ok(Self {
            client,
            url: cfg.server_url.clone(),
            device_id: cfg.device_id.clone(),
        })
    }
}

#[async_trait]
impl CheckinTransport for HttpCheckinTransport {
    async fn checkin(&self, results: &[MeasurementResult]) -> Result<Vec<JobRequest>, CheckinError> {
        let body = CheckinRequest {
            device_id: &self.device_id,
            results,
        };
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(CheckinError::Request)?;

        let status = response.status();
        if !status.is_success() {
            return Err(CheckinError::Status(status.as_u16()));
        }
        let jobs: Vec<JobRequest> = response.json().await.map_err(CheckinError::Decode)?;
        debug!(url = %self.url, uploaded = results.len(), jobs = jobs.len(), "checkin exchange done");
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::post, Json, Router};
    use serde_json::{json, Value};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/checkin", addr)
    }

    fn transport(url: String) -> HttpCheckinTransport {
        HttpCheckinTransport::new(&CheckinConfig {
            server_url: url,
            device_id: "dev-1".to_string(),
            ..CheckinConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_posts_results_and_decodes_jobs() {
        let app = Router::new().route(
            "/checkin",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["device_id"], "dev-1");
                assert_eq!(body["results"].as_array().unwrap().len(), 0);
                Json(json!([
                    { "type": "ping", "count": -1, "interval_seconds": 900,
                      "parameters": { "target": "8.8.8.8" } }
                ]))
            }),
        );
        let jobs = transport(serve(app).await).checkin(&[]).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].kind, "ping");
        assert_eq!(jobs[0].interval_seconds, Some(900));
        assert!(jobs[0].count.unwrap().is_infinite());
    }

    #[tokio::test]
    async fn test_error_status_reported() {
        let app = Router::new().route(
            "/checkin",
            post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "busy") }),
        );
        let err = transport(serve(app).await).checkin(&[]).await.unwrap_err();
        assert!(matches!(err, CheckinError::Status(503)));
    }

    #[tokio::test]
    async fn test_garbage_body_is_decode_error() {
        let app = Router::new().route("/checkin", post(|| async { "not json" }));
        let err = transport(serve(app).await).checkin(&[]).await.unwrap_err();
        assert!(matches!(err, CheckinError::Decode(_)));
    }
}
