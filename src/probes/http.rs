use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use reqwest::Client;
use serde_json::Value;

use super::{bounded_param, millis, seconds_param};
use crate::jobs::{JobControl, JobDescriptor, JobError, Measurement, Payload, Progress};

pub const KIND: &str = "http";

const DEFAULT_MAX_BODY_KB: u32 = 1024;

#[derive(Debug, Clone)]
struct HttpParams {
    url: String,
    timeout: Duration,
    max_body_bytes: u64,
}

/// HTTP GET: status, time to first byte and body transfer time.
pub struct HttpMeasurement {
    params: HttpParams,
    bytes: AtomicU64,
}

impl HttpMeasurement {
    pub fn from_descriptor(d: &JobDescriptor) -> Result<Self, JobError> {
        let raw = d.require_param("url")?.trim();
        let url = if raw.starts_with("http://") || raw.starts_with("https://") {
            raw.to_string()
        } else {
            format!("http://{}", raw)
        };
        reqwest::Url::parse(&url).map_err(|e| JobError::InvalidParameter {
            key: "url".to_string(),
            reason: e.to_string(),
        })?;

        let params = HttpParams {
            url,
            timeout: seconds_param(d, "timeout_sec", 10.0)?,
            max_body_bytes: bounded_param(d, "max_body_kb", DEFAULT_MAX_BODY_KB, 1..=65536)? as u64
                * 1024,
        };
        Ok(Self::new(params))
    }

    fn new(params: HttpParams) -> Self {
        Self {
            params,
            bytes: AtomicU64::new(0),
        }
    }

    async fn fetch(&self, client: &Client, control: &JobControl, payload: &mut Payload) -> Result<bool> {
        let start = Instant::now();
        let mut response = client
            .get(&self.params.url)
            .send()
            .await
            .context("HTTP request failed")?;
        let ttfb = start.elapsed();

        let headers_len: usize = response
            .headers()
            .iter()
            .map(|(k, v)| k.as_str().len() + v.as_bytes().len() + 4)
            .sum();
        self.bytes.fetch_add(headers_len as u64, Ordering::Relaxed);

        payload.insert("code".to_string(), Value::from(response.status().as_u16()));
        payload.insert("ttfb_ms".to_string(), Value::from(millis(ttfb)));
        payload.insert("headers_len".to_string(), Value::from(headers_len as u64));

        let mut body_len: u64 = 0;
        let mut truncated = false;
        while let Some(chunk) = response.chunk().await.context("HTTP body read failed")? {
            body_len += chunk.len() as u64;
            self.bytes.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            if control.stop_requested() {
                payload.insert("body_len".to_string(), Value::from(body_len));
                return Ok(false);
            }
            if body_len >= self.params.max_body_bytes {
                truncated = true;
                break;
            }
        }

        payload.insert("body_len".to_string(), Value::from(body_len));
        payload.insert("truncated".to_string(), Value::from(truncated));
        payload.insert("time_ms".to_string(), Value::from(millis(start.elapsed())));
        payload.insert("success".to_string(), Value::from(response.status().is_success()));
        Ok(true)
    }
}

#[async_trait::async_trait]
impl Measurement for HttpMeasurement {
    fn kind(&self) -> &str {
        KIND
    }

    fn estimated_duration(&self) -> Duration {
        self.params.timeout
    }

    fn bytes_consumed(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    fn estimated_bytes(&self) -> u64 {
        self.params.max_body_bytes
    }

    fn renew(&self) -> Arc<dyn Measurement> {
        Arc::new(Self::new(self.params.clone()))
    }

    async fn run(&self, control: &JobControl) -> Result<Progress> {
        let client = Client::builder()
            .timeout(self.params.timeout)
            .build()
            .context("Failed to build HTTP client")?;

        let mut payload = Payload::new();
        payload.insert("url".to_string(), Value::from(self.params.url.clone()));

        let fetched = tokio::select! {
            biased;
            _ = control.stopped() => None,
            res = self.fetch(&client, control, &mut payload) => Some(res),
        };
        let finished = match fetched {
            None => false,
            Some(Ok(done)) => done,
            // Unreachable hosts and timeouts are measured, not fatal.
            Some(Err(e)) => {
                payload.insert("success".to_string(), Value::from(false));
                payload.insert("error".to_string(), Value::from(format!("{:#}", e)));
                true
            }
        };

        if finished {
            Ok(Progress::Done(payload))
        } else {
            Ok(Progress::Stopped(payload))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{DescriptorLimits, JobRequest};

    fn descriptor(req: JobRequest) -> JobDescriptor {
        JobDescriptor::from_request(req, "client-a", chrono::Utc::now(), &DescriptorLimits::default())
            .unwrap()
    }

    #[test]
    fn test_scheme_defaulted() {
        let m = HttpMeasurement::from_descriptor(&descriptor(
            JobRequest::new(KIND).param("url", "example.com/index.html"),
        ))
        .unwrap();
        assert_eq!(m.params.url, "http://example.com/index.html");
        assert_eq!(m.estimated_bytes(), 1024 * 1024);
    }

    #[test]
    fn test_requires_url() {
        assert!(HttpMeasurement::from_descriptor(&descriptor(JobRequest::new(KIND))).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_measured() {
        let m = HttpMeasurement::from_descriptor(&descriptor(
            JobRequest::new(KIND)
                .param("url", "http://127.0.0.1:9/")
                .param("timeout_sec", "2"),
        ))
        .unwrap();
        let Progress::Done(payload) = m.run(&JobControl::new()).await.unwrap() else {
            panic!("expected a completed measurement");
        };
        assert_eq!(payload["success"], false);
        assert!(payload.contains_key("error"));
    }
}
