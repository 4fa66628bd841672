//! TCP throughput against a measurement server.
//!
//! Downlink reads whatever the server streams for the test duration; uplink
//! writes a zero-filled buffer for the same duration. Throughput is sampled
//! every half second and reported in kbit/s.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::bounded_param;
use crate::jobs::{JobControl, JobDescriptor, JobError, Measurement, Payload, Progress};

pub const KIND: &str = "tcp_throughput";

const BUFFER_SIZE: usize = 16 * 1024;
const SAMPLE_PERIOD: Duration = Duration::from_millis(500);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
// Planning figure for the data budget: ~4 Mbit/s sustained.
const ESTIMATED_BYTES_PER_SEC: u64 = 500 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Down,
    Up,
}

#[derive(Debug, Clone)]
struct TcpParams {
    server: String,
    direction: Direction,
    duration: Duration,
}

pub struct TcpThroughputMeasurement {
    params: TcpParams,
    bytes: AtomicU64,
}

impl TcpThroughputMeasurement {
    pub fn from_descriptor(d: &JobDescriptor) -> Result<Self, JobError> {
        let server = d.require_param("server")?.trim().to_string();
        if !server.contains(':') {
            return Err(JobError::InvalidParameter {
                key: "server".to_string(),
                reason: "expected host:port".to_string(),
            });
        }
        let direction = match d.param("direction").unwrap_or("down") {
            "down" => Direction::Down,
            "up" => Direction::Up,
            other => {
                return Err(JobError::InvalidParameter {
                    key: "direction".to_string(),
                    reason: format!("'{}' is neither up nor down", other),
                })
            }
        };
        let duration = Duration::from_secs(bounded_param(d, "duration_sec", 15, 1..=120)? as u64);
        Ok(Self::new(TcpParams {
            server,
            direction,
            duration,
        }))
    }

    fn new(params: TcpParams) -> Self {
        Self {
            params,
            bytes: AtomicU64::new(0),
        }
    }

    async fn transfer(&self, stream: &mut TcpStream, control: &JobControl, samples: &mut Vec<f64>) -> Result<bool> {
        let mut buf = vec![0u8; BUFFER_SIZE];
        let start = Instant::now();
        let mut window_start = start;
        let mut window_bytes: u64 = 0;

        while start.elapsed() < self.params.duration {
            if control.stop_requested() {
                return Ok(false);
            }
            let moved = match self.params.direction {
                Direction::Down => {
                    let n = tokio::time::timeout(SAMPLE_PERIOD, stream.read(&mut buf)).await;
                    match n {
                        Ok(Ok(0)) => break,
                        Ok(Ok(n)) => n,
                        Ok(Err(e)) => return Err(e).context("TCP read failed"),
                        Err(_) => 0,
                    }
                }
                Direction::Up => {
                    stream.write_all(&buf).await.context("TCP write failed")?;
                    buf.len()
                }
            };
            window_bytes += moved as u64;
            self.bytes.fetch_add(moved as u64, Ordering::Relaxed);

            let window = window_start.elapsed();
            if window >= SAMPLE_PERIOD {
                samples.push(window_bytes as f64 * 8.0 / 1000.0 / window.as_secs_f64());
                window_start = Instant::now();
                window_bytes = 0;
            }
        }
        Ok(true)
    }
}

#[async_trait::async_trait]
impl Measurement for TcpThroughputMeasurement {
    fn kind(&self) -> &str {
        KIND
    }

    fn estimated_duration(&self) -> Duration {
        self.params.duration + CONNECT_TIMEOUT
    }

    fn bytes_consumed(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    fn estimated_bytes(&self) -> u64 {
        self.params.duration.as_secs() * ESTIMATED_BYTES_PER_SEC
    }

    fn long_running(&self) -> bool {
        true
    }

    fn renew(&self) -> Arc<dyn Measurement> {
        Arc::new(Self::new(self.params.clone()))
    }

    async fn run(&self, control: &JobControl) -> Result<Progress> {
        let connect = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(self.params.server.as_str()));
        let mut stream = tokio::select! {
            res = connect => match res {
                Ok(stream) => stream.with_context(|| format!("connect to {} failed", self.params.server))?,
                Err(_) => bail!("connect to {} timed out", self.params.server),
            },
            _ = control.stopped() => return Ok(Progress::Stopped(Payload::new())),
        };

        let mut samples = Vec::new();
        let finished = self.transfer(&mut stream, control, &mut samples).await?;
        let _ = stream.shutdown().await;
        debug!(server = %self.params.server, samples = samples.len(), "tcp transfer done");

        let mut payload = Payload::new();
        payload.insert("server".to_string(), Value::from(self.params.server.clone()));
        payload.insert(
            "direction".to_string(),
            Value::from(match self.params.direction {
                Direction::Down => "down",
                Direction::Up => "up",
            }),
        );
        payload.insert("total_bytes".to_string(), Value::from(self.bytes_consumed()));
        payload.insert(
            "tput_kbps".to_string(),
            Value::Array(samples.iter().map(|s| Value::from(*s)).collect()),
        );
        if !samples.is_empty() {
            let mut sorted = samples.clone();
            sorted.sort_by(|a, b| a.total_cmp(b));
            payload.insert("median_kbps".to_string(), Value::from(sorted[sorted.len() / 2]));
        }

        if finished {
            Ok(Progress::Done(payload))
        } else {
            Ok(Progress::Stopped(payload))
        }
    }
}
