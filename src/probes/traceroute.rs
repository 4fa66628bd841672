//! Hop-by-hop path discovery with TTL-limited pings.
//!
//! Each hop is probed separately, so the measurement can pause between hops
//! and pick up at the next TTL when it runs again.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};

use super::{bounded_param, millis, seconds_param, validate_target};
use crate::jobs::{JobControl, JobDescriptor, JobError, Measurement, Payload, Progress};

pub const KIND: &str = "traceroute";

const PROBE_BYTES: u64 = 2 * 84;

#[derive(Debug, Clone)]
struct TraceParams {
    target: String,
    max_hops: u32,
    pings_per_hop: u32,
    hop_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HopRecord {
    pub ttl: u32,
    /// Responding router, `None` when every probe at this TTL timed out.
    pub address: Option<String>,
    pub rtt_ms: Option<f64>,
}

#[derive(Debug, Default)]
struct Checkpoint {
    next_ttl: u32,
    hops: Vec<HopRecord>,
}

pub struct TracerouteMeasurement {
    params: TraceParams,
    checkpoint: Mutex<Checkpoint>,
    bytes: AtomicU64,
}

impl TracerouteMeasurement {
    pub fn from_descriptor(d: &JobDescriptor) -> Result<Self, JobError> {
        let params = TraceParams {
            target: validate_target(d.require_param("target")?)?,
            max_hops: bounded_param(d, "max_hops", 30, 1..=64)?,
            pings_per_hop: bounded_param(d, "pings_per_hop", 1, 1..=10)?,
            hop_timeout: seconds_param(d, "timeout_sec", 1.0)?,
        };
        Ok(Self::new(params))
    }

    fn new(params: TraceParams) -> Self {
        Self {
            params,
            checkpoint: Mutex::new(Checkpoint {
                next_ttl: 1,
                hops: Vec::new(),
            }),
            bytes: AtomicU64::new(0),
        }
    }

    fn checkpoint(&self) -> std::sync::MutexGuard<'_, Checkpoint> {
        self.checkpoint.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn payload(&self, reached: bool) -> Payload {
        let hops = self.checkpoint().hops.clone();
        let mut payload = Payload::new();
        payload.insert("target".to_string(), Value::from(self.params.target.clone()));
        payload.insert("num_hops".to_string(), Value::from(hops.len() as u64));
        payload.insert("reached".to_string(), Value::from(reached));
        payload.insert(
            "hops".to_string(),
            serde_json::to_value(&hops).unwrap_or(Value::Null),
        );
        payload
    }

    async fn probe_hop(&self, ttl: u32) -> Result<(HopReply, Duration)> {
        let p = &self.params;
        let start = Instant::now();
        let output = tokio::process::Command::new("ping")
            .arg("-n")
            .arg("-c")
            .arg(p.pings_per_hop.to_string())
            .arg("-t")
            .arg(ttl.to_string())
            .arg("-W")
            .arg(p.hop_timeout.as_secs_f64().max(1.0).round().to_string())
            .arg(&p.target)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .context("Failed to execute ping")?;
        let elapsed = start.elapsed();
        self.bytes
            .fetch_add(PROBE_BYTES * p.pings_per_hop as u64, Ordering::Relaxed);
        Ok((parse_hop(&String::from_utf8_lossy(&output.stdout)), elapsed))
    }
}

#[async_trait::async_trait]
impl Measurement for TracerouteMeasurement {
    fn kind(&self) -> &str {
        KIND
    }

    fn estimated_duration(&self) -> Duration {
        self.params.hop_timeout * self.params.max_hops * self.params.pings_per_hop
    }

    fn supports_pause(&self) -> bool {
        true
    }

    fn bytes_consumed(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    fn estimated_bytes(&self) -> u64 {
        PROBE_BYTES * self.params.max_hops as u64 * self.params.pings_per_hop as u64
    }

    fn renew(&self) -> Arc<dyn Measurement> {
        Arc::new(Self::new(self.params.clone()))
    }

    async fn run(&self, control: &JobControl) -> Result<Progress> {
        let first_ttl = self.checkpoint().next_ttl;
        if first_ttl > 1 {
            info!(host = %self.params.target, ttl = first_ttl, "traceroute resuming");
        }

        for ttl in first_ttl..=self.params.max_hops {
            if control.stop_requested() {
                return Ok(Progress::Stopped(self.payload(false)));
            }
            if control.pause_requested() {
                debug!(host = %self.params.target, ttl, "traceroute paused");
                return Ok(Progress::Paused(self.payload(false)));
            }

            let probed = tokio::select! {
                res = self.probe_hop(ttl) => Some(res?),
                _ = control.stopped() => None,
            };
            let Some((reply, elapsed)) = probed else {
                return Ok(Progress::Stopped(self.payload(false)));
            };

            let rtt_ms = reply.rtt_ms.or_else(|| {
                reply
                    .address
                    .as_ref()
                    .map(|_| millis(elapsed) / self.params.pings_per_hop as f64)
            });
            {
                let mut cp = self.checkpoint();
                cp.hops.push(HopRecord {
                    ttl,
                    address: reply.address,
                    rtt_ms,
                });
                cp.next_ttl = ttl + 1;
            }

            if reply.reached {
                return Ok(Progress::Done(self.payload(true)));
            }
        }

        Ok(Progress::Done(self.payload(false)))
    }
}

#[derive(Debug, Default, PartialEq)]
struct HopReply {
    address: Option<String>,
    rtt_ms: Option<f64>,
    reached: bool,
}

/// Reads one TTL-limited ping run: either an echo reply from the target or
/// "Time to live exceeded" from an intermediate router.
fn parse_hop(output: &str) -> HopReply {
    let mut reply = HopReply::default();
    for line in output.lines() {
        let line = line.trim();
        // "From 10.0.0.1 icmp_seq=1 Time to live exceeded"
        // "92 bytes from 10.0.0.1: Time to live exceeded" (BSD)
        if line.contains("Time to live exceeded") || line.contains("time to live exceeded") {
            if reply.address.is_none() {
                reply.address = address_after(line, "From ").or_else(|| address_after(line, "from "));
            }
            continue;
        }
        // "64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=14.2 ms"
        if line.contains("bytes from") && line.contains("time=") {
            reply.reached = true;
            reply.address = address_after(line, "from ");
            reply.rtt_ms = line
                .split_whitespace()
                .find_map(|w| w.strip_prefix("time="))
                .and_then(|v| v.parse::<f64>().ok());
            break;
        }
    }
    reply
}

fn address_after(line: &str, marker: &str) -> Option<String> {
    let rest = &line[line.find(marker)? + marker.len()..];
    let word = rest.split_whitespace().next()?;
    let addr = word.trim_end_matches(':');
    (!addr.is_empty()).then(|| addr.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{DescriptorLimits, JobRequest};

    #[test]
    fn test_parse_intermediate_hop() {
        let out = "PING 8.8.8.8 (8.8.8.8) 56(84) bytes of data.
From 192.168.1.1 icmp_seq=1 Time to live exceeded

--- 8.8.8.8 ping statistics ---
1 packets transmitted, 0 received, +1 errors, 100% packet loss, time 0ms";
        let hop = parse_hop(out);
        assert_eq!(hop.address.as_deref(), Some("192.168.1.1"));
        assert!(!hop.reached);
        assert_eq!(hop.rtt_ms, None);
    }

    #[test]
    fn test_parse_destination_reached() {
        let out = "PING 8.8.8.8 (8.8.8.8) 56(84) bytes of data.
64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=14.2 ms";
        let hop = parse_hop(out);
        assert!(hop.reached);
        assert_eq!(hop.address.as_deref(), Some("8.8.8.8"));
        assert_eq!(hop.rtt_ms, Some(14.2));
    }

    #[test]
    fn test_parse_silent_hop() {
        assert_eq!(parse_hop("1 packets transmitted, 0 received"), HopReply::default());
    }

    fn measurement() -> TracerouteMeasurement {
        let d = JobDescriptor::from_request(
            JobRequest::new(KIND).param("target", "8.8.8.8").param("max_hops", "5"),
            "client-a",
            chrono::Utc::now(),
            &DescriptorLimits::default(),
        )
        .unwrap();
        TracerouteMeasurement::from_descriptor(&d).unwrap()
    }

    #[tokio::test]
    async fn test_pause_keeps_checkpoint() {
        let m = measurement();
        {
            let mut cp = m.checkpoint();
            cp.hops.push(HopRecord {
                ttl: 1,
                address: Some("192.168.1.1".to_string()),
                rtt_ms: Some(1.2),
            });
            cp.next_ttl = 2;
        }
        let control = JobControl::new();
        control.request_pause();
        let Progress::Paused(payload) = m.run(&control).await.unwrap() else {
            panic!("expected pause");
        };
        assert_eq!(payload["num_hops"], 1);
        assert_eq!(m.checkpoint().next_ttl, 2);

        let fresh = m.renew();
        assert!(fresh.supports_pause());
        assert_eq!(fresh.bytes_consumed(), 0);
    }

    #[tokio::test]
    async fn test_stop_before_first_hop() {
        let m = measurement();
        let control = JobControl::new();
        control.request_stop();
        assert!(matches!(m.run(&control).await.unwrap(), Progress::Stopped(_)));
    }
}
