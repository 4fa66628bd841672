use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, warn};

use super::{bounded_param, millis, rtt_summary, seconds_param, validate_target};
use crate::jobs::{JobControl, JobDescriptor, JobError, Measurement, Payload, Progress};

pub const KIND: &str = "ping";

const IP_ICMP_OVERHEAD: u64 = 28;

#[derive(Debug, Clone)]
struct PingParams {
    target: String,
    packets: u32,
    packet_size: u32,
    interval: Duration,
    timeout: Duration,
}

/// ICMP echo via the system `ping` binary.
pub struct PingMeasurement {
    params: PingParams,
    bytes: AtomicU64,
}

impl PingMeasurement {
    pub fn from_descriptor(d: &JobDescriptor) -> Result<Self, JobError> {
        let params = PingParams {
            target: validate_target(d.require_param("target")?)?,
            packets: bounded_param(d, "packets", 10, 1..=100)?,
            packet_size: bounded_param(d, "packet_size", 56, 16..=1472)?,
            interval: seconds_param(d, "interval_sec", 0.5)?,
            timeout: seconds_param(d, "timeout_sec", 2.0)?,
        };
        Ok(Self::new(params))
    }

    fn new(params: PingParams) -> Self {
        Self {
            params,
            bytes: AtomicU64::new(0),
        }
    }
}

#[async_trait::async_trait]
impl Measurement for PingMeasurement {
    fn kind(&self) -> &str {
        KIND
    }

    fn estimated_duration(&self) -> Duration {
        self.params.interval * self.params.packets + self.params.timeout
    }

    fn bytes_consumed(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    fn estimated_bytes(&self) -> u64 {
        2 * self.params.packets as u64 * (self.params.packet_size as u64 + IP_ICMP_OVERHEAD)
    }

    fn renew(&self) -> Arc<dyn Measurement> {
        Arc::new(Self::new(self.params.clone()))
    }

    async fn run(&self, control: &JobControl) -> Result<Progress> {
        let p = &self.params;
        let start = Instant::now();

        // -n: numeric output, -c: count, -s: payload size, -W: per-reply timeout
        let child = tokio::process::Command::new("ping")
            .arg("-n")
            .arg("-c")
            .arg(p.packets.to_string())
            .arg("-i")
            .arg(format!("{:.1}", p.interval.as_secs_f64()))
            .arg("-s")
            .arg(p.packet_size.to_string())
            .arg("-W")
            .arg(p.timeout.as_secs_f64().max(1.0).round().to_string())
            .arg(&p.target)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to execute ping")?;

        let output = tokio::select! {
            out = child.wait_with_output() => out.context("Failed to collect ping output")?,
            _ = control.stopped() => {
                debug!(host = %p.target, "ping stopped");
                return Ok(Progress::Stopped(Payload::new()));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let rtts = extract_rtts(&stdout);
        let (sent, received) = extract_counts(&stdout).unwrap_or((p.packets, rtts.len() as u32));
        if !output.status.success() && rtts.is_empty() {
            warn!(host = %p.target, "ping got no replies");
        }

        let per_packet = p.packet_size as u64 + IP_ICMP_OVERHEAD;
        self.bytes
            .store((sent as u64 + received as u64) * per_packet, Ordering::Relaxed);

        let mut payload = Payload::new();
        payload.insert("target".to_string(), Value::from(p.target.clone()));
        payload.insert("packets_sent".to_string(), Value::from(sent));
        payload.insert("packets_received".to_string(), Value::from(received));
        let loss = if sent == 0 {
            1.0
        } else {
            1.0 - received as f64 / sent as f64
        };
        payload.insert("packet_loss".to_string(), Value::from(loss));
        payload.insert("success".to_string(), Value::from(!rtts.is_empty()));
        payload.insert("elapsed_ms".to_string(), Value::from(millis(start.elapsed())));
        rtt_summary(&mut payload, &rtts);

        Ok(Progress::Done(payload))
    }
}

/// Every "time=12.3 ms" in the output.
fn extract_rtts(output: &str) -> Vec<f64> {
    output
        .lines()
        .filter_map(|line| {
            let pos = line.find("time=")?;
            let rest = &line[pos + 5..];
            let end = rest.find(|c: char| c == ' ' || c == 'm').unwrap_or(rest.len());
            rest[..end].parse::<f64>().ok()
        })
        .collect()
}

/// "10 packets transmitted, 9 received, ..." / "10 packets transmitted, 9 packets received"
fn extract_counts(output: &str) -> Option<(u32, u32)> {
    let line = output.lines().find(|l| l.contains("packets transmitted"))?;
    let mut numbers = line
        .split(',')
        .filter_map(|part| part.split_whitespace().next()?.parse::<u32>().ok());
    Some((numbers.next()?, numbers.next()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{DescriptorLimits, JobRequest};

    const LINUX_OUTPUT: &str = "PING 8.8.8.8 (8.8.8.8) 56(84) bytes of data.
64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=14.2 ms
64 bytes from 8.8.8.8: icmp_seq=2 ttl=117 time=15.8 ms
64 bytes from 8.8.8.8: icmp_seq=3 ttl=117 time=13.0 ms

--- 8.8.8.8 ping statistics ---
4 packets transmitted, 3 received, 25% packet loss, time 3004ms
rtt min/avg/max/mdev = 13.0/14.3/15.8/1.1 ms";

    const MAC_OUTPUT: &str = "PING 1.1.1.1 (1.1.1.1): 56 data bytes
64 bytes from 1.1.1.1: icmp_seq=0 ttl=57 time=9.512 ms

--- 1.1.1.1 ping statistics ---
1 packets transmitted, 1 packets received, 0.0% packet loss";

    #[test]
    fn test_extract_rtts() {
        assert_eq!(extract_rtts(LINUX_OUTPUT), vec![14.2, 15.8, 13.0]);
        assert_eq!(extract_rtts(MAC_OUTPUT), vec![9.512]);
        assert!(extract_rtts("Request timeout for icmp_seq 0").is_empty());
    }

    #[test]
    fn test_extract_counts() {
        assert_eq!(extract_counts(LINUX_OUTPUT), Some((4, 3)));
        assert_eq!(extract_counts(MAC_OUTPUT), Some((1, 1)));
        assert_eq!(extract_counts("garbage"), None);
    }

    #[test]
    fn test_parameters_bounded() {
        let d = JobDescriptor::from_request(
            JobRequest::new(KIND).param("target", "8.8.8.8").param("packets", "500"),
            "client-a",
            chrono::Utc::now(),
            &DescriptorLimits::default(),
        )
        .unwrap();
        assert!(PingMeasurement::from_descriptor(&d).is_err());
    }

    #[test]
    fn test_estimates() {
        let d = JobDescriptor::from_request(
            JobRequest::new(KIND).param("target", "8.8.8.8").param("packets", "4"),
            "client-a",
            chrono::Utc::now(),
            &DescriptorLimits::default(),
        )
        .unwrap();
        let m = PingMeasurement::from_descriptor(&d).unwrap();
        assert_eq!(m.estimated_duration(), Duration::from_secs(4));
        assert_eq!(m.estimated_bytes(), 2 * 4 * 84);
        assert!(!m.supports_pause());
    }
}
