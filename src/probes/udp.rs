//! UDP burst: loss, reordering and jitter against an echo server.
//!
//! Each datagram starts with a fixed header (sequence number, burst size,
//! send timestamp in microseconds); the server echoes it back unchanged.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::{Buf, BufMut, BytesMut};
use serde_json::Value;
use tokio::net::UdpSocket;

use super::{bounded_param, rtt_summary, seconds_param};
use crate::jobs::{JobControl, JobDescriptor, JobError, Measurement, Payload, Progress};

pub const KIND: &str = "udp_burst";

const HEADER_LEN: usize = 16;
const IP_UDP_OVERHEAD: u64 = 28;

#[derive(Debug, Clone)]
struct UdpParams {
    server: String,
    packets: u32,
    packet_size: u32,
    timeout: Duration,
}

pub struct UdpBurstMeasurement {
    params: UdpParams,
    bytes: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BurstHeader {
    seq: u32,
    burst: u32,
    sent_us: u64,
}

impl BurstHeader {
    fn encode(&self, size: usize) -> BytesMut {
        let mut buf = BytesMut::with_capacity(size.max(HEADER_LEN));
        buf.put_u32(self.seq);
        buf.put_u32(self.burst);
        buf.put_u64(self.sent_us);
        buf.resize(size.max(HEADER_LEN), 0);
        buf
    }

    fn decode(mut data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_LEN {
            return None;
        }
        Some(Self {
            seq: data.get_u32(),
            burst: data.get_u32(),
            sent_us: data.get_u64(),
        })
    }
}

/// Loss, reordering and jitter over the echoed sequence.
#[derive(Debug, Default, PartialEq)]
struct BurstStats {
    received: u32,
    out_of_order: u32,
    duplicates: u32,
    jitter_ms: f64,
}

fn analyze(arrivals: &[(u32, f64)], burst: u32) -> BurstStats {
    let mut seen = vec![false; burst as usize];
    let mut stats = BurstStats::default();
    let mut highest: Option<u32> = None;
    let mut prev_rtt: Option<f64> = None;
    let mut jitter_sum = 0.0;
    let mut jitter_n = 0u32;

    for &(seq, rtt) in arrivals {
        let Some(slot) = seen.get_mut(seq as usize) else {
            continue;
        };
        if *slot {
            stats.duplicates += 1;
            continue;
        }
        *slot = true;
        stats.received += 1;
        match highest {
            Some(h) if seq < h => stats.out_of_order += 1,
            _ => highest = Some(seq),
        }
        if let Some(prev) = prev_rtt {
            jitter_sum += (rtt - prev).abs();
            jitter_n += 1;
        }
        prev_rtt = Some(rtt);
    }
    if jitter_n > 0 {
        stats.jitter_ms = jitter_sum / jitter_n as f64;
    }
    stats
}

impl UdpBurstMeasurement {
    pub fn from_descriptor(d: &JobDescriptor) -> Result<Self, JobError> {
        let server = d.require_param("server")?.trim().to_string();
        if !server.contains(':') {
            return Err(JobError::InvalidParameter {
                key: "server".to_string(),
                reason: "expected host:port".to_string(),
            });
        }
        Ok(Self::new(UdpParams {
            server,
            packets: bounded_param(d, "packets", 16, 1..=1000)?,
            packet_size: bounded_param(d, "packet_size", 100, HEADER_LEN as u32..=1472)?,
            timeout: seconds_param(d, "timeout_sec", 3.0)?,
        }))
    }

    fn new(params: UdpParams) -> Self {
        Self {
            params,
            bytes: AtomicU64::new(0),
        }
    }

    fn per_packet(&self) -> u64 {
        self.params.packet_size as u64 + IP_UDP_OVERHEAD
    }
}

#[async_trait::async_trait]
impl Measurement for UdpBurstMeasurement {
    fn kind(&self) -> &str {
        KIND
    }

    fn estimated_duration(&self) -> Duration {
        self.params.timeout + Duration::from_millis(self.params.packets as u64)
    }

    fn bytes_consumed(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    fn estimated_bytes(&self) -> u64 {
        2 * self.params.packets as u64 * self.per_packet()
    }

    fn renew(&self) -> Arc<dyn Measurement> {
        Arc::new(Self::new(self.params.clone()))
    }

    async fn run(&self, control: &JobControl) -> Result<Progress> {
        let p = &self.params;
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("Failed to bind UDP socket")?;
        socket
            .connect(p.server.as_str())
            .await
            .with_context(|| format!("Failed to resolve {}", p.server))?;

        let epoch = Instant::now();
        for seq in 0..p.packets {
            let header = BurstHeader {
                seq,
                burst: p.packets,
                sent_us: epoch.elapsed().as_micros() as u64,
            };
            socket
                .send(&header.encode(p.packet_size as usize))
                .await
                .context("UDP send failed")?;
            self.bytes.fetch_add(self.per_packet(), Ordering::Relaxed);
        }

        let mut arrivals: Vec<(u32, f64)> = Vec::with_capacity(p.packets as usize);
        let mut buf = vec![0u8; p.packet_size as usize + 64];
        let deadline = tokio::time::Instant::now() + p.timeout;
        let mut stopped = false;
        while arrivals.len() < p.packets as usize {
            let received = tokio::select! {
                res = tokio::time::timeout_at(deadline, socket.recv(&mut buf)) => res,
                _ = control.stopped() => {
                    stopped = true;
                    break;
                }
            };
            match received {
                Ok(Ok(n)) => {
                    self.bytes.fetch_add(n as u64 + IP_UDP_OVERHEAD, Ordering::Relaxed);
                    if let Some(h) = BurstHeader::decode(&buf[..n]) {
                        let now_us = epoch.elapsed().as_micros() as u64;
                        let rtt_ms = now_us.saturating_sub(h.sent_us) as f64 / 1000.0;
                        arrivals.push((h.seq, rtt_ms));
                    }
                }
                // ICMP port unreachable surfaces as a recv error; keep waiting.
                Ok(Err(_)) => continue,
                Err(_) => break,
            }
        }

        let stats = analyze(&arrivals, p.packets);
        let mut payload = Payload::new();
        payload.insert("server".to_string(), Value::from(p.server.clone()));
        payload.insert("packets_sent".to_string(), Value::from(p.packets));
        payload.insert("packets_received".to_string(), Value::from(stats.received));
        payload.insert(
            "loss_ratio".to_string(),
            Value::from(1.0 - stats.received as f64 / p.packets as f64),
        );
        payload.insert("out_of_order".to_string(), Value::from(stats.out_of_order));
        payload.insert("duplicates".to_string(), Value::from(stats.duplicates));
        payload.insert("jitter_ms".to_string(), Value::from(stats.jitter_ms));
        let rtts: Vec<f64> = arrivals.iter().map(|(_, rtt)| *rtt).collect();
        rtt_summary(&mut payload, &rtts);

        if stopped {
            Ok(Progress::Stopped(payload))
        } else {
            Ok(Progress::Done(payload))
        }
    }
}
