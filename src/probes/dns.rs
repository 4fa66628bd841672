use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::Value;
use trust_dns_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

use super::{millis, seconds_param, validate_target};
use crate::jobs::{JobControl, JobDescriptor, JobError, Measurement, Payload, Progress};

pub const KIND: &str = "dns_lookup";

// Rough query + answer size for an A/AAAA lookup over UDP.
const LOOKUP_BYTES: u64 = 512;

#[derive(Debug, Clone)]
struct DnsParams {
    target: String,
    server: Option<IpAddr>,
    timeout: Duration,
}

/// Name resolution timing through trust-dns.
pub struct DnsMeasurement {
    params: DnsParams,
    bytes: AtomicU64,
}

impl DnsMeasurement {
    pub fn from_descriptor(d: &JobDescriptor) -> Result<Self, JobError> {
        let params = DnsParams {
            target: validate_target(d.require_param("target")?)?,
            server: d.parse_param::<IpAddr>("server")?,
            timeout: seconds_param(d, "timeout_sec", 5.0)?,
        };
        Ok(Self::new(params))
    }

    fn new(params: DnsParams) -> Self {
        Self {
            params,
            bytes: AtomicU64::new(0),
        }
    }

    fn resolver(&self) -> Result<TokioAsyncResolver> {
        let resolver = match self.params.server {
            Some(ip) => {
                let mut opts = ResolverOpts::default();
                opts.timeout = self.params.timeout;
                let group = NameServerConfigGroup::from_ips_clear(&[ip], 53, true);
                TokioAsyncResolver::tokio(ResolverConfig::from_parts(None, vec![], group), opts)
            }
            // Use system config (from /etc/resolv.conf)
            None => TokioAsyncResolver::tokio_from_system_conf()
                .context("Failed to create DNS resolver")?,
        };
        Ok(resolver)
    }
}

#[async_trait::async_trait]
impl Measurement for DnsMeasurement {
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
        LOOKUP_BYTES
    }

    fn renew(&self) -> Arc<dyn Measurement> {
        Arc::new(Self::new(self.params.clone()))
    }

    async fn run(&self, control: &JobControl) -> Result<Progress> {
        let resolver = self.resolver()?;
        let start = Instant::now();

        let lookup = tokio::select! {
            biased;
            _ = control.stopped() => return Ok(Progress::Stopped(Payload::new())),
            res = tokio::time::timeout(self.params.timeout, resolver.lookup_ip(self.params.target.as_str())) => res,
        };
        let elapsed = start.elapsed();
        self.bytes.store(LOOKUP_BYTES, Ordering::Relaxed);

        let mut payload = Payload::new();
        payload.insert("target".to_string(), Value::from(self.params.target.clone()));
        if let Some(server) = self.params.server {
            payload.insert("server".to_string(), Value::from(server.to_string()));
        }

        match lookup {
            Ok(Ok(answer)) => {
                let addresses: Vec<Value> =
                    answer.iter().map(|ip| Value::from(ip.to_string())).collect();
                payload.insert("success".to_string(), Value::from(!addresses.is_empty()));
                payload.insert("addresses".to_string(), Value::Array(addresses));
                payload.insert("time_ms".to_string(), Value::from(millis(elapsed)));
            }
            // NXDOMAIN and friends are a measured outcome, not a probe failure.
            Ok(Err(e)) => {
                payload.insert("success".to_string(), Value::from(false));
                payload.insert("error".to_string(), Value::from(e.to_string()));
                payload.insert("time_ms".to_string(), Value::from(millis(elapsed)));
            }
            Err(_) => {
                payload.insert("success".to_string(), Value::from(false));
                payload.insert("error".to_string(), Value::from("timeout"));
            }
        }
        Ok(Progress::Done(payload))
    }
}
