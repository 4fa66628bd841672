//! Registry of measurement constructors keyed by type tag.

use std::collections::HashMap;
use std::sync::Arc;

use super::{Job, JobDescriptor, JobError, Measurement};
use crate::probes;

pub const PARALLEL: &str = "parallel";
pub const SEQUENTIAL: &str = "sequential";

type Builder = Arc<dyn Fn(&JobDescriptor) -> Result<Arc<dyn Measurement>, JobError> + Send + Sync>;

/// Turns descriptors into runnable jobs.
#[derive(Clone, Default)]
pub struct MeasurementCatalog {
    builders: HashMap<String, Builder>,
}

impl MeasurementCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Catalogue with every built-in probe registered.
    pub fn with_defaults() -> Self {
        let mut catalog = Self::empty();
        catalog.register(probes::ping::KIND, |d| Ok(Arc::new(probes::ping::PingMeasurement::from_descriptor(d)?)));
        catalog.register(probes::dns::KIND, |d| Ok(Arc::new(probes::dns::DnsMeasurement::from_descriptor(d)?)));
        catalog.register(probes::http::KIND, |d| Ok(Arc::new(probes::http::HttpMeasurement::from_descriptor(d)?)));
        catalog.register(probes::traceroute::KIND, |d| {
            Ok(Arc::new(probes::traceroute::TracerouteMeasurement::from_descriptor(d)?))
        });
        catalog.register(probes::tcp::KIND, |d| {
            Ok(Arc::new(probes::tcp::TcpThroughputMeasurement::from_descriptor(d)?))
        });
        catalog.register(probes::udp::KIND, |d| {
            Ok(Arc::new(probes::udp::UdpBurstMeasurement::from_descriptor(d)?))
        });
        catalog
    }

    pub fn register<F>(&mut self, kind: &str, builder: F)
    where
        F: Fn(&JobDescriptor) -> Result<Arc<dyn Measurement>, JobError> + Send + Sync + 'static,
    {
        self.builders.insert(kind.to_string(), Arc::new(builder));
    }

    pub fn knows(&self, kind: &str) -> bool {
        kind == PARALLEL || kind == SEQUENTIAL || self.builders.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.builders.keys().cloned().collect();
        kinds.push(PARALLEL.to_string());
        kinds.push(SEQUENTIAL.to_string());
        kinds.sort();
        kinds
    }

    /// Build a job, recursing into composite children.
    pub fn build(&self, descriptor: JobDescriptor) -> Result<Job, JobError> {
        match descriptor.kind.as_str() {
            PARALLEL | SEQUENTIAL => {
                if descriptor.children.is_empty() {
                    return Err(JobError::EmptyComposite(descriptor.kind.clone()));
                }
                let children = descriptor
                    .children
                    .iter()
                    .cloned()
                    .map(|child| self.build(child))
                    .collect::<Result<Vec<_>, _>>()?;
                if descriptor.kind == PARALLEL {
                    Ok(Job::parallel(descriptor, children))
                } else {
                    Ok(Job::sequential(descriptor, children))
                }
            }
            kind => {
                let builder = self
                    .builders
                    .get(kind)
                    .ok_or_else(|| JobError::UnknownType(kind.to_string()))?;
                let measurement = builder(&descriptor)?;
                Ok(Job::atomic(descriptor, measurement))
            }
        }
    }
}
