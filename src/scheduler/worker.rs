//! Execution wrapper around a dispatched job.
//!
//! Server-class jobs are gated by the resource guard before they start;
//! user-class jobs run unconditionally. While the job runs, the network
//! monitor is sampled on the job's context interval.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::jobs::{
    CompositeLimits, ContextSample, Job, JobControl, MeasurementResult, PriorityClass,
};
use crate::resources::{NetworkClass, NetworkMonitor, ResourceGuard};

pub(crate) const SKIP_BATTERY: &str = "battery below threshold";
pub(crate) const SKIP_DATA_LIMIT: &str = "cellular data limit reached";

pub(crate) struct WorkerContext {
    pub guard: Arc<dyn ResourceGuard>,
    pub network: Arc<dyn NetworkMonitor>,
    pub clock: Arc<dyn Clock>,
    pub limits: CompositeLimits,
}

impl WorkerContext {
    /// Why a server-class job may not start now, if it may not.
    fn admission_denied(&self, job: &Job, network: NetworkClass) -> Option<&'static str> {
        if job.class() != PriorityClass::Server {
            return None;
        }
        if !self.guard.can_schedule_experiment() {
            return Some(SKIP_BATTERY);
        }
        if network == NetworkClass::Metered
            && self.guard.is_over_data_limit(job.kind(), job.estimated_bytes())
        {
            return Some(SKIP_DATA_LIMIT);
        }
        None
    }

    fn sample(&self, previous: Option<NetworkClass>) -> ContextSample {
        let network = self.network.class();
        ContextSample {
            timestamp: self.clock.now(),
            network,
            signal_dbm: self.network.signal_dbm(),
            connectivity_changed: previous.is_some_and(|p| p != network),
        }
    }
}

/// Run `job` to completion and return its results. Never fails: execution
/// errors become a single `Failed` result.
pub(crate) async fn execute(job: Job, control: JobControl, ctx: Arc<WorkerContext>) -> Vec<MeasurementResult> {
    let network = ctx.network.class();
    if let Some(reason) = ctx.admission_denied(&job, network) {
        info!(job_id = %job.id(), kind = job.kind(), reason, "job skipped");
        return vec![MeasurementResult::skipped(job.id().clone(), job.descriptor(), reason)
            .with_timestamp(ctx.clock.now())];
    }

    let samples = Arc::new(Mutex::new(vec![ctx.sample(None)]));
    let period = Duration::from_secs(job.descriptor().context_interval_seconds.max(1));
    let sampler = tokio::spawn(sample_context(ctx.clone(), samples.clone(), period, network));

    debug!(job_id = %job.id(), kind = job.kind(), %network, "job started");
    let outcome = job.execute(&control, &ctx.limits).await;
    sampler.abort();

    let consumed = job.bytes_consumed();
    if network == NetworkClass::Metered || ctx.network.class() == NetworkClass::Metered {
        ctx.guard.update_data_usage(consumed);
    }

    let mut results = match outcome {
        Ok(results) => results,
        Err(e) => {
            warn!(job_id = %job.id(), kind = job.kind(), error = %e, "job failed");
            vec![MeasurementResult::failed(job.id().clone(), job.descriptor(), e.to_string())]
        }
    };

    let context = samples.lock().unwrap_or_else(|e| e.into_inner()).clone();
    let now = ctx.clock.now();
    for result in &mut results {
        result.timestamp = now;
        result.context = context.clone();
    }
    debug!(job_id = %job.id(), results = results.len(), bytes = consumed, "job done");
    results
}

async fn sample_context(
    ctx: Arc<WorkerContext>,
    samples: Arc<Mutex<Vec<ContextSample>>>,
    period: Duration,
    initial: NetworkClass,
) {
    let mut previous = initial;
    let mut ticker = tokio::time::interval(period);
    // first tick fires immediately; the initial sample is already taken
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let sample = ctx.sample(Some(previous));
        if sample.connectivity_changed {
            info!(from = %previous, to = %sample.network, "connectivity changed during job");
        }
        previous = sample.network;
        samples.lock().unwrap_or_else(|e| e.into_inner()).push(sample);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::ResourceConfig;
    use crate::jobs::testing::{atomic, descriptor, FakeMeasurement, Script};
    use crate::jobs::{JobDescriptor, Outcome, USER_PRIORITY};
    use crate::resources::{BatteryStatus, BudgetGuard, DataProfile, StaticBattery, StaticNetworkMonitor};

    const MB: u64 = 1024 * 1024;

    fn context(
        battery: Option<BatteryStatus>,
        network: NetworkClass,
        profile: DataProfile,
    ) -> (Arc<WorkerContext>, Arc<BudgetGuard>) {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let config = ResourceConfig {
            data_profile: profile,
            ..ResourceConfig::default()
        };
        let guard = Arc::new(BudgetGuard::new(
            &config,
            Arc::new(StaticBattery::new(battery)),
            clock.clone(),
        ));
        let ctx = Arc::new(WorkerContext {
            guard: guard.clone(),
            network: Arc::new(StaticNetworkMonitor::new(network)),
            clock,
            limits: CompositeLimits::default(),
        });
        (ctx, guard)
    }

    fn server_job() -> Job {
        let mut job = atomic("ping", Script::Sleep(Duration::from_millis(1)), Duration::from_secs(1));
        job = job.renewed(JobDescriptor {
            priority: 10,
            ..job.descriptor().clone()
        });
        job
    }

    fn server_job_using(bytes: u64) -> Job {
        let fake = FakeMeasurement {
            bytes,
            ..FakeMeasurement::plain("http_download", Script::Sleep(Duration::from_millis(1)), Duration::from_secs(1))
        };
        Job::atomic(
            JobDescriptor {
                priority: 10,
                ..descriptor("http_download")
            },
            Arc::new(fake),
        )
    }

    #[tokio::test]
    async fn test_server_job_skipped_on_low_battery() {
        let (ctx, _) = context(
            Some(BatteryStatus { percent: 10, charging: false }),
            NetworkClass::Wifi,
            DataProfile::Profile3,
        );
        let results = execute(server_job(), JobControl::new(), ctx).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].outcome, Outcome::Skipped);
        assert_eq!(results[0].payload["skip_reason"], SKIP_BATTERY);
    }

    #[tokio::test]
    async fn test_user_job_ignores_guard() {
        let (ctx, _) = context(
            Some(BatteryStatus { percent: 10, charging: false }),
            NetworkClass::Metered,
            DataProfile::Profile1,
        );
        let job = server_job();
        let user = job.renewed(JobDescriptor {
            priority: USER_PRIORITY,
            ..job.descriptor().clone()
        });
        let results = execute(user, JobControl::new(), ctx).await;
        assert_eq!(results[0].outcome, Outcome::Completed);
        assert!(!results[0].context.is_empty());
    }

    #[tokio::test]
    async fn test_failure_becomes_failed_result() {
        let (ctx, _) = context(None, NetworkClass::Wifi, DataProfile::Unlimited);
        let job = atomic("dns_lookup", Script::Fail("resolver exploded".into()), Duration::from_secs(1));
        let results = execute(job, JobControl::new(), ctx).await;
        assert_eq!(results[0].outcome, Outcome::Failed);
        assert!(results[0].error.as_deref().unwrap().contains("resolver exploded"));
    }

    #[tokio::test]
    async fn test_server_job_skipped_when_data_budget_spent() {
        let (ctx, guard) = context(None, NetworkClass::Metered, DataProfile::Profile1);
        guard.update_data_usage(60 * MB);
        let results = execute(server_job(), JobControl::new(), ctx).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].outcome, Outcome::Skipped);
        assert_eq!(results[0].payload["skip_reason"], SKIP_DATA_LIMIT);
    }

    #[tokio::test]
    async fn test_data_budget_ignored_off_cellular() {
        let (ctx, guard) = context(None, NetworkClass::Wifi, DataProfile::Profile1);
        guard.update_data_usage(60 * MB);
        let results = execute(server_job(), JobControl::new(), ctx).await;
        assert_eq!(results[0].outcome, Outcome::Completed);
        assert_eq!(guard.used_bytes(), 60 * MB);
    }

    #[tokio::test]
    async fn test_metered_run_charges_data_budget() {
        let (ctx, guard) = context(None, NetworkClass::Metered, DataProfile::Profile3);
        let results = execute(server_job_using(4096), JobControl::new(), ctx).await;
        assert_eq!(results[0].outcome, Outcome::Completed);
        assert_eq!(guard.used_bytes(), 4096);
    }

    #[tokio::test]
    async fn test_unmetered_run_leaves_data_budget() {
        let (ctx, guard) = context(None, NetworkClass::Wifi, DataProfile::Profile3);
        execute(server_job_using(4096), JobControl::new(), ctx).await;
        assert_eq!(guard.used_bytes(), 0);
    }
}
