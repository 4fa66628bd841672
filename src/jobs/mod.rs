//! Schedulable units of work.
//!
//! A [`Job`] is one descriptor plus an executable body: a single
//! [`Measurement`] or a parallel/sequential composite of child jobs.

pub mod catalog;
mod composite;
pub mod descriptor;
pub mod result;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::resources::NetworkClass;

pub use self::catalog::MeasurementCatalog;
pub use self::descriptor::{
    DescriptorLimits, JobDescriptor, JobId, JobRequest, PriorityClass, Repeat, INVALID_PRIORITY,
    LOCAL_PARAM_PREFIX, SERVER_SUBMITTER, USER_PRIORITY,
};
pub use self::result::{ContextSample, MeasurementResult, Outcome, Payload};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("descriptor has no measurement type")]
    MissingType,
    #[error("unknown measurement type '{0}'")]
    UnknownType(String),
    #[error("invalid parameter '{key}': {reason}")]
    InvalidParameter { key: String, reason: String },
    #[error("composite job '{0}' has no children")]
    EmptyComposite(String),
    #[error("{kind} measurement failed: {message}")]
    Execution { kind: String, message: String },
    #[error("child job crashed: {0}")]
    ChildCrashed(String),
    #[error("time arithmetic overflow")]
    TimeOverflow,
}

// ---------------------------------------------------------------------------
// Measurement contract
// ---------------------------------------------------------------------------

/// How a measurement run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    Done(Payload),
    /// Stopped at a checkpoint; the next run resumes from it.
    Paused(Payload),
    /// Stopped on request; payload holds whatever was collected.
    Stopped(Payload),
}

/// One atomic measurement (ping, DNS lookup, ...).
///
/// Implementations must check [`JobControl`] at safe points and return
/// [`Progress::Stopped`] or [`Progress::Paused`] instead of erroring.
#[async_trait::async_trait]
pub trait Measurement: Send + Sync {
    fn kind(&self) -> &str;

    /// Declared run time, used for preemption and composite timeouts.
    fn estimated_duration(&self) -> Duration;

    fn supports_pause(&self) -> bool {
        false
    }

    fn can_stop(&self) -> bool {
        true
    }

    /// Bytes sent and received so far.
    fn bytes_consumed(&self) -> u64 {
        0
    }

    /// Expected bytes for one run, checked against the data budget.
    fn estimated_bytes(&self) -> u64 {
        0
    }

    /// Network class this measurement must run on, if any.
    fn required_network(&self) -> Option<NetworkClass> {
        None
    }

    fn long_running(&self) -> bool {
        false
    }

    /// A fresh instance with the same parameters and no progress.
    fn renew(&self) -> Arc<dyn Measurement>;

    async fn run(&self, control: &JobControl) -> anyhow::Result<Progress>;
}

// ---------------------------------------------------------------------------
// JobControl
// ---------------------------------------------------------------------------

/// Cooperative stop/pause signals for one dispatch of a job.
#[derive(Debug, Clone, Default)]
pub struct JobControl {
    stop: CancellationToken,
    pause: CancellationToken,
}

impl JobControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Control for a child job; parent signals propagate down.
    pub fn child(&self) -> Self {
        Self {
            stop: self.stop.child_token(),
            pause: self.pause.child_token(),
        }
    }

    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    pub fn request_pause(&self) {
        self.pause.cancel();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn pause_requested(&self) -> bool {
        self.pause.is_cancelled()
    }

    /// Resolves once a stop is requested.
    pub async fn stopped(&self) {
        self.stop.cancelled().await
    }

    /// Resolves once a pause is requested.
    pub async fn paused(&self) {
        self.pause.cancelled().await
    }
}

/// Timeouts for composite children.
#[derive(Debug, Clone, Copy)]
pub struct CompositeLimits {
    pub default_timeout: Duration,
    pub stop_grace: Duration,
}

impl From<&SchedulerConfig> for CompositeLimits {
    fn from(cfg: &SchedulerConfig) -> Self {
        Self {
            default_timeout: Duration::from_secs(cfg.composite_timeout_sec),
            stop_grace: Duration::from_secs(cfg.stop_grace_sec),
        }
    }
}

impl Default for CompositeLimits {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Atomic,
    Parallel,
    Sequential,
}

#[derive(Clone)]
enum Body {
    Atomic(Arc<dyn Measurement>),
    Parallel(Vec<Job>),
    Sequential {
        children: Vec<Job>,
        current: Arc<Mutex<Option<usize>>>,
    },
}

/// A schedulable job.
///
/// `Clone` is shallow: clones share measurement state, which is what a
/// paused job needs when it goes back on the queue. Recurrences use
/// [`Job::renewed`], which renews every measurement.
#[derive(Clone)]
pub struct Job {
    id: JobId,
    descriptor: JobDescriptor,
    body: Body,
    total_running: chrono::Duration,
    successor_queued: bool,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("kind", &self.descriptor.kind)
            .field("variant", &self.variant())
            .field("start_time", &self.descriptor.start_time)
            .field("priority", &self.descriptor.priority)
            .finish()
    }
}

impl Job {
    pub fn atomic(descriptor: JobDescriptor, measurement: Arc<dyn Measurement>) -> Self {
        Self {
            id: descriptor.job_id(),
            descriptor,
            body: Body::Atomic(measurement),
            total_running: chrono::Duration::zero(),
            successor_queued: false,
        }
    }

    pub fn parallel(descriptor: JobDescriptor, children: Vec<Job>) -> Self {
        Self {
            id: descriptor.job_id(),
            descriptor,
            body: Body::Parallel(children),
            total_running: chrono::Duration::zero(),
            successor_queued: false,
        }
    }

    pub fn sequential(descriptor: JobDescriptor, children: Vec<Job>) -> Self {
        Self {
            id: descriptor.job_id(),
            descriptor,
            body: Body::Sequential {
                children,
                current: Arc::new(Mutex::new(None)),
            },
            total_running: chrono::Duration::zero(),
            successor_queued: false,
        }
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn descriptor(&self) -> &JobDescriptor {
        &self.descriptor
    }

    pub fn kind(&self) -> &str {
        &self.descriptor.kind
    }

    pub fn priority(&self) -> i32 {
        self.descriptor.priority
    }

    pub fn class(&self) -> PriorityClass {
        self.descriptor.class()
    }

    pub fn variant(&self) -> Variant {
        match self.body {
            Body::Atomic(_) => Variant::Atomic,
            Body::Parallel(_) => Variant::Parallel,
            Body::Sequential { .. } => Variant::Sequential,
        }
    }

    pub fn children(&self) -> &[Job] {
        match &self.body {
            Body::Atomic(_) => &[],
            Body::Parallel(children) | Body::Sequential { children, .. } => children.as_slice(),
        }
    }

    /// Declared duration: parallel takes the longest child, sequential the sum.
    pub fn duration(&self) -> Duration {
        match &self.body {
            Body::Atomic(m) => m.estimated_duration(),
            Body::Parallel(children) => children
                .iter()
                .map(Job::duration)
                .max()
                .unwrap_or_default(),
            Body::Sequential { children, .. } => children.iter().map(Job::duration).sum(),
        }
    }

    pub fn bytes_consumed(&self) -> u64 {
        match &self.body {
            Body::Atomic(m) => m.bytes_consumed(),
            _ => self.children().iter().map(Job::bytes_consumed).sum(),
        }
    }

    pub fn estimated_bytes(&self) -> u64 {
        match &self.body {
            Body::Atomic(m) => m.estimated_bytes(),
            _ => self.children().iter().map(Job::estimated_bytes).sum(),
        }
    }

    /// A `network` parameter overrides what the measurement declares.
    pub fn required_network(&self) -> Option<NetworkClass> {
        if let Some(raw) = self.descriptor.param("network") {
            return raw.parse().ok();
        }
        match &self.body {
            Body::Atomic(m) => m.required_network(),
            _ => self.children().iter().find_map(Job::required_network),
        }
    }

    pub fn long_running(&self) -> bool {
        match &self.body {
            Body::Atomic(m) => m.long_running(),
            _ => true,
        }
    }

    pub fn supports_pause(&self) -> bool {
        match &self.body {
            Body::Atomic(m) => m.supports_pause(),
            _ => false,
        }
    }

    /// Whether a stop request would currently be honored.
    pub fn can_stop(&self) -> bool {
        match &self.body {
            Body::Atomic(m) => m.can_stop(),
            Body::Parallel(children) => children.iter().all(Job::can_stop),
            Body::Sequential { children, current } => {
                let index = *current.lock().unwrap_or_else(|e| e.into_inner());
                match index.and_then(|i| children.get(i)) {
                    Some(child) => child.can_stop(),
                    None => true,
                }
            }
        }
    }

    /// Ask the job to stop. Returns `false` if the request is rejected.
    pub fn request_stop(&self, control: &JobControl) -> bool {
        if !self.can_stop() {
            return false;
        }
        control.request_stop();
        true
    }

    /// Ask the job to pause at its next checkpoint. Only pausable jobs agree.
    pub fn request_pause(&self, control: &JobControl) -> bool {
        if !self.supports_pause() {
            return false;
        }
        control.request_pause();
        true
    }

    pub fn total_running_time(&self) -> chrono::Duration {
        self.total_running
    }

    pub fn add_running_time(&mut self, elapsed: chrono::Duration) {
        self.total_running += elapsed;
    }

    /// Whether this occurrence's recurrence has already been decided. A
    /// paused or restarted occurrence keeps the flag so requeuing it does
    /// not start a second lineage.
    pub fn successor_queued(&self) -> bool {
        self.successor_queued
    }

    pub fn mark_successor_queued(&mut self) {
        self.successor_queued = true;
    }

    /// Deep copy onto `descriptor`, keeping this job's id.
    pub fn renewed(&self, descriptor: JobDescriptor) -> Job {
        let body = match &self.body {
            Body::Atomic(m) => Body::Atomic(m.renew()),
            Body::Parallel(children) => Body::Parallel(renew_children(children, &descriptor)),
            Body::Sequential { children, .. } => Body::Sequential {
                children: renew_children(children, &descriptor),
                current: Arc::new(Mutex::new(None)),
            },
        };
        Job {
            id: self.id.clone(),
            descriptor,
            body,
            total_running: chrono::Duration::zero(),
            successor_queued: false,
        }
    }

    /// Run the job to completion, producing results in child order.
    ///
    /// A measurement error is returned as `Err`; the caller decides whether
    /// it becomes a failed result or aborts an enclosing composite.
    pub fn execute<'a>(
        &'a self,
        control: &'a JobControl,
        limits: &'a CompositeLimits,
    ) -> BoxFuture<'a, Result<Vec<MeasurementResult>, JobError>> {
        async move {
            match &self.body {
                Body::Atomic(m) => {
                    let progress = m.run(control).await.map_err(|e| JobError::Execution {
                        kind: self.descriptor.kind.clone(),
                        message: format!("{:#}", e),
                    })?;
                    Ok(vec![self.result_for(progress)])
                }
                Body::Parallel(children) => {
                    composite::run_parallel(children, self.duration(), control, limits).await
                }
                Body::Sequential { children, current } => {
                    composite::run_sequential(children, current, control, limits).await
                }
            }
        }
        .boxed()
    }

    fn result_for(&self, progress: Progress) -> MeasurementResult {
        let (outcome, payload) = match progress {
            Progress::Done(p) => (Outcome::Completed, p),
            Progress::Paused(p) => (Outcome::Paused, p),
            Progress::Stopped(p) => (Outcome::Cancelled, p),
        };
        let mut result = MeasurementResult::new(self.id.clone(), &self.descriptor, outcome);
        result.payload = payload;
        if outcome == Outcome::Cancelled {
            result.error = Some(result::CANCELLED_MARKER.to_string());
        }
        result
    }
}

/// Children of a recurrence follow the parent's new start time.
fn renew_children(children: &[Job], parent: &JobDescriptor) -> Vec<Job> {
    children
        .iter()
        .map(|child| {
            let descriptor = JobDescriptor {
                start_time: parent.start_time,
                end_time: parent.end_time,
                ..child.descriptor.clone()
            };
            child.renewed(descriptor)
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable measurements for scheduler and composite tests.

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// What a [`FakeMeasurement`] does when run.
    #[derive(Debug, Clone)]
    pub enum Script {
        /// Complete after the delay (stop requests end it early).
        Sleep(Duration),
        /// Return an execution error.
        Fail(String),
        /// Ignore stop requests and sleep the full delay.
        Stubborn(Duration),
    }

    pub struct FakeMeasurement {
        pub kind: String,
        pub script: Script,
        pub declared: Duration,
        pub pausable: bool,
        /// Time between a pause request and the checkpoint being written.
        pub wind_down: Duration,
        /// Bytes reported as consumed by each run.
        pub bytes: u64,
        pub runs: Arc<AtomicUsize>,
        /// Runs in progress right now, shared across renewals.
        pub active: Arc<AtomicUsize>,
        /// Highest value `active` ever reached.
        pub peak: Arc<AtomicUsize>,
    }

    impl FakeMeasurement {
        pub fn plain(kind: &str, script: Script, declared: Duration) -> Self {
            Self {
                kind: kind.to_string(),
                script,
                declared,
                pausable: false,
                wind_down: Duration::ZERO,
                bytes: 0,
                runs: Arc::new(AtomicUsize::new(0)),
                active: Arc::new(AtomicUsize::new(0)),
                peak: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub fn new(kind: &str, script: Script, declared: Duration) -> Arc<Self> {
            Arc::new(Self::plain(kind, script, declared))
        }
    }

    /// Decrements the active count however the run ends, aborts included.
    struct ActiveRun(Arc<AtomicUsize>);

    impl Drop for ActiveRun {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl Measurement for FakeMeasurement {
        fn kind(&self) -> &str {
            &self.kind
        }

        fn estimated_duration(&self) -> Duration {
            self.declared
        }

        fn supports_pause(&self) -> bool {
            self.pausable
        }

        fn can_stop(&self) -> bool {
            !matches!(self.script, Script::Stubborn(_))
        }

        fn bytes_consumed(&self) -> u64 {
            self.bytes
        }

        fn estimated_bytes(&self) -> u64 {
            self.bytes
        }

        fn renew(&self) -> Arc<dyn Measurement> {
            Arc::new(FakeMeasurement {
                kind: self.kind.clone(),
                script: self.script.clone(),
                declared: self.declared,
                pausable: self.pausable,
                wind_down: self.wind_down,
                bytes: self.bytes,
                runs: self.runs.clone(),
                active: self.active.clone(),
                peak: self.peak.clone(),
            })
        }

        async fn run(&self, control: &JobControl) -> anyhow::Result<Progress> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now_active, Ordering::SeqCst);
            let _active = ActiveRun(self.active.clone());

            let mut payload = Payload::new();
            payload.insert("kind".to_string(), self.kind.clone().into());
            match &self.script {
                Script::Sleep(d) => {
                    tokio::select! {
                        _ = tokio::time::sleep(*d) => Ok(Progress::Done(payload)),
                        _ = control.stopped() => Ok(Progress::Stopped(payload)),
                        _ = control.paused(), if self.pausable => {
                            tokio::time::sleep(self.wind_down).await;
                            Ok(Progress::Paused(payload))
                        }
                    }
                }
                Script::Stubborn(d) => {
                    tokio::time::sleep(*d).await;
                    Ok(Progress::Done(payload))
                }
                Script::Fail(msg) => Err(anyhow::anyhow!("{}", msg)),
            }
        }
    }

    pub fn descriptor(kind: &str) -> JobDescriptor {
        JobDescriptor::from_request(
            JobRequest::new(kind),
            "client-a",
            chrono::Utc::now(),
            &DescriptorLimits::default(),
        )
        .unwrap()
    }

    pub fn atomic(kind: &str, script: Script, declared: Duration) -> Job {
        Job::atomic(
            descriptor(kind),
            FakeMeasurement::new(kind, script, declared),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[tokio::test]
    async fn test_atomic_completes() {
        let job = atomic("ping", Script::Sleep(Duration::from_millis(5)), Duration::from_secs(1));
        let results = job
            .execute(&JobControl::new(), &CompositeLimits::default())
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].outcome, Outcome::Completed);
        assert_eq!(&results[0].job_id, job.id());
    }

    #[tokio::test]
    async fn test_atomic_stop_yields_cancelled() {
        let job = atomic("ping", Script::Sleep(Duration::from_secs(30)), Duration::from_secs(1));
        let control = JobControl::new();
        assert!(job.request_stop(&control));
        let results = job
            .execute(&control, &CompositeLimits::default())
            .await
            .unwrap();
        assert_eq!(results[0].outcome, Outcome::Cancelled);
    }

    #[tokio::test]
    async fn test_atomic_error_propagates() {
        let job = atomic("dns_lookup", Script::Fail("boom".into()), Duration::from_secs(1));
        let err = job
            .execute(&JobControl::new(), &CompositeLimits::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_pause_only_for_pausable() {
        let job = atomic("ping", Script::Sleep(Duration::ZERO), Duration::ZERO);
        let control = JobControl::new();
        assert!(!job.request_pause(&control));
        assert!(!control.pause_requested());
    }

    #[test]
    fn test_stubborn_job_refuses_stop() {
        let job = atomic("tcp_throughput", Script::Stubborn(Duration::ZERO), Duration::ZERO);
        let control = JobControl::new();
        assert!(!job.request_stop(&control));
        assert!(!control.stop_requested());
    }

    #[test]
    fn test_composite_duration() {
        let a = atomic("ping", Script::Sleep(Duration::ZERO), Duration::from_secs(3));
        let b = atomic("dns_lookup", Script::Sleep(Duration::ZERO), Duration::from_secs(5));
        let par = Job::parallel(descriptor("parallel"), vec![a.clone(), b.clone()]);
        let seq = Job::sequential(descriptor("sequential"), vec![a, b]);
        assert_eq!(par.duration(), Duration::from_secs(5));
        assert_eq!(seq.duration(), Duration::from_secs(8));
        assert!(par.long_running());
    }

    #[test]
    fn test_renewed_keeps_id_and_resets_successor() {
        let mut job = atomic("ping", Script::Sleep(Duration::ZERO), Duration::ZERO);
        job.mark_successor_queued();
        let next = job
            .descriptor()
            .next_occurrence()
            .unwrap()
            .map(|d| job.renewed(d));
        assert!(next.is_none());

        let mut d = job.descriptor().clone();
        d.count = Repeat::Times(2);
        d.interval_seconds = 60;
        let renewed = job.renewed(d);
        assert_eq!(renewed.id(), job.id());
        assert!(!renewed.successor_queued());
        // a paused copy shares the flag
        assert!(job.clone().successor_queued());
    }
}
