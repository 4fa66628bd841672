//! The task scheduler.
//!
//! A single logical worker slot fed from two queues. Jobs enter the
//! [`MainQueue`] on submit, move to the [`ReadyQueue`] when due, and the
//! most urgent ready job is dispatched when the slot is free. A more urgent
//! submission can preempt the running job (pause, else stop, else leave it
//! alone).
//!
//! All queue, registry and pending-slot mutation happens under one mutex,
//! never held across an await. Execution runs on a spawned task that hands
//! its results back through a oneshot the control loop polls without
//! blocking. Timers are wall-clock deadlines slept on by [`Scheduler::run`].
//!
//! The control loop never fails: problems building recurrences or
//! reconciling workers are logged and the loop carries on.

mod ledger;
pub mod notify;
pub mod queue;
pub mod registry;
mod worker;

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::{CheckinConfig, Config, SchedulerConfig};
use crate::jobs::{
    CompositeLimits, DescriptorLimits, Job, JobControl, JobDescriptor, JobError, JobId, JobRequest,
    MeasurementCatalog, MeasurementResult, Outcome, INVALID_PRIORITY, SERVER_SUBMITTER,
    USER_PRIORITY,
};
use crate::resources::{DataProfile, NetworkClass, NetworkMonitor, ResourceGuard};

pub use self::ledger::ServerJobLedger;
pub use self::notify::{ClientEvent, ClientRegistry, Notifier};
pub use self::queue::{MainQueue, QueuedJob, ReadyQueue};
pub use self::registry::{JobRegistry, JobStatus};

/// Priority given to server jobs that arrive without a usable one.
pub const DEFAULT_SERVER_PRIORITY: i32 = 0;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    InvalidJob(#[from] JobError),
    #[error("job priority is unassigned")]
    InvalidPriority,
    #[error("submitter key '{0}' is reserved")]
    ReservedSubmitter(String),
}

/// Persists delivered results.
pub trait ResultSink: Send + Sync {
    fn store(&self, results: &[MeasurementResult]);
}

/// Everything the scheduler consumes from outside.
pub struct Collaborators {
    pub catalog: MeasurementCatalog,
    pub guard: Arc<dyn ResourceGuard>,
    pub network: Arc<dyn NetworkMonitor>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
    pub sink: Option<Arc<dyn ResultSink>>,
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunningJob {
    pub id: JobId,
    #[serde(rename = "type")]
    pub kind: String,
    pub priority: i32,
    pub started: DateTime<Utc>,
    pub dispatch: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerSnapshot {
    pub main: Vec<QueuedJob>,
    pub ready: Vec<QueuedJob>,
    pub running: Option<RunningJob>,
    pub next_wakeup: Option<DateTime<Utc>>,
}

impl SchedulerSnapshot {
    pub fn is_idle(&self) -> bool {
        self.main.is_empty() && self.ready.is_empty() && self.running.is_none()
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// The single worker slot.
struct Pending {
    dispatch: u64,
    job: Job,
    control: JobControl,
    started: DateTime<Utc>,
    results: oneshot::Receiver<Vec<MeasurementResult>>,
    abort: AbortHandle,
}

/// The task of a preempted dispatch, still winding down. Its job may not be
/// dispatched again until the task is gone.
struct Superseded {
    id: JobId,
    started: DateTime<Utc>,
    ceiling: chrono::Duration,
    exited: oneshot::Receiver<Vec<MeasurementResult>>,
    abort: AbortHandle,
}

/// Submitter notifications queued under the lock, sent after it is released.
enum Delivery {
    Status {
        owner: String,
        id: JobId,
        status: JobStatus,
    },
    Results {
        owner: String,
        id: JobId,
        results: Vec<MeasurementResult>,
    },
}

#[derive(Default)]
struct State {
    main: MainQueue,
    ready: ReadyQueue,
    registry: JobRegistry,
    ledger: ServerJobLedger,
    pending: Option<Pending>,
    superseded: Vec<Superseded>,
    wakeup: Option<DateTime<Utc>>,
    uploads: Vec<MeasurementResult>,
    outbox: Vec<Delivery>,
    dispatch_seq: u64,
}

/// Outcome of polling the worker slot.
enum Reap {
    Idle,
    Busy { overdue: bool },
    Done(Vec<MeasurementResult>),
    Crashed,
}

fn secs(s: i64) -> chrono::Duration {
    chrono::Duration::milliseconds(s.max(0).saturating_mul(1000))
}

fn std_to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}

fn later(at: DateTime<Utc>, by: chrono::Duration) -> DateTime<Utc> {
    at.checked_add_signed(by).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

struct Inner {
    cfg: SchedulerConfig,
    checkin: CheckinConfig,
    limits: DescriptorLimits,
    catalog: MeasurementCatalog,
    guard: Arc<dyn ResourceGuard>,
    network: Arc<dyn NetworkMonitor>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    sink: Option<Arc<dyn ResultSink>>,
    worker: Arc<worker::WorkerContext>,
    checkin_interval: watch::Sender<u64>,
    state: Mutex<State>,
    // serializes notification delivery so events keep their order
    flush: Mutex<()>,
    wake: Notify,
}

/// Handle to the scheduler. Cheap to clone; all clones share one state.
///
/// Must be used from within a tokio runtime: dispatch spawns tasks.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(config: &Config, parts: Collaborators) -> Self {
        let limits = DescriptorLimits::from(&config.scheduler);
        let worker = Arc::new(worker::WorkerContext {
            guard: parts.guard.clone(),
            network: parts.network.clone(),
            clock: parts.clock.clone(),
            limits: CompositeLimits::from(&config.scheduler),
        });
        let interval = config.checkin.clamp_interval(config.checkin.interval_sec);
        let (checkin_interval, _) = watch::channel(interval);

        Self {
            inner: Arc::new(Inner {
                cfg: config.scheduler.clone(),
                checkin: config.checkin.clone(),
                limits,
                catalog: parts.catalog,
                guard: parts.guard,
                network: parts.network,
                notifier: parts.notifier,
                clock: parts.clock,
                sink: parts.sink,
                worker,
                checkin_interval,
                state: Mutex::new(State::default()),
                flush: Mutex::new(()),
                wake: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    pub fn guard(&self) -> &Arc<dyn ResourceGuard> {
        &self.inner.guard
    }

    pub fn catalog(&self) -> &MeasurementCatalog {
        &self.inner.catalog
    }

    // -----------------------------------------------------------------------
    // Submit
    // -----------------------------------------------------------------------

    /// Admit a client job. Resubmitting a job that is still queued or
    /// running returns the existing id without admitting a duplicate.
    pub fn submit(&self, submitter: &str, request: JobRequest) -> Result<JobId, SchedulerError> {
        if submitter == SERVER_SUBMITTER {
            return Err(SchedulerError::ReservedSubmitter(submitter.to_string()));
        }
        let descriptor =
            JobDescriptor::from_request(request, submitter, self.now(), &self.inner.limits)?;
        if descriptor.priority == INVALID_PRIORITY {
            return Err(SchedulerError::InvalidPriority);
        }
        let job = self.inner.catalog.build(descriptor)?;
        Ok(self.admit(job))
    }

    /// Admit the server's catalogue. Infinite jobs whose lineage is already
    /// known only refresh the ledger. Returns how many jobs were admitted.
    pub fn submit_server_jobs(&self, requests: Vec<JobRequest>) -> usize {
        let now = self.now();
        let mut lineages = HashSet::new();
        let mut admitted = 0;

        for mut request in requests {
            if matches!(request.priority, None | Some(USER_PRIORITY) | Some(INVALID_PRIORITY)) {
                request.priority = Some(DEFAULT_SERVER_PRIORITY);
            }
            let kind = request.kind.clone();
            let job = match JobDescriptor::from_request(request, SERVER_SUBMITTER, now, &self.inner.limits)
                .and_then(|d| self.inner.catalog.build(d))
            {
                Ok(job) => job,
                Err(e) => {
                    warn!(kind = %kind, error = %e, "server job rejected");
                    continue;
                }
            };

            if job.descriptor().count.is_infinite() {
                lineages.insert(job.descriptor().signature());
                if !self.lock().ledger.observe(job.descriptor()) {
                    debug!(job_id = %job.id(), "known server lineage, end time refreshed");
                    continue;
                }
            }
            self.admit(job);
            admitted += 1;
        }

        let retired = self.lock().ledger.retain_only(&lineages);
        info!(admitted, retired, "server jobs merged");
        admitted
    }

    fn admit(&self, job: Job) -> JobId {
        let id = job.id().clone();
        {
            let mut st = self.lock();
            if st.registry.status(&id).is_active() {
                debug!(job_id = %id, "duplicate submission ignored");
                return id;
            }
            let submitter = job.descriptor().submitter.clone();
            st.registry.record(&id, &submitter);
            st.outbox.push(Delivery::Status {
                owner: submitter.clone(),
                id: id.clone(),
                status: JobStatus::Scheduled,
            });
            info!(
                job_id = %id,
                kind = job.kind(),
                submitter = %submitter,
                priority = job.priority(),
                start = %job.descriptor().start_time,
                "job admitted"
            );
            self.contest(&mut st, job);
        }
        self.flush();
        id
    }

    /// Place a new job against whatever currently holds the worker slot.
    fn contest(&self, st: &mut State, job: Job) {
        let now = self.now();
        let (conflict, finished) = match &st.pending {
            None => {
                st.main.push(job);
                self.tick_locked(st);
                return;
            }
            Some(p) => {
                let projected_end = p
                    .started
                    .checked_add_signed(std_to_chrono(p.job.duration()));
                let misses_deadline = match projected_end {
                    Some(end) => end > job.descriptor().end_time,
                    None => true,
                };
                (
                    job.priority() < p.job.priority() && misses_deadline,
                    p.abort.is_finished(),
                )
            }
        };

        if finished {
            st.main.push(job);
            if self.reconcile_locked(st) {
                self.tick_locked(st);
            } else {
                self.arm(st, later(now, chrono::Duration::milliseconds(self.inner.cfg.reconcile_delay_ms)));
            }
            return;
        }

        if conflict && self.preempt_running(st) {
            let due = job.descriptor().start_time;
            st.main.push(job);
            if due <= now {
                self.tick_locked(st);
            } else {
                self.arm(st, due);
            }
            return;
        }

        st.main.push(job);
        let Some((started, ceiling)) = st
            .pending
            .as_ref()
            .map(|p| (p.started, self.ceiling(&p.job)))
        else {
            self.tick_locked(st);
            return;
        };
        if now - started > ceiling {
            self.force_cancel(st, "run time ceiling exceeded");
            self.tick_locked(st);
        } else {
            self.arm(st, later(now, ceiling / 2));
        }
    }

    /// Pause, else stop, the running job. Returns `false` when it can be
    /// neither, leaving it running.
    fn preempt_running(&self, st: &mut State) -> bool {
        let Some(p) = st.pending.take() else {
            return false;
        };
        let now = self.now();
        let elapsed = now - p.started;

        if p.job.request_pause(&p.control) {
            info!(job_id = %p.job.id(), kind = p.job.kind(), "preempted, pausing");
            let mut job = self.supersede(st, p);
            job.add_running_time(elapsed);
            self.set_status(st, job.id(), JobStatus::Paused);
            st.main.push_at(job, now);
            return true;
        }

        if p.job.request_stop(&p.control) {
            info!(job_id = %p.job.id(), kind = p.job.kind(), "preempted, stopping");
            let job = self.supersede(st, p);
            let mut fresh = job.renewed(job.descriptor().clone());
            fresh.add_running_time(job.total_running_time() + elapsed);
            if job.successor_queued() {
                fresh.mark_successor_queued();
            }
            let result = MeasurementResult::new(job.id().clone(), job.descriptor(), Outcome::Rescheduled)
                .with_timestamp(now);
            self.set_status(st, fresh.id(), JobStatus::Scheduled);
            self.deliver(st, fresh.id(), vec![result]);
            st.main.push_at(fresh, now);
            return true;
        }

        debug!(job_id = %p.job.id(), "running job cannot be interrupted");
        st.pending = Some(p);
        false
    }

    /// Remember a preempted dispatch until its task has wound down. Its
    /// results are dropped.
    fn supersede(&self, st: &mut State, p: Pending) -> Job {
        st.superseded.push(Superseded {
            id: p.job.id().clone(),
            started: p.started,
            ceiling: self.ceiling(&p.job),
            exited: p.results,
            abort: p.abort,
        });
        p.job
    }

    /// Forget finished superseded tasks, abort overdue ones, and arm a
    /// wakeup for the earliest remaining ceiling.
    fn prune_superseded(&self, st: &mut State, now: DateTime<Utc>) {
        st.superseded.retain_mut(|s| {
            // the task resolves its channel before it reconciles
            if !matches!(s.exited.try_recv(), Err(TryRecvError::Empty)) || s.abort.is_finished() {
                return false;
            }
            if now - s.started > s.ceiling {
                warn!(job_id = %s.id, "superseded task overran its ceiling, aborting");
                s.abort.abort();
                return false;
            }
            true
        });
        if let Some(at) = st.superseded.iter().map(|s| later(s.started, s.ceiling)).min() {
            self.arm(st, at);
        }
    }

    fn winding_down(st: &State, id: &JobId) -> bool {
        st.superseded.iter().any(|s| &s.id == id)
    }

    // -----------------------------------------------------------------------
    // Tick
    // -----------------------------------------------------------------------

    /// Move due jobs to the ready queue and dispatch the most urgent one if
    /// the slot is free.
    pub fn tick(&self) {
        {
            let mut st = self.lock();
            self.tick_locked(&mut st);
        }
        self.flush();
    }

    fn tick_locked(&self, st: &mut State) {
        let now = self.now();
        let network = self.inner.network.class();
        self.prune_superseded(st, now);
        self.drain_due(st, now, network);

        if let Some(p) = &st.pending {
            let watchdog = later(p.started, self.ceiling(&p.job));
            self.arm(st, watchdog);
            return;
        }

        if !network.is_connected() {
            if !st.ready.is_empty() {
                debug!(ready = st.ready.len(), "no network, dispatch deferred");
            }
            self.arm(st, later(now, secs(self.inner.cfg.network_retry_sec)));
            return;
        }

        // jobs whose previous task is still winding down wait in the ready
        // queue; that task's exit ticks again
        let mut held = Vec::new();
        let mut dispatched = false;
        while let Some(mut job) = st.ready.pop() {
            if job.descriptor().deadline_passed(now) {
                info!(job_id = %job.id(), kind = job.kind(), end = %job.descriptor().end_time, "deadline passed before dispatch");
                let result = MeasurementResult::cancelled(job.id().clone(), job.descriptor())
                    .with_timestamp(now);
                self.set_status(st, job.id(), JobStatus::Cancelled);
                self.deliver(st, job.id(), vec![result]);
                continue;
            }
            if Self::winding_down(st, job.id()) {
                debug!(job_id = %job.id(), "previous run still winding down, holding");
                held.push(job);
                continue;
            }
            if !job.successor_queued() {
                if let Some(next) = self.next_recurrence(st, &job) {
                    debug!(job_id = %next.id(), start = %next.descriptor().start_time, "recurrence queued");
                    st.main.push(next);
                }
                job.mark_successor_queued();
            }
            self.dispatch(st, job, now);
            dispatched = true;
            break;
        }
        for job in held {
            st.ready.push(job, now);
        }
        if dispatched {
            return;
        }

        if let Some(due) = st.main.next_due() {
            self.arm(st, due);
        }
    }

    fn drain_due(&self, st: &mut State, now: DateTime<Utc>, network: NetworkClass) {
        let deferral = secs(self.inner.cfg.network_conflict_delay_sec.max(1));
        while let Some(job) = st.main.pop_due(now) {
            if let Some(required) = job.required_network() {
                if network.is_connected() && required != network {
                    debug!(job_id = %job.id(), %required, %network, "network conflict, deferring");
                    st.main.push_at(job, later(now, deferral));
                    continue;
                }
            }
            st.ready.push(job, now);
        }
    }

    fn next_recurrence(&self, st: &State, job: &Job) -> Option<Job> {
        let mut descriptor = job.descriptor().clone();
        if descriptor.is_server_job() && descriptor.count.is_infinite() {
            match st.ledger.end_time(&descriptor.signature()) {
                Some(end) => descriptor.end_time = end,
                None => {
                    info!(job_id = %job.id(), "server lineage retired, not recurring");
                    return None;
                }
            }
        }
        match descriptor.next_occurrence() {
            Ok(next) => next.map(|d| job.renewed(d)),
            Err(e) => {
                warn!(job_id = %job.id(), error = %e, "could not compute next occurrence");
                None
            }
        }
    }

    fn dispatch(&self, st: &mut State, job: Job, now: DateTime<Utc>) {
        st.dispatch_seq += 1;
        let dispatch = st.dispatch_seq;
        // a paused job is re-admitted before it resumes
        if st.registry.status(job.id()) == JobStatus::Paused {
            self.set_status(st, job.id(), JobStatus::Scheduled);
        }
        self.set_status(st, job.id(), JobStatus::Running);

        let control = JobControl::new();
        let (tx, rx) = oneshot::channel();
        let scheduler = self.clone();
        let task_job = job.clone();
        let task_control = control.clone();
        let ctx = self.inner.worker.clone();
        let handle = tokio::spawn(async move {
            let job_id = task_job.id().clone();
            let run = AssertUnwindSafe(worker::execute(task_job, task_control, ctx)).catch_unwind();
            match run.await {
                Ok(results) => {
                    let _ = tx.send(results);
                }
                Err(_) => {
                    error!(job_id = %job_id, "worker panicked");
                    drop(tx);
                }
            }
            scheduler.reconcile();
        });

        info!(job_id = %job.id(), kind = job.kind(), priority = job.priority(), dispatch, "job dispatched");
        let watchdog = later(now, self.ceiling(&job));
        st.pending = Some(Pending {
            dispatch,
            job,
            control,
            started: now,
            results: rx,
            abort: handle.abort_handle(),
        });
        self.arm(st, watchdog);
    }

    fn ceiling(&self, job: &Job) -> chrono::Duration {
        if job.long_running() {
            secs(self.inner.cfg.long_run_time_sec)
        } else {
            secs(self.inner.cfg.max_run_time_sec)
        }
    }

    // -----------------------------------------------------------------------
    // Reconcile
    // -----------------------------------------------------------------------

    /// Reap the worker slot if its job has finished, then tick. An idle
    /// slot also ticks while ready jobs wait on a superseded task.
    pub fn reconcile(&self) {
        {
            let mut st = self.lock();
            if self.reconcile_locked(&mut st) || (st.pending.is_none() && !st.ready.is_empty()) {
                self.tick_locked(&mut st);
            }
        }
        self.flush();
    }

    /// Returns `true` when the slot was freed.
    fn reconcile_locked(&self, st: &mut State) -> bool {
        let now = self.now();
        let reap = match st.pending.as_mut() {
            None => Reap::Idle,
            Some(p) => match p.results.try_recv() {
                Ok(results) => Reap::Done(results),
                Err(TryRecvError::Closed) => Reap::Crashed,
                Err(TryRecvError::Empty) => Reap::Busy {
                    overdue: now - p.started > self.ceiling(&p.job),
                },
            },
        };

        match reap {
            Reap::Idle | Reap::Busy { overdue: false } => false,
            Reap::Busy { overdue: true } => {
                self.force_cancel(st, "run time ceiling exceeded");
                true
            }
            Reap::Done(results) => {
                if let Some(p) = st.pending.take() {
                    self.finish(st, p, results);
                }
                true
            }
            Reap::Crashed => {
                if let Some(p) = st.pending.take() {
                    let failed = MeasurementResult::failed(p.job.id().clone(), p.job.descriptor(), "worker crashed")
                        .with_timestamp(now);
                    self.finish(st, p, vec![failed]);
                }
                true
            }
        }
    }

    fn finish(&self, st: &mut State, p: Pending, results: Vec<MeasurementResult>) {
        let now = self.now();
        let mut job = p.job;
        job.add_running_time(now - p.started);
        let id = job.id().clone();

        if results.iter().any(|r| r.outcome == Outcome::Paused) {
            self.set_status(st, &id, JobStatus::Paused);
            st.main.push_at(job.clone(), now);
        } else {
            let status = if self.has_queued(st, &id) {
                JobStatus::Scheduled
            } else {
                JobStatus::Finished
            };
            self.set_status(st, &id, status);
        }
        info!(
            job_id = %id,
            kind = job.kind(),
            dispatch = p.dispatch,
            results = results.len(),
            running_ms = job.total_running_time().num_milliseconds(),
            "job finished"
        );
        self.deliver(st, &id, results);
    }

    fn force_cancel(&self, st: &mut State, reason: &str) {
        let Some(p) = st.pending.take() else {
            return;
        };
        warn!(job_id = %p.job.id(), kind = p.job.kind(), reason, "force-cancelling running job");
        p.control.request_stop();
        p.abort.abort();

        let mut result = MeasurementResult::cancelled(p.job.id().clone(), p.job.descriptor())
            .with_timestamp(self.now());
        result
            .payload
            .insert("reason".to_string(), serde_json::Value::from(reason));
        let status = if self.has_queued(st, p.job.id()) {
            JobStatus::Scheduled
        } else {
            JobStatus::Cancelled
        };
        self.set_status(st, p.job.id(), status);
        self.deliver(st, p.job.id(), vec![result]);
    }

    fn has_queued(&self, st: &State, id: &JobId) -> bool {
        st.main.contains(id) || st.ready.contains(id)
    }

    // -----------------------------------------------------------------------
    // Cancel / status
    // -----------------------------------------------------------------------

    /// Cancel a job owned by `submitter`. Server jobs cannot be cancelled
    /// by clients. Returns whether anything was removed or stopped.
    pub fn cancel(&self, id: &JobId, submitter: &str) -> bool {
        let cancelled = {
            let mut st = self.lock();
            match st.registry.owner(id) {
                Some(owner) if owner == submitter && owner != SERVER_SUBMITTER => {}
                _ => {
                    debug!(job_id = %id, submitter, "cancel rejected");
                    return false;
                }
            }

            let removed = st.main.remove(id) + st.ready.remove(id);
            let mut stopped = false;
            if st.pending.as_ref().is_some_and(|p| p.job.id() == id) {
                if let Some(p) = st.pending.take() {
                    p.control.request_stop();
                    p.abort.abort();
                    stopped = true;
                }
            }
            if removed == 0 && !stopped {
                return false;
            }

            info!(job_id = %id, removed, stopped, "job cancelled");
            self.set_status(&mut st, id, JobStatus::Cancelled);
            if stopped {
                self.tick_locked(&mut st);
            }
            true
        };
        self.flush();
        cancelled
    }

    pub fn query_status(&self, id: &JobId) -> JobStatus {
        self.lock().registry.status(id)
    }

    pub fn owner(&self, id: &JobId) -> Option<String> {
        self.lock().registry.owner(id).map(str::to_string)
    }

    // -----------------------------------------------------------------------
    // Settings
    // -----------------------------------------------------------------------

    /// Loosening a setting needs `forced`, honored only with exactly one
    /// registered client.
    fn may_relax(&self, forced: bool) -> bool {
        forced && self.inner.notifier.client_count() == 1
    }

    pub fn set_battery_threshold(&self, forced: bool, percent: u8) -> u8 {
        let guard = &self.inner.guard;
        let current = guard.battery_threshold();
        let requested = percent.min(100);
        if requested >= current || self.may_relax(forced) {
            guard.set_battery_threshold(requested);
            info!(from = current, to = requested, "battery threshold updated");
            requested
        } else {
            debug!(current, requested, "battery threshold lowering rejected");
            current
        }
    }

    pub fn set_checkin_interval(&self, forced: bool, seconds: u64) -> u64 {
        let requested = self.inner.checkin.clamp_interval(seconds);
        let current = *self.inner.checkin_interval.borrow();
        if requested >= current || self.may_relax(forced) {
            self.inner.checkin_interval.send_replace(requested);
            info!(from = current, to = requested, "checkin interval updated");
            requested
        } else {
            debug!(current, requested, "checkin interval lowering rejected");
            current
        }
    }

    pub fn checkin_interval(&self) -> u64 {
        *self.inner.checkin_interval.borrow()
    }

    /// Watch the checkin interval; the checkin loop restarts its period on change.
    pub fn subscribe_checkin_interval(&self) -> watch::Receiver<u64> {
        self.inner.checkin_interval.subscribe()
    }

    pub fn set_data_usage_profile(&self, forced: bool, profile: DataProfile) -> DataProfile {
        let guard = &self.inner.guard;
        let current = guard.data_profile();
        if profile <= current || self.may_relax(forced) {
            guard.set_data_profile(profile);
            info!(from = %current, to = %profile, "data usage profile updated");
            profile
        } else {
            debug!(%current, requested = %profile, "data profile loosening rejected");
            current
        }
    }

    // -----------------------------------------------------------------------
    // Uploads, introspection
    // -----------------------------------------------------------------------

    pub fn take_uploads(&self) -> Vec<MeasurementResult> {
        std::mem::take(&mut self.lock().uploads)
    }

    /// Put back results whose upload failed, ahead of anything newer.
    pub fn restore_uploads(&self, mut results: Vec<MeasurementResult>) {
        let mut st = self.lock();
        results.append(&mut st.uploads);
        st.uploads = results;
    }

    pub fn is_running(&self) -> bool {
        self.lock().pending.is_some()
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        let st = self.lock();
        SchedulerSnapshot {
            main: st.main.snapshot(),
            ready: st.ready.snapshot(),
            running: st.pending.as_ref().map(|p| RunningJob {
                id: p.job.id().clone(),
                kind: p.job.kind().to_string(),
                priority: p.job.priority(),
                started: p.started,
                dispatch: p.dispatch,
            }),
            next_wakeup: st.wakeup,
        }
    }

    pub fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        self.lock().wakeup
    }

    // -----------------------------------------------------------------------
    // Timers and delivery
    // -----------------------------------------------------------------------

    /// Arm the one-shot timer; an earlier deadline always wins.
    fn arm(&self, st: &mut State, at: DateTime<Utc>) {
        if st.wakeup.map_or(true, |current| at < current) {
            st.wakeup = Some(at);
            self.inner.wake.notify_one();
        }
    }

    /// Timer callback: clear the fired deadline, reap, tick.
    pub fn on_timer(&self) {
        {
            let mut st = self.lock();
            let now = self.now();
            if st.wakeup.is_some_and(|at| at <= now) {
                st.wakeup = None;
            }
            self.reconcile_locked(&mut st);
            self.tick_locked(&mut st);
        }
        self.flush();
    }

    fn set_status(&self, st: &mut State, id: &JobId, status: JobStatus) {
        st.registry.set(id, status);
        if let Some(owner) = st.registry.owner(id) {
            let owner = owner.to_string();
            st.outbox.push(Delivery::Status {
                owner,
                id: id.clone(),
                status,
            });
        }
    }

    fn deliver(&self, st: &mut State, id: &JobId, results: Vec<MeasurementResult>) {
        st.uploads.extend(
            results
                .iter()
                .filter(|r| r.is_uploadable())
                .map(MeasurementResult::for_upload),
        );
        let owner = st
            .registry
            .owner(id)
            .unwrap_or(SERVER_SUBMITTER)
            .to_string();
        st.outbox.push(Delivery::Results {
            owner,
            id: id.clone(),
            results,
        });
    }

    fn flush(&self) {
        let _order = self.inner.flush.lock().unwrap_or_else(|e| e.into_inner());
        let outbox = std::mem::take(&mut self.lock().outbox);
        for delivery in outbox {
            match delivery {
                Delivery::Status { owner, id, status } => {
                    self.send(&owner, ClientEvent::StatusChanged { job_id: id, status });
                }
                Delivery::Results { owner, id, results } => {
                    if let Some(sink) = &self.inner.sink {
                        sink.store(&results);
                    }
                    self.send(&owner, ClientEvent::Results { job_id: id, results });
                }
            }
        }
    }

    fn send(&self, owner: &str, event: ClientEvent) {
        if owner == SERVER_SUBMITTER {
            self.inner.notifier.broadcast(event);
        } else {
            self.inner.notifier.notify(owner, event);
        }
    }

    // -----------------------------------------------------------------------
    // Driver
    // -----------------------------------------------------------------------

    /// Timer loop: sleeps until the armed deadline, wakes early when a new
    /// deadline is armed, exits on `shutdown` after stopping the running job.
    pub async fn run(self, shutdown: CancellationToken) {
        info!("scheduler driver started");
        self.tick();
        loop {
            let sleep_for = self
                .next_wakeup()
                .map(|at| (at - self.now()).to_std().unwrap_or(Duration::ZERO));

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = self.inner.wake.notified() => {}
                _ = tokio::time::sleep(sleep_for.unwrap_or(Duration::ZERO)), if sleep_for.is_some() => {
                    self.on_timer();
                }
            }
        }
        self.stop_running();
        info!("scheduler driver stopped");
    }

    /// Stop the running job without rescheduling it.
    pub fn stop_running(&self) {
        let mut st = self.lock();
        if let Some(p) = st.pending.take() {
            info!(job_id = %p.job.id(), "stopping running job");
            p.control.request_stop();
            p.abort.abort();
        }
        for s in st.superseded.drain(..) {
            s.abort.abort();
        }
    }
}
