//! End-to-end scheduler behavior through the public API: real driver task,
//! system clock, SQLite result sink.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use crowdprobe::clock::SystemClock;
use crowdprobe::config::Config;
use crowdprobe::jobs::{
    JobControl, JobRequest, Measurement, MeasurementCatalog, Outcome, Payload, Progress, Repeat,
    USER_PRIORITY,
};
use crowdprobe::resources::{BudgetGuard, NetworkClass, StaticBattery, StaticNetworkMonitor};
use crowdprobe::scheduler::{ClientEvent, ClientRegistry, Collaborators, JobStatus, Scheduler};
use crowdprobe::storage::{self, SqliteSink};
use tokio_util::sync::CancellationToken;

/// Completes after a short delay and counts its runs.
struct Echo {
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl Measurement for Echo {
    fn kind(&self) -> &str {
        "echo"
    }

    fn estimated_duration(&self) -> Duration {
        Duration::from_secs(1)
    }

    fn renew(&self) -> Arc<dyn Measurement> {
        Arc::new(Echo {
            runs: self.runs.clone(),
        })
    }

    async fn run(&self, control: &JobControl) -> anyhow::Result<Progress> {
        let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        let mut payload = Payload::new();
        payload.insert("run".to_string(), n.into());
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(20)) => Ok(Progress::Done(payload)),
            _ = control.stopped() => Ok(Progress::Stopped(payload)),
        }
    }
}

struct Fixture {
    scheduler: Scheduler,
    clients: Arc<ClientRegistry>,
    runs: Arc<AtomicUsize>,
    pool: storage::Pool,
    _dir: tempfile::TempDir,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let pool = storage::open_pool(&dir.path().join("results.db")).unwrap();
    let runs = Arc::new(AtomicUsize::new(0));
    let mut catalog = MeasurementCatalog::empty();
    let counter = runs.clone();
    catalog.register("echo", move |_| {
        Ok(Arc::new(Echo {
            runs: counter.clone(),
        }) as Arc<dyn Measurement>)
    });

    let config = Config::default();
    let clients = Arc::new(ClientRegistry::new());
    let clock = Arc::new(SystemClock);
    let scheduler = Scheduler::new(
        &config,
        Collaborators {
            catalog,
            guard: Arc::new(BudgetGuard::new(
                &config.resources,
                Arc::new(StaticBattery::new(None)),
                clock.clone(),
            )),
            network: Arc::new(StaticNetworkMonitor::new(NetworkClass::Wifi)),
            notifier: clients.clone(),
            clock,
            sink: Some(Arc::new(SqliteSink::new(pool.clone()))),
        },
    );
    Fixture {
        scheduler,
        clients,
        runs,
        pool,
        _dir: dir,
    }
}

async fn wait_for(mut done: impl FnMut() -> bool) {
    for _ in 0..500 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn interactive(kind: &str) -> JobRequest {
    let mut req = JobRequest::new(kind);
    req.priority = Some(USER_PRIORITY);
    req
}

#[tokio::test]
async fn test_interactive_job_end_to_end() {
    let f = fixture();
    let mut events = f.clients.register("app");
    let shutdown = CancellationToken::new();
    let driver = tokio::spawn(f.scheduler.clone().run(shutdown.clone()));

    let id = f.scheduler.submit("app", interactive("echo")).unwrap();
    wait_for(|| f.scheduler.query_status(&id) == JobStatus::Finished).await;

    let mut statuses = Vec::new();
    let mut results = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            ClientEvent::StatusChanged { status, .. } => statuses.push(status),
            ClientEvent::Results { results: r, .. } => results.extend(r),
        }
    }
    assert_eq!(
        statuses,
        vec![JobStatus::Scheduled, JobStatus::Running, JobStatus::Finished]
    );
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].outcome, Outcome::Completed);
    assert!(f.scheduler.snapshot().is_idle());

    let stored = storage::results_for_job(&f.pool, &id).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].payload["run"], 1);

    shutdown.cancel();
    driver.await.unwrap();
}

#[tokio::test]
async fn test_driver_runs_each_recurrence() {
    let f = fixture();
    let shutdown = CancellationToken::new();
    let driver = tokio::spawn(f.scheduler.clone().run(shutdown.clone()));

    let mut req = JobRequest::new("echo");
    req.priority = Some(5);
    req.count = Some(Repeat::Times(2));
    req.interval_seconds = Some(1);
    let id = f.scheduler.submit("app", req).unwrap();

    wait_for(|| f.runs.load(Ordering::SeqCst) == 2 && !f.scheduler.is_running()).await;
    assert_eq!(f.scheduler.query_status(&id), JobStatus::Finished);
    assert!(f.scheduler.snapshot().is_idle());
    assert_eq!(storage::results_for_job(&f.pool, &id).unwrap().len(), 2);

    shutdown.cancel();
    driver.await.unwrap();
}

#[tokio::test]
async fn test_sequential_composite_through_scheduler() {
    let f = fixture();
    let mut events = f.clients.register("app");
    let mut req = interactive("sequential");
    req.children = vec![JobRequest::new("echo"), JobRequest::new("echo").param("n", "2")];
    let id = f.scheduler.submit("app", req).unwrap();

    wait_for(|| f.scheduler.query_status(&id) == JobStatus::Finished).await;
    assert_eq!(f.runs.load(Ordering::SeqCst), 2);

    // Child results arrive together, under the composite's id, in child order.
    let mut delivered = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ClientEvent::Results { job_id, results } = event {
            assert_eq!(job_id, id);
            delivered.extend(results);
        }
    }
    assert_eq!(delivered.len(), 2);
    assert!(delivered.iter().all(|r| r.outcome == Outcome::Completed));
    assert_eq!(delivered[0].payload["run"], 1);
    assert_eq!(delivered[1].payload["run"], 2);
    assert_ne!(delivered[0].job_id, delivered[1].job_id);
}

#[tokio::test]
async fn test_shutdown_stops_running_job() {
    let f = fixture();
    let shutdown = CancellationToken::new();
    let driver = tokio::spawn(f.scheduler.clone().run(shutdown.clone()));

    let mut later = interactive("echo");
    later.start_time = Some(chrono::Utc::now() + chrono::Duration::hours(1));
    f.scheduler.submit("app", later).unwrap();
    assert_eq!(f.scheduler.snapshot().main.len(), 1);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), driver)
        .await
        .expect("driver did not stop")
        .unwrap();
    assert!(!f.scheduler.is_running());
    assert_eq!(f.runs.load(Ordering::SeqCst), 0);
}
