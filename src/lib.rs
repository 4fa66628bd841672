//! crowdprobe -- crowdsourced network measurement scheduler.
//!
//! A single-slot task scheduler that admits time- and priority-annotated
//! measurement jobs from local clients and a remote coordination server,
//! preempts background work for urgent interactive jobs, and keeps its
//! queue in step with the server through a backoff-governed checkin cycle.

pub mod api;
pub mod checkin;
pub mod clock;
pub mod config;
pub mod jobs;
pub mod probes;
pub mod resources;
pub mod scheduler;
pub mod storage;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::checkin::{CheckinCycle, HttpCheckinTransport};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::jobs::{
    CompositeLimits, DescriptorLimits, JobControl, JobDescriptor, JobRequest, MeasurementCatalog,
    MeasurementResult, USER_PRIORITY,
};
use crate::resources::{BudgetGuard, SysfsBattery, SystemNetworkMonitor};
use crate::scheduler::{ClientRegistry, Collaborators, Scheduler};

/// Start the daemon: storage, scheduler driver, checkin loop and API server.
pub async fn serve(config: Config) -> Result<()> {
    // 1. Storage
    info!(db_path = %config.storage.db_path.display(), "initializing database");
    let pool = storage::open_pool(&config.storage.db_path)?;

    // 2. Scheduler and its collaborators
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let clients = Arc::new(ClientRegistry::new());
    let battery = Arc::new(SysfsBattery::new(config.resources.power_supply_path.clone()));
    let scheduler = Scheduler::new(
        &config,
        Collaborators {
            catalog: MeasurementCatalog::with_defaults(),
            guard: Arc::new(BudgetGuard::new(&config.resources, battery, clock.clone())),
            network: Arc::new(SystemNetworkMonitor::default()),
            notifier: clients.clone(),
            clock,
            sink: Some(Arc::new(storage::SqliteSink::new(pool.clone()))),
        },
    );

    // 3. Background tasks
    let shutdown = CancellationToken::new();
    let driver = tokio::spawn(scheduler.clone().run(shutdown.clone()));
    let checkin = if config.checkin.enabled() {
        let transport = Arc::new(HttpCheckinTransport::new(&config.checkin)?);
        let cycle = CheckinCycle::new(scheduler.clone(), transport, config.checkin.clone());
        Some(tokio::spawn(cycle.run(shutdown.clone())))
    } else {
        info!("no checkin server configured, checkin disabled");
        None
    };

    // 4. API server
    let addr: SocketAddr = config
        .api
        .bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", config.api.bind))?;
    let app = api::router(api::state::AppState::new(pool, scheduler, clients.clone()));

    info!(%addr, "crowdprobe listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
                _ = signal.cancelled() => {}
            }
        })
        .await?;

    shutdown.cancel();
    driver.await.context("scheduler driver panicked")?;
    if let Some(checkin) = checkin {
        checkin.await.context("checkin loop panicked")?;
    }
    clients.shutdown();
    info!("crowdprobe stopped");
    Ok(())
}

/// Run one measurement immediately, outside the scheduler, and return its
/// results.
pub async fn run_measurement(config: &Config, mut request: JobRequest) -> Result<Vec<MeasurementResult>> {
    if request.priority.is_none() {
        request.priority = Some(USER_PRIORITY);
    }
    let descriptor = JobDescriptor::from_request(
        request,
        "cli",
        chrono::Utc::now(),
        &DescriptorLimits::from(&config.scheduler),
    )?;
    let job = MeasurementCatalog::with_defaults().build(descriptor)?;
    info!(job_id = %job.id(), kind = job.kind(), "running measurement");

    let control = JobControl::new();
    let stop = control.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.request_stop();
        }
    });
    let results = job
        .execute(&control, &CompositeLimits::from(&config.scheduler))
        .await;
    interrupt.abort();
    Ok(results?)
}
