//! Periodic checkin with the coordination server.
//!
//! Every cycle uploads the results collected since the last successful
//! cycle, pulls the server's job catalogue, scales it to the device's data
//! profile and merges it into the scheduler. Failures retry with bounded
//! backoff, then wait for the next natural period. A failed cycle never
//! touches jobs already queued.

mod frequency;
mod retry;
mod transport;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CheckinConfig;
use crate::scheduler::Scheduler;

pub use self::frequency::adjust_frequency;
pub use self::retry::RetryState;
pub use self::transport::{CheckinTransport, HttpCheckinTransport};

#[derive(Debug, Error)]
pub enum CheckinError {
    #[error("checkin request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("checkin server returned status {0}")]
    Status(u16),
    #[error("checkin response could not be decoded: {0}")]
    Decode(#[source] reqwest::Error),
}

/// What one successful cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckinReport {
    pub uploaded: usize,
    pub received: usize,
    pub admitted: usize,
}

pub struct CheckinCycle {
    scheduler: Scheduler,
    transport: Arc<dyn CheckinTransport>,
    cfg: CheckinConfig,
}

impl CheckinCycle {
    pub fn new(scheduler: Scheduler, transport: Arc<dyn CheckinTransport>, cfg: CheckinConfig) -> Self {
        Self {
            scheduler,
            transport,
            cfg,
        }
    }

    /// One checkin. `Ok(None)` means the battery gate skipped it.
    pub async fn run_once(&self) -> Result<Option<CheckinReport>, CheckinError> {
        if !self.scheduler.guard().can_schedule_experiment() {
            info!("battery below threshold, checkin skipped");
            return Ok(None);
        }

        self.scheduler.reconcile();
        let uploads = self.scheduler.take_uploads();
        let catalogue = match self.transport.checkin(&uploads).await {
            Ok(jobs) => jobs,
            Err(e) => {
                self.scheduler.restore_uploads(uploads);
                return Err(e);
            }
        };

        let received = catalogue.len();
        let profile = self.scheduler.guard().data_profile();
        let adjusted: Vec<_> = catalogue
            .into_iter()
            .filter_map(|job| adjust_frequency(job, profile))
            .collect();
        let admitted = self.scheduler.submit_server_jobs(adjusted);

        if !self.scheduler.is_running() {
            self.scheduler.tick();
        }

        let report = CheckinReport {
            uploaded: uploads.len(),
            received,
            admitted,
        };
        info!(
            uploaded = report.uploaded,
            received = report.received,
            admitted = report.admitted,
            %profile,
            "checkin complete"
        );
        Ok(Some(report))
    }

    /// Checkin loop. The first cycle fires after the initial delay, and the
    /// period restarts from that delay whenever the interval changes.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = self.scheduler.subscribe_checkin_interval();
        let initial = Duration::from_secs(self.cfg.initial_delay_sec);
        let mut retry = RetryState::new(&self.cfg);
        let mut delay = initial;
        info!(period_sec = *interval.borrow(), "checkin loop started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                changed = interval.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let period = *interval.borrow_and_update();
                    info!(period_sec = period, "checkin interval changed");
                    retry.on_success();
                    delay = initial;
                    continue;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let period = Duration::from_secs(*interval.borrow());
            delay = match self.run_once().await {
                Ok(_) => {
                    retry.on_success();
                    period
                }
                Err(e) => match retry.on_failure(period) {
                    Some(backoff) => {
                        warn!(error = %e, retry = retry.retries(), backoff_sec = backoff.as_secs(), "checkin failed, retrying");
                        backoff
                    }
                    None => {
                        warn!(error = %e, "checkin failed, waiting for next period");
                        period
                    }
                },
            };
            debug!(next_in_sec = delay.as_secs(), "next checkin armed");
        }
        info!("checkin loop stopped");
    }
}
