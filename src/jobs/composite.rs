//! Parallel and sequential composite execution.

use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::{CompositeLimits, Job, JobControl, JobError, MeasurementResult};

fn child_timeout(declared: Duration, limits: &CompositeLimits) -> Duration {
    if declared.is_zero() {
        limits.default_timeout
    } else {
        declared * 2
    }
}

/// Run every child at once and wait up to twice the declared duration.
/// Children still running at the deadline are abandoned; an execution
/// error in any child aborts the whole composite.
pub(super) async fn run_parallel(
    children: &[Job],
    declared: Duration,
    control: &JobControl,
    limits: &CompositeLimits,
) -> Result<Vec<MeasurementResult>, JobError> {
    let deadline = tokio::time::Instant::now() + child_timeout(declared, limits);
    let mut pool = JoinSet::new();

    for (index, child) in children.iter().cloned().enumerate() {
        let child_control = control.child();
        let limits = *limits;
        pool.spawn(async move { (index, child.execute(&child_control, &limits).await) });
    }

    let mut slots: Vec<Option<Vec<MeasurementResult>>> = (0..children.len()).map(|_| None).collect();

    loop {
        match tokio::time::timeout_at(deadline, pool.join_next()).await {
            Ok(Some(Ok((index, Ok(results))))) => slots[index] = Some(results),
            Ok(Some(Ok((index, Err(e))))) => {
                warn!(child = index, error = %e, "parallel child failed, aborting composite");
                pool.abort_all();
                return Err(e);
            }
            Ok(Some(Err(join_err))) => {
                pool.abort_all();
                return Err(JobError::ChildCrashed(join_err.to_string()));
            }
            Ok(None) => break,
            Err(_) => {
                warn!(abandoned = pool.len(), "parallel job timed out, abandoning children");
                control.request_stop();
                pool.abort_all();
                break;
            }
        }
    }

    Ok(slots.into_iter().flatten().flatten().collect())
}

/// Run children one at a time. A child that overruns twice its declared
/// duration is asked to stop; if it refuses it is force-cancelled and the
/// chain moves on.
pub(super) async fn run_sequential(
    children: &[Job],
    current: &Mutex<Option<usize>>,
    control: &JobControl,
    limits: &CompositeLimits,
) -> Result<Vec<MeasurementResult>, JobError> {
    let set_current = |index: Option<usize>| {
        *current.lock().unwrap_or_else(|e| e.into_inner()) = index;
    };

    let mut results = Vec::new();
    for (index, child) in children.iter().enumerate() {
        if control.stop_requested() {
            debug!(remaining = children.len() - index, "sequential job stopped");
            break;
        }
        set_current(Some(index));

        let child_control = control.child();
        let task_child = child.clone();
        let task_control = child_control.clone();
        let task_limits = *limits;
        let mut handle =
            tokio::spawn(async move { task_child.execute(&task_control, &task_limits).await });

        match tokio::time::timeout(child_timeout(child.duration(), limits), &mut handle).await {
            Ok(Ok(Ok(child_results))) => results.extend(child_results),
            Ok(Ok(Err(e))) => {
                set_current(None);
                return Err(e);
            }
            Ok(Err(join_err)) => {
                set_current(None);
                return Err(JobError::ChildCrashed(join_err.to_string()));
            }
            Err(_) => {
                warn!(child = index, kind = %child.kind(), "sequential child overran its timeout");
                if child.request_stop(&child_control) {
                    match tokio::time::timeout(limits.stop_grace, &mut handle).await {
                        Ok(Ok(Ok(partial))) => results.extend(partial),
                        _ => handle.abort(),
                    }
                } else {
                    handle.abort();
                }
            }
        }
    }

    set_current(None);
    Ok(results)
}
