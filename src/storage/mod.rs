//! SQLite storage for delivered measurement results.

pub mod schema;

use std::path::Path;

use anyhow::{Context, Result};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use tracing::warn;

use crate::jobs::{JobId, MeasurementResult};
use crate::scheduler::ResultSink;

/// Connection pool type.
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path) -> Result<Pool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create database directory {}", parent.display()))?;
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager).context("failed to open database pool")?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Persist a batch of results in one transaction.
pub fn save_results(pool: &Pool, results: &[MeasurementResult]) -> Result<usize> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO results (job_id, kind, outcome, measured_at, result_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for result in results {
            let json = serde_json::to_string(result)?;
            let outcome = serde_json::to_value(result.outcome)?;
            stmt.execute(params![
                result.job_id.as_str(),
                result.kind,
                outcome.as_str().unwrap_or_default(),
                result.timestamp.to_rfc3339(),
                json,
            ])?;
        }
    }
    tx.commit()?;
    Ok(results.len())
}

/// Every stored result for `job_id`, oldest first.
pub fn results_for_job(pool: &Pool, job_id: &JobId) -> Result<Vec<MeasurementResult>> {
    let conn = pool.get()?;
    let mut stmt =
        conn.prepare("SELECT result_json FROM results WHERE job_id = ?1 ORDER BY measured_at, id")?;
    let rows: Vec<String> = stmt
        .query_map(params![job_id.as_str()], |row| row.get(0))?
        .collect::<Result<_, _>>()?;
    rows.iter()
        .map(|json| serde_json::from_str(json).context("corrupt stored result"))
        .collect()
}

/// Scheduler result sink backed by the pool.
#[derive(Clone)]
pub struct SqliteSink {
    pool: Pool,
}

impl SqliteSink {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

impl ResultSink for SqliteSink {
    fn store(&self, results: &[MeasurementResult]) {
        if results.is_empty() {
            return;
        }
        if let Err(e) = save_results(&self.pool, results) {
            warn!(error = %e, count = results.len(), "failed to persist results");
        }
    }
}
