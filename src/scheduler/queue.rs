//! The two scheduler queues.
//!
//! [`MainQueue`] holds jobs that are not yet due, earliest due time first.
//! [`ReadyQueue`] holds due jobs waiting for the worker slot, most urgent
//! priority first, then earliest `end_time`. Both break ties by insertion
//! order so the ordering is total and deterministic.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::jobs::{Job, JobId, Repeat};

/// Queue entry summary for snapshots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueuedJob {
    pub id: JobId,
    #[serde(rename = "type")]
    pub kind: String,
    pub due: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub priority: i32,
    pub count: Repeat,
}

impl QueuedJob {
    fn new(job: &Job, due: DateTime<Utc>) -> Self {
        Self {
            id: job.id().clone(),
            kind: job.kind().to_string(),
            due,
            end_time: job.descriptor().end_time,
            priority: job.priority(),
            count: job.descriptor().count,
        }
    }
}

// ---------------------------------------------------------------------------
// Main queue
// ---------------------------------------------------------------------------

struct MainEntry {
    key: Reverse<(DateTime<Utc>, u64)>,
    job: Job,
}

impl PartialEq for MainEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for MainEntry {}

impl PartialOrd for MainEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MainEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

/// Time-ordered min-heap of not-yet-due jobs.
#[derive(Default)]
pub struct MainQueue {
    heap: BinaryHeap<MainEntry>,
    seq: u64,
}

impl MainQueue {
    /// Enqueue at the job's own start time.
    pub fn push(&mut self, job: Job) {
        let due = job.descriptor().start_time;
        self.push_at(job, due);
    }

    /// Enqueue at an explicit due time (deferrals, re-admitted paused jobs).
    pub fn push_at(&mut self, job: Job, due: DateTime<Utc>) {
        self.seq += 1;
        self.heap.push(MainEntry {
            key: Reverse((due, self.seq)),
            job,
        });
    }

    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.heap.peek().map(|e| e.key.0 .0)
    }

    /// Pop the earliest job if it is due at `now`.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Option<Job> {
        if self.next_due()? > now {
            return None;
        }
        self.heap.pop().map(|e| e.job)
    }

    /// Remove every entry for `id`, returning how many were removed.
    pub fn remove(&mut self, id: &JobId) -> usize {
        let before = self.heap.len();
        self.heap.retain(|e| e.job.id() != id);
        before - self.heap.len()
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.heap.iter().any(|e| e.job.id() == id)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Entries in due order.
    pub fn snapshot(&self) -> Vec<QueuedJob> {
        let mut entries: Vec<&MainEntry> = self.heap.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries
            .into_iter()
            .map(|e| QueuedJob::new(&e.job, e.key.0 .0))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Ready queue
// ---------------------------------------------------------------------------

struct ReadyEntry {
    key: Reverse<(i32, DateTime<Utc>, u64)>,
    due: DateTime<Utc>,
    job: Job,
}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for ReadyEntry {}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

/// Priority-ordered min-heap of due jobs.
#[derive(Default)]
pub struct ReadyQueue {
    heap: BinaryHeap<ReadyEntry>,
    seq: u64,
}

impl ReadyQueue {
    pub fn push(&mut self, job: Job, due: DateTime<Utc>) {
        self.seq += 1;
        self.heap.push(ReadyEntry {
            key: Reverse((job.priority(), job.descriptor().end_time, self.seq)),
            due,
            job,
        });
    }

    pub fn pop(&mut self) -> Option<Job> {
        self.heap.pop().map(|e| e.job)
    }

    pub fn remove(&mut self, id: &JobId) -> usize {
        let before = self.heap.len();
        self.heap.retain(|e| e.job.id() != id);
        before - self.heap.len()
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.heap.iter().any(|e| e.job.id() == id)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Entries in dispatch order.
    pub fn snapshot(&self) -> Vec<QueuedJob> {
        let mut entries: Vec<&ReadyEntry> = self.heap.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries
            .into_iter()
            .map(|e| QueuedJob::new(&e.job, e.due))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::testing::{descriptor, FakeMeasurement, Script};
    use crate::jobs::USER_PRIORITY;
    use chrono::Duration;
    use std::time::Duration as StdDuration;

    fn job(kind: &str, priority: i32, start_offset: i64, end_offset: i64) -> Job {
        let now: DateTime<Utc> = "2026-04-01T00:00:00Z".parse().unwrap();
        let mut d = descriptor(kind);
        d.priority = priority;
        d.start_time = now + Duration::seconds(start_offset);
        d.end_time = now + Duration::seconds(end_offset);
        Job::atomic(
            d,
            FakeMeasurement::new(kind, Script::Sleep(StdDuration::ZERO), StdDuration::ZERO),
        )
    }

    #[test]
    fn test_main_queue_pops_in_time_order() {
        let mut q = MainQueue::default();
        let late = job("dns_lookup", 5, 60, 600);
        let early = job("ping", 5, 10, 600);
        q.push(late.clone());
        q.push(early.clone());

        let t0: DateTime<Utc> = "2026-04-01T00:00:00Z".parse().unwrap();
        assert!(q.pop_due(t0).is_none());
        assert_eq!(q.next_due(), Some(t0 + Duration::seconds(10)));

        let all_due = t0 + Duration::seconds(120);
        assert_eq!(q.pop_due(all_due).unwrap().id(), early.id());
        assert_eq!(q.pop_due(all_due).unwrap().id(), late.id());
        assert!(q.is_empty());
    }

    #[test]
    fn test_ready_queue_priority_then_deadline() {
        let t0: DateTime<Utc> = "2026-04-01T00:00:00Z".parse().unwrap();
        let mut q = ReadyQueue::default();
        let background_late = job("http", 10, 0, 900);
        let background_early = job("traceroute", 10, 0, 300);
        let interactive = job("ping", USER_PRIORITY, 0, 3600);
        q.push(background_late.clone(), t0);
        q.push(background_early.clone(), t0);
        q.push(interactive.clone(), t0);

        let order: Vec<String> = q.snapshot().into_iter().map(|e| e.kind).collect();
        assert_eq!(order, vec!["ping", "traceroute", "http"]);

        assert_eq!(q.pop().unwrap().id(), interactive.id());
        assert_eq!(q.pop().unwrap().id(), background_early.id());
        assert_eq!(q.pop().unwrap().id(), background_late.id());
    }

    #[test]
    fn test_equal_keys_keep_insertion_order() {
        let t0: DateTime<Utc> = "2026-04-01T00:00:00Z".parse().unwrap();
        let mut q = ReadyQueue::default();
        let a = job("ping", 3, 0, 600);
        let b = job("dns_lookup", 3, 0, 600);
        q.push(a.clone(), t0);
        q.push(b.clone(), t0);
        assert_eq!(q.pop().unwrap().id(), a.id());
        assert_eq!(q.pop().unwrap().id(), b.id());
    }

    #[test]
    fn test_remove_by_id() {
        let mut q = MainQueue::default();
        let a = job("ping", 3, 0, 600);
        q.push(a.clone());
        q.push(a.clone());
        q.push(job("http", 3, 5, 600));
        assert!(q.contains(a.id()));
        assert_eq!(q.remove(a.id()), 2);
        assert!(!q.contains(a.id()));
        assert_eq!(q.len(), 1);
    }
}
