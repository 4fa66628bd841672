//! Lineage ledger for infinite-repeat server jobs.
//!
//! The checkin server resends its whole catalogue every cycle. An infinite
//! job already running here must not be admitted a second time; instead its
//! recorded end time moves forward, and recurrences pick that up.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::jobs::JobDescriptor;

#[derive(Debug, Default)]
pub struct ServerJobLedger {
    entries: HashMap<String, DateTime<Utc>>,
}

impl ServerJobLedger {
    /// Record the descriptor's end time. Returns `true` only for a lineage
    /// not seen before.
    pub fn observe(&mut self, descriptor: &JobDescriptor) -> bool {
        self.entries
            .insert(descriptor.signature(), descriptor.end_time)
            .is_none()
    }

    pub fn end_time(&self, signature: &str) -> Option<DateTime<Utc>> {
        self.entries.get(signature).copied()
    }

    /// Forget lineages missing from the latest catalogue.
    pub fn retain_only(&mut self, signatures: &HashSet<String>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|sig, _| signatures.contains(sig));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
