//! Submitter registry and result delivery.
//!
//! [`ClientRegistry`] is the process-wide set of registered clients. Each
//! client gets an event receiver on registration; the scheduler reaches
//! them through the [`Notifier`] seam, unicast to a job's owner or
//! broadcast for server-originated jobs.
//!
//! Inboxes are bounded. A client that stops draining loses the events that
//! overflow its inbox but stays registered.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use super::JobStatus;
use crate::jobs::{JobId, MeasurementResult};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    StatusChanged { job_id: JobId, status: JobStatus },
    Results { job_id: JobId, results: Vec<MeasurementResult> },
}

impl ClientEvent {
    pub fn job_id(&self) -> &JobId {
        match self {
            ClientEvent::StatusChanged { job_id, .. } | ClientEvent::Results { job_id, .. } => job_id,
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, submitter: &str, event: ClientEvent);

    fn broadcast(&self, event: ClientEvent);

    fn client_count(&self) -> usize;
}

/// Events a client inbox holds before new ones are dropped.
pub const INBOX_CAPACITY: usize = 256;

#[derive(Debug)]
pub struct ClientRegistry {
    clients: Mutex<HashMap<String, mpsc::Sender<ClientEvent>>>,
    capacity: usize,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::with_capacity(INBOX_CAPACITY)
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, mpsc::Sender<ClientEvent>>> {
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `key`, replacing any previous registration.
    pub fn register(&self, key: &str) -> mpsc::Receiver<ClientEvent> {
        let (tx, rx) = mpsc::channel(self.capacity);
        if self.lock().insert(key.to_string(), tx).is_some() {
            debug!(client = key, "client re-registered");
        } else {
            info!(client = key, "client registered");
        }
        rx
    }

    pub fn unregister(&self, key: &str) -> bool {
        let removed = self.lock().remove(key).is_some();
        if removed {
            info!(client = key, "client unregistered");
        }
        removed
    }

    pub fn is_registered(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    /// Drop every registration; receivers see their channel close.
    pub fn shutdown(&self) {
        let mut clients = self.lock();
        info!(count = clients.len(), "closing client registry");
        clients.clear();
    }
}

/// Offer `event` to one inbox. Returns `false` once the receiver is gone.
fn offer(client: &str, tx: &mpsc::Sender<ClientEvent>, event: ClientEvent) -> bool {
    match tx.try_send(event) {
        Ok(()) => true,
        Err(TrySendError::Full(event)) => {
            warn!(client, job_id = %event.job_id(), "client inbox full, event dropped");
            true
        }
        Err(TrySendError::Closed(_)) => {
            debug!(client, "client receiver gone, unregistering");
            false
        }
    }
}

impl Notifier for ClientRegistry {
    fn notify(&self, submitter: &str, event: ClientEvent) {
        let mut clients = self.lock();
        let Some(tx) = clients.get(submitter) else {
            debug!(client = submitter, job_id = %event.job_id(), "no such client, event dropped");
            return;
        };
        if !offer(submitter, tx, event) {
            clients.remove(submitter);
        }
    }

    fn broadcast(&self, event: ClientEvent) {
        self.lock().retain(|client, tx| offer(client, tx, event.clone()));
    }

    fn client_count(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(id: &str) -> ClientEvent {
        ClientEvent::StatusChanged {
            job_id: JobId::from(id),
            status: JobStatus::Running,
        }
    }

    #[test]
    fn test_unicast_reaches_only_owner() {
        let reg = ClientRegistry::new();
        let mut a = reg.register("client-a");
        let mut b = reg.register("client-b");
        reg.notify("client-a", status("j1"));
        assert_eq!(a.try_recv().unwrap(), status("j1"));
        assert!(b.try_recv().is_err());
    }

    #[test]
    fn test_broadcast_and_dead_receivers() {
        let reg = ClientRegistry::new();
        let mut a = reg.register("client-a");
        let b = reg.register("client-b");
        drop(b);
        reg.broadcast(status("j2"));
        assert_eq!(a.try_recv().unwrap(), status("j2"));
        assert!(reg.is_registered("client-a"));
        assert!(!reg.is_registered("client-b"));
        assert_eq!(reg.client_count(), 1);
    }

    #[test]
    fn test_full_inbox_drops_events_but_keeps_client() {
        let reg = ClientRegistry::with_capacity(4);
        let mut a = reg.register("client-a");
        for i in 0..10 {
            reg.broadcast(status(&format!("j{}", i)));
        }
        reg.notify("client-a", status("late"));

        let mut received = Vec::new();
        while let Ok(event) = a.try_recv() {
            received.push(event);
        }
        assert_eq!(received.len(), 4);
        assert_eq!(received[0], status("j0"));
        assert_eq!(received[3], status("j3"));
        assert!(reg.is_registered("client-a"));

        // drained inbox accepts again
        reg.notify("client-a", status("j10"));
        assert_eq!(a.try_recv().unwrap(), status("j10"));
    }

    #[test]
    fn test_unregister_and_shutdown() {
        let reg = ClientRegistry::new();
        let _a = reg.register("client-a");
        let mut b = reg.register("client-b");
        assert!(reg.unregister("client-a"));
        assert!(!reg.unregister("client-a"));
        assert_eq!(reg.client_count(), 1);

        reg.shutdown();
        assert_eq!(reg.client_count(), 0);
        assert!(b.try_recv().is_err());
        assert!(!reg.is_registered("client-b"));
    }

    #[test]
    fn test_event_wire_format() {
        let json = serde_json::to_value(status("j3")).unwrap();
        assert_eq!(json["event"], "status_changed");
        assert_eq!(json["status"], "running");
        assert_eq!(json["job_id"], "j3");
    }
}
