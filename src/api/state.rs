use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::Receiver;

use crate::scheduler::{ClientEvent, ClientRegistry, Scheduler};
use crate::storage::Pool;

/// Event receivers of clients registered over HTTP, drained by polling.
pub type Inboxes = Arc<Mutex<HashMap<String, Receiver<ClientEvent>>>>;

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub scheduler: Scheduler,
    pub clients: Arc<ClientRegistry>,
    pub inboxes: Inboxes,
}

impl AppState {
    pub fn new(pool: Pool, scheduler: Scheduler, clients: Arc<ClientRegistry>) -> Self {
        Self {
            pool,
            scheduler,
            clients,
            inboxes: Inboxes::default(),
        }
    }
}
