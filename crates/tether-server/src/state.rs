use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;
use tether_gateway::Gateway;

/// Shared handles for every request. The registry connection and the
/// gateway share the same `Arc<Mutex<Connection>>`, so gateway write-through
/// and API reads see one database.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Mutex<Connection>>,
    pub gateway: Arc<Gateway>,
}

impl AppState {
    pub fn lock_db(&self) -> MutexGuard<'_, Connection> {
        // A poisoned registry lock only means a panicking thread held it;
        // the connection itself is still usable.
        self.db.lock().unwrap_or_else(|e| e.into_inner())
    }
}
