use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use log::{info, warn};
use rusqlite::Connection;
use tokio::sync::{broadcast, mpsc, watch};

use tether_db::sessions;
use tether_proto::session::SessionStatus;
use tether_pty::{ProcessHost, PtyError};

/// Errors attaching a connection to a backend process.
#[derive(Debug)]
pub enum AttachError {
    /// No live process exists for the named backend id.
    NotFound,
    /// The backend id is already bound to another live connection.
    /// Resolved only by explicit takeover, never by silent displacement.
    BindConflict,
    /// The shell process could not be started. Fatal to this attempt only;
    /// no registry row is created.
    Spawn(PtyError),
    Storage(String),
}

impl std::fmt::Display for AttachError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttachError::NotFound => write!(f, "no live process for backend id"),
            AttachError::BindConflict => {
                write!(f, "backend id is bound to another connection")
            }
            AttachError::Spawn(err) => write!(f, "spawn failed: {err}"),
            AttachError::Storage(msg) => write!(f, "registry error: {msg}"),
        }
    }
}

impl std::error::Error for AttachError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AttachError::Spawn(err) => Some(err),
            _ => None,
        }
    }
}

/// Why a connection is letting go of its binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachReason {
    /// The client closed explicitly; the process is killed.
    Closed,
    /// The transport dropped; the process keeps running and the registry
    /// marks the session disconnected.
    Lost,
    /// The process itself exited; the session row is left untouched, only
    /// its occupancy drops.
    Exited,
}

#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    /// Shell to spawn; `None` uses the user's default shell.
    pub shell: Option<String>,
    /// Working directory for spawned shells.
    pub cwd: Option<PathBuf>,
}

struct Binding {
    conn_id: u64,
    force_tx: mpsc::Sender<()>,
}

struct Inner {
    hosts: HashMap<String, Arc<ProcessHost>>,
    binds: HashMap<String, Binding>,
    next_backend: u64,
    next_conn: u64,
}

/// Everything one bound connection needs to relay bytes, handed out by
/// [`Gateway::attach`] / [`Gateway::attach_new`].
pub struct Attachment {
    pub backend_id: String,
    pub conn_id: u64,
    pub host: Arc<ProcessHost>,
    pub output: broadcast::Receiver<Bytes>,
    pub exit: watch::Receiver<Option<i32>>,
    /// Fires when a takeover displaces this connection. The binding is
    /// already gone by then; the handler only has to close the socket with
    /// the takeover close code.
    pub force: mpsc::Receiver<()>,
}

impl std::fmt::Debug for Attachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attachment")
            .field("backend_id", &self.backend_id)
            .field("conn_id", &self.conn_id)
            .finish_non_exhaustive()
    }
}

pub struct Gateway {
    db: Arc<Mutex<Connection>>,
    inner: Mutex<Inner>,
    config: GatewayConfig,
}

impl Gateway {
    pub fn new(db: Arc<Mutex<Connection>>, config: GatewayConfig) -> Self {
        Self {
            db,
            inner: Mutex::new(Inner {
                hosts: HashMap::new(),
                binds: HashMap::new(),
                next_backend: 0,
                next_conn: 0,
            }),
            config,
        }
    }

    /// Spawn a fresh process for `session_id`, generate its backend id, and
    /// bind the caller to it. The registry row is created (or resumed)
    /// under the new backend id.
    pub fn attach_new(
        &self,
        session_id: &str,
        title: Option<&str>,
        cols: u16,
        rows: u16,
    ) -> Result<Attachment, AttachError> {
        let backend_id = {
            let mut inner = self.lock_inner();
            inner.next_backend += 1;
            format!("pty-{}", inner.next_backend)
        };

        let host = ProcessHost::spawn(
            &backend_id,
            cols,
            rows,
            self.config.cwd.as_deref(),
            self.config.shell.as_deref(),
        )
        .map_err(AttachError::Spawn)?;
        let host = Arc::new(host);

        let attachment = {
            let mut inner = self.lock_inner();
            inner.hosts.insert(backend_id.clone(), Arc::clone(&host));
            bind_locked(&mut inner, &backend_id, &host)
        };

        if let Err(err) = self.with_db(|db| {
            sessions::create_or_resume(db, session_id, &backend_id, title, cols, rows)?;
            Ok(())
        }) {
            // The spawned process must not outlive a failed attach.
            self.kill(&backend_id);
            return Err(err);
        }

        info!("spawned backend {backend_id} for session {session_id}");
        Ok(attachment)
    }

    /// Bind the caller to an existing backend process.
    pub fn attach(&self, backend_id: &str) -> Result<Attachment, AttachError> {
        let attachment = {
            let mut inner = self.lock_inner();
            let host = inner
                .hosts
                .get(backend_id)
                .cloned()
                .ok_or(AttachError::NotFound)?;
            if inner.binds.contains_key(backend_id) {
                return Err(AttachError::BindConflict);
            }
            bind_locked(&mut inner, backend_id, &host)
        };

        // Bind event: the session is active again.
        if let Err(err) = self.with_db(|db| {
            sessions::touch_by_backend(db, backend_id)?;
            Ok(())
        }) {
            warn!("failed to record bind for {backend_id}: {err}");
        }

        info!("backend {backend_id} bound by connection {}", attachment.conn_id);
        Ok(attachment)
    }

    /// Release a binding. Silently ignored when the binding has already been
    /// replaced (a takeover raced this detach).
    pub fn detach(&self, backend_id: &str, conn_id: u64, reason: DetachReason) {
        let host = {
            let mut inner = self.lock_inner();
            match inner.binds.get(backend_id) {
                Some(binding) if binding.conn_id == conn_id => {
                    inner.binds.remove(backend_id);
                }
                _ => return,
            }
            match reason {
                DetachReason::Closed | DetachReason::Exited => inner.hosts.remove(backend_id),
                DetachReason::Lost => None,
            }
        };

        match reason {
            DetachReason::Closed => {
                if let Some(host) = host {
                    host.kill();
                }
                self.report_status(backend_id, SessionStatus::Disconnected);
                info!("backend {backend_id} closed by connection {conn_id}");
            }
            DetachReason::Lost => {
                self.report_status(backend_id, SessionStatus::Disconnected);
                info!("connection {conn_id} lost; backend {backend_id} keeps running");
            }
            DetachReason::Exited => {
                info!("backend {backend_id} exited; binding torn down");
            }
        }
    }

    /// Close the current binder with the takeover reason and clear the
    /// binding. This is the only path that displaces a live connection.
    /// Returns false when nothing was bound, which is not an error.
    pub fn force_unbind(&self, backend_id: &str) -> bool {
        let binding = self.lock_inner().binds.remove(backend_id);
        match binding {
            Some(binding) => {
                // The displaced handler may already be gone; that is fine.
                let _ = binding.force_tx.try_send(());
                info!("backend {backend_id} force-unbound from connection {}", binding.conn_id);
                true
            }
            None => false,
        }
    }

    /// Administrative kill. Idempotent: returns false when the backend is
    /// already gone.
    ///
    /// A kill is not a takeover: the binding is dropped without the force
    /// signal, and a bound connection learns of the death through the exit
    /// watch, receiving the exit envelope and a normal close.
    pub fn kill(&self, backend_id: &str) -> bool {
        let (binding, host) = {
            let mut inner = self.lock_inner();
            (
                inner.binds.remove(backend_id),
                inner.hosts.remove(backend_id),
            )
        };
        drop(binding);
        match host {
            Some(host) => {
                host.kill();
                info!("backend {backend_id} killed");
                true
            }
            None => false,
        }
    }

    /// True iff a live connection currently holds `backend_id`.
    pub fn occupied(&self, backend_id: &str) -> bool {
        self.lock_inner().binds.contains_key(backend_id)
    }

    /// Backend ids currently held by a live connection.
    pub fn occupied_backends(&self) -> HashSet<String> {
        self.lock_inner().binds.keys().cloned().collect()
    }

    /// True iff a live process exists for `backend_id`, bound or not.
    pub fn has_backend(&self, backend_id: &str) -> bool {
        self.lock_inner().hosts.contains_key(backend_id)
    }

    fn report_status(&self, backend_id: &str, status: SessionStatus) {
        if let Err(err) = self.with_db(|db| {
            sessions::set_status_by_backend(db, backend_id, status)?;
            Ok(())
        }) {
            warn!("failed to record {status} for {backend_id}: {err}");
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        // A poisoned lock only means a handler panicked mid-update of these
        // flat maps; the entries themselves are still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_db<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, tether_db::DbError>,
    ) -> Result<T, AttachError> {
        let mut db = self
            .db
            .lock()
            .map_err(|_| AttachError::Storage("registry lock poisoned".into()))?;
        f(&mut db).map_err(|e| AttachError::Storage(e.to_string()))
    }
}

fn bind_locked(inner: &mut Inner, backend_id: &str, host: &Arc<ProcessHost>) -> Attachment {
    inner.next_conn += 1;
    let conn_id = inner.next_conn;
    let (force_tx, force_rx) = mpsc::channel(1);
    inner.binds.insert(
        backend_id.to_string(),
        Binding { conn_id, force_tx },
    );
    Attachment {
        backend_id: backend_id.to_string(),
        conn_id,
        host: Arc::clone(host),
        output: host.subscribe(),
        exit: host.exit_status(),
        force: force_rx,
    }
}
