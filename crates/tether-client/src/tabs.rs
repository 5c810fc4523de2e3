//! Tab multiplexer: maps visible terminal tabs to registry sessions.
//!
//! Each tab owns at most one session. The multiplexer enforces the tab cap,
//! runs the takeover flow against occupied backends, and writes renames and
//! closes through to the registry before touching local state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;
use tether_proto::session::{Session, SessionStatus};

/// Hard cap on simultaneously open tabs. Requests beyond it are rejected
/// without side effects.
pub const MAX_TABS: usize = 10;

/// Registry access as the multiplexer sees it. Backed by the HTTP API in
/// the app, by an in-memory map in tests.
pub trait SessionStore {
    fn get(&self, session_id: &str) -> Result<Session, StoreError>;
    fn list(
        &self,
        status: Option<SessionStatus>,
        include_closed: bool,
    ) -> Result<Vec<Session>, StoreError>;
    fn rename(&mut self, session_id: &str, title: &str) -> Result<(), StoreError>;
    fn set_status(&mut self, session_id: &str, status: SessionStatus) -> Result<(), StoreError>;
    /// Idempotent: deleting an absent row reports `false`, not an error.
    fn delete(&mut self, session_id: &str) -> Result<bool, StoreError>;
}

/// Gateway process control as the multiplexer sees it.
pub trait BackendControl {
    fn occupied(&self, backend_id: &str) -> Result<bool, ControlError>;
    /// Severs the current binder. Reports whether anyone was displaced.
    fn force_unbind(&mut self, backend_id: &str) -> Result<bool, ControlError>;
    fn kill(&mut self, backend_id: &str) -> Result<(), ControlError>;
}

#[derive(Debug, PartialEq, Eq)]
pub enum StoreError {
    NotFound,
    Validation(String),
    Other(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound => write!(f, "session not found"),
            StoreError::Validation(msg) => write!(f, "invalid session update: {msg}"),
            StoreError::Other(msg) => write!(f, "session store error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

#[derive(Debug, PartialEq, Eq)]
pub enum ControlError {
    NotFound,
    Other(String),
}

impl std::fmt::Display for ControlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlError::NotFound => write!(f, "no such backend"),
            ControlError::Other(msg) => write!(f, "backend control error: {msg}"),
        }
    }
}

impl std::error::Error for ControlError {}

/// One visible terminal tab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tab {
    pub id: u64,
    pub session_id: String,
    /// None until the first attach reports back which process was spawned.
    pub backend_id: Option<String>,
    pub title: String,
    pub connected: bool,
}

/// Result of asking to open a session in a tab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    /// A tab exists (new or already open); connect through it.
    Opened(u64),
    /// The backend has a live binder. No tab was created; the caller must
    /// prompt and, on confirmation, call `confirm_takeover`.
    TakeoverRequired {
        session_id: String,
        backend_id: String,
    },
    /// The tab cap is full. Nothing was created or contacted.
    Rejected,
}

pub struct TabMultiplexer<S, B> {
    store: S,
    control: B,
    tabs: Vec<Tab>,
    next_tab_id: u64,
}

impl<S: SessionStore, B: BackendControl> TabMultiplexer<S, B> {
    pub fn new(store: S, control: B) -> Self {
        Self {
            store,
            control,
            tabs: Vec::new(),
            next_tab_id: 0,
        }
    }

    pub fn tabs(&self) -> &[Tab] {
        &self.tabs
    }

    pub fn tab(&self, tab_id: u64) -> Option<&Tab> {
        self.tabs.iter().find(|t| t.id == tab_id)
    }

    /// Open a brand-new session in a new tab. No registry row exists yet;
    /// the gateway creates it when the tab first attaches, and
    /// `refresh_tab` picks up the assigned backend id afterwards.
    pub fn open_new(&mut self, title: Option<&str>) -> OpenOutcome {
        if self.tabs.len() >= MAX_TABS {
            return OpenOutcome::Rejected;
        }
        let tab_id = self.insert_tab(Tab {
            id: 0,
            session_id: mint_session_id(),
            backend_id: None,
            title: title.unwrap_or("Terminal").to_string(),
            connected: false,
        });
        OpenOutcome::Opened(tab_id)
    }

    /// Open an existing session in a tab. If its backend currently has a
    /// live binder, no tab is created and the caller gets a takeover
    /// decision instead.
    pub fn open(&mut self, session_id: &str) -> Result<OpenOutcome, StoreError> {
        if let Some(tab) = self.tabs.iter().find(|t| t.session_id == session_id) {
            return Ok(OpenOutcome::Opened(tab.id));
        }
        if self.tabs.len() >= MAX_TABS {
            return Ok(OpenOutcome::Rejected);
        }

        let session = self.store.get(session_id)?;

        // Closed rows came from history; the old process is long gone, so
        // the attach must spawn fresh under the same session id.
        let backend_id = if session.status == SessionStatus::Closed {
            None
        } else {
            match self.control.occupied(&session.backend_id) {
                Ok(true) => {
                    return Ok(OpenOutcome::TakeoverRequired {
                        session_id: session.id,
                        backend_id: session.backend_id,
                    });
                }
                Ok(false) => Some(session.backend_id),
                // The process died since the row was written; spawn fresh.
                Err(ControlError::NotFound) => None,
                Err(err) => return Err(StoreError::Other(err.to_string())),
            }
        };

        let tab_id = self.insert_tab(Tab {
            id: 0,
            session_id: session.id,
            backend_id,
            title: session.title,
            connected: false,
        });
        Ok(OpenOutcome::Opened(tab_id))
    }

    /// The user confirmed taking the session over from its current binder.
    pub fn confirm_takeover(
        &mut self,
        session_id: &str,
        backend_id: &str,
    ) -> Result<OpenOutcome, StoreError> {
        if self.tabs.len() >= MAX_TABS {
            return Ok(OpenOutcome::Rejected);
        }
        match self.control.force_unbind(backend_id) {
            // The binder may have left (or the process died) since the
            // prompt was shown; the attach still works either way.
            Ok(_) | Err(ControlError::NotFound) => {}
            Err(err) => return Err(StoreError::Other(err.to_string())),
        }
        let title = self
            .store
            .get(session_id)
            .map(|s| s.title)
            .unwrap_or_else(|_| "Terminal".to_string());
        let tab_id = self.insert_tab(Tab {
            id: 0,
            session_id: session_id.to_string(),
            backend_id: Some(backend_id.to_string()),
            title,
            connected: false,
        });
        Ok(OpenOutcome::Opened(tab_id))
    }

    /// Close a tab: tombstone the session and kill its process. The row
    /// stays in the registry as history.
    pub fn close(&mut self, tab_id: u64) -> Result<(), StoreError> {
        let pos = self
            .tabs
            .iter()
            .position(|t| t.id == tab_id)
            .ok_or(StoreError::NotFound)?;
        let tab = self.tabs.remove(pos);

        match self.store.set_status(&tab.session_id, SessionStatus::Closed) {
            // A never-attached tab has no row yet; nothing to tombstone.
            Ok(()) | Err(StoreError::NotFound) => {}
            Err(err) => {
                warn!("closing {}: status write failed: {err}", tab.session_id);
            }
        }

        if let Some(backend_id) = &tab.backend_id {
            match self.control.kill(backend_id) {
                Ok(()) | Err(ControlError::NotFound) => {}
                Err(err) => warn!("closing {}: kill failed: {err}", tab.session_id),
            }
        }
        Ok(())
    }

    /// Rename write-through: the registry row first, the tab label only
    /// once that succeeded.
    pub fn rename(&mut self, tab_id: u64, title: &str) -> Result<(), StoreError> {
        let tab = self
            .tabs
            .iter_mut()
            .find(|t| t.id == tab_id)
            .ok_or(StoreError::NotFound)?;
        self.store.rename(&tab.session_id, title)?;
        tab.title = title.trim().to_string();
        Ok(())
    }

    /// Remove a session from history entirely, killing its process if one
    /// is still around. Deleting an unknown session is a no-op.
    pub fn delete_session(&mut self, session_id: &str) -> Result<(), StoreError> {
        let backend_id = match self.store.get(session_id) {
            Ok(session) => Some(session.backend_id),
            Err(StoreError::NotFound) => None,
            Err(err) => return Err(err),
        };

        self.tabs.retain(|t| t.session_id != session_id);
        self.store.delete(session_id)?;

        if let Some(backend_id) = backend_id {
            match self.control.kill(&backend_id) {
                Ok(()) | Err(ControlError::NotFound) => {}
                Err(err) => warn!("deleting {session_id}: kill failed: {err}"),
            }
        }
        Ok(())
    }

    /// Rebuild the tab strip from resumable sessions, newest first, up to
    /// the cap. Closed sessions stay in history only.
    pub fn rehydrate(&mut self) -> Result<(), StoreError> {
        let sessions = self.store.list(None, false)?;
        self.tabs.clear();
        for session in sessions.into_iter().take(MAX_TABS) {
            self.insert_tab(Tab {
                id: 0,
                session_id: session.id,
                backend_id: Some(session.backend_id),
                title: session.title,
                connected: false,
            });
        }
        Ok(())
    }

    /// Re-read a tab's row after its first attach: the gateway assigned the
    /// backend id and may have defaulted the title.
    pub fn refresh_tab(&mut self, tab_id: u64) -> Result<(), StoreError> {
        let tab = self
            .tabs
            .iter_mut()
            .find(|t| t.id == tab_id)
            .ok_or(StoreError::NotFound)?;
        let session = self.store.get(&tab.session_id)?;
        tab.backend_id = Some(session.backend_id);
        tab.title = session.title;
        Ok(())
    }

    pub fn set_connected(&mut self, tab_id: u64, connected: bool) {
        if let Some(tab) = self.tabs.iter_mut().find(|t| t.id == tab_id) {
            tab.connected = connected;
        }
    }

    fn insert_tab(&mut self, mut tab: Tab) -> u64 {
        self.next_tab_id += 1;
        tab.id = self.next_tab_id;
        self.tabs.push(tab);
        self.next_tab_id
    }
}

/// Client-assigned session ids: wall-clock millis plus a process-local
/// counter, so two tabs opened in the same millisecond stay distinct.
fn mint_session_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("sess-{millis:x}-{n:x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    struct FakeStore {
        rows: HashMap<String, Session>,
    }

    impl FakeStore {
        fn new() -> Self {
            Self {
                rows: HashMap::new(),
            }
        }

        fn with_session(mut self, id: &str, backend_id: &str, status: SessionStatus) -> Self {
            self.rows.insert(
                id.to_string(),
                Session {
                    id: id.to_string(),
                    backend_id: backend_id.to_string(),
                    title: format!("title-{id}"),
                    status,
                    cols: 80,
                    rows: 24,
                    created_at: "2026-08-27T00:00:00Z".into(),
                    last_connected_at: "2026-08-27T00:00:00Z".into(),
                    occupied: false,
                },
            );
            self
        }
    }

    impl SessionStore for FakeStore {
        fn get(&self, session_id: &str) -> Result<Session, StoreError> {
            self.rows.get(session_id).cloned().ok_or(StoreError::NotFound)
        }

        fn list(
            &self,
            status: Option<SessionStatus>,
            include_closed: bool,
        ) -> Result<Vec<Session>, StoreError> {
            let mut out: Vec<Session> = self
                .rows
                .values()
                .filter(|s| status.map_or(true, |want| s.status == want))
                .filter(|s| include_closed || s.status != SessionStatus::Closed)
                .cloned()
                .collect();
            out.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(out)
        }

        fn rename(&mut self, session_id: &str, title: &str) -> Result<(), StoreError> {
            let trimmed = title.trim();
            if trimmed.is_empty() || trimmed.chars().count() > 100 {
                return Err(StoreError::Validation("title length".into()));
            }
            let row = self.rows.get_mut(session_id).ok_or(StoreError::NotFound)?;
            row.title = trimmed.to_string();
            Ok(())
        }

        fn set_status(
            &mut self,
            session_id: &str,
            status: SessionStatus,
        ) -> Result<(), StoreError> {
            let row = self.rows.get_mut(session_id).ok_or(StoreError::NotFound)?;
            if row.status == SessionStatus::Closed {
                return Err(StoreError::Validation("session is closed".into()));
            }
            row.status = status;
            Ok(())
        }

        fn delete(&mut self, session_id: &str) -> Result<bool, StoreError> {
            Ok(self.rows.remove(session_id).is_some())
        }
    }

    #[derive(Default)]
    struct FakeControl {
        occupied: HashSet<String>,
        live: HashSet<String>,
        killed: Vec<String>,
        unbound: Vec<String>,
    }

    impl BackendControl for FakeControl {
        fn occupied(&self, backend_id: &str) -> Result<bool, ControlError> {
            if !self.live.contains(backend_id) {
                return Err(ControlError::NotFound);
            }
            Ok(self.occupied.contains(backend_id))
        }

        fn force_unbind(&mut self, backend_id: &str) -> Result<bool, ControlError> {
            self.unbound.push(backend_id.to_string());
            Ok(self.occupied.remove(backend_id))
        }

        fn kill(&mut self, backend_id: &str) -> Result<(), ControlError> {
            if !self.live.remove(backend_id) {
                return Err(ControlError::NotFound);
            }
            self.killed.push(backend_id.to_string());
            Ok(())
        }
    }

    fn mux_with(
        store: FakeStore,
        control: FakeControl,
    ) -> TabMultiplexer<FakeStore, FakeControl> {
        TabMultiplexer::new(store, control)
    }

    #[test]
    fn cap_rejects_without_side_effects() {
        let mut mux = mux_with(FakeStore::new(), FakeControl::default());
        for _ in 0..MAX_TABS {
            assert!(matches!(mux.open_new(None), OpenOutcome::Opened(_)));
        }
        assert_eq!(mux.open_new(Some("one too many")), OpenOutcome::Rejected);
        assert_eq!(mux.tabs().len(), MAX_TABS);
    }

    #[test]
    fn open_existing_unoccupied_reuses_backend() {
        let store = FakeStore::new().with_session("s1", "pty-7", SessionStatus::Disconnected);
        let mut control = FakeControl::default();
        control.live.insert("pty-7".into());

        let mut mux = mux_with(store, control);
        let outcome = mux.open("s1").unwrap();
        let OpenOutcome::Opened(tab_id) = outcome else {
            panic!("expected Opened, got {outcome:?}");
        };
        let tab = mux.tab(tab_id).unwrap();
        assert_eq!(tab.backend_id.as_deref(), Some("pty-7"));
        assert_eq!(tab.title, "title-s1");
    }

    #[test]
    fn open_occupied_prompts_instead_of_binding() {
        let store = FakeStore::new().with_session("s1", "pty-7", SessionStatus::Active);
        let mut control = FakeControl::default();
        control.live.insert("pty-7".into());
        control.occupied.insert("pty-7".into());

        let mut mux = mux_with(store, control);
        assert_eq!(
            mux.open("s1").unwrap(),
            OpenOutcome::TakeoverRequired {
                session_id: "s1".into(),
                backend_id: "pty-7".into(),
            }
        );
        // Nothing created until the user decides.
        assert!(mux.tabs().is_empty());
        assert!(mux.control.unbound.is_empty());

        let outcome = mux.confirm_takeover("s1", "pty-7").unwrap();
        assert!(matches!(outcome, OpenOutcome::Opened(_)));
        assert_eq!(mux.control.unbound, vec!["pty-7".to_string()]);
        assert_eq!(mux.tabs().len(), 1);
    }

    #[test]
    fn open_same_session_twice_focuses_existing_tab() {
        let store = FakeStore::new().with_session("s1", "pty-7", SessionStatus::Disconnected);
        let mut control = FakeControl::default();
        control.live.insert("pty-7".into());

        let mut mux = mux_with(store, control);
        let OpenOutcome::Opened(first) = mux.open("s1").unwrap() else {
            panic!("expected Opened");
        };
        assert_eq!(mux.open("s1").unwrap(), OpenOutcome::Opened(first));
        assert_eq!(mux.tabs().len(), 1);
    }

    #[test]
    fn open_closed_session_spawns_fresh() {
        let store = FakeStore::new().with_session("s1", "pty-7", SessionStatus::Closed);
        let mut mux = mux_with(store, FakeControl::default());

        let OpenOutcome::Opened(tab_id) = mux.open("s1").unwrap() else {
            panic!("expected Opened");
        };
        // The old process is gone; the attach must not name it.
        assert_eq!(mux.tab(tab_id).unwrap().backend_id, None);
    }

    #[test]
    fn open_with_dead_backend_spawns_fresh() {
        let store = FakeStore::new().with_session("s1", "pty-7", SessionStatus::Disconnected);
        // pty-7 is not in `live`: the gateway lost it (e.g. host restart).
        let mut mux = mux_with(store, FakeControl::default());

        let OpenOutcome::Opened(tab_id) = mux.open("s1").unwrap() else {
            panic!("expected Opened");
        };
        assert_eq!(mux.tab(tab_id).unwrap().backend_id, None);
    }

    #[test]
    fn close_tombstones_and_kills() {
        let store = FakeStore::new().with_session("s1", "pty-7", SessionStatus::Active);
        let mut control = FakeControl::default();
        control.live.insert("pty-7".into());

        let mut mux = mux_with(store, control);
        let OpenOutcome::Opened(tab_id) = mux.open("s1").unwrap() else {
            panic!("expected Opened");
        };
        mux.close(tab_id).unwrap();

        assert!(mux.tabs().is_empty());
        assert_eq!(mux.store.get("s1").unwrap().status, SessionStatus::Closed);
        assert_eq!(mux.control.killed, vec!["pty-7".to_string()]);
        assert_eq!(mux.close(tab_id), Err(StoreError::NotFound));
    }

    #[test]
    fn close_tolerates_already_dead_backend() {
        let store = FakeStore::new().with_session("s1", "pty-7", SessionStatus::Disconnected);
        let mut control = FakeControl::default();
        control.live.insert("pty-7".into());

        let mut mux = mux_with(store, control);
        let OpenOutcome::Opened(tab_id) = mux.open("s1").unwrap() else {
            panic!("expected Opened");
        };

        // The process dies between opening the tab and closing it.
        mux.control.live.remove("pty-7");
        mux.close(tab_id).unwrap();
        assert_eq!(mux.store.get("s1").unwrap().status, SessionStatus::Closed);
        assert!(mux.control.killed.is_empty());
    }

    #[test]
    fn rename_writes_registry_before_tab() {
        let store = FakeStore::new().with_session("s1", "pty-7", SessionStatus::Disconnected);
        let mut control = FakeControl::default();
        control.live.insert("pty-7".into());

        let mut mux = mux_with(store, control);
        let OpenOutcome::Opened(tab_id) = mux.open("s1").unwrap() else {
            panic!("expected Opened");
        };

        mux.rename(tab_id, "  build box  ").unwrap();
        assert_eq!(mux.tab(tab_id).unwrap().title, "build box");
        assert_eq!(mux.store.get("s1").unwrap().title, "build box");

        // A rejected rename leaves the tab label alone.
        let err = mux.rename(tab_id, "   ").unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        assert_eq!(mux.tab(tab_id).unwrap().title, "build box");
    }

    #[test]
    fn delete_session_removes_row_tab_and_process() {
        let store = FakeStore::new().with_session("s1", "pty-7", SessionStatus::Disconnected);
        let mut control = FakeControl::default();
        control.live.insert("pty-7".into());

        let mut mux = mux_with(store, control);
        let OpenOutcome::Opened(_) = mux.open("s1").unwrap() else {
            panic!("expected Opened");
        };

        mux.delete_session("s1").unwrap();
        assert!(mux.tabs().is_empty());
        assert_eq!(mux.store.get("s1"), Err(StoreError::NotFound));
        assert_eq!(mux.control.killed, vec!["pty-7".to_string()]);

        // Deleting again is a no-op.
        mux.delete_session("s1").unwrap();
    }

    #[test]
    fn rehydrate_skips_closed_and_respects_cap() {
        let mut store = FakeStore::new();
        for n in 0..12 {
            let status = if n == 0 {
                SessionStatus::Closed
            } else {
                SessionStatus::Disconnected
            };
            store = store.with_session(&format!("s{n:02}"), &format!("pty-{n}"), status);
        }
        let mut mux = mux_with(store, FakeControl::default());
        mux.rehydrate().unwrap();

        assert_eq!(mux.tabs().len(), MAX_TABS);
        assert!(mux.tabs().iter().all(|t| t.session_id != "s00"));
    }

    #[test]
    fn refresh_tab_picks_up_assigned_backend() {
        let mut mux = mux_with(FakeStore::new(), FakeControl::default());
        let OpenOutcome::Opened(tab_id) = mux.open_new(None) else {
            panic!("expected Opened");
        };
        assert_eq!(mux.tab(tab_id).unwrap().backend_id, None);

        // The gateway attached, spawned pty-1, and wrote the row through.
        let session_id = mux.tab(tab_id).unwrap().session_id.clone();
        mux.store.rows.insert(
            session_id.clone(),
            Session {
                id: session_id,
                backend_id: "pty-1".into(),
                title: "Terminal".into(),
                status: SessionStatus::Active,
                cols: 80,
                rows: 24,
                created_at: "2026-08-27T00:00:00Z".into(),
                last_connected_at: "2026-08-27T00:00:00Z".into(),
                occupied: true,
            },
        );

        mux.refresh_tab(tab_id).unwrap();
        assert_eq!(mux.tab(tab_id).unwrap().backend_id.as_deref(), Some("pty-1"));
    }
}
