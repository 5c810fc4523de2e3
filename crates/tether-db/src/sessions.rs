use rusqlite::{params, Connection, OptionalExtension};

use tether_proto::session::{Session, SessionStatus};

pub const TITLE_MAX_CHARS: usize = 100;
pub const DEFAULT_TITLE: &str = "Terminal";

/// Typed failures from registry operations. Validation and NotFound are
/// rejected synchronously, before any row is touched.
#[derive(Debug)]
pub enum DbError {
    NotFound,
    Validation(String),
    Sqlite(rusqlite::Error),
}

impl std::fmt::Display for DbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbError::NotFound => write!(f, "session not found"),
            DbError::Validation(msg) => write!(f, "validation failed: {msg}"),
            DbError::Sqlite(err) => write!(f, "database error: {err}"),
        }
    }
}

impl std::error::Error for DbError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DbError::Sqlite(err) => Some(err),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(err: rusqlite::Error) -> Self {
        DbError::Sqlite(err)
    }
}

/// Optional fields for [`update`]. `status` arrives as the raw wire string
/// and is validated here.
#[derive(Debug, Default, Clone)]
pub struct SessionPatch {
    pub title: Option<String>,
    pub status: Option<String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

/// Create a session row, or resume it if `id` already exists.
///
/// Resuming refreshes `backend_id`, sets the status back to active, and
/// bumps `last_connected_at`; it never produces a second row. A closed row
/// is recreated wholesale under the same id (fresh `created_at`), which is
/// the only way out of the closed state.
pub fn create_or_resume(
    conn: &mut Connection,
    id: &str,
    backend_id: &str,
    title: Option<&str>,
    cols: u16,
    rows: u16,
) -> Result<Session, DbError> {
    if id.trim().is_empty() {
        return Err(DbError::Validation("session id must not be empty".into()));
    }
    validate_size(Some(cols), Some(rows))?;
    let title = match title {
        Some(t) => validated_title(t)?,
        None => DEFAULT_TITLE.to_string(),
    };

    let tx = conn.transaction()?;
    let existing: Option<String> = tx
        .query_row(
            "SELECT status FROM sessions WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;

    match existing.as_deref() {
        Some("closed") => {
            // Delete-and-recreate under the same id, collapsed into one write.
            tx.execute(
                "UPDATE sessions
                 SET backend_id = ?2, title = ?3, status = 'active',
                     cols = ?4, rows = ?5,
                     created_at = datetime('now'),
                     last_connected_at = datetime('now')
                 WHERE id = ?1",
                params![id, backend_id, title, cols, rows],
            )?;
        }
        Some(_) => {
            tx.execute(
                "UPDATE sessions
                 SET backend_id = ?2, status = 'active',
                     last_connected_at = datetime('now')
                 WHERE id = ?1",
                params![id, backend_id],
            )?;
        }
        None => {
            tx.execute(
                "INSERT INTO sessions (id, backend_id, title, status, cols, rows)
                 VALUES (?1, ?2, ?3, 'active', ?4, ?5)",
                params![id, backend_id, title, cols, rows],
            )?;
        }
    }

    let session = row_by_id(&tx, id)?.ok_or(DbError::NotFound)?;
    tx.commit()?;
    Ok(session)
}

pub fn get(conn: &Connection, id: &str) -> Result<Session, DbError> {
    row_by_id(conn, id)?.ok_or(DbError::NotFound)
}

/// List sessions ordered by `last_connected_at` descending. Closed rows are
/// tombstones: excluded unless explicitly requested or filtered for.
pub fn list(
    conn: &Connection,
    status: Option<SessionStatus>,
    include_closed: bool,
) -> Result<Vec<Session>, DbError> {
    const COLUMNS: &str =
        "id, backend_id, title, status, cols, rows, created_at, last_connected_at";
    const ORDER: &str = "ORDER BY last_connected_at DESC, created_at DESC";

    let sessions = match status {
        Some(s) => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM sessions WHERE status = ?1 {ORDER}"
            ))?;
            let rows = stmt.query_map(params![s.as_str()], map_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        }
        None if include_closed => {
            let mut stmt = conn.prepare(&format!("SELECT {COLUMNS} FROM sessions {ORDER}"))?;
            let rows = stmt.query_map([], map_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        }
        None => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM sessions WHERE status != 'closed' {ORDER}"
            ))?;
            let rows = stmt.query_map([], map_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        }
    };
    Ok(sessions)
}

/// Partially update a row. All inputs are validated before anything is
/// written; on any error the row is untouched. A closed session rejects
/// every status change.
pub fn update(conn: &mut Connection, id: &str, patch: &SessionPatch) -> Result<Session, DbError> {
    let title = patch.title.as_deref().map(validated_title).transpose()?;
    let status = patch
        .status
        .as_deref()
        .map(|raw| {
            SessionStatus::parse(raw)
                .ok_or_else(|| DbError::Validation(format!("invalid status: {raw:?}")))
        })
        .transpose()?;
    validate_size(patch.cols, patch.rows)?;

    let tx = conn.transaction()?;
    let current = row_by_id(&tx, id)?.ok_or(DbError::NotFound)?;
    if current.status == SessionStatus::Closed {
        if let Some(next) = status {
            if next != SessionStatus::Closed {
                return Err(DbError::Validation(
                    "session is closed; delete and recreate it instead".into(),
                ));
            }
        }
    }

    tx.execute(
        "UPDATE sessions
         SET title = COALESCE(?2, title),
             status = COALESCE(?3, status),
             cols = COALESCE(?4, cols),
             rows = COALESCE(?5, rows)
         WHERE id = ?1",
        params![id, title, status.map(SessionStatus::as_str), patch.cols, patch.rows],
    )?;

    let session = row_by_id(&tx, id)?.ok_or(DbError::NotFound)?;
    tx.commit()?;
    Ok(session)
}

/// Rename a session. The trimmed title must be 1-100 characters.
pub fn rename(conn: &Connection, id: &str, title: &str) -> Result<Session, DbError> {
    let title = validated_title(title)?;
    let changed = conn.execute(
        "UPDATE sessions SET title = ?2 WHERE id = ?1",
        params![id, title],
    )?;
    if changed == 0 {
        return Err(DbError::NotFound);
    }
    row_by_id(conn, id)?.ok_or(DbError::NotFound)
}

/// Delete a session row. Returns false when no such row existed, which is
/// not an error: delete is idempotent.
pub fn delete(conn: &Connection, id: &str) -> Result<bool, DbError> {
    let changed = conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
    Ok(changed > 0)
}

/// Gateway-reported status transition for whichever row holds `backend_id`.
/// Closed rows stay closed even if the report arrives late.
pub fn set_status_by_backend(
    conn: &Connection,
    backend_id: &str,
    status: SessionStatus,
) -> Result<(), DbError> {
    conn.execute(
        "UPDATE sessions SET status = ?2
         WHERE backend_id = ?1 AND status != 'closed'",
        params![backend_id, status.as_str()],
    )?;
    Ok(())
}

/// Gateway-reported successful bind: back to active, recency bumped.
pub fn touch_by_backend(conn: &Connection, backend_id: &str) -> Result<(), DbError> {
    conn.execute(
        "UPDATE sessions
         SET status = 'active', last_connected_at = datetime('now')
         WHERE backend_id = ?1 AND status != 'closed'",
        params![backend_id],
    )?;
    Ok(())
}

fn validated_title(title: &str) -> Result<String, DbError> {
    let trimmed = title.trim();
    let chars = trimmed.chars().count();
    if chars == 0 {
        return Err(DbError::Validation("title must not be empty".into()));
    }
    if chars > TITLE_MAX_CHARS {
        return Err(DbError::Validation(format!(
            "title too long ({chars} chars, max {TITLE_MAX_CHARS})"
        )));
    }
    Ok(trimmed.to_string())
}

fn validate_size(cols: Option<u16>, rows: Option<u16>) -> Result<(), DbError> {
    if cols == Some(0) || rows == Some(0) {
        return Err(DbError::Validation("cols and rows must be positive".into()));
    }
    Ok(())
}

fn row_by_id(conn: &Connection, id: &str) -> Result<Option<Session>, DbError> {
    let session = conn
        .query_row(
            "SELECT id, backend_id, title, status, cols, rows, created_at, last_connected_at
             FROM sessions WHERE id = ?1",
            params![id],
            map_row,
        )
        .optional()?;
    Ok(session)
}

fn map_row(row: &rusqlite::Row) -> rusqlite::Result<Session> {
    let status: String = row.get(3)?;
    let status = SessionStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown session status: {status:?}").into(),
        )
    })?;
    Ok(Session {
        id: row.get(0)?,
        backend_id: row.get(1)?,
        title: row.get(2)?,
        status,
        cols: row.get(4)?,
        rows: row.get(5)?,
        created_at: row.get(6)?,
        last_connected_at: row.get(7)?,
        occupied: false,
    })
}
