use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use tether_db::{sessions, SessionPatch};
use tether_proto::session::{Session, SessionStatus};

use crate::error::ApiError;
use crate::state::AppState;
use crate::ws;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route(
            "/api/sessions/:id",
            get(get_session).patch(update_session).delete(delete_session),
        )
        .route("/api/sessions/:id/title", patch(rename_session))
        .route("/api/backends/:backend_id/kill", post(kill_backend))
        .route("/api/backends/:backend_id/takeover", post(takeover_backend))
        .route("/ws", get(ws::upgrade))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
    #[serde(default)]
    include_closed: bool,
}

async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Session>>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(|raw| {
            SessionStatus::parse(raw)
                .ok_or_else(|| ApiError::Validation(format!("unknown status: {raw}")))
        })
        .transpose()?;

    let mut rows = {
        let db = state.lock_db();
        sessions::list(&db, status, query.include_closed)?
    };

    // Occupancy is live state, stamped on at the boundary.
    let occupied = state.gateway.occupied_backends();
    for row in &mut rows {
        row.occupied = occupied.contains(&row.backend_id);
    }
    Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
struct CreateBody {
    id: String,
    backend_id: String,
    title: Option<String>,
    #[serde(default = "default_cols")]
    cols: u16,
    #[serde(default = "default_rows")]
    rows: u16,
}

fn default_cols() -> u16 {
    80
}

fn default_rows() -> u16 {
    24
}

/// Create-or-resume without attaching. The normal path creates the row as a
/// side effect of the first attach; this endpoint covers pre-registering a
/// session or re-pointing one at a known backend.
async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateBody>,
) -> Result<Json<Session>, ApiError> {
    let mut session = {
        let mut db = state.lock_db();
        sessions::create_or_resume(
            &mut db,
            &body.id,
            &body.backend_id,
            body.title.as_deref(),
            body.cols,
            body.rows,
        )?
    };
    session.occupied = state.gateway.occupied(&session.backend_id);
    Ok(Json(session))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    let mut session = {
        let db = state.lock_db();
        sessions::get(&db, &id)?
    };
    session.occupied = state.gateway.occupied(&session.backend_id);
    Ok(Json(session))
}

#[derive(Debug, Deserialize)]
struct UpdateBody {
    title: Option<String>,
    status: Option<String>,
    cols: Option<u16>,
    rows: Option<u16>,
}

async fn update_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateBody>,
) -> Result<Json<Session>, ApiError> {
    let patch = SessionPatch {
        title: body.title,
        status: body.status,
        cols: body.cols,
        rows: body.rows,
    };
    let mut session = {
        let mut db = state.lock_db();
        sessions::update(&mut db, &id, &patch)?
    };
    session.occupied = state.gateway.occupied(&session.backend_id);
    Ok(Json(session))
}

#[derive(Debug, Deserialize)]
struct RenameBody {
    title: String,
}

async fn rename_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<RenameBody>,
) -> Result<Json<Session>, ApiError> {
    let mut session = {
        let db = state.lock_db();
        sessions::rename(&db, &id, &body.title)?
    };
    session.occupied = state.gateway.occupied(&session.backend_id);
    Ok(Json(session))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    // Learn the backend before the row disappears, so a still-running
    // process does not leak.
    let backend_id = {
        let db = state.lock_db();
        match sessions::get(&db, &id) {
            Ok(session) => Some(session.backend_id),
            Err(tether_db::DbError::NotFound) => None,
            Err(err) => return Err(err.into()),
        }
    };

    {
        let db = state.lock_db();
        sessions::delete(&db, &id)?;
    }
    if let Some(backend_id) = backend_id {
        state.gateway.kill(&backend_id);
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn kill_backend(
    State(state): State<AppState>,
    Path(backend_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.gateway.kill(&backend_id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound)
    }
}

#[derive(Debug, Serialize)]
struct TakeoverResponse {
    /// Whether a live binder was actually displaced.
    displaced: bool,
}

async fn takeover_backend(
    State(state): State<AppState>,
    Path(backend_id): Path<String>,
) -> Result<Json<TakeoverResponse>, ApiError> {
    if !state.gateway.has_backend(&backend_id) {
        return Err(ApiError::NotFound);
    }
    let displaced = state.gateway.force_unbind(&backend_id);
    Ok(Json(TakeoverResponse { displaced }))
}
