/**
 * API REST TOOLCRIB - Serveur HTTP du kernel
 *
 * RÔLE :
 * Expose le snapshot autoritaire du store aux clients (agent CLI, pages web).
 *
 * FONCTIONNEMENT :
 * - Serveur Axum, JSON partout, CORS ouvert (*)
 * - /api/full-data + /api/sync : échange du snapshot entier, ETag = révision
 *   (If-None-Match → 304, If-Match périmé → 409)
 * - /api/changes?since=N : journal des révisions pour le polling
 * - /api/tools, /api/cells, /api/table : placements et projections
 * - routes admin dans admin_api.rs
 *
 * SÉCURITÉ :
 * - Header x-api-key exigé si TOOLCRIB_API_KEY est défini
 * - /health* toujours accessible
 */

use crate::admin_api;
use crate::health::{HealthTracker, KernelHealth};
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use toolcrib_core::render::{self, CellOption, MachineGroup, PlacementFilter};
use toolcrib_core::{ChangesPage, NewPlacement, Snapshot, Store, StoreError, ToolPlacement};
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub health_tracker: HealthTracker,
    pub api_key: Option<Arc<str>>,
}

impl AppState {
    pub fn new(store: Arc<Store>, health_tracker: HealthTracker, api_key: Option<String>) -> Self {
        Self {
            store,
            health_tracker,
            api_key: api_key.map(Arc::from),
        }
    }
}

// ---- erreurs ----

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code,
            message: message.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let status = match &e {
            StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            StoreError::CellOccupied { .. }
            | StoreError::Duplicate { .. }
            | StoreError::InUse { .. }
            | StoreError::CellsInUse { .. }
            | StoreError::Conflict { .. } => StatusCode::CONFLICT,
            StoreError::Serialization(_) | StoreError::Io(_) => {
                error!("[kernel] store failure: {e}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => StatusCode::BAD_REQUEST,
        };
        Self {
            status,
            code: e.code(),
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.message, "code": self.code }));
        (self.status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

// ---- middlewares ----

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    let path = req.uri().path();

    // Health check toujours accessible
    if path.starts_with("/health") || path.starts_with("/system/health") {
        return Ok(next.run(req).await);
    }

    let Some(expected) = app.api_key.as_deref() else {
        return Ok(next.run(req).await);
    };

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        warn!("[kernel] accès refusé sur {path}: x-api-key absent ou invalide");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

fn add_cors_headers(headers: &mut HeaderMap) {
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("content-type, x-api-key, if-match, if-none-match"),
    );
    headers.insert(header::ACCESS_CONTROL_EXPOSE_HEADERS, HeaderValue::from_static("etag"));
}

async fn cors(req: Request, next: Next) -> Response {
    // preflight répondu avant l'auth
    if req.method() == Method::OPTIONS {
        let mut res = StatusCode::NO_CONTENT.into_response();
        add_cors_headers(res.headers_mut());
        return res;
    }
    let mut res = next.run(req).await;
    add_cors_headers(res.headers_mut());
    res
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/api/full-data", get(get_full_data))
        .route("/api/sync", axum::routing::post(post_sync))
        .route("/api/changes", get(get_changes))
        .route("/api/tools", get(list_tools).post(add_tool))
        .route("/api/tools/{machine}/{cell}", axum::routing::delete(delete_tool))
        .route("/api/delete", get(legacy_delete))
        .route("/api/cells", get(get_cells))
        .route("/api/table", get(get_table))
        .merge(admin_api::routes())
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .layer(middleware::from_fn(cors))
        .with_state(app_state)
}

// ---- révisions / ETag ----

pub fn revision_etag(revision: u64) -> String {
    format!("\"{revision}\"")
}

/// `"12"`, `W/"12"` ou `12` → 12
pub fn parse_revision_tag(value: &str) -> Option<u64> {
    let v = value.trim();
    let v = v.strip_prefix("W/").unwrap_or(v);
    v.trim_matches('"').parse().ok()
}

fn etag_header(revision: u64) -> [(header::HeaderName, String); 1] {
    [(header::ETAG, revision_etag(revision))]
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}

// GET /system/health (état serveur)
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health_tracker.get_health(&app.store))
}

#[derive(Serialize)]
struct FullData {
    #[serde(flatten)]
    snapshot: Snapshot,
    timestamp: String,
}

// GET /api/full-data (snapshot complet)
async fn get_full_data(State(app): State<AppState>, headers: HeaderMap) -> Response {
    let snapshot = app.store.get_all();
    let revision = snapshot.revision;

    let not_modified = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_revision_tag)
        .is_some_and(|seen| seen == revision);
    if not_modified {
        return (StatusCode::NOT_MODIFIED, etag_header(revision)).into_response();
    }

    let body = FullData {
        snapshot,
        timestamp: now_rfc3339(),
    };
    (etag_header(revision), Json(body)).into_response()
}

#[derive(Serialize)]
struct SyncResponse {
    success: bool,
    revision: u64,
    timestamp: String,
}

// POST /api/sync (remplacement du snapshot par un client)
async fn post_sync(State(app): State<AppState>, headers: HeaderMap, Json(snapshot): Json<Snapshot>) -> ApiResult<Response> {
    let expected = match headers.get(header::IF_MATCH).and_then(|v| v.to_str().ok()) {
        None => None,
        Some(v) if v.trim() == "*" => None,
        Some(v) => Some(
            parse_revision_tag(v).ok_or_else(|| ApiError::bad_request("invalid_if_match", format!("invalid If-Match: {v}")))?,
        ),
    };

    let revision = app.store.save_all_if(snapshot, expected)?;
    info!("[kernel] snapshot remplacé par un client → révision {revision}");
    let body = SyncResponse {
        success: true,
        revision,
        timestamp: now_rfc3339(),
    };
    Ok((etag_header(revision), Json(body)).into_response())
}

#[derive(Deserialize)]
struct ChangesQuery {
    since: Option<u64>,
}

#[derive(Serialize)]
struct ChangesResponse {
    #[serde(flatten)]
    page: ChangesPage,
    has_changes: bool,
    current_timestamp: String,
}

// GET /api/changes?since=N (polling)
async fn get_changes(State(app): State<AppState>, Query(q): Query<ChangesQuery>) -> Json<ChangesResponse> {
    let since = q.since.unwrap_or(0);
    let page = app.store.changes_since(since);
    let has_changes = page.current_revision > since;
    Json(ChangesResponse {
        page,
        has_changes,
        current_timestamp: now_rfc3339(),
    })
}

// GET /api/tools (liste)
async fn list_tools(State(app): State<AppState>) -> Json<Vec<ToolPlacement>> {
    Json(app.store.tools())
}

#[derive(Serialize)]
struct AddToolResponse {
    success: bool,
    tool: ToolPlacement,
    #[serde(skip_serializing_if = "Option::is_none")]
    note: Option<String>,
}

// POST /api/tools (placement validé)
async fn add_tool(State(app): State<AppState>, Json(req): Json<NewPlacement>) -> ApiResult<(StatusCode, Json<AddToolResponse>)> {
    let added = app.store.add_placement(req)?;
    Ok((
        StatusCode::CREATED,
        Json(AddToolResponse {
            success: true,
            tool: added.placement,
            note: added.note,
        }),
    ))
}

// DELETE /api/tools/{machine}/{cell}
async fn delete_tool(State(app): State<AppState>, Path((machine, cell)): Path<(String, String)>) -> ApiResult<Json<ToolPlacement>> {
    Ok(Json(app.store.delete_placement(&machine, &cell)?))
}

#[derive(Deserialize)]
struct LegacyDeleteQuery {
    cell: Option<String>,
    machine: Option<String>,
}

// GET /api/delete?cell=&machine= (ancienne forme)
async fn legacy_delete(State(app): State<AppState>, Query(q): Query<LegacyDeleteQuery>) -> ApiResult<Json<serde_json::Value>> {
    let machine = q.machine.filter(|m| !m.is_empty()).ok_or(StoreError::MissingField("machine"))?;
    let cell = q.cell.filter(|c| !c.is_empty()).ok_or(StoreError::MissingField("cell"))?;
    // route historique : une cellule déjà vide répond quand même ok
    match app.store.delete_placement(&machine, &cell) {
        Ok(_) | Err(StoreError::NotFound { .. }) => Ok(Json(serde_json::json!({ "status": "ok" }))),
        Err(e) => Err(e.into()),
    }
}

#[derive(Deserialize)]
struct CellsQuery {
    #[serde(default)]
    machine: String,
}

// GET /api/cells?machine= (sélecteur de cellules)
async fn get_cells(State(app): State<AppState>, Query(q): Query<CellsQuery>) -> Json<Vec<CellOption>> {
    let snapshot = app.store.get_all();
    Json(render::cell_options(&snapshot.machines, &snapshot.tools, &q.machine))
}

// GET /api/table?machine=&toolType= (tableau groupé par machine)
async fn get_table(State(app): State<AppState>, Query(filter): Query<PlacementFilter>) -> Json<Vec<MachineGroup>> {
    let tools = render::filter_placements(&app.store.tools(), &filter);
    Json(render::group_by_machine(&tools, chrono::Utc::now()))
}
