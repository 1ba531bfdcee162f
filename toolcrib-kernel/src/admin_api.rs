/**
 * API ADMIN - Catalogues machines / types d'outils, journal, réglages
 *
 * RÔLE : CRUD admin sur le store. Chaque action admin ajoute une entrée au
 * journal d'activité dans la même révision (fait par le store).
 *
 * Suppression : refusée (409 in_use) si des placements référencent l'entité,
 * sauf ?cascade=true qui supprime aussi les placements.
 *
 * POST /api/admin/clear remet le store à neuf (catalogue standard compris).
 */

use crate::http::{ApiResult, AppState};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use toolcrib_core::render::{self, Dashboard, UsageReport};
use toolcrib_core::{
    ActivityEntry, DeletePolicy, Machine, MachineUpdate, NewMachine, Settings, ToolTypes,
};

const DEFAULT_ACTIVITY_LIMIT: usize = 50;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/machines", get(list_machines).post(add_machine))
        .route("/api/machines/{id}", put(update_machine).delete(delete_machine))
        .route("/api/tool-types", get(list_tool_types))
        .route("/api/tool-types/{name}", put(put_tool_type).delete(delete_tool_type))
        .route("/api/tool-types/{name}/rename", post(rename_tool_type))
        .route("/api/activity", get(list_activity).post(add_activity))
        .route("/api/settings", get(get_settings).put(put_settings))
        .route("/api/dashboard", get(get_dashboard))
        .route("/api/reports/usage", get(get_usage_report))
        .route("/api/admin/clear", post(clear_all))
}

#[derive(Debug, Default, Deserialize)]
struct CascadeQuery {
    #[serde(default)]
    cascade: bool,
}

// ---- machines ----

// GET /api/machines
async fn list_machines(State(app): State<AppState>) -> Json<Vec<Machine>> {
    Json(app.store.machines())
}

// POST /api/machines
async fn add_machine(State(app): State<AppState>, Json(req): Json<NewMachine>) -> ApiResult<(StatusCode, Json<Machine>)> {
    let machine = app.store.add_machine(req)?;
    Ok((StatusCode::CREATED, Json(machine)))
}

// PUT /api/machines/{id}
async fn update_machine(
    State(app): State<AppState>,
    Path(id): Path<u64>,
    Json(update): Json<MachineUpdate>,
) -> ApiResult<Json<Machine>> {
    Ok(Json(app.store.update_machine(id, update)?))
}

#[derive(Serialize)]
struct MachineDeleted {
    deleted: Machine,
    removed_placements: usize,
}

// DELETE /api/machines/{id}?cascade=true
async fn delete_machine(
    State(app): State<AppState>,
    Path(id): Path<u64>,
    Query(q): Query<CascadeQuery>,
) -> ApiResult<Json<MachineDeleted>> {
    let (deleted, removed_placements) = app
        .store
        .delete_machine(id, DeletePolicy::from_cascade_flag(q.cascade))?;
    Ok(Json(MachineDeleted {
        deleted,
        removed_placements,
    }))
}

// ---- types d'outils ----

/// Liste JSON ou texte séparé par des virgules ("6, 8, 10")
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SizesInput {
    List(Vec<String>),
    Text(String),
}

impl SizesInput {
    fn into_sizes(self) -> Vec<String> {
        match self {
            SizesInput::List(list) => list,
            SizesInput::Text(text) => text.split(',').map(|s| s.trim().to_string()).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ToolTypeBody {
    sizes: Option<SizesInput>,
}

#[derive(Serialize)]
struct ToolTypeSaved {
    name: String,
    created: bool,
}

// GET /api/tool-types
async fn list_tool_types(State(app): State<AppState>) -> Json<ToolTypes> {
    Json(app.store.tool_types())
}

// PUT /api/tool-types/{name}
async fn put_tool_type(
    State(app): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<ToolTypeBody>,
) -> ApiResult<Json<ToolTypeSaved>> {
    let sizes = body.sizes.map(SizesInput::into_sizes).unwrap_or_default();
    let created = app.store.put_tool_type(&name, sizes)?;
    Ok(Json(ToolTypeSaved {
        name: name.trim().to_string(),
        created,
    }))
}

#[derive(Serialize)]
struct ToolTypeDeleted {
    name: String,
    removed_placements: usize,
}

// DELETE /api/tool-types/{name}?cascade=true
async fn delete_tool_type(
    State(app): State<AppState>,
    Path(name): Path<String>,
    Query(q): Query<CascadeQuery>,
) -> ApiResult<Json<ToolTypeDeleted>> {
    let removed_placements = app
        .store
        .delete_tool_type(&name, DeletePolicy::from_cascade_flag(q.cascade))?;
    Ok(Json(ToolTypeDeleted {
        name,
        removed_placements,
    }))
}

#[derive(Deserialize)]
struct RenameBody {
    to: String,
}

#[derive(Serialize)]
struct ToolTypeRenamed {
    from: String,
    to: String,
    placements: usize,
}

// POST /api/tool-types/{name}/rename
async fn rename_tool_type(
    State(app): State<AppState>,
    Path(from): Path<String>,
    Json(body): Json<RenameBody>,
) -> ApiResult<Json<ToolTypeRenamed>> {
    let placements = app.store.rename_tool_type(&from, &body.to)?;
    Ok(Json(ToolTypeRenamed {
        from,
        to: body.to.trim().to_string(),
        placements,
    }))
}

// ---- journal / réglages ----

#[derive(Deserialize)]
struct ActivityQuery {
    limit: Option<usize>,
}

// GET /api/activity?limit= (plus récent d'abord)
async fn list_activity(State(app): State<AppState>, Query(q): Query<ActivityQuery>) -> Json<Vec<ActivityEntry>> {
    let limit = q.limit.unwrap_or(DEFAULT_ACTIVITY_LIMIT);
    Json(render::recent_activity(&app.store.activity_log(), limit))
}

#[derive(Deserialize)]
struct ActivityBody {
    action: String,
}

// POST /api/activity
async fn add_activity(
    State(app): State<AppState>,
    Json(body): Json<ActivityBody>,
) -> ApiResult<(StatusCode, Json<ActivityEntry>)> {
    let entry = app.store.add_activity(&body.action)?;
    Ok((StatusCode::CREATED, Json(entry)))
}

// GET /api/settings
async fn get_settings(State(app): State<AppState>) -> Json<Settings> {
    Json(app.store.settings())
}

// PUT /api/settings
async fn put_settings(State(app): State<AppState>, Json(settings): Json<Settings>) -> ApiResult<Json<Settings>> {
    app.store.save_settings(settings)?;
    Ok(Json(app.store.settings()))
}

// ---- tableaux de bord ----

// GET /api/dashboard
async fn get_dashboard(State(app): State<AppState>) -> Json<Dashboard> {
    Json(render::dashboard(&app.store.get_all()))
}

// GET /api/reports/usage
async fn get_usage_report(State(app): State<AppState>) -> Json<UsageReport> {
    Json(render::usage_report(&app.store.tools(), chrono::Utc::now()))
}

#[derive(Serialize)]
struct Cleared {
    success: bool,
    revision: u64,
}

// POST /api/admin/clear
async fn clear_all(State(app): State<AppState>) -> ApiResult<Json<Cleared>> {
    let revision = app.store.clear()?;
    Ok(Json(Cleared { success: true, revision }))
}
