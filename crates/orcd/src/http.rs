//! HTTP transport surface (Section 6): local-only REST + SSE API over the
//! Run Service, Storage, and Workspace Manager.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    routing::{get, post, put},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use orc_core::{Id, Project, TaskType};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::broker::Broker;
use crate::run_service::{CreateRunInput, RunService, RunServiceError};
use crate::scheduler::Scheduler;
use crate::storage::Storage;
use crate::workspace::WorkspaceManager;

pub struct AppState {
    pub storage: Arc<Storage>,
    pub broker: Arc<Broker>,
    pub workspace: Arc<WorkspaceManager>,
    pub run_service: Arc<RunService>,
    pub scheduler: Arc<Scheduler>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    detail: String,
}

fn err(status: StatusCode, detail: impl Into<String>) -> (StatusCode, Json<ErrorBody>) {
    (status, Json(ErrorBody { detail: detail.into() }))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/projects/{id}", put(upsert_project))
        .route("/projects", get(list_projects))
        .route("/projects/{id}/runs", post(create_run))
        .route("/runs", get(list_runs))
        .route("/runs/{id}", get(get_run))
        .route("/runs/{id}/steps", get(list_steps))
        .route("/runs/{id}/stream", get(stream_run))
        .route("/runs/{id}/diff", get(get_diff))
        .route("/runs/{id}/cancel", post(cancel_run))
        .route("/runs/{id}/workspace/files", get(list_workspace_files))
        .route("/runs/{id}/workspace/files/{*path}", get(read_workspace_file))
        .route("/runs/{id}/artifacts", get(list_artifacts))
        .route("/runs/{id}/artifacts/{aid}/download", get(download_artifact))
        .route("/patterns/{run_id}", get(get_pattern))
        .with_state(state)
}

pub async fn serve(state: Arc<AppState>, port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("HTTP server listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await
}

#[derive(Debug, Deserialize)]
struct UpsertProjectBody {
    id: String,
    name: String,
    #[serde(default)]
    task_type: Option<TaskType>,
}

async fn upsert_project(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<UpsertProjectBody>,
) -> Result<Json<Project>, (StatusCode, Json<ErrorBody>)> {
    if id.is_empty() || id.len() > 64 || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(err(StatusCode::BAD_REQUEST, "id must match [A-Za-z0-9_-]{1,64}"));
    }
    if body.id != id {
        return Err(err(StatusCode::BAD_REQUEST, "body id must match path id"));
    }
    let project = Project {
        id,
        name: body.name,
        task_type: body.task_type,
        created_at: chrono::Utc::now(),
    };
    state
        .storage
        .upsert_project(&project)
        .await
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let stored = state
        .storage
        .get_project(&project.id)
        .await
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .unwrap_or(project);
    Ok(Json(stored))
}

async fn list_projects(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Project>>, (StatusCode, Json<ErrorBody>)> {
    let projects = state
        .storage
        .list_projects()
        .await
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(projects))
}

#[derive(Debug, Deserialize)]
struct CreateRunBody {
    project_id: String,
    name: String,
    instructions: String,
    #[serde(default)]
    task_type: Option<TaskType>,
    #[serde(default)]
    reference_run_id: Option<String>,
    #[serde(default)]
    from_run_id: Option<String>,
}

async fn create_run(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
    Json(body): Json<CreateRunBody>,
) -> Result<Json<orc_core::Run>, (StatusCode, Json<ErrorBody>)> {
    let run = state
        .run_service
        .create_run(CreateRunInput {
            project_id,
            name: body.name,
            instructions: body.instructions,
            task_type: body.task_type.unwrap_or_default(),
            reference_run_id: body.reference_run_id.map(Id::from_string),
            from_run_id: body.from_run_id.map(Id::from_string),
        })
        .await
        .map_err(|e| match e {
            RunServiceError::InvalidInput(msg) => err(StatusCode::BAD_REQUEST, msg),
            RunServiceError::Storage(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        })?;

    // The run is persisted as `queued` here; the daemon's claim loop (not
    // this handler) is what admits it into a lifecycle task, so
    // `max_concurrent_runs` is enforced uniformly regardless of how the run
    // was created.
    Ok(Json(run))
}

#[derive(Debug, Deserialize, Default)]
struct ListRunsQuery {
    project_id: Option<String>,
}

async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<Vec<orc_core::Run>>, (StatusCode, Json<ErrorBody>)> {
    let runs = state
        .storage
        .list_runs(query.project_id.as_deref())
        .await
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(runs))
}

async fn run_or_404(storage: &Storage, id: &str) -> Result<orc_core::Run, (StatusCode, Json<ErrorBody>)> {
    storage
        .get_run(&Id::from_string(id))
        .await
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .ok_or_else(|| err(StatusCode::NOT_FOUND, "run not found"))
}

async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<orc_core::Run>, (StatusCode, Json<ErrorBody>)> {
    Ok(Json(run_or_404(&state.storage, &id).await?))
}

async fn list_steps(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<orc_core::Step>>, (StatusCode, Json<ErrorBody>)> {
    run_or_404(&state.storage, &id).await?;
    let steps = state
        .storage
        .list_steps(&Id::from_string(id))
        .await
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(steps))
}

async fn stream_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, std::convert::Infallible>>>, (StatusCode, Json<ErrorBody>)>
{
    let run = run_or_404(&state.storage, &id).await?;
    let run_id = Id::from_string(id);

    if run.status.is_terminal() {
        let snapshot = orc_core::BrokerEvent::status(run.status);
        let json = serde_json::to_string(&snapshot).unwrap_or_default();
        let stream = futures_util::stream::once(async move { Ok(SseEvent::default().data(json)) });
        return Ok(Sse::new(stream.boxed()).keep_alive(KeepAlive::default()));
    }

    let stream = state.broker.subscribe(&run_id).map(|event| {
        let json = serde_json::to_string(&event).unwrap_or_default();
        Ok(SseEvent::default().data(json))
    });
    Ok(Sse::new(stream.boxed()).keep_alive(KeepAlive::default()))
}

async fn get_diff(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<crate::workspace::DiffSummary>, (StatusCode, Json<ErrorBody>)> {
    let run = run_or_404(&state.storage, &id).await?;
    let path = state
        .workspace
        .path(&run.project_id, &run.id)
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    state
        .workspace
        .diff_summary(&path)
        .map(Json)
        .ok_or_else(|| err(StatusCode::NOT_FOUND, "not a git workspace"))
}

async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, Json<ErrorBody>)> {
    let run_id = Id::from_string(id);
    let cancelled = state
        .run_service
        .cancel(&run_id)
        .await
        .map_err(|e| match e {
            RunServiceError::Storage(crate::storage::StorageError::RunNotFound(id)) => {
                err(StatusCode::NOT_FOUND, format!("run not found: {id}"))
            }
            other => err(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
        })?;
    if cancelled {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(err(StatusCode::BAD_REQUEST, "run is already terminal"))
    }
}

#[derive(Debug, Serialize)]
struct WorkspaceFilesResponse {
    total_files: usize,
    files: Vec<crate::workspace::FileEntry>,
}

async fn list_workspace_files(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<WorkspaceFilesResponse>, (StatusCode, Json<ErrorBody>)> {
    let run = run_or_404(&state.storage, &id).await?;
    let path = state
        .workspace
        .path(&run.project_id, &run.id)
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let files = state
        .workspace
        .list_files(&path)
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(WorkspaceFilesResponse { total_files: files.len(), files }))
}

async fn read_workspace_file(
    State(state): State<Arc<AppState>>,
    Path((id, rel)): Path<(String, String)>,
) -> Result<Vec<u8>, (StatusCode, Json<ErrorBody>)> {
    let run = run_or_404(&state.storage, &id).await?;
    let path = state
        .workspace
        .path(&run.project_id, &run.id)
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    state.workspace.read_file(&path, &rel).map_err(|e| match e {
        crate::workspace::WorkspaceError::PathTraversal => err(StatusCode::FORBIDDEN, e.to_string()),
        crate::workspace::WorkspaceError::Io(_) => err(StatusCode::NOT_FOUND, "file not found"),
        other => err(StatusCode::INTERNAL_SERVER_ERROR, other.to_string()),
    })
}

async fn list_artifacts(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<orc_core::Artifact>>, (StatusCode, Json<ErrorBody>)> {
    run_or_404(&state.storage, &id).await?;
    let artifacts = state
        .storage
        .list_artifacts(&Id::from_string(id))
        .await
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(artifacts))
}

async fn download_artifact(
    State(state): State<Arc<AppState>>,
    Path((id, aid)): Path<(String, String)>,
) -> Result<Vec<u8>, (StatusCode, Json<ErrorBody>)> {
    let run_id = Id::from_string(id);
    let artifact = state
        .storage
        .get_artifact(&run_id, &Id::from_string(aid))
        .await
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .ok_or_else(|| err(StatusCode::NOT_FOUND, "artifact not found"))?;
    std::fs::read(&artifact.path).map_err(|_| err(StatusCode::NOT_FOUND, "artifact file missing on disk"))
}

async fn get_pattern(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Json<orc_core::Pattern>, (StatusCode, Json<ErrorBody>)> {
    state
        .storage
        .get_pattern(&Id::from_string(run_id))
        .await
        .map_err(|e| err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map(Json)
        .ok_or_else(|| err(StatusCode::NOT_FOUND, "no pattern cached for this run"))
}
