//! Integration tests for the HTTP transport surface (Section 6).

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use http_body_util::BodyExt;
use orcd::broker::Broker;
use orcd::cli_tool::{CliTool, CliToolConfig, ProcessRegistry};
use orcd::http::{router, AppState};
use orcd::planner::PlannerClient;
use orcd::run_service::RunService;
use orcd::scheduler::Scheduler;
use orcd::storage::Storage;
use orcd::workspace::WorkspaceManager;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

async fn create_test_app() -> (axum::Router, TempDir) {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(Storage::new(&dir.path().join("test.db")).await.unwrap());
    storage.migrate_embedded().await.unwrap();

    let broker = Arc::new(Broker::new());
    let workspace = Arc::new(WorkspaceManager::new(dir.path().join("workspaces")));
    let registry = Arc::new(ProcessRegistry::new());
    let cli_tool = Arc::new(CliTool::new(CliToolConfig::default()));
    let planner = Arc::new(PlannerClient::new("http://localhost:5055".to_string(), false));

    let run_service = Arc::new(RunService::new(
        Arc::clone(&storage),
        Arc::clone(&broker),
        Arc::clone(&workspace),
        cli_tool,
        registry,
        planner,
        dir.path().join("artifacts"),
        true,
    ));
    let scheduler = Arc::new(Scheduler::new(Arc::clone(&storage), 3));

    let state = Arc::new(AppState { storage, broker, workspace, run_service: Arc::clone(&run_service), scheduler: Arc::clone(&scheduler) });

    // Mirror the daemon's own claim loop so runs created via the HTTP API
    // actually progress; admission happens here, not in the handler.
    tokio::spawn(async move {
        loop {
            match scheduler.claim_next_run().await {
                Ok(Some(run)) => {
                    let run_service = Arc::clone(&run_service);
                    let scheduler = Arc::clone(&scheduler);
                    let run_id = run.id.clone();
                    tokio::spawn(async move {
                        run_service.run_lifecycle(run_id).await;
                        scheduler.release_run();
                    });
                }
                Ok(None) => tokio::time::sleep(Duration::from_millis(20)).await,
                Err(_) => break,
            }
        }
    });

    (router(state), dir)
}

async fn body_to_json(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn request(app: &axum::Router, method: &str, uri: &str, body: Option<Value>) -> Response {
    let builder = Request::builder().method(method).uri(uri).header("content-type", "application/json");
    let body = match body {
        Some(value) => Body::from(serde_json::to_vec(&value).unwrap()),
        None => Body::empty(),
    };
    app.clone().oneshot(builder.body(body).unwrap()).await.unwrap()
}

#[tokio::test]
async fn project_upsert_rejects_mismatched_body_id() {
    let (app, _dir) = create_test_app().await;
    let response = request(&app, "PUT", "/projects/demo", Some(json!({"id": "other", "name": "Demo"}))).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_to_json(response).await;
    assert!(body["detail"].as_str().unwrap().contains("must match"));
}

#[tokio::test]
async fn project_upsert_and_list_round_trips() {
    let (app, _dir) = create_test_app().await;
    let response = request(&app, "PUT", "/projects/demo", Some(json!({"id": "demo", "name": "Demo", "task_type": "code"}))).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = request(&app, "GET", "/projects", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_to_json(response).await;
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["id"], "demo");
}

#[tokio::test]
async fn run_create_rejects_empty_instructions() {
    let (app, _dir) = create_test_app().await;
    request(&app, "PUT", "/projects/demo", Some(json!({"id": "demo", "name": "Demo"}))).await;

    let response = request(&app, "POST", "/projects/demo/runs", Some(json!({
        "project_id": "demo", "name": "r1", "instructions": ""
    }))).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn run_lifecycle_reaches_succeeded_and_exposes_detail() {
    let (app, _dir) = create_test_app().await;
    request(&app, "PUT", "/projects/demo", Some(json!({"id": "demo", "name": "Demo"}))).await;

    let response = request(&app, "POST", "/projects/demo/runs", Some(json!({
        "project_id": "demo", "name": "r1", "instructions": "fix the bug"
    }))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let created = body_to_json(response).await;
    let run_id = created["id"].as_str().unwrap().to_string();

    // Lifecycle runs on a spawned task; fake mode completes almost instantly.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let response = request(&app, "GET", &format!("/runs/{run_id}"), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let run = body_to_json(response).await;
    assert_eq!(run["status"], "SUCCEEDED");
    assert_eq!(run["progress"], 100);
    assert!(run["machine_summary"].is_object());

    let response = request(&app, "GET", &format!("/runs/{run_id}/steps"), None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let steps = body_to_json(response).await;
    assert!(!steps.as_array().unwrap().is_empty());

    let response = request(&app, "GET", "/runs", None).await;
    let runs = body_to_json(response).await;
    assert_eq!(runs.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn cancel_on_terminal_run_returns_bad_request() {
    let (app, _dir) = create_test_app().await;
    request(&app, "PUT", "/projects/demo", Some(json!({"id": "demo", "name": "Demo"}))).await;
    let response = request(&app, "POST", "/projects/demo/runs", Some(json!({
        "project_id": "demo", "name": "r1", "instructions": "fix the bug"
    }))).await;
    let created = body_to_json(response).await;
    let run_id = created["id"].as_str().unwrap().to_string();

    tokio::time::sleep(Duration::from_millis(200)).await;

    let response = request(&app, "POST", &format!("/runs/{run_id}/cancel"), None).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn cancel_unknown_run_returns_not_found() {
    let (app, _dir) = create_test_app().await;
    let response = request(&app, "POST", "/runs/does-not-exist/cancel", None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn workspace_files_traversal_is_forbidden() {
    let (app, _dir) = create_test_app().await;
    request(&app, "PUT", "/projects/demo", Some(json!({"id": "demo", "name": "Demo"}))).await;
    let response = request(&app, "POST", "/projects/demo/runs", Some(json!({
        "project_id": "demo", "name": "r1", "instructions": "fix the bug"
    }))).await;
    let created = body_to_json(response).await;
    let run_id = created["id"].as_str().unwrap().to_string();

    tokio::time::sleep(Duration::from_millis(200)).await;

    let response = request(&app, "GET", &format!("/runs/{run_id}/workspace/files/../../etc/passwd"), None).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn pattern_lookup_returns_not_found_before_any_run_completes() {
    let (app, _dir) = create_test_app().await;
    let response = request(&app, "GET", "/patterns/nonexistent-run", None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn artifacts_and_diff_are_available_after_a_run_completes() {
    let (app, _dir) = create_test_app().await;
    request(&app, "PUT", "/projects/demo", Some(json!({"id": "demo", "name": "Demo"}))).await;
    let response = request(&app, "POST", "/projects/demo/runs", Some(json!({
        "project_id": "demo", "name": "r1", "instructions": "fix the bug"
    }))).await;
    let created = body_to_json(response).await;
    let run_id = created["id"].as_str().unwrap().to_string();

    tokio::time::sleep(Duration::from_millis(200)).await;

    let response = request(&app, "GET", &format!("/runs/{run_id}/artifacts"), None).await;
    assert_eq!(response.status(), StatusCode::OK);

    // Fake-mode workspaces are never real git repos, so a diff is genuinely absent.
    let response = request(&app, "GET", &format!("/runs/{run_id}/diff"), None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
