//! HTTP intake and the live monitoring stream.

pub mod filter;
pub mod ws;

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use nexus_shared::monitoring::{MonitoringEvent, MonitoringEventType};
use nexus_shared::types::{JobEnvelope, Priority, ResearchTask};

use crate::context::SystemContext;
use crate::web::filter::{ClientFilter, MonitorParams};
use crate::web::ws::WsManager;

#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<SystemContext>,
    pub ws: Arc<WsManager>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish()
    }
}

/// Build the API router.
pub fn router(ctx: Arc<SystemContext>) -> Router {
    let state = AppState {
        ws: WsManager::new(ctx.clone()),
        ctx,
    };
    Router::new()
        .route("/tasks", post(create_task))
        .route("/tasks/{task_id}", get(get_task))
        .route("/monitor/snapshot", get(monitor_snapshot))
        .route("/ws/monitor", get(ws_monitor))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct CreateTaskRequest {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub continuous_mode: bool,
    pub continuous_interval_hours: Option<u32>,
    /// Optional priority tier; defaults to normal
    pub priority: Option<Priority>,
}

#[derive(Debug, Serialize)]
pub struct CreateTaskResponse {
    pub task_id: String,
}

/// `POST /tasks` — create the task row and enqueue its job.
async fn create_task(
    State(state): State<AppState>,
    Json(request): Json<CreateTaskRequest>,
) -> Response {
    let mut task = ResearchTask::new(request.title.clone(), request.description.clone());
    task.continuous_mode = request.continuous_mode;
    task.continuous_interval_hours = request.continuous_interval_hours;

    if let Err(e) = state.ctx.store.upsert_task(&task).await {
        return internal_error(e);
    }

    let mut job = JobEnvelope::new(
        task.task_id.clone(),
        request.title,
        request.description,
        request.priority.unwrap_or(Priority::Normal),
    );
    job.continuous_mode = request.continuous_mode;
    job.continuous_interval_hours = request.continuous_interval_hours;

    if let Err(e) = state.ctx.queue.enqueue(&job).await {
        return internal_error(e);
    }

    state
        .ctx
        .event_bus
        .publish(
            &MonitoringEvent::task(MonitoringEventType::TaskEnqueued, task.task_id.clone())
                .with_status("created"),
        )
        .await;

    info!(task_id = %task.task_id, "task created and enqueued");
    (
        StatusCode::CREATED,
        Json(CreateTaskResponse {
            task_id: task.task_id,
        }),
    )
        .into_response()
}

/// `GET /tasks/{task_id}` — task row plus its artifacts; 404 when absent.
async fn get_task(State(state): State<AppState>, Path(task_id): Path<String>) -> Response {
    let task = match state.ctx.store.get_task(&task_id).await {
        Ok(Some(task)) => task,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": format!("task {task_id} not found")})),
            )
                .into_response()
        }
        Err(e) => return internal_error(e),
    };
    let artifacts = match state.ctx.store.artifacts_for_task(&task_id).await {
        Ok(artifacts) => artifacts,
        Err(e) => return internal_error(e),
    };

    Json(json!({
        "task_id": task.task_id,
        "title": task.title,
        "description": task.description,
        "status": task.status,
        "continuous_mode": task.continuous_mode,
        "continuous_interval_hours": task.continuous_interval_hours,
        "created_at": task.created_at,
        "updated_at": task.updated_at,
        "completed_at": task.completed_at,
        "metadata": task.metadata,
        "artifacts": artifacts,
    }))
    .into_response()
}

/// `GET /monitor/snapshot` — one stats-snapshot event on demand.
async fn monitor_snapshot(
    State(state): State<AppState>,
    Query(_params): Query<MonitorParams>,
) -> Response {
    let snapshot = state.ws.snapshot().await;
    Json(snapshot).into_response()
}

/// `WS /ws/monitor` — filtered live event stream.
async fn ws_monitor(
    State(state): State<AppState>,
    Query(params): Query<MonitorParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let filter: ClientFilter = params.into();
    let manager = state.ws.clone();
    ws.on_upgrade(move |socket| manager.handle_socket(socket, filter))
}

fn internal_error(error: nexus_shared::NexusError) -> Response {
    tracing::error!(error = %error, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": error.to_string()})),
    )
        .into_response()
}
