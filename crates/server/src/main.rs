use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, put},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use server_api::{
    create_class, create_problem, create_section, delete_class, delete_problem, delete_section,
    list_classes, list_problems, list_revisions, list_sections, list_session_history,
    update_class, update_problem, ApiContext,
};
use shared::{
    domain::{ClassId, ProblemId, SectionId, SessionId, SessionStatus, StudentId},
    error::{ApiError, ErrorCode},
    protocol::{
        ClassInput, ClassSummary, ClientCommand, CodeRevision, ProblemInput, ProblemSummary,
        SectionInput, SectionSummary, ServerEvent, SessionSummary,
    },
};
use storage::Storage;
use tokio::sync::mpsc;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod app_state;
mod config;
mod executor;
mod hub;

use app_state::AppState;
use config::{load_settings, prepare_database_url};
use executor::ExecutorConfig;
use hub::Hub;

const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

#[derive(Debug, Deserialize)]
struct SessionHistoryQuery {
    status: Option<SessionStatus>,
}

#[derive(Debug, Deserialize)]
struct RevisionQuery {
    student_id: Option<i64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let hub = Hub::new(
        storage.clone(),
        ExecutorConfig {
            interpreter: settings.interpreter.clone(),
            timeout: settings.execution_timeout,
        },
        settings.max_code_bytes,
    );
    let state = AppState {
        api: ApiContext { storage },
        hub,
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, interpreter = %settings.interpreter, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/classes", get(http_list_classes).post(http_create_class))
        .route(
            "/classes/:class_id",
            put(http_update_class).delete(http_delete_class),
        )
        .route(
            "/classes/:class_id/sections",
            get(http_list_sections).post(http_create_section),
        )
        .route("/sections/:section_id", delete(http_delete_section))
        .route("/problems", get(http_list_problems).post(http_create_problem))
        .route(
            "/problems/:problem_id",
            put(http_update_problem).delete(http_delete_problem),
        )
        .route("/sessions", get(http_list_sessions))
        .route("/sessions/:session_id/revisions", get(http_list_revisions))
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BODY_BYTES))
        .with_state(state)
}

fn api_failure(err: ApiError) -> (StatusCode, Json<ApiError>) {
    let status = match err.code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(err))
}

async fn healthz(
    State(state): State<Arc<AppState>>,
) -> Result<&'static str, (StatusCode, Json<ApiError>)> {
    state.api.storage.health_check().await.map_err(|e| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiError::new(ErrorCode::Internal, e.to_string())),
        )
    })?;
    Ok("ok")
}

async fn http_list_classes(State(state): State<Arc<AppState>>) -> ApiResult<Vec<ClassSummary>> {
    list_classes(&state.api).await.map(Json).map_err(api_failure)
}

async fn http_create_class(
    State(state): State<Arc<AppState>>,
    Json(input): Json<ClassInput>,
) -> Result<(StatusCode, Json<ClassSummary>), (StatusCode, Json<ApiError>)> {
    let class = create_class(&state.api, input).await.map_err(api_failure)?;
    Ok((StatusCode::CREATED, Json(class)))
}

async fn http_update_class(
    State(state): State<Arc<AppState>>,
    Path(class_id): Path<i64>,
    Json(input): Json<ClassInput>,
) -> ApiResult<ClassSummary> {
    update_class(&state.api, ClassId(class_id), input)
        .await
        .map(Json)
        .map_err(api_failure)
}

async fn http_delete_class(
    State(state): State<Arc<AppState>>,
    Path(class_id): Path<i64>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    delete_class(&state.api, ClassId(class_id))
        .await
        .map_err(api_failure)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_list_sections(
    State(state): State<Arc<AppState>>,
    Path(class_id): Path<i64>,
) -> ApiResult<Vec<SectionSummary>> {
    list_sections(&state.api, ClassId(class_id))
        .await
        .map(Json)
        .map_err(api_failure)
}

async fn http_create_section(
    State(state): State<Arc<AppState>>,
    Path(class_id): Path<i64>,
    Json(input): Json<SectionInput>,
) -> Result<(StatusCode, Json<SectionSummary>), (StatusCode, Json<ApiError>)> {
    let section = create_section(&state.api, ClassId(class_id), input)
        .await
        .map_err(api_failure)?;
    Ok((StatusCode::CREATED, Json(section)))
}

async fn http_delete_section(
    State(state): State<Arc<AppState>>,
    Path(section_id): Path<i64>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    delete_section(&state.api, SectionId(section_id))
        .await
        .map_err(api_failure)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_list_problems(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Vec<ProblemSummary>> {
    list_problems(&state.api).await.map(Json).map_err(api_failure)
}

async fn http_create_problem(
    State(state): State<Arc<AppState>>,
    Json(input): Json<ProblemInput>,
) -> Result<(StatusCode, Json<ProblemSummary>), (StatusCode, Json<ApiError>)> {
    let problem = create_problem(&state.api, input)
        .await
        .map_err(api_failure)?;
    Ok((StatusCode::CREATED, Json(problem)))
}

async fn http_update_problem(
    State(state): State<Arc<AppState>>,
    Path(problem_id): Path<i64>,
    Json(input): Json<ProblemInput>,
) -> ApiResult<ProblemSummary> {
    update_problem(&state.api, ProblemId(problem_id), input)
        .await
        .map(Json)
        .map_err(api_failure)
}

async fn http_delete_problem(
    State(state): State<Arc<AppState>>,
    Path(problem_id): Path<i64>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    delete_problem(&state.api, ProblemId(problem_id))
        .await
        .map_err(api_failure)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_list_sessions(
    State(state): State<Arc<AppState>>,
    Query(q): Query<SessionHistoryQuery>,
) -> ApiResult<Vec<SessionSummary>> {
    let mut sessions = list_session_history(&state.api, q.status)
        .await
        .map_err(api_failure)?;
    for session in &mut sessions {
        session.participant_count = state.hub.participant_count(session.id).await;
    }
    Ok(Json(sessions))
}

async fn http_list_revisions(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<i64>,
    Query(q): Query<RevisionQuery>,
) -> ApiResult<Vec<CodeRevision>> {
    list_revisions(&state.api, SessionId(session_id), q.student_id.map(StudentId))
        .await
        .map(Json)
        .map_err(api_failure)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket))
}

async fn ws_connection(state: Arc<AppState>, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    let connection = state.hub.connect(tx.clone()).await;
    debug!(connection, "realtime connection opened");

    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(error) => {
                    error!(%error, "failed to serialize server event");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                Ok(command) => state.hub.handle(connection, command).await,
                Err(err) => {
                    warn!(connection, error = %err, "rejecting malformed command");
                    let _ = tx.send(ServerEvent::error(format!("invalid command: {err}")));
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.hub.disconnect(connection).await;
    send_task.abort();
    debug!(connection, "realtime connection closed");
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
