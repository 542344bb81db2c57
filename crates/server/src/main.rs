use std::{collections::BTreeSet, net::SocketAddr, sync::Arc};

use axum::{
    extract::{DefaultBodyLimit, Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::Deserialize;
use server_api::{
    delete_message, list_conversations, list_messages, mark_read, send_message, ApiContext,
    PresenceRegistry,
};
use shared::{
    domain::{MessageId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        ConversationSummary, LoginRequest, LoginResponse, MessagePage, MessagePayload, Pagination,
        SendMessageRequest,
    },
};
use storage::Storage;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod app_state;
mod config;
mod ws;

use app_state::AppState;
use config::{load_settings, prepare_database_url};

type HttpError = (StatusCode, Json<ApiError>);

const MAX_REQUEST_BYTES: usize = 64 * 1024;
const MAX_USERNAME_CHARS: usize = 64;

#[derive(Debug, Deserialize)]
struct UserQuery {
    user_id: i64,
}

#[derive(Debug, Deserialize)]
struct ListMessagesQuery {
    user_id: i64,
    page: Option<u32>,
    limit: Option<u32>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
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

    let state = AppState {
        api: ApiContext::new(storage, PresenceRegistry::new(settings.push_buffer)),
        heartbeat_interval: settings.heartbeat_interval(),
        idle_timeout: settings.idle_timeout(),
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(
        %addr,
        heartbeat_secs = settings.heartbeat_interval().as_secs(),
        idle_timeout_secs = settings.idle_timeout().as_secs(),
        push_buffer = settings.push_buffer,
        "server listening"
    );
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        error!(%error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/login", post(login))
        .route("/messages/send", post(http_send_message))
        .route("/messages/conversations", get(http_list_conversations))
        .route("/messages/user/:other_user_id", get(http_list_messages))
        .route("/messages/:message_id/read", put(http_mark_read))
        .route("/messages/:message_id", delete(http_delete_message))
        .route("/presence", get(http_presence))
        .route("/ws", get(ws_handler))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BYTES))
        .with_state(state)
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(err: ApiError) -> HttpError {
    if err.code == ErrorCode::Internal {
        error!(error = %err.message, "request failed");
    }
    (status_for(err.code), Json(err))
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.api.storage.health_check().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(error) => {
            error!(%error, "health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "storage unavailable")
        }
    }
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, HttpError> {
    let username = req.username.trim();
    if username.is_empty() || username.chars().count() > MAX_USERNAME_CHARS {
        return Err(reject(ApiError::validation(format!(
            "username must be 1 to {MAX_USERNAME_CHARS} characters"
        ))));
    }

    let user_id = state
        .api
        .storage
        .create_user(username)
        .await
        .map_err(|e| reject(ApiError::internal(e.to_string())))?;
    info!(user_id = user_id.0, "user logged in");
    Ok(Json(LoginResponse { user_id }))
}

async fn http_send_message(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
    Json(req): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<MessagePayload>), HttpError> {
    let message = send_message(&state.api, UserId(q.user_id), req.receiver_id, &req.content)
        .await
        .map_err(reject)?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn http_list_conversations(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
) -> Result<Json<Vec<ConversationSummary>>, HttpError> {
    let conversations = list_conversations(&state.api, UserId(q.user_id))
        .await
        .map_err(reject)?;
    Ok(Json(conversations))
}

async fn http_list_messages(
    State(state): State<Arc<AppState>>,
    Path(other_user_id): Path<i64>,
    Query(q): Query<ListMessagesQuery>,
) -> Result<Json<MessagePage>, HttpError> {
    let page = list_messages(
        &state.api,
        UserId(q.user_id),
        UserId(other_user_id),
        Pagination {
            page: q.page,
            limit: q.limit,
        },
    )
    .await
    .map_err(reject)?;
    Ok(Json(page))
}

async fn http_mark_read(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> Result<StatusCode, HttpError> {
    mark_read(&state.api, MessageId(message_id), UserId(q.user_id))
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_delete_message(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> Result<StatusCode, HttpError> {
    delete_message(&state.api, UserId(q.user_id), MessageId(message_id))
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_presence(State(state): State<Arc<AppState>>) -> Json<BTreeSet<UserId>> {
    Json(state.api.presence.reachable_users().await)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
) -> Result<impl IntoResponse, HttpError> {
    let user_id = UserId(q.user_id);
    let known = state
        .api
        .storage
        .find_user(user_id)
        .await
        .map_err(|e| reject(ApiError::internal(e.to_string())))?;
    if known.is_none() {
        return Err(reject(ApiError::not_found("user not found")));
    }
    Ok(ws.on_upgrade(move |socket| ws::serve_connection(state, socket, user_id)))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
