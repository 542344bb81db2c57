use super::*;
use axum::{
    extract::{Path, Query},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use shared::error::ErrorCode;
use tokio::net::TcpListener;

#[derive(Deserialize)]
struct UserQuery {
    user_id: i64,
}

async fn spawn_stub() -> String {
    let app = Router::new()
        .route(
            "/login",
            post(|Json(req): Json<LoginRequest>| async move {
                let user_id = if req.username == "alice" { 1 } else { 2 };
                Json(LoginResponse {
                    user_id: UserId(user_id),
                })
            }),
        )
        .route(
            "/messages/conversations",
            get(|Query(q): Query<UserQuery>| async move {
                if q.user_id == 1 {
                    Ok(Json(Vec::<ConversationSummary>::new()))
                } else {
                    Err((
                        StatusCode::UNAUTHORIZED,
                        Json(ApiError::new(ErrorCode::Unauthorized, "unknown user")),
                    ))
                }
            }),
        )
        .route(
            "/messages/send",
            post(|| async {
                (
                    StatusCode::NOT_FOUND,
                    Json(ApiError::not_found("receiver not found")),
                )
            }),
        )
        .route(
            "/messages/:message_id/read",
            put(
                |Path(message_id): Path<i64>, Query(q): Query<UserQuery>| async move {
                    if message_id == 5 && q.user_id == 1 {
                        StatusCode::NO_CONTENT
                    } else {
                        StatusCode::FORBIDDEN
                    }
                },
            ),
        )
        .route(
            "/presence",
            get(|| async { (StatusCode::BAD_GATEWAY, "upstream down") }),
        );

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}/")
}

#[tokio::test]
async fn login_and_listing_decode_successful_responses() {
    let backend = HttpBackend::new(spawn_stub().await);
    assert!(!backend.server_url().ends_with('/'));

    assert_eq!(backend.login("alice").await.expect("login"), UserId(1));
    assert!(backend
        .conversations(UserId(1))
        .await
        .expect("conversations")
        .is_empty());
    backend
        .mark_read(UserId(1), MessageId(5))
        .await
        .expect("mark read");
}

#[tokio::test]
async fn structured_rejections_become_api_errors() {
    let backend = HttpBackend::new(spawn_stub().await);

    let error = backend
        .send(UserId(1), UserId(99), "hi")
        .await
        .expect_err("rejected");
    assert_eq!(
        error,
        ClientError::Api(ApiError::not_found("receiver not found"))
    );

    let error = backend
        .conversations(UserId(7))
        .await
        .expect_err("rejected");
    assert!(matches!(
        error,
        ClientError::Api(ApiError {
            code: ErrorCode::Unauthorized,
            ..
        })
    ));
}

#[tokio::test]
async fn unstructured_failures_become_transport_errors() {
    let backend = HttpBackend::new(spawn_stub().await);

    let error = backend.online_users().await.expect_err("bad gateway");
    assert!(matches!(error, ClientError::Transport(ref text) if text.contains("502")));

    let error = backend
        .mark_read(UserId(2), MessageId(5))
        .await
        .expect_err("forbidden");
    assert!(matches!(error, ClientError::Transport(_)));
}

#[tokio::test]
async fn unreachable_server_is_a_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let backend = HttpBackend::new(format!("http://{addr}"));
    assert!(matches!(
        backend.login("alice").await,
        Err(ClientError::Transport(_))
    ));
}
