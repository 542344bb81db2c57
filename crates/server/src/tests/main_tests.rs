use super::*;
use axum::{
    body::{self, Body},
    http::Request,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use shared::protocol::ServerEvent;
use std::time::Duration;
use tokio::{net::TcpStream, time::timeout};
use tokio_tungstenite::{connect_async, tungstenite, MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn test_state_with(heartbeat: Duration, idle: Duration) -> Arc<AppState> {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    Arc::new(AppState {
        api: ApiContext::new(storage, PresenceRegistry::default()),
        heartbeat_interval: heartbeat,
        idle_timeout: idle,
    })
}

async fn test_state() -> Arc<AppState> {
    test_state_with(Duration::from_secs(25), Duration::from_secs(60)).await
}

async fn test_app() -> (Router, Arc<AppState>, i64, i64) {
    let state = test_state().await;
    let alice = state.api.storage.create_user("alice").await.expect("alice");
    let bob = state.api.storage.create_user("bob").await.expect("bob");
    (build_router(state.clone()), state, alice.0, bob.0)
}

async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        })
    };
    (status, value)
}

fn send_request(sender: i64, receiver: i64, content: &str) -> Request<Body> {
    Request::post(format!("/messages/send?user_id={sender}"))
        .header("content-type", "application/json")
        .body(Body::from(
            json!({ "receiver_id": receiver, "content": content }).to_string(),
        ))
        .expect("request")
}

fn empty(method: &str, uri: String) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

#[tokio::test]
async fn healthz_reports_ok_when_storage_is_ready() {
    let (app, _state, _alice, _bob) = test_app().await;
    let (status, body) = call(&app, empty("GET", "/healthz".into())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, Value::String("ok".into()));
}

#[tokio::test]
async fn login_is_idempotent_per_username_and_rejects_blank_names() {
    let (app, _state, alice, _bob) = test_app().await;

    let login = |username: &str| {
        Request::post("/login")
            .header("content-type", "application/json")
            .body(Body::from(json!({ "username": username }).to_string()))
            .expect("request")
    };

    let (status, body) = call(&app, login("alice")).await;
    assert_eq!(status, StatusCode::OK);
    let dto: LoginResponse = serde_json::from_value(body).expect("json");
    assert_eq!(dto.user_id, UserId(alice));

    let (status, body) = call(&app, login("   ")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "validation");
}

#[tokio::test]
async fn send_returns_created_message_and_maps_errors_to_statuses() {
    let (app, _state, alice, bob) = test_app().await;

    let (status, body) = call(&app, send_request(alice, bob, "  hi bob  ")).await;
    assert_eq!(status, StatusCode::CREATED);
    let message: MessagePayload = serde_json::from_value(body).expect("message");
    assert_eq!(message.content, "hi bob");
    assert_eq!(message.sender.username, "alice");
    assert_eq!(message.receiver_id(), UserId(bob));
    assert!(message.read_by.is_empty());

    let (status, body) = call(&app, send_request(alice, alice, "me")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "validation");

    let (status, _) = call(&app, send_request(alice, bob, " \n ")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(&app, send_request(alice, 9_999, "anyone?")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "not_found");

    let (status, body) = call(&app, send_request(9_999, bob, "who am i")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthorized");
}

#[tokio::test]
async fn oversized_request_body_is_rejected() {
    let (app, _state, alice, bob) = test_app().await;
    let content = "x".repeat(MAX_REQUEST_BYTES + 1);
    let (status, _) = call(&app, send_request(alice, bob, &content)).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn thread_listing_is_paginated_from_the_newest_message() {
    let (app, _state, alice, bob) = test_app().await;
    for n in 1..=5 {
        let (status, _) = call(&app, send_request(alice, bob, &format!("m{n}"))).await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let (status, body) = call(
        &app,
        empty("GET", format!("/messages/user/{bob}?user_id={alice}&page=1&limit=2")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let page: MessagePage = serde_json::from_value(body).expect("page");
    let contents: Vec<_> = page.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["m4", "m5"]);
    assert_eq!(page.pagination.total, 5);
    assert_eq!(page.pagination.pages, 3);

    let (_, body) = call(
        &app,
        empty("GET", format!("/messages/user/{alice}?user_id={bob}&page=3&limit=2")),
    )
    .await;
    let page: MessagePage = serde_json::from_value(body).expect("page");
    let contents: Vec<_> = page.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["m1"]);

    let (status, _) = call(
        &app,
        empty("GET", format!("/messages/user/9999?user_id={alice}")),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn mark_read_updates_conversation_unread_counts() {
    let (app, _state, alice, bob) = test_app().await;
    let (_, body) = call(&app, send_request(alice, bob, "first")).await;
    let first: MessagePayload = serde_json::from_value(body).expect("message");
    call(&app, send_request(alice, bob, "second")).await;

    let (_, body) = call(
        &app,
        empty("GET", format!("/messages/conversations?user_id={bob}")),
    )
    .await;
    let conversations: Vec<ConversationSummary> = serde_json::from_value(body).expect("list");
    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0].counterpart.user_id, UserId(alice));
    assert_eq!(conversations[0].unread_count, 2);
    assert_eq!(conversations[0].last_message.content, "second");

    let read_uri = format!("/messages/{}/read?user_id={bob}", first.message_id);
    let (status, _) = call(&app, empty("PUT", read_uri.clone())).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = call(&app, empty("PUT", read_uri)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = call(
        &app,
        empty(
            "PUT",
            format!("/messages/{}/read?user_id={alice}", first.message_id),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "forbidden");

    let (status, _) = call(&app, empty("PUT", format!("/messages/424242/read?user_id={bob}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, body) = call(
        &app,
        empty("GET", format!("/messages/conversations?user_id={bob}")),
    )
    .await;
    let conversations: Vec<ConversationSummary> = serde_json::from_value(body).expect("list");
    assert_eq!(conversations[0].unread_count, 1);

    let (_, body) = call(
        &app,
        empty("GET", format!("/messages/conversations?user_id={alice}")),
    )
    .await;
    let conversations: Vec<ConversationSummary> = serde_json::from_value(body).expect("list");
    assert_eq!(conversations[0].unread_count, 0);
}

#[tokio::test]
async fn delete_is_limited_to_participants() {
    let (app, state, alice, bob) = test_app().await;
    let carol = state.api.storage.create_user("carol").await.expect("carol");
    let (_, body) = call(&app, send_request(alice, bob, "to delete")).await;
    let message: MessagePayload = serde_json::from_value(body).expect("message");

    let (status, _) = call(
        &app,
        empty("DELETE", format!("/messages/{}?user_id={}", message.message_id, carol.0)),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = call(
        &app,
        empty("DELETE", format!("/messages/{}?user_id={bob}", message.message_id)),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = call(
        &app,
        empty("DELETE", format!("/messages/{}?user_id={alice}", message.message_id)),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn missing_caller_identity_is_a_bad_request() {
    let (app, _state, _alice, _bob) = test_app().await;
    let (status, _) = call(&app, empty("GET", "/messages/conversations".into())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

async fn spawn_server(state: Arc<AppState>) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = build_router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    addr
}

/// Connects and waits for the snapshot that includes the user, which is only
/// sent once the registration is in place.
async fn connect_user(addr: SocketAddr, user_id: i64) -> WsClient {
    let (mut stream, _) = connect_async(format!("ws://{addr}/ws?user_id={user_id}"))
        .await
        .expect("connect");
    loop {
        if let ServerEvent::OnlineUsers { user_ids } = next_event(&mut stream).await {
            if user_ids.contains(&UserId(user_id)) {
                return stream;
            }
        }
    }
}

async fn next_event(stream: &mut WsClient) -> ServerEvent {
    loop {
        let frame = timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("event in time")
            .expect("stream open")
            .expect("frame");
        if let tungstenite::Message::Text(text) = frame {
            return serde_json::from_str(&text).expect("event json");
        }
    }
}

/// Skips presence snapshots, which arrive whenever anyone connects.
async fn next_non_presence_event(stream: &mut WsClient) -> ServerEvent {
    loop {
        match next_event(stream).await {
            ServerEvent::OnlineUsers { .. } => continue,
            other => return other,
        }
    }
}

#[tokio::test]
async fn websocket_delivers_new_message_and_read_receipt() {
    let (app, state, alice, bob) = test_app().await;
    let addr = spawn_server(state.clone()).await;

    let mut alice_ws = connect_user(addr, alice).await;
    let mut bob_ws = connect_user(addr, bob).await;

    let (status, body) = call(&app, send_request(alice, bob, "hello over ws")).await;
    assert_eq!(status, StatusCode::CREATED);
    let sent: MessagePayload = serde_json::from_value(body).expect("message");

    match next_non_presence_event(&mut bob_ws).await {
        ServerEvent::NewMessage { message } => {
            assert_eq!(message.message_id, sent.message_id);
            assert_eq!(message.content, "hello over ws");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    let (status, _) = call(
        &app,
        empty("PUT", format!("/messages/{}/read?user_id={bob}", sent.message_id)),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    match next_non_presence_event(&mut alice_ws).await {
        ServerEvent::MessageRead(read) => {
            assert_eq!(read.message_id, sent.message_id);
            assert_eq!(read.reader_id, UserId(bob));
        }
        other => panic!("unexpected event: {other:?}"),
    }

    let (_, body) = call(&app, empty("GET", "/presence".into())).await;
    let online: BTreeSet<UserId> = serde_json::from_value(body).expect("presence");
    assert_eq!(online, BTreeSet::from([UserId(alice), UserId(bob)]));
}

#[tokio::test]
async fn closing_the_socket_broadcasts_updated_presence() {
    let (_app, state, alice, bob) = test_app().await;
    let addr = spawn_server(state.clone()).await;

    let mut alice_ws = connect_user(addr, alice).await;
    let mut bob_ws = connect_user(addr, bob).await;
    bob_ws.close(None).await.expect("close");

    loop {
        if let ServerEvent::OnlineUsers { user_ids } = next_event(&mut alice_ws).await {
            if user_ids == BTreeSet::from([UserId(alice)]) {
                break;
            }
        }
    }
    assert!(!state.api.presence.is_reachable(UserId(bob)).await);
}

#[tokio::test]
async fn reconnect_supersedes_the_previous_socket() {
    let (_app, state, alice, _bob) = test_app().await;
    let addr = spawn_server(state.clone()).await;

    let mut first = connect_user(addr, alice).await;
    let _second = connect_user(addr, alice).await;

    loop {
        let frame = timeout(Duration::from_secs(5), first.next())
            .await
            .expect("first socket closed in time");
        match frame {
            None | Some(Err(_)) | Some(Ok(tungstenite::Message::Close(_))) => break,
            Some(Ok(_)) => continue,
        }
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(state.api.presence.is_reachable(UserId(alice)).await);
}

#[tokio::test]
async fn unknown_user_cannot_open_a_push_channel() {
    let state = test_state().await;
    let addr = spawn_server(state).await;
    let result = connect_async(format!("ws://{addr}/ws?user_id=777")).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn silent_client_is_disconnected_after_idle_timeout() {
    let state = test_state_with(Duration::from_millis(100), Duration::from_millis(300)).await;
    let alice = state.api.storage.create_user("alice").await.expect("alice");
    let addr = spawn_server(state.clone()).await;

    let _alice_ws = connect_user(addr, alice.0).await;
    assert!(state.api.presence.is_reachable(alice).await);

    // The client never reads again, so pings go unanswered.
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert!(!state.api.presence.is_reachable(alice).await);
}

#[tokio::test]
async fn active_client_outlives_idle_timeout() {
    let state = test_state_with(Duration::from_millis(100), Duration::from_millis(300)).await;
    let alice = state.api.storage.create_user("alice").await.expect("alice");
    let addr = spawn_server(state.clone()).await;

    let (mut sink, mut stream) = connect_user(addr, alice.0).await.split();
    let deadline = tokio::time::Instant::now() + Duration::from_millis(1_000);
    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    while tokio::time::Instant::now() < deadline {
        tokio::select! {
            _ = ticker.tick() => {
                sink.send(tungstenite::Message::Ping(Vec::new()))
                    .await
                    .expect("ping");
            }
            _ = stream.next() => {}
        }
    }

    assert!(state.api.presence.is_reachable(alice).await);
}
