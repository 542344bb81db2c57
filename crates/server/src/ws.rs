//! Push channel: one WebSocket per connected user, fed from that user's
//! delivery queue in the presence registry.

use std::{fmt, sync::Arc, time::Instant};

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use shared::domain::{ConnectionHandle, UserId};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::app_state::AppState;

enum CloseReason {
    ClientClosed,
    Superseded,
    IdleTimeout,
    Transport(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientClosed => f.write_str("client closed"),
            Self::Superseded => f.write_str("superseded by a newer connection"),
            Self::IdleTimeout => f.write_str("idle timeout"),
            Self::Transport(error) => write!(f, "transport error: {error}"),
        }
    }
}

pub(crate) async fn serve_connection(state: Arc<AppState>, socket: WebSocket, user_id: UserId) {
    let handle = ConnectionHandle::new();
    let mut events = state.api.presence.connect(user_id, handle).await;
    let (mut sender, mut receiver) = socket.split();

    let mut heartbeat = interval(state.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    heartbeat.tick().await;
    let mut last_seen = Instant::now();

    let reason = loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    break CloseReason::Superseded;
                };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(error) => {
                        warn!(user_id = user_id.0, %error, kind = event.kind(), "ws: failed to encode event");
                        continue;
                    }
                };
                if let Err(error) = sender.send(Message::Text(text)).await {
                    break CloseReason::Transport(error.to_string());
                }
            }
            frame = receiver.next() => match frame {
                None | Some(Ok(Message::Close(_))) => break CloseReason::ClientClosed,
                Some(Ok(_)) => last_seen = Instant::now(),
                Some(Err(error)) => break CloseReason::Transport(error.to_string()),
            },
            _ = heartbeat.tick() => {
                if last_seen.elapsed() >= state.idle_timeout {
                    break CloseReason::IdleTimeout;
                }
                if let Err(error) = sender.send(Message::Ping(Vec::new())).await {
                    break CloseReason::Transport(error.to_string());
                }
                debug!(user_id = user_id.0, %handle, "ws: ping");
            }
        }
    };

    if !matches!(reason, CloseReason::Transport(_)) {
        let _ = sender.send(Message::Close(None)).await;
    }
    state.api.presence.disconnect(user_id, handle).await;
    info!(user_id = user_id.0, %handle, %reason, "ws: connection closed");
}
