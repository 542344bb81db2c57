use std::pin::Pin;

use async_trait::async_trait;
use futures::{future, Stream, StreamExt};
use shared::{domain::UserId, protocol::ServerEvent};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

use crate::error::{ClientError, Result};

/// One item read off the push channel.
#[derive(Debug, Clone, PartialEq)]
pub enum PushFrame {
    Event(ServerEvent),
    /// Channel traffic carrying no event, such as a server ping. Only proves
    /// the peer is alive.
    Heartbeat,
}

/// Live push frames for one connection. The stream ending, or yielding an
/// error, means the channel is gone.
pub type PushStream = Pin<Box<dyn Stream<Item = Result<PushFrame>> + Send>>;

#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(&self, user_id: UserId) -> Result<PushStream>;
}

/// WebSocket connector for the server's `/ws` endpoint.
pub struct WsConnector {
    server_url: String,
}

impl WsConnector {
    pub fn new(server_url: impl Into<String>) -> Self {
        let server_url: String = server_url.into();
        Self {
            server_url: server_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn ws_url(&self, user_id: UserId) -> Result<Url> {
        let mut url = Url::parse(&format!("{}/ws", self.server_url))
            .map_err(|e| ClientError::Transport(format!("invalid server url: {e}")))?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(ClientError::Transport(format!(
                    "server url must be http(s) or ws(s), got {other}"
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| ClientError::Transport("cannot derive websocket url".into()))?;
        url.query_pairs_mut()
            .append_pair("user_id", &user_id.0.to_string());
        Ok(url)
    }
}

#[async_trait]
impl PushConnector for WsConnector {
    async fn connect(&self, user_id: UserId) -> Result<PushStream> {
        let url = self.ws_url(user_id)?;
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        debug!(%url, "push channel open");

        // Pings are answered by tungstenite while the stream is polled; they
        // surface as heartbeats so the session can tell a silent peer apart.
        let frames = ws_stream
            .take_while(|frame| future::ready(!matches!(frame, Ok(Message::Close(_)))))
            .map(|frame| match frame {
                Ok(Message::Text(text)) => Ok(decode_event(&text)),
                Ok(_) => Ok(PushFrame::Heartbeat),
                Err(error) => Err(ClientError::from(error)),
            });
        Ok(Box::pin(frames))
    }
}

fn decode_event(text: &str) -> PushFrame {
    match serde_json::from_str::<ServerEvent>(text) {
        Ok(event) => PushFrame::Event(event),
        Err(error) => {
            warn!(%error, "push: ignoring undecodable event");
            PushFrame::Heartbeat
        }
    }
}
