use shared::error::ApiError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// The server answered with a structured rejection.
    #[error("server rejected request: {0}")]
    Api(#[from] ApiError),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("push channel closed")]
    ConnectionLost,
    #[error("not logged in")]
    NotLoggedIn,
}

impl From<reqwest::Error> for ClientError {
    fn from(error: reqwest::Error) -> Self {
        Self::Transport(error.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
