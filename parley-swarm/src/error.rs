use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not configured: {0}")]
    NotConfigured(&'static str),

    #[error("hub is not connected")]
    HubNotConnected,

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("invalid hub url: {0}")]
    InvalidUrl(String),

    #[error("request timed out: {0}")]
    RequestTimeout(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("signaling error: {0}")]
    Signaling(String),

    #[error("no such peer: {0}")]
    UnknownPeer(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<webrtc::Error> for Error {
    fn from(err: webrtc::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(err.to_string())
    }
}
