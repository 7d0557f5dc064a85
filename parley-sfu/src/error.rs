use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("signaling error: {0}")]
    Signaling(#[from] parley_swarm::Error),

    #[error("media device error: {0}")]
    Device(String),

    #[error("session not ready: {0}")]
    NotReady(&'static str),

    #[error("unexpected server payload: {0}")]
    BadPayload(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
