//! Error types for the relay daemon.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Config: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;
