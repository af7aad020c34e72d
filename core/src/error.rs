//! Error types for Parley Core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Not connected to the signaling server")]
    NotConnected,

    #[error("Message content is empty")]
    EmptyContent,

    #[error("No conversation is open")]
    NoConversation,

    #[error("A call is already in progress")]
    CallInProgress,

    #[error("No call matches this operation")]
    NoActiveCall,

    #[error("Invalid signaling state: {0}")]
    InvalidSignalingState(String),

    #[error("Capture device permission denied")]
    NoDevicePermission,

    #[error("Capture device unavailable")]
    DeviceUnavailable,

    #[error("Peer did not answer")]
    PeerTimeout,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Media error: {0}")]
    Media(String),

    #[error("Auth token missing or expired")]
    AuthExpired,

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(e.to_string())
    }
}

impl From<webrtc::Error> for Error {
    fn from(e: webrtc::Error) -> Self {
        Error::Media(e.to_string())
    }
}
