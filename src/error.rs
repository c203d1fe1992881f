use std::fmt;
use serde_json::Error as JsonError;
use webrtc::Error as WebRTCError;

#[derive(Debug)]
pub enum Error {
    WebRTC(WebRTCError),
    Socket(axum::Error),
    Json(JsonError),
    Protocol(String),
    /// The outbound frame queue is gone; the client is no longer writable.
    SocketClosed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::WebRTC(e) => write!(f, "WebRTC error: {}", e),
            Error::Socket(e) => write!(f, "WebSocket error: {}", e),
            Error::Json(e) => write!(f, "JSON error: {}", e),
            Error::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Error::SocketClosed => write!(f, "socket closed"),
        }
    }
}

impl std::error::Error for Error {}

impl From<WebRTCError> for Error {
    fn from(err: WebRTCError) -> Self {
        Error::WebRTC(err)
    }
}

impl From<axum::Error> for Error {
    fn from(err: axum::Error) -> Self {
        Error::Socket(err)
    }
}

impl From<JsonError> for Error {
    fn from(err: JsonError) -> Self {
        Error::Json(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
