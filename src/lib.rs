//! Many-to-many audio conferencing server. Clients join a room over the
//! WebSocket endpoint, upload one audio track and receive every other
//! participant's audio, forwarded packet-for-packet.

pub mod error;
pub mod room;
pub mod session;
pub mod signaling;
pub mod sync;

use std::sync::Arc;

use axum::extract::{State, WebSocketUpgrade};
use axum::http::header::HOST;
use axum::http::HeaderMap;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;

use room::Rooms;

const INDEX_HTML: &str = include_str!("../assets/index.html");

/// Process-wide state shared by every connection handler.
pub struct App {
    pub rooms: Rooms,
    pub stun_url: String,
}

pub fn router(app: Arc<App>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/websocket", get(websocket))
        .with_state(app)
}

async fn index(headers: HeaderMap) -> Html<String> {
    let host = headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("localhost");
    Html(INDEX_HTML.replace("{{WEBSOCKET_URL}}", &websocket_url(host)))
}

/// Local-looking hosts get plain `ws://`; anything else is assumed to
/// sit behind TLS termination.
fn websocket_url(host: &str) -> String {
    let scheme = if host.starts_with("localhost") || host.starts_with("127.0.0.1") {
        "ws"
    } else {
        "wss"
    };
    format!("{scheme}://{host}/websocket")
}

async fn websocket(State(app): State<Arc<App>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| session::handle_socket(socket, app))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_hosts_use_plain_ws() {
        assert_eq!(websocket_url("localhost:8080"), "ws://localhost:8080/websocket");
        assert_eq!(websocket_url("127.0.0.1:8080"), "ws://127.0.0.1:8080/websocket");
        assert_eq!(websocket_url("localhost"), "ws://localhost/websocket");
    }

    #[test]
    fn public_hosts_use_wss() {
        assert_eq!(websocket_url("example.com"), "wss://example.com/websocket");
        assert_eq!(
            websocket_url("conference.example.com:443"),
            "wss://conference.example.com:443/websocket"
        );
    }
}
