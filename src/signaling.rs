use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::{Error, Result};

/// Deadline for pushing a control frame onto the wire.
const WRITE_DEADLINE: Duration = Duration::from_secs(10);

const OUTBOUND_QUEUE: usize = 64;

/// Every frame on the socket is one of these. `data` is itself a JSON
/// document, encoded as a string, so payloads stay opaque to the framing
/// layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketMessage {
    pub event: String,
    pub data: String,
}

/// Payload of the initial `join` message.
#[derive(Debug, Clone, Deserialize)]
pub struct JoinRequest {
    #[serde(rename = "roomId")]
    pub room_id: String,
    #[serde(default)]
    pub name: String,
}

/// Payload of an `offer` message: the session description plus the
/// display-name labels a subscriber needs to caption each track.
#[derive(Debug, Serialize)]
pub struct OfferEnvelope {
    pub offer: RTCSessionDescription,
    #[serde(rename = "trackNames")]
    pub track_names: HashMap<String, String>,
    #[serde(rename = "streamNames")]
    pub stream_names: HashMap<String, String>,
}

/// Serialized writer for one client socket.
///
/// The ICE candidate callback, the synchronizer and the keepalive timer
/// all emit concurrently; funneling every frame through one queue owned
/// by a single pump task keeps frames whole and in send order.
pub struct SocketWriter {
    tx: mpsc::Sender<Message>,
}

impl SocketWriter {
    /// Takes ownership of the sink half of the socket and starts the pump.
    /// The pump exits when the sink errors, a control frame misses the
    /// write deadline, or a close frame has been flushed.
    pub fn spawn(mut sink: SplitSink<WebSocket, Message>) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let closing = matches!(frame, Message::Close(_));
                // only control frames carry the write deadline; ordinary
                // JSON text rides the socket's own backpressure
                let result = if closing || matches!(frame, Message::Ping(_)) {
                    match time::timeout(WRITE_DEADLINE, sink.send(frame)).await {
                        Ok(result) => result,
                        Err(_) => break,
                    }
                } else {
                    sink.send(frame).await
                };
                if result.is_err() || closing {
                    break;
                }
            }
        });
        Arc::new(Self { tx })
    }

    #[cfg(test)]
    pub(crate) fn test_pair(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Arc::new(Self { tx }), rx)
    }

    pub async fn write_json(&self, message: &SocketMessage) -> Result<()> {
        let text = serde_json::to_string(message)?;
        self.tx
            .send(Message::Text(text))
            .await
            .map_err(|_| Error::SocketClosed)
    }

    /// Queues a ping control frame. Failing to hand the frame off within
    /// the write deadline counts as a dead client.
    pub async fn ping(&self) -> Result<()> {
        match time::timeout(WRITE_DEADLINE, self.tx.send(Message::Ping(b"ping".to_vec()))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::SocketClosed),
            Err(_) => Err(Error::Protocol("ping write deadline exceeded".to_string())),
        }
    }

    pub async fn close(&self) {
        let _ = self.tx.send(Message::Close(None)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;

    #[test]
    fn envelope_round_trip_keeps_data_opaque() {
        let inner = r#"{"roomId":"lobby","name":"Alice"}"#;
        let msg = SocketMessage {
            event: "join".to_string(),
            data: inner.to_string(),
        };
        let wire = serde_json::to_string(&msg).unwrap();
        let back: SocketMessage = serde_json::from_str(&wire).unwrap();
        assert_eq!(back.event, "join");
        assert_eq!(back.data, inner);

        let join: JoinRequest = serde_json::from_str(&back.data).unwrap();
        assert_eq!(join.room_id, "lobby");
        assert_eq!(join.name, "Alice");
    }

    #[test]
    fn join_request_name_defaults_to_empty() {
        let join: JoinRequest = serde_json::from_str(r#"{"roomId":"r"}"#).unwrap();
        assert_eq!(join.room_id, "r");
        assert_eq!(join.name, "");
    }

    #[test]
    fn candidate_json_preserves_sdp_mid() {
        let init = RTCIceCandidateInit {
            candidate: "candidate:1 1 udp 2130706431 10.0.0.1 54321 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let wire = serde_json::to_string(&init).unwrap();
        assert!(wire.contains("\"sdpMid\":\"0\""));

        let back: RTCIceCandidateInit = serde_json::from_str(&wire).unwrap();
        assert_eq!(back.candidate, init.candidate);
        assert_eq!(back.sdp_mid, init.sdp_mid);
        assert_eq!(back.sdp_mline_index, init.sdp_mline_index);
    }

    #[test]
    fn offer_envelope_uses_camel_case_label_keys() {
        let offer: RTCSessionDescription =
            serde_json::from_str(r#"{"type":"offer","sdp":"v=0\r\n"}"#).unwrap();
        let envelope = OfferEnvelope {
            offer,
            track_names: HashMap::from([("t-A".to_string(), "Alice".to_string())]),
            stream_names: HashMap::from([("s-A".to_string(), "Alice".to_string())]),
        };
        let wire = serde_json::to_string(&envelope).unwrap();
        assert!(wire.contains("\"trackNames\":{\"t-A\":\"Alice\"}"));
        assert!(wire.contains("\"streamNames\":{\"s-A\":\"Alice\"}"));
        assert!(wire.contains("\"type\":\"offer\""));
    }

    #[tokio::test]
    async fn writer_preserves_send_order_across_tasks() {
        let (writer, mut rx) = SocketWriter::test_pair(256);

        let a = {
            let writer = writer.clone();
            tokio::spawn(async move {
                for i in 0..50 {
                    let msg = SocketMessage {
                        event: "candidate".to_string(),
                        data: format!("{{\"seq\":{i}}}"),
                    };
                    writer.write_json(&msg).await.unwrap();
                }
            })
        };
        let b = {
            let writer = writer.clone();
            tokio::spawn(async move {
                for i in 0..50 {
                    let msg = SocketMessage {
                        event: "offer".to_string(),
                        data: format!("{{\"seq\":{i}}}"),
                    };
                    writer.write_json(&msg).await.unwrap();
                }
            })
        };
        a.await.unwrap();
        b.await.unwrap();
        drop(writer);

        let mut per_event: HashMap<String, i64> = HashMap::new();
        let mut total = 0;
        while let Some(frame) = rx.recv().await {
            let Message::Text(text) = frame else {
                panic!("unexpected frame type");
            };
            // every frame is a complete, parseable message
            let msg: SocketMessage = serde_json::from_str(&text).unwrap();
            let seq: serde_json::Value = serde_json::from_str(&msg.data).unwrap();
            let seq = seq["seq"].as_i64().unwrap();
            let last = per_event.entry(msg.event).or_insert(-1);
            assert!(seq > *last, "frames from one task reordered");
            *last = seq;
            total += 1;
        }
        assert_eq!(total, 100);
    }
}
