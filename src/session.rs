//! One session per connected client: join handshake, peer-connection
//! setup, trickle ICE in both directions, remote-track ingest and
//! teardown.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

use crate::error::{Error, Result};
use crate::room::{Peer, Room};
use crate::signaling::{JoinRequest, SocketMessage, SocketWriter};
use crate::sync::signal_peers;
use crate::App;

/// A client that has not answered a ping within this window is dead.
const READ_DEADLINE: Duration = Duration::from_secs(60);

const PING_INTERVAL: Duration = Duration::from_secs(30);

const RTP_READ_BUFFER: usize = 1500;

/// Drives one client from upgrade to teardown.
pub async fn handle_socket(socket: WebSocket, app: Arc<App>) {
    let (sink, stream) = socket.split();
    let writer = SocketWriter::spawn(sink);
    let mut reader = SocketReader::new(stream);
    let shutdown = CancellationToken::new();

    spawn_keepalive(Arc::clone(&writer), shutdown.clone());

    let raw = match reader.next_text().await {
        Ok(Some(raw)) => raw,
        Ok(None) => {
            shutdown.cancel();
            return;
        }
        Err(err) => {
            warn!("failed to read join message: {err}");
            shutdown.cancel();
            return;
        }
    };
    info!("got initial message: {raw}");

    let (room_id, name) = match parse_join(&raw) {
        Ok(join) => join,
        Err(err) => {
            warn!("rejecting session: {err}");
            shutdown.cancel();
            writer.close().await;
            return;
        }
    };
    info!("client joining room {room_id} as {name}");

    let room = app.rooms.get_or_create(&room_id).await;

    let conn = match new_peer_connection(&app.stun_url).await {
        Ok(conn) => conn,
        Err(err) => {
            error!("failed to create peer connection: {err}");
            shutdown.cancel();
            writer.close().await;
            return;
        }
    };

    // The server accepts exactly one inbound audio track per client.
    let init = RTCRtpTransceiverInit {
        direction: RTCRtpTransceiverDirection::Recvonly,
        send_encodings: vec![],
    };
    if let Err(err) = conn
        .add_transceiver_from_kind(RTPCodecType::Audio, Some(init))
        .await
    {
        error!("failed to add audio transceiver: {err}");
        shutdown.cancel();
        let _ = conn.close().await;
        writer.close().await;
        return;
    }

    {
        let mut state = room.state.write().await;
        state.peers.push(Peer {
            conn: Arc::clone(&conn),
            writer: Arc::clone(&writer),
            name: name.clone(),
        });
    }

    install_callbacks(&conn, &room, &writer);

    // Bring the newcomer (and everyone else) up to date.
    signal_peers(Arc::clone(&room)).await;

    if let Err(err) = read_loop(&mut reader, &shutdown, &conn).await {
        warn!("session ended: {err}");
    }

    shutdown.cancel();
    if let Err(err) = conn.close().await {
        error!("failed to close peer connection: {err}");
    }
    app.rooms.remove_peer(&room_id, &conn).await;
    writer.close().await;
}

/// Builds a peer connection the way every session gets one: default
/// codecs, default interceptors, a single STUN server.
pub(crate) async fn new_peer_connection(stun_url: &str) -> Result<Arc<RTCPeerConnection>> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: vec![stun_url.to_string()],
            ..Default::default()
        }],
        ..Default::default()
    };

    Ok(Arc::new(api.new_peer_connection(config).await?))
}

fn install_callbacks(conn: &Arc<RTCPeerConnection>, room: &Arc<Room>, writer: &Arc<SocketWriter>) {
    // Trickle ICE: push each server-side candidate down as it appears.
    let writer_out = Arc::clone(writer);
    conn.on_ice_candidate(Box::new(move |candidate| {
        let writer = Arc::clone(&writer_out);
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            // to_json keeps sdpMid and sdpMLineIndex intact; serializing
            // the candidate struct directly would lose them
            let init = match candidate.to_json() {
                Ok(init) => init,
                Err(err) => {
                    error!("failed to marshal candidate: {err}");
                    return;
                }
            };
            let data = match serde_json::to_string(&init) {
                Ok(data) => data,
                Err(err) => {
                    error!("failed to serialize candidate: {err}");
                    return;
                }
            };
            debug!("sending candidate to client: {data}");
            let message = SocketMessage {
                event: "candidate".to_string(),
                data,
            };
            if let Err(err) = writer.write_json(&message).await {
                warn!("failed to send candidate: {err}");
            }
        })
    }));

    let room_on_state = Arc::clone(room);
    let conn_on_state = Arc::downgrade(conn);
    conn.on_peer_connection_state_change(Box::new(move |state| {
        info!("connection state changed: {state}");
        let room = Arc::clone(&room_on_state);
        let conn = conn_on_state.clone();
        Box::pin(async move {
            match state {
                RTCPeerConnectionState::Failed => {
                    if let Some(conn) = conn.upgrade() {
                        if let Err(err) = conn.close().await {
                            error!("failed to close peer connection: {err}");
                        }
                    }
                }
                RTCPeerConnectionState::Closed => {
                    // the rest of the room must stop being offered this
                    // peer's upload
                    signal_peers(room).await;
                }
                _ => {}
            }
        })
    }));

    let room_on_track = Arc::clone(room);
    let conn_on_track = Arc::downgrade(conn);
    conn.on_track(Box::new(move |remote, _, _| {
        let room = Arc::clone(&room_on_track);
        let conn = conn_on_track.clone();
        Box::pin(async move {
            let Some(conn) = conn.upgrade() else {
                return;
            };
            // ingest runs on its own task so this callback returns
            // promptly and does not hold up later track notifications
            tokio::spawn(ingest(room, conn, remote));
        })
    }));

    conn.on_ice_connection_state_change(Box::new(move |state| {
        info!("ICE connection state changed: {state}");
        Box::pin(async {})
    }));
}

/// Copies RTP from one inbound track into a forwarding track until the
/// upload ends, then withdraws the track from the room.
async fn ingest(room: Arc<Room>, owner: Arc<RTCPeerConnection>, remote: Arc<TrackRemote>) {
    info!(
        "got remote track: kind={}, id={}, payload_type={}",
        remote.kind(),
        remote.id(),
        remote.payload_type()
    );

    // The uploader's display name, found by connection identity.
    let owner_name = {
        let state = room.state.read().await;
        state
            .peers
            .iter()
            .find(|p| Arc::ptr_eq(&p.conn, &owner))
            .map(|p| p.name.clone())
            .unwrap_or_default()
    };

    let track_id = remote.id();
    let stream_id = remote.stream_id();

    let local = {
        let mut state = room.state.write().await;
        state
            .track_names
            .insert(track_id.clone(), owner_name.clone());
        state
            .stream_names
            .insert(stream_id.clone(), owner_name.clone());
        // the forwarding track reuses the origin ids; the synchronizer's
        // receiver-id union relies on that to suppress loopback
        let local = Arc::new(TrackLocalStaticRTP::new(
            remote.codec().capability.clone(),
            track_id.clone(),
            stream_id.clone(),
        ));
        state.tracks.insert(track_id.clone(), Arc::clone(&local));
        local
    };
    signal_peers(Arc::clone(&room)).await;

    let local_id = local.id().to_string();
    if local_id != track_id {
        let mut state = room.state.write().await;
        state.track_names.insert(local_id.clone(), owner_name);
    }

    let mut buf = vec![0u8; RTP_READ_BUFFER];
    loop {
        let (mut packet, _) = match remote.read(&mut buf).await {
            Ok(read) => read,
            Err(err) => {
                debug!("ingest for track {track_id} ended: {err}");
                break;
            }
        };
        strip_extensions(&mut packet);
        if local.write_rtp(&packet).await.is_err() {
            break;
        }
    }

    {
        let mut state = room.state.write().await;
        state.track_names.remove(&track_id);
        if local_id != track_id {
            state.track_names.remove(&local_id);
        }
        state.stream_names.remove(&stream_id);
        state.tracks.remove(&track_id);
    }
    signal_peers(room).await;
}

/// Header extensions are origin-specific and cannot be rewritten
/// consistently for every fan-out destination; drop them.
fn strip_extensions(packet: &mut Packet) {
    packet.header.extension = false;
    packet.header.extensions.clear();
}

/// Validates the mandatory first message of a session and applies the
/// display-name fallback.
fn parse_join(raw: &str) -> Result<(String, String)> {
    let message: SocketMessage = serde_json::from_str(raw)?;
    if message.event != "join" {
        return Err(Error::Protocol(format!(
            "expected join event, got {:?}",
            message.event
        )));
    }
    let join: JoinRequest = serde_json::from_str(&message.data)?;
    if join.room_id.is_empty() {
        return Err(Error::Protocol("room id is empty".to_string()));
    }
    let name = if join.name.is_empty() {
        "Anonymous".to_string()
    } else {
        join.name
    };
    Ok((join.room_id, name))
}

fn spawn_keepalive(writer: Arc<SocketWriter>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = time::interval(PING_INTERVAL);
        ticker.tick().await; // the first tick completes immediately
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(err) = writer.ping().await {
                        warn!("ping failed, dropping client: {err}");
                        shutdown.cancel();
                        return;
                    }
                }
            }
        }
    });
}

async fn read_loop(
    reader: &mut SocketReader,
    shutdown: &CancellationToken,
    conn: &Arc<RTCPeerConnection>,
) -> Result<()> {
    loop {
        let raw = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            next = reader.next_text() => match next? {
                Some(raw) => raw,
                None => return Ok(()),
            },
        };
        debug!("got message: {raw}");

        let message: SocketMessage = serde_json::from_str(&raw)?;
        match message.event.as_str() {
            "candidate" => {
                let candidate: RTCIceCandidateInit = serde_json::from_str(&message.data)?;
                debug!("got candidate: {:?}", candidate);
                conn.add_ice_candidate(candidate).await?;
            }
            "answer" => {
                let answer: RTCSessionDescription = serde_json::from_str(&message.data)?;
                conn.set_remote_description(answer).await?;
            }
            other => warn!("unknown message event: {other}"),
        }
    }
}

/// Receive half of the socket with the read deadline folded in. Pongs
/// re-arm the deadline; everything else the session cares about is a
/// text frame.
struct SocketReader {
    stream: SplitStream<WebSocket>,
    deadline: Instant,
}

impl SocketReader {
    fn new(stream: SplitStream<WebSocket>) -> Self {
        Self {
            stream,
            deadline: Instant::now() + READ_DEADLINE,
        }
    }

    async fn next_text(&mut self) -> Result<Option<String>> {
        loop {
            let frame = match time::timeout_at(self.deadline, self.stream.next()).await {
                Err(_) => return Err(Error::Protocol("read deadline exceeded".to_string())),
                Ok(None) => return Ok(None),
                Ok(Some(Err(err))) => return Err(Error::Socket(err)),
                Ok(Some(Ok(frame))) => frame,
            };
            match frame {
                Message::Text(text) => return Ok(Some(text)),
                Message::Pong(_) => self.deadline = Instant::now() + READ_DEADLINE,
                Message::Close(_) => return Ok(None),
                Message::Ping(_) | Message::Binary(_) => {}
            }
        }
    }
}
