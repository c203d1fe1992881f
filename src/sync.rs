//! Keeps every subscriber's media session in step with its room: each
//! peer must be sending exactly the room's forwarded tracks, minus its
//! own upload, and must have received an offer reflecting that set.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tracing::{debug, warn};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::track::track_local::TrackLocal;

use crate::room::{Room, RoomState};
use crate::signaling::{OfferEnvelope, SocketMessage};

/// How often every sender is asked for a fresh intra-coded frame.
pub const KEYFRAME_INTERVAL: Duration = Duration::from_secs(3);

/// Attempts per sync round before backing off. Holding the room lock
/// across an unbounded retry loop would deadlock the track and
/// connection-state callbacks that need the same lock.
const SYNC_ATTEMPTS: usize = 25;

const RESYNC_DELAY: Duration = Duration::from_secs(3);

/// Brings every peer in the room up to date. If the bounded retry burst
/// does not converge, the room lock is released and a background task
/// keeps retrying on a fixed delay.
pub async fn signal_peers(room: Arc<Room>) {
    if sync_round(&room).await {
        return;
    }
    tokio::spawn(async move {
        loop {
            time::sleep(RESYNC_DELAY).await;
            if sync_round(&room).await {
                return;
            }
        }
    });
}

/// One bounded burst of sync attempts under the room lock. Keyframes are
/// solicited after the lock is released so freshly attached subscribers
/// can start decoding. Returns false if the attempt cap ran out.
async fn sync_round(room: &Arc<Room>) -> bool {
    let synced = {
        let mut state = room.state.write().await;
        let mut synced = false;
        for _ in 0..SYNC_ATTEMPTS {
            if !attempt_sync(&mut state).await {
                synced = true;
                break;
            }
        }
        synced
    };
    if !synced {
        warn!("room did not converge after {SYNC_ATTEMPTS} sync attempts, rescheduling");
    }
    dispatch_keyframes(room).await;
    synced
}

/// A single pass over the peer list. Returns true if anything forced a
/// rescan: a closed peer spliced out from under the iteration, or a
/// failed track/offer operation.
async fn attempt_sync(state: &mut RoomState) -> bool {
    let mut i = 0;
    while i < state.peers.len() {
        if state.peers[i].conn.connection_state() == RTCPeerConnectionState::Closed {
            state.peers.remove(i);
            return true;
        }

        let peer = &state.peers[i];

        // Ids this peer already sends, plus the ids it uploads itself.
        // Counting receiver ids keeps a peer from being offered its own
        // audio back: forwarded tracks reuse the origin track id.
        let mut existing: HashSet<String> = HashSet::new();

        for sender in peer.conn.get_senders().await {
            let Some(track) = sender.track().await else {
                continue;
            };
            let id = track.id().to_string();
            let live = state.tracks.contains_key(&id);
            existing.insert(id);
            if !live {
                if let Err(err) = peer.conn.remove_track(&sender).await {
                    warn!("failed to remove stale sender: {err}");
                    return true;
                }
            }
        }

        for receiver in peer.conn.get_receivers().await {
            let Some(track) = receiver.tracks().await.into_iter().next() else {
                continue;
            };
            existing.insert(track.id());
        }

        for (id, local) in &state.tracks {
            if !existing.contains(id) {
                let track = Arc::clone(local) as Arc<dyn TrackLocal + Send + Sync>;
                if let Err(err) = peer.conn.add_track(track).await {
                    warn!("failed to add track to peer connection: {err}");
                    return true;
                }
            }
        }

        let offer = match peer.conn.create_offer(None).await {
            Ok(offer) => offer,
            Err(err) => {
                warn!("failed to create offer: {err}");
                return true;
            }
        };
        if let Err(err) = peer.conn.set_local_description(offer.clone()).await {
            warn!("failed to set local description: {err}");
            return true;
        }

        let envelope = OfferEnvelope {
            offer,
            track_names: state.track_names.clone(),
            stream_names: state.stream_names.clone(),
        };
        let data = match serde_json::to_string(&envelope) {
            Ok(data) => data,
            Err(err) => {
                warn!("failed to serialize offer envelope: {err}");
                return true;
            }
        };

        debug!("sending offer to {} with track names {:?}", peer.name, envelope.track_names);

        let message = SocketMessage {
            event: "offer".to_string(),
            data,
        };
        if peer.writer.write_json(&message).await.is_err() {
            return true;
        }

        i += 1;
    }

    false
}

/// Asks every uploader in the room for a keyframe by sending a Picture
/// Loss Indication toward each receiver's SSRC. Best-effort: RTCP write
/// failures are ignored. The write lock mirrors the synchronizer; the
/// peer list may be spliced concurrently.
pub async fn dispatch_keyframes(room: &Room) {
    let state = room.state.write().await;
    for peer in &state.peers {
        for receiver in peer.conn.get_receivers().await {
            let Some(track) = receiver.tracks().await.into_iter().next() else {
                continue;
            };
            let pli = PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc: track.ssrc(),
            };
            let _ = peer.conn.write_rtcp(&[Box::new(pli)]).await;
        }
    }
}
