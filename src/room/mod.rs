mod state;

pub use state::{Peer, Room, RoomState};

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use webrtc::peer_connection::RTCPeerConnection;

/// Process-wide registry of live rooms.
///
/// Lock order: the registry lock is always taken before any room lock,
/// never the other way around. Rooms are created lazily on first join
/// and deleted once they hold neither peers nor forwarded tracks.
pub struct Rooms {
    inner: RwLock<HashMap<String, Arc<Room>>>,
}

impl Default for Rooms {
    fn default() -> Self {
        Self::new()
    }
}

impl Rooms {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get_or_create(&self, room_id: &str) -> Arc<Room> {
        let mut rooms = self.inner.write().await;
        if let Some(room) = rooms.get(room_id) {
            return Arc::clone(room);
        }
        let room = Room::new();
        rooms.insert(room_id.to_string(), Arc::clone(&room));
        room
    }

    /// Drops a peer out of a room, identified by its connection handle,
    /// then deletes the room if nothing is left in it. The emptiness
    /// check is repeated under the registry write lock: another client
    /// may have joined while no lock was held.
    pub async fn remove_peer(&self, room_id: &str, conn: &Arc<RTCPeerConnection>) {
        let room = {
            let rooms = self.inner.read().await;
            rooms.get(room_id).cloned()
        };
        let Some(room) = room else {
            return;
        };

        let now_empty = {
            let mut state = room.state.write().await;
            if let Some(idx) = state
                .peers
                .iter()
                .position(|p| Arc::ptr_eq(&p.conn, conn))
            {
                state.peers.remove(idx);
            }
            state.peers.is_empty() && state.tracks.is_empty()
        };

        if now_empty {
            let mut rooms = self.inner.write().await;
            if let Some(current) = rooms.get(room_id) {
                if Arc::ptr_eq(current, &room) {
                    let state = current.state.read().await;
                    if state.peers.is_empty() && state.tracks.is_empty() {
                        drop(state);
                        rooms.remove(room_id);
                    }
                }
            }
        }
    }

    /// Clones the current room handles out so callers can walk them
    /// without holding the registry lock.
    pub async fn snapshot(&self) -> Vec<Arc<Room>> {
        let rooms = self.inner.read().await;
        rooms.values().cloned().collect()
    }

    #[cfg(test)]
    pub(crate) async fn get(&self, room_id: &str) -> Option<Arc<Room>> {
        let rooms = self.inner.read().await;
        rooms.get(room_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::new_peer_connection;
    use crate::signaling::SocketWriter;
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
    use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

    const STUN: &str = "stun:stun.l.google.com:19302";

    async fn test_peer() -> Peer {
        let (writer, _rx) = SocketWriter::test_pair(8);
        Peer {
            conn: new_peer_connection(STUN).await.unwrap(),
            writer,
            name: "Anonymous".to_string(),
        }
    }

    fn opus_track(id: &str) -> Arc<TrackLocalStaticRTP> {
        Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                ..Default::default()
            },
            id.to_string(),
            format!("stream-{id}"),
        ))
    }

    #[tokio::test]
    async fn get_or_create_returns_the_same_room() {
        let rooms = Rooms::new();
        let a = rooms.get_or_create("r").await;
        let b = rooms.get_or_create("r").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &rooms.get_or_create("other").await));
    }

    #[tokio::test]
    async fn removing_the_last_peer_deletes_the_room() {
        let rooms = Rooms::new();
        let room = rooms.get_or_create("r").await;
        let peer = test_peer().await;
        let conn = Arc::clone(&peer.conn);
        room.state.write().await.peers.push(peer);

        rooms.remove_peer("r", &conn).await;
        assert!(rooms.get("r").await.is_none());
    }

    #[tokio::test]
    async fn a_live_forwarded_track_keeps_the_room_alive() {
        let rooms = Rooms::new();
        let room = rooms.get_or_create("r").await;
        let peer = test_peer().await;
        let conn = Arc::clone(&peer.conn);
        {
            let mut state = room.state.write().await;
            state.peers.push(peer);
            state.tracks.insert("t".to_string(), opus_track("t"));
        }

        rooms.remove_peer("r", &conn).await;
        let room = rooms.get("r").await.expect("room should survive");
        assert!(room.state.read().await.peers.is_empty());

        room.state.write().await.tracks.clear();
        // no peer left to remove, but the next removal attempt still GCs
        rooms.remove_peer("r", &conn).await;
        assert!(rooms.get("r").await.is_none());
    }

    #[tokio::test]
    async fn removing_an_unknown_peer_or_room_is_a_no_op() {
        let rooms = Rooms::new();
        let peer = test_peer().await;
        rooms.remove_peer("missing", &peer.conn).await;

        let room = rooms.get_or_create("r").await;
        room.state.write().await.peers.push(test_peer().await);
        rooms.remove_peer("r", &peer.conn).await;
        assert_eq!(rooms.get("r").await.unwrap().state.read().await.peers.len(), 1);
    }
}
