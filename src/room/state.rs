use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

use crate::signaling::SocketWriter;

/// One connected client: its media session, its serialized socket writer
/// and the display name it joined with.
pub struct Peer {
    pub conn: Arc<RTCPeerConnection>,
    pub writer: Arc<SocketWriter>,
    pub name: String,
}

/// Everything a room tracks, guarded as a whole by [`Room::state`].
///
/// `tracks` maps the origin track id of each upload to the local track
/// that fans it out. `track_names` and `stream_names` label those ids
/// with the uploader's display name so subscribers can caption audio.
#[derive(Default)]
pub struct RoomState {
    pub peers: Vec<Peer>,
    pub tracks: HashMap<String, Arc<TrackLocalStaticRTP>>,
    pub track_names: HashMap<String, String>,
    pub stream_names: HashMap<String, String>,
}

/// A room is just its state behind one lock. The synchronizer and the
/// session driver work on the fields directly; every read and every
/// mutation happens while holding the lock.
pub struct Room {
    pub state: RwLock<RoomState>,
}

impl Room {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(RoomState::default()),
        })
    }
}
