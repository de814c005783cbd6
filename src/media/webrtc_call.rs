use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;

use crate::media::{LocalStream, MediaCallEvent, MediaPayload, PeerId, RemoteStream, ServerMessage, TrackKind};
use crate::Error;

/// Addressing for signaling messages of one media connection.
#[derive(Debug, Clone)]
pub(crate) struct SignalLink {
    pub send_queue: mpsc::Sender<ServerMessage>,
    pub connection_id: String,
    pub remote: PeerId,
}

impl SignalLink {
    pub async fn send_offer(&self, sdp: RTCSessionDescription) -> Result<(), Error> {
        self.send(ServerMessage::Offer {
            src: None,
            dst: Some(self.remote.to_string()),
            payload: MediaPayload::sdp(&self.connection_id, sdp),
        })
        .await
    }

    pub async fn send_answer(&self, sdp: RTCSessionDescription) -> Result<(), Error> {
        self.send(ServerMessage::Answer {
            src: None,
            dst: Some(self.remote.to_string()),
            payload: MediaPayload::sdp(&self.connection_id, sdp),
        })
        .await
    }

    pub async fn send_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), Error> {
        self.send(ServerMessage::Candidate {
            src: None,
            dst: Some(self.remote.to_string()),
            payload: MediaPayload::candidate(&self.connection_id, candidate),
        })
        .await
    }

    async fn send(&self, msg: ServerMessage) -> Result<(), Error> {
        self.send_queue
            .send(msg)
            .await
            .map_err(|_| Error::Network("peer server connection closed".to_string()))
    }
}

pub(crate) async fn add_local_tracks(
    peer_connection: &Arc<RTCPeerConnection>,
    stream: &LocalStream,
) -> Result<(), Error> {
    for track in stream.tracks() {
        let rtc_track: Arc<dyn TrackLocal + Send + Sync> = track.rtc_track();
        let sender = peer_connection.add_track(rtc_track).await?;
        // drain RTCP so interceptors keep working
        tokio::spawn(async move {
            let mut buffer = vec![0u8; 1500];
            while sender.read(&mut buffer).await.is_ok() {}
        });
    }
    Ok(())
}

/// Wires connection callbacks to the call's event channel and the signaling
/// link.
pub(crate) fn register_handlers(
    peer_connection: &Arc<RTCPeerConnection>,
    link: SignalLink,
    events: UnboundedSender<MediaCallEvent>,
) {
    peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let link = link.clone();
        Box::pin(async move {
            if let Some(candidate) = candidate {
                trace!("local ICE candidate {:?}", candidate);
                match candidate.to_json() {
                    Ok(init) => {
                        if let Err(e) = link.send_candidate(init).await {
                            debug!("could not send ICE candidate: {}", e);
                        }
                    }
                    Err(e) => warn!("could not encode ICE candidate: {}", e),
                }
            }
        })
    }));

    let announced = Arc::new(AtomicBool::new(false));
    let track_events = events.clone();
    peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
        let kind = match track.kind() {
            RTPCodecType::Audio => TrackKind::Audio,
            _ => TrackKind::Video,
        };
        if !announced.swap(true, Ordering::SeqCst) {
            let _ = track_events.send(MediaCallEvent::Stream(RemoteStream {
                id: track.stream_id(),
                kind,
            }));
        } else {
            debug!("additional remote {:?} track", kind);
        }
        Box::pin(async {})
    }));

    let disconnected = Arc::new(AtomicBool::new(false));
    peer_connection.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        debug!("peer connection state {}", state);
        let event = match state {
            RTCPeerConnectionState::Disconnected => {
                disconnected.store(true, Ordering::SeqCst);
                Some(MediaCallEvent::Disconnected)
            }
            RTCPeerConnectionState::Connected if disconnected.swap(false, Ordering::SeqCst) => {
                Some(MediaCallEvent::Reconnected)
            }
            RTCPeerConnectionState::Failed => {
                Some(MediaCallEvent::Error("peer connection failed".to_string()))
            }
            RTCPeerConnectionState::Closed => Some(MediaCallEvent::Close),
            _ => None,
        };
        if let Some(event) = event {
            let _ = events.send(event);
        }
        Box::pin(async {})
    }));
}

/// Applies remote candidates until the signaling side goes away.
pub(crate) fn spawn_candidate_pump(
    peer_connection: Arc<RTCPeerConnection>,
    mut candidates: UnboundedReceiver<RTCIceCandidateInit>,
) {
    tokio::spawn(async move {
        while let Some(candidate) = candidates.recv().await {
            trace!("remote ICE candidate {:?}", candidate);
            if let Err(e) = peer_connection.add_ice_candidate(candidate).await {
                warn!("could not add ICE candidate: {}", e);
            }
        }
    });
}
