//! Local capture devices and the peer-to-peer media session.

mod devices;
mod incoming;
mod peer_server;
mod webrtc_call;
mod webrtc_endpoint;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedReceiver;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::config::MediaConfig;
use crate::Error;

pub use devices::{acquire_local_media, SystemDevices};
pub use peer_server::{peer_server_url, MediaPayload, ServerMessage};
pub use webrtc_endpoint::WebRtcEndpoint;

/// Identifier of an endpoint on the peer discovery server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    pub fn random() -> Self {
        PeerId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConstraints {
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub facing_mode: String,
    pub audio: bool,
}

impl From<&MediaConfig> for MediaConstraints {
    fn from(config: &MediaConfig) -> Self {
        Self {
            ideal_width: config.ideal_width,
            ideal_height: config.ideal_height,
            facing_mode: config.facing_mode.clone(),
            audio: config.audio,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    VideoInput,
    AudioInput,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: String,
    pub kind: DeviceKind,
    pub label: String,
}

/// An opened capture device. The device stays claimed until released.
pub trait DeviceHandle: Send {
    fn release(self: Box<Self>);
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn enumerate(&self) -> Result<Vec<DeviceInfo>, Error>;
    async fn open(&self, device: &DeviceInfo) -> Result<Box<dyn DeviceHandle>, Error>;
}

/// One captured track bound to its device.
pub struct LocalTrack {
    kind: TrackKind,
    label: String,
    rtc: Arc<TrackLocalStaticSample>,
    device: Mutex<Option<Box<dyn DeviceHandle>>>,
    stopped: AtomicBool,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, stream_id: &str, device: &DeviceInfo, handle: Box<dyn DeviceHandle>) -> Self {
        let capability = match kind {
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
        };
        let track_id = match kind {
            TrackKind::Video => "video",
            TrackKind::Audio => "audio",
        };
        Self {
            kind,
            label: device.label.clone(),
            rtc: Arc::new(TrackLocalStaticSample::new(
                capability,
                track_id.to_owned(),
                stream_id.to_owned(),
            )),
            device: Mutex::new(Some(handle)),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        self.rtc.clone()
    }

    /// Releases the capture device. Calling it again does nothing.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let handle = self
            .device
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.release();
        }
        debug!("stopped {:?} track {}", self.kind, self.label);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Camera and microphone tracks of the local user.
pub struct LocalStream {
    id: String,
    tracks: Vec<Arc<LocalTrack>>,
}

impl LocalStream {
    pub fn new(id: String, tracks: Vec<Arc<LocalTrack>>) -> Self {
        Self { id, tracks }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    /// A handle that can stop the tracks from elsewhere.
    pub fn handle(&self) -> MediaHandle {
        MediaHandle {
            stream_id: self.id.clone(),
            tracks: self.tracks.clone(),
        }
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

impl Drop for LocalStream {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Clone)]
pub struct MediaHandle {
    stream_id: String,
    tracks: Vec<Arc<LocalTrack>>,
}

impl MediaHandle {
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn active_tracks(&self) -> usize {
        self.tracks.iter().filter(|t| !t.is_stopped()).count()
    }
}

impl fmt::Debug for MediaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaHandle")
            .field("stream_id", &self.stream_id)
            .field("tracks", &self.tracks.len())
            .field("active", &self.active_tracks())
            .finish()
    }
}

/// What the local user sees of the counterpart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteStream {
    pub id: String,
    pub kind: TrackKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaCallEvent {
    /// First remote track arrived.
    Stream(RemoteStream),
    /// Connectivity lost, the session may still recover.
    Disconnected,
    Reconnected,
    Error(String),
    Close,
}

#[async_trait]
pub trait CallControl: Send + Sync {
    async fn close(&self);
}

/// A media session with one remote peer.
pub struct MediaCall {
    peer: PeerId,
    events: UnboundedReceiver<MediaCallEvent>,
    control: Arc<dyn CallControl>,
}

impl MediaCall {
    pub fn new(
        peer: PeerId,
        events: UnboundedReceiver<MediaCallEvent>,
        control: Arc<dyn CallControl>,
    ) -> Self {
        Self {
            peer,
            events,
            control,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub async fn next_event(&mut self) -> Option<MediaCallEvent> {
        self.events.recv().await
    }

    pub async fn close(&self) {
        self.control.close().await;
    }
}

/// An offer from a remote peer waiting for a decision.
#[async_trait]
pub trait PendingCall: Send {
    fn peer(&self) -> &PeerId;
    async fn answer(self: Box<Self>, stream: &LocalStream) -> Result<MediaCall, Error>;
    async fn decline(self: Box<Self>);
}

#[async_trait]
pub trait MediaEndpoint: Send + Sync + 'static {
    fn peer_id(&self) -> PeerId;
    /// Places a media call carrying `stream`.
    async fn call(&self, remote: &PeerId, stream: &LocalStream) -> Result<MediaCall, Error>;
    /// Waits for an offer from `from`, declining offers from anyone else.
    /// `None` once the endpoint is destroyed.
    async fn next_incoming(&self, from: &PeerId) -> Option<Box<dyn PendingCall>>;
    /// Declines offers nobody has claimed.
    async fn discard_incoming(&self);
    async fn destroy(&self);
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    /// Counts device releases.
    #[derive(Clone, Default)]
    pub struct ReleaseCounter(pub Arc<AtomicUsize>);

    impl ReleaseCounter {
        pub fn count(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }

        pub fn handle(&self) -> Box<dyn DeviceHandle> {
            Box::new(CountingHandle(self.0.clone()))
        }
    }

    struct CountingHandle(Arc<AtomicUsize>);

    impl DeviceHandle for CountingHandle {
        fn release(self: Box<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn stream(releases: &ReleaseCounter) -> LocalStream {
        let camera = DeviceInfo {
            id: "/dev/video0".into(),
            kind: DeviceKind::VideoInput,
            label: "camera".into(),
        };
        let mic = DeviceInfo {
            id: "/dev/snd/pcmC0D0c".into(),
            kind: DeviceKind::AudioInput,
            label: "mic".into(),
        };
        LocalStream::new(
            "stream".into(),
            vec![
                Arc::new(LocalTrack::new(TrackKind::Video, "stream", &camera, releases.handle())),
                Arc::new(LocalTrack::new(TrackKind::Audio, "stream", &mic, releases.handle())),
            ],
        )
    }
}
