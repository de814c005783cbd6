use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::{oneshot, RwLock};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::config::PeerConfig;
use crate::media::incoming::IncomingOffers;
use crate::media::peer_server::{peer_server_url, ErrorPayload, PeerServerSignaller, ServerMessage};
use crate::media::webrtc_call::{add_local_tracks, register_handlers, spawn_candidate_pump, SignalLink};
use crate::media::{
    CallControl, LocalStream, MediaCall, MediaCallEvent, MediaEndpoint, PeerId, PendingCall,
};
use crate::Error;

const OPEN_TIMEOUT: Duration = Duration::from_secs(10);

fn random_string(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Signaling state of one media connection, keyed by connection id.
struct Route {
    remote: PeerId,
    answer: Option<oneshot::Sender<RTCSessionDescription>>,
    candidates: UnboundedSender<RTCIceCandidateInit>,
    events: UnboundedSender<MediaCallEvent>,
    peer_connection: Option<Arc<RTCPeerConnection>>,
}

type Routes = Arc<RwLock<HashMap<String, Route>>>;

/// WebRTC media endpoint registered on a PeerJS discovery server.
pub struct WebRtcEndpoint {
    peer_id: PeerId,
    api: Arc<API>,
    config: RTCConfiguration,
    send_queue: mpsc::Sender<ServerMessage>,
    routes: Routes,
    incoming: Arc<IncomingOffers>,
    shutdown: std::sync::Mutex<Option<oneshot::Sender<()>>>,
    answer_timeout: Duration,
    destroyed: AtomicBool,
}

impl WebRtcEndpoint {
    pub fn make_config(config: &PeerConfig) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: config
                .ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone(),
                    credential: server.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    /// Registers a fresh peer id on the discovery server and starts serving
    /// signaling for it.
    pub async fn open(config: &PeerConfig, answer_timeout: Duration) -> Result<Self, Error> {
        info!("Initializing WebRTC");
        let peer_id = PeerId::random();
        let url = peer_server_url(&config.url, &config.key, &peer_id, &random_string(16))?;
        let mut signaller = PeerServerSignaller::connect(url).await?;
        signaller.wait_open(OPEN_TIMEOUT).await?;
        let PeerServerSignaller {
            send_queue,
            inbound,
            shutdown,
        } = signaller;
        info!("Registered as peer {}", peer_id);

        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let routes: Routes = Arc::new(RwLock::new(HashMap::new()));
        let incoming = Arc::new(IncomingOffers::default());

        let endpoint = Self {
            peer_id,
            api: Arc::new(api),
            config: Self::make_config(config),
            send_queue,
            routes: routes.clone(),
            incoming: incoming.clone(),
            shutdown: std::sync::Mutex::new(Some(shutdown)),
            answer_timeout,
            destroyed: AtomicBool::new(false),
        };

        tokio::spawn(dispatch(inbound, routes, incoming, endpoint.factory()));
        info!("WebRTC initialized");
        Ok(endpoint)
    }

    fn factory(&self) -> ConnectionFactory {
        ConnectionFactory {
            api: self.api.clone(),
            config: self.config.clone(),
            send_queue: self.send_queue.clone(),
            routes: self.routes.clone(),
        }
    }
}

/// Everything needed to build a peer connection for a route.
#[derive(Clone)]
struct ConnectionFactory {
    api: Arc<API>,
    config: RTCConfiguration,
    send_queue: mpsc::Sender<ServerMessage>,
    routes: Routes,
}

impl ConnectionFactory {
    async fn connect(
        &self,
        connection_id: &str,
        remote: &PeerId,
        stream: &LocalStream,
        events: UnboundedSender<MediaCallEvent>,
    ) -> Result<(Arc<RTCPeerConnection>, SignalLink), Error> {
        let peer_connection = Arc::new(self.api.new_peer_connection(self.config.clone()).await?);
        let link = SignalLink {
            send_queue: self.send_queue.clone(),
            connection_id: connection_id.to_string(),
            remote: remote.clone(),
        };
        if let Err(e) = add_local_tracks(&peer_connection, stream).await {
            let _ = peer_connection.close().await;
            return Err(e);
        }
        register_handlers(&peer_connection, link.clone(), events);
        if let Some(route) = self.routes.write().await.get_mut(connection_id) {
            route.peer_connection = Some(peer_connection.clone());
        }
        Ok((peer_connection, link))
    }

    fn control(&self, connection_id: &str) -> Arc<dyn CallControl> {
        Arc::new(ConnectionControl {
            connection_id: connection_id.to_string(),
            routes: self.routes.clone(),
        })
    }
}

async fn dispatch(
    mut inbound: mpsc::Receiver<ServerMessage>,
    routes: Routes,
    incoming: Arc<IncomingOffers>,
    factory: ConnectionFactory,
) {
    while let Some(msg) = inbound.recv().await {
        match msg {
            ServerMessage::Offer { src, payload, .. } => {
                let (Some(src), Some(sdp)) = (src, payload.sdp) else {
                    warn!("Offer without source or description");
                    continue;
                };
                if routes.read().await.contains_key(&payload.connection_id) {
                    debug!("Ignoring renegotiation on {}", payload.connection_id);
                    continue;
                }
                let remote = PeerId::new(src);
                let (candidates, candidate_receiver) = mpsc::unbounded_channel();
                let (events, event_receiver) = mpsc::unbounded_channel();
                routes.write().await.insert(
                    payload.connection_id.clone(),
                    Route {
                        remote: remote.clone(),
                        answer: None,
                        candidates,
                        events,
                        peer_connection: None,
                    },
                );
                info!("Incoming media call from {}", remote);
                let pending = WebRtcPendingCall {
                    remote,
                    connection_id: payload.connection_id,
                    offer: sdp,
                    candidates: candidate_receiver,
                    events: event_receiver,
                    factory: factory.clone(),
                };
                if let Some(replaced) = incoming.push(Box::new(pending)) {
                    debug!("Newer offer from {} replaces an unanswered one", replaced.peer());
                    replaced.decline().await;
                }
                trace!("{} offer(s) waiting to be answered", incoming.len());
            }
            ServerMessage::Answer { payload, .. } => {
                let sender = routes
                    .write()
                    .await
                    .get_mut(&payload.connection_id)
                    .and_then(|route| route.answer.take());
                match (sender, payload.sdp) {
                    (Some(sender), Some(sdp)) => {
                        let _ = sender.send(sdp);
                    }
                    _ => debug!("Unexpected answer on {}", payload.connection_id),
                }
            }
            ServerMessage::Candidate { payload, .. } => {
                let routes = routes.read().await;
                match (routes.get(&payload.connection_id), payload.candidate) {
                    (Some(route), Some(candidate)) => {
                        let _ = route.candidates.send(candidate);
                    }
                    _ => trace!("Dropping candidate for {}", payload.connection_id),
                }
            }
            ServerMessage::Leave { src } | ServerMessage::Expire { src } => {
                let Some(src) = src else { continue };
                info!("Peer {} left", src);
                let mut routes = routes.write().await;
                let gone: Vec<String> = routes
                    .iter()
                    .filter(|(_, route)| route.remote.as_str() == src)
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in gone {
                    if let Some(route) = routes.remove(&id) {
                        let _ = route.events.send(MediaCallEvent::Close);
                        if let Some(peer_connection) = route.peer_connection {
                            tokio::spawn(async move {
                                let _ = peer_connection.close().await;
                            });
                        }
                    }
                }
            }
            ServerMessage::Error { payload } => {
                warn!("Peer server error: {}", ErrorPayload::describe(&payload));
            }
            ServerMessage::IdTaken { .. } | ServerMessage::Open | ServerMessage::Heartbeat => {}
        }
    }
    debug!("Peer server dispatcher finished");
}

struct ConnectionControl {
    connection_id: String,
    routes: Routes,
}

#[async_trait]
impl CallControl for ConnectionControl {
    async fn close(&self) {
        let route = self.routes.write().await.remove(&self.connection_id);
        if let Some(peer_connection) = route.and_then(|route| route.peer_connection) {
            if let Err(e) = peer_connection.close().await {
                debug!("closing {}: {}", self.connection_id, e);
            }
        }
    }
}

struct WebRtcPendingCall {
    remote: PeerId,
    connection_id: String,
    offer: RTCSessionDescription,
    candidates: mpsc::UnboundedReceiver<RTCIceCandidateInit>,
    events: mpsc::UnboundedReceiver<MediaCallEvent>,
    factory: ConnectionFactory,
}

#[async_trait]
impl PendingCall for WebRtcPendingCall {
    fn peer(&self) -> &PeerId {
        &self.remote
    }

    async fn answer(self: Box<Self>, stream: &LocalStream) -> Result<MediaCall, Error> {
        let this = *self;
        let event_sender = match this.factory.routes.read().await.get(&this.connection_id) {
            Some(route) => route.events.clone(),
            None => return Err(Error::PeerNegotiation("the caller went away".to_string())),
        };
        let control = this.factory.control(&this.connection_id);
        let connected = this
            .factory
            .connect(&this.connection_id, &this.remote, stream, event_sender)
            .await;
        let (peer_connection, link) = match connected {
            Ok(connected) => connected,
            Err(e) => {
                control.close().await;
                return Err(e);
            }
        };

        let offer = this.offer;
        let negotiated = async {
            peer_connection.set_remote_description(offer).await?;
            let answer = peer_connection.create_answer(None).await?;
            peer_connection.set_local_description(answer.clone()).await?;
            Ok::<_, Error>(answer)
        }
        .await;
        let answer = match negotiated {
            Ok(answer) => answer,
            Err(e) => {
                control.close().await;
                return Err(e);
            }
        };
        link.send_answer(answer).await?;
        spawn_candidate_pump(peer_connection, this.candidates);
        info!("Answered media call from {}", this.remote);
        Ok(MediaCall::new(this.remote, this.events, control))
    }

    async fn decline(self: Box<Self>) {
        info!("Declining media call from {}", self.remote);
        self.factory.routes.write().await.remove(&self.connection_id);
    }
}

#[async_trait]
impl MediaEndpoint for WebRtcEndpoint {
    fn peer_id(&self) -> PeerId {
        self.peer_id.clone()
    }

    async fn call(&self, remote: &PeerId, stream: &LocalStream) -> Result<MediaCall, Error> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(Error::PeerNegotiation("media endpoint destroyed".to_string()));
        }
        let connection_id = format!("mc_{}", random_string(12));
        let (answer_sender, answer_receiver) = oneshot::channel();
        let (candidates, candidate_receiver) = mpsc::unbounded_channel();
        let (events, event_receiver) = mpsc::unbounded_channel();
        self.routes.write().await.insert(
            connection_id.clone(),
            Route {
                remote: remote.clone(),
                answer: Some(answer_sender),
                candidates,
                events: events.clone(),
                peer_connection: None,
            },
        );

        let factory = self.factory();
        let control = factory.control(&connection_id);
        let offered = async {
            let (peer_connection, link) = factory
                .connect(&connection_id, remote, stream, events.clone())
                .await?;
            let offer = peer_connection.create_offer(None).await?;
            peer_connection.set_local_description(offer.clone()).await?;
            trace!("Making an offer: {}", offer.sdp);
            link.send_offer(offer).await?;
            Ok::<_, Error>(peer_connection)
        }
        .await;
        let peer_connection = match offered {
            Ok(peer_connection) => peer_connection,
            Err(e) => {
                control.close().await;
                return Err(e);
            }
        };

        info!("Waiting for an answer from {}", remote);
        let answer_timeout = self.answer_timeout;
        tokio::spawn(async move {
            let answer = match tokio::time::timeout(answer_timeout, answer_receiver).await {
                Ok(Ok(answer)) => answer,
                Ok(Err(_)) => return,
                Err(_) => {
                    let _ = events.send(MediaCallEvent::Error("no answer from peer".to_string()));
                    return;
                }
            };
            trace!("Received answer: {}", answer.sdp);
            if let Err(e) = peer_connection.set_remote_description(answer).await {
                let _ = events.send(MediaCallEvent::Error(e.to_string()));
                return;
            }
            spawn_candidate_pump(peer_connection, candidate_receiver);
        });

        Ok(MediaCall::new(remote.clone(), event_receiver, control))
    }

    async fn next_incoming(&self, from: &PeerId) -> Option<Box<dyn PendingCall>> {
        if self.destroyed.load(Ordering::SeqCst) {
            return None;
        }
        self.incoming.claim(from).await
    }

    async fn discard_incoming(&self) {
        self.incoming.discard().await;
    }

    async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Destroying media endpoint {}", self.peer_id);
        self.incoming.close().await;
        let routes: Vec<Route> = self.routes.write().await.drain().map(|(_, r)| r).collect();
        for route in routes {
            let _ = route.events.send(MediaCallEvent::Close);
            if let Some(peer_connection) = route.peer_connection {
                let _ = peer_connection.close().await;
            }
        }
        let shutdown = self
            .shutdown
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(());
        }
    }
}
