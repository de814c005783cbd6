use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::media::PeerId;
use crate::Error;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Messages of the PeerJS discovery server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING-KEBAB-CASE")]
pub enum ServerMessage {
    Open,
    IdTaken {
        #[serde(default)]
        payload: Option<ErrorPayload>,
    },
    Error {
        #[serde(default)]
        payload: Option<ErrorPayload>,
    },
    Heartbeat,
    Offer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dst: Option<String>,
        payload: MediaPayload,
    },
    Answer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dst: Option<String>,
        payload: MediaPayload,
    },
    Candidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        src: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dst: Option<String>,
        payload: MediaPayload,
    },
    Leave {
        #[serde(default)]
        src: Option<String>,
    },
    Expire {
        #[serde(default)]
        src: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(default)]
    pub msg: String,
}

impl ErrorPayload {
    pub fn describe(payload: &Option<ErrorPayload>) -> String {
        payload
            .as_ref()
            .map(|p| p.msg.clone())
            .filter(|msg| !msg.is_empty())
            .unwrap_or_else(|| "unknown error".to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaPayload {
    pub connection_id: String,
    #[serde(rename = "type", default = "media_connection")]
    pub connection_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<RTCSessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<RTCIceCandidateInit>,
}

// `RTCSessionDescription` does not implement `PartialEq`; compare its public fields.
impl PartialEq for MediaPayload {
    fn eq(&self, other: &Self) -> bool {
        self.connection_id == other.connection_id
            && self.connection_type == other.connection_type
            && match (&self.sdp, &other.sdp) {
                (Some(a), Some(b)) => a.sdp_type == b.sdp_type && a.sdp == b.sdp,
                (None, None) => true,
                _ => false,
            }
            && self.candidate == other.candidate
    }
}

fn media_connection() -> String {
    "media".to_string()
}

impl MediaPayload {
    pub fn sdp(connection_id: &str, sdp: RTCSessionDescription) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            connection_type: media_connection(),
            sdp: Some(sdp),
            candidate: None,
        }
    }

    pub fn candidate(connection_id: &str, candidate: RTCIceCandidateInit) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            connection_type: media_connection(),
            sdp: None,
            candidate: Some(candidate),
        }
    }
}

/// WebSocket address of the discovery server for `id`.
pub fn peer_server_url(base: &str, key: &str, id: &PeerId, token: &str) -> Result<Url, Error> {
    let mut url = Url::parse(base).map_err(|e| Error::Validation(format!("peer url: {}", e)))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(Error::Validation(format!("unsupported peer url scheme {}", other))),
    };
    let _ = url.set_scheme(scheme);
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    let mut url = url
        .join("peerjs")
        .map_err(|e| Error::Validation(format!("peer url: {}", e)))?;
    url.query_pairs_mut()
        .append_pair("key", key)
        .append_pair("id", id.as_str())
        .append_pair("token", token);
    Ok(url)
}

/// Connection to the discovery server.
///
/// Outgoing messages go through `send_queue`; everything the server sends
/// arrives on `inbound`. A heartbeat keeps the registration alive until
/// `shutdown` fires, is dropped, or every queue sender is gone.
pub(crate) struct PeerServerSignaller {
    pub send_queue: mpsc::Sender<ServerMessage>,
    pub inbound: mpsc::Receiver<ServerMessage>,
    pub shutdown: oneshot::Sender<()>,
}

impl PeerServerSignaller {
    pub async fn connect(url: Url) -> Result<Self, Error> {
        let (inbound_sender, inbound) = mpsc::channel::<ServerMessage>(32);
        let (send_queue, mut send_queue_receiver) = mpsc::channel::<ServerMessage>(32);
        let (shutdown, mut shutdown_receiver) = oneshot::channel::<()>();

        info!("Establishing peer server connection to {}", redact(&url));
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        debug!("Peer server connection established");
        let (mut write, mut read) = ws_stream.split();

        // create a task to read all incoming websocket messages
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(frame)) => {
                        info!("Peer server closed the connection: {:?}", frame);
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("Peer server read failed: {}", e);
                        break;
                    }
                };
                trace!("Received peer server message: {}", text);
                let msg = match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        debug!("Ignoring peer server message ({}): {}", e, text);
                        continue;
                    }
                };
                if inbound_sender.send(msg).await.is_err() {
                    break;
                }
            }
            debug!("Peer server reader finished");
        });

        // create a task to handle all outgoing websocket messages
        tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
            heartbeat.tick().await;
            loop {
                let msg = tokio::select! {
                    msg = send_queue_receiver.recv() => match msg {
                        Some(msg) => msg,
                        None => break,
                    },
                    _ = heartbeat.tick() => ServerMessage::Heartbeat,
                    _ = &mut shutdown_receiver => break,
                };
                let text = match serde_json::to_string(&msg) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Dropping unserializable peer server message: {}", e);
                        continue;
                    }
                };
                trace!("Sending peer server message: {}", text);
                if let Err(e) = write.send(Message::Text(text)).await {
                    warn!("Peer server write failed: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
            debug!("Peer server send queue closed");
        });

        Ok(Self {
            send_queue,
            inbound,
            shutdown,
        })
    }

    /// Waits for the server to confirm the registration.
    pub async fn wait_open(&mut self, limit: Duration) -> Result<(), Error> {
        let opened = tokio::time::timeout(limit, async {
            while let Some(msg) = self.inbound.recv().await {
                match msg {
                    ServerMessage::Open => return Ok(()),
                    ServerMessage::IdTaken { payload } => {
                        return Err(Error::PeerNegotiation(format!(
                            "peer id taken: {}",
                            ErrorPayload::describe(&payload)
                        )))
                    }
                    ServerMessage::Error { payload } => {
                        return Err(Error::PeerNegotiation(ErrorPayload::describe(&payload)))
                    }
                    other => trace!("Ignoring {:?} before OPEN", other),
                }
            }
            Err(Error::Network("peer server closed the connection".to_string()))
        })
        .await;
        opened.unwrap_or_else(|_| Err(Error::Network("peer server did not answer".to_string())))
    }
}

fn redact(url: &Url) -> String {
    let mut shown = url.clone();
    shown.set_query(None);
    shown.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_peer_server_url() {
        let id = PeerId::new("abc");
        let url = peer_server_url("https://0.peerjs.com:443/", "peerjs", &id, "t0k").unwrap();
        assert_eq!(url.as_str(), "wss://0.peerjs.com/peerjs?key=peerjs&id=abc&token=t0k");

        let url = peer_server_url("http://localhost:9000/myapp", "k", &id, "t").unwrap();
        assert_eq!(url.as_str(), "ws://localhost:9000/myapp/peerjs?key=k&id=abc&token=t");

        assert!(peer_server_url("ftp://x", "k", &id, "t").is_err());
    }

    #[test]
    fn test_decode_server_control_messages() {
        let open: ServerMessage = serde_json::from_value(json!({"type": "OPEN"})).unwrap();
        assert_eq!(open, ServerMessage::Open);

        let taken: ServerMessage =
            serde_json::from_value(json!({"type": "ID-TAKEN", "payload": {"msg": "ID is taken"}}))
                .unwrap();
        assert_eq!(
            taken,
            ServerMessage::IdTaken {
                payload: Some(ErrorPayload {
                    msg: "ID is taken".into()
                })
            }
        );

        let leave: ServerMessage =
            serde_json::from_value(json!({"type": "LEAVE", "src": "peer-b", "dst": "peer-a"}))
                .unwrap();
        assert_eq!(
            leave,
            ServerMessage::Leave {
                src: Some("peer-b".into())
            }
        );
    }

    #[test]
    fn test_decode_browser_offer() {
        let msg: ServerMessage = serde_json::from_value(json!({
            "type": "OFFER",
            "src": "peer-b",
            "dst": "peer-a",
            "payload": {
                "sdp": {"type": "offer", "sdp": "v=0\r\n"},
                "type": "media",
                "connectionId": "mc_abc",
                "metadata": null,
                "browser": "firefox"
            }
        }))
        .unwrap();
        match msg {
            ServerMessage::Offer { src, payload, .. } => {
                assert_eq!(src.as_deref(), Some("peer-b"));
                assert_eq!(payload.connection_id, "mc_abc");
                assert_eq!(payload.connection_type, "media");
                assert_eq!(payload.sdp.unwrap().sdp, "v=0\r\n");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_encode_candidate_and_heartbeat() {
        let msg = ServerMessage::Candidate {
            src: None,
            dst: Some("peer-b".into()),
            payload: MediaPayload::candidate(
                "mc_abc",
                RTCIceCandidateInit {
                    candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
                    sdp_mid: Some("0".into()),
                    sdp_mline_index: Some(0),
                    username_fragment: None,
                },
            ),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "CANDIDATE");
        assert_eq!(value["dst"], "peer-b");
        assert_eq!(value["payload"]["type"], "media");
        assert_eq!(value["payload"]["connectionId"], "mc_abc");
        assert!(value.get("src").is_none());

        assert_eq!(
            serde_json::to_value(&ServerMessage::Heartbeat).unwrap(),
            json!({"type": "HEARTBEAT"})
        );
    }
}
