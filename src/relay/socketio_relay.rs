use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::relay::codec::{self, Handshake, Packet};
use crate::relay::{EventName, Inbound, Outbound, Relay, Subscribers, Subscription};
use crate::Error;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub url: String,
    pub cookie: Option<String>,
    /// Consecutive failed reconnection attempts before giving up.
    pub reconnection_attempts: u32,
}

/// Socket.IO client for the message relay.
///
/// One instance holds one logical connection for the whole process. Outgoing
/// events go through a single ordered queue which survives reconnects.
pub struct SocketIoRelay {
    send_queue: UnboundedSender<Outbound>,
    subscribers: Subscribers,
}

impl SocketIoRelay {
    pub fn connect(options: RelayOptions) -> Result<Self, Error> {
        let url = engine_url(&options.url)?;
        let (send_queue, send_queue_receiver) = mpsc::unbounded_channel::<Outbound>();
        let subscribers = Subscribers::default();

        info!("Connecting to relay {}", options.url);
        let transport = Transport {
            url,
            cookie: options.cookie,
            attempts: options.reconnection_attempts,
            subscribers: subscribers.clone(),
        };
        tokio::spawn(transport.run(send_queue_receiver));

        Ok(Self {
            send_queue,
            subscribers,
        })
    }
}

#[async_trait]
impl Relay for SocketIoRelay {
    async fn emit(&self, event: Outbound) -> Result<(), Error> {
        trace!("Queueing relay event {:?}", event);
        self.send_queue
            .send(event)
            .map_err(|_| Error::Network("relay connection closed".to_string()))
    }

    fn subscribe(&self, events: &[EventName]) -> Subscription {
        self.subscribers.subscribe(events)
    }
}

/// Maps the relay base address to its Engine.IO WebSocket endpoint.
pub fn engine_url(base: &str) -> Result<Url, Error> {
    let mut url = Url::parse(base).map_err(|e| Error::Validation(format!("relay url: {}", e)))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(Error::Validation(format!(
                "unsupported relay scheme {}",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| Error::Validation("relay url cannot carry a scheme".to_string()))?;
    url.set_path("/socket.io/");
    url.set_query(Some("EIO=4&transport=websocket"));
    Ok(url)
}

/// Randomized exponential backoff with the Socket.IO client defaults.
#[derive(Debug, Clone)]
pub struct Backoff {
    attempt: u32,
    min: Duration,
    max: Duration,
    jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            attempt: 0,
            min: Duration::from_millis(1000),
            max: Duration::from_millis(5000),
            jitter: 0.5,
        }
    }
}

impl Backoff {
    pub fn next_delay(&mut self) -> Duration {
        let base = self.min.as_millis() as f64 * 2f64.powi(self.attempt.min(16) as i32);
        self.attempt += 1;
        let mut rng = rand::thread_rng();
        let deviation = rng.gen::<f64>() * self.jitter * base;
        let ms = if rng.gen::<bool>() {
            base - deviation
        } else {
            base + deviation
        };
        Duration::from_millis(ms as u64).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

enum SessionEnd {
    /// The relay handle was dropped.
    QueueClosed,
    Lost(String),
}

struct Transport {
    url: Url,
    cookie: Option<String>,
    attempts: u32,
    subscribers: Subscribers,
}

impl Transport {
    async fn run(self, mut queue: UnboundedReceiver<Outbound>) {
        let mut failures = 0u32;
        let mut backoff = Backoff::default();
        // a frame that could not be written before the connection dropped
        let mut unsent: Option<String> = None;

        loop {
            match timeout(CONNECT_TIMEOUT, self.open_session()).await {
                Ok(Ok((ws, handshake))) => {
                    failures = 0;
                    backoff.reset();
                    info!("Relay connected, session {}", handshake.sid);
                    self.subscribers.dispatch(Inbound::Connected);
                    match self.drive(ws, &handshake, &mut queue, &mut unsent).await {
                        SessionEnd::QueueClosed => {
                            debug!("Relay handle dropped, closing transport");
                            return;
                        }
                        SessionEnd::Lost(reason) => {
                            warn!("Relay disconnected: {}", reason);
                            self.subscribers.dispatch(Inbound::Disconnected { reason });
                        }
                    }
                }
                result => {
                    let message = match result {
                        Ok(Err(err)) => err.to_string(),
                        _ => "connection timed out".to_string(),
                    };
                    failures += 1;
                    let exhausted = failures > self.attempts;
                    warn!(
                        "Relay connection failed ({}/{}): {}",
                        failures, self.attempts, message
                    );
                    self.subscribers.dispatch(Inbound::ConnectError { message, exhausted });
                    if exhausted {
                        error!("Giving up on relay after {} attempts", failures);
                        return;
                    }
                }
            }

            let delay = backoff.next_delay();
            debug!("Reconnecting to relay in {:?}", delay);
            sleep(delay).await;
        }
    }

    async fn open_session(&self) -> Result<(WsStream, Handshake), Error> {
        let mut request = self.url.as_str().into_client_request()?;
        if let Some(cookie) = &self.cookie {
            let value = HeaderValue::from_str(cookie)
                .map_err(|e| Error::Validation(format!("session cookie: {}", e)))?;
            request.headers_mut().insert(COOKIE, value);
        }

        debug!("Establishing websocket connection to {}", self.url);
        let (mut ws, _) = connect_async(request).await?;

        let handshake = match next_packet(&mut ws).await? {
            Packet::Open(handshake) => handshake,
            other => {
                return Err(Error::Network(format!(
                    "expected engine handshake, got {:?}",
                    other
                )))
            }
        };
        trace!("Engine handshake {:?}", handshake);

        ws.send(Message::Text(codec::encode(&Packet::Connect(None))))
            .await?;
        loop {
            match next_packet(&mut ws).await? {
                Packet::Connect(_) => break,
                Packet::ConnectError(message) => return Err(Error::Network(message)),
                Packet::Ping(data) => {
                    ws.send(Message::Text(codec::encode(&Packet::Pong(data))))
                        .await?;
                }
                other => trace!("Ignoring {:?} before namespace connect", other),
            }
        }
        Ok((ws, handshake))
    }

    async fn drive(
        &self,
        ws: WsStream,
        handshake: &Handshake,
        queue: &mut UnboundedReceiver<Outbound>,
        unsent: &mut Option<String>,
    ) -> SessionEnd {
        let (mut write, mut read) = ws.split();
        let liveness =
            Duration::from_millis(handshake.ping_interval + handshake.ping_timeout);
        let heartbeat = sleep(liveness);
        tokio::pin!(heartbeat);

        if let Some(frame) = unsent.take() {
            trace!("Flushing frame from previous connection");
            if let Err(err) = write.send(Message::Text(frame.clone())).await {
                *unsent = Some(frame);
                return SessionEnd::Lost(err.to_string());
            }
        }

        loop {
            tokio::select! {
                msg = read.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(frame))) => {
                            return SessionEnd::Lost(format!("closed by server: {:?}", frame));
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(err)) => return SessionEnd::Lost(err.to_string()),
                        None => return SessionEnd::Lost("transport closed".to_string()),
                    };
                    trace!("Received websocket message: {}", text);
                    let packet = match codec::decode(&text) {
                        Ok(packet) => packet,
                        Err(err) => {
                            warn!("Dropping undecodable relay frame: {}", err);
                            continue;
                        }
                    };
                    match packet {
                        Packet::Ping(data) => {
                            heartbeat.as_mut().reset(Instant::now() + liveness);
                            let pong = codec::encode(&Packet::Pong(data));
                            if let Err(err) = write.send(Message::Text(pong)).await {
                                return SessionEnd::Lost(err.to_string());
                            }
                        }
                        Packet::Event { name, args } => {
                            match Inbound::from_event(&name, &args) {
                                Some(event) => {
                                    debug!("Relay event {:?}", event);
                                    self.subscribers.dispatch(event);
                                }
                                None => debug!("Ignoring relay event {} {:?}", name, args),
                            }
                        }
                        Packet::Disconnect => {
                            return SessionEnd::Lost("io server disconnect".to_string());
                        }
                        Packet::Close => return SessionEnd::Lost("engine closed".to_string()),
                        other => trace!("Ignoring {:?}", other),
                    }
                }
                outbound = queue.recv() => {
                    let Some(event) = outbound else {
                        let _ = write.send(Message::Text(codec::encode(&Packet::Disconnect))).await;
                        let _ = write.close().await;
                        return SessionEnd::QueueClosed;
                    };
                    let args = match event.args() {
                        Ok(args) => args,
                        Err(err) => {
                            error!("Cannot serialize {:?}: {}", event, err);
                            continue;
                        }
                    };
                    let frame = codec::encode(&Packet::Event {
                        name: event.name().as_str().to_string(),
                        args,
                    });
                    trace!("Sending websocket message: {}", frame);
                    if let Err(err) = write.send(Message::Text(frame.clone())).await {
                        *unsent = Some(frame);
                        return SessionEnd::Lost(err.to_string());
                    }
                }
                _ = &mut heartbeat => {
                    return SessionEnd::Lost("ping timeout".to_string());
                }
            }
        }
    }
}

async fn next_packet(ws: &mut WsStream) -> Result<Packet, Error> {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                return codec::decode(&text).map_err(|e| Error::Network(e.to_string()))
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(Error::Network("connection closed".to_string()))
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => return Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_url_from_http_base() {
        let url = engine_url("http://localhost:4000").unwrap();
        assert_eq!(
            url.as_str(),
            "ws://localhost:4000/socket.io/?EIO=4&transport=websocket"
        );

        let url = engine_url("https://relay.talksphere.app/").unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/socket.io/");
    }

    #[test]
    fn test_engine_url_rejects_other_schemes() {
        assert!(matches!(
            engine_url("ftp://example.com"),
            Err(Error::Validation(_))
        ));
        assert!(matches!(engine_url("not a url"), Err(Error::Validation(_))));
    }

    #[test]
    fn test_backoff_grows_within_bounds() {
        let mut backoff = Backoff::default();
        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(500) && first <= Duration::from_millis(1500));

        for _ in 0..10 {
            assert!(backoff.next_delay() <= Duration::from_millis(5000));
        }

        backoff.reset();
        assert!(backoff.next_delay() <= Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_gives_up_after_bounded_attempts() {
        tokio::time::pause();
        // nothing listens on this port, every attempt fails fast
        let relay = SocketIoRelay::connect(RelayOptions {
            url: "http://127.0.0.1:9".to_string(),
            cookie: None,
            reconnection_attempts: 2,
        })
        .unwrap();
        let mut errors = relay.subscribe(&[EventName::ConnectError]);

        let mut seen = Vec::new();
        while let Some(Inbound::ConnectError { exhausted, .. }) = errors.recv().await {
            seen.push(exhausted);
            if exhausted {
                break;
            }
        }
        assert_eq!(seen, vec![false, false, true]);

        // the transport is gone, emit reports it
        tokio::task::yield_now().await;
        let result = relay
            .emit(Outbound::CallEnded {
                room_id: "a-b".into(),
            })
            .await;
        assert!(matches!(result, Err(Error::Network(_))));
    }
}
