//! Named-event relay shared by chat and call signaling.

mod codec;
mod loopback;
mod socketio_relay;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use strum_macros::{EnumString, IntoStaticStr};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::Error;

pub use codec::{CodecError, Handshake, Packet};
pub use loopback::{LoopbackHub, LoopbackRelay};
pub use socketio_relay::{engine_url, Backoff, RelayOptions, SocketIoRelay};

#[async_trait]
pub trait Relay: Send + Sync + 'static {
    /// Queues an event for the server. Nothing is acknowledged; an error only
    /// means the transport has given up for good.
    async fn emit(&self, event: Outbound) -> Result<(), Error>;
    /// Starts receiving the given events until the subscription is dropped.
    fn subscribe(&self, events: &[EventName]) -> Subscription;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, IntoStaticStr)]
pub enum EventName {
    #[strum(serialize = "join-room")]
    JoinRoom,
    #[strum(serialize = "sendMessage")]
    SendMessage,
    #[strum(serialize = "receiveMessage")]
    ReceiveMessage,
    #[strum(serialize = "call-ended")]
    CallEnded,
    #[strum(serialize = "user-connected")]
    UserConnected,
    #[strum(serialize = "connect")]
    Connect,
    #[strum(serialize = "disconnect")]
    Disconnect,
    #[strum(serialize = "connect_error")]
    ConnectError,
}

impl EventName {
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoom {
    pub sender: String,
    pub receiver: String,
    /// Announced to the other room members as `user-connected`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    pub sender: String,
    pub receiver: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    JoinRoom(JoinRoom),
    SendMessage(SendMessage),
    CallEnded { room_id: String },
}

impl Outbound {
    pub fn name(&self) -> EventName {
        match self {
            Outbound::JoinRoom(_) => EventName::JoinRoom,
            Outbound::SendMessage(_) => EventName::SendMessage,
            Outbound::CallEnded { .. } => EventName::CallEnded,
        }
    }

    pub fn args(&self) -> serde_json::Result<Vec<Value>> {
        Ok(match self {
            Outbound::JoinRoom(payload) => vec![serde_json::to_value(payload)?],
            Outbound::SendMessage(payload) => vec![serde_json::to_value(payload)?],
            Outbound::CallEnded { room_id } => {
                vec![serde_json::json!({ "roomId": room_id })]
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    ReceiveMessage {
        message: String,
        peer_id: Option<String>,
        room_id: Option<String>,
    },
    CallEnded {
        room_id: Option<String>,
    },
    UserConnected {
        peer_id: String,
    },
    Connected,
    Disconnected {
        reason: String,
    },
    ConnectError {
        message: String,
        /// No further reconnection attempts will be made.
        exhausted: bool,
    },
}

impl Inbound {
    pub fn name(&self) -> EventName {
        match self {
            Inbound::ReceiveMessage { .. } => EventName::ReceiveMessage,
            Inbound::CallEnded { .. } => EventName::CallEnded,
            Inbound::UserConnected { .. } => EventName::UserConnected,
            Inbound::Connected => EventName::Connect,
            Inbound::Disconnected { .. } => EventName::Disconnect,
            Inbound::ConnectError { .. } => EventName::ConnectError,
        }
    }

    /// Decodes a server event. Unknown events and malformed arguments yield
    /// `None`.
    pub fn from_event(name: &str, args: &[Value]) -> Option<Inbound> {
        let event: EventName = name.parse().ok()?;
        match event {
            EventName::ReceiveMessage => Some(Inbound::ReceiveMessage {
                message: args.first()?.as_str()?.to_string(),
                peer_id: optional_string(args.get(1)),
                room_id: optional_string(args.get(2)),
            }),
            EventName::CallEnded => {
                let room_id = match args.first() {
                    Some(Value::Object(map)) => optional_string(map.get("roomId")),
                    other => optional_string(other),
                };
                Some(Inbound::CallEnded { room_id })
            }
            EventName::UserConnected => Some(Inbound::UserConnected {
                peer_id: args.first()?.as_str()?.to_string(),
            }),
            _ => None,
        }
    }
}

fn optional_string(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

struct Entry {
    id: u64,
    events: Vec<EventName>,
    sender: UnboundedSender<Inbound>,
}

#[derive(Default)]
struct SubscriberTable {
    next_id: u64,
    entries: Vec<Entry>,
}

/// Registry of live subscriptions, shared by the relay implementations.
#[derive(Clone, Default)]
pub struct Subscribers {
    table: Arc<Mutex<SubscriberTable>>,
}

impl Subscribers {
    fn lock(&self) -> MutexGuard<'_, SubscriberTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self, events: &[EventName]) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut table = self.lock();
        table.next_id += 1;
        let id = table.next_id;
        table.entries.push(Entry {
            id,
            events: events.to_vec(),
            sender,
        });
        trace!("subscription {} registered for {:?}", id, events);
        Subscription {
            id,
            receiver,
            table: Arc::downgrade(&self.table),
        }
    }

    /// Delivers `event` to every interested subscription, returns how many
    /// received it.
    pub fn dispatch(&self, event: Inbound) -> usize {
        let name = event.name();
        let mut table = self.lock();
        table.entries.retain(|entry| !entry.sender.is_closed());
        let mut delivered = 0;
        for entry in table.entries.iter().filter(|e| e.events.contains(&name)) {
            if entry.sender.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        if delivered == 0 {
            trace!("no subscriber for {}", name.as_str());
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Receiving end of a subscription; dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    receiver: UnboundedReceiver<Inbound>,
    table: Weak<Mutex<SubscriberTable>>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Inbound> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            let mut table = table.lock().unwrap_or_else(PoisonError::into_inner);
            table.entries.retain(|entry| entry.id != self.id);
            trace!("subscription {} released", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_names_match_wire_names() {
        assert_eq!(EventName::JoinRoom.as_str(), "join-room");
        assert_eq!(EventName::SendMessage.as_str(), "sendMessage");
        assert_eq!(EventName::ConnectError.as_str(), "connect_error");
        assert_eq!("call-ended".parse::<EventName>().unwrap(), EventName::CallEnded);
        assert!("joinRoom".parse::<EventName>().is_err());
    }

    #[test]
    fn test_send_message_omits_missing_call_fields() {
        let event = Outbound::SendMessage(SendMessage {
            sender: "alice@x.com".into(),
            receiver: "bob@x.com".into(),
            message: "hi".into(),
            peer_id: None,
            room_id: None,
        });
        assert_eq!(
            event.args().unwrap(),
            vec![json!({"sender": "alice@x.com", "receiver": "bob@x.com", "message": "hi"})]
        );
    }

    #[test]
    fn test_receive_message_positional_args() {
        let inbound = Inbound::from_event(
            "receiveMessage",
            &[json!("_video"), json!("peer-1"), json!("a-b")],
        );
        assert_eq!(
            inbound,
            Some(Inbound::ReceiveMessage {
                message: "_video".into(),
                peer_id: Some("peer-1".into()),
                room_id: Some("a-b".into()),
            })
        );

        // plain chat carries no call fields
        let inbound = Inbound::from_event("receiveMessage", &[json!("hello"), Value::Null]);
        assert_eq!(
            inbound,
            Some(Inbound::ReceiveMessage {
                message: "hello".into(),
                peer_id: None,
                room_id: None,
            })
        );
    }

    #[test]
    fn test_call_ended_accepts_object_or_nothing() {
        assert_eq!(
            Inbound::from_event("call-ended", &[json!({"roomId": "a-b"})]),
            Some(Inbound::CallEnded {
                room_id: Some("a-b".into())
            })
        );
        assert_eq!(
            Inbound::from_event("call-ended", &[]),
            Some(Inbound::CallEnded { room_id: None })
        );
        assert_eq!(Inbound::from_event("user-connected", &[]), None);
        assert_eq!(Inbound::from_event("unknown", &[json!(1)]), None);
    }

    #[test]
    fn test_dispatch_only_reaches_interested_subscriptions() {
        let subscribers = Subscribers::default();
        let mut calls = subscribers.subscribe(&[EventName::CallEnded]);
        let mut chat = subscribers.subscribe(&[EventName::ReceiveMessage]);

        let delivered = subscribers.dispatch(Inbound::CallEnded { room_id: None });
        assert_eq!(delivered, 1);
        assert_eq!(calls.try_recv(), Some(Inbound::CallEnded { room_id: None }));
        assert_eq!(chat.try_recv(), None);
    }

    #[test]
    fn test_dropping_subscription_unsubscribes() {
        let subscribers = Subscribers::default();
        let first = subscribers.subscribe(&[EventName::UserConnected]);
        let mut second = subscribers.subscribe(&[EventName::UserConnected]);
        assert_eq!(subscribers.len(), 2);

        drop(first);
        assert_eq!(subscribers.len(), 1);

        // a remount subscribes again without duplicating delivery
        let mut remounted = subscribers.subscribe(&[EventName::UserConnected]);
        let event = Inbound::UserConnected {
            peer_id: "p".into(),
        };
        assert_eq!(subscribers.dispatch(event.clone()), 2);
        assert_eq!(remounted.try_recv(), Some(event.clone()));
        assert_eq!(remounted.try_recv(), None);
        assert_eq!(second.try_recv(), Some(event));
    }
}
