use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::call::RoomId;
use crate::relay::{EventName, Inbound, Outbound, Relay, Subscribers, Subscription};
use crate::Error;

#[derive(Default)]
struct HubState {
    next_client: u64,
    clients: HashMap<u64, Subscribers>,
    rooms: HashMap<String, BTreeSet<u64>>,
    emitted: Vec<(u64, Outbound)>,
}

/// In-process relay server.
///
/// Routes events between its clients the way the TalkSphere relay does:
/// rooms are keyed by the sorted participant pair and every event reaches the
/// other members of the room only.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn client(&self) -> LoopbackRelay {
        let subscribers = Subscribers::default();
        let mut state = self.lock();
        state.next_client += 1;
        let id = state.next_client;
        state.clients.insert(id, subscribers.clone());
        LoopbackRelay {
            id,
            hub: self.clone(),
            subscribers,
        }
    }

    /// Every event emitted by any client, in arrival order.
    pub fn emitted(&self) -> Vec<Outbound> {
        self.lock().emitted.iter().map(|(_, e)| e.clone()).collect()
    }

    /// The server forgets a dropped socket's rooms.
    fn leave_all(&self, client: u64) {
        let mut state = self.lock();
        for members in state.rooms.values_mut() {
            members.remove(&client);
        }
    }

    fn route(&self, from: u64, event: Outbound) {
        let mut deliveries = Vec::new();
        {
            let mut state = self.lock();
            state.emitted.push((from, event.clone()));
            match event {
                Outbound::JoinRoom(join) => {
                    let room = RoomId::between(&join.sender, &join.receiver).to_string();
                    state.rooms.entry(room.clone()).or_default().insert(from);
                    if let Some(peer_id) = join.peer_id {
                        deliveries.extend(others(&state, &room, from).map(|s| {
                            (s, Inbound::UserConnected {
                                peer_id: peer_id.clone(),
                            })
                        }));
                    }
                }
                Outbound::SendMessage(message) => {
                    let room = RoomId::between(&message.sender, &message.receiver).to_string();
                    deliveries.extend(others(&state, &room, from).map(|s| {
                        (s, Inbound::ReceiveMessage {
                            message: message.message.clone(),
                            peer_id: message.peer_id.clone(),
                            room_id: message.room_id.clone(),
                        })
                    }));
                }
                Outbound::CallEnded { room_id } => {
                    deliveries.extend(others(&state, &room_id, from).map(|s| {
                        (s, Inbound::CallEnded {
                            room_id: Some(room_id.clone()),
                        })
                    }));
                }
            }
        }
        for (subscribers, inbound) in deliveries {
            subscribers.dispatch(inbound);
        }
    }
}

fn others<'a>(
    state: &'a HubState,
    room: &str,
    from: u64,
) -> impl Iterator<Item = Subscribers> + 'a {
    state
        .rooms
        .get(room)
        .into_iter()
        .flatten()
        .filter(move |id| **id != from)
        .filter_map(move |id| state.clients.get(id).cloned())
}

/// One client connection of a [`LoopbackHub`].
pub struct LoopbackRelay {
    id: u64,
    hub: LoopbackHub,
    subscribers: Subscribers,
}

impl LoopbackRelay {
    /// Simulates the transport dropping. The connection leaves every room.
    pub fn drop_connection(&self, reason: &str) {
        self.hub.leave_all(self.id);
        self.subscribers.dispatch(Inbound::Disconnected {
            reason: reason.to_string(),
        });
    }

    /// Simulates a successful reconnect on a fresh socket.
    pub fn restore_connection(&self) {
        self.subscribers.dispatch(Inbound::Connected);
    }
}

#[async_trait]
impl Relay for LoopbackRelay {
    async fn emit(&self, event: Outbound) -> Result<(), Error> {
        trace!("loopback client {} emits {:?}", self.id, event);
        self.hub.route(self.id, event);
        Ok(())
    }

    fn subscribe(&self, events: &[EventName]) -> Subscription {
        self.subscribers.subscribe(events)
    }
}
