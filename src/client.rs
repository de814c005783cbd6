//! Ties the relay, the call controller and the chat log to user commands.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep_until, Instant};
use url::Url;

use crate::api::{FriendEdge, HttpProfileApi, Identity, ProfileApi};
use crate::call::{CallController, CallSignal, ControllerEvents, Notice, RoomId, ScreenLauncher, TaskLauncher};
use crate::chat::{validate_outgoing, ChatBook, ChatLog, ChatMessage};
use crate::config::{CallConfig, Config};
use crate::console::Command;
use crate::media::{MediaConstraints, MediaDevices, MediaEndpoint, PeerId, WebRtcEndpoint};
use crate::relay::{EventName, Inbound, JoinRoom, Outbound, Relay, RelayOptions, SendMessage, SocketIoRelay, Subscription};
use crate::Error;

/// Where the client shows things to the user.
pub trait View: Send {
    fn notice(&mut self, notice: &Notice);
    fn message(&mut self, friend: &Identity, message: &ChatMessage);
    fn friends(&mut self, friends: &[FriendEdge], requests: &[FriendEdge]);
    fn history(&mut self, friend: &Identity, log: Option<&ChatLog>);
    fn status(&mut self, text: &str);
}

pub struct ClientSetup {
    pub me: Identity,
    pub friends: Vec<FriendEdge>,
    pub requests: Vec<FriendEdge>,
    pub relay: Arc<dyn Relay>,
    pub endpoint: Arc<dyn MediaEndpoint>,
    pub launcher: Arc<dyn ScreenLauncher>,
    pub call: CallConfig,
    pub history_limit: usize,
}

pub struct Client {
    me: Identity,
    friends: Vec<FriendEdge>,
    requests: Vec<FriendEdge>,
    relay: Arc<dyn Relay>,
    endpoint: Arc<dyn MediaEndpoint>,
    controller: CallController,
    events: ControllerEvents,
    inbound: Subscription,
    chat: ChatBook,
    open_chat: Option<Identity>,
    /// The relay dropped since rooms were last joined.
    rooms_lost: bool,
}

/// Signs in with the configured session, joins the relay and registers a
/// media endpoint.
pub async fn connect(config: &Config, devices: Arc<dyn MediaDevices>) -> crate::Result<Client> {
    let api = HttpProfileApi::new(&config.api_url, config.session_cookie.clone())?;
    let me = api.current_user().await?;
    info!("Signed in as {}", me);
    let friends = api.friends().await?;
    let requests = match api.friend_requests().await {
        Ok(requests) => requests,
        Err(e) => {
            warn!("Could not fetch friend requests: {}", e);
            Vec::new()
        }
    };

    let relay = SocketIoRelay::connect(RelayOptions {
        url: config.relay_url.clone(),
        cookie: config.session_cookie.clone(),
        reconnection_attempts: config.reconnection_attempts,
    })?;
    let endpoint: Arc<dyn MediaEndpoint> =
        Arc::new(WebRtcEndpoint::open(&config.peer, config.call.answer_timeout()).await?);
    let base_url = Url::parse(&config.call_screen_url)
        .map_err(|e| Error::Validation(format!("call screen url: {}", e)))?;
    let launcher = Arc::new(TaskLauncher::new(
        endpoint.clone(),
        devices,
        MediaConstraints::from(&config.media),
        config.call.clone(),
        base_url,
    ));

    let client = Client::start(ClientSetup {
        me,
        friends,
        requests,
        relay: Arc::new(relay),
        endpoint,
        launcher,
        call: config.call.clone(),
        history_limit: config.history_limit,
    })
    .await?;
    Ok(client)
}

impl Client {
    /// Subscribes to the relay and joins the room of every friend so call
    /// requests reach us without opening a chat first.
    pub async fn start(setup: ClientSetup) -> Result<Self, Error> {
        let inbound = setup.relay.subscribe(&[
            EventName::ReceiveMessage,
            EventName::CallEnded,
            EventName::UserConnected,
            EventName::Connect,
            EventName::Disconnect,
            EventName::ConnectError,
        ]);
        let (mut controller, events) = CallController::new(
            setup.me.clone(),
            setup.endpoint.peer_id(),
            setup.relay.clone(),
            setup.launcher,
            setup.call,
        );
        controller.set_friends(setup.friends.iter().map(|edge| edge.friend.clone()));

        let client = Self {
            me: setup.me,
            friends: setup.friends,
            requests: setup.requests,
            relay: setup.relay,
            endpoint: setup.endpoint,
            controller,
            events,
            inbound,
            chat: ChatBook::new(setup.history_limit),
            open_chat: None,
            rooms_lost: false,
        };
        client.join_rooms().await?;
        Ok(client)
    }

    pub fn me(&self) -> &Identity {
        &self.me
    }

    pub fn controller(&self) -> &CallController {
        &self.controller
    }

    pub fn peer_id(&self) -> PeerId {
        self.endpoint.peer_id()
    }

    pub async fn run(mut self, mut commands: UnboundedReceiver<Command>, mut view: impl View) {
        while self.step(&mut commands, &mut view).await {}
        self.shutdown().await;
    }

    /// Handles the next event from any source. Returns `false` once the user
    /// quits or the relay is gone.
    pub async fn step(&mut self, commands: &mut UnboundedReceiver<Command>, view: &mut dyn View) -> bool {
        let deadline = self.controller.deadline();
        let wake = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
        tokio::select! {
            inbound = self.inbound.recv() => match inbound {
                Some(event) => self.on_relay(event, view).await,
                None => return false,
            },
            command = commands.recv() => match command {
                Some(Command::Quit) | None => return false,
                Some(command) => self.on_command(command, view).await,
            },
            Some(event) = self.events.screen_events.recv() => self.controller.on_screen_event(event).await,
            Some(notice) = self.events.notices.recv() => view.notice(&notice),
            _ = sleep_until(wake), if deadline.is_some() => self.controller.on_deadline(Instant::now()).await,
        }
        true
    }

    pub async fn shutdown(&mut self) {
        self.controller.hangup().await;
        self.endpoint.destroy().await;
    }

    async fn on_relay(&mut self, event: Inbound, view: &mut dyn View) {
        match event {
            Inbound::ReceiveMessage {
                message,
                peer_id,
                room_id,
            } => match CallSignal::parse(&message, peer_id.as_deref(), room_id.as_deref()) {
                Ok(Some(signal)) => self.controller.on_signal(signal).await,
                Ok(None) => self.on_chat(message, room_id, view),
                Err(e) => warn!("Dropping malformed call signal: {}", e),
            },
            Inbound::CallEnded { room_id } => {
                self.controller
                    .on_remote_ended(room_id.map(RoomId::from_wire))
                    .await
            }
            Inbound::UserConnected { peer_id } => self.controller.on_user_connected(PeerId::new(peer_id)),
            Inbound::Connected => {
                // a new socket belongs to no rooms
                if self.rooms_lost {
                    match self.join_rooms().await {
                        Ok(()) => self.rooms_lost = false,
                        Err(e) => view.notice(&Notice::from(&e)),
                    }
                }
                view.status("connected to relay");
            }
            Inbound::Disconnected { reason } => {
                self.rooms_lost = true;
                view.status(&format!("relay disconnected: {}", reason));
            }
            Inbound::ConnectError { message, exhausted } => {
                if exhausted {
                    view.notice(&Notice::from(&Error::Network(message)));
                } else {
                    debug!("relay connect error: {}", message);
                }
            }
        }
    }

    /// Chat text names its room when the sender provided one, otherwise it
    /// belongs to the open chat.
    fn on_chat(&mut self, message: String, room_id: Option<String>, view: &mut dyn View) {
        let friend = match room_id {
            Some(room) => self
                .friends
                .iter()
                .map(|edge| &edge.friend)
                .find(|friend| RoomId::between(&self.me.email, &friend.email).as_str() == room)
                .cloned(),
            None => self.open_chat.clone(),
        };
        let Some(friend) = friend else {
            debug!("Dropping chat message with no known sender");
            return;
        };
        let message = ChatMessage::new(friend.email.clone(), message);
        view.message(&friend, &message);
        self.chat.push(&friend.email, message);
    }

    async fn on_command(&mut self, command: Command, view: &mut dyn View) {
        if let Err(e) = self.execute(command, view).await {
            view.notice(&Notice::from(&e));
        }
    }

    async fn execute(&mut self, command: Command, view: &mut dyn View) -> Result<(), Error> {
        match command {
            Command::Friends => view.friends(&self.friends, &self.requests),
            Command::Open(email) => {
                let friend = self.friend(&email)?;
                self.join(&friend, None).await?;
                view.history(&friend, self.chat.log(&friend.email));
                self.open_chat = Some(friend);
            }
            Command::Say(text) => {
                let friend = self.open_chat.clone().ok_or_else(|| {
                    Error::Validation("open a chat first with /open <email>".to_string())
                })?;
                let text = validate_outgoing(&text)?;
                let room = RoomId::between(&self.me.email, &friend.email);
                self.relay
                    .emit(Outbound::SendMessage(SendMessage {
                        sender: self.me.email.clone(),
                        receiver: friend.email.clone(),
                        message: text.clone(),
                        peer_id: None,
                        room_id: Some(room.to_string()),
                    }))
                    .await?;
                self.chat
                    .push(&friend.email, ChatMessage::new(self.me.email.clone(), text));
            }
            Command::History => {
                let friend = self
                    .open_chat
                    .clone()
                    .ok_or_else(|| Error::Validation("no chat is open".to_string()))?;
                view.history(&friend, self.chat.log(&friend.email));
            }
            Command::Call(email) => {
                let email = match email.or_else(|| self.open_chat.as_ref().map(|f| f.email.clone())) {
                    Some(email) => email,
                    None => return Err(Error::Validation("call whom? /call <email>".to_string())),
                };
                self.controller.start_call(&email).await?;
            }
            Command::Accept => self.controller.accept().await?,
            Command::Reject => self.controller.reject().await?,
            Command::Hangup => {
                if !self.controller.hangup().await {
                    return Err(Error::NoActiveCall);
                }
            }
            Command::Help => view.status(crate::console::HELP),
            Command::Quit => {}
        }
        Ok(())
    }

    fn friend(&self, email: &str) -> Result<Identity, Error> {
        self.friends
            .iter()
            .map(|edge| &edge.friend)
            .find(|friend| friend.email == email)
            .cloned()
            .ok_or_else(|| Error::NotAFriend(email.to_string()))
    }

    /// Joins the room of every friend, the open chat included.
    async fn join_rooms(&self) -> Result<(), Error> {
        for edge in &self.friends {
            self.join(&edge.friend, None).await?;
        }
        if let Some(friend) = &self.open_chat {
            if !self.friends.iter().any(|edge| edge.friend == *friend) {
                self.join(friend, None).await?;
            }
        }
        Ok(())
    }

    async fn join(&self, friend: &Identity, peer_id: Option<String>) -> Result<(), Error> {
        self.relay
            .emit(Outbound::JoinRoom(JoinRoom {
                sender: self.me.email.clone(),
                receiver: friend.email.clone(),
                peer_id,
            }))
            .await
    }
}
