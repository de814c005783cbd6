use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;

use crate::api::Identity;
use crate::call::{
    CallHandoff, CallPhase, CallRole, CallSession, CallSignal, CallSummary, EndReason, RoomId,
    ScreenCommand, ScreenEvent, ScreenLauncher,
};
use crate::config::CallConfig;
use crate::media::{PeerId, RemoteStream};
use crate::relay::{JoinRoom, Outbound, Relay};
use crate::Error;

/// Things the user should be told about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    IncomingCall { from: Identity },
    Calling { to: Identity },
    Accepted { with: Identity },
    Connected { with: Identity, remote: RemoteStream },
    Ended(CallSummary),
    Failure { message: String, blocking: bool },
}

impl From<&Error> for Notice {
    fn from(error: &Error) -> Self {
        Notice::Failure {
            message: error.to_string(),
            blocking: error.is_blocking(),
        }
    }
}

struct ActiveCall {
    session: CallSession,
    screen: Option<UnboundedSender<ScreenCommand>>,
    deadline: Option<Instant>,
}

/// Receivers the owner of a [`CallController`] has to drain.
pub struct ControllerEvents {
    pub notices: UnboundedReceiver<Notice>,
    pub screen_events: UnboundedReceiver<ScreenEvent>,
}

/// Runs the call handshake for the signed-in user.
///
/// The controller is the only consumer of call signals. It holds at most one
/// [`CallSession`]; a second request while one is live is answered with a
/// rejection.
pub struct CallController {
    me: Identity,
    local_peer: PeerId,
    relay: Arc<dyn Relay>,
    launcher: Arc<dyn ScreenLauncher>,
    timeouts: CallConfig,
    friends: HashMap<RoomId, Identity>,
    active: Option<ActiveCall>,
    notices: UnboundedSender<Notice>,
    screen_events: UnboundedSender<ScreenEvent>,
}

impl CallController {
    pub fn new(
        me: Identity,
        local_peer: PeerId,
        relay: Arc<dyn Relay>,
        launcher: Arc<dyn ScreenLauncher>,
        timeouts: CallConfig,
    ) -> (Self, ControllerEvents) {
        let (notices, notice_receiver) = mpsc::unbounded_channel();
        let (screen_events, screen_event_receiver) = mpsc::unbounded_channel();
        let controller = Self {
            me,
            local_peer,
            relay,
            launcher,
            timeouts,
            friends: HashMap::new(),
            active: None,
            notices,
            screen_events,
        };
        let events = ControllerEvents {
            notices: notice_receiver,
            screen_events: screen_event_receiver,
        };
        (controller, events)
    }

    pub fn set_friends(&mut self, friends: impl IntoIterator<Item = Identity>) {
        self.friends = friends
            .into_iter()
            .map(|friend| (RoomId::between(&self.me.email, &friend.email), friend))
            .collect();
    }

    pub fn phase(&self) -> CallPhase {
        self.active
            .as_ref()
            .map(|active| active.session.phase())
            .unwrap_or_default()
    }

    pub fn session(&self) -> Option<&CallSession> {
        self.active.as_ref().map(|active| &active.session)
    }

    /// When [`CallController::on_deadline`] should run next.
    pub fn deadline(&self) -> Option<Instant> {
        self.active.as_ref().and_then(|active| active.deadline)
    }

    pub async fn start_call(&mut self, friend_email: &str) -> Result<RoomId, Error> {
        if self.active.is_some() {
            return Err(Error::Busy);
        }
        let room = RoomId::between(&self.me.email, friend_email);
        let friend = self
            .friends
            .get(&room)
            .cloned()
            .ok_or_else(|| Error::NotAFriend(friend_email.to_string()))?;

        let request = CallSignal::Request {
            room: room.clone(),
            peer: self.local_peer.clone(),
        };
        self.relay
            .emit(Outbound::SendMessage(
                request.into_message(&self.me.email, &friend.email),
            ))
            .await?;
        info!("Calling {} in room {}", friend, room);

        let session = CallSession::outgoing(friend.clone(), room.clone(), self.local_peer.clone());
        self.active = Some(ActiveCall {
            session,
            screen: None,
            deadline: Some(Instant::now() + self.timeouts.ring_timeout()),
        });
        self.notify(Notice::Calling { to: friend });
        Ok(room)
    }

    pub async fn on_signal(&mut self, signal: CallSignal) {
        match signal {
            CallSignal::Request { room, peer } => self.on_request(room, peer).await,
            CallSignal::Accepted { room, peer } => self.on_accepted(room, peer),
            CallSignal::Rejected { room } => {
                if self.is_waiting_in(&room, CallPhase::Requested) {
                    info!("Call in room {} was declined", room);
                    self.finish(EndReason::Rejected).await;
                } else {
                    debug!("Ignoring stale rejection for room {}", room);
                }
            }
        }
    }

    async fn on_request(&mut self, room: RoomId, peer: PeerId) {
        let Some(friend) = self.friends.get(&room).cloned() else {
            warn!("Call request in unknown room {}", room);
            return;
        };
        if let Some(active) = &self.active {
            if active.session.room_id() == Some(&room) && active.session.remote_peer_id() == Some(&peer) {
                debug!("Duplicate call request in room {}", room);
                return;
            }
            info!("Busy, declining call from {}", friend);
            let busy = CallSignal::Rejected { room }.into_message(&self.me.email, &friend.email);
            if let Err(e) = self.relay.emit(Outbound::SendMessage(busy)).await {
                warn!("Could not decline call: {}", e);
            }
            return;
        }
        info!("Incoming call from {}", friend);
        let session = CallSession::incoming(friend.clone(), room, self.local_peer.clone(), peer);
        self.active = Some(ActiveCall {
            session,
            screen: None,
            deadline: Some(Instant::now() + self.timeouts.ring_timeout()),
        });
        self.notify(Notice::IncomingCall { from: friend });
    }

    fn on_accepted(&mut self, room: RoomId, peer: PeerId) {
        if !self.is_waiting_in(&room, CallPhase::Requested) {
            debug!("Ignoring stale acceptance for room {}", room);
            return;
        }
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if let Err(e) = active.session.accepted_by(peer.clone()) {
            warn!("{}", e);
            return;
        }
        active.deadline = None;
        let friend = active.session.friend().clone();
        info!("{} accepted, peer {}", friend, peer);
        let handoff = CallHandoff {
            room,
            peer,
            token: active.session.token().clone(),
            role: CallRole::Caller,
            friend: friend.clone(),
        };
        let (commands, command_receiver) = mpsc::unbounded_channel();
        active.screen = Some(commands);
        self.launcher
            .launch(handoff, self.screen_events.clone(), command_receiver);
        self.notify(Notice::Accepted { with: friend });
    }

    /// Accepts the ringing call and opens the call screen.
    pub async fn accept(&mut self) -> Result<(), Error> {
        let active = self.active.as_mut().ok_or(Error::NoActiveCall)?;
        let phase = active.session.phase();
        if !phase.can_accept() {
            return Err(Error::Validation(format!("cannot accept a call that is {:?}", phase)));
        }
        let (Some(room), Some(peer)) = (
            active.session.room_id().cloned(),
            active.session.remote_peer_id().cloned(),
        ) else {
            return Err(Error::NoActiveCall);
        };
        let friend = active.session.friend().clone();
        let accepted = CallSignal::Accepted {
            room: room.clone(),
            peer: self.local_peer.clone(),
        };
        self.relay
            .emit(Outbound::SendMessage(
                accepted.into_message(&self.me.email, &friend.email),
            ))
            .await?;

        let active = self.active.as_mut().ok_or(Error::NoActiveCall)?;
        active.session.accepted_by(peer.clone())?;
        active.deadline = None;
        let handoff = CallHandoff {
            room,
            peer,
            token: active.session.token().clone(),
            role: CallRole::Callee,
            friend: friend.clone(),
        };
        let (commands, command_receiver) = mpsc::unbounded_channel();
        active.screen = Some(commands);
        self.launcher
            .launch(handoff, self.screen_events.clone(), command_receiver);
        self.notify(Notice::Accepted { with: friend });
        Ok(())
    }

    pub async fn reject(&mut self) -> Result<(), Error> {
        let active = self.active.as_ref().ok_or(Error::NoActiveCall)?;
        let phase = active.session.phase();
        if !phase.can_reject() {
            return Err(Error::Validation(format!("cannot reject a call that is {:?}", phase)));
        }
        self.decline().await;
        Ok(())
    }

    async fn decline(&mut self) {
        if let Some(active) = &self.active {
            if let Some(room) = active.session.room_id() {
                let rejected = CallSignal::Rejected { room: room.clone() }
                    .into_message(&self.me.email, &active.session.friend().email);
                if let Err(e) = self.relay.emit(Outbound::SendMessage(rejected)).await {
                    warn!("Could not decline call: {}", e);
                }
            }
        }
        self.finish(EndReason::Rejected).await;
    }

    /// Ends the current call. Returns `false` when there was nothing to end.
    pub async fn hangup(&mut self) -> bool {
        match self.phase() {
            CallPhase::Ringing => self.decline().await,
            phase if phase.is_live() => self.finish(EndReason::LocalHangup).await,
            _ => return false,
        }
        true
    }

    /// The counterpart ended the call.
    pub async fn on_remote_ended(&mut self, room: Option<RoomId>) {
        let matches = match (&self.active, &room) {
            (Some(active), Some(room)) => active.session.room_id() == Some(room),
            (Some(_), None) => true,
            (None, _) => false,
        };
        if matches {
            self.finish(EndReason::RemoteHangup).await;
        } else {
            debug!("Ignoring call-ended for {:?}", room);
        }
    }

    pub fn on_user_connected(&mut self, peer: PeerId) {
        let Some(active) = &self.active else {
            return;
        };
        if active.session.role() != CallRole::Caller || active.session.remote_peer_id() != Some(&peer) {
            return;
        }
        if let Some(screen) = &active.screen {
            let _ = screen.send(ScreenCommand::PeerJoined(peer));
        }
    }

    pub async fn on_screen_event(&mut self, event: ScreenEvent) {
        let current = self
            .active
            .as_ref()
            .map(|active| active.session.token() == event.token())
            .unwrap_or(false);
        if !current {
            debug!("Ignoring event from a stale call screen");
            if let ScreenEvent::MediaAcquired { media, .. } = event {
                media.stop();
            }
            return;
        }

        match event {
            ScreenEvent::MediaAcquired { media, .. } => {
                let Some(active) = self.active.as_mut() else {
                    return;
                };
                if let Err(e) = active.session.media_acquired(media.clone()) {
                    warn!("{}", e);
                    media.stop();
                    return;
                }
                if active.session.role() == CallRole::Callee {
                    // tells the caller's screen it can dial now
                    let join = JoinRoom {
                        sender: self.me.email.clone(),
                        receiver: active.session.friend().email.clone(),
                        peer_id: Some(self.local_peer.to_string()),
                    };
                    if let Err(e) = self.relay.emit(Outbound::JoinRoom(join)).await {
                        warn!("Could not announce media endpoint: {}", e);
                    }
                }
            }
            ScreenEvent::Connected { remote, .. } => {
                let Some(active) = self.active.as_mut() else {
                    return;
                };
                if let Err(e) = active.session.remote_stream_arrived(remote.clone()) {
                    warn!("{}", e);
                    return;
                }
                let with = active.session.friend().clone();
                self.notify(Notice::Connected { with, remote });
            }
            ScreenEvent::Failed { error, .. } => {
                self.notify(Notice::from(&error));
                self.finish(EndReason::Failed(error.to_string())).await;
            }
            ScreenEvent::Ended { reason, .. } => self.finish(reason).await,
        }
    }

    /// Expires a call that rang for too long.
    pub async fn on_deadline(&mut self, now: Instant) {
        let Some(active) = &self.active else {
            return;
        };
        if !active.deadline.map(|deadline| deadline <= now).unwrap_or(false) {
            return;
        }
        match active.session.phase() {
            CallPhase::Requested => self.finish(EndReason::NoAnswer).await,
            CallPhase::Ringing => self.finish(EndReason::Missed).await,
            _ => {
                if let Some(active) = self.active.as_mut() {
                    active.deadline = None;
                }
            }
        }
    }

    fn is_waiting_in(&self, room: &RoomId, phase: CallPhase) -> bool {
        self.active
            .as_ref()
            .map(|active| active.session.phase() == phase && active.session.room_id() == Some(room))
            .unwrap_or(false)
    }

    /// Tears down the active session. Local tracks are stopped before the
    /// first await; `call-ended` goes out at most once per session.
    async fn finish(&mut self, reason: EndReason) {
        let Some(active) = self.active.take() else {
            return;
        };
        if let Some(screen) = &active.screen {
            let _ = screen.send(ScreenCommand::Close);
        }
        let room = active.session.room_id().cloned();
        let summary = active.session.finish(reason);
        info!("Call with {} ended: {}", summary.friend, summary.reason);

        if let (true, Some(room)) = (summary.reason.notifies_peer(), room) {
            let ended = Outbound::CallEnded {
                room_id: room.to_string(),
            };
            if let Err(e) = self.relay.emit(ended).await {
                warn!("Could not send call-ended: {}", e);
            }
        }
        self.notify(Notice::Ended(summary));
    }

    fn notify(&self, notice: Notice) {
        let _ = self.notices.send(notice);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::media::testing::{stream, ReleaseCounter};
    use crate::media::TrackKind;
    use crate::relay::{EventName, Inbound, LoopbackHub};

    #[derive(Default)]
    struct RecordingLauncher {
        launched: Mutex<Vec<(CallHandoff, UnboundedReceiver<ScreenCommand>)>>,
    }

    impl ScreenLauncher for RecordingLauncher {
        fn launch(
            &self,
            handoff: CallHandoff,
            _events: UnboundedSender<ScreenEvent>,
            commands: UnboundedReceiver<ScreenCommand>,
        ) {
            self.launched.lock().unwrap().push((handoff, commands));
        }
    }

    struct Side {
        controller: CallController,
        events: ControllerEvents,
        launcher: Arc<RecordingLauncher>,
    }

    fn side(hub: &LoopbackHub, me: &str, friend: &str, peer: &str) -> Side {
        let launcher = Arc::new(RecordingLauncher::default());
        let (mut controller, events) = CallController::new(
            Identity::new(me),
            PeerId::new(peer),
            Arc::new(hub.client()),
            launcher.clone(),
            CallConfig::default(),
        );
        controller.set_friends([Identity::new(friend)]);
        Side {
            controller,
            events,
            launcher,
        }
    }

    fn drain(events: &mut ControllerEvents) -> Vec<Notice> {
        let mut notices = Vec::new();
        while let Ok(notice) = events.notices.try_recv() {
            notices.push(notice);
        }
        notices
    }

    fn call_ended_count(hub: &LoopbackHub) -> usize {
        hub.emitted()
            .iter()
            .filter(|e| matches!(e, Outbound::CallEnded { .. }))
            .count()
    }

    #[tokio::test]
    async fn test_request_reaches_friend_and_acceptance_opens_screen() {
        let hub = LoopbackHub::new();
        let mut alice = side(&hub, "alice@x.com", "bob@x.com", "peer-a");
        let mut bob = side(&hub, "bob@x.com", "alice@x.com", "peer-b");

        let room = alice.controller.start_call("bob@x.com").await.unwrap();
        assert_eq!(room.as_str(), "alice@x.com-bob@x.com");
        assert_eq!(alice.controller.phase(), CallPhase::Requested);

        bob.controller
            .on_signal(CallSignal::Request {
                room: room.clone(),
                peer: PeerId::new("peer-a"),
            })
            .await;
        assert_eq!(bob.controller.phase(), CallPhase::Ringing);
        assert_eq!(
            drain(&mut bob.events),
            vec![Notice::IncomingCall {
                from: Identity::new("alice@x.com")
            }]
        );

        bob.controller.accept().await.unwrap();
        assert_eq!(bob.controller.phase(), CallPhase::Accepted);
        let launched = bob.launcher.launched.lock().unwrap();
        assert_eq!(launched[0].0.role, CallRole::Callee);
        assert_eq!(launched[0].0.peer, PeerId::new("peer-a"));
        drop(launched);

        alice
            .controller
            .on_signal(CallSignal::Accepted {
                room: room.clone(),
                peer: PeerId::new("peer-b"),
            })
            .await;
        assert_eq!(alice.controller.phase(), CallPhase::Accepted);
        let launched = alice.launcher.launched.lock().unwrap();
        let handoff = &launched[0].0;
        assert_eq!(handoff.peer, PeerId::new("peer-b"));
        let url = handoff.screen_url(&url::Url::parse("http://localhost:5173/callscreen").unwrap());
        assert!(url.as_str().contains("room=alice%40x.com-bob%40x.com&peer=peer-b"));
    }

    #[tokio::test]
    async fn test_busy_callee_rejects_second_request() {
        let hub = LoopbackHub::new();
        let mut bob = side(&hub, "bob@x.com", "alice@x.com", "peer-b");
        bob.controller.set_friends([Identity::new("alice@x.com"), Identity::new("carol@x.com")]);
        let room = RoomId::between("alice@x.com", "bob@x.com");
        bob.controller
            .on_signal(CallSignal::Request {
                room: room.clone(),
                peer: PeerId::new("peer-a"),
            })
            .await;
        bob.controller
            .on_signal(CallSignal::Request {
                room: RoomId::between("carol@x.com", "bob@x.com"),
                peer: PeerId::new("peer-c"),
            })
            .await;

        assert_eq!(bob.controller.session().unwrap().room_id(), Some(&room));
        let rejected: Vec<_> = hub
            .emitted()
            .into_iter()
            .filter_map(|e| match e {
                Outbound::SendMessage(m) if m.message == "_video_rejected" => Some(m),
                _ => None,
            })
            .collect();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].receiver, "carol@x.com");
    }

    #[tokio::test]
    async fn test_hangup_while_connected_stops_tracks_and_notifies_once() {
        let hub = LoopbackHub::new();
        let mut alice = side(&hub, "alice@x.com", "bob@x.com", "peer-a");
        let peer_relay = hub.client();
        let mut bob_events = peer_relay.subscribe(&[EventName::CallEnded]);
        peer_relay
            .emit(Outbound::JoinRoom(JoinRoom {
                sender: "bob@x.com".into(),
                receiver: "alice@x.com".into(),
                peer_id: None,
            }))
            .await
            .unwrap();

        let room = alice.controller.start_call("bob@x.com").await.unwrap();
        alice
            .controller
            .on_signal(CallSignal::Accepted {
                room: room.clone(),
                peer: PeerId::new("peer-b"),
            })
            .await;
        let token = alice.controller.session().unwrap().token().clone();

        let releases = ReleaseCounter::default();
        let local = stream(&releases);
        alice
            .controller
            .on_screen_event(ScreenEvent::MediaAcquired {
                token: token.clone(),
                media: local.handle(),
            })
            .await;
        alice
            .controller
            .on_screen_event(ScreenEvent::Connected {
                token: token.clone(),
                remote: RemoteStream {
                    id: "remote".into(),
                    kind: TrackKind::Video,
                },
            })
            .await;
        assert_eq!(alice.controller.phase(), CallPhase::Connected);

        assert!(alice.controller.hangup().await);
        assert_eq!(releases.count(), local.tracks().len());
        assert_eq!(alice.controller.phase(), CallPhase::Idle);
        assert_eq!(call_ended_count(&hub), 1);
        assert_eq!(
            bob_events.try_recv(),
            Some(Inbound::CallEnded {
                room_id: Some(room.to_string())
            })
        );

        // the screen was told to close
        let mut launched = alice.launcher.launched.lock().unwrap();
        assert_eq!(launched[0].1.try_recv(), Ok(ScreenCommand::Close));
        drop(launched);

        assert!(!alice.controller.hangup().await);
        alice
            .controller
            .on_screen_event(ScreenEvent::Ended {
                token,
                reason: EndReason::LocalHangup,
            })
            .await;
        assert_eq!(call_ended_count(&hub), 1);
    }

    #[tokio::test]
    async fn test_remote_hangup_does_not_echo_call_ended() {
        let hub = LoopbackHub::new();
        let mut bob = side(&hub, "bob@x.com", "alice@x.com", "peer-b");
        let room = RoomId::between("alice@x.com", "bob@x.com");
        bob.controller
            .on_signal(CallSignal::Request {
                room: room.clone(),
                peer: PeerId::new("peer-a"),
            })
            .await;
        bob.controller.accept().await.unwrap();

        bob.controller.on_remote_ended(Some(room)).await;
        assert_eq!(bob.controller.phase(), CallPhase::Idle);
        assert_eq!(call_ended_count(&hub), 0);
        let notices = drain(&mut bob.events);
        assert!(matches!(
            notices.last(),
            Some(Notice::Ended(CallSummary {
                reason: EndReason::RemoteHangup,
                ..
            }))
        ));
    }

    #[tokio::test]
    async fn test_permission_denied_reaches_user_and_ends_call() {
        let hub = LoopbackHub::new();
        let mut bob = side(&hub, "bob@x.com", "alice@x.com", "peer-b");
        bob.controller
            .on_signal(CallSignal::Request {
                room: RoomId::between("alice@x.com", "bob@x.com"),
                peer: PeerId::new("peer-a"),
            })
            .await;
        bob.controller.accept().await.unwrap();
        let token = bob.controller.session().unwrap().token().clone();
        drain(&mut bob.events);

        bob.controller
            .on_screen_event(ScreenEvent::Failed {
                token,
                error: Error::PermissionDenied("/dev/video0: Permission denied".into()),
            })
            .await;

        let notices = drain(&mut bob.events);
        match &notices[0] {
            Notice::Failure { message, blocking } => {
                assert!(message.contains("Permission denied"));
                assert!(*blocking);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(bob.controller.phase(), CallPhase::Idle);
        assert_eq!(call_ended_count(&hub), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_call_times_out() {
        let hub = LoopbackHub::new();
        let mut alice = side(&hub, "alice@x.com", "bob@x.com", "peer-a");
        alice.controller.start_call("bob@x.com").await.unwrap();

        let deadline = alice.controller.deadline().unwrap();
        alice.controller.on_deadline(Instant::now()).await;
        assert_eq!(alice.controller.phase(), CallPhase::Requested);

        tokio::time::sleep_until(deadline).await;
        alice.controller.on_deadline(Instant::now()).await;
        assert_eq!(alice.controller.phase(), CallPhase::Idle);
        assert_eq!(call_ended_count(&hub), 1);
    }

    #[tokio::test]
    async fn test_start_call_checks_friends_and_busy() {
        let hub = LoopbackHub::new();
        let mut alice = side(&hub, "alice@x.com", "bob@x.com", "peer-a");

        let err = alice.controller.start_call("mallory@x.com").await.unwrap_err();
        assert!(matches!(err, Error::NotAFriend(_)));
        assert!(hub.emitted().is_empty());

        alice.controller.start_call("bob@x.com").await.unwrap();
        assert!(matches!(
            alice.controller.start_call("bob@x.com").await,
            Err(Error::Busy)
        ));
    }

    #[tokio::test]
    async fn test_stale_screen_media_is_released() {
        let hub = LoopbackHub::new();
        let mut alice = side(&hub, "alice@x.com", "bob@x.com", "peer-a");
        let releases = ReleaseCounter::default();
        let local = stream(&releases);

        alice
            .controller
            .on_screen_event(ScreenEvent::MediaAcquired {
                token: crate::call::SessionToken::new(),
                media: local.handle(),
            })
            .await;
        assert_eq!(releases.count(), 2);
    }
}
