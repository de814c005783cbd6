//! The call screen: owns local media and the media call of one session.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{sleep, sleep_until, Instant};
use url::Url;

use crate::call::{CallHandoff, CallRole, EndReason, SessionToken};
use crate::config::CallConfig;
use crate::media::{
    acquire_local_media, LocalStream, MediaCall, MediaCallEvent, MediaConstraints, MediaDevices,
    MediaEndpoint, MediaHandle, PeerId, RemoteStream,
};
use crate::Error;

/// Reports from a call screen to the controller that opened it.
#[derive(Debug)]
pub enum ScreenEvent {
    MediaAcquired { token: SessionToken, media: MediaHandle },
    Connected { token: SessionToken, remote: RemoteStream },
    Failed { token: SessionToken, error: Error },
    Ended { token: SessionToken, reason: EndReason },
}

impl ScreenEvent {
    pub fn token(&self) -> &SessionToken {
        match self {
            ScreenEvent::MediaAcquired { token, .. }
            | ScreenEvent::Connected { token, .. }
            | ScreenEvent::Failed { token, .. }
            | ScreenEvent::Ended { token, .. } => token,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScreenCommand {
    /// The counterpart announced its media endpoint in the room.
    PeerJoined(PeerId),
    Close,
}

/// Opens a call screen for an accepted call.
pub trait ScreenLauncher: Send + Sync {
    fn launch(
        &self,
        handoff: CallHandoff,
        events: UnboundedSender<ScreenEvent>,
        commands: UnboundedReceiver<ScreenCommand>,
    );
}

/// Runs each call screen as a task next to the client.
pub struct TaskLauncher {
    endpoint: Arc<dyn MediaEndpoint>,
    devices: Arc<dyn MediaDevices>,
    constraints: MediaConstraints,
    timeouts: CallConfig,
    base_url: Url,
}

impl TaskLauncher {
    pub fn new(
        endpoint: Arc<dyn MediaEndpoint>,
        devices: Arc<dyn MediaDevices>,
        constraints: MediaConstraints,
        timeouts: CallConfig,
        base_url: Url,
    ) -> Self {
        Self {
            endpoint,
            devices,
            constraints,
            timeouts,
            base_url,
        }
    }
}

impl ScreenLauncher for TaskLauncher {
    fn launch(
        &self,
        handoff: CallHandoff,
        events: UnboundedSender<ScreenEvent>,
        commands: UnboundedReceiver<ScreenCommand>,
    ) {
        info!("Opening call screen {}", handoff.screen_url(&self.base_url));
        let screen = CallScreen {
            handoff,
            endpoint: self.endpoint.clone(),
            devices: self.devices.clone(),
            constraints: self.constraints.clone(),
            timeouts: self.timeouts.clone(),
            events,
            commands,
        };
        tokio::spawn(screen.run());
    }
}

enum Established {
    Call(MediaCall),
    Ended(EndReason),
}

pub struct CallScreen {
    handoff: CallHandoff,
    endpoint: Arc<dyn MediaEndpoint>,
    devices: Arc<dyn MediaDevices>,
    constraints: MediaConstraints,
    timeouts: CallConfig,
    events: UnboundedSender<ScreenEvent>,
    commands: UnboundedReceiver<ScreenCommand>,
}

impl CallScreen {
    pub fn new(
        handoff: CallHandoff,
        endpoint: Arc<dyn MediaEndpoint>,
        devices: Arc<dyn MediaDevices>,
        constraints: MediaConstraints,
        timeouts: CallConfig,
    ) -> (Self, UnboundedReceiver<ScreenEvent>, UnboundedSender<ScreenCommand>) {
        let (events, event_receiver) = mpsc::unbounded_channel();
        let (command_sender, commands) = mpsc::unbounded_channel();
        let screen = Self {
            handoff,
            endpoint,
            devices,
            constraints,
            timeouts,
            events,
            commands,
        };
        (screen, event_receiver, command_sender)
    }

    pub async fn run(mut self) {
        let token = self.handoff.token.clone();
        // offers left over from an earlier call are not ours
        if self.handoff.role == CallRole::Callee {
            self.endpoint.discard_incoming().await;
        }
        let outcome = self.session().await;
        if self.handoff.role == CallRole::Callee {
            self.endpoint.discard_incoming().await;
        }
        let event = match outcome {
            Ok(reason) => {
                info!("Call with {} ended: {}", self.handoff.friend, reason);
                ScreenEvent::Ended { token, reason }
            }
            Err(error) => {
                warn!("Call with {} failed: {}", self.handoff.friend, error);
                ScreenEvent::Failed { token, error }
            }
        };
        let _ = self.events.send(event);
    }

    async fn session(&mut self) -> Result<EndReason, Error> {
        let stream = acquire_local_media(&*self.devices, &self.constraints).await?;
        self.emit(ScreenEvent::MediaAcquired {
            token: self.handoff.token.clone(),
            media: stream.handle(),
        });

        let deadline = Instant::now() + self.timeouts.connect_timeout();
        let mut call = match self.establish(&stream, deadline).await? {
            Established::Call(call) => call,
            Established::Ended(reason) => {
                stream.stop();
                return Ok(reason);
            }
        };
        let outcome = self.in_call(&mut call, deadline).await;
        stream.stop();
        call.close().await;
        outcome
    }

    async fn establish(&mut self, stream: &LocalStream, deadline: Instant) -> Result<Established, Error> {
        match self.handoff.role {
            CallRole::Caller => {
                // the callee announces its endpoint once its media is ready
                let grace = sleep(self.timeouts.dial_grace());
                tokio::pin!(grace);
                loop {
                    tokio::select! {
                        _ = &mut grace => break,
                        command = self.commands.recv() => match command {
                            Some(ScreenCommand::PeerJoined(peer)) if peer == self.handoff.peer => break,
                            Some(ScreenCommand::PeerJoined(peer)) => debug!("ignoring peer {}", peer),
                            Some(ScreenCommand::Close) | None => {
                                return Ok(Established::Ended(EndReason::LocalHangup))
                            }
                        },
                    }
                }
                info!("Dialing {}", self.handoff.peer);
                let call = self.endpoint.call(&self.handoff.peer, stream).await?;
                Ok(Established::Call(call))
            }
            CallRole::Callee => loop {
                tokio::select! {
                    _ = sleep_until(deadline) => return Ok(Established::Ended(EndReason::Unreachable)),
                    incoming = self.endpoint.next_incoming(&self.handoff.peer) => match incoming {
                        Some(pending) => {
                            info!("Answering {}", self.handoff.peer);
                            return Ok(Established::Call(pending.answer(stream).await?));
                        }
                        None => {
                            return Err(Error::PeerNegotiation("media endpoint closed".to_string()))
                        }
                    },
                    command = self.commands.recv() => match command {
                        Some(ScreenCommand::PeerJoined(_)) => {}
                        Some(ScreenCommand::Close) | None => {
                            return Ok(Established::Ended(EndReason::LocalHangup))
                        }
                    },
                }
            },
        }
    }

    async fn in_call(&mut self, call: &mut MediaCall, connect_deadline: Instant) -> Result<EndReason, Error> {
        let mut connected = false;
        let mut deadline = Some(connect_deadline);
        loop {
            let wake = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            tokio::select! {
                _ = sleep_until(wake), if deadline.is_some() => {
                    warn!("No media from {} in time", call.peer());
                    return Ok(EndReason::Unreachable);
                }
                event = call.next_event() => match event {
                    Some(MediaCallEvent::Stream(remote)) => {
                        if !connected {
                            connected = true;
                            deadline = None;
                            info!("Receiving media from {}", call.peer());
                            self.emit(ScreenEvent::Connected {
                                token: self.handoff.token.clone(),
                                remote,
                            });
                        }
                    }
                    Some(MediaCallEvent::Disconnected) => {
                        warn!("Media connection to {} interrupted", call.peer());
                        if connected {
                            deadline = Some(Instant::now() + self.timeouts.unreachable_timeout());
                        }
                    }
                    Some(MediaCallEvent::Reconnected) => {
                        if connected {
                            info!("Media connection to {} restored", call.peer());
                            deadline = None;
                        }
                    }
                    Some(MediaCallEvent::Error(message)) => {
                        return Err(Error::PeerNegotiation(message));
                    }
                    Some(MediaCallEvent::Close) | None => return Ok(EndReason::MediaClosed),
                },
                command = self.commands.recv() => match command {
                    Some(ScreenCommand::PeerJoined(_)) => {}
                    Some(ScreenCommand::Close) | None => return Ok(EndReason::LocalHangup),
                },
            }
        }
    }

    fn emit(&self, event: ScreenEvent) {
        if self.events.send(event).is_err() {
            debug!("call controller is gone");
        }
    }
}
