use chrono::{DateTime, Utc};

use crate::api::Identity;
use crate::call::{CallPhase, CallRole, CallTransition, EndReason, InvalidTransition, RoomId, SessionToken};
use crate::media::{MediaHandle, PeerId, RemoteStream};

/// The single active call of this client.
#[derive(Debug)]
pub struct CallSession {
    role: CallRole,
    phase: CallPhase,
    friend: Identity,
    room_id: Option<RoomId>,
    local_peer_id: PeerId,
    remote_peer_id: Option<PeerId>,
    token: SessionToken,
    local_media: Option<MediaHandle>,
    remote_stream: Option<RemoteStream>,
    created_at: DateTime<Utc>,
    connected_at: Option<DateTime<Utc>>,
}

/// What is left of a session once it has ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSummary {
    pub friend: Identity,
    pub role: CallRole,
    pub reason: EndReason,
    pub duration_secs: Option<i64>,
}

impl CallSession {
    pub fn outgoing(friend: Identity, room_id: RoomId, local_peer_id: PeerId) -> Self {
        Self::new(CallRole::Caller, CallPhase::Requested, friend, room_id, local_peer_id, None)
    }

    pub fn incoming(
        friend: Identity,
        room_id: RoomId,
        local_peer_id: PeerId,
        remote_peer_id: PeerId,
    ) -> Self {
        Self::new(
            CallRole::Callee,
            CallPhase::Ringing,
            friend,
            room_id,
            local_peer_id,
            Some(remote_peer_id),
        )
    }

    fn new(
        role: CallRole,
        phase: CallPhase,
        friend: Identity,
        room_id: RoomId,
        local_peer_id: PeerId,
        remote_peer_id: Option<PeerId>,
    ) -> Self {
        Self {
            role,
            phase,
            friend,
            room_id: Some(room_id),
            local_peer_id,
            remote_peer_id,
            token: SessionToken::new(),
            local_media: None,
            remote_stream: None,
            created_at: Utc::now(),
            connected_at: None,
        }
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    pub fn phase(&self) -> CallPhase {
        self.phase
    }

    pub fn friend(&self) -> &Identity {
        &self.friend
    }

    pub fn room_id(&self) -> Option<&RoomId> {
        self.room_id.as_ref()
    }

    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }

    pub fn remote_peer_id(&self) -> Option<&PeerId> {
        self.remote_peer_id.as_ref()
    }

    pub fn token(&self) -> &SessionToken {
        &self.token
    }

    pub fn local_media(&self) -> Option<&MediaHandle> {
        self.local_media.as_ref()
    }

    pub fn remote_stream(&self) -> Option<&RemoteStream> {
        self.remote_stream.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// The callee accepted; its media endpoint is `remote_peer_id`.
    pub fn accepted_by(&mut self, remote_peer_id: PeerId) -> Result<(), InvalidTransition> {
        self.apply_transition(CallTransition::Accepted)?;
        self.remote_peer_id = Some(remote_peer_id);
        Ok(())
    }

    pub fn media_acquired(&mut self, media: MediaHandle) -> Result<(), InvalidTransition> {
        self.apply_transition(CallTransition::MediaAcquired)?;
        self.local_media = Some(media);
        Ok(())
    }

    pub fn remote_stream_arrived(&mut self, stream: RemoteStream) -> Result<(), InvalidTransition> {
        self.apply_transition(CallTransition::RemoteStream)?;
        self.remote_stream = Some(stream);
        self.connected_at = Some(Utc::now());
        Ok(())
    }

    pub fn apply_transition(&mut self, transition: CallTransition) -> Result<(), InvalidTransition> {
        self.phase = self.phase.next(self.role, &transition)?;
        Ok(())
    }

    /// Ends the session: local tracks are stopped and the room and remote
    /// peer forgotten before anything else happens.
    pub fn finish(mut self, reason: EndReason) -> CallSummary {
        if let Some(media) = self.local_media.take() {
            media.stop();
        }
        self.room_id = None;
        self.remote_peer_id = None;
        self.remote_stream = None;
        if let Err(e) = self.apply_transition(CallTransition::Terminated(reason.clone())) {
            debug!("{}", e);
        }
        CallSummary {
            friend: self.friend,
            role: self.role,
            reason,
            duration_secs: self
                .connected_at
                .map(|at| Utc::now().signed_duration_since(at).num_seconds()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::testing::{stream, ReleaseCounter};
    use crate::media::TrackKind;

    fn bob() -> Identity {
        Identity::new("bob@x.com")
    }

    #[test]
    fn test_outgoing_session_flow() {
        let room = RoomId::between("alice@x.com", "bob@x.com");
        let mut session = CallSession::outgoing(bob(), room.clone(), PeerId::new("peer-a"));
        assert_eq!(session.phase(), CallPhase::Requested);
        assert_eq!(session.remote_peer_id(), None);

        session.accepted_by(PeerId::new("peer-b")).unwrap();
        assert_eq!(session.phase(), CallPhase::Accepted);
        assert_eq!(session.remote_peer_id(), Some(&PeerId::new("peer-b")));
        assert_eq!(session.room_id(), Some(&room));
    }

    #[test]
    fn test_finish_releases_media_and_clears_ids() {
        let releases = ReleaseCounter::default();
        let local = stream(&releases);
        let mut session = CallSession::incoming(
            bob(),
            RoomId::between("alice@x.com", "bob@x.com"),
            PeerId::new("peer-a"),
            PeerId::new("peer-b"),
        );
        session.accepted_by(PeerId::new("peer-b")).unwrap();
        session.media_acquired(local.handle()).unwrap();
        session
            .remote_stream_arrived(RemoteStream {
                id: "remote".into(),
                kind: TrackKind::Video,
            })
            .unwrap();
        assert_eq!(session.phase(), CallPhase::Connected);

        let summary = session.finish(EndReason::LocalHangup);
        assert_eq!(releases.count(), local.tracks().len());
        assert_eq!(summary.reason, EndReason::LocalHangup);
        assert_eq!(summary.role, CallRole::Callee);
        assert!(summary.duration_secs.is_some());
    }

    #[test]
    fn test_media_before_accept_is_rejected() {
        let releases = ReleaseCounter::default();
        let local = stream(&releases);
        let mut session = CallSession::outgoing(
            bob(),
            RoomId::between("alice@x.com", "bob@x.com"),
            PeerId::new("peer-a"),
        );
        assert!(session.media_acquired(local.handle()).is_err());
        assert!(session.local_media().is_none());
    }
}
