//! Call control messages carried in chat text.

use crate::call::RoomId;
use crate::media::PeerId;
use crate::relay::SendMessage;
use crate::Error;

pub const CALL_REQUEST: &str = "_video";
pub const CALL_ACCEPTED: &str = "_video_accepted";
pub const CALL_REJECTED: &str = "_video_rejected";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallSignal {
    /// The caller wants to talk; `peer` is the caller's media endpoint.
    Request { room: RoomId, peer: PeerId },
    /// The callee accepted; `peer` is the callee's media endpoint.
    Accepted { room: RoomId, peer: PeerId },
    /// Declined, or the callee is busy.
    Rejected { room: RoomId },
}

/// `true` for text that would be read as a call signal.
pub fn is_sentinel(message: &str) -> bool {
    matches!(message, CALL_REQUEST | CALL_ACCEPTED | CALL_REJECTED)
}

impl CallSignal {
    /// Reads a `receiveMessage` payload. Plain chat yields `None`.
    pub fn parse(
        message: &str,
        peer_id: Option<&str>,
        room_id: Option<&str>,
    ) -> Result<Option<CallSignal>, Error> {
        if !is_sentinel(message) {
            return Ok(None);
        }
        let room = room_id
            .map(RoomId::from_wire)
            .ok_or_else(|| Error::Validation(format!("{} without a room id", message)))?;
        let peer = || {
            peer_id
                .map(PeerId::new)
                .ok_or_else(|| Error::Validation(format!("{} without a peer id", message)))
        };
        let signal = match message {
            CALL_REQUEST => CallSignal::Request { room, peer: peer()? },
            CALL_ACCEPTED => CallSignal::Accepted { room, peer: peer()? },
            _ => CallSignal::Rejected { room },
        };
        Ok(Some(signal))
    }

    pub fn room(&self) -> &RoomId {
        match self {
            CallSignal::Request { room, .. }
            | CallSignal::Accepted { room, .. }
            | CallSignal::Rejected { room } => room,
        }
    }

    pub fn into_message(self, sender: &str, receiver: &str) -> SendMessage {
        let (message, room, peer) = match self {
            CallSignal::Request { room, peer } => (CALL_REQUEST, room, Some(peer)),
            CallSignal::Accepted { room, peer } => (CALL_ACCEPTED, room, Some(peer)),
            CallSignal::Rejected { room } => (CALL_REJECTED, room, None),
        };
        SendMessage {
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            message: message.to_string(),
            peer_id: peer.map(|p| p.to_string()),
            room_id: Some(room.to_string()),
        }
    }
}
