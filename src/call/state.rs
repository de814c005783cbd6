//! Call phases and the transitions between them.

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallRole {
    Caller,
    Callee,
}

/// Where a call currently is.
///
/// Caller: `Idle → Requested → Accepted → MediaAcquired → Connected → Ended`.
/// Callee: `Idle → Ringing → Accepted → MediaAcquired → Connected → Ended`.
/// Any phase but `Idle` may move to `Ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub enum CallPhase {
    #[default]
    Idle,
    /// Outgoing request sent, waiting for the callee.
    Requested,
    /// Incoming request shown to the user.
    Ringing,
    Accepted,
    MediaAcquired,
    /// Remote media is flowing.
    Connected,
    Ended,
}

impl CallPhase {
    /// A call exists and has not ended yet.
    pub fn is_live(self) -> bool {
        !matches!(self, CallPhase::Idle | CallPhase::Ended)
    }

    pub fn can_accept(self) -> bool {
        self == CallPhase::Ringing
    }

    pub fn can_reject(self) -> bool {
        self == CallPhase::Ringing
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum EndReason {
    LocalHangup,
    RemoteHangup,
    /// The media session closed on its own.
    MediaClosed,
    Rejected,
    /// The callee never answered an outgoing call.
    NoAnswer,
    /// An incoming call rang out.
    Missed,
    /// No media connection within the allowed time.
    Unreachable,
    Failed(String),
}

impl EndReason {
    /// The counterpart does not know the call is over and must receive a
    /// `call-ended` event.
    pub fn notifies_peer(&self) -> bool {
        !matches!(
            self,
            EndReason::RemoteHangup | EndReason::Rejected | EndReason::Missed
        )
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::LocalHangup => f.write_str("you hung up"),
            EndReason::RemoteHangup => f.write_str("the other side hung up"),
            EndReason::MediaClosed => f.write_str("the media session closed"),
            EndReason::Rejected => f.write_str("the call was declined"),
            EndReason::NoAnswer => f.write_str("no answer"),
            EndReason::Missed => f.write_str("missed call"),
            EndReason::Unreachable => f.write_str("the other side is unreachable"),
            EndReason::Failed(reason) => write!(f, "call failed: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallTransition {
    RequestSent,
    RequestReceived,
    Accepted,
    MediaAcquired,
    RemoteStream,
    Terminated(EndReason),
}

impl CallPhase {
    pub fn next(self, role: CallRole, transition: &CallTransition) -> Result<CallPhase, InvalidTransition> {
        let next = match (self, role, transition) {
            (CallPhase::Idle, CallRole::Caller, CallTransition::RequestSent) => CallPhase::Requested,
            (CallPhase::Idle, CallRole::Callee, CallTransition::RequestReceived) => {
                CallPhase::Ringing
            }
            (CallPhase::Requested, CallRole::Caller, CallTransition::Accepted)
            | (CallPhase::Ringing, CallRole::Callee, CallTransition::Accepted) => CallPhase::Accepted,
            (CallPhase::Accepted, _, CallTransition::MediaAcquired) => CallPhase::MediaAcquired,
            (CallPhase::MediaAcquired, _, CallTransition::RemoteStream) => CallPhase::Connected,
            (current, _, CallTransition::Terminated(_)) if current.is_live() => CallPhase::Ended,
            (current, _, transition) => {
                return Err(InvalidTransition {
                    current_state: format!("{:?}", current),
                    attempted: format!("{:?}", transition),
                });
            }
        };
        Ok(next)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

#[cfg(test)]
mod tests {
    use super::*;

    fn walk(role: CallRole, steps: &[CallTransition]) -> Result<CallPhase, InvalidTransition> {
        steps
            .iter()
            .try_fold(CallPhase::Idle, |phase, step| phase.next(role, step))
    }

    #[test]
    fn test_caller_flow() {
        let phase = walk(
            CallRole::Caller,
            &[
                CallTransition::RequestSent,
                CallTransition::Accepted,
                CallTransition::MediaAcquired,
                CallTransition::RemoteStream,
            ],
        )
        .unwrap();
        assert_eq!(phase, CallPhase::Connected);
        assert_eq!(
            phase.next(CallRole::Caller, &CallTransition::Terminated(EndReason::LocalHangup)),
            Ok(CallPhase::Ended)
        );
    }

    #[test]
    fn test_callee_flow() {
        let phase = walk(
            CallRole::Callee,
            &[CallTransition::RequestReceived, CallTransition::Accepted],
        )
        .unwrap();
        assert_eq!(phase, CallPhase::Accepted);
    }

    #[test]
    fn test_roles_cannot_take_each_others_path() {
        assert!(CallPhase::Idle
            .next(CallRole::Caller, &CallTransition::RequestReceived)
            .is_err());
        assert!(CallPhase::Idle
            .next(CallRole::Callee, &CallTransition::RequestSent)
            .is_err());
    }

    #[test]
    fn test_remote_stream_requires_local_media() {
        let err = CallPhase::Accepted
            .next(CallRole::Caller, &CallTransition::RemoteStream)
            .unwrap_err();
        assert_eq!(err.current_state, "Accepted");
        assert!(err.to_string().contains("RemoteStream"));
    }

    #[test]
    fn test_ended_is_terminal() {
        let terminate = CallTransition::Terminated(EndReason::RemoteHangup);
        assert!(CallPhase::Ended.next(CallRole::Caller, &terminate).is_err());
        assert!(CallPhase::Idle.next(CallRole::Caller, &terminate).is_err());
        for phase in [
            CallPhase::Requested,
            CallPhase::Ringing,
            CallPhase::Accepted,
            CallPhase::MediaAcquired,
            CallPhase::Connected,
        ] {
            let role = if phase == CallPhase::Ringing {
                CallRole::Callee
            } else {
                CallRole::Caller
            };
            assert_eq!(phase.next(role, &terminate), Ok(CallPhase::Ended));
        }
    }

    #[test]
    fn test_only_unaware_peers_are_notified() {
        assert!(EndReason::LocalHangup.notifies_peer());
        assert!(EndReason::NoAnswer.notifies_peer());
        assert!(EndReason::Failed("camera".into()).notifies_peer());
        assert!(!EndReason::RemoteHangup.notifies_peer());
        assert!(!EndReason::Rejected.notifies_peer());
        assert!(!EndReason::Missed.notifies_peer());
    }
}
