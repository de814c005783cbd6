//! Errors surfaced to the user.

use thiserror::Error;

use crate::call::InvalidTransition;

#[derive(Debug, Error)]
pub enum Error {
    /// The REST API or the relay could not be reached.
    #[error("network error: {0}")]
    Network(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("media unavailable: {0}")]
    MediaUnavailable(String),

    /// The peer-to-peer media library reported a failure.
    #[error("peer negotiation failed: {0}")]
    PeerNegotiation(String),

    #[error("{0}")]
    Validation(String),

    #[error("a call is already in progress")]
    Busy,

    #[error("no active call")]
    NoActiveCall,

    #[error("{0} is not in your friend list")]
    NotAFriend(String),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
}

impl Error {
    /// Camera and microphone problems need the user's attention before they
    /// can retry, everything else is shown as a transient toast.
    pub fn is_blocking(&self) -> bool {
        matches!(self, Error::PermissionDenied(_) | Error::MediaUnavailable(_))
    }
}

impl From<webrtc::Error> for Error {
    fn from(err: webrtc::Error) -> Self {
        Error::PeerNegotiation(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Network(err.to_string())
    }
}
