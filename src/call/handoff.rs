use std::fmt;

use url::Url;

use crate::api::Identity;
use crate::call::{CallRole, RoomId};
use crate::media::PeerId;
use crate::Error;

/// Ties call screen events to the session that opened the screen.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn new() -> Self {
        SessionToken(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything a call screen needs to take over an accepted call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallHandoff {
    pub room: RoomId,
    /// The counterpart's media endpoint.
    pub peer: PeerId,
    pub token: SessionToken,
    pub role: CallRole,
    pub friend: Identity,
}

impl CallHandoff {
    /// `base?room=...&peer=...&token=...`
    pub fn screen_url(&self, base: &Url) -> Url {
        let mut url = base.clone();
        url.query_pairs_mut()
            .clear()
            .append_pair("room", self.room.as_str())
            .append_pair("peer", self.peer.as_str())
            .append_pair("token", self.token.as_str());
        url
    }

    /// Reads the call parameters back from a screen link.
    pub fn from_url(url: &Url, role: CallRole, friend: Identity) -> Result<Self, Error> {
        let mut room = None;
        let mut peer = None;
        let mut token = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "room" => room = Some(value.into_owned()),
                "peer" => peer = Some(value.into_owned()),
                "token" => token = Some(value.into_owned()),
                _ => {}
            }
        }
        let missing = |name: &str| Error::Validation(format!("call link has no {}", name));
        Ok(Self {
            room: RoomId::from_wire(room.filter(|r| !r.is_empty()).ok_or_else(|| missing("room"))?),
            peer: PeerId::new(peer.filter(|p| !p.is_empty()).ok_or_else(|| missing("peer"))?),
            token: SessionToken(token.ok_or_else(|| missing("token"))?),
            role,
            friend,
        })
    }
}
