use std::fmt;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// Rendezvous key for a pair of users.
///
/// Both participants derive the same id without coordination: the two emails
/// sorted and joined with `-`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn between(a: &str, b: &str) -> Self {
        RoomId([a, b].iter().sorted().join("-"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Wraps an id received from the relay or a call screen link.
    pub fn from_wire(id: impl Into<String>) -> Self {
        RoomId(id.into())
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
