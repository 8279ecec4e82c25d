//
// Copyright (C) 2019 Signal Messenger, LLC.
// All rights reserved.
//
// SPDX-License-Identifier: GPL-3.0-only
//

//! Value types identifying a room+call pair and a (user, device)
//! participant, with the canonical-id ordering used as the tie-break rule
//! for mesh call initiation.

use std::fmt;

/// Identifies a group call as a `(roomId, callId)` pair.
///
/// Serializes as `"{roomId}:{callId}"`. `callId` never contains a colon, so
/// parsing splits on the *last* colon only, letting `roomId` itself contain
/// colons (as federated room ids do, e.g. `!room:example.org`).
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct VoipId {
    pub room_id: String,
    pub call_id: String,
}

impl VoipId {
    pub fn new(room_id: impl Into<String>, call_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            call_id: call_id.into(),
        }
    }

    /// Parses a `"{roomId}:{callId}"` string, splitting on the last colon.
    pub fn parse(s: &str) -> Option<Self> {
        let idx = s.rfind(':')?;
        let (room_id, rest) = s.split_at(idx);
        let call_id = &rest[1..];
        if room_id.is_empty() || call_id.is_empty() {
            return None;
        }
        Some(Self {
            room_id: room_id.to_string(),
            call_id: call_id.to_string(),
        })
    }
}

impl fmt::Display for VoipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.room_id, self.call_id)
    }
}

/// A (user, device) pair identifying one endpoint in a call.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Participant {
    pub user_id: String,
    pub device_id: Option<String>,
}

impl Participant {
    pub fn new(user_id: impl Into<String>, device_id: Option<String>) -> Self {
        Self {
            user_id: user_id.into(),
            device_id,
        }
    }

    /// The canonical string id used for ordering and as a map key:
    /// `userId + deviceId`, with an empty device suffix if absent.
    pub fn canonical_id(&self) -> String {
        let mut id = self.user_id.clone();
        if let Some(device_id) = &self.device_id {
            id.push_str(device_id);
        }
        id
    }
}

impl fmt::Display for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.device_id {
            Some(device_id) => write!(f, "{}:{}", self.user_id, device_id),
            None => write!(f, "{}", self.user_id),
        }
    }
}

impl Ord for Participant {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.canonical_id().cmp(&other.canonical_id())
    }
}

impl PartialOrd for Participant {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voip_id_round_trips() {
        let id = VoipId::new("!room:srv", "abc");
        assert_eq!(id.to_string(), "!room:srv:abc");
        assert_eq!(VoipId::parse(&id.to_string()), Some(id));
    }

    #[test]
    fn voip_id_splits_on_last_colon_only() {
        let id = VoipId::parse("!room:srv:abc").unwrap();
        assert_eq!(id.room_id, "!room:srv");
        assert_eq!(id.call_id, "abc");
    }

    #[test]
    fn participant_canonical_id_and_order() {
        let a = Participant::new("user", Some("dev1".to_string()));
        let b = Participant::new("user", Some("dev2".to_string()));
        assert_eq!(a.canonical_id(), "userdev1");
        assert!(a < b);

        let no_device = Participant::new("user", None);
        assert_eq!(no_device.canonical_id(), "user");
    }
}
