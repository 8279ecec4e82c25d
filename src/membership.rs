//
// Copyright (C) 2019 Signal Messenger, LLC.
// All rights reserved.
//
// SPDX-License-Identifier: GPL-3.0-only
//

//! Membership View: parses, filters and exposes the set of non-expired
//! members of a group call from the room's shared call-member state events.

use std::collections::HashMap;

use serde::Deserialize;

use crate::ids::Participant;

/// The SFU connection details for a LiveKit-backed call.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct SfuInfo {
    pub service_url: String,
    pub alias: String,
}

/// Tagged variant selecting full-mesh P2P media vs. SFU-relayed media.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Backend {
    Mesh,
    LiveKit(SfuInfo),
}

impl Backend {
    pub fn is_livekit_call(&self) -> bool {
        matches!(self, Backend::LiveKit(_))
    }
}

/// Raw wire shape of a single entry in a member event's `memberships` array,
/// exactly as received over the room state transport. Every field that the
/// validator requires is mandatory here; anything else is optional.
#[derive(Clone, Debug, Deserialize)]
pub struct RawMembership {
    pub call_id: Option<String>,
    pub device_id: Option<String>,
    pub expires_ts: Option<i64>,
    #[serde(default)]
    pub foci_active: Vec<serde_json::Value>,
    pub application: Option<String>,
    pub scope: Option<String>,
    #[serde(rename = "membershipId")]
    pub membership_id: Option<String>,
}

/// A validated membership record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Membership {
    pub user_id: String,
    pub room_id: String,
    pub call_id: String,
    pub device_id: String,
    pub application: String,
    pub scope: String,
    pub membership_id: String,
    pub expires_ts_ms: i64,
}

impl Membership {
    pub fn participant(&self) -> Participant {
        Participant::new(self.user_id.clone(), Some(self.device_id.clone()))
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_ts_ms <= now_ms
    }
}

/// Validates and lifts a raw, loosely-typed membership entry into a
/// [`Membership`]. Fails open: any missing mandatory field is rejected with
/// a reason string that the caller logs at `warn!` and discards.
pub fn validate_membership(
    raw: &RawMembership,
    user_id: &str,
    room_id: &str,
    origin_server_ts: i64,
) -> Result<Membership, String> {
    let call_id = raw
        .call_id
        .clone()
        .ok_or_else(|| "missing call_id".to_string())?;
    let device_id = raw
        .device_id
        .clone()
        .ok_or_else(|| "missing device_id".to_string())?;
    let expires_ts_ms = raw.expires_ts.ok_or_else(|| "missing expires_ts".to_string())?;
    if raw.foci_active.is_empty() {
        return Err("missing foci_active".to_string());
    }
    let application = raw.application.clone().unwrap_or_else(|| "m.call".to_string());
    let scope = raw.scope.clone().unwrap_or_else(|| "m.room".to_string());
    let membership_id = raw
        .membership_id
        .clone()
        .unwrap_or_else(|| format!("{user_id}:{device_id}:{origin_server_ts}"));

    Ok(Membership {
        user_id: user_id.to_string(),
        room_id: room_id.to_string(),
        call_id,
        device_id,
        application,
        scope,
        membership_id,
        expires_ts_ms,
    })
}

/// A timestamped, already-validated membership event, used only to maintain
/// the oldest-first ordering required for deterministic iteration.
#[derive(Clone, Debug)]
struct TimestampedMembership {
    origin_server_ts: i64,
    membership: Membership,
}

/// Flattens and filters membership state events from the room into the live
/// member set of a single group call.
#[derive(Debug, Default)]
pub struct MembershipView {
    /// All currently known, validated memberships, per originating user.
    by_user: HashMap<String, Vec<TimestampedMembership>>,
}

impl MembershipView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the full `memberships` array last published by `user_id`,
    /// as delivered in a single state event update. A later update
    /// supersedes an earlier one wholesale for that user: the view holds a
    /// snapshot per user, not a merged history.
    pub fn set_user_memberships(
        &mut self,
        user_id: &str,
        room_id: &str,
        origin_server_ts: i64,
        raw_memberships: &[RawMembership],
    ) {
        let mut validated = Vec::with_capacity(raw_memberships.len());
        for raw in raw_memberships {
            match validate_membership(raw, user_id, room_id, origin_server_ts) {
                Ok(membership) => validated.push(TimestampedMembership {
                    origin_server_ts,
                    membership,
                }),
                Err(reason) => {
                    log::warn!(
                        "dropping malformed membership from {user_id} in {room_id}: {reason}"
                    );
                }
            }
        }
        self.by_user.insert(user_id.to_string(), validated);
    }

    /// Returns all non-expired memberships, across all users, matching
    /// `(callId, application, scope, roomId)`, oldest-first by
    /// `origin_server_ts`.
    pub fn matching(
        &self,
        room_id: &str,
        call_id: &str,
        application: &str,
        scope: &str,
        now_ms: i64,
    ) -> Vec<Membership> {
        let mut matches: Vec<&TimestampedMembership> = self
            .by_user
            .values()
            .flatten()
            .filter(|tm| {
                let m = &tm.membership;
                m.room_id == room_id
                    && m.call_id == call_id
                    && m.application == application
                    && m.scope == scope
                    && !m.is_expired(now_ms)
            })
            .collect();
        matches.sort_by_key(|tm| tm.origin_server_ts);
        matches.into_iter().map(|tm| tm.membership.clone()).collect()
    }

    /// The current, pure projection of live members of `call_id` (any
    /// application/scope), as an unordered set view.
    pub fn current(&self, room_id: &str, call_id: &str, now_ms: i64) -> Vec<Membership> {
        self.by_user
            .values()
            .flatten()
            .filter(|tm| {
                tm.membership.room_id == room_id
                    && tm.membership.call_id == call_id
                    && !tm.membership.is_expired(now_ms)
            })
            .map(|tm| tm.membership.clone())
            .collect()
    }

    /// All call ids with at least one non-expired member in this room.
    pub fn active_group_call_ids(&self, room_id: &str, now_ms: i64) -> Vec<String> {
        let mut ids: Vec<String> = self
            .by_user
            .values()
            .flatten()
            .filter(|tm| tm.membership.room_id == room_id && !tm.membership.is_expired(now_ms))
            .map(|tm| tm.membership.call_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn participant_count(&self, room_id: &str, call_id: &str, now_ms: i64) -> usize {
        self.current(room_id, call_id, now_ms).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(call_id: &str, device_id: &str, expires_ts: i64) -> RawMembership {
        RawMembership {
            call_id: Some(call_id.to_string()),
            device_id: Some(device_id.to_string()),
            expires_ts: Some(expires_ts),
            foci_active: vec![serde_json::json!({"type": "livekit"})],
            application: Some("m.call".to_string()),
            scope: Some("m.room".to_string()),
            membership_id: Some("sess-1".to_string()),
        }
    }

    #[test]
    fn rejects_malformed_membership() {
        let mut bad = raw("abc", "dev1", 1000);
        bad.call_id = None;
        let err = validate_membership(&bad, "@a:hs", "!room:hs", 5).unwrap_err();
        assert!(err.contains("call_id"));
    }

    #[test]
    fn filters_expired_and_mismatched() {
        let mut view = MembershipView::new();
        view.set_user_memberships(
            "@a:hs",
            "!room:hs",
            1,
            &[raw("abc", "dev1", 10_000), raw("xyz", "dev1", 10_000)],
        );
        view.set_user_memberships("@b:hs", "!room:hs", 2, &[raw("abc", "dev2", 1)]);

        let current = view.matching("!room:hs", "abc", "m.call", "m.room", 5_000);
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].device_id, "dev1");
    }

    #[test]
    fn later_update_supersedes_earlier_for_same_user() {
        let mut view = MembershipView::new();
        view.set_user_memberships("@a:hs", "!room:hs", 1, &[raw("abc", "dev1", 10_000)]);
        view.set_user_memberships("@a:hs", "!room:hs", 2, &[]);
        assert!(view.matching("!room:hs", "abc", "m.call", "m.room", 5).is_empty());
    }
}
