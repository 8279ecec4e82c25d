//
// Copyright (C) 2019 Signal Messenger, LLC.
// All rights reserved.
//
// SPDX-License-Identifier: GPL-3.0-only
//

//! End-to-end scenarios from the group-call design: tie-break initiation,
//! incoming-call replacement, and screenshare failure propagation.

use std::sync::Arc;

use group_call_core::config::GroupCallConfig;
use group_call_core::error::GroupCallError;
use group_call_core::external::{GroupCallRegistry, RoomService};
use group_call_core::ids::{Participant, VoipId};
use group_call_core::membership::{Backend, RawMembership};
use group_call_core::peer_calls::IceServer;
use group_call_core::session::{GroupCallSession, GroupCallSessionDeps, GroupCallState};
use group_call_core::sim::{
    SimDeviceMessenger, SimGroupCallRegistry, SimKeyProvider, SimLocalMediaFactory, SimPeerConnectionFactory,
    SimRoomService, SimStats,
};

fn raw_membership(call_id: &str, device_id: &str, membership_id: &str, expires_ts: i64) -> RawMembership {
    RawMembership {
        call_id: Some(call_id.to_string()),
        device_id: Some(device_id.to_string()),
        expires_ts: Some(expires_ts),
        foci_active: vec![serde_json::json!({"type": "mesh"})],
        application: Some("m.call".to_string()),
        scope: Some("m.room".to_string()),
        membership_id: Some(membership_id.to_string()),
    }
}

/// Shares a room (and call-placement stats) across sessions the way a real
/// homeserver is shared by multiple clients; each session still gets its
/// own process-local registry, since the registry of live sessions is
/// process-global, not room-global.
struct Harness {
    room_service: Arc<SimRoomService>,
    stats: Arc<SimStats>,
}

impl Harness {
    fn new() -> Self {
        Self {
            room_service: Arc::new(SimRoomService::new()),
            stats: Arc::new(SimStats::default()),
        }
    }

    fn build_session(
        &self,
        room_id: &str,
        call_id: &str,
        user_id: &str,
        device_id: &str,
    ) -> (Arc<GroupCallSession>, Arc<SimGroupCallRegistry>) {
        let local_media = Arc::new(SimLocalMediaFactory::new(self.stats.clone()));
        let peer_factory = Arc::new(SimPeerConnectionFactory::new(self.stats.clone()));
        let registry = Arc::new(SimGroupCallRegistry::new());
        let session = GroupCallSession::new(GroupCallSessionDeps {
            group_call_id: VoipId::new(room_id, call_id),
            local: Participant::new(user_id, Some(device_id.to_string())),
            local_device_id: device_id.to_string(),
            application: "m.call".to_string(),
            scope: "m.room".to_string(),
            backend: Backend::Mesh,
            config: Arc::new(GroupCallConfig::default()),
            room_service: self.room_service.clone(),
            registry: registry.clone(),
            local_media,
            peer_factory,
            messenger: Arc::new(SimDeviceMessenger::new()),
            key_provider: Arc::new(SimKeyProvider::new()),
            ice_servers: Vec::<IceServer>::new(),
        });
        (session, registry)
    }

    /// Syncs every known user's memberships into `session`'s view, as a
    /// room-state sync pass would.
    async fn sync_room(&self, session: &Arc<GroupCallSession>, room_id: &str, users: &[(&str, i64)]) {
        for (user_id, ts) in users {
            let memberships = self.room_service.load_memberships(room_id, user_id).await.unwrap();
            session.on_room_membership_event(user_id, *ts, &memberships).await.unwrap();
        }
    }
}

#[tokio::test]
async fn tie_break_places_call_toward_lexicographically_greater_participant() {
    let harness = Harness::new();
    let room_id = "!room:hs";
    let call_id = "call1";

    let (a, _a_registry) = harness.build_session(room_id, call_id, "a", "dev1");
    let (b, _b_registry) = harness.build_session(room_id, call_id, "b", "dev2");

    a.enter().await.unwrap();
    b.enter().await.unwrap();

    harness.sync_room(&a, room_id, &[("a", 1), ("b", 2)]).await;
    harness.sync_room(&b, room_id, &[("a", 1), ("b", 2)]).await;

    let participant_b = Participant::new("b", Some("dev2".to_string()));
    let participant_a = Participant::new("a", Some("dev1".to_string()));

    // A initiates toward B ("a" + "dev1" < "b" + "dev2").
    assert!(a.peer_call_for(&participant_b).await.is_some());
    // B does not initiate toward A.
    assert!(b.peer_call_for(&participant_a).await.is_none());
    assert_eq!(harness.stats.calls_placed.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn screenshare_acquisition_failure_propagates_and_leaves_state_unchanged() {
    let harness = Harness::new();

    // Force the display-media acquisition to fail.
    let local_media = Arc::new(SimLocalMediaFactory::new(harness.stats.clone()));
    local_media.force_display_media_fault.store(true, std::sync::atomic::Ordering::SeqCst);
    let registry = Arc::new(SimGroupCallRegistry::new());
    let failing_session = GroupCallSession::new(GroupCallSessionDeps {
        group_call_id: VoipId::new("!room:hs", "call1"),
        local: Participant::new("a", Some("dev1".to_string())),
        local_device_id: "dev1".to_string(),
        application: "m.call".to_string(),
        scope: "m.room".to_string(),
        backend: Backend::Mesh,
        config: Arc::new(GroupCallConfig::default()),
        room_service: harness.room_service.clone(),
        registry,
        local_media,
        peer_factory: Arc::new(SimPeerConnectionFactory::new(harness.stats.clone())),
        messenger: Arc::new(SimDeviceMessenger::new()),
        key_provider: Arc::new(SimKeyProvider::new()),
        ice_servers: Vec::new(),
    });
    failing_session.enter().await.unwrap();
    assert_eq!(failing_session.state().await, GroupCallState::Entered);
    let before = failing_session.state().await;

    let err = failing_session.set_screensharing_enabled(true).await.unwrap_err();
    assert!(matches!(err, GroupCallError::ScreenshareFailed(_)));
    assert_eq!(failing_session.state().await, before);
    assert!(failing_session
        .streams()
        .get(
            &Participant::new("a", Some("dev1".to_string())),
            group_call_core::streams::StreamPurpose::Screenshare
        )
        .await
        .is_none());
}

#[tokio::test]
async fn leave_cancels_timers_and_deregisters() {
    let harness = Harness::new();
    let (session, registry) = harness.build_session("!room:hs", "call1", "a", "dev1");
    session.enter().await.unwrap();

    session.leave().await.unwrap();

    assert_eq!(session.state().await, GroupCallState::Ended);
    assert!(!registry.contains(&VoipId::new("!room:hs", "call1")).await);
    // leave() on an already-ended session is a precondition violation.
    assert!(matches!(
        session.leave().await.unwrap_err(),
        GroupCallError::PreconditionViolation { .. }
    ));
}

#[tokio::test]
async fn membership_validator_rejects_malformed_entries_fail_open() {
    let harness = Harness::new();
    let (session, _registry) = harness.build_session("!room:hs", "call1", "a", "dev1");
    session.enter().await.unwrap();

    let mut bad = raw_membership("call1", "dev2", "sess-b", 999_999_999_999);
    bad.device_id = None; // malformed: missing device_id
    session.on_room_membership_event("b", 1, &[bad]).await.unwrap();

    // The malformed entry from "b" is dropped; only the local participant's
    // own membership (published by the heartbeat on enter()) is live.
    let participants = session.participants().await;
    assert_eq!(participants, vec![Participant::new("a", Some("dev1".to_string()))]);
}
