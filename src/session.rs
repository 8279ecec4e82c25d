//
// Copyright (C) 2019 Signal Messenger, LLC.
// All rights reserved.
//
// SPDX-License-Identifier: GPL-3.0-only
//

//! Mesh Signaling State Machine: drives the group-call lifecycle and
//! reconciles the Membership View with the Peer Call Table under the
//! tie-break rule. This is the orchestration core every other component is
//! wired into; [`crate::actor`] is the recommended production front-end
//! that serializes calls onto it.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::GroupCallConfig;
use crate::error::{GroupCallError, Result};
use crate::events::{EventBus, GroupCallEvent};
use crate::external::{
    DeviceMessenger, EncryptionKeyEntry, GroupCallRegistry, KeyProvider, LocalMediaFactory, PeerConnectionFactory,
    RoomService,
};
use crate::heartbeat::MembershipHeartbeat;
use crate::ids::{Participant, VoipId};
use crate::keys::KeyLadder;
use crate::membership::{Backend, MembershipView, RawMembership};
use crate::peer_calls::{
    CallDirection, CallType, HangupReason, IceServer, PeerCall, PeerCallState, PeerCallTable,
};
use crate::speaker::ActiveSpeakerDetector;
use crate::streams::{StreamPurpose, StreamRegistry, WrappedMediaStream};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GroupCallState {
    LocalFeedUninitialized,
    InitializingLocalFeed,
    LocalFeedInitialized,
    Entered,
    Ended,
}

/// Everything a [`GroupCallSession`] needs constructed once, up front.
pub struct GroupCallSessionDeps {
    pub group_call_id: VoipId,
    pub local: Participant,
    pub local_device_id: String,
    pub application: String,
    pub scope: String,
    pub backend: Backend,
    pub config: Arc<GroupCallConfig>,
    pub room_service: Arc<dyn RoomService>,
    pub registry: Arc<dyn GroupCallRegistry>,
    pub local_media: Arc<dyn LocalMediaFactory>,
    pub peer_factory: Arc<dyn PeerConnectionFactory>,
    pub messenger: Arc<dyn DeviceMessenger>,
    pub key_provider: Arc<dyn KeyProvider>,
    pub ice_servers: Vec<IceServer>,
}

/// The per-room group call session: the fusion point where membership,
/// peer calls, streams, the key ladder, the heartbeat, the active-speaker
/// detector and the event bus all meet.
pub struct GroupCallSession {
    group_call_id: VoipId,
    local: Participant,
    local_device_id: String,
    application: String,
    scope: String,
    backend: Backend,
    config: Arc<GroupCallConfig>,
    registry: Arc<dyn GroupCallRegistry>,
    local_media: Arc<dyn LocalMediaFactory>,
    peer_factory: Arc<dyn PeerConnectionFactory>,
    ice_servers: Vec<IceServer>,

    state: Mutex<GroupCallState>,
    membership_view: Mutex<MembershipView>,
    participants: Mutex<BTreeSet<Participant>>,
    streams: Arc<StreamRegistry>,
    peer_calls: Arc<Mutex<PeerCallTable>>,
    key_ladder: Mutex<KeyLadder>,
    heartbeat: Arc<MembershipHeartbeat>,
    speaker: Arc<ActiveSpeakerDetector>,
    events: Arc<EventBus>,

    leave_debounce: Mutex<Option<JoinHandle<()>>>,
}

impl GroupCallSession {
    pub fn new(deps: GroupCallSessionDeps) -> Arc<Self> {
        let events = Arc::new(EventBus::new());
        let streams = Arc::new(StreamRegistry::with_events(events.clone()));
        let peer_calls = Arc::new(Mutex::new(PeerCallTable::new(streams.clone())));
        let key_ladder = KeyLadder::new(
            deps.local.clone(),
            deps.local_device_id.clone(),
            deps.group_call_id.clone(),
            deps.config.clone(),
            deps.key_provider,
            deps.messenger,
        );
        let heartbeat = Arc::new(MembershipHeartbeat::new(
            deps.room_service.clone(),
            deps.config.clone(),
            deps.group_call_id.room_id.clone(),
            deps.local.user_id.clone(),
            deps.group_call_id.call_id.clone(),
            deps.local_device_id.clone(),
            deps.application.clone(),
            deps.scope.clone(),
        ));
        let speaker = Arc::new(ActiveSpeakerDetector::new(events.clone()));

        Arc::new(Self {
            group_call_id: deps.group_call_id,
            local: deps.local,
            local_device_id: deps.local_device_id,
            application: deps.application,
            scope: deps.scope,
            backend: deps.backend,
            config: deps.config,
            registry: deps.registry,
            local_media: deps.local_media,
            peer_factory: deps.peer_factory,
            ice_servers: deps.ice_servers,
            state: Mutex::new(GroupCallState::LocalFeedUninitialized),
            membership_view: Mutex::new(MembershipView::new()),
            participants: Mutex::new(BTreeSet::new()),
            streams,
            peer_calls,
            key_ladder: Mutex::new(key_ladder),
            heartbeat,
            speaker,
            events,
            leave_debounce: Mutex::new(None),
        })
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn streams(&self) -> &Arc<StreamRegistry> {
        &self.streams
    }

    pub async fn state(&self) -> GroupCallState {
        *self.state.lock().await
    }

    /// The peer call currently held for `participant`, if any.
    pub async fn peer_call_for(&self, participant: &Participant) -> Option<Arc<PeerCall>> {
        self.peer_calls.lock().await.get_for_participant(participant)
    }

    /// Current live participant set, as last reconciled from the membership
    /// view. Includes the local participant's own membership entry.
    pub async fn participants(&self) -> Vec<Participant> {
        self.participants.lock().await.iter().cloned().collect()
    }

    async fn set_state(&self, state: GroupCallState) {
        *self.state.lock().await = state;
        self.events.on_group_call_state.publish(state);
    }

    /// `initLocalStream()`. Mesh only; LiveKit calls skip this.
    pub async fn init_local_stream(&self) -> Result<()> {
        let current = self.state().await;
        if current != GroupCallState::LocalFeedUninitialized {
            return Err(GroupCallError::PreconditionViolation {
                method: "initLocalStream",
                state: format!("{current:?}"),
            });
        }
        self.set_state(GroupCallState::InitializingLocalFeed).await;
        match self.local_media.acquire_user_media().await {
            Ok(handle) => {
                let stream = WrappedMediaStream::new(self.local.clone(), StreamPurpose::UserMedia, true, handle);
                self.streams.add(stream).await;
                self.set_state(GroupCallState::LocalFeedInitialized).await;
                Ok(())
            }
            Err(err) => {
                self.set_state(GroupCallState::LocalFeedUninitialized).await;
                Err(err)
            }
        }
    }

    /// `enter()`.
    pub async fn enter(self: &Arc<Self>) -> Result<()> {
        let current = self.state().await;
        if !matches!(current, GroupCallState::LocalFeedUninitialized | GroupCallState::LocalFeedInitialized) {
            return Err(GroupCallError::PreconditionViolation {
                method: "enter",
                state: format!("{current:?}"),
            });
        }
        if current == GroupCallState::LocalFeedUninitialized && !self.backend.is_livekit_call() {
            self.init_local_stream().await?;
        }

        let local_membership = self.heartbeat.send_member_state_event().await?;
        {
            let mut view = self.membership_view.lock().await;
            view.set_user_memberships(&self.local.user_id, &self.group_call_id.room_id, now_ms(), &[local_membership]);
        }
        self.speaker.fall_back_to_first_remaining(&self.streams).await;
        self.set_state(GroupCallState::Entered).await;
        self.events.on_group_call_event.publish(GroupCallEvent::Entered);

        self.on_member_state_changed().await?;

        let live_self = self.clone();
        self.heartbeat
            .start(move || {
                // Snapshot-read without awaiting: state changes are rare and
                // this check only gates whether the *next* tick re-arms.
                live_self
                    .state
                    .try_lock()
                    .map(|s| !matches!(*s, GroupCallState::Ended | GroupCallState::LocalFeedUninitialized))
                    .unwrap_or(true)
            })
            .await;

        if !self.backend.is_livekit_call() {
            self.speaker
                .start(self.config.active_speaker_interval, self.peer_calls.clone(), self.streams.clone())
                .await;
        }

        self.registry.register(self.group_call_id.clone()).await?;
        log::info!("entered group call {}", self.group_call_id);
        Ok(())
    }

    /// Ingests a membership state-event update for one room user, then
    /// reconciles if `Entered`.
    pub async fn on_room_membership_event(
        self: &Arc<Self>,
        user_id: &str,
        origin_server_ts: i64,
        raw_memberships: &[RawMembership],
    ) -> Result<()> {
        {
            let mut view = self.membership_view.lock().await;
            view.set_user_memberships(user_id, &self.group_call_id.room_id, origin_server_ts, raw_memberships);
        }
        self.on_member_state_changed().await
    }

    /// The reconciliation algorithm (`onMemberStateChanged`). Only runs
    /// when `state == Entered`.
    pub async fn on_member_state_changed(self: &Arc<Self>) -> Result<()> {
        if self.state().await != GroupCallState::Entered {
            return Ok(());
        }
        let now_ms = now_ms();
        let matching = {
            let view = self.membership_view.lock().await;
            view.matching(
                &self.group_call_id.room_id,
                &self.group_call_id.call_id,
                &self.application,
                &self.scope,
                now_ms,
            )
        };

        let new_participants: BTreeSet<Participant> = matching.iter().map(|m| m.participant()).collect();

        if matches!(self.backend, Backend::Mesh) {
            for m in &matching {
                let participant = m.participant();
                if participant == self.local {
                    continue;
                }
                if self.local.canonical_id() > participant.canonical_id() {
                    continue; // tie-break: the remote initiates.
                }

                let mut calls = self.peer_calls.lock().await;
                if let Some(existing) = calls.get_for_participant(&participant) {
                    if existing.remote_session_id == m.membership_id {
                        continue;
                    }
                    log::warn!("stale peer session for {participant}, replacing");
                    calls.remove(&existing, HangupReason::UnknownError).await;
                }
                drop(calls);

                let call_id = uuid::Uuid::new_v4().to_string();
                let transport = self.peer_factory.create_transport(&participant, &call_id);
                let call = Arc::new(PeerCall::new(
                    call_id,
                    participant.clone(),
                    m.membership_id.clone(),
                    CallDirection::Outgoing,
                    CallType::Video,
                    transport,
                ));
                for stream in self.streams.user_media_streams().await {
                    if stream.is_local {
                        call.emit_stream_added(stream);
                    }
                }
                call.place(&self.ice_servers).await?;
                self.peer_calls.lock().await.add(call).await;
            }
        }

        let old_participants = {
            let mut p = self.participants.lock().await;
            std::mem::replace(&mut *p, new_participants.clone())
        };
        let joined: Vec<Participant> = new_participants.difference(&old_participants).cloned().collect();
        let left: Vec<Participant> = old_participants.difference(&new_participants).cloned().collect();

        if self.backend.is_livekit_call() {
            if !joined.is_empty() {
                let mut ladder = self.key_ladder.lock().await;
                if self.config.enable_sfu_e2ee_key_ratcheting {
                    ladder.ratchet_local_participant_key(&joined).await?;
                } else {
                    ladder.make_new_sender_key(true, &joined).await?;
                }
            }
            if !left.is_empty() {
                {
                    let mut ladder = self.key_ladder.lock().await;
                    ladder.drop_keys_for(&left);
                }
                self.schedule_leave_debounced_rekey().await;
            }
        }

        if !joined.is_empty() || !left.is_empty() {
            self.events.on_group_call_event.publish(GroupCallEvent::ParticipantsChanged);
        }
        Ok(())
    }

    /// Debounces simultaneous leavers into a single new sender key.
    async fn schedule_leave_debounced_rekey(self: &Arc<Self>) {
        let mut slot = self.leave_debounce.lock().await;
        if slot.is_some() {
            return; // a debounce window is already pending; it will pick up all leavers so far.
        }
        let this = self.clone();
        let delay = self.config.make_key_delay;
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            *this.leave_debounce.lock().await = None;
            let mut ladder = this.key_ladder.lock().await;
            if let Err(err) = ladder.make_new_sender_key(true, &[]).await {
                log::error!("debounced rekey after leaver(s) failed: {err}");
            }
        }));
    }

    /// `onIncomingCall`.
    pub async fn on_incoming_call(
        &self,
        room_id: &str,
        incoming_group_call_id: Option<&VoipId>,
        remote: Participant,
        remote_session_id: String,
        incoming_call_id: String,
        incoming_state: PeerCallState,
        transport: Arc<dyn crate::external::MediaTransport>,
    ) -> Result<()> {
        if room_id != self.group_call_id.room_id {
            return Err(GroupCallError::StaleSession(self.group_call_id.clone()));
        }
        if incoming_state != PeerCallState::Ringing {
            return Err(GroupCallError::StaleSession(self.group_call_id.clone()));
        }
        match incoming_group_call_id {
            Some(id) if id == &self.group_call_id => {}
            _ => return Err(GroupCallError::StaleSession(self.group_call_id.clone())),
        }
        if self.backend.is_livekit_call() {
            return Ok(()); // signaling-only on SFU backends.
        }

        let incoming = Arc::new(PeerCall::new(
            incoming_call_id,
            remote.clone(),
            remote_session_id,
            CallDirection::Incoming,
            CallType::Video,
            transport,
        ));

        let mut calls = self.peer_calls.lock().await;
        if let Some(existing) = calls.get_for_participant(&remote) {
            if existing.call_id == incoming.call_id {
                return Ok(());
            }
            calls.replace(&existing, incoming.clone()).await?;
        } else {
            calls.add(incoming.clone()).await;
        }
        drop(calls);

        incoming.answer().await
    }

    /// `setScreensharingEnabled`. Errors propagate to the caller rather
    /// than being swallowed, so a caller that only polls state still
    /// learns when screensharing never started.
    pub async fn set_screensharing_enabled(&self, enabled: bool) -> Result<()> {
        if enabled {
            let handle = self.local_media.acquire_display_media().await.map_err(|err| {
                self.events.on_group_call_event.publish(GroupCallEvent::Error(err.to_string()));
                err
            })?;
            let stream = WrappedMediaStream::new(self.local.clone(), StreamPurpose::Screenshare, true, handle.clone());
            self.streams.add(stream.clone()).await;
            if matches!(self.backend, Backend::Mesh) {
                let calls = self.peer_calls.lock().await;
                for participant in self.participants.lock().await.iter() {
                    if let Some(call) = calls.get_for_participant(participant) {
                        call.emit_stream_added(stream.clone());
                    }
                }
            }
            Ok(())
        } else {
            let existing = self.streams.get(&self.local, StreamPurpose::Screenshare).await;
            if let Some(existing) = existing {
                // Remove keyed by the existing stream's own participant, not
                // a caller-supplied one, so a caller can't tear down a
                // stream under the wrong identity.
                self.streams.remove(&existing.participant, StreamPurpose::Screenshare).await;
                if matches!(self.backend, Backend::Mesh) {
                    let calls = self.peer_calls.lock().await;
                    for participant in self.participants.lock().await.iter() {
                        if let Some(call) = calls.get_for_participant(participant) {
                            call.emit_stream_removed(existing.participant.clone(), StreamPurpose::Screenshare);
                        }
                    }
                }
            }
            Ok(())
        }
    }

    /// `onCallEncryption`, delegated to the key ladder.
    pub async fn on_call_encryption(&self, sender: Participant, keys: &[EncryptionKeyEntry]) {
        self.key_ladder.lock().await.on_call_encryption(sender, keys).await;
    }

    /// `onCallEncryptionKeyRequest`.
    pub async fn on_call_encryption_key_request(&self, sender: Participant, requester_room_id: &str) -> Result<()> {
        let now_ms = now_ms();
        let has_matching_live_membership = {
            let view = self.membership_view.lock().await;
            view.matching(requester_room_id, &self.group_call_id.call_id, &self.application, &self.scope, now_ms)
                .into_iter()
                .any(|m| m.participant() == sender)
        };
        self.key_ladder
            .lock()
            .await
            .on_call_encryption_key_request(sender, requester_room_id, has_matching_live_membership)
            .await
    }

    /// `leave()`: cancels all timers, retracts membership, stops local
    /// streams, hangs up every peer call, deregisters.
    pub async fn leave(&self) -> Result<()> {
        let current = self.state().await;
        if current == GroupCallState::Ended {
            return Err(GroupCallError::PreconditionViolation {
                method: "leave",
                state: format!("{current:?}"),
            });
        }
        self.set_state(GroupCallState::Ended).await;

        self.speaker.stop().await;
        if let Some(handle) = self.leave_debounce.lock().await.take() {
            handle.abort();
        }
        self.heartbeat.stop().await;
        self.heartbeat.remove_member_state_event().await?;

        {
            let mut calls = self.peer_calls.lock().await;
            let participants: Vec<Participant> = self.participants.lock().await.iter().cloned().collect();
            for participant in participants {
                if let Some(call) = calls.get_for_participant(&participant) {
                    calls.remove(&call, HangupReason::UserHangup).await;
                }
            }
        }
        self.streams.stop_all_local().await;
        self.key_ladder.lock().await.reset_on_leave();
        self.participants.lock().await.clear();

        self.registry.unregister(&self.group_call_id).await;
        self.events.on_group_call_event.publish(GroupCallEvent::Ended);
        log::info!("left group call {}", self.group_call_id);
        Ok(())
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
