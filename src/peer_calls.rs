//
// Copyright (C) 2019 Signal Messenger, LLC.
// All rights reserved.
//
// SPDX-License-Identifier: GPL-3.0-only
//

//! Peer Call Table: owns one [`PeerCall`] per remote participant, fans each
//! call's events back into the group (streams into the Stream Registry,
//! lifecycle into `callsChanged`), and implements add/replace/remove with
//! hangup-reason propagation.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};

use crate::error::{GroupCallError, Result};
use crate::external::MediaTransport;
use crate::ids::Participant;
use crate::streams::{StreamPurpose, StreamRegistry, WrappedMediaStream};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CallType {
    Voice,
    Video,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PeerCallState {
    Ringing,
    Connecting,
    Connected,
    Terminated,
}

/// Why a [`PeerCall`] ended, extended with `Replaced` which is the one
/// reason that must *not* re-trigger the normal hangup-driven remove path —
/// doing so would loop back into the replace that produced it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HangupReason {
    UserHangup,
    /// This call was superseded by a newer one for the same participant.
    Replaced,
    /// The remote session id no longer matches: the peer restarted.
    UnknownError,
    InviteTimeout,
    AnsweredElsewhere,
}

#[derive(Clone, Debug)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

/// Events a [`PeerCall`] fans out to its owning table. The forwarding task
/// that consumes these exits once the call's sender side is dropped, so a
/// subscription never outlives its peer call.
#[derive(Clone, Debug)]
pub enum PeerCallEvent {
    StateChanged(PeerCallState),
    StreamAdded(WrappedMediaStream),
    StreamRemoved(Participant, StreamPurpose),
    /// The call hung up itself (e.g. remote end closed); carries whether the
    /// table should still run its normal remove-and-emit path.
    HungUp { reason: HangupReason, should_emit: bool },
}

/// One peer-to-peer media session toward a single remote participant.
pub struct PeerCall {
    pub call_id: String,
    pub remote_participant: Participant,
    pub remote_session_id: String,
    pub direction: CallDirection,
    pub call_type: CallType,
    state: watch::Sender<PeerCallState>,
    transport: Arc<dyn MediaTransport>,
    events_tx: mpsc::UnboundedSender<PeerCallEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerCallEvent>>>,
}

impl PeerCall {
    pub fn new(
        call_id: String,
        remote_participant: Participant,
        remote_session_id: String,
        direction: CallDirection,
        call_type: CallType,
        transport: Arc<dyn MediaTransport>,
    ) -> Self {
        let (state, _) = watch::channel(PeerCallState::Ringing);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            call_id,
            remote_participant,
            remote_session_id,
            direction,
            call_type,
            state,
            transport,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    pub fn state(&self) -> PeerCallState {
        *self.state.borrow()
    }

    pub fn set_state(&self, state: PeerCallState) {
        let _ = self.state.send(state);
        let _ = self.events_tx.send(PeerCallEvent::StateChanged(state));
    }

    /// Takes the event receiver exactly once; the table uses this when it
    /// `add`s the call, and it is never reachable again afterwards.
    pub async fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerCallEvent>> {
        self.events_rx.lock().await.take()
    }

    pub fn emit_stream_added(&self, stream: WrappedMediaStream) {
        let _ = self.events_tx.send(PeerCallEvent::StreamAdded(stream));
    }

    pub fn emit_stream_removed(&self, participant: Participant, purpose: StreamPurpose) {
        let _ = self
            .events_tx
            .send(PeerCallEvent::StreamRemoved(participant, purpose));
    }

    pub async fn place(&self, ice_servers: &[IceServer]) -> Result<()> {
        self.transport
            .place_call_with_streams(&self.call_id, self.direction, self.call_type, ice_servers)
            .await
    }

    pub async fn answer(&self) -> Result<()> {
        self.transport.answer_with_streams(&self.call_id).await
    }

    /// Hangs up the underlying transport. `should_emit` controls whether a
    /// `HungUp` event is also queued, letting callers that are *already*
    /// driving a remove (table-initiated hangups) suppress the recursive
    /// notification.
    pub async fn hangup(&self, reason: HangupReason, should_emit: bool) {
        self.transport.hangup(&self.call_id, reason, should_emit).await;
        self.set_state(PeerCallState::Terminated);
        if should_emit {
            let _ = self.events_tx.send(PeerCallEvent::HungUp { reason, should_emit });
        }
    }

    pub async fn audio_levels(&self) -> Result<crate::external::AudioLevelReport> {
        self.transport.get_audio_levels(&self.call_id).await
    }
}

impl std::fmt::Debug for PeerCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerCall")
            .field("call_id", &self.call_id)
            .field("remote_participant", &self.remote_participant)
            .field("remote_session_id", &self.remote_session_id)
            .field("direction", &self.direction)
            .field("state", &self.state())
            .finish()
    }
}

/// Owns the set of live [`PeerCall`]s, one per remote participant.
pub struct PeerCallTable {
    calls: HashMap<String, Arc<PeerCall>>, // keyed by remote participant canonical id
    streams: Arc<StreamRegistry>,
    changed_tx: watch::Sender<u64>,
    changed_seq: u64,
}

impl PeerCallTable {
    pub fn new(streams: Arc<StreamRegistry>) -> Self {
        let (changed_tx, _) = watch::channel(0);
        Self {
            calls: HashMap::new(),
            streams,
            changed_tx,
            changed_seq: 0,
        }
    }

    pub fn subscribe_changed(&self) -> watch::Receiver<u64> {
        self.changed_tx.subscribe()
    }

    fn notify_changed(&mut self) {
        self.changed_seq += 1;
        let _ = self.changed_tx.send(self.changed_seq);
    }

    pub fn get_for_participant(&self, participant: &Participant) -> Option<Arc<PeerCall>> {
        self.calls.get(&participant.canonical_id()).cloned()
    }

    pub fn contains(&self, participant: &Participant) -> bool {
        self.calls.contains_key(&participant.canonical_id())
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Subscribes to the call's event stream (forwarding remote stream
    /// changes into the Stream Registry), stores it keyed by its remote
    /// participant, and fires `callsChanged`.
    pub async fn add(&mut self, call: Arc<PeerCall>) {
        let key = call.remote_participant.canonical_id();
        if let Some(mut events) = call.take_events().await {
            let streams = self.streams.clone();
            let participant = call.remote_participant.clone();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    match event {
                        PeerCallEvent::StreamAdded(stream) => {
                            if !stream.is_local {
                                streams.add(stream).await;
                            }
                        }
                        PeerCallEvent::StreamRemoved(p, purpose) => {
                            streams.remove(&p, purpose).await;
                        }
                        PeerCallEvent::StateChanged(_) | PeerCallEvent::HungUp { .. } => {}
                    }
                }
                log::debug!("peer call event stream for {participant} closed");
            });
        }
        self.calls.insert(key, call);
        self.notify_changed();
    }

    /// Swaps `existing` for `replacement` in place: the existing call is
    /// hung up with reason `Replaced` (suppressing its normal remove path),
    /// and listeners see exactly one `callsChanged`.
    pub async fn replace(&mut self, existing: &Arc<PeerCall>, replacement: Arc<PeerCall>) -> Result<()> {
        let key = existing.remote_participant.canonical_id();
        if !self.calls.contains_key(&key) {
            return Err(GroupCallError::PeerCallMissing(existing.remote_participant.clone()));
        }
        existing.hangup(HangupReason::Replaced, false).await;
        if let Some(mut events) = replacement.take_events().await {
            let streams = self.streams.clone();
            let participant = replacement.remote_participant.clone();
            tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    match event {
                        PeerCallEvent::StreamAdded(stream) => {
                            if !stream.is_local {
                                streams.add(stream).await;
                            }
                        }
                        PeerCallEvent::StreamRemoved(p, purpose) => {
                            streams.remove(&p, purpose).await;
                        }
                        PeerCallEvent::StateChanged(_) | PeerCallEvent::HungUp { .. } => {}
                    }
                }
                log::debug!("peer call event stream for {participant} closed");
            });
        }
        self.calls.insert(key, replacement);
        self.notify_changed();
        Ok(())
    }

    /// Removes `call`. Unless `reason == Replaced` (already handled by the
    /// caller of `replace`), hangs it up with `shouldEmit=false` to avoid
    /// recursion, then drops the participant's streams. Idempotent:
    /// removing an already-absent call is a no-op.
    pub async fn remove(&mut self, call: &Arc<PeerCall>, reason: HangupReason) {
        let key = call.remote_participant.canonical_id();
        if self.calls.remove(&key).is_none() {
            return;
        }
        if reason != HangupReason::Replaced {
            call.hangup(reason, false).await;
        }
        self.streams.remove_all_for(&call.remote_participant).await;
        self.notify_changed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::AudioLevelReport;
    use async_trait::async_trait;

    struct NullTransport;

    #[async_trait]
    impl MediaTransport for NullTransport {
        async fn place_call_with_streams(
            &self,
            _call_id: &str,
            _direction: CallDirection,
            _call_type: CallType,
            _ice_servers: &[IceServer],
        ) -> Result<()> {
            Ok(())
        }
        async fn answer_with_streams(&self, _call_id: &str) -> Result<()> {
            Ok(())
        }
        async fn hangup(&self, _call_id: &str, _reason: HangupReason, _should_emit: bool) {}
        async fn get_audio_levels(&self, _call_id: &str) -> Result<AudioLevelReport> {
            Ok(AudioLevelReport::default())
        }
    }

    fn make_call(participant: &Participant, call_id: &str, session_id: &str) -> Arc<PeerCall> {
        Arc::new(PeerCall::new(
            call_id.to_string(),
            participant.clone(),
            session_id.to_string(),
            CallDirection::Outgoing,
            CallType::Video,
            Arc::new(NullTransport),
        ))
    }

    #[tokio::test]
    async fn add_then_get_for_participant() {
        let streams = Arc::new(StreamRegistry::new());
        let mut table = PeerCallTable::new(streams);
        let b = Participant::new("b", Some("dev2".to_string()));
        let call = make_call(&b, "call-1", "sess-1");
        table.add(call.clone()).await;
        assert!(table.contains(&b));
        assert_eq!(table.get_for_participant(&b).unwrap().call_id, "call-1");
    }

    #[tokio::test]
    async fn replace_is_atomic_and_single_changed_event() {
        let streams = Arc::new(StreamRegistry::new());
        let mut table = PeerCallTable::new(streams);
        let b = Participant::new("b", Some("dev2".to_string()));
        let first = make_call(&b, "call-x", "sess-1");
        table.add(first.clone()).await;
        let mut changed = table.subscribe_changed();
        changed.borrow_and_update();

        let second = make_call(&b, "call-y", "sess-1");
        table.replace(&first, second.clone()).await.unwrap();

        assert_eq!(table.get_for_participant(&b).unwrap().call_id, "call-y");
        assert_eq!(first.state(), PeerCallState::Terminated);
        assert!(changed.has_changed().unwrap());
    }

    #[tokio::test]
    async fn replace_missing_call_errors() {
        let streams = Arc::new(StreamRegistry::new());
        let mut table = PeerCallTable::new(streams);
        let b = Participant::new("b", Some("dev2".to_string()));
        let ghost = make_call(&b, "call-ghost", "sess-1");
        let replacement = make_call(&b, "call-new", "sess-1");
        let err = table.replace(&ghost, replacement).await.unwrap_err();
        assert!(matches!(err, GroupCallError::PeerCallMissing(_)));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let streams = Arc::new(StreamRegistry::new());
        let mut table = PeerCallTable::new(streams);
        let b = Participant::new("b", Some("dev2".to_string()));
        let call = make_call(&b, "call-1", "sess-1");
        table.add(call.clone()).await;
        table.remove(&call, HangupReason::UserHangup).await;
        assert!(!table.contains(&b));
        // Second remove is a no-op, not an error.
        table.remove(&call, HangupReason::UserHangup).await;
        assert!(table.is_empty());
    }
}
