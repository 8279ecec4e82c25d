//
// Copyright (C) 2019 Signal Messenger, LLC.
// All rights reserved.
//
// SPDX-License-Identifier: GPL-3.0-only
//

//! In-crate simulated collaborators: a fake implementation of every
//! external trait with atomic call counters and fault-injection flags,
//! used by the integration tests under `tests/` to drive a whole
//! [`crate::session::GroupCallSession`] without any real network or media
//! stack.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{GroupCallError, Result};
use crate::external::{
    AudioLevelReport, DeviceMessenger, EncryptionKeyEntry, GroupCallRegistry, KeyProvider, LocalMediaFactory,
    MediaHandle, MediaTransport, PeerConnectionFactory, RoomService,
};
use crate::ids::{Participant, VoipId};
use crate::membership::RawMembership;
use crate::peer_calls::{CallDirection, CallType, HangupReason, IceServer};

#[derive(Default)]
pub struct SimStats {
    pub calls_placed: AtomicUsize,
    pub calls_answered: AtomicUsize,
    pub hangups: AtomicUsize,
    pub media_acquired: AtomicUsize,
    pub display_media_acquired: AtomicUsize,
}

/// A stream/call handle that just counts its own `stop()`s; stands in for
/// a real WebRTC `MediaStreamTrack`/peer connection.
#[derive(Debug, Default)]
pub struct SimMediaHandle {
    pub stopped: Arc<AtomicUsize>,
}

impl MediaHandle for SimMediaHandle {
    fn stop(&self) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

/// Fake peer-connection transport for one remote participant.
pub struct SimMediaTransport {
    pub stats: Arc<SimStats>,
    pub remote_audio_level: Mutex<Option<f64>>,
    pub force_place_fault: AtomicBool,
}

impl SimMediaTransport {
    pub fn new(stats: Arc<SimStats>) -> Self {
        Self {
            stats,
            remote_audio_level: Mutex::new(None),
            force_place_fault: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl MediaTransport for SimMediaTransport {
    async fn place_call_with_streams(
        &self,
        _call_id: &str,
        _direction: CallDirection,
        _call_type: CallType,
        _ice_servers: &[IceServer],
    ) -> Result<()> {
        if self.force_place_fault.load(Ordering::SeqCst) {
            return Err(GroupCallError::MediaAcquisitionFailed("simulated placement fault".to_string()));
        }
        self.stats.calls_placed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn answer_with_streams(&self, _call_id: &str) -> Result<()> {
        self.stats.calls_answered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn hangup(&self, _call_id: &str, _reason: HangupReason, _should_emit: bool) {
        self.stats.hangups.fetch_add(1, Ordering::SeqCst);
    }

    async fn get_audio_levels(&self, _call_id: &str) -> Result<AudioLevelReport> {
        Ok(AudioLevelReport {
            remote_audio_level: *self.remote_audio_level.lock().unwrap(),
            local_audio_level: None,
        })
    }
}

/// Mints a [`SimMediaTransport`] per call, all sharing one stats block.
pub struct SimPeerConnectionFactory {
    pub stats: Arc<SimStats>,
    pub transports: Mutex<HashMap<String, Arc<SimMediaTransport>>>,
}

impl SimPeerConnectionFactory {
    pub fn new(stats: Arc<SimStats>) -> Self {
        Self {
            stats,
            transports: Mutex::new(HashMap::new()),
        }
    }

    pub fn transport_for(&self, call_id: &str) -> Option<Arc<SimMediaTransport>> {
        self.transports.lock().unwrap().get(call_id).cloned()
    }
}

impl PeerConnectionFactory for SimPeerConnectionFactory {
    fn create_transport(&self, _remote: &Participant, call_id: &str) -> Arc<dyn MediaTransport> {
        let transport = Arc::new(SimMediaTransport::new(self.stats.clone()));
        self.transports.lock().unwrap().insert(call_id.to_string(), transport.clone());
        transport
    }
}

/// Acquires local media instantly, optionally failing on demand so tests
/// can exercise the acquisition-error paths.
pub struct SimLocalMediaFactory {
    pub stats: Arc<SimStats>,
    pub force_user_media_fault: AtomicBool,
    pub force_display_media_fault: AtomicBool,
}

impl SimLocalMediaFactory {
    pub fn new(stats: Arc<SimStats>) -> Self {
        Self {
            stats,
            force_user_media_fault: AtomicBool::new(false),
            force_display_media_fault: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl LocalMediaFactory for SimLocalMediaFactory {
    async fn acquire_user_media(&self) -> Result<Arc<dyn MediaHandle>> {
        if self.force_user_media_fault.load(Ordering::SeqCst) {
            return Err(GroupCallError::MediaAcquisitionFailed("simulated camera fault".to_string()));
        }
        self.stats.media_acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(SimMediaHandle::default()))
    }

    async fn acquire_display_media(&self) -> Result<Arc<dyn MediaHandle>> {
        if self.force_display_media_fault.load(Ordering::SeqCst) {
            return Err(GroupCallError::ScreenshareFailed("simulated display-capture fault".to_string()));
        }
        self.stats.display_media_acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(SimMediaHandle::default()))
    }
}

/// An in-memory room: per-user `memberships` arrays, keyed by `(room_id,
/// user_id)`.
#[derive(Default)]
pub struct SimRoomService {
    memberships: Mutex<HashMap<(String, String), Vec<RawMembership>>>,
}

impl SimRoomService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test-side seeding: publishes a membership directly, bypassing the
    /// heartbeat, to simulate a remote participant's own state event.
    pub fn seed(&self, room_id: &str, user_id: &str, membership: RawMembership) {
        self.memberships
            .lock()
            .unwrap()
            .entry((room_id.to_string(), user_id.to_string()))
            .or_default()
            .push(membership);
    }
}

#[async_trait]
impl RoomService for SimRoomService {
    async fn load_memberships(&self, room_id: &str, user_id: &str) -> Result<Vec<RawMembership>> {
        Ok(self
            .memberships
            .lock()
            .unwrap()
            .get(&(room_id.to_string(), user_id.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn write_memberships(&self, room_id: &str, user_id: &str, memberships: Vec<RawMembership>) -> Result<()> {
        self.memberships
            .lock()
            .unwrap()
            .insert((room_id.to_string(), user_id.to_string()), memberships);
        Ok(())
    }
}

/// Records every key distribution and request instead of sending it
/// anywhere.
#[derive(Default)]
pub struct SimDeviceMessenger {
    pub sent_keys: Mutex<Vec<(Vec<Participant>, Vec<EncryptionKeyEntry>)>>,
    pub key_requests: Mutex<Vec<Participant>>,
}

impl SimDeviceMessenger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceMessenger for SimDeviceMessenger {
    async fn send_encryption_keys(
        &self,
        recipients: &[Participant],
        _group_call_id: &VoipId,
        _sender_device_id: &str,
        keys: &[EncryptionKeyEntry],
    ) -> Result<()> {
        self.sent_keys.lock().unwrap().push((recipients.to_vec(), keys.to_vec()));
        Ok(())
    }

    async fn send_encryption_key_request(
        &self,
        recipient: &Participant,
        _group_call_id: &VoipId,
        _sender_device_id: &str,
    ) -> Result<()> {
        self.key_requests.lock().unwrap().push(recipient.clone());
        Ok(())
    }
}

/// Installs and "ratchets" keys by just xor-incrementing bytes, deterministic
/// enough to assert on in tests without a real cipher.
#[derive(Default)]
pub struct SimKeyProvider {
    pub installed: Mutex<Vec<(Participant, u8, [u8; 32])>>,
}

impl SimKeyProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyProvider for SimKeyProvider {
    async fn on_set_encryption_key(&self, participant: &Participant, index: u8, key: [u8; 32]) {
        self.installed.lock().unwrap().push((participant.clone(), index, key));
    }

    async fn on_ratchet_key(&self, _participant: &Participant, _index: u8) -> Vec<u8> {
        vec![7u8; 32]
    }
}

#[derive(Default)]
pub struct SimGroupCallRegistry {
    registered: Mutex<std::collections::HashSet<VoipId>>,
}

impl SimGroupCallRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GroupCallRegistry for SimGroupCallRegistry {
    async fn register(&self, id: VoipId) -> Result<()> {
        if !self.registered.lock().unwrap().insert(id.clone()) {
            return Err(GroupCallError::AlreadyRegistered(id));
        }
        Ok(())
    }

    async fn unregister(&self, id: &VoipId) {
        self.registered.lock().unwrap().remove(id);
    }

    async fn contains(&self, id: &VoipId) -> bool {
        self.registered.lock().unwrap().contains(id)
    }
}
