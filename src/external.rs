//
// Copyright (C) 2019 Signal Messenger, LLC.
// All rights reserved.
//
// SPDX-License-Identifier: GPL-3.0-only
//

//! Capability interfaces for every collaborator this crate treats as
//! external: the WebRTC peer connection, the room/state-event transport,
//! the device-to-device encrypted transport, and the cryptographic key
//! provider. The session core only ever depends on these traits, never on
//! a concrete media or network stack.

use std::sync::Arc;

use async_trait::async_trait;

use crate::ids::{Participant, VoipId};
use crate::membership::RawMembership;
use crate::peer_calls::{CallDirection, CallType, HangupReason, IceServer};

/// A handle to a single media stream (local or remote). `stop` must be
/// idempotent: callers may invoke it more than once on the same handle.
pub trait MediaHandle: Send + Sync + std::fmt::Debug {
    fn stop(&self);
}

/// The WebRTC peer-connection collaborator for one remote participant. A
/// concrete `PeerCall` in [`crate::peer_calls`] wraps one of these plus the
/// bookkeeping a call needs on top of it.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    async fn place_call_with_streams(
        &self,
        call_id: &str,
        direction: CallDirection,
        call_type: CallType,
        ice_servers: &[IceServer],
    ) -> crate::error::Result<()>;

    async fn answer_with_streams(&self, call_id: &str) -> crate::error::Result<()>;

    async fn hangup(&self, call_id: &str, reason: HangupReason, should_emit: bool);

    async fn get_audio_levels(&self, call_id: &str) -> crate::error::Result<AudioLevelReport>;
}

/// A single statistics snapshot: the remote (inbound-rtp) and, if present,
/// local (media-source) audio levels for one peer connection.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct AudioLevelReport {
    pub remote_audio_level: Option<f64>,
    pub local_audio_level: Option<f64>,
}

/// The room/state-event transport: reading and writing the local user's
/// call-member state event.
#[async_trait]
pub trait RoomService: Send + Sync {
    /// Loads the given user's current `memberships` array.
    async fn load_memberships(&self, room_id: &str, user_id: &str) -> crate::error::Result<Vec<RawMembership>>;

    /// Writes back the given user's full `memberships` array.
    async fn write_memberships(
        &self,
        room_id: &str,
        user_id: &str,
        memberships: Vec<RawMembership>,
    ) -> crate::error::Result<()>;
}

/// A device-to-device encryption key payload entry.
#[derive(Clone, Debug, PartialEq)]
pub struct EncryptionKeyEntry {
    pub index: u8,
    pub key: [u8; 32],
}

/// The device-to-device encrypted transport. Sends are addressed to a
/// specific set of recipient devices; when the room is encrypted, the
/// underlying implementation routes via the encrypted-to-device channel,
/// otherwise plaintext — that policy lives entirely in the implementation,
/// not in this crate.
#[async_trait]
pub trait DeviceMessenger: Send + Sync {
    async fn send_encryption_keys(
        &self,
        recipients: &[Participant],
        group_call_id: &VoipId,
        sender_device_id: &str,
        keys: &[EncryptionKeyEntry],
    ) -> crate::error::Result<()>;

    async fn send_encryption_key_request(
        &self,
        recipient: &Participant,
        group_call_id: &VoipId,
        sender_device_id: &str,
    ) -> crate::error::Result<()>;
}

/// The cryptographic key provider that actually installs keys into, and
/// ratchets keys within, the local media encryptor.
#[async_trait]
pub trait KeyProvider: Send + Sync {
    async fn on_set_encryption_key(&self, participant: &Participant, index: u8, key: [u8; 32]);

    /// Deterministically derives the next key at `index`. An empty result
    /// is treated as transient by the caller and retried.
    async fn on_ratchet_key(&self, participant: &Participant, index: u8) -> Vec<u8>;
}

/// The process-wide registry of live sessions, keyed by [`VoipId`]. Mutated
/// only by `enter()`/`leave()`.
#[async_trait]
pub trait GroupCallRegistry: Send + Sync {
    async fn register(&self, id: VoipId) -> crate::error::Result<()>;
    async fn unregister(&self, id: &VoipId);
    async fn contains(&self, id: &VoipId) -> bool;
}

/// Acquires the local media this session owns directly, outside of any one
/// peer call: the initial local user-media stream (`initLocalStream`) and
/// on-demand screenshare capture.
#[async_trait]
pub trait LocalMediaFactory: Send + Sync {
    async fn acquire_user_media(&self) -> crate::error::Result<Arc<dyn MediaHandle>>;
    async fn acquire_display_media(&self) -> crate::error::Result<Arc<dyn MediaHandle>>;
}

/// Mints a fresh [`MediaTransport`] for a new outgoing or answered call
/// toward one remote participant.
pub trait PeerConnectionFactory: Send + Sync {
    fn create_transport(&self, remote: &Participant, call_id: &str) -> Arc<dyn MediaTransport>;
}
