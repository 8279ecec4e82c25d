//
// Copyright (C) 2019 Signal Messenger, LLC.
// All rights reserved.
//
// SPDX-License-Identifier: GPL-3.0-only
//

//! E2EE Key Ladder: generates, ratchets, distributes and installs
//! per-participant sender keys over the device-to-device side channel when
//! the call is relayed through an SFU. Encryption itself is always
//! delegated to the external [`KeyProvider`]; this module only manages the
//! index ladder and the send/install choreography around it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use rand::RngCore;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::config::GroupCallConfig;
use crate::error::{GroupCallError, Result};
use crate::external::{DeviceMessenger, EncryptionKeyEntry, KeyProvider};
use crate::ids::{Participant, VoipId};

const KEY_RING_SIZE: u8 = 16;

#[derive(Default)]
struct KeyRing {
    keys: HashMap<u8, [u8; 32]>,
}

impl KeyRing {
    fn insert(&mut self, index: u8, key: [u8; 32]) {
        self.keys.insert(index, key);
    }

    fn get(&self, index: u8) -> Option<[u8; 32]> {
        self.keys.get(&index).copied()
    }
}

/// Owns the per-participant key rings, `currentLocalKeyIndex` and
/// `latestLocalKeyIndex`, and drives the ladder operations.
///
/// Holds no lock of its own: every method takes `&mut self`, matching the
/// rest of the session state that is only ever touched from one caller at a
/// time. `current_local_key_index` is the one exception — a delayed local
/// install updates it from a detached task after `set_encryption_key` has
/// already returned, so it lives behind an `Arc<AtomicU8>` instead of being
/// a plain field.
pub struct KeyLadder {
    local: Participant,
    local_device_id: String,
    group_call_id: VoipId,
    config: Arc<GroupCallConfig>,
    key_provider: Arc<dyn KeyProvider>,
    messenger: Arc<dyn DeviceMessenger>,

    rings: HashMap<String, KeyRing>, // keyed by participant canonical id
    next_index_counter: u32,
    current_local_key_index: Arc<AtomicU8>,
    latest_local_key_index: u8,
    pending_local_key_install: Option<JoinHandle<()>>,
}

impl KeyLadder {
    pub fn new(
        local: Participant,
        local_device_id: String,
        group_call_id: VoipId,
        config: Arc<GroupCallConfig>,
        key_provider: Arc<dyn KeyProvider>,
        messenger: Arc<dyn DeviceMessenger>,
    ) -> Self {
        Self {
            local,
            local_device_id,
            group_call_id,
            config,
            key_provider,
            messenger,
            rings: HashMap::new(),
            next_index_counter: 0,
            current_local_key_index: Arc::new(AtomicU8::new(0)),
            latest_local_key_index: 0,
            pending_local_key_install: None,
        }
    }

    pub fn current_local_key_index(&self) -> u8 {
        self.current_local_key_index.load(Ordering::SeqCst)
    }

    pub fn latest_local_key_index(&self) -> u8 {
        self.latest_local_key_index
    }

    fn next_index(&mut self) -> u8 {
        let idx = (self.next_index_counter % KEY_RING_SIZE as u32) as u8;
        self.next_index_counter += 1;
        idx
    }

    /// `makeNewSenderKey`: generates a fresh random key, assigns the next
    /// ring slot, and installs/distributes it.
    pub async fn make_new_sender_key(&mut self, delay_before_using_key_ourself: bool, send_to: &[Participant]) -> Result<()> {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        let idx = self.next_index();
        self.set_encryption_key(self.local.clone(), idx, key, delay_before_using_key_ourself, true, send_to)
            .await
    }

    /// `setEncryptionKey`. When installing the local encryptor's own key
    /// with `delay_before_using_key_ourself` set, the switch-over itself is
    /// spawned as a detached, tracked task rather than awaited inline: this
    /// method is called with the session's key-ladder lock held, and the
    /// whole session funnels through one command queue, so blocking here
    /// for the full delay would stall every other call for as long as it
    /// takes peers to receive and install the new key.
    pub async fn set_encryption_key(
        &mut self,
        participant: Participant,
        index: u8,
        key: [u8; 32],
        delay_before_using_key_ourself: bool,
        send: bool,
        send_to: &[Participant],
    ) -> Result<()> {
        let is_local = participant == self.local;
        self.rings
            .entry(participant.canonical_id())
            .or_default()
            .insert(index, key);
        if is_local {
            self.latest_local_key_index = index;
        }

        if send {
            self.send_encryption_keys_event(index, key, send_to).await?;
        }

        if is_local {
            self.key_provider.on_set_encryption_key(&participant, index, key).await;
            if let Some(handle) = self.pending_local_key_install.take() {
                handle.abort();
            }
            if delay_before_using_key_ourself {
                let delay = self.config.use_key_delay;
                let current_local_key_index = self.current_local_key_index.clone();
                self.pending_local_key_install = Some(tokio::spawn(async move {
                    sleep(delay).await;
                    current_local_key_index.store(index, Ordering::SeqCst);
                }));
            } else {
                self.current_local_key_index.store(index, Ordering::SeqCst);
            }
        } else {
            self.key_provider.on_set_encryption_key(&participant, index, key).await;
        }
        Ok(())
    }

    /// `sendEncryptionKeysEvent`, capped retry on `TransientSendFailure`
    /// rather than retrying forever.
    async fn send_encryption_keys_event(&self, index: u8, key: [u8; 32], send_to: &[Participant]) -> Result<()> {
        let entry = EncryptionKeyEntry { index, key };
        let mut attempts = 0;
        loop {
            match self
                .messenger
                .send_encryption_keys(send_to, &self.group_call_id, &self.local_device_id, &[entry.clone()])
                .await
            {
                Ok(()) => return Ok(()),
                Err(_err) if attempts < self.config.max_send_retries => {
                    attempts += 1;
                    log::warn!("retrying encryption key send to {} recipients (attempt {attempts})", send_to.len());
                }
                Err(_err) => {
                    return Err(GroupCallError::TransientSendFailure {
                        recipient: send_to.first().cloned().unwrap_or_else(|| self.local.clone()),
                        attempts,
                        reason: "device messenger send failed".to_string(),
                    });
                }
            }
        }
    }

    /// `ratchetLocalParticipantKey`.
    pub async fn ratchet_local_participant_key(&mut self, send_to: &[Participant]) -> Result<()> {
        let has_local_key = self
            .rings
            .get(&self.local.canonical_id())
            .and_then(|ring| ring.get(self.latest_local_key_index))
            .is_some();
        if !has_local_key {
            return self.make_new_sender_key(false, send_to).await;
        }

        let ratcheted = self
            .key_provider
            .on_ratchet_key(&self.local.clone(), self.latest_local_key_index)
            .await;
        if ratcheted.is_empty() {
            log::warn!("ratchet produced an empty key, treating as transient and retrying once");
            return Box::pin(self.ratchet_local_participant_key(send_to)).await;
        }
        let mut key = [0u8; 32];
        let n = ratcheted.len().min(32);
        key[..n].copy_from_slice(&ratcheted[..n]);

        let idx = self.latest_local_key_index;
        self.set_encryption_key(self.local.clone(), idx, key, false, true, send_to).await
    }

    /// `onCallEncryption` inbound handler.
    pub async fn on_call_encryption(&mut self, sender: Participant, keys: &[EncryptionKeyEntry]) {
        if keys.is_empty() {
            log::warn!("dropping encryption-keys event from {sender} with empty keys payload");
            return;
        }
        for entry in keys {
            if let Err(err) = self
                .set_encryption_key(sender.clone(), entry.index, entry.key, false, false, &[])
                .await
            {
                log::warn!("failed installing inbound key from {sender}: {err}");
            }
        }
    }

    /// `onCallEncryptionKeyRequest` inbound handler. `requester_room_id` is
    /// the room the request event itself names; honoring it requires that
    /// room to match this session's own room, not just any room this
    /// process happens to be handling.
    pub async fn on_call_encryption_key_request(
        &self,
        sender: Participant,
        requester_room_id: &str,
        has_matching_live_membership: bool,
    ) -> Result<()> {
        if requester_room_id != self.group_call_id.room_id || !has_matching_live_membership {
            log::warn!("ignoring encryption key request from {sender}: no matching live membership in this room");
            return Ok(());
        }
        let Some(key) = self
            .rings
            .get(&self.local.canonical_id())
            .and_then(|ring| ring.get(self.latest_local_key_index))
        else {
            log::warn!("ignoring encryption key request from {sender}: no local key to resend yet");
            return Ok(());
        };
        self.send_encryption_keys_event(self.latest_local_key_index, key, std::slice::from_ref(&sender))
            .await
    }

    /// Drops all key entries belonging to `leavers`.
    pub fn drop_keys_for(&mut self, leavers: &[Participant]) {
        for p in leavers {
            self.rings.remove(&p.canonical_id());
        }
    }

    /// `leave(self)`: purge the local key entry and reset both indices.
    pub fn reset_on_leave(&mut self) {
        self.rings.remove(&self.local.canonical_id());
        if let Some(handle) = self.pending_local_key_install.take() {
            handle.abort();
        }
        self.current_local_key_index.store(0, Ordering::SeqCst);
        self.latest_local_key_index = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    struct NullKeyProvider;
    #[async_trait]
    impl KeyProvider for NullKeyProvider {
        async fn on_set_encryption_key(&self, _participant: &Participant, _index: u8, _key: [u8; 32]) {}
        async fn on_ratchet_key(&self, _participant: &Participant, _index: u8) -> Vec<u8> {
            vec![1; 32]
        }
    }

    struct RecordingMessenger {
        sends: Mutex<Vec<Vec<Participant>>>,
        fail_first_n: AtomicUsize,
    }
    #[async_trait]
    impl DeviceMessenger for RecordingMessenger {
        async fn send_encryption_keys(
            &self,
            recipients: &[Participant],
            _group_call_id: &VoipId,
            _sender_device_id: &str,
            _keys: &[EncryptionKeyEntry],
        ) -> Result<()> {
            if self.fail_first_n.load(Ordering::SeqCst) > 0 {
                self.fail_first_n.fetch_sub(1, Ordering::SeqCst);
                return Err(GroupCallError::TransientSendFailure {
                    recipient: Participant::new("x", None),
                    attempts: 0,
                    reason: "injected".into(),
                });
            }
            self.sends.lock().await.push(recipients.to_vec());
            Ok(())
        }
        async fn send_encryption_key_request(
            &self,
            _recipient: &Participant,
            _group_call_id: &VoipId,
            _sender_device_id: &str,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn ladder(messenger: Arc<RecordingMessenger>) -> KeyLadder {
        KeyLadder::new(
            Participant::new("local", Some("dev0".to_string())),
            "dev0".to_string(),
            VoipId::new("!room:hs", "call1"),
            Arc::new(GroupCallConfig::default()),
            Arc::new(NullKeyProvider),
            messenger,
        )
    }

    #[tokio::test]
    async fn index_cycles_modulo_sixteen() {
        let messenger = Arc::new(RecordingMessenger {
            sends: Mutex::new(Vec::new()),
            fail_first_n: AtomicUsize::new(0),
        });
        let mut l = ladder(messenger);
        for _ in 0..16 {
            l.make_new_sender_key(false, &[]).await.unwrap();
        }
        assert_eq!(l.latest_local_key_index(), 15);
        l.make_new_sender_key(false, &[]).await.unwrap();
        assert_eq!(l.latest_local_key_index(), 0);
        assert_eq!(l.rings.len(), 1);
        assert_eq!(l.rings[&l.local.canonical_id()].keys.len(), 16);
    }

    #[tokio::test]
    async fn delayed_install_keeps_current_behind_latest() {
        let messenger = Arc::new(RecordingMessenger {
            sends: Mutex::new(Vec::new()),
            fail_first_n: AtomicUsize::new(0),
        });
        let mut l = ladder(messenger);
        tokio::time::pause();
        let handle = tokio::spawn(async move {
            l.make_new_sender_key(true, &[]).await.unwrap();
            l
        });
        tokio::time::advance(std::time::Duration::from_millis(1)).await;
        tokio::task::yield_now().await;
        // current index hasn't advanced yet; advance past the delay.
        tokio::time::advance(GroupCallConfig::default().use_key_delay + std::time::Duration::from_millis(1)).await;
        let l = handle.await.unwrap();
        assert_eq!(l.current_local_key_index(), l.latest_local_key_index());
    }

    #[tokio::test]
    async fn send_retries_then_succeeds_within_cap() {
        let messenger = Arc::new(RecordingMessenger {
            sends: Mutex::new(Vec::new()),
            fail_first_n: AtomicUsize::new(2),
        });
        let mut l = ladder(messenger.clone());
        l.make_new_sender_key(false, &[Participant::new("r", None)]).await.unwrap();
        assert_eq!(messenger.sends.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn send_fails_permanently_past_retry_cap() {
        let messenger = Arc::new(RecordingMessenger {
            sends: Mutex::new(Vec::new()),
            fail_first_n: AtomicUsize::new(10),
        });
        let mut l = ladder(messenger);
        let err = l
            .make_new_sender_key(false, &[Participant::new("r", None)])
            .await
            .unwrap_err();
        assert!(matches!(err, GroupCallError::TransientSendFailure { .. }));
    }

    #[tokio::test]
    async fn key_request_rejected_for_mismatched_room() {
        let messenger = Arc::new(RecordingMessenger {
            sends: Mutex::new(Vec::new()),
            fail_first_n: AtomicUsize::new(0),
        });
        let mut l = ladder(messenger.clone());
        l.make_new_sender_key(false, &[]).await.unwrap();
        l.on_call_encryption_key_request(Participant::new("r", None), "!other:hs", true)
            .await
            .unwrap();
        assert_eq!(messenger.sends.lock().await.len(), 1); // only the original broadcast send
    }
}
