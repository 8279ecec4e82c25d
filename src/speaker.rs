//
// Copyright (C) 2019 Signal Messenger, LLC.
// All rights reserved.
//
// SPDX-License-Identifier: GPL-3.0-only
//

//! Active Speaker Detector: periodically polls audio-level statistics from
//! peer media transports and tracks the running argmax.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::events::EventBus;
use crate::ids::Participant;
use crate::peer_calls::PeerCallTable;
use crate::streams::StreamRegistry;

/// Owns the per-participant audio-level map and the current active speaker,
/// and the polling timer that keeps both up to date.
pub struct ActiveSpeakerDetector {
    levels: Mutex<HashMap<String, f64>>, // keyed by participant canonical id
    participants: Mutex<HashMap<String, Participant>>,
    current: Mutex<Option<Participant>>,
    timer: Mutex<Option<JoinHandle<()>>>,
    events: Arc<EventBus>,
}

impl ActiveSpeakerDetector {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            levels: Mutex::new(HashMap::new()),
            participants: Mutex::new(HashMap::new()),
            current: Mutex::new(None),
            timer: Mutex::new(None),
            events,
        }
    }

    pub async fn current(&self) -> Option<Participant> {
        self.current.lock().await.clone()
    }

    /// One polling cycle: reads every non-local peer call's audio levels,
    /// updates the running map, and recomputes the argmax.
    pub async fn tick(&self, calls: &PeerCallTable, streams: &StreamRegistry) {
        for stream in streams.user_media_streams().await {
            if stream.is_local {
                continue;
            }
            let Some(call) = calls.get_for_participant(&stream.participant) else {
                continue;
            };
            match call.audio_levels().await {
                Ok(report) => {
                    if let Some(level) = report.remote_audio_level {
                        self.record(stream.participant.clone(), level).await;
                    }
                }
                Err(err) => {
                    log::warn!("failed reading audio levels for {}: {err}", stream.participant);
                }
            }
        }
        self.recompute_and_emit().await;
    }

    async fn record(&self, participant: Participant, level: f64) {
        let key = participant.canonical_id();
        self.levels.lock().await.insert(key.clone(), level);
        self.participants.lock().await.insert(key, participant);
    }

    async fn recompute_and_emit(&self) {
        let levels = self.levels.lock().await;
        let participants = self.participants.lock().await;
        let argmax = levels
            .iter()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(key, _)| key.clone());
        let new_speaker = argmax.and_then(|key| participants.get(&key).cloned());
        drop(levels);
        drop(participants);

        let mut current = self.current.lock().await;
        if new_speaker != *current {
            *current = new_speaker.clone();
            drop(current);
            self.events.on_active_speaker_changed.publish(new_speaker);
        }
    }

    /// Called when a local stream is removed and it was the active speaker:
    /// falls back to the first remaining user-media stream's participant.
    pub async fn fall_back_to_first_remaining(&self, streams: &StreamRegistry) {
        let fallback = streams
            .user_media_streams()
            .await
            .into_iter()
            .find(|s| !s.is_local)
            .map(|s| s.participant);
        let mut current = self.current.lock().await;
        if *current != fallback {
            *current = fallback.clone();
            drop(current);
            self.events.on_active_speaker_changed.publish(fallback);
        }
    }

    /// Arms the repeating poll timer at `interval`.
    pub async fn start(self: &Arc<Self>, interval: std::time::Duration, calls: Arc<Mutex<PeerCallTable>>, streams: Arc<StreamRegistry>) {
        self.stop().await;
        let this = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let calls = calls.lock().await;
                this.tick(&calls, &streams).await;
            }
        });
        *self.timer.lock().await = Some(handle);
    }

    /// Cancels the poll timer and clears state; further ticks are
    /// suppressed until the next `start()`.
    pub async fn stop(&self) {
        if let Some(handle) = self.timer.lock().await.take() {
            handle.abort();
        }
        self.levels.lock().await.clear();
        self.participants.lock().await.clear();
        *self.current.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::{StreamPurpose, WrappedMediaStream};
    use async_trait::async_trait;

    #[derive(Debug)]
    struct NullHandle;
    impl crate::external::MediaHandle for NullHandle {
        fn stop(&self) {}
    }

    struct NullTransport {
        remote_level: f64,
    }
    #[async_trait]
    impl crate::external::MediaTransport for NullTransport {
        async fn place_call_with_streams(
            &self,
            _call_id: &str,
            _direction: crate::peer_calls::CallDirection,
            _call_type: crate::peer_calls::CallType,
            _ice_servers: &[crate::peer_calls::IceServer],
        ) -> crate::error::Result<()> {
            Ok(())
        }
        async fn answer_with_streams(&self, _call_id: &str) -> crate::error::Result<()> {
            Ok(())
        }
        async fn hangup(&self, _call_id: &str, _reason: crate::peer_calls::HangupReason, _should_emit: bool) {}
        async fn get_audio_levels(&self, _call_id: &str) -> crate::error::Result<crate::external::AudioLevelReport> {
            Ok(crate::external::AudioLevelReport {
                remote_audio_level: Some(self.remote_level),
                local_audio_level: None,
            })
        }
    }

    #[tokio::test]
    async fn argmax_tracks_loudest_and_emits_on_change() {
        let events = Arc::new(EventBus::new());
        let detector = ActiveSpeakerDetector::new(events.clone());
        let mut watcher = events.on_active_speaker_changed.subscribe();

        let stream_registry = StreamRegistry::new();
        let quiet = Participant::new("quiet", Some("d1".to_string()));
        let loud = Participant::new("loud", Some("d2".to_string()));
        stream_registry
            .add(WrappedMediaStream::new(quiet.clone(), StreamPurpose::UserMedia, false, Arc::new(NullHandle)))
            .await;
        stream_registry
            .add(WrappedMediaStream::new(loud.clone(), StreamPurpose::UserMedia, false, Arc::new(NullHandle)))
            .await;

        let mut table = PeerCallTable::new(Arc::new(StreamRegistry::new()));
        table
            .add(Arc::new(crate::peer_calls::PeerCall::new(
                "c1".into(),
                quiet.clone(),
                "s1".into(),
                crate::peer_calls::CallDirection::Outgoing,
                crate::peer_calls::CallType::Voice,
                Arc::new(NullTransport { remote_level: 0.1 }),
            )))
            .await;
        table
            .add(Arc::new(crate::peer_calls::PeerCall::new(
                "c2".into(),
                loud.clone(),
                "s2".into(),
                crate::peer_calls::CallDirection::Outgoing,
                crate::peer_calls::CallType::Voice,
                Arc::new(NullTransport { remote_level: 0.9 }),
            )))
            .await;

        detector.tick(&table, &stream_registry).await;
        assert_eq!(detector.current().await, Some(loud));
        watcher.changed().await.unwrap();
        assert_eq!(*watcher.borrow(), Some(Some(Participant::new("loud", Some("d2".to_string())))));
    }
}
