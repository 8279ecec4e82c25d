//
// Copyright (C) 2019 Signal Messenger, LLC.
// All rights reserved.
//
// SPDX-License-Identifier: GPL-3.0-only
//

//! Stream Registry: tracks local and remote user-media and screenshare
//! streams keyed by participant, emitting add/replace/remove events.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::events::EventBus;
use crate::external::MediaHandle;
use crate::ids::Participant;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum StreamPurpose {
    UserMedia,
    Screenshare,
}

#[derive(Clone, Debug)]
pub struct WrappedMediaStream {
    pub participant: Participant,
    pub purpose: StreamPurpose,
    pub audio_muted: bool,
    pub video_muted: bool,
    pub is_local: bool,
    handle: Arc<dyn MediaHandle>,
}

impl WrappedMediaStream {
    pub fn new(
        participant: Participant,
        purpose: StreamPurpose,
        is_local: bool,
        handle: Arc<dyn MediaHandle>,
    ) -> Self {
        Self {
            participant,
            purpose,
            audio_muted: false,
            video_muted: false,
            is_local,
            handle,
        }
    }

    /// Stops the underlying handle. Safe to call more than once on the
    /// registry's behalf; the [`MediaHandle`] contract requires `stop` to be
    /// idempotent.
    fn stop(&self) {
        self.handle.stop();
    }
}

#[derive(Default)]
struct Lists {
    user_media: Vec<WrappedMediaStream>,
    screenshare: Vec<WrappedMediaStream>,
}

impl Lists {
    fn list_mut(&mut self, purpose: StreamPurpose) -> &mut Vec<WrappedMediaStream> {
        match purpose {
            StreamPurpose::UserMedia => &mut self.user_media,
            StreamPurpose::Screenshare => &mut self.screenshare,
        }
    }

    fn list(&self, purpose: StreamPurpose) -> &Vec<WrappedMediaStream> {
        match purpose {
            StreamPurpose::UserMedia => &self.user_media,
            StreamPurpose::Screenshare => &self.screenshare,
        }
    }
}

/// Holds `userMediaStreams` and `screenshareStreams`, ordered sequences
/// indexed by participant canonical id.
pub struct StreamRegistry {
    lists: Mutex<Lists>,
    events: Arc<EventBus>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self {
            lists: Mutex::new(Lists::default()),
            events: Arc::new(EventBus::new()),
        }
    }

    pub fn with_events(events: Arc<EventBus>) -> Self {
        Self {
            lists: Mutex::new(Lists::default()),
            events,
        }
    }

    /// Adds a stream, replacing any existing one for the same participant
    /// and purpose. Emits `{userMedia,screenshare}StreamsChanged`, and
    /// `streamAdded` unless this is a purely local addition.
    pub async fn add(&self, stream: WrappedMediaStream) {
        let purpose = stream.purpose;
        let is_local = stream.is_local;
        let participant = stream.participant.clone();
        {
            let mut lists = self.lists.lock().await;
            let list = lists.list_mut(purpose);
            if let Some(existing) = list.iter().position(|s| s.participant == participant) {
                list[existing].stop();
                list[existing] = stream.clone();
            } else {
                list.push(stream.clone());
            }
        }
        self.events.on_group_call_feeds_changed.publish(0);
        if !is_local {
            self.events.on_stream_add.publish(stream);
        }
        log::debug!("stream added for {participant} ({purpose:?})");
    }

    /// Replaces the stream for `participant`/`purpose` if present; a no-op
    /// otherwise (mirrors `add`'s in-place replacement but never inserts).
    pub async fn replace(&self, stream: WrappedMediaStream) {
        let purpose = stream.purpose;
        let participant = stream.participant.clone();
        let mut replaced = false;
        {
            let mut lists = self.lists.lock().await;
            let list = lists.list_mut(purpose);
            if let Some(existing) = list.iter().position(|s| s.participant == participant) {
                list[existing].stop();
                list[existing] = stream.clone();
                replaced = true;
            }
        }
        if replaced {
            self.events.on_group_call_feeds_changed.publish(0);
        }
    }

    /// Removes the stream for `participant`/`purpose`. Stops the underlying
    /// handle only if it was local. Idempotent.
    pub async fn remove(&self, participant: &Participant, purpose: StreamPurpose) {
        let removed = {
            let mut lists = self.lists.lock().await;
            let list = lists.list_mut(purpose);
            let idx = list.iter().position(|s| &s.participant == participant);
            idx.map(|i| list.remove(i))
        };
        if let Some(stream) = removed {
            if stream.is_local {
                stream.stop();
            }
            self.events.on_group_call_feeds_changed.publish(0);
            if !stream.is_local {
                self.events.on_stream_removed.publish(stream);
            }
        }
    }

    /// Removes both the user-media and screenshare entries for a
    /// participant (used when a `PeerCall` leaves the table).
    pub async fn remove_all_for(&self, participant: &Participant) {
        self.remove(participant, StreamPurpose::UserMedia).await;
        self.remove(participant, StreamPurpose::Screenshare).await;
    }

    pub async fn user_media_streams(&self) -> Vec<WrappedMediaStream> {
        self.lists.lock().await.list(StreamPurpose::UserMedia).clone()
    }

    pub async fn screenshare_streams(&self) -> Vec<WrappedMediaStream> {
        self.lists.lock().await.list(StreamPurpose::Screenshare).clone()
    }

    pub async fn get(&self, participant: &Participant, purpose: StreamPurpose) -> Option<WrappedMediaStream> {
        self.lists
            .lock()
            .await
            .list(purpose)
            .iter()
            .find(|s| &s.participant == participant)
            .cloned()
    }

    /// Stops and clears every local stream; used by `leave()` so each local
    /// stream is stopped exactly once.
    pub async fn stop_all_local(&self) {
        let mut lists = self.lists.lock().await;
        for list in [&mut lists.user_media, &mut lists.screenshare] {
            list.retain(|s| {
                if s.is_local {
                    s.stop();
                    false
                } else {
                    true
                }
            });
        }
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct CountingHandle(Arc<AtomicUsize>);
    impl MediaHandle for CountingHandle {
        fn stop(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn add_then_remove_stops_local_stream_exactly_once() {
        let registry = StreamRegistry::new();
        let stops = Arc::new(AtomicUsize::new(0));
        let participant = Participant::new("me", Some("dev1".to_string()));
        let stream = WrappedMediaStream::new(
            participant.clone(),
            StreamPurpose::UserMedia,
            true,
            Arc::new(CountingHandle(stops.clone())),
        );
        registry.add(stream).await;
        registry.remove(&participant, StreamPurpose::UserMedia).await;
        assert_eq!(stops.load(Ordering::SeqCst), 1);

        // Idempotent: removing again does not double-stop.
        registry.remove(&participant, StreamPurpose::UserMedia).await;
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn remote_stream_removal_does_not_stop_handle() {
        let registry = StreamRegistry::new();
        let stops = Arc::new(AtomicUsize::new(0));
        let participant = Participant::new("them", Some("dev2".to_string()));
        let stream = WrappedMediaStream::new(
            participant.clone(),
            StreamPurpose::UserMedia,
            false,
            Arc::new(CountingHandle(stops.clone())),
        );
        registry.add(stream).await;
        registry.remove(&participant, StreamPurpose::UserMedia).await;
        assert_eq!(stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn add_replaces_existing_entry_for_same_participant() {
        let registry = StreamRegistry::new();
        let participant = Participant::new("them", Some("dev2".to_string()));
        let first = WrappedMediaStream::new(
            participant.clone(),
            StreamPurpose::UserMedia,
            false,
            Arc::new(CountingHandle(Arc::new(AtomicUsize::new(0)))),
        );
        registry.add(first).await;
        let second = WrappedMediaStream::new(
            participant.clone(),
            StreamPurpose::UserMedia,
            false,
            Arc::new(CountingHandle(Arc::new(AtomicUsize::new(0)))),
        );
        registry.add(second).await;
        assert_eq!(registry.user_media_streams().await.len(), 1);
    }
}
