//
// Copyright (C) 2019 Signal Messenger, LLC.
// All rights reserved.
//
// SPDX-License-Identifier: GPL-3.0-only
//

//! Event Bus: a multi-consumer broadcast of lifecycle, participant, stream
//! and error events, where a late subscriber immediately sees the most
//! recently published value. Built on `tokio::sync::watch`, whose receiver
//! semantics already match that requirement exactly, rather than
//! reimplementing a cached-last-value wrapper over `broadcast`.

use tokio::sync::watch;

/// One named, observable stream of `T` values.
#[derive(Debug)]
pub struct Topic<T> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone> Topic<T> {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Publishes a new value; all current and future subscribers observe it.
    pub fn publish(&self, value: T) {
        let _ = self.tx.send(Some(value));
    }

    /// Subscribes to this topic. The returned receiver's `borrow()` is the
    /// cached latest value (`None` if nothing has published yet), so a
    /// subscriber joining after the fact still sees current state.
    pub fn subscribe(&self) -> watch::Receiver<Option<T>> {
        self.tx.subscribe()
    }
}

impl<T: Clone> Default for Topic<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Coarse-grained lifecycle events distinct from raw state transitions: a
/// separate "something notable happened" stream from the plain
/// "state changed" one.
#[derive(Clone, Debug, PartialEq)]
pub enum GroupCallEvent {
    Entered,
    ParticipantsChanged,
    ActiveSpeakerChanged,
    Error(String),
    Ended,
}

/// The bundle of named streams every [`crate::session::GroupCallSession`]
/// publishes through.
#[derive(Debug, Default)]
pub struct EventBus {
    pub on_group_call_state: Topic<crate::session::GroupCallState>,
    pub on_group_call_event: Topic<GroupCallEvent>,
    pub on_group_call_feeds_changed: Topic<u64>,
    pub on_stream_add: Topic<crate::streams::WrappedMediaStream>,
    pub on_stream_removed: Topic<crate::streams::WrappedMediaStream>,
    pub on_active_speaker_changed: Topic<Option<crate::ids::Participant>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }
}
