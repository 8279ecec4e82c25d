//
// Copyright (C) 2019 Signal Messenger, LLC.
// All rights reserved.
//
// SPDX-License-Identifier: GPL-3.0-only
//

//! Session Actor / Runtime: the single cooperative task runner each session
//! executes on. Public entry points enqueue a boxed closure onto an `mpsc`
//! command channel; one task drains the queue strictly in order, so a
//! `GroupCallSession`'s state never tears across a suspension point.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::error::Result;
use crate::events::EventBus;
use crate::external::{EncryptionKeyEntry, MediaTransport};
use crate::ids::{Participant, VoipId};
use crate::membership::RawMembership;
use crate::peer_calls::PeerCallState;
use crate::session::{GroupCallSession, GroupCallSessionDeps, GroupCallState};
use crate::streams::StreamRegistry;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type Command = Box<dyn FnOnce(Arc<GroupCallSession>) -> BoxFuture + Send>;

/// A handle to a session running on its own command-queue task. Cloning a
/// handle is cheap and shares the same underlying task and session.
#[derive(Clone)]
pub struct SessionHandle {
    session: Arc<GroupCallSession>,
    tx: mpsc::UnboundedSender<Command>,
}

impl SessionHandle {
    /// Constructs the session and spawns its single driving task.
    pub fn spawn(deps: GroupCallSessionDeps) -> Self {
        let session = GroupCallSession::new(deps);
        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
        let task_session = session.clone();
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                cmd(task_session.clone()).await;
            }
            log::debug!("session actor task for a group call exited");
        });
        Self { session, tx }
    }

    /// Enqueues `f` and awaits its reply via a one-shot channel, preserving
    /// program order against every other call already queued.
    async fn dispatch<T, F, Fut>(&self, f: F) -> T
    where
        F: FnOnce(Arc<GroupCallSession>) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let cmd: Command = Box::new(move |session| {
            Box::pin(async move {
                let result = f(session).await;
                let _ = reply_tx.send(result);
            })
        });
        // The task only ever exits when every handle (and the channel) is
        // dropped, so a send failure here would mean this handle outlived
        // its own task, which does not happen in normal operation.
        if self.tx.send(cmd).is_err() {
            log::error!("session actor task is gone; dropping queued command");
        }
        reply_rx.await.expect("session actor task dropped the reply channel without responding")
    }

    pub async fn init_local_stream(&self) -> Result<()> {
        self.dispatch(|session| async move { session.init_local_stream().await }).await
    }

    pub async fn enter(&self) -> Result<()> {
        self.dispatch(|session| async move { session.enter().await }).await
    }

    pub async fn leave(&self) -> Result<()> {
        self.dispatch(|session| async move { session.leave().await }).await
    }

    pub async fn on_room_membership_event(
        &self,
        user_id: String,
        origin_server_ts: i64,
        raw_memberships: Vec<RawMembership>,
    ) -> Result<()> {
        self.dispatch(move |session| async move {
            session.on_room_membership_event(&user_id, origin_server_ts, &raw_memberships).await
        })
        .await
    }

    pub async fn on_member_state_changed(&self) -> Result<()> {
        self.dispatch(|session| async move { session.on_member_state_changed().await }).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn on_incoming_call(
        &self,
        room_id: String,
        incoming_group_call_id: Option<VoipId>,
        remote: Participant,
        remote_session_id: String,
        incoming_call_id: String,
        incoming_state: PeerCallState,
        transport: Arc<dyn MediaTransport>,
    ) -> Result<()> {
        self.dispatch(move |session| async move {
            session
                .on_incoming_call(
                    &room_id,
                    incoming_group_call_id.as_ref(),
                    remote,
                    remote_session_id,
                    incoming_call_id,
                    incoming_state,
                    transport,
                )
                .await
        })
        .await
    }

    pub async fn set_screensharing_enabled(&self, enabled: bool) -> Result<()> {
        self.dispatch(move |session| async move { session.set_screensharing_enabled(enabled).await }).await
    }

    pub async fn on_call_encryption(&self, sender: Participant, keys: Vec<EncryptionKeyEntry>) {
        self.dispatch(move |session| async move { session.on_call_encryption(sender, &keys).await }).await
    }

    pub async fn on_call_encryption_key_request(&self, sender: Participant, requester_room_id: String) -> Result<()> {
        self.dispatch(move |session| async move {
            session.on_call_encryption_key_request(sender, &requester_room_id).await
        })
        .await
    }

    /// Read-only accessors bypass the queue: subscribing to a broadcast
    /// topic or reading the stream registry's current snapshot cannot tear
    /// session state, so there is no ordering requirement to preserve.
    pub fn events(&self) -> &Arc<EventBus> {
        self.session.events()
    }

    pub fn streams(&self) -> &Arc<StreamRegistry> {
        self.session.streams()
    }

    pub async fn state(&self) -> GroupCallState {
        self.session.state().await
    }
}
