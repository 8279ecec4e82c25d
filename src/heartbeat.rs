//
// Copyright (C) 2019 Signal Messenger, LLC.
// All rights reserved.
//
// SPDX-License-Identifier: GPL-3.0-only
//

//! Membership Heartbeat: periodically refreshes the local user's membership
//! entry with a fresh expiry, and retracts it on leave.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::GroupCallConfig;
use crate::error::Result;
use crate::external::RoomService;
use crate::membership::RawMembership;

/// Publishes and retracts the local membership entry on a timer. Owns the
/// repeating timer task; `leave()` cancels it via `abort()` rather than a
/// cooperative flag, so a timer never outlives the session that owns it.
pub struct MembershipHeartbeat {
    room_service: Arc<dyn RoomService>,
    config: Arc<GroupCallConfig>,
    room_id: String,
    user_id: String,
    call_id: String,
    device_id: String,
    application: String,
    scope: String,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl MembershipHeartbeat {
    pub fn new(
        room_service: Arc<dyn RoomService>,
        config: Arc<GroupCallConfig>,
        room_id: String,
        user_id: String,
        call_id: String,
        device_id: String,
        application: String,
        scope: String,
    ) -> Self {
        Self {
            room_service,
            config,
            room_id,
            user_id,
            call_id,
            device_id,
            application,
            scope,
            timer: Mutex::new(None),
        }
    }

    /// Writes a fresh membership entry for this device now, and returns the
    /// entry it just published so the caller can fold it straight into its
    /// own membership view instead of waiting on a separate room-state
    /// round trip to see its own membership.
    pub async fn send_member_state_event(&self) -> Result<RawMembership> {
        let mut memberships = self.room_service.load_memberships(&self.room_id, &self.user_id).await?;
        memberships.retain(|m| {
            !(m.call_id.as_deref() == Some(self.call_id.as_str())
                && m.device_id.as_deref() == Some(self.device_id.as_str())
                && m.application.as_deref() == Some(self.application.as_str())
                && m.scope.as_deref() == Some(self.scope.as_str()))
        });
        let expires_ts = now_ms() + self.config.expire_ts_bump.as_millis() as i64;
        let published = RawMembership {
            call_id: Some(self.call_id.clone()),
            device_id: Some(self.device_id.clone()),
            expires_ts: Some(expires_ts),
            foci_active: vec![serde_json::json!({"type": "mesh"})],
            application: Some(self.application.clone()),
            scope: Some(self.scope.clone()),
            membership_id: None,
        };
        memberships.push(published.clone());
        self.room_service
            .write_memberships(&self.room_id, &self.user_id, memberships)
            .await?;
        log::debug!("published membership for {} in {}, expires at {expires_ts}", self.user_id, self.room_id);
        Ok(published)
    }

    /// Retracts this device's membership entry.
    pub async fn remove_member_state_event(&self) -> Result<()> {
        let mut memberships = self.room_service.load_memberships(&self.room_id, &self.user_id).await?;
        memberships.retain(|m| {
            !(m.call_id.as_deref() == Some(self.call_id.as_str())
                && m.device_id.as_deref() == Some(self.device_id.as_str()))
        });
        self.room_service
            .write_memberships(&self.room_id, &self.user_id, memberships)
            .await?;
        log::info!("retracted membership for {} in {}", self.user_id, self.room_id);
        Ok(())
    }

    /// Arms the repeating refresh timer. `is_live` is polled on every tick;
    /// once it returns false the loop retracts the membership and stops
    /// instead of rearming, so a session that has ended (or never finished
    /// initializing its local feed) stops republishing on its own.
    pub async fn start<F>(self: &Arc<Self>, is_live: F)
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.stop().await;
        let this = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(this.config.update_expire_ts_timer).await;
                if !is_live() {
                    if let Err(err) = this.remove_member_state_event().await {
                        log::error!("failed retracting membership on heartbeat stop: {err}");
                    }
                    break;
                }
                if let Err(err) = this.send_member_state_event().await {
                    log::warn!("membership heartbeat tick failed, will retry next period: {err}");
                }
            }
        });
        *self.timer.lock().await = Some(handle);
    }

    /// Cancels the timer without retracting membership (used internally by
    /// `start` before rearming; `leave()` should call
    /// `remove_member_state_event` explicitly after this).
    pub async fn stop(&self) {
        if let Some(handle) = self.timer.lock().await.take() {
            handle.abort();
        }
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
