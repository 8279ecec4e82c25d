//
// Copyright (C) 2019 Signal Messenger, LLC.
// All rights reserved.
//
// SPDX-License-Identifier: GPL-3.0-only
//

//! Tunable constants threaded into a session at construction: one small
//! typed struct, built once and shared by reference across a session's
//! components, rather than scattered magic numbers.

use std::time::Duration;

/// How long a freshly published membership event remains valid before it is
/// considered expired, absent a refresh.
pub const DEFAULT_EXPIRE_TS_BUMP: Duration = Duration::from_secs(60);

/// Period of the membership heartbeat timer.
pub const DEFAULT_UPDATE_EXPIRE_TS_TIMER: Duration = Duration::from_secs(15);

/// Period of the active-speaker poller.
pub const DEFAULT_ACTIVE_SPEAKER_INTERVAL: Duration = Duration::from_millis(1000);

/// Debounce window used to coalesce simultaneous leavers before generating a
/// new sender key.
pub const DEFAULT_MAKE_KEY_DELAY: Duration = Duration::from_secs(5);

/// Delay between generating a sender key and actually switching the local
/// encryptor over to it, giving peers time to receive and install it first.
pub const DEFAULT_USE_KEY_DELAY: Duration = Duration::from_secs(5);

/// Bound on retrying a failed device-to-device send with the same recipient
/// set before surfacing `TransientSendFailure` instead of retrying forever.
pub const DEFAULT_MAX_SEND_RETRIES: u32 = 3;

#[derive(Clone, Debug)]
pub struct GroupCallConfig {
    pub expire_ts_bump: Duration,
    pub update_expire_ts_timer: Duration,
    pub active_speaker_interval: Duration,
    pub make_key_delay: Duration,
    pub use_key_delay: Duration,
    pub max_send_retries: u32,
    /// When true, a joining participant is caught up by ratcheting the
    /// current sender key forward rather than minting a brand-new one.
    pub enable_sfu_e2ee_key_ratcheting: bool,
}

impl Default for GroupCallConfig {
    fn default() -> Self {
        Self {
            expire_ts_bump: DEFAULT_EXPIRE_TS_BUMP,
            update_expire_ts_timer: DEFAULT_UPDATE_EXPIRE_TS_TIMER,
            active_speaker_interval: DEFAULT_ACTIVE_SPEAKER_INTERVAL,
            make_key_delay: DEFAULT_MAKE_KEY_DELAY,
            use_key_delay: DEFAULT_USE_KEY_DELAY,
            max_send_retries: DEFAULT_MAX_SEND_RETRIES,
            enable_sfu_e2ee_key_ratcheting: true,
        }
    }
}
