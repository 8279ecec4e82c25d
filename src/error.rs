//
// Copyright (C) 2019 Signal Messenger, LLC.
// All rights reserved.
//
// SPDX-License-Identifier: GPL-3.0-only
//

//! Error taxonomy for the group call core.
//!
//! One variant per kind named in the error-handling design: operations fail
//! loudly to their caller, timers log and keep re-arming, and malformed
//! inbound data is dropped at the edge rather than propagated as an error.

use thiserror::Error;

use crate::ids::{Participant, VoipId};

/// Platform-independent error conditions raised by the group call core.
#[derive(Error, Debug)]
pub enum GroupCallError {
    #[error("precondition violated calling {method} in state {state}")]
    PreconditionViolation { method: &'static str, state: String },

    #[error("failed to acquire local media: {0}")]
    MediaAcquisitionFailed(String),

    #[error("failed to start or stop screensharing: {0}")]
    ScreenshareFailed(String),

    #[error("no peer call found for participant {0}")]
    PeerCallMissing(Participant),

    #[error("malformed event dropped: {0}")]
    MalformedEvent(String),

    #[error("device-to-device send to {recipient} failed after {attempts} attempts: {reason}")]
    TransientSendFailure {
        recipient: Participant,
        attempts: u32,
        reason: String,
    },

    #[error("rejected incoming call for stale or mismatched session (group call {0})")]
    StaleSession(VoipId),

    #[error("group call {0} already registered with the owning registry")]
    AlreadyRegistered(VoipId),
}

pub type Result<T> = std::result::Result<T, GroupCallError>;
