//
// Copyright (C) 2019 Signal Messenger, LLC.
// All rights reserved.
//
// SPDX-License-Identifier: GPL-3.0-only
//

//! Core session logic for a federated-room group call: membership
//! tracking, full-mesh peer-call signaling, and the E2EE sender-key
//! ladder used when media is relayed through an SFU. Everything this
//! crate does not own outright — the WebRTC stack, the room transport,
//! the device-to-device channel, and the media encryptor — is expressed
//! as a trait in [`external`] and supplied by the embedder.

pub mod actor;
pub mod config;
pub mod error;
pub mod events;
pub mod external;
pub mod heartbeat;
pub mod ids;
pub mod keys;
pub mod membership;
pub mod peer_calls;
pub mod session;
pub mod speaker;
pub mod streams;

pub mod sim;

pub use actor::SessionHandle;
pub use config::GroupCallConfig;
pub use error::{GroupCallError, Result};
pub use ids::{Participant, VoipId};
pub use session::{GroupCallSession, GroupCallSessionDeps, GroupCallState};
