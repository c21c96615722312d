// Copyright 2024 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The cryptographic and network core of a Matrix chat client.
//!
//! This crate implements the three subsystems an end-to-end encrypted
//! Matrix client builds on:
//!
//! * [`Enc`], the encryption engine: identity keys, one-time keys, Olm
//!   pair sessions, Megolm group sessions, canonical-JSON signing and
//!   verification, and SAS device verification. State persists through an
//!   opaque [`StateStore`] capability and a caller-keyed pickle.
//! * [`MediaStream`], a filter over any byte stream that transparently
//!   encrypts or decrypts Matrix media with AES-256-CTR while keeping a
//!   SHA-256 of the ciphertext.
//! * [`Net`], a prioritized HTTP transport: JSON and binary requests with
//!   authentication, rate-limit hints, cancellation, and streaming file
//!   transfer through the media cipher.
//!
//! Room state, timelines and account management live in higher layers.

#![warn(missing_docs)]

pub mod canonical_json;
mod crypto;
pub mod error;
pub mod events;
mod media_stream;
mod net;
mod pusher;
mod room_message;
mod store;
pub mod utils;

pub use crypto::{
    ClaimedOneTimeKey, Enc, EncryptionSettings, OutboundGroupSession, Sas, SasStrings,
    ALGORITHM_MEGOLM, ALGORITHM_OLM,
};
pub use error::{Error, MatrixErrorCode, Result};
pub use events::EventType;
pub use media_stream::MediaStream;
pub use net::{Net, Priority, ProgressCallback, Upload};
pub use pusher::{Pusher, PusherKind};
pub use room_message::{MessageType, RoomMessage};
pub use store::{EncryptedFileInfo, MemoryStore, StateStore};
pub use utils::{Canceller, SecretString};
