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

//! Wrappers over the Olm and Megolm ratchet primitives.

mod group_sessions;
mod session;

pub use group_sessions::{EncryptionSettings, OutboundGroupSession};
pub(crate) use group_sessions::InboundGroupSession;
pub(crate) use session::{olm_message_from_parts, Session};

/// The group messaging algorithm.
pub const ALGORITHM_MEGOLM: &str = "m.megolm.v1.aes-sha2";
/// The pair messaging algorithm.
pub const ALGORITHM_OLM: &str = "m.olm.v1.curve25519-aes-sha2";
