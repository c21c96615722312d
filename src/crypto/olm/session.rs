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

use std::{
    fmt,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use vodozemac::olm::{OlmMessage, SessionPickle};

use crate::{
    error::{CryptoError, Error, Result},
    media_stream::{decode_unpadded, encode_unpadded},
};

/// Message type tag of an Olm pre-key message on the wire.
pub(crate) const MESSAGE_TYPE_PRE_KEY: u64 = 0;
/// Message type tag of a normal Olm message on the wire.
pub(crate) const MESSAGE_TYPE_NORMAL: u64 = 1;

/// Cryptographic session that enables secure communication between two
/// accounts.
///
/// One session per remote device; a newer session with the same device
/// supersedes an older one.
pub(crate) struct Session {
    inner: vodozemac::olm::Session,
    session_id: String,
    /// The curve25519 key of the peer device.
    sender_key: String,
    creation_time: SystemTime,
    last_use_time: SystemTime,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("sender_key", &self.sender_key)
            .finish()
    }
}

/// The serialized form a session is handed to the state store in.
#[derive(Deserialize, Serialize)]
struct PickledSession {
    sender_key: String,
    session_id: String,
    pickle: String,
    created_at: u64,
    last_used_at: u64,
}

fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default()
}

impl Session {
    pub(crate) fn new(inner: vodozemac::olm::Session, sender_key: &str) -> Self {
        let session_id = inner.session_id();
        let now = SystemTime::now();

        Self {
            inner,
            session_id,
            sender_key: sender_key.to_owned(),
            creation_time: now,
            last_use_time: now,
        }
    }

    /// Returns the unique identifier for this session.
    pub(crate) fn session_id(&self) -> &str {
        &self.session_id
    }

    pub(crate) fn sender_key(&self) -> &str {
        &self.sender_key
    }

    pub(crate) fn creation_time(&self) -> SystemTime {
        self.creation_time
    }

    /// Encrypt `plaintext`, returning the wire message type and the
    /// unpadded base64 body.
    pub(crate) fn encrypt(&mut self, plaintext: &str) -> (u64, String) {
        self.last_use_time = SystemTime::now();

        match self.inner.encrypt(plaintext) {
            OlmMessage::PreKey(m) => (MESSAGE_TYPE_PRE_KEY, encode_unpadded(&m.to_bytes(), false)),
            OlmMessage::Normal(m) => (MESSAGE_TYPE_NORMAL, encode_unpadded(&m.to_bytes(), false)),
        }
    }

    /// Decrypt an Olm message.
    pub(crate) fn decrypt(&mut self, message: &OlmMessage) -> Result<String, CryptoError> {
        let plaintext = self.inner.decrypt(message)?;
        self.last_use_time = SystemTime::now();

        String::from_utf8(plaintext).map_err(|_| CryptoError::MalformedEvent("non-UTF-8 plaintext"))
    }

    /// Serialize for the state store, encrypting the ratchet state under
    /// `pickle_key`.
    pub(crate) fn to_blob(&self, pickle_key: &[u8; 32]) -> String {
        let pickled = PickledSession {
            sender_key: self.sender_key.clone(),
            session_id: self.session_id.clone(),
            pickle: self.inner.pickle().encrypt(pickle_key),
            created_at: unix_secs(self.creation_time),
            last_used_at: unix_secs(self.last_use_time),
        };

        serde_json::to_string(&pickled).expect("pickled sessions always serialize")
    }

    /// Restore a session from a state store blob.
    pub(crate) fn from_blob(blob: &str, pickle_key: &[u8; 32]) -> Result<Self> {
        let pickled: PickledSession = serde_json::from_str(blob)
            .map_err(|e| Error::PickleFormat(format!("bad session blob: {e}")))?;

        let pickle = SessionPickle::from_encrypted(&pickled.pickle, pickle_key)
            .map_err(|e| Error::PickleFormat(format!("bad session pickle: {e}")))?;
        let inner = vodozemac::olm::Session::from_pickle(pickle);

        Ok(Self {
            session_id: inner.session_id(),
            inner,
            sender_key: pickled.sender_key,
            creation_time: UNIX_EPOCH + std::time::Duration::from_secs(pickled.created_at),
            last_use_time: UNIX_EPOCH + std::time::Duration::from_secs(pickled.last_used_at),
        })
    }
}

/// Decode the `(type, body)` pair of an `m.room.encrypted` ciphertext
/// entry into an [`OlmMessage`].
pub(crate) fn olm_message_from_parts(
    message_type: u64,
    body: &str,
) -> Result<OlmMessage, CryptoError> {
    let bytes = decode_unpadded(body, false)
        .ok_or(CryptoError::MalformedEvent("ciphertext body is not base64"))?;

    match message_type {
        MESSAGE_TYPE_PRE_KEY => {
            let message = vodozemac::olm::PreKeyMessage::try_from(bytes.as_slice())?;
            Ok(OlmMessage::PreKey(message))
        }
        MESSAGE_TYPE_NORMAL => {
            let message = vodozemac::olm::Message::try_from(bytes.as_slice())?;
            Ok(OlmMessage::Normal(message))
        }
        _ => Err(CryptoError::MalformedEvent("unknown Olm message type")),
    }
}
