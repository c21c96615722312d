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
    collections::HashMap,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use vodozemac::megolm::{
    GroupSession, InboundGroupSessionPickle, MegolmMessage, SessionConfig, SessionKey,
};

use crate::error::{CryptoError, Error, Result};

const ROTATION_PERIOD: Duration = Duration::from_millis(604_800_000);
const ROTATION_MESSAGES: u64 = 100;

/// Rotation policy of an outbound group session.
#[derive(Clone, Copy, Debug)]
pub struct EncryptionSettings {
    /// How long the session should be used before changing it.
    pub rotation_period: Duration,
    /// How many messages should be sent before changing the session.
    pub rotation_period_msgs: u64,
}

impl Default for EncryptionSettings {
    fn default() -> Self {
        Self { rotation_period: ROTATION_PERIOD, rotation_period_msgs: ROTATION_MESSAGES }
    }
}

/// Outbound group session.
///
/// One per room; it encrypts the room messages this device sends. The
/// session expires after a week, after a hundred messages, or when the
/// room's member set changes, whichever comes first.
pub struct OutboundGroupSession {
    inner: GroupSession,
    room_id: String,
    session_id: String,
    creation_time: Instant,
    message_count: u64,
    settings: EncryptionSettings,
    invalidated: bool,
}

impl std::fmt::Debug for OutboundGroupSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundGroupSession")
            .field("room_id", &self.room_id)
            .field("session_id", &self.session_id)
            .field("creation_time", &self.creation_time)
            .field("message_count", &self.message_count)
            .field("settings", &self.settings)
            .field("invalidated", &self.invalidated)
            .finish()
    }
}

impl OutboundGroupSession {
    pub(crate) fn new(room_id: &str, settings: EncryptionSettings) -> Self {
        let inner = GroupSession::new(SessionConfig::version_1());

        Self {
            session_id: inner.session_id(),
            inner,
            room_id: room_id.to_owned(),
            creation_time: Instant::now(),
            message_count: 0,
            settings,
            invalidated: false,
        }
    }

    /// The room this session encrypts for.
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// The unique id of this session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The current ratchet index; 0 until the first message is sent.
    pub fn message_index(&self) -> u32 {
        self.inner.message_index()
    }

    /// The exportable session key at the current ratchet position.
    pub(crate) fn session_key(&self) -> String {
        self.inner.session_key().to_base64()
    }

    /// Mark the session as unusable, e.g. because the room members
    /// changed.
    pub fn invalidate(&mut self) {
        self.invalidated = true;
    }

    /// Whether the rotation policy demands a fresh session.
    pub fn expired(&self) -> bool {
        self.invalidated
            || self.message_count >= self.settings.rotation_period_msgs
            || self.creation_time.elapsed() >= self.settings.rotation_period
    }

    /// Encrypt a message, returning the unpadded base64 ciphertext.
    pub(crate) fn encrypt(&mut self, plaintext: &str) -> String {
        self.message_count += 1;
        self.inner.encrypt(plaintext).to_base64()
    }
}

/// Inbound group session.
///
/// Keyed by (room, sender key, session id); decrypts the room messages a
/// single outbound session produced. Each delivered ratchet index is
/// remembered so replayed indices with differing ciphertext are rejected.
pub(crate) struct InboundGroupSession {
    inner: vodozemac::megolm::InboundGroupSession,
    room_id: String,
    session_id: String,
    sender_key: String,
    signing_key: Option<String>,
    forwarding_chains: Vec<String>,
    imported: bool,
    seen_indices: HashMap<u32, [u8; 32]>,
}

impl std::fmt::Debug for InboundGroupSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundGroupSession")
            .field("room_id", &self.room_id)
            .field("session_id", &self.session_id)
            .field("sender_key", &self.sender_key)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize, Serialize)]
struct PickledInboundGroupSession {
    room_id: String,
    session_id: String,
    sender_key: String,
    signing_key: Option<String>,
    forwarding_chains: Vec<String>,
    imported: bool,
    pickle: String,
    /// Ciphertext fingerprint per delivered ratchet index; the replay
    /// guard has to survive a restore.
    #[serde(default)]
    seen_indices: HashMap<u32, [u8; 32]>,
}

impl InboundGroupSession {
    /// Create a session from an `m.room_key` session key.
    pub(crate) fn new(
        room_id: &str,
        sender_key: &str,
        signing_key: Option<&str>,
        session_key: &str,
    ) -> Result<Self, CryptoError> {
        let session_key = SessionKey::from_base64(session_key)?;
        let inner =
            vodozemac::megolm::InboundGroupSession::new(&session_key, SessionConfig::version_1());

        Ok(Self {
            session_id: inner.session_id(),
            inner,
            room_id: room_id.to_owned(),
            sender_key: sender_key.to_owned(),
            signing_key: signing_key.map(str::to_owned),
            forwarding_chains: Vec::new(),
            imported: false,
            seen_indices: HashMap::new(),
        })
    }

    /// Create a session from an `m.forwarded_room_key` exported key.
    ///
    /// The device that forwarded the key is appended to the forwarding
    /// chain.
    pub(crate) fn from_forwarded_key(
        room_id: &str,
        sender_key: &str,
        claimed_sender_key: &str,
        signing_key: Option<&str>,
        exported_key: &str,
        mut forwarding_chains: Vec<String>,
    ) -> Result<Self, CryptoError> {
        let key = vodozemac::megolm::ExportedSessionKey::from_base64(exported_key)?;
        let inner =
            vodozemac::megolm::InboundGroupSession::import(&key, SessionConfig::version_1());

        forwarding_chains.push(sender_key.to_owned());

        Ok(Self {
            session_id: inner.session_id(),
            inner,
            room_id: room_id.to_owned(),
            sender_key: claimed_sender_key.to_owned(),
            signing_key: signing_key.map(str::to_owned),
            forwarding_chains,
            imported: true,
            seen_indices: HashMap::new(),
        })
    }

    pub(crate) fn room_id(&self) -> &str {
        &self.room_id
    }

    pub(crate) fn session_id(&self) -> &str {
        &self.session_id
    }

    pub(crate) fn sender_key(&self) -> &str {
        &self.sender_key
    }

    /// Decrypt a Megolm ciphertext, returning the plaintext and its
    /// ratchet index.
    ///
    /// The same index delivered twice with identical ciphertext is
    /// idempotent; differing ciphertext on a known index is a replay and
    /// fails with [`CryptoError::DuplicateMessageIndex`].
    pub(crate) fn decrypt(&mut self, ciphertext: &str) -> Result<(String, u32), CryptoError> {
        let message = MegolmMessage::from_base64(ciphertext)?;
        let decrypted = self.inner.decrypt(&message)?;

        let fingerprint: [u8; 32] = Sha256::digest(ciphertext.as_bytes()).into();
        let index = decrypted.message_index;

        match self.seen_indices.get(&index) {
            Some(seen) if *seen != fingerprint => {
                return Err(CryptoError::DuplicateMessageIndex {
                    index,
                    session_id: self.session_id.clone(),
                });
            }
            _ => {
                self.seen_indices.insert(index, fingerprint);
            }
        }

        let plaintext = String::from_utf8(decrypted.plaintext)
            .map_err(|_| CryptoError::MalformedEvent("non-UTF-8 plaintext"))?;

        Ok((plaintext, index))
    }

    /// Serialize for the state store.
    pub(crate) fn to_blob(&self, pickle_key: &[u8; 32]) -> String {
        let pickled = PickledInboundGroupSession {
            room_id: self.room_id.clone(),
            session_id: self.session_id.clone(),
            sender_key: self.sender_key.clone(),
            signing_key: self.signing_key.clone(),
            forwarding_chains: self.forwarding_chains.clone(),
            imported: self.imported,
            pickle: self.inner.pickle().encrypt(pickle_key),
            seen_indices: self.seen_indices.clone(),
        };

        serde_json::to_string(&pickled).expect("pickled group sessions always serialize")
    }

    /// Restore a session from a state store blob.
    pub(crate) fn from_blob(blob: &str, pickle_key: &[u8; 32]) -> Result<Self> {
        let pickled: PickledInboundGroupSession = serde_json::from_str(blob)
            .map_err(|e| Error::PickleFormat(format!("bad group session blob: {e}")))?;

        let pickle = InboundGroupSessionPickle::from_encrypted(&pickled.pickle, pickle_key)
            .map_err(|e| Error::PickleFormat(format!("bad group session pickle: {e}")))?;
        let inner = vodozemac::megolm::InboundGroupSession::from_pickle(pickle);

        Ok(Self {
            session_id: inner.session_id(),
            inner,
            room_id: pickled.room_id,
            sender_key: pickled.sender_key,
            signing_key: pickled.signing_key,
            forwarding_chains: pickled.forwarding_chains,
            imported: pickled.imported,
            seen_indices: pickled.seen_indices,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOM_ID: &str = "!room:example.org";
    const SENDER_KEY: &str = "9pCQChgCKXNAKSDGNYFnPUSCNMNTliMvOjCx4A1Y1Bs";

    fn session_pair() -> (OutboundGroupSession, InboundGroupSession) {
        let outbound = OutboundGroupSession::new(ROOM_ID, EncryptionSettings::default());
        let inbound =
            InboundGroupSession::new(ROOM_ID, SENDER_KEY, None, &outbound.session_key()).unwrap();

        (outbound, inbound)
    }

    #[test]
    fn group_round_trip() {
        let (mut outbound, mut inbound) = session_pair();
        assert_eq!(outbound.session_id(), inbound.session_id());
        assert_eq!(outbound.message_index(), 0);

        let ciphertext = outbound.encrypt("hello room");
        let (plaintext, index) = inbound.decrypt(&ciphertext).unwrap();

        assert_eq!(plaintext, "hello room");
        assert_eq!(index, 0);
    }

    #[test]
    fn replayed_index_with_same_ciphertext_is_idempotent() {
        let (mut outbound, mut inbound) = session_pair();
        let ciphertext = outbound.encrypt("hello");

        assert!(inbound.decrypt(&ciphertext).is_ok());
        assert!(inbound.decrypt(&ciphertext).is_ok());
    }

    #[test]
    fn differing_ciphertext_on_known_index_is_rejected() {
        let (mut outbound, mut inbound) = session_pair();

        // Snapshot the ratchet so a second message can be produced at the
        // same index.
        let snapshot = outbound.inner.pickle();

        let ciphertext = outbound.encrypt("real message");
        inbound.decrypt(&ciphertext).unwrap();

        let mut rewound = GroupSession::from_pickle(snapshot);
        let forged = rewound.encrypt("imposter msg").to_base64();

        assert!(matches!(
            inbound.decrypt(&forged),
            Err(CryptoError::DuplicateMessageIndex { index: 0, .. })
        ));
    }

    #[test]
    fn rotation_policy() {
        let settings = EncryptionSettings { rotation_period_msgs: 2, ..Default::default() };
        let mut outbound = OutboundGroupSession::new(ROOM_ID, settings);

        assert!(!outbound.expired());
        outbound.encrypt("one");
        assert!(!outbound.expired());
        outbound.encrypt("two");
        assert!(outbound.expired());

        let mut fresh = OutboundGroupSession::new(ROOM_ID, EncryptionSettings::default());
        assert!(!fresh.expired());
        fresh.invalidate();
        assert!(fresh.expired());
    }

    #[test]
    fn blobs_restore_the_replay_window_state() {
        let (mut outbound, mut inbound) = session_pair();
        let pickle_key = [3u8; 32];

        let snapshot = outbound.inner.pickle();
        let first = outbound.encrypt("one");
        inbound.decrypt(&first).unwrap();

        let blob = inbound.to_blob(&pickle_key);
        let mut restored = InboundGroupSession::from_blob(&blob, &pickle_key).unwrap();

        assert_eq!(restored.session_id(), inbound.session_id());
        assert_eq!(restored.room_id(), ROOM_ID);
        assert_eq!(restored.sender_key(), SENDER_KEY);

        // A redelivery of the consumed index is still idempotent...
        assert!(restored.decrypt(&first).is_ok());

        // ...and a forged ciphertext at that index is still rejected, the
        // guard survived the round trip through the store.
        let mut rewound = GroupSession::from_pickle(snapshot);
        let forged = rewound.encrypt("imposter msg").to_base64();
        assert!(matches!(
            restored.decrypt(&forged),
            Err(CryptoError::DuplicateMessageIndex { index: 0, .. })
        ));

        let second = outbound.encrypt("two");
        let (plaintext, index) = restored.decrypt(&second).unwrap();
        assert_eq!(plaintext, "two");
        assert_eq!(index, 1);
    }
}
