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

//! The encryption engine.
//!
//! [`Enc`] owns the long term identity of a device: its Curve25519 and
//! Ed25519 key pair, a pool of one-time keys, the Olm sessions towards
//! other devices and the Megolm group sessions of encrypted rooms. It
//! signs and verifies canonical JSON, decrypts to-device and room events
//! and drives short-authentication-string verification.

mod olm;
mod pickle;
mod verification;

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock},
};

use rand::RngCore;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use vodozemac::{olm::Account, olm::OlmMessage, Curve25519PublicKey, Ed25519PublicKey, Ed25519Signature};
use zeroize::Zeroizing;

pub use olm::{EncryptionSettings, OutboundGroupSession, ALGORITHM_MEGOLM, ALGORITHM_OLM};
pub use verification::{Sas, SasStrings};

use crate::{
    canonical_json::canonical_signable_json,
    error::{CryptoError, Error, Result},
    events::EventType,
    media_stream::encode_unpadded,
    store::{EncryptedFileInfo, StateStore},
    utils::SecretString,
};
use olm::{InboundGroupSession, Session};

/// (room id, sender curve25519 key, session id)
type InboundGroupKey = (String, String, String);

#[derive(Clone, Debug)]
struct Details {
    user_id: String,
    device_id: String,
}

/// A one-time key claimed from another device, used to establish an Olm
/// session with it.
#[derive(Clone, Debug)]
pub struct ClaimedOneTimeKey {
    /// The user the device belongs to.
    pub user_id: String,
    /// The device the key was claimed from.
    pub device_id: String,
    /// The device's Curve25519 identity key.
    pub curve25519_key: String,
    /// The device's Ed25519 signing key.
    pub ed25519_key: String,
    /// The claimed one-time Curve25519 key.
    pub one_time_key: String,
}

/// The encryption engine of one device.
///
/// The identity key pair is created (or restored from a pickle) on
/// construction and never changes afterwards; the user and device id are
/// bound once via [`set_details`](Self::set_details).
pub struct Enc {
    store: Option<Arc<dyn StateStore>>,
    account: Mutex<Account>,

    pickle_secret: SecretString,
    pickle_key: Zeroizing<[u8; 32]>,

    curve_key: String,
    ed_key: String,
    details: StdRwLock<Option<Details>>,

    /// Olm sessions, keyed by the peer device's curve25519 key.
    sessions: Mutex<HashMap<String, Vec<Session>>>,
    sessions_loaded: Mutex<bool>,

    /// Live outbound Megolm sessions, keyed by room id.
    out_group_sessions: Mutex<HashMap<String, OutboundGroupSession>>,

    /// Received inbound Megolm sessions.
    in_group_sessions: Mutex<HashMap<InboundGroupKey, InboundGroupSession>>,
    group_rooms_loaded: Mutex<HashSet<String>>,

    /// SAS verification flows by transaction id.
    sas_transactions: StdMutex<HashMap<String, Sas>>,
}

impl std::fmt::Debug for Enc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Enc")
            .field("curve25519_key", &self.curve_key)
            .field("ed25519_key", &self.ed_key)
            .field("details", &self.details.read().unwrap())
            .finish_non_exhaustive()
    }
}

impl Enc {
    /// Create an engine, either fresh or restored from a pickle.
    ///
    /// When `pickle` is given the matching `pickle_key` is required; a
    /// fresh random pickle key is generated otherwise. The key is retained
    /// for [`get_pickle`](Self::get_pickle).
    pub fn new(
        store: Option<Arc<dyn StateStore>>,
        pickle: Option<&str>,
        pickle_key: Option<&str>,
    ) -> Result<Self> {
        let pickle_secret = match pickle_key {
            Some(key) => SecretString::new(key),
            None => {
                if pickle.is_some() {
                    return Err(Error::PickleFormat("a pickle requires its pickle key".into()));
                }

                let mut bytes = Zeroizing::new([0u8; 32]);
                rand::thread_rng().fill_bytes(&mut *bytes);
                SecretString::new(encode_unpadded(&*bytes, false))
            }
        };

        let derived = pickle::derive_pickle_key(&pickle_secret);

        let account = match pickle {
            Some(pickle) => pickle::unpickle_account(pickle, &pickle_secret, &derived)?,
            None => Account::new(),
        };

        let curve_key = account.curve25519_key().to_base64();
        let ed_key = account.ed25519_key().to_base64();
        debug!(%curve_key, "created encryption engine");

        Ok(Self {
            store,
            account: Mutex::new(account),
            pickle_secret,
            pickle_key: derived,
            curve_key,
            ed_key,
            details: StdRwLock::new(None),
            sessions: Mutex::new(HashMap::new()),
            sessions_loaded: Mutex::new(false),
            out_group_sessions: Mutex::new(HashMap::new()),
            in_group_sessions: Mutex::new(HashMap::new()),
            group_rooms_loaded: Mutex::new(HashSet::new()),
            sas_transactions: StdMutex::new(HashMap::new()),
        })
    }

    /// Bind the engine to a user and device id.
    ///
    /// The identity is used for signing payloads and may only be set once.
    pub fn set_details(&self, user_id: &str, device_id: &str) -> Result<()> {
        let mut details = self.details.write().unwrap();

        if details.is_some() {
            return Err(CryptoError::IdentityAlreadySet.into());
        }

        *details = Some(Details { user_id: user_id.to_owned(), device_id: device_id.to_owned() });
        Ok(())
    }

    /// The bound user id.
    pub fn user_id(&self) -> Option<String> {
        self.details.read().unwrap().as_ref().map(|d| d.user_id.clone())
    }

    /// The bound device id.
    pub fn device_id(&self) -> Option<String> {
        self.details.read().unwrap().as_ref().map(|d| d.device_id.clone())
    }

    /// The long term Curve25519 identity key, unpadded base64.
    pub fn curve25519_key(&self) -> &str {
        &self.curve_key
    }

    /// The long term Ed25519 signing key, unpadded base64.
    pub fn ed25519_key(&self) -> &str {
        &self.ed_key
    }

    fn required_details(&self) -> Result<Details> {
        self.details
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| CryptoError::IdentityNotSet.into())
    }

    /// The current pickle of the account, newest format version.
    pub async fn get_pickle(&self) -> String {
        pickle::pickle_account(&*self.account.lock().await, &self.pickle_key)
    }

    /// The pickle key, as a secret buffer wiped on drop.
    pub fn get_pickle_key(&self) -> SecretString {
        self.pickle_secret.clone()
    }

    /// Sign a string with the Ed25519 identity key.
    pub async fn sign_string(&self, message: &str) -> String {
        self.account.lock().await.sign(message.as_bytes()).to_base64()
    }

    /// Sign the canonical signable form of `object` and attach the
    /// signature under `signatures[user_id]["ed25519:<device_id>"]`.
    pub async fn attach_signature(&self, object: &mut Value) -> Result<()> {
        let details = self.required_details()?;
        let signature = self.sign_string(&canonical_signable_json(object)).await;

        let root = object
            .as_object_mut()
            .ok_or(Error::Crypto(CryptoError::MalformedEvent("not an object")))?;

        let signatures = root
            .entry("signatures")
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
            .ok_or(Error::Crypto(CryptoError::MalformedEvent("bad signatures member")))?;

        let user_signatures = signatures
            .entry(details.user_id)
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
            .ok_or(Error::Crypto(CryptoError::MalformedEvent("bad signatures member")))?;

        user_signatures.insert(format!("ed25519:{}", details.device_id), signature.into());

        Ok(())
    }

    /// Verify the signature `user_id`/`device_id` left on `object`
    /// against `ed_key`.
    ///
    /// Returns true iff the signature is present, well-formed and valid
    /// over the canonical signable form of the object.
    pub fn verify(&self, object: &Value, user_id: &str, device_id: &str, ed_key: &str) -> bool {
        let canonical = canonical_signable_json(object);

        let signature = object
            .get("signatures")
            .and_then(|s| s.get(user_id))
            .and_then(|s| s.get(format!("ed25519:{device_id}")))
            .and_then(Value::as_str);

        let Some(signature) = signature else {
            return false;
        };

        let Ok(key) = Ed25519PublicKey::from_base64(ed_key) else {
            return false;
        };
        let Ok(signature) = Ed25519Signature::from_base64(signature) else {
            return false;
        };

        key.verify(canonical.as_bytes(), &signature).is_ok()
    }

    /// The largest number of one-time keys the account can hold.
    pub async fn max_one_time_keys(&self) -> usize {
        self.account.lock().await.max_number_of_one_time_keys()
    }

    /// Generate up to `count` one-time keys.
    ///
    /// The count is clamped so the unpublished pool stays at or below half
    /// of [`max_one_time_keys`](Self::max_one_time_keys), reserving room
    /// for keys claimed while an upload is in flight. Returns how many
    /// keys were actually created.
    pub async fn create_one_time_keys(&self, count: usize) -> usize {
        let mut account = self.account.lock().await;

        let reserve = account.max_number_of_one_time_keys() / 2;
        let pool = account.one_time_keys().len();
        let count = count.min(reserve.saturating_sub(pool));

        if count > 0 {
            account.generate_one_time_keys(count);
        }

        count
    }

    /// The signed upload payload for every generated-but-unpublished
    /// one-time key.
    pub async fn one_time_keys_json(&self) -> Result<Value> {
        let one_time_keys: Vec<(String, String)> = {
            let account = self.account.lock().await;
            account
                .one_time_keys()
                .iter()
                .map(|(id, key)| (id.to_base64(), key.to_base64()))
                .collect()
        };

        let mut root = Map::new();

        for (id, key) in one_time_keys {
            let mut signed = json!({ "key": key });
            self.attach_signature(&mut signed).await?;
            root.insert(format!("signed_curve25519:{id}"), signed);
        }

        Ok(Value::Object(root))
    }

    /// Mark the one-time keys as published.
    ///
    /// Has to be called exactly once per generated batch, after the
    /// upload succeeded.
    pub async fn publish_one_time_keys(&self) {
        self.account.lock().await.mark_keys_as_published();
    }

    /// The signed device keys upload payload.
    pub async fn device_keys_json(&self) -> Result<Value> {
        let details = self.required_details()?;

        let mut identity_keys = Map::new();
        identity_keys
            .insert(format!("curve25519:{}", details.device_id), self.curve_key.clone().into());
        identity_keys
            .insert(format!("ed25519:{}", details.device_id), self.ed_key.clone().into());

        let mut keys = json!({
            "user_id": details.user_id,
            "device_id": details.device_id,
            "algorithms": [ALGORITHM_OLM, ALGORITHM_MEGOLM],
            "keys": identity_keys,
        });

        self.attach_signature(&mut keys).await?;

        Ok(keys)
    }

    async fn ensure_sessions_loaded(&self) -> Result<()> {
        let mut loaded = self.sessions_loaded.lock().await;
        if *loaded {
            return Ok(());
        }

        if let Some(store) = &self.store {
            let blobs = store.load_sessions().await?;
            let mut sessions = self.sessions.lock().await;

            for blob in blobs {
                match Session::from_blob(&blob, &self.pickle_key) {
                    Ok(session) => {
                        sessions.entry(session.sender_key().to_owned()).or_default().push(session)
                    }
                    Err(e) => warn!("skipping unreadable session blob: {e}"),
                }
            }
        }

        *loaded = true;
        Ok(())
    }

    async fn ensure_group_sessions_loaded(&self, room_id: &str) -> Result<()> {
        let mut loaded = self.group_rooms_loaded.lock().await;
        if loaded.contains(room_id) {
            return Ok(());
        }

        if let Some(store) = &self.store {
            let blobs = store.load_group_sessions(room_id).await?;
            let mut sessions = self.in_group_sessions.lock().await;

            for blob in blobs {
                match InboundGroupSession::from_blob(&blob, &self.pickle_key) {
                    Ok(session) => {
                        let key = (
                            session.room_id().to_owned(),
                            session.sender_key().to_owned(),
                            session.session_id().to_owned(),
                        );
                        sessions.insert(key, session);
                    }
                    Err(e) => warn!(room_id, "skipping unreadable group session blob: {e}"),
                }
            }
        }

        loaded.insert(room_id.to_owned());
        Ok(())
    }

    async fn save_session_blob(&self, blob: String) -> Result<()> {
        if let Some(store) = &self.store {
            store.save_session(&blob).await?;
        }
        Ok(())
    }

    async fn save_group_session_blob(&self, room_id: &str, blob: String) -> Result<()> {
        if let Some(store) = &self.store {
            store.save_group_session(room_id, &blob).await?;
        }
        Ok(())
    }

    /// Whether a usable outbound group session exists for the room.
    ///
    /// Returns false when no session was set or its rotation policy
    /// triggered.
    pub async fn has_room_group_key(&self, room_id: &str) -> bool {
        self.out_group_sessions
            .lock()
            .await
            .get(room_id)
            .is_some_and(|session| !session.expired())
    }

    /// Install `session` as the live outbound group session of the room.
    ///
    /// A previously installed session for the room is dropped.
    pub async fn set_room_group_key(&self, room_id: &str, session: OutboundGroupSession) {
        self.out_group_sessions.lock().await.insert(room_id.to_owned(), session);
    }

    /// Mark the room's outbound group session as needing rotation, e.g.
    /// because the room's member set changed.
    ///
    /// The session stays installed so its key can still be shared with
    /// members who joined before the rotation, but
    /// [`has_room_group_key`](Self::has_room_group_key) reports false from
    /// here on; create and install a fresh session before encrypting
    /// again. [`rm_room_group_key`](Self::rm_room_group_key) drops the old
    /// session outright.
    pub async fn invalidate_room_group_key(&self, room_id: &str) {
        if let Some(session) = self.out_group_sessions.lock().await.get_mut(room_id) {
            debug!(room_id, session_id = session.session_id(), "invalidated outbound session");
            session.invalidate();
        }
    }

    /// Drop the outbound group session of the room.
    pub async fn rm_room_group_key(&self, room_id: &str) {
        self.out_group_sessions.lock().await.remove(room_id);
    }

    /// Create a fresh outbound group session for a room and encrypt its
    /// key for every given device.
    ///
    /// For each device an Olm session is found or newly created from the
    /// claimed one-time key, and an `m.room_key` payload carrying the
    /// Megolm session is encrypted to it. The returned JSON maps user id
    /// to device id to the `m.room.encrypted` to-device content; the
    /// session itself must be installed with
    /// [`set_room_group_key`](Self::set_room_group_key) once shared.
    pub async fn create_out_group_keys(
        &self,
        room_id: &str,
        one_time_keys: &[ClaimedOneTimeKey],
    ) -> Result<(Value, OutboundGroupSession)> {
        let details = self.required_details()?;
        self.ensure_sessions_loaded().await?;

        let outbound = OutboundGroupSession::new(room_id, EncryptionSettings::default());
        let session_key = outbound.session_key();
        let chain_index = outbound.message_index();

        let mut root: Map<String, Value> = Map::new();

        for claimed in one_time_keys {
            let payload = json!({
                "type": EventType::RoomKey.as_str(),
                "content": {
                    "algorithm": ALGORITHM_MEGOLM,
                    "room_id": room_id,
                    "session_id": outbound.session_id(),
                    "session_key": session_key,
                    "chain_index": chain_index,
                },
                "sender": details.user_id,
                "sender_device": details.device_id,
                "keys": {
                    "ed25519": self.ed_key,
                },
                "recipient": claimed.user_id,
                "recipient_keys": {
                    "ed25519": claimed.ed25519_key,
                },
            });

            let (message_type, body) =
                self.encrypt_to_device(claimed, &canonical_signable_json(&payload)).await?;

            let mut ciphertext = Map::new();
            ciphertext.insert(
                claimed.curve25519_key.clone(),
                json!({ "body": body, "type": message_type }),
            );

            let content = json!({
                "algorithm": ALGORITHM_OLM,
                "sender_key": self.curve_key,
                "ciphertext": ciphertext,
            });

            root.entry(claimed.user_id.clone())
                .or_insert_with(|| Value::Object(Map::new()))
                .as_object_mut()
                .expect("freshly inserted objects stay objects")
                .insert(claimed.device_id.clone(), content);
        }

        Ok((Value::Object(root), outbound))
    }

    /// Encrypt a plaintext towards one device, creating an Olm session
    /// from its claimed one-time key if none exists yet.
    async fn encrypt_to_device(
        &self,
        claimed: &ClaimedOneTimeKey,
        plaintext: &str,
    ) -> Result<(u64, String)> {
        let mut sessions = self.sessions.lock().await;
        let list = sessions.entry(claimed.curve25519_key.clone()).or_default();

        if list.is_empty() {
            let identity_key = Curve25519PublicKey::from_base64(&claimed.curve25519_key)
                .map_err(CryptoError::from)?;
            let one_time_key = Curve25519PublicKey::from_base64(&claimed.one_time_key)
                .map_err(CryptoError::from)?;

            let inner = self.account.lock().await.create_outbound_session(
                vodozemac::olm::SessionConfig::version_1(),
                identity_key,
                one_time_key,
            );

            debug!(
                user_id = %claimed.user_id,
                device_id = %claimed.device_id,
                "created outbound Olm session"
            );

            list.push(Session::new(inner, &claimed.curve25519_key));
        }

        // Prefer the newest session with this device.
        let newest = list
            .iter()
            .enumerate()
            .max_by_key(|(_, s)| s.creation_time())
            .map(|(i, _)| i)
            .expect("the session list is non-empty");
        let session = &mut list[newest];

        let encrypted = session.encrypt(plaintext);
        let blob = session.to_blob(&self.pickle_key);
        drop(sessions);

        self.save_session_blob(blob).await?;

        Ok(encrypted)
    }

    /// Megolm-encrypt a room message with the live outbound session.
    pub async fn encrypt_for_chat(&self, room_id: &str, plaintext: &str) -> Result<Value> {
        let details = self.required_details()?;
        let mut sessions = self.out_group_sessions.lock().await;

        let session = sessions
            .get_mut(room_id)
            .ok_or_else(|| CryptoError::MissingOutboundSession(room_id.to_owned()))?;

        let ciphertext = session.encrypt(plaintext);

        Ok(json!({
            "algorithm": ALGORITHM_MEGOLM,
            "sender_key": self.curve_key,
            "ciphertext": ciphertext,
            "session_id": session.session_id(),
            "device_id": details.device_id,
        }))
    }

    /// Handle an `m.room.encrypted` to-device event.
    ///
    /// The Olm message is decrypted with an existing session or, for
    /// pre-key messages, a newly created inbound session. The recovered
    /// payload is dispatched on its inner type: `m.room_key` installs an
    /// inbound group session, `m.forwarded_room_key` an imported one,
    /// verification events feed the SAS registry and `m.dummy` is
    /// ignored. The decrypted payload is returned, `None` when the event
    /// wasn't addressed to this device.
    pub async fn handle_room_encrypted(&self, event: &Value) -> Result<Option<Value>> {
        let content = event.get("content").unwrap_or(&Value::Null);

        if content.get("algorithm").and_then(Value::as_str) != Some(ALGORITHM_OLM) {
            warn!("ignoring to-device event with unknown algorithm");
            return Ok(None);
        }

        let sender_key = content
            .get("sender_key")
            .and_then(Value::as_str)
            .ok_or(CryptoError::MalformedEvent("missing sender_key"))?;

        let Some(ciphertext) =
            content.get("ciphertext").and_then(|c| c.get(self.curve_key.as_str()))
        else {
            // Encrypted towards some other device of ours.
            return Ok(None);
        };

        let message_type = ciphertext
            .get("type")
            .and_then(Value::as_u64)
            .ok_or(CryptoError::MalformedEvent("missing ciphertext type"))?;
        let body = ciphertext
            .get("body")
            .and_then(Value::as_str)
            .ok_or(CryptoError::MalformedEvent("missing ciphertext body"))?;

        let message = olm::olm_message_from_parts(message_type, body)?;

        self.ensure_sessions_loaded().await?;
        let plaintext = self.decrypt_to_device(sender_key, &message).await?;

        let payload: Value = serde_json::from_str(&plaintext)
            .map_err(|_| CryptoError::MalformedEvent("decrypted payload is not JSON"))?;

        self.check_decrypted_payload(&payload)?;
        self.dispatch_to_device_payload(sender_key, &payload).await?;

        Ok(Some(payload))
    }

    async fn decrypt_to_device(&self, sender_key: &str, message: &OlmMessage) -> Result<String> {
        let mut sessions = self.sessions.lock().await;
        let list = sessions.entry(sender_key.to_owned()).or_default();

        let (plaintext, blob) = match message {
            OlmMessage::PreKey(pre_key) => {
                let session_id = pre_key.session_id();

                if let Some(i) = list.iter().position(|s| s.session_id() == session_id) {
                    let session = &mut list[i];
                    let plaintext = session.decrypt(message)?;
                    (plaintext, session.to_blob(&self.pickle_key))
                } else {
                    let key =
                        Curve25519PublicKey::from_base64(sender_key).map_err(CryptoError::from)?;

                    let created = self
                        .account
                        .lock()
                        .await
                        .create_inbound_session(key, pre_key)
                        .map_err(CryptoError::from)?;

                    debug!(sender_key, "created inbound Olm session");

                    let plaintext = String::from_utf8(created.plaintext)
                        .map_err(|_| CryptoError::MalformedEvent("non-UTF-8 plaintext"))?;

                    let session = Session::new(created.session, sender_key);
                    let blob = session.to_blob(&self.pickle_key);
                    list.push(session);

                    (plaintext, blob)
                }
            }
            OlmMessage::Normal(_) => {
                let mut decrypted = None;

                for session in list.iter_mut() {
                    match session.decrypt(message) {
                        Ok(plaintext) => {
                            decrypted = Some((plaintext, session.to_blob(&self.pickle_key)));
                            break;
                        }
                        Err(_) => continue,
                    }
                }

                decrypted
                    .ok_or_else(|| CryptoError::MissingSession(sender_key.to_owned()))?
            }
        };

        drop(sessions);
        self.save_session_blob(blob).await?;

        Ok(plaintext)
    }

    /// Reject payloads that name a different recipient than us.
    fn check_decrypted_payload(&self, payload: &Value) -> Result<()> {
        if let Some(recipient_ed) =
            payload.get("recipient_keys").and_then(|k| k.get("ed25519")).and_then(Value::as_str)
        {
            if recipient_ed != self.ed_key {
                warn!("to-device payload was encrypted for another device");
                return Err(CryptoError::MalformedEvent("mismatched recipient key").into());
            }
        }

        if let (Some(recipient), Some(details)) = (
            payload.get("recipient").and_then(Value::as_str),
            self.details.read().unwrap().as_ref(),
        ) {
            if recipient != details.user_id {
                warn!("to-device payload was encrypted for another user");
                return Err(CryptoError::MalformedEvent("mismatched recipient").into());
            }
        }

        Ok(())
    }

    async fn dispatch_to_device_payload(&self, sender_key: &str, payload: &Value) -> Result<()> {
        let event_type = payload
            .get("type")
            .and_then(Value::as_str)
            .map(EventType::parse)
            .unwrap_or(EventType::Unknown);
        let content = payload.get("content").unwrap_or(&Value::Null);
        let sender_ed =
            payload.get("keys").and_then(|k| k.get("ed25519")).and_then(Value::as_str);

        match event_type {
            EventType::RoomKey => {
                if content.get("algorithm").and_then(Value::as_str) != Some(ALGORITHM_MEGOLM) {
                    warn!("ignoring room key with unknown algorithm");
                    return Ok(());
                }

                let room_id = content
                    .get("room_id")
                    .and_then(Value::as_str)
                    .ok_or(CryptoError::MalformedEvent("room key lacks room_id"))?;
                let session_key = content
                    .get("session_key")
                    .and_then(Value::as_str)
                    .ok_or(CryptoError::MalformedEvent("room key lacks session_key"))?;

                let session =
                    InboundGroupSession::new(room_id, sender_key, sender_ed, session_key)?;

                self.install_inbound_group_session(session).await?;
            }
            EventType::ForwardedRoomKey => {
                let room_id = content
                    .get("room_id")
                    .and_then(Value::as_str)
                    .ok_or(CryptoError::MalformedEvent("forwarded key lacks room_id"))?;
                let session_key = content
                    .get("session_key")
                    .and_then(Value::as_str)
                    .ok_or(CryptoError::MalformedEvent("forwarded key lacks session_key"))?;
                let claimed_sender = content
                    .get("sender_key")
                    .and_then(Value::as_str)
                    .ok_or(CryptoError::MalformedEvent("forwarded key lacks sender_key"))?;
                let claimed_ed =
                    content.get("sender_claimed_ed25519_key").and_then(Value::as_str);
                let chain = content
                    .get("forwarding_curve25519_key_chain")
                    .and_then(Value::as_array)
                    .map(|chain| {
                        chain.iter().filter_map(Value::as_str).map(str::to_owned).collect()
                    })
                    .unwrap_or_default();

                let session = InboundGroupSession::from_forwarded_key(
                    room_id,
                    sender_key,
                    claimed_sender,
                    claimed_ed,
                    session_key,
                    chain,
                )?;

                self.install_inbound_group_session(session).await?;
            }
            ty if ty.is_verification() => {
                // Register the flow so get_sas_for_event finds it.
                let _ = self.get_sas_for_event(payload);
            }
            EventType::Dummy => {}
            _ => {
                debug!(?event_type, "unhandled decrypted to-device payload");
            }
        }

        Ok(())
    }

    async fn install_inbound_group_session(&self, session: InboundGroupSession) -> Result<()> {
        let room_id = session.room_id().to_owned();
        let blob = session.to_blob(&self.pickle_key);
        let key = (
            session.room_id().to_owned(),
            session.sender_key().to_owned(),
            session.session_id().to_owned(),
        );

        debug!(%room_id, session_id = session.session_id(), "installed inbound group session");

        self.in_group_sessions.lock().await.insert(key, session);
        self.save_group_session_blob(&room_id, blob).await
    }

    /// Decrypt an `m.room.encrypted` room timeline event.
    ///
    /// Looks up the inbound group session by (room, sender key, session
    /// id) and verifies the ratchet index wasn't served before. Returns
    /// the decrypted JSON string, or `None` when no session for the event
    /// is known.
    pub async fn handle_join_room_encrypted(
        &self,
        room_id: &str,
        event: &Value,
    ) -> Result<Option<String>> {
        let content = event.get("content").unwrap_or(&Value::Null);

        if content.get("algorithm").and_then(Value::as_str) != Some(ALGORITHM_MEGOLM) {
            return Ok(None);
        }

        let sender_key = content
            .get("sender_key")
            .and_then(Value::as_str)
            .ok_or(CryptoError::MalformedEvent("missing sender_key"))?;
        let session_id = content
            .get("session_id")
            .and_then(Value::as_str)
            .ok_or(CryptoError::MalformedEvent("missing session_id"))?;
        let ciphertext = content
            .get("ciphertext")
            .and_then(Value::as_str)
            .ok_or(CryptoError::MalformedEvent("missing ciphertext"))?;

        self.ensure_group_sessions_loaded(room_id).await?;

        let mut sessions = self.in_group_sessions.lock().await;
        let key = (room_id.to_owned(), sender_key.to_owned(), session_id.to_owned());

        let Some(session) = sessions.get_mut(&key) else {
            debug!(room_id, session_id, "no inbound group session for event");
            return Ok(None);
        };

        let (plaintext, index) = session.decrypt(ciphertext)?;
        let blob = session.to_blob(&self.pickle_key);
        drop(sessions);

        debug!(room_id, index, "decrypted room event");
        self.save_group_session_blob(room_id, blob).await?;

        Ok(Some(plaintext))
    }

    /// The SAS flow associated with a verification event.
    ///
    /// An unknown transaction id creates a flow on the first
    /// `m.key.verification.start`; other verification events only look up
    /// existing flows.
    pub fn get_sas_for_event(&self, event: &Value) -> Option<Sas> {
        let event_type = event.get("type").and_then(Value::as_str).map(EventType::parse)?;

        if !event_type.is_verification() {
            return None;
        }

        let transaction_id =
            event.get("content").and_then(|c| c.get("transaction_id")).and_then(Value::as_str)?;

        let mut transactions = self.sas_transactions.lock().unwrap();

        if let Some(sas) = transactions.get(transaction_id) {
            return Some(sas.clone());
        }

        if event_type == EventType::KeyVerificationStart {
            debug!(transaction_id, "starting SAS verification flow");
            let sas = Sas::new(transaction_id);
            transactions.insert(transaction_id.to_owned(), sas.clone());
            return Some(sas);
        }

        None
    }

    /// Look up stored key material for an encrypted file.
    ///
    /// Consults the persistence handle; `None` when the file is
    /// unencrypted or unknown.
    pub async fn find_file_enc(&self, uri: &str) -> Result<Option<EncryptedFileInfo>> {
        match &self.store {
            Some(store) => store.get_file_enc(uri).await,
            None => Ok(None),
        }
    }
}
