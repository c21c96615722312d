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

//! Short authentication string device verification.

use std::sync::{Arc, Mutex};

use vodozemac::{sas::EstablishedSas, Curve25519PublicKey};

use crate::error::{CryptoError, Result};

/// The short authentication string presented to the user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SasStrings {
    /// Indices into the standard emoji table, seven entries.
    pub emoji_indices: [u8; 7],
    /// Three four-digit decimal numbers.
    pub decimals: (u16, u16, u16),
}

enum SasState {
    /// We have our own ephemeral key but not the peer's.
    Created(vodozemac::sas::Sas),
    /// The shared secret is established.
    Established(EstablishedSas),
    /// Transitional placeholder while the key exchange happens.
    Poisoned,
}

/// A single SAS verification flow, keyed by its transaction id.
///
/// Thin composition over the SAS primitive: exchange public keys, derive
/// the short strings, then exchange MACs over the device keys.
#[derive(Clone)]
pub struct Sas {
    transaction_id: String,
    our_public_key: String,
    state: Arc<Mutex<SasState>>,
}

impl std::fmt::Debug for Sas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sas")
            .field("transaction_id", &self.transaction_id)
            .field("our_public_key", &self.our_public_key)
            .finish_non_exhaustive()
    }
}

impl Sas {
    pub(crate) fn new(transaction_id: &str) -> Self {
        let inner = vodozemac::sas::Sas::new();

        Self {
            transaction_id: transaction_id.to_owned(),
            our_public_key: inner.public_key().to_base64(),
            state: Arc::new(Mutex::new(SasState::Created(inner))),
        }
    }

    /// The transaction id of this flow.
    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    /// Our ephemeral public key, sent in the `m.key.verification.key`
    /// event.
    pub fn public_key(&self) -> &str {
        &self.our_public_key
    }

    /// Whether the peer's key was received and the secret established.
    pub fn is_established(&self) -> bool {
        matches!(&*self.state.lock().unwrap(), SasState::Established(_))
    }

    /// Establish the shared secret from the peer's ephemeral public key.
    pub fn set_their_key(&self, their_key: &str) -> Result<(), CryptoError> {
        let key = Curve25519PublicKey::from_base64(their_key)?;
        let mut state = self.state.lock().unwrap();

        match std::mem::replace(&mut *state, SasState::Poisoned) {
            SasState::Created(sas) => match sas.diffie_hellman(key) {
                Ok(established) => {
                    *state = SasState::Established(established);
                    Ok(())
                }
                Err(e) => Err(CryptoError::Sas(e.to_string())),
            },
            other => {
                *state = other;
                Err(CryptoError::MalformedEvent("their key was already set"))
            }
        }
    }

    /// Derive the short authentication strings shown to the user.
    ///
    /// `info` is the agreed HKDF info string containing both users and
    /// devices plus the transaction id.
    pub fn generate_bytes(&self, info: &str) -> Result<SasStrings, CryptoError> {
        let state = self.state.lock().unwrap();

        let SasState::Established(established) = &*state else {
            return Err(CryptoError::MalformedEvent("their key wasn't set yet"));
        };

        let bytes = established.bytes(info);

        Ok(SasStrings { emoji_indices: bytes.emoji_indices(), decimals: bytes.decimals() })
    }

    /// MAC `input` with the established secret, unpadded base64.
    pub fn calculate_mac(&self, input: &str, info: &str) -> Result<String, CryptoError> {
        let state = self.state.lock().unwrap();

        let SasState::Established(established) = &*state else {
            return Err(CryptoError::MalformedEvent("their key wasn't set yet"));
        };

        Ok(established.calculate_mac(input, info).to_base64())
    }
}
