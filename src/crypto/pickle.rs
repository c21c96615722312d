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

//! The versioned persistence envelope for account state.
//!
//! Accounts are stored as a small JSON envelope holding the format version
//! and the encrypted ratchet pickle. Two input generations are supported:
//! envelope versions 3 and 4 carry a vodozemac pickle, while a bare
//! (non-JSON) blob is treated as a legacy libolm pickle. Output is always
//! the newest envelope version.

use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use vodozemac::olm::{Account, AccountPickle};
use zeroize::Zeroizing;

use crate::{
    error::{Error, Result},
    utils::SecretString,
};

/// The version new pickles are written as.
const PICKLE_VERSION: u32 = 4;

/// The oldest envelope version still readable.
const MIN_PICKLE_VERSION: u32 = 3;

#[derive(Deserialize, Serialize)]
struct PickleEnvelope {
    version: u32,
    account: String,
}

/// Stretch the caller-supplied pickle secret into the 32 byte key the
/// ratchet pickles are encrypted with.
pub(crate) fn derive_pickle_key(secret: &SecretString) -> Zeroizing<[u8; 32]> {
    let hkdf = Hkdf::<Sha256>::new(None, secret.as_bytes());
    let mut key = Zeroizing::new([0u8; 32]);

    hkdf.expand(b"account pickle", key.as_mut())
        .expect("32 bytes is a valid hkdf output length");

    key
}

/// Serialize an account into the current envelope version.
pub(crate) fn pickle_account(account: &Account, pickle_key: &[u8; 32]) -> String {
    let envelope = PickleEnvelope {
        version: PICKLE_VERSION,
        account: account.pickle().encrypt(pickle_key),
    };

    serde_json::to_string(&envelope).expect("pickle envelopes always serialize")
}

/// Restore an account from a pickle of any supported generation.
///
/// An unknown envelope version fails with [`Error::PickleFormat`] without
/// touching any state.
pub(crate) fn unpickle_account(
    pickle: &str,
    secret: &SecretString,
    pickle_key: &[u8; 32],
) -> Result<Account> {
    if let Ok(envelope) = serde_json::from_str::<PickleEnvelope>(pickle) {
        if !(MIN_PICKLE_VERSION..=PICKLE_VERSION).contains(&envelope.version) {
            return Err(Error::PickleFormat(format!(
                "unsupported pickle version {}",
                envelope.version
            )));
        }

        let account_pickle = AccountPickle::from_encrypted(&envelope.account, pickle_key)
            .map_err(|e| Error::PickleFormat(format!("corrupt account pickle: {e}")))?;

        return Ok(Account::from(account_pickle));
    }

    // Not an envelope, assume the previous generation: a bare libolm
    // pickle encrypted with the raw secret.
    Account::from_libolm_pickle(pickle, secret.as_bytes())
        .map_err(|e| Error::PickleFormat(format!("corrupt legacy pickle: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret() -> SecretString {
        SecretString::new("cefdef40-3b16-4d71-8685-2740833c3297")
    }

    #[test]
    fn pickle_round_trip_preserves_identity() {
        let secret = secret();
        let key = derive_pickle_key(&secret);

        let account = Account::new();
        let pickle = pickle_account(&account, &key);

        let restored = unpickle_account(&pickle, &secret, &key).unwrap();
        assert_eq!(restored.curve25519_key(), account.curve25519_key());
        assert_eq!(restored.ed25519_key(), account.ed25519_key());
    }

    #[test]
    fn repickling_is_a_fixpoint() {
        let secret = secret();
        let key = derive_pickle_key(&secret);

        let account = Account::new();
        let pickle = pickle_account(&account, &key);
        let restored = unpickle_account(&pickle, &secret, &key).unwrap();

        let envelope: PickleEnvelope = serde_json::from_str(&pickle).unwrap();
        let repickled: PickleEnvelope =
            serde_json::from_str(&pickle_account(&restored, &key)).unwrap();
        assert_eq!(envelope.version, repickled.version);

        // The decrypted pickles describe the same account even though the
        // ciphertexts differ per encryption.
        let one = AccountPickle::from_encrypted(&envelope.account, &key).unwrap();
        let two = AccountPickle::from_encrypted(&repickled.account, &key).unwrap();
        assert_eq!(
            Account::from(one).curve25519_key(),
            Account::from(two).curve25519_key()
        );
    }

    #[test]
    fn unknown_versions_are_rejected() {
        let secret = secret();
        let key = derive_pickle_key(&secret);

        let pickle = serde_json::to_string(&PickleEnvelope {
            version: 17,
            account: "opaque".to_owned(),
        })
        .unwrap();

        assert!(matches!(
            unpickle_account(&pickle, &secret, &key),
            Err(Error::PickleFormat(_))
        ));
    }

    #[test]
    fn garbage_is_not_a_legacy_pickle() {
        let secret = secret();
        let key = derive_pickle_key(&secret);

        assert!(matches!(
            unpickle_account("definitely not a pickle", &secret, &key),
            Err(Error::PickleFormat(_))
        ));
    }

    #[test]
    fn derived_keys_are_stable() {
        let one = derive_pickle_key(&secret());
        let two = derive_pickle_key(&secret());
        assert_eq!(*one, *two);
        assert_ne!(*one, *derive_pickle_key(&SecretString::new("other")));
    }
}
