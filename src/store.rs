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

//! The persistence capability the encryption engine consults.

use std::{collections::HashMap, fmt};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::{error::Result, utils::SecretString};

/// Key material and checksum for an encrypted file, as described by the
/// `EncryptedFile` object of the Matrix media spec.
///
/// Immutable once constructed; the AES key is wiped when the value is
/// dropped.
#[derive(Clone, Debug)]
pub struct EncryptedFileInfo {
    /// The `mxc://` URI of the file.
    pub mxc_uri: String,
    /// The AES initialization vector, unpadded base64.
    pub aes_iv: String,
    /// The AES key, unpadded url-safe base64.
    pub aes_key: SecretString,
    /// SHA-256 of the ciphertext, unpadded base64.
    pub sha256: String,
    /// The JOSE algorithm name, `A256CTR`.
    pub algorithm: String,
    /// The descriptor version, `v2`.
    pub version: String,
    /// The JSON web key type, `oct`.
    pub kty: String,
    /// Whether the key is extractable.
    pub extractable: bool,
}

impl EncryptedFileInfo {
    /// Parse a `v2` key descriptor as produced by
    /// [`MediaStream::file_json`](crate::MediaStream::file_json).
    pub fn from_file_json(value: &Value) -> Option<Self> {
        let url = value.get("url")?.as_str()?;
        let iv = value.get("iv")?.as_str()?;
        let sha256 = value.get("hashes")?.get("sha256")?.as_str()?;
        let key = value.get("key")?;

        Some(Self {
            mxc_uri: url.to_owned(),
            aes_iv: iv.to_owned(),
            aes_key: SecretString::new(key.get("k")?.as_str()?),
            sha256: sha256.to_owned(),
            algorithm: key.get("alg")?.as_str()?.to_owned(),
            version: value.get("v")?.as_str()?.to_owned(),
            kty: key.get("kty")?.as_str()?.to_owned(),
            extractable: key.get("ext").and_then(Value::as_bool).unwrap_or(false),
        })
    }

    /// Serialize back into the wire descriptor shape.
    pub fn to_file_json(&self) -> Value {
        json!({
            "v": self.version,
            "url": self.mxc_uri,
            "iv": self.aes_iv,
            "hashes": {
                "sha256": self.sha256,
            },
            "key": {
                "key_ops": ["encrypt", "decrypt"],
                "alg": self.algorithm,
                "kty": self.kty,
                "k": self.aes_key.as_str(),
                "ext": self.extractable,
            },
        })
    }
}

/// The opaque persistence handle the encryption engine talks to.
///
/// These five calls are the only ones the engine makes; how the blobs are
/// stored is up to the implementor.
#[async_trait]
pub trait StateStore: fmt::Debug + Send + Sync {
    /// Look up the key material for an encrypted file by its `mxc://` URI.
    ///
    /// Returns `None` when the file is unencrypted or unknown.
    async fn get_file_enc(&self, mxc_uri: &str) -> Result<Option<EncryptedFileInfo>>;

    /// Persist a pickled Olm session blob.
    async fn save_session(&self, session: &str) -> Result<()>;

    /// Persist a pickled inbound group session blob for a room.
    async fn save_group_session(&self, room_id: &str, session: &str) -> Result<()>;

    /// Load every pickled Olm session blob.
    async fn load_sessions(&self) -> Result<Vec<String>>;

    /// Load the pickled inbound group session blobs of a room.
    async fn load_group_sessions(&self, room_id: &str) -> Result<Vec<String>>;
}

/// An in-memory [`StateStore`], useful for tests and throwaway accounts.
#[derive(Debug, Default)]
pub struct MemoryStore {
    file_infos: RwLock<HashMap<String, Value>>,
    sessions: RwLock<Vec<String>>,
    group_sessions: RwLock<HashMap<String, Vec<String>>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the key descriptor of an encrypted file.
    pub async fn add_file_enc(&self, info: &EncryptedFileInfo) {
        self.file_infos.write().await.insert(info.mxc_uri.clone(), info.to_file_json());
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get_file_enc(&self, mxc_uri: &str) -> Result<Option<EncryptedFileInfo>> {
        Ok(self
            .file_infos
            .read()
            .await
            .get(mxc_uri)
            .and_then(EncryptedFileInfo::from_file_json))
    }

    async fn save_session(&self, session: &str) -> Result<()> {
        self.sessions.write().await.push(session.to_owned());
        Ok(())
    }

    async fn save_group_session(&self, room_id: &str, session: &str) -> Result<()> {
        self.group_sessions
            .write()
            .await
            .entry(room_id.to_owned())
            .or_default()
            .push(session.to_owned());
        Ok(())
    }

    async fn load_sessions(&self) -> Result<Vec<String>> {
        Ok(self.sessions.read().await.clone())
    }

    async fn load_group_sessions(&self, room_id: &str) -> Result<Vec<String>> {
        Ok(self.group_sessions.read().await.get(room_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn descriptor() -> Value {
        json!({
            "v": "v2",
            "url": "mxc://example.org/AbCd",
            "iv": "X85+XgHN+HEAAAAAAAAAAA",
            "hashes": {
                "sha256": "5g2nSEyXs6kvXNEDZXZJG9qBIgbBxxfzgBW8VbFKDL8",
            },
            "key": {
                "key_ops": ["encrypt", "decrypt"],
                "alg": "A256CTR",
                "kty": "oct",
                "k": "dmlzbWV0aG9kcyBhcmUgbm90IHJlYWwga2V5cyEhISE",
                "ext": true,
            },
        })
    }

    #[test]
    fn file_info_round_trip() {
        let info = EncryptedFileInfo::from_file_json(&descriptor()).unwrap();

        assert_eq!(info.mxc_uri, "mxc://example.org/AbCd");
        assert_eq!(info.algorithm, "A256CTR");
        assert_eq!(info.version, "v2");
        assert_eq!(info.kty, "oct");
        assert!(info.extractable);
        assert_eq!(info.to_file_json(), descriptor());
    }

    #[tokio::test]
    async fn memory_store_finds_file_info() {
        let store = MemoryStore::new();
        let info = EncryptedFileInfo::from_file_json(&descriptor()).unwrap();

        store.add_file_enc(&info).await;

        let found = store.get_file_enc("mxc://example.org/AbCd").await.unwrap();
        assert_eq!(found.map(|i| i.sha256), Some(info.sha256.clone()));
        assert!(store.get_file_enc("mxc://example.org/other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn memory_store_keeps_session_blobs() {
        let store = MemoryStore::new();

        store.save_session("blob-1").await.unwrap();
        store.save_session("blob-2").await.unwrap();
        store.save_group_session("!room:example.org", "group-blob").await.unwrap();

        assert_eq!(store.load_sessions().await.unwrap(), vec!["blob-1", "blob-2"]);
        assert_eq!(
            store.load_group_sessions("!room:example.org").await.unwrap(),
            vec!["group-blob"]
        );
        assert!(store.load_group_sessions("!other:example.org").await.unwrap().is_empty());
    }
}
