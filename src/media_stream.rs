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

//! A byte stream filter that encrypts or decrypts Matrix media.
//!
//! Matrix encrypts file attachments with AES-256 in counter mode and ships
//! the key material in a JSON descriptor next to the event. [`MediaStream`]
//! wraps any [`AsyncRead`] and transforms the bytes as they pass through,
//! keeping a SHA-256 digest of the ciphertext on the side.

use std::{
    io,
    path::Path,
    pin::Pin,
    task::{Context, Poll},
};

use aes::{
    cipher::{KeyIvInit, StreamCipher},
    Aes256,
};
use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine};
use mime::Mime;
use rand::RngCore;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, ReadBuf};

use crate::{
    error::{Error, Result},
    store::EncryptedFileInfo,
    utils::{wipe, SecretString},
};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Encode bytes as unpadded base64, optionally with the url-safe alphabet.
pub(crate) fn encode_unpadded(data: &[u8], url_safe: bool) -> String {
    let mut base64 = STANDARD_NO_PAD.encode(data);

    if url_safe {
        // The url-safe alphabet swaps two characters, no need for a second
        // engine.
        base64 = base64.replace('/', "_").replace('+', "-");
    }

    base64
}

/// Decode unpadded base64, accepting either alphabet and stray padding.
pub(crate) fn decode_unpadded(base64: &str, url_safe: bool) -> Option<Vec<u8>> {
    let trimmed = base64.trim_end_matches('=');

    let standard;
    let input = if url_safe {
        standard = trimmed.replace('_', "/").replace('-', "+");
        &standard
    } else {
        trimmed
    };

    STANDARD_NO_PAD.decode(input).ok()
}

enum Cipher {
    /// No transformation, no checksum.
    PassThrough,
    /// Encrypt on the way through, hash the output.
    Encrypt(Aes256Ctr),
    /// Hash the input, then decrypt.
    Decrypt(Aes256Ctr),
}

/// A filter over a byte stream that transparently encrypts or decrypts
/// Matrix media while hashing the ciphertext.
///
/// Counter mode is size preserving: a read of N bytes yields N transformed
/// bytes. The first zero-length read marks the stream complete and freezes
/// the digest; afterwards [`sha256`](Self::sha256) and
/// [`file_json`](Self::file_json) become available.
pub struct MediaStream {
    inner: Box<dyn AsyncRead + Send + Unpin>,
    cipher: Cipher,
    checksum: Option<Sha256>,
    digest: Option<[u8; 32]>,
    complete: bool,

    // Key material of an encrypting stream, kept for the descriptor.
    aes_key_base64: Option<SecretString>,
    aes_iv_base64: Option<String>,

    content_type: Option<Mime>,
    size: Option<u64>,
    latched: Option<(io::ErrorKind, String)>,
}

impl std::fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStream")
            .field("complete", &self.complete)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl MediaStream {
    /// Wrap a stream without applying any cipher.
    pub fn new(inner: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            inner: Box::new(inner),
            cipher: Cipher::PassThrough,
            checksum: None,
            digest: None,
            complete: false,
            aes_key_base64: None,
            aes_iv_base64: None,
            content_type: None,
            size: None,
            latched: None,
        }
    }

    /// Wrap a stream and encrypt everything read from it.
    ///
    /// A fresh 256 bit key is generated along with a 16 byte counter block
    /// whose first 8 bytes are random and last 8 bytes are zero.
    pub fn encrypting(inner: impl AsyncRead + Send + Unpin + 'static) -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);

        // The first 8 bytes have to be random, the rest (counter) zero.
        let mut iv = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut iv[..8]);

        let cipher = Aes256Ctr::new(&key.into(), &iv.into());

        let mut stream = Self::new(inner);
        stream.cipher = Cipher::Encrypt(cipher);
        stream.checksum = Some(Sha256::new());
        stream.aes_key_base64 = Some(SecretString::new(encode_unpadded(&key, true)));
        stream.aes_iv_base64 = Some(encode_unpadded(&iv, false));

        wipe(&mut key);
        wipe(&mut iv);

        stream
    }

    /// Wrap a stream holding ciphertext and decrypt it with the key
    /// material of `file`.
    pub fn decrypting(
        inner: impl AsyncRead + Send + Unpin + 'static,
        file: &EncryptedFileInfo,
    ) -> Result<Self> {
        // The key uses unpadded base64url, the IV unpadded base64.
        let mut key = decode_unpadded(file.aes_key.as_str(), true)
            .filter(|k| k.len() == 32)
            .ok_or_else(|| Error::InvalidData("bad AES key in file info".into()))?;
        let mut iv = decode_unpadded(&file.aes_iv, false)
            .filter(|iv| iv.len() == 16)
            .ok_or_else(|| Error::InvalidData("bad AES IV in file info".into()))?;

        let cipher = Aes256Ctr::new_from_slices(&key, &iv)
            .map_err(|_| Error::InvalidData("bad AES key material".into()))?;

        wipe(&mut key);
        wipe(&mut iv);

        let mut stream = Self::new(inner);
        stream.cipher = Cipher::Decrypt(cipher);
        stream.checksum = Some(Sha256::new());

        Ok(stream)
    }

    /// Open a local file for reading, optionally encrypting it.
    ///
    /// `content_type` is what [`content_type`](Self::content_type) reports
    /// for a pass-through stream.
    pub async fn from_file(
        path: impl AsRef<Path>,
        encrypt: bool,
        content_type: Option<Mime>,
    ) -> Result<Self> {
        let file = tokio::fs::File::open(path.as_ref()).await?;
        let size = file.metadata().await?.len();

        let mut stream =
            if encrypt { Self::encrypting(file) } else { Self::new(file) };
        stream.content_type = content_type;
        stream.size = Some(size);

        Ok(stream)
    }

    /// Whether the wrapped stream was read to the end.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// The size of the underlying file, if known.
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// The MIME type to announce when uploading this stream.
    ///
    /// Encrypted payloads are always opaque bytes.
    pub fn content_type(&self) -> Mime {
        match &self.cipher {
            Cipher::PassThrough => {
                self.content_type.clone().unwrap_or(mime::APPLICATION_OCTET_STREAM)
            }
            _ => mime::APPLICATION_OCTET_STREAM,
        }
    }

    /// The ciphertext digest, unpadded base64.
    ///
    /// Only available once the stream completed.
    pub fn sha256(&self) -> Option<String> {
        self.digest.as_ref().map(|digest| encode_unpadded(digest, false))
    }

    /// The `v2` key descriptor for an encrypting stream that was read to
    /// completion.
    ///
    /// `url` is the `mxc://` URI the ciphertext was uploaded to.
    pub fn file_json(&self, url: &str) -> Option<Value> {
        if !matches!(self.cipher, Cipher::Encrypt(_)) || !self.complete {
            return None;
        }

        Some(json!({
            "v": "v2",
            "url": url,
            "iv": self.aes_iv_base64.as_ref()?,
            "hashes": {
                "sha256": self.sha256()?,
            },
            "key": {
                "key_ops": ["encrypt", "decrypt"],
                "alg": "A256CTR",
                "kty": "oct",
                "k": self.aes_key_base64.as_ref()?.as_str(),
                "ext": true,
            },
        }))
    }

    fn latch(&mut self, kind: io::ErrorKind, message: String) -> io::Error {
        self.latched = Some((kind, message.clone()));
        io::Error::new(kind, message)
    }
}

impl AsyncRead for MediaStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        if let Some((kind, message)) = &this.latched {
            return Poll::Ready(Err(io::Error::new(*kind, message.clone())));
        }

        let start = buf.filled().len();

        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {
                let filled = buf.filled_mut();
                let n = filled.len() - start;

                if n == 0 {
                    if !this.complete {
                        this.complete = true;
                        this.digest = this.checksum.take().map(|c| c.finalize().into());
                    }
                    return Poll::Ready(Ok(()));
                }

                let chunk = &mut filled[start..];

                let result = match &mut this.cipher {
                    Cipher::PassThrough => Ok(()),
                    Cipher::Encrypt(cipher) => {
                        // We are encrypting, hash after the transformation.
                        let result = cipher.try_apply_keystream(chunk);
                        if result.is_ok() {
                            if let Some(checksum) = &mut this.checksum {
                                checksum.update(&chunk[..]);
                            }
                        }
                        result
                    }
                    Cipher::Decrypt(cipher) => {
                        // We are decrypting, hash before the transformation.
                        if let Some(checksum) = &mut this.checksum {
                            checksum.update(&chunk[..]);
                        }
                        cipher.try_apply_keystream(chunk)
                    }
                };

                match result {
                    Ok(()) => Poll::Ready(Ok(())),
                    Err(e) => Poll::Ready(Err(
                        this.latch(io::ErrorKind::Other, format!("cipher failure: {e}"))
                    )),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use sha2::{Digest, Sha256};
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::store::EncryptedFileInfo;

    #[test]
    fn base64_helpers() {
        assert_eq!(encode_unpadded(b"abc", false), "YWJj");
        assert_eq!(decode_unpadded("YWJj", false).unwrap(), b"abc");
        // Stray padding is tolerated.
        assert_eq!(decode_unpadded("YWJjZA==", false).unwrap(), b"abcd");

        let data = [0xfbu8, 0xef, 0xff];
        let url_safe = encode_unpadded(&data, true);
        assert!(!url_safe.contains('/') && !url_safe.contains('+'));
        assert_eq!(decode_unpadded(&url_safe, true).unwrap(), data);
    }

    #[tokio::test]
    async fn pass_through_leaves_bytes_alone() {
        let mut stream = MediaStream::new(&b"hello world"[..]);
        let mut out = Vec::new();

        stream.read_to_end(&mut out).await.unwrap();

        assert_eq!(out, b"hello world");
        assert!(stream.is_complete());
        assert!(stream.sha256().is_none());
        assert!(stream.file_json("mxc://example.org/x").is_none());
    }

    #[tokio::test]
    async fn encrypting_stream_preserves_size_and_digest() {
        let mut stream = MediaStream::encrypting(&b"abc"[..]);
        let mut ciphertext = Vec::new();

        stream.read_to_end(&mut ciphertext).await.unwrap();

        assert_eq!(ciphertext.len(), 3);
        assert_ne!(ciphertext, b"abc");
        assert!(stream.is_complete());

        let expected = encode_unpadded(&Sha256::digest(&ciphertext), false);
        assert_eq!(stream.sha256().unwrap(), expected);
    }

    #[tokio::test]
    async fn descriptor_matches_media_spec() {
        let mut stream = MediaStream::encrypting(&b"abc"[..]);
        let mut ciphertext = Vec::new();
        stream.read_to_end(&mut ciphertext).await.unwrap();

        let descriptor = stream.file_json("mxc://example.org/AbCd").unwrap();

        assert_eq!(descriptor["v"], "v2");
        assert_eq!(descriptor["url"], "mxc://example.org/AbCd");
        assert_eq!(descriptor["key"]["alg"], "A256CTR");
        assert_eq!(descriptor["key"]["kty"], "oct");
        assert_eq!(descriptor["key"]["ext"], true);
        assert_eq!(descriptor["key"]["key_ops"], json!(["encrypt", "decrypt"]));
        assert_eq!(
            descriptor["hashes"]["sha256"].as_str().unwrap(),
            encode_unpadded(&Sha256::digest(&ciphertext), false),
        );

        // The IV ends in 8 zero bytes.
        let iv = decode_unpadded(descriptor["iv"].as_str().unwrap(), false).unwrap();
        assert_eq!(iv.len(), 16);
        assert_eq!(&iv[8..], &[0u8; 8]);
    }

    #[tokio::test]
    async fn encrypt_decrypt_round_trip() {
        let plaintext = b"the quick brown fox jumps over the lazy dog".to_vec();

        let mut encryptor = MediaStream::encrypting(std::io::Cursor::new(plaintext.clone()));
        let mut ciphertext = Vec::new();
        encryptor.read_to_end(&mut ciphertext).await.unwrap();

        let descriptor = encryptor.file_json("mxc://example.org/file").unwrap();
        let info = EncryptedFileInfo::from_file_json(&descriptor).unwrap();

        let mut decryptor =
            MediaStream::decrypting(std::io::Cursor::new(ciphertext.clone()), &info).unwrap();
        let mut decrypted = Vec::new();
        decryptor.read_to_end(&mut decrypted).await.unwrap();

        assert_eq!(decrypted, plaintext);
        // The decrypting side hashed the ciphertext before decrypting.
        assert_eq!(decryptor.sha256().unwrap(), info.sha256);
    }

    #[tokio::test]
    async fn bad_key_material_is_rejected() {
        let descriptor = json!({
            "v": "v2",
            "url": "mxc://example.org/x",
            "iv": "dG9vc2hvcnQ",
            "hashes": { "sha256": "xxx" },
            "key": {
                "key_ops": ["encrypt", "decrypt"],
                "alg": "A256CTR",
                "kty": "oct",
                "k": "dG9vc2hvcnQ",
                "ext": true,
            },
        });
        let info = EncryptedFileInfo::from_file_json(&descriptor).unwrap();

        assert!(matches!(
            MediaStream::decrypting(&b""[..], &info),
            Err(Error::InvalidData(_))
        ));
    }

    #[tokio::test]
    async fn from_file_reports_size_and_content_type() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"file contents").unwrap();

        let plain = MediaStream::from_file(file.path(), false, Some(mime::TEXT_PLAIN))
            .await
            .unwrap();
        assert_eq!(plain.size(), Some(13));
        assert_eq!(plain.content_type(), mime::TEXT_PLAIN);

        let mut encrypted = MediaStream::from_file(file.path(), true, Some(mime::TEXT_PLAIN))
            .await
            .unwrap();
        assert_eq!(encrypted.content_type(), mime::APPLICATION_OCTET_STREAM);

        let mut out = Vec::new();
        encrypted.read_to_end(&mut out).await.unwrap();
        assert_eq!(out.len(), 13);
        assert_ne!(out, b"file contents");
    }
}
