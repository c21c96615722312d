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

//! The prioritized HTTP transport talking to a Matrix homeserver.

use std::{
    io,
    path::Path,
    pin::Pin,
    sync::{Arc, Mutex, RwLock},
    task::{Context, Poll},
};

use bytes::Bytes;
use futures_util::StreamExt;
use http::Method;
use mime::Mime;
use serde_json::Value;
use tokio::{
    io::{AsyncRead, AsyncReadExt, ReadBuf},
    sync::oneshot,
};
use tracing::{debug, trace};
use url::Url;

use crate::{
    error::{Error, Result, TransportError},
    media_stream::MediaStream,
    store::EncryptedFileInfo,
    utils::{with_canceller, Canceller, SecretString},
};

/// How many connections a session opens to one host at most.
const MAX_CONNECTIONS: usize = 4;

/// The media upload chunk size used to drive progress callbacks.
const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// Relative importance of a queued request.
///
/// Maps the caller-supplied integer the way libsoup message priorities do:
/// anything at or below -2 is very low, anything at or above 2 very high.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    /// Dispatched only when nothing else is queued.
    VeryLow,
    /// Background work.
    Low,
    /// The default.
    Normal,
    /// Interactive requests.
    High,
    /// Must go out first.
    VeryHigh,
}

impl From<i32> for Priority {
    fn from(priority: i32) -> Self {
        match priority {
            i32::MIN..=-2 => Priority::VeryLow,
            -1 => Priority::Low,
            0 => Priority::Normal,
            1 => Priority::High,
            _ => Priority::VeryHigh,
        }
    }
}

impl Priority {
    fn level(self) -> u8 {
        match self {
            Priority::VeryLow => 0,
            Priority::Low => 1,
            Priority::Normal => 2,
            Priority::High => 3,
            Priority::VeryHigh => 4,
        }
    }
}

struct Waiter {
    level: u8,
    seq: u64,
    tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct GateState {
    available: usize,
    next_seq: u64,
    waiters: Vec<Waiter>,
}

/// A connection-count gate that hands out permits by priority.
///
/// Queued acquisitions are granted strictly by (priority, enqueue order);
/// requests that already hold a permit are never preempted.
struct PermitGate {
    state: Mutex<GateState>,
}

impl PermitGate {
    fn new(permits: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GateState { available: permits, ..Default::default() }),
        })
    }

    async fn acquire(self: &Arc<Self>, priority: Priority) -> Permit {
        let rx = {
            let mut state = self.state.lock().unwrap();

            if state.available > 0 {
                state.available -= 1;
                return Permit { gate: self.clone() };
            }

            let (tx, rx) = oneshot::channel();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.waiters.push(Waiter { level: priority.level(), seq, tx });
            rx
        };

        // The sender is only consumed when a permit is handed over.
        rx.await.expect("the gate outlives its waiters");
        Permit { gate: self.clone() }
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap();

        loop {
            let best = state
                .waiters
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.level.cmp(&b.level).then(b.seq.cmp(&a.seq)))
                .map(|(i, _)| i);

            match best {
                Some(i) => {
                    let waiter = state.waiters.remove(i);
                    if waiter.tx.send(()).is_ok() {
                        // Permit handed over without becoming available.
                        return;
                    }
                    // The waiter was cancelled, try the next one.
                }
                None => {
                    state.available += 1;
                    return;
                }
            }
        }
    }
}

struct Permit {
    gate: Arc<PermitGate>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.gate.release();
    }
}

/// Adapter turning a response byte stream into an [`AsyncRead`], keeping
/// the connection permit alive for as long as the body is streamed.
struct BodyReader {
    stream: futures_util::stream::BoxStream<'static, reqwest::Result<Bytes>>,
    buffer: Bytes,
    _permit: Permit,
}

impl AsyncRead for BodyReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.buffer.is_empty() {
                let n = self.buffer.len().min(buf.remaining());
                buf.put_slice(&self.buffer.split_to(n));
                return Poll::Ready(Ok(()));
            }

            match self.stream.poll_next_unpin(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Ready(Some(Ok(bytes))) => self.buffer = bytes,
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, e)))
                }
            }
        }
    }
}

/// The result of [`Net::put_file`].
#[derive(Debug)]
pub struct Upload {
    /// The `mxc://` URI the homeserver stored the content under.
    pub content_uri: String,
    /// The key descriptor of an encrypted upload, `None` for plain ones.
    pub encrypted_file: Option<Value>,
}

/// Progress callback for uploads, called with (transferred, total) bytes.
pub type ProgressCallback = Box<dyn Fn(u64, u64) + Send + Sync>;

/// The HTTP transport.
///
/// Requests carry a priority; queued requests with a higher priority are
/// dispatched first, and each of the two underlying sessions (API and
/// media) opens at most four connections to the homeserver.
///
/// Every async operation takes an optional [`Canceller`]; when none is
/// given the transport's internal one is used, which fires when the `Net`
/// is dropped.
#[derive(Debug)]
pub struct Net {
    client: reqwest::Client,
    file_client: reqwest::Client,
    homeserver: RwLock<Option<Url>>,
    access_token: RwLock<Option<SecretString>>,
    gate: Arc<PermitGate>,
    file_gate: Arc<PermitGate>,
    canceller: Canceller,
}

impl std::fmt::Debug for PermitGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("PermitGate")
            .field("available", &state.available)
            .field("queued", &state.waiters.len())
            .finish()
    }
}

impl Default for Net {
    fn default() -> Self {
        Self::new()
    }
}

impl Net {
    /// Create a transport without a homeserver or access token.
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .build()
            .expect("the default client configuration is valid");
        let file_client = reqwest::Client::builder()
            .build()
            .expect("the default client configuration is valid");

        Self {
            client,
            file_client,
            homeserver: RwLock::new(None),
            access_token: RwLock::new(None),
            gate: PermitGate::new(MAX_CONNECTIONS),
            file_gate: PermitGate::new(MAX_CONNECTIONS),
            canceller: Canceller::new(),
        }
    }

    /// Set the homeserver base URL requests are sent to.
    pub fn set_homeserver(&self, homeserver: &str) -> Result<()> {
        let url = Url::parse(homeserver)
            .map_err(|e| Error::InvalidData(format!("invalid homeserver '{homeserver}': {e}")))?;

        *self.homeserver.write().unwrap() = Some(url);
        Ok(())
    }

    /// Set the access token used to authenticate requests.
    ///
    /// The token is stored in a buffer wiped on replacement and drop.
    pub fn set_access_token(&self, access_token: Option<&str>) {
        *self.access_token.write().unwrap() =
            access_token.filter(|t| !t.is_empty()).map(SecretString::new);
    }

    /// The current access token.
    pub fn access_token(&self) -> Option<SecretString> {
        self.access_token.read().unwrap().clone()
    }

    fn effective_canceller<'a>(&'a self, canceller: Option<&'a Canceller>) -> &'a Canceller {
        canceller.unwrap_or(&self.canceller)
    }

    fn homeserver_url(&self) -> Result<Url> {
        self.homeserver
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::InvalidData("no homeserver set".into()))
    }

    fn api_url(
        &self,
        path: &str,
        query: Option<&[(String, String)]>,
        with_token: bool,
    ) -> Result<Url> {
        let mut url = self
            .homeserver_url()?
            .join(path)
            .map_err(|e| Error::InvalidData(format!("invalid path '{path}': {e}")))?;

        {
            let mut pairs = url.query_pairs_mut();

            if let Some(query) = query {
                for (name, value) in query {
                    pairs.append_pair(name, value);
                }
            }

            if with_token {
                if let Some(token) = &*self.access_token.read().unwrap() {
                    pairs.append_pair("access_token", token.as_str());
                }
            }
        }

        if url.query() == Some("") {
            url.set_query(None);
        }

        Ok(url)
    }

    /// Send a JSON request to the homeserver.
    ///
    /// `method` has to be one of GET, POST or PUT. The parsed response body
    /// is returned if its root is an object or array; a body carrying an
    /// `errcode` fails with the mapped Matrix error.
    pub async fn send_json(
        &self,
        priority: i32,
        body: Option<Value>,
        path: &str,
        method: Method,
        query: Option<&[(String, String)]>,
        canceller: Option<&Canceller>,
    ) -> Result<Value> {
        let data = match body {
            Some(body) => Some(
                serde_json::to_vec(&body)
                    .map_err(|e| Error::InvalidData(format!("unserializable body: {e}")))?,
            ),
            None => None,
        };

        self.send_bytes(priority, data, path, method, query, canceller).await
    }

    /// Send a raw request body to the homeserver.
    ///
    /// The body bytes are expected to already be JSON; response handling is
    /// identical to [`send_json`](Self::send_json).
    pub async fn send_bytes(
        &self,
        priority: i32,
        body: Option<Vec<u8>>,
        path: &str,
        method: Method,
        query: Option<&[(String, String)]>,
        canceller: Option<&Canceller>,
    ) -> Result<Value> {
        debug_assert!([Method::GET, Method::POST, Method::PUT].contains(&method));

        let url = self.api_url(path, query, true)?;
        let canceller = self.effective_canceller(canceller);

        let request = async {
            let permit = self.gate.acquire(priority.into()).await;
            trace!(%url, ?method, "dispatching request");

            let mut builder = self.client.request(method, url);

            if let Some(body) = body {
                builder = builder
                    .header(http::header::CONTENT_TYPE, "application/json")
                    .body(body);
            }

            let response = builder.send().await?;
            let status = response.status();
            let bytes = response.bytes().await?;
            drop(permit);

            parse_response(status, &bytes)
        };

        with_canceller(Some(canceller), request).await
    }

    /// Download a file, transparently decrypting it when `enc_file` is
    /// given.
    ///
    /// `mxc://` URIs are rewritten to the homeserver's media download
    /// endpoint; other URIs are fetched as-is. The returned stream holds a
    /// connection permit of the media session until it is dropped.
    pub async fn get_file(
        &self,
        uri: &str,
        enc_file: Option<&EncryptedFileInfo>,
        canceller: Option<&Canceller>,
    ) -> Result<MediaStream> {
        let url = self.file_url(uri)?;
        let canceller = self.effective_canceller(canceller);

        let request = async {
            let permit = self.file_gate.acquire(Priority::Normal).await;
            debug!(%url, "downloading file");

            let response = self.file_client.get(url).send().await?;

            let status = response.status();
            if !status.is_success() {
                let bytes = response.bytes().await.unwrap_or_default();
                if let Some(error) =
                    serde_json::from_slice::<Value>(&bytes).ok().as_ref().and_then(Error::from_json_body)
                {
                    return Err(error);
                }
                return Err(Error::Transport(TransportError::Status(status)));
            }

            let reader = BodyReader {
                stream: response.bytes_stream().boxed(),
                buffer: Bytes::new(),
                _permit: permit,
            };

            match enc_file {
                Some(enc_file) => MediaStream::decrypting(reader, enc_file),
                None => Ok(MediaStream::new(reader)),
            }
        };

        with_canceller(Some(canceller), request).await
    }

    /// Upload a local file, optionally encrypting it on the way out.
    ///
    /// Returns the `mxc://` URI of the stored content, together with the
    /// key descriptor when the upload was encrypted. `progress` is invoked
    /// with (transferred, total) byte counts while the file is read.
    pub async fn put_file(
        &self,
        path: impl AsRef<Path>,
        content_type: Option<Mime>,
        encrypt: bool,
        progress: Option<ProgressCallback>,
        canceller: Option<&Canceller>,
    ) -> Result<Upload> {
        let canceller = self.effective_canceller(canceller);
        let file_name = path
            .as_ref()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());

        let request = async {
            let mut stream = MediaStream::from_file(path.as_ref(), encrypt, content_type).await?;
            let total = stream.size().unwrap_or_default();
            let mime_type = stream.content_type();

            let mut data = Vec::with_capacity(total as usize);
            let mut chunk = vec![0u8; UPLOAD_CHUNK_SIZE];

            loop {
                let n = stream.read(&mut chunk).await?;
                if n == 0 {
                    break;
                }

                data.extend_from_slice(&chunk[..n]);
                if let Some(progress) = &progress {
                    progress(data.len() as u64, total);
                }
            }

            let query = file_name.map(|name| vec![("filename".to_owned(), name)]);
            let url = self.api_url("/_matrix/media/r0/upload", query.as_deref(), true)?;

            let permit = self.file_gate.acquire(Priority::Normal).await;
            debug!(%url, size = data.len(), "uploading file");

            let response = self
                .file_client
                .post(url)
                .header(http::header::CONTENT_TYPE, mime_type.as_ref())
                .body(data)
                .send()
                .await?;

            let status = response.status();
            let bytes = response.bytes().await?;
            drop(permit);

            let root = parse_response(status, &bytes)?;
            let content_uri = root
                .get("content_uri")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::InvalidData("upload response lacks content_uri".into()))?
                .to_owned();

            let encrypted_file = stream.file_json(&content_uri);

            Ok(Upload { content_uri, encrypted_file })
        };

        with_canceller(Some(canceller), request).await
    }

    fn file_url(&self, uri: &str) -> Result<Url> {
        let url = if let Some(rest) = uri.strip_prefix("mxc://") {
            self.homeserver_url()?
                .join(&format!("/_matrix/media/r0/download/{rest}"))
                .map_err(|e| Error::InvalidData(format!("invalid mxc uri '{uri}': {e}")))?
        } else {
            Url::parse(uri).map_err(|e| Error::InvalidData(format!("invalid uri '{uri}': {e}")))?
        };

        Ok(url)
    }
}

impl Drop for Net {
    fn drop(&mut self) {
        self.canceller.cancel();
    }
}

fn parse_response(status: http::StatusCode, bytes: &[u8]) -> Result<Value> {
    let root: Value = match serde_json::from_slice(bytes) {
        Ok(root) => root,
        Err(_) if !status.is_success() => {
            return Err(Error::Transport(TransportError::Status(status)))
        }
        Err(e) => return Err(Error::InvalidData(format!("response is not JSON: {e}"))),
    };

    if let Some(error) = Error::from_json_body(&root) {
        return Err(error);
    }

    if !root.is_object() && !root.is_array() {
        return Err(Error::InvalidData("received invalid data".into()));
    }

    if !status.is_success() {
        return Err(Error::Transport(TransportError::Status(status)));
    }

    Ok(root)
}
