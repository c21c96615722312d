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

//! Validators, secret handling and homeserver discovery.

use std::{
    fmt,
    pin::pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};

/// <https://spec.matrix.org/v1.2/appendices/#user-identifiers>
///
/// The domain part is validated separately, so the regex is not complete.
static MATRIX_USER_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^@[A-Z0-9.=_-]+:[A-Z0-9.-]+$").unwrap());

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^[[:alnum:]._%+-]+@[A-Z0-9.-]+\.[A-Z]{2,}$").unwrap());

/// Rough estimate for an E.164 number.
static MOBILE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\+[0-9]{10,15}$").unwrap());

/// Check if `user_id` is a fully qualified Matrix user id like
/// `@alice:example.org`.
pub fn valid_user_name(user_id: &str) -> bool {
    if user_id.is_empty() || user_id.len() > 255 {
        return false;
    }

    if !MATRIX_USER_ID_RE.is_match(user_id) {
        return false;
    }

    match user_id.split_once(':') {
        Some((_, host)) => home_server_valid(host),
        None => false,
    }
}

/// The homeserver host part of a fully qualified user id.
pub fn url_from_user_id(user_id: &str) -> Option<&str> {
    if !valid_user_name(user_id) {
        return None;
    }

    user_id.split_once(':').map(|(_, host)| host)
}

/// Check if `email` looks like an email address.
pub fn is_email(email: &str) -> bool {
    EMAIL_RE.is_match(email)
}

/// Check if `number` is a plausible international phone number.
pub fn mobile_is_valid(number: &str) -> bool {
    MOBILE_RE.is_match(number)
}

/// Check if `homeserver` is a usable homeserver URL.
///
/// Accepts a bare host, which is interpreted as `https://<host>`. The
/// scheme has to be http or https and the URL must not carry a path.
pub fn home_server_valid(homeserver: &str) -> bool {
    if homeserver.is_empty() {
        return false;
    }

    let with_scheme;
    let server = if homeserver.contains("//") {
        homeserver
    } else {
        with_scheme = format!("https://{homeserver}");
        &with_scheme
    };

    let Ok(url) = Url::parse(server) else {
        return false;
    };

    if !matches!(url.scheme(), "http" | "https") {
        return false;
    }

    let Some(host) = url.host_str() else {
        return false;
    };

    !host.is_empty() && !host.ends_with('.') && matches!(url.path(), "" | "/")
}

/// Overwrite a buffer that held secret material.
///
/// The buffer is filled with 0xAD rather than zero so that use after wipe
/// is likely to crash loudly.
pub fn wipe(buffer: &mut [u8]) {
    for byte in buffer.iter_mut() {
        // Volatile so the writes survive optimization of the following free.
        unsafe { std::ptr::write_volatile(byte, 0xAD) };
    }
    std::sync::atomic::compiler_fence(Ordering::SeqCst);
}

/// An owned string wiped on drop.
///
/// Used for access tokens, pickle keys and other secrets that shouldn't
/// linger in freed memory.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString {
    inner: Vec<u8>,
}

impl SecretString {
    /// Create a new secret from a string.
    pub fn new(value: impl Into<String>) -> Self {
        Self { inner: value.into().into_bytes() }
    }

    /// Borrow the secret.
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.inner).expect("secrets are constructed from strings")
    }

    /// Borrow the secret as raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }
}

impl Drop for SecretString {
    fn drop(&mut self) {
        wipe(&mut self.inner);
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretString(..)")
    }
}

impl From<&str> for SecretString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// A clonable cancellation handle.
///
/// Every async operation of [`Net`](crate::Net) and the discovery probes
/// accepts an optional `Canceller`; cancelling fails the operation with
/// [`Error::Cancelled`].
#[derive(Clone, Debug, Default)]
pub struct Canceller {
    inner: Arc<CancellerInner>,
}

#[derive(Debug, Default)]
struct CancellerInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl Canceller {
    /// Create a new, uncancelled handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel all operations this handle was passed to.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Whether [`cancel`](Self::cancel) was called.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until this handle is cancelled.
    pub async fn cancelled(&self) {
        let mut notified = pin!(self.inner.notify.notified());

        loop {
            if self.is_cancelled() {
                return;
            }

            notified.as_mut().enable();

            if self.is_cancelled() {
                return;
            }

            notified.as_mut().await;
            notified.set(self.inner.notify.notified());
        }
    }
}

/// Run `fut` unless `canceller` fires first.
pub(crate) async fn with_canceller<F, T>(canceller: Option<&Canceller>, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match canceller {
        Some(canceller) => {
            tokio::select! {
                _ = canceller.cancelled() => Err(Error::Cancelled),
                res = fut => res,
            }
        }
        None => fut.await,
    }
}

fn clamp_timeout(timeout: u64) -> Duration {
    Duration::from_secs(timeout.clamp(5, 60))
}

/// Fetch `uri` and parse the response body as JSON.
///
/// `timeout` is clamped between 5 and 60 seconds; redirects are not
/// followed.
pub async fn read_json_uri(
    uri: &str,
    timeout: u64,
    canceller: Option<&Canceller>,
) -> Result<Value> {
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(Error::from)?;

    let request = async {
        let response = client.get(uri).send().await?;
        let body = response.bytes().await?;

        serde_json::from_slice(&body)
            .map_err(|e| Error::InvalidData(format!("invalid JSON from {uri}: {e}")))
    };

    let guarded = with_canceller(canceller, async {
        match tokio::time::timeout(clamp_timeout(timeout), request).await {
            Ok(res) => res,
            Err(_) => Err(Error::TimedOut),
        }
    });

    guarded.await
}

/// Discover the homeserver responsible for `user_id`.
///
/// `user_id` has to be a fully qualified Matrix id (`@user:example.org`);
/// the host part is asked for its `.well-known/matrix/client` document.
///
/// See <https://matrix.org/docs/spec/client_server/r0.6.1#server-discovery>
pub async fn get_homeserver(
    user_id: &str,
    timeout: u64,
    canceller: Option<&Canceller>,
) -> Result<String> {
    let Some(host) = url_from_user_id(user_id) else {
        return Err(Error::InvalidData(format!("'{user_id}' is not a complete matrix id")));
    };

    let uri = format!("https://{host}/.well-known/matrix/client");
    let root = read_json_uri(&uri, timeout, canceller).await?;

    root.get("m.homeserver")
        .and_then(|v| v.get("base_url"))
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| Error::InvalidData("got invalid response from server".into()))
}

/// Check that `server` speaks a client-server API version we support.
pub async fn verify_homeserver(
    server: &str,
    timeout: u64,
    canceller: Option<&Canceller>,
) -> Result<bool> {
    if !server.starts_with("http") {
        return Err(Error::InvalidData(format!("URI '{server}' is invalid")));
    }

    let uri = format!("{}/_matrix/client/versions", server.trim_end_matches('/'));
    let root = read_json_uri(&uri, timeout, canceller).await?;

    if let Some(error) = Error::from_json_body(&root) {
        return Err(error);
    }

    let versions = root.get("versions").and_then(Value::as_array);
    let valid = versions.is_some_and(|versions| {
        versions.iter().filter_map(Value::as_str).any(|version| {
            // We have tested only with r0.6.x and r0.5.0
            version.starts_with("r0.5.")
                || version.starts_with("r0.6.")
                || version.starts_with("v1.")
        })
    });

    debug!(server, valid, "homeserver version probe");

    Ok(valid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_names() {
        let cases = [
            ("", false),
            ("@:.", false),
            ("@bob:", false),
            ("@:example.org", false),
            ("abc", false),
            ("good@bad:com", false),
            ("test@user.com", false),
            ("@a:example.org", true),
            ("@alice:example.org", true),
            ("@alice:example.org@alice:example.org", false),
            ("@alice:sub.example.org", true),
            ("@bob:localhost", true),
        ];

        for (input, valid) in cases {
            assert_eq!(valid_user_name(input), valid, "user id: {input:?}");
        }
    }

    #[test]
    fn user_name_length_cap() {
        let long = format!("@{}:example.org", "a".repeat(255));
        assert!(!valid_user_name(&long));
    }

    #[test]
    fn emails() {
        let cases = [
            ("", false),
            ("@:.", false),
            ("@bob:", false),
            ("abc", false),
            ("good@bad:com", false),
            ("@alice:example.org", false),
            ("test@user.com", true),
            ("test@user.comtest@user.com", false),
        ];

        for (input, valid) in cases {
            assert_eq!(is_email(input), valid, "email: {input:?}");
        }
    }

    #[test]
    fn phone_numbers() {
        let cases = [
            ("", false),
            ("123", false),
            ("+9123", false),
            ("+91223344", false),
            ("+91123456789", true),
            ("+13123456789", true),
            ("+13123456789002211443", false),
        ];

        for (input, valid) in cases {
            assert_eq!(mobile_is_valid(input), valid, "number: {input:?}");
        }
    }

    #[test]
    fn homeservers() {
        assert!(home_server_valid("https://matrix.org"));
        assert!(home_server_valid("https://matrix.org/"));
        assert!(home_server_valid("http://localhost"));
        assert!(home_server_valid("matrix.org"));
        assert!(!home_server_valid("matrix.org/x"));
        assert!(!home_server_valid("ftp://matrix.org"));
        assert!(!home_server_valid("https://matrix.org."));
        assert!(!home_server_valid(""));
    }

    #[test]
    fn wipe_fills_with_marker() {
        let mut buffer = b"super secret".to_vec();
        wipe(&mut buffer);
        assert!(buffer.iter().all(|&b| b == 0xAD));
    }

    #[test]
    fn secret_string_round_trip() {
        let secret = SecretString::new("hunter2");
        assert_eq!(secret.as_str(), "hunter2");
        assert_eq!(secret.as_bytes(), b"hunter2");
    }

    #[tokio::test]
    async fn canceller_wakes_waiters() {
        let canceller = Canceller::new();
        let waiter = canceller.clone();

        let handle = tokio::spawn(async move { waiter.cancelled().await });

        assert!(!canceller.is_cancelled());
        canceller.cancel();
        handle.await.unwrap();
        assert!(canceller.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_operation_reports_cancelled() {
        let canceller = Canceller::new();
        canceller.cancel();

        let res = with_canceller(Some(&canceller), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert!(matches!(res, Err(Error::Cancelled)));
    }
}
