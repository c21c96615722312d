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

//! Configuration for a server side pusher.
//!
//! A pusher is a worker on the homeserver that delivers push notifications
//! for a user. A user can have multiple pushers, configured per device.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::{
    error::{Error, Result},
    utils::{with_canceller, Canceller},
};

/// The kind of a pusher.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PusherKind {
    /// An HTTP pusher posting to a push gateway.
    Http,
    /// An email pusher.
    Email,
    /// Anything we don't recognize.
    #[default]
    Unknown,
}

impl PusherKind {
    /// The wire name of this kind, `None` for unknown kinds.
    pub fn as_str(&self) -> Option<&'static str> {
        match self {
            PusherKind::Http => Some("http"),
            PusherKind::Email => Some("email"),
            PusherKind::Unknown => None,
        }
    }

    /// Parse a wire kind string like `http`.
    pub fn parse(kind: &str) -> Self {
        match kind {
            "http" => PusherKind::Http,
            "email" => PusherKind::Email,
            _ => PusherKind::Unknown,
        }
    }
}

/// A pusher configuration record.
///
/// Plain data; [`check_valid`](Self::check_valid) probes the configured
/// gateway URL.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Pusher {
    /// What kind of pusher this is.
    #[serde(skip)]
    pub kind: PusherKind,
    /// Reverse-DNS style id of the application, e.g. `com.example.Client`.
    pub app_id: String,
    /// User visible name of the application.
    pub app_display_name: String,
    /// User visible name of the device.
    pub device_display_name: String,
    /// Preferred language for notifications, e.g. `en-US`.
    pub lang: String,
    /// Which set of device specific rules this pusher executes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_tag: Option<String>,
    /// Unique identifier of this pusher.
    pub pushkey: String,
    /// The push gateway URL, http kind only.
    pub url: Option<String>,
}

impl Pusher {
    /// Create an empty pusher record.
    pub fn new() -> Self {
        Self::default()
    }

    /// The `POST /_matrix/client/r0/pushers/set` payload for this pusher.
    pub fn pushers_json(&self) -> Value {
        let mut data = json!({});
        if let Some(url) = &self.url {
            data["url"] = url.as_str().into();
        }

        json!({
            "app_display_name": self.app_display_name,
            "app_id": self.app_id,
            "data": data,
            "device_display_name": self.device_display_name,
            "kind": self.kind.as_str(),
            "lang": self.lang,
            "profile_tag": self.profile_tag.as_deref().unwrap_or(""),
            "pushkey": self.pushkey,
        })
    }

    /// Check that the configured URL is a UnifiedPush Matrix gateway.
    ///
    /// The endpoint has to answer with a JSON body containing
    /// `{"unifiedpush":{"gateway":"matrix"}}`; everything else fails with
    /// [`Error::BadPushGateway`].
    pub async fn check_valid(&self, canceller: Option<&Canceller>) -> Result<()> {
        let url = self
            .url
            .as_deref()
            .ok_or_else(|| Error::BadPushGateway("no pusher URL configured".into()))?;

        let request = async {
            let response = reqwest::get(url).await?;
            let body = response.bytes().await?;

            let root: Value = serde_json::from_slice(&body).map_err(|_| {
                Error::BadPushGateway("endpoint didn't return valid JSON".into())
            })?;

            if let Some(error) = Error::from_json_body(&root) {
                return Err(error);
            }

            let gateway = root
                .get("unifiedpush")
                .ok_or_else(|| Error::BadPushGateway("not a UP gateway".into()))?
                .get("gateway")
                .and_then(Value::as_str);

            if gateway != Some("matrix") {
                return Err(Error::BadPushGateway("not a UP matrix gateway".into()));
            }

            debug!(url, "push gateway is valid");
            Ok(())
        };

        with_canceller(canceller, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trip() {
        assert_eq!(PusherKind::parse("http"), PusherKind::Http);
        assert_eq!(PusherKind::parse("email"), PusherKind::Email);
        assert_eq!(PusherKind::parse("carrier-pigeon"), PusherKind::Unknown);

        assert_eq!(PusherKind::Http.as_str(), Some("http"));
        assert_eq!(PusherKind::Email.as_str(), Some("email"));
        assert_eq!(PusherKind::Unknown.as_str(), None);
    }

    #[test]
    fn pushers_json_shape() {
        let pusher = Pusher {
            kind: PusherKind::Http,
            app_id: "com.example.Client".to_owned(),
            app_display_name: "Example".to_owned(),
            device_display_name: "Phone".to_owned(),
            lang: "en-US".to_owned(),
            profile_tag: None,
            pushkey: "abc123".to_owned(),
            url: Some("https://push.example.org/_matrix/push/v1/notify".to_owned()),
        };

        let json = pusher.pushers_json();
        assert_eq!(json["kind"], "http");
        assert_eq!(json["app_id"], "com.example.Client");
        assert_eq!(json["data"]["url"], "https://push.example.org/_matrix/push/v1/notify");
        assert_eq!(json["pushkey"], "abc123");
    }

    #[tokio::test]
    async fn check_valid_needs_a_url() {
        let pusher = Pusher::new();
        assert!(matches!(
            pusher.check_valid(None).await,
            Err(Error::BadPushGateway(_))
        ));
    }
}
