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

//! Error conditions.

use serde_json::Value;
use thiserror::Error;

/// Result alias for operations of this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error codes a Matrix homeserver can return in the `errcode` field
/// of an error response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum MatrixErrorCode {
    Forbidden,
    UnknownToken,
    MissingToken,
    BadJson,
    NotJson,
    NotFound,
    LimitExceeded,
    Unknown,
    Unrecognized,
    Unauthorized,
    UserDeactivated,
    UserInUse,
    InvalidUsername,
    RoomInUse,
    InvalidRoomState,
    ThreepidInUse,
    ThreepidNotFound,
    ThreepidAuthFailed,
    ThreepidDenied,
    ServerNotTrusted,
    UnsupportedRoomVersion,
    IncompatibleRoomVersion,
    BadState,
    GuestAccessForbidden,
    CaptchaNeeded,
    CaptchaInvalid,
    MissingParam,
    InvalidParam,
    TooLarge,
    Exclusive,
    ResourceLimitExceeded,
    CannotLeaveServerNoticeRoom,
}

impl MatrixErrorCode {
    const CODES: &'static [(&'static str, MatrixErrorCode)] = &[
        ("M_FORBIDDEN", MatrixErrorCode::Forbidden),
        ("M_UNKNOWN_TOKEN", MatrixErrorCode::UnknownToken),
        ("M_MISSING_TOKEN", MatrixErrorCode::MissingToken),
        ("M_BAD_JSON", MatrixErrorCode::BadJson),
        ("M_NOT_JSON", MatrixErrorCode::NotJson),
        ("M_NOT_FOUND", MatrixErrorCode::NotFound),
        ("M_LIMIT_EXCEEDED", MatrixErrorCode::LimitExceeded),
        ("M_UNKNOWN", MatrixErrorCode::Unknown),
        ("M_UNRECOGNIZED", MatrixErrorCode::Unrecognized),
        ("M_UNAUTHORIZED", MatrixErrorCode::Unauthorized),
        ("M_USER_DEACTIVATED", MatrixErrorCode::UserDeactivated),
        ("M_USER_IN_USE", MatrixErrorCode::UserInUse),
        ("M_INVALID_USERNAME", MatrixErrorCode::InvalidUsername),
        ("M_ROOM_IN_USE", MatrixErrorCode::RoomInUse),
        ("M_INVALID_ROOM_STATE", MatrixErrorCode::InvalidRoomState),
        ("M_THREEPID_IN_USE", MatrixErrorCode::ThreepidInUse),
        ("M_THREEPID_NOT_FOUND", MatrixErrorCode::ThreepidNotFound),
        ("M_THREEPID_AUTH_FAILED", MatrixErrorCode::ThreepidAuthFailed),
        ("M_THREEPID_DENIED", MatrixErrorCode::ThreepidDenied),
        ("M_SERVER_NOT_TRUSTED", MatrixErrorCode::ServerNotTrusted),
        ("M_UNSUPPORTED_ROOM_VERSION", MatrixErrorCode::UnsupportedRoomVersion),
        ("M_INCOMPATIBLE_ROOM_VERSION", MatrixErrorCode::IncompatibleRoomVersion),
        ("M_BAD_STATE", MatrixErrorCode::BadState),
        ("M_GUEST_ACCESS_FORBIDDEN", MatrixErrorCode::GuestAccessForbidden),
        ("M_CAPTCHA_NEEDED", MatrixErrorCode::CaptchaNeeded),
        ("M_CAPTCHA_INVALID", MatrixErrorCode::CaptchaInvalid),
        ("M_MISSING_PARAM", MatrixErrorCode::MissingParam),
        ("M_INVALID_PARAM", MatrixErrorCode::InvalidParam),
        ("M_TOO_LARGE", MatrixErrorCode::TooLarge),
        ("M_EXCLUSIVE", MatrixErrorCode::Exclusive),
        ("M_RESOURCE_LIMIT_EXCEEDED", MatrixErrorCode::ResourceLimitExceeded),
        (
            "M_CANNOT_LEAVE_SERVER_NOTICE_ROOM",
            MatrixErrorCode::CannotLeaveServerNoticeRoom,
        ),
    ];

    /// Parse an `errcode` string.
    ///
    /// Codes that carry the `M_` prefix but aren't otherwise recognized map
    /// to [`MatrixErrorCode::Unknown`], anything else to `None`.
    pub fn from_code(code: &str) -> Option<Self> {
        if !code.starts_with("M_") {
            return None;
        }

        Some(
            Self::CODES
                .iter()
                .find(|(s, _)| *s == code)
                .map(|(_, c)| *c)
                .unwrap_or(MatrixErrorCode::Unknown),
        )
    }

    /// The wire representation of this error code.
    pub fn as_str(&self) -> &'static str {
        Self::CODES
            .iter()
            .find(|(_, c)| c == self)
            .map(|(s, _)| *s)
            .expect("every error code has a wire representation")
    }
}

/// Errors the crypto engine can run into.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The inner Olm/Megolm primitive rejected an operation.
    #[error(transparent)]
    Olm(#[from] vodozemac::olm::DecryptionError),

    /// A Megolm group message failed to decrypt.
    #[error(transparent)]
    Megolm(#[from] vodozemac::megolm::DecryptionError),

    /// A pre-key message couldn't establish a new session.
    #[error(transparent)]
    SessionCreation(#[from] vodozemac::olm::SessionCreationError),

    /// A key or signature wasn't valid base64.
    #[error(transparent)]
    Key(#[from] vodozemac::KeyError),

    /// A Megolm session key couldn't be decoded.
    #[error(transparent)]
    SessionKey(#[from] vodozemac::megolm::SessionKeyDecodeError),

    /// An Olm message couldn't be decoded from its wire form.
    #[error(transparent)]
    Decode(#[from] vodozemac::DecodeError),

    /// The SAS handshake failed.
    #[error("SAS failure: {0}")]
    Sas(String),

    /// The same Megolm message index was seen with differing ciphertext.
    #[error("duplicate message index {index} for session {session_id}")]
    DuplicateMessageIndex {
        /// The replayed ratchet index.
        index: u32,
        /// The session the replay was seen on.
        session_id: String,
    },

    /// A signature was missing or didn't verify.
    #[error("invalid or missing signature")]
    Signature,

    /// The event is missing a field the engine needs.
    #[error("malformed event: {0}")]
    MalformedEvent(&'static str),

    /// No Olm session with the sending device exists.
    #[error("no Olm session for sender key {0}")]
    MissingSession(String),

    /// No outbound group session exists for the room.
    #[error("no outbound group session for room {0}")]
    MissingOutboundSession(String),

    /// The engine identity was already bound to a user and device.
    #[error("user and device details may only be set once")]
    IdentityAlreadySet,

    /// The engine identity wasn't bound yet.
    #[error("user and device details not set")]
    IdentityNotSet,
}

/// Low level transport failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The HTTP client failed to connect or talk to the server.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-2xx status and no Matrix error body.
    #[error("unexpected HTTP status {0}")]
    Status(http::StatusCode),
}

/// The high level error type all fallible operations of this crate return.
#[derive(Debug, Error)]
pub enum Error {
    /// Connecting to or talking with the homeserver failed before a
    /// well-formed Matrix error could be read.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The homeserver answered with a well-formed Matrix error.
    #[error("homeserver error {code:?}: {message}")]
    Matrix {
        /// The parsed `errcode`.
        code: MatrixErrorCode,
        /// The human readable `error` message.
        message: String,
        /// Backoff hint, only set for `M_LIMIT_EXCEEDED`.
        retry_after_ms: Option<u64>,
    },

    /// A response or event wasn't the JSON shape we expected.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// The operation was cancelled by a caller or internal canceller.
    #[error("operation cancelled")]
    Cancelled,

    /// A probe didn't answer within its timeout.
    #[error("request timed out")]
    TimedOut,

    /// A cipher or crypto primitive failure.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// A persisted pickle had an unknown version or didn't decode.
    #[error("unknown or corrupt pickle: {0}")]
    PickleFormat(String),

    /// The pusher endpoint is not a UnifiedPush Matrix gateway.
    #[error("bad push gateway: {0}")]
    BadPushGateway(String),

    /// A locally stored resource is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// An I/O error while streaming a file.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        Error::Transport(TransportError::Http(error))
    }
}

impl Error {
    /// Map a JSON response body to a Matrix error, if it is one.
    ///
    /// A JSON object containing an `errcode` member starting with `M_` is a
    /// homeserver error; the `retry_after_ms` hint is carried over for
    /// `M_LIMIT_EXCEEDED` so callers can implement backoff.
    pub fn from_json_body(body: &Value) -> Option<Self> {
        let object = body.as_object()?;
        let errcode = object.get("errcode")?.as_str()?;
        let code = MatrixErrorCode::from_code(errcode)?;

        let message = object
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("Unknown Error")
            .to_owned();
        let retry_after_ms = if code == MatrixErrorCode::LimitExceeded {
            object.get("retry_after_ms").and_then(Value::as_u64)
        } else {
            None
        };

        Some(Error::Matrix { code, message, retry_after_ms })
    }
}
