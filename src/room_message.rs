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

//! Room message value object.

use serde_json::{json, Value};

/// What kind of content a room message carries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MessageType {
    /// A plain text message.
    #[default]
    Text,
    /// A file attachment.
    File,
    /// An image attachment.
    Image,
}

impl MessageType {
    /// The `msgtype` wire value.
    pub fn msgtype(&self) -> &'static str {
        match self {
            MessageType::Text => "m.text",
            MessageType::File => "m.file",
            MessageType::Image => "m.image",
        }
    }
}

/// A message to be sent into a room.
///
/// The transaction id makes the send idempotent across retries.
#[derive(Clone, Debug, Default)]
pub struct RoomMessage {
    kind: MessageType,
    transaction_id: Option<String>,
    plain_text: Option<String>,
}

impl RoomMessage {
    /// Create a message of the given kind.
    pub fn new(kind: MessageType) -> Self {
        Self { kind, ..Default::default() }
    }

    /// The kind of this message.
    pub fn kind(&self) -> MessageType {
        self.kind
    }

    /// Set the client-generated transaction id used for deduplication.
    pub fn set_transaction_id(&mut self, transaction_id: impl Into<String>) {
        self.transaction_id = Some(transaction_id.into());
    }

    /// The transaction id, if one was set.
    pub fn transaction_id(&self) -> Option<&str> {
        self.transaction_id.as_deref()
    }

    /// Set the plain text body; only meaningful for text messages.
    pub fn set_plain(&mut self, text: impl Into<String>) {
        debug_assert_eq!(self.kind, MessageType::Text);
        self.plain_text = Some(text.into());
    }

    /// The plain text body.
    pub fn plain(&self) -> Option<&str> {
        self.plain_text.as_deref()
    }

    /// The `m.room.message` content for this message.
    pub fn content_json(&self) -> Value {
        json!({
            "msgtype": self.kind.msgtype(),
            "body": self.plain_text.as_deref().unwrap_or(""),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_message_content() {
        let mut message = RoomMessage::new(MessageType::Text);
        message.set_plain("follow the white rabbit");
        message.set_transaction_id("txn-1");

        assert_eq!(message.kind(), MessageType::Text);
        assert_eq!(message.plain(), Some("follow the white rabbit"));
        assert_eq!(message.transaction_id(), Some("txn-1"));

        let content = message.content_json();
        assert_eq!(content["msgtype"], "m.text");
        assert_eq!(content["body"], "follow the white rabbit");
    }
}
