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

//! The Matrix event types this crate recognizes.
//!
//! Only `m.room.encrypted`, `m.room_key` and friends get special treatment
//! by the encryption engine; everything else is carried through opaquely.

/// A recognized Matrix event type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum EventType {
    CallAnswer,
    CallAssertedIdentity,
    CallAssertedIdentityPrefix,
    CallCandidates,
    CallHangup,
    CallInvite,
    CallNegotiate,
    CallReject,
    CallReplaces,
    CallSelectAnswer,
    Direct,
    Dummy,
    ForwardedRoomKey,
    FullyRead,
    IgnoredUserList,
    KeyVerificationAccept,
    KeyVerificationCancel,
    KeyVerificationDone,
    KeyVerificationKey,
    KeyVerificationMac,
    KeyVerificationReady,
    KeyVerificationRequest,
    KeyVerificationStart,
    Presence,
    PushRules,
    Reaction,
    Receipt,
    RoomAliases,
    RoomAvatar,
    RoomBotOptions,
    RoomCanonicalAlias,
    RoomCreate,
    RoomEncrypted,
    RoomEncryption,
    RoomGuestAccess,
    RoomHistoryVisibility,
    RoomJoinRules,
    RoomKey,
    RoomKeyRequest,
    RoomMember,
    RoomMessage,
    RoomMessageFeedback,
    RoomName,
    RoomPinnedEvents,
    RoomPlumbing,
    RoomPowerLevels,
    RoomRedaction,
    RoomRelatedGroups,
    RoomServerAcl,
    RoomThirdPartyInvite,
    RoomTombstone,
    RoomTopic,
    SecretRequest,
    SecretSend,
    SecretStorageDefaultKey,
    SpaceChild,
    SpaceParent,
    Sticker,
    Tag,
    Typing,
    /// Any event type we don't know; passed through untouched.
    Unknown,
}

const EVENT_TYPES: &[(&str, EventType)] = &[
    ("m.call.answer", EventType::CallAnswer),
    ("m.call.asserted_identity", EventType::CallAssertedIdentity),
    ("org.matrix.call.asserted_identity", EventType::CallAssertedIdentityPrefix),
    ("m.call.candidates", EventType::CallCandidates),
    ("m.call.hangup", EventType::CallHangup),
    ("m.call.invite", EventType::CallInvite),
    ("m.call.negotiate", EventType::CallNegotiate),
    ("m.call.reject", EventType::CallReject),
    ("m.call.replaces", EventType::CallReplaces),
    ("m.call.select_answer", EventType::CallSelectAnswer),
    ("m.direct", EventType::Direct),
    ("m.dummy", EventType::Dummy),
    ("m.forwarded_room_key", EventType::ForwardedRoomKey),
    ("m.fully_read", EventType::FullyRead),
    ("m.ignored_user_list", EventType::IgnoredUserList),
    ("m.key.verification.accept", EventType::KeyVerificationAccept),
    ("m.key.verification.cancel", EventType::KeyVerificationCancel),
    ("m.key.verification.done", EventType::KeyVerificationDone),
    ("m.key.verification.key", EventType::KeyVerificationKey),
    ("m.key.verification.mac", EventType::KeyVerificationMac),
    ("m.key.verification.ready", EventType::KeyVerificationReady),
    ("m.key.verification.request", EventType::KeyVerificationRequest),
    ("m.key.verification.start", EventType::KeyVerificationStart),
    ("m.presence", EventType::Presence),
    ("m.push_rules", EventType::PushRules),
    ("m.reaction", EventType::Reaction),
    ("m.receipt", EventType::Receipt),
    ("m.room.aliases", EventType::RoomAliases),
    ("m.room.avatar", EventType::RoomAvatar),
    ("m.room.bot.options", EventType::RoomBotOptions),
    ("m.room.canonical_alias", EventType::RoomCanonicalAlias),
    ("m.room.create", EventType::RoomCreate),
    ("m.room.encrypted", EventType::RoomEncrypted),
    ("m.room.encryption", EventType::RoomEncryption),
    ("m.room.guest_access", EventType::RoomGuestAccess),
    ("m.room.history_visibility", EventType::RoomHistoryVisibility),
    ("m.room.join_rules", EventType::RoomJoinRules),
    ("m.room_key", EventType::RoomKey),
    ("m.room_key.request", EventType::RoomKeyRequest),
    ("m.room.member", EventType::RoomMember),
    ("m.room.message", EventType::RoomMessage),
    ("m.room.message.feedback", EventType::RoomMessageFeedback),
    ("m.room.name", EventType::RoomName),
    ("m.room.pinned_events", EventType::RoomPinnedEvents),
    ("m.room.plumbing", EventType::RoomPlumbing),
    ("m.room.power_levels", EventType::RoomPowerLevels),
    ("m.room.redaction", EventType::RoomRedaction),
    ("m.room.related_groups", EventType::RoomRelatedGroups),
    ("m.room.server_acl", EventType::RoomServerAcl),
    ("m.room.third_party_invite", EventType::RoomThirdPartyInvite),
    ("m.room.tombstone", EventType::RoomTombstone),
    ("m.room.topic", EventType::RoomTopic),
    ("m.secret.request", EventType::SecretRequest),
    ("m.secret.send", EventType::SecretSend),
    ("m.secret_storage.default_key", EventType::SecretStorageDefaultKey),
    ("m.space.child", EventType::SpaceChild),
    ("m.space.parent", EventType::SpaceParent),
    ("m.sticker", EventType::Sticker),
    ("m.tag", EventType::Tag),
    ("m.typing", EventType::Typing),
];

impl EventType {
    /// Parse a wire event type string.
    pub fn parse(s: &str) -> Self {
        EVENT_TYPES
            .iter()
            .find(|(name, _)| *name == s)
            .map(|(_, ty)| *ty)
            .unwrap_or(EventType::Unknown)
    }

    /// The wire representation, `None` for [`EventType::Unknown`].
    pub fn as_str(&self) -> Option<&'static str> {
        EVENT_TYPES.iter().find(|(_, ty)| ty == self).map(|(name, _)| *name)
    }

    /// Whether this is one of the `m.key.verification.*` events.
    pub fn is_verification(&self) -> bool {
        matches!(
            self,
            EventType::KeyVerificationAccept
                | EventType::KeyVerificationCancel
                | EventType::KeyVerificationDone
                | EventType::KeyVerificationKey
                | EventType::KeyVerificationMac
                | EventType::KeyVerificationReady
                | EventType::KeyVerificationRequest
                | EventType::KeyVerificationStart
        )
    }
}

impl std::str::FromStr for EventType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trip() {
        for &(name, ty) in EVENT_TYPES {
            assert_eq!(EventType::parse(name), ty);
            assert_eq!(ty.as_str(), Some(name));
        }
    }

    #[test]
    fn unknown_types_pass_through() {
        assert_eq!(EventType::parse("m.something.else"), EventType::Unknown);
        assert_eq!(EventType::Unknown.as_str(), None);
    }

    #[test]
    fn verification_family() {
        assert!(EventType::parse("m.key.verification.start").is_verification());
        assert!(EventType::parse("m.key.verification.mac").is_verification());
        assert!(!EventType::parse("m.room_key").is_verification());
    }
}
