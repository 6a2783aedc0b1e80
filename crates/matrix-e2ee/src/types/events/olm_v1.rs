// Copyright 2022 The Matrix.org Foundation C.I.C.
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

//! The plaintext payload of an Olm-encrypted to-device event.
//!
//! The payload binds the sender, the recipient, and both parties' ed25519
//! keys; every one of those bindings is checked after decryption to defeat
//! relayed and misdirected messages.

use std::fmt::Debug;

use ruma::{OwnedUserId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use vodozemac::Ed25519PublicKey;

use super::{
    dummy::DummyEventContent, forwarded_room_key::ForwardedRoomKeyContent, from_str,
    room_key::RoomKeyContent, EventType,
};
use crate::types::{deserialize_ed25519_key, serialize_ed25519_key};

/// An `m.room_key` event decrypted from an Olm envelope.
pub type DecryptedRoomKeyEvent = DecryptedOlmEvent<RoomKeyContent>;

/// An `m.forwarded_room_key` event decrypted from an Olm envelope.
pub type DecryptedForwardedRoomKeyEvent = DecryptedOlmEvent<ForwardedRoomKeyContent>;

/// An `m.dummy` event decrypted from an Olm envelope.
pub type DecryptedDummyEvent = DecryptedOlmEvent<DummyEventContent>;

/// The decrypted payload of an `m.olm.v1.curve25519-aes-sha2` to-device
/// event.
#[derive(Clone, Debug, Deserialize)]
pub struct DecryptedOlmEvent<C>
where
    C: EventType + Debug + Sized + Serialize,
{
    /// The sender of the event, as claimed inside the encrypted payload.
    pub sender: OwnedUserId,
    /// The intended recipient of the event.
    pub recipient: OwnedUserId,
    /// The sender's signing keys.
    pub keys: OlmEventKeys,
    /// The recipient's signing keys.
    pub recipient_keys: OlmEventKeys,
    /// The content of the event.
    pub content: C,
}

impl<C: EventType + Debug + Sized + Serialize> Serialize for DecryptedOlmEvent<C> {
    /// Serialization needs to reintroduce the `type` field, which on the Rust
    /// side is expressed by the generic parameter `C`.
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        #[derive(Serialize)]
        struct Helper<'a, C: Serialize> {
            sender: &'a UserId,
            recipient: &'a UserId,
            keys: &'a OlmEventKeys,
            recipient_keys: &'a OlmEventKeys,
            content: &'a C,
            #[serde(rename = "type")]
            event_type: &'a str,
        }

        let event = Helper {
            sender: &self.sender,
            recipient: &self.recipient,
            keys: &self.keys,
            recipient_keys: &self.recipient_keys,
            content: &self.content,
            event_type: self.content.event_type(),
        };

        event.serialize(serializer)
    }
}

/// The signing keys embedded in an Olm event payload.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OlmEventKeys {
    /// The ed25519 key of the payload.
    #[serde(
        deserialize_with = "deserialize_ed25519_key",
        serialize_with = "serialize_ed25519_key"
    )]
    pub ed25519: Ed25519PublicKey,
}

/// An enum over the to-device event types this crate knows how to handle
/// after Olm decryption.
#[derive(Debug)]
pub enum AnyDecryptedOlmEvent {
    /// The `m.room_key` event, carrying a fresh Megolm session.
    RoomKey(DecryptedRoomKeyEvent),
    /// The `m.forwarded_room_key` event, answering a room key request.
    ForwardedRoomKey(DecryptedForwardedRoomKeyEvent),
    /// The `m.dummy` event, sent only to establish a session.
    Dummy(DecryptedDummyEvent),
}

impl AnyDecryptedOlmEvent {
    /// The sender of the event, as claimed inside the encrypted payload.
    pub fn sender(&self) -> &UserId {
        match self {
            AnyDecryptedOlmEvent::RoomKey(e) => &e.sender,
            AnyDecryptedOlmEvent::ForwardedRoomKey(e) => &e.sender,
            AnyDecryptedOlmEvent::Dummy(e) => &e.sender,
        }
    }

    /// The intended recipient of the event.
    pub fn recipient(&self) -> &UserId {
        match self {
            AnyDecryptedOlmEvent::RoomKey(e) => &e.recipient,
            AnyDecryptedOlmEvent::ForwardedRoomKey(e) => &e.recipient,
            AnyDecryptedOlmEvent::Dummy(e) => &e.recipient,
        }
    }

    /// The sender's signing keys of the event.
    pub fn keys(&self) -> &OlmEventKeys {
        match self {
            AnyDecryptedOlmEvent::RoomKey(e) => &e.keys,
            AnyDecryptedOlmEvent::ForwardedRoomKey(e) => &e.keys,
            AnyDecryptedOlmEvent::Dummy(e) => &e.keys,
        }
    }

    /// The recipient's signing keys of the event.
    pub fn recipient_keys(&self) -> &OlmEventKeys {
        match self {
            AnyDecryptedOlmEvent::RoomKey(e) => &e.recipient_keys,
            AnyDecryptedOlmEvent::ForwardedRoomKey(e) => &e.recipient_keys,
            AnyDecryptedOlmEvent::Dummy(e) => &e.recipient_keys,
        }
    }

    /// The event type of the payload.
    pub fn event_type(&self) -> &str {
        match self {
            AnyDecryptedOlmEvent::RoomKey(e) => e.content.event_type(),
            AnyDecryptedOlmEvent::ForwardedRoomKey(e) => e.content.event_type(),
            AnyDecryptedOlmEvent::Dummy(e) => e.content.event_type(),
        }
    }
}

impl<'de> Deserialize<'de> for AnyDecryptedOlmEvent {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Debug, Deserialize)]
        struct Helper<'a> {
            #[serde(rename = "type")]
            event_type: &'a str,
        }

        let json = Box::<RawValue>::deserialize(deserializer)?;
        let helper: Helper<'_> =
            serde_json::from_str(json.get()).map_err(serde::de::Error::custom)?;

        let json = json.get();

        Ok(match helper.event_type {
            RoomKeyContent::EVENT_TYPE => AnyDecryptedOlmEvent::RoomKey(from_str(json)?),
            ForwardedRoomKeyContent::EVENT_TYPE => {
                AnyDecryptedOlmEvent::ForwardedRoomKey(from_str(json)?)
            }
            DummyEventContent::EVENT_TYPE => AnyDecryptedOlmEvent::Dummy(from_str(json)?),
            other => {
                return Err(serde::de::Error::custom(format!(
                    "unsupported decrypted to-device event type {other}"
                )))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use vodozemac::megolm::{GroupSession, SessionConfig};

    use super::AnyDecryptedOlmEvent;

    #[test]
    fn room_key_event_deserialization() {
        let alice = vodozemac::olm::Account::new();
        let bob = vodozemac::olm::Account::new();
        let session = GroupSession::new(SessionConfig::version_1());

        let json = json!({
            "sender": "@alice:localhost",
            "recipient": "@bob:localhost",
            "keys": { "ed25519": alice.ed25519_key().to_base64() },
            "recipient_keys": { "ed25519": bob.ed25519_key().to_base64() },
            "type": "m.room_key",
            "content": {
                "algorithm": "m.megolm.v1.aes-sha2",
                "room_id": "!test:localhost",
                "session_id": session.session_id(),
                "session_key": session.session_key(),
            }
        });

        let event: AnyDecryptedOlmEvent = serde_json::from_value(json).unwrap();
        assert!(matches!(event, AnyDecryptedOlmEvent::RoomKey(_)));
        assert_eq!(event.sender().as_str(), "@alice:localhost");
    }
}
