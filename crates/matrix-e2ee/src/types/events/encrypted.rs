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

//! Content types for `m.room.encrypted` events, both the room and the
//! to-device flavor.

use std::collections::BTreeMap;

use ruma::{OwnedDeviceId, OwnedUserId};
use serde::{Deserialize, Serialize};
use vodozemac::{megolm::MegolmMessage, olm::OlmMessage, Curve25519PublicKey};

use super::EventType;
use crate::types::{deserialize_curve_key, serialize_curve_key};

/// An `m.room.encrypted` event carrying an encrypted room message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptedEvent {
    /// The user that sent the event.
    pub sender: OwnedUserId,
    /// The encrypted content.
    pub content: RoomEncryptedEventContent,
}

/// The content of an `m.room.encrypted` room event, keyed by the algorithm
/// that was used to encrypt it.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "algorithm")]
pub enum RoomEncryptedEventContent {
    /// Content encrypted with the Megolm group algorithm.
    #[serde(rename = "m.megolm.v1.aes-sha2")]
    MegolmV1AesSha2(MegolmV1AesSha2Content),
    /// Content encrypted with per-device Olm sessions; used by rooms that are
    /// configured for the Olm algorithm.
    #[serde(rename = "m.olm.v1.curve25519-aes-sha2")]
    OlmV1Curve25519AesSha2(OlmV1Curve25519AesSha2Content),
}

impl EventType for RoomEncryptedEventContent {
    const EVENT_TYPE: &'static str = "m.room.encrypted";
}

/// The Megolm encrypted content of an `m.room.encrypted` event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MegolmV1AesSha2Content {
    /// The curve25519 identity key of the device that encrypted the event.
    #[serde(
        serialize_with = "serialize_curve_key",
        deserialize_with = "deserialize_curve_key"
    )]
    pub sender_key: Curve25519PublicKey,
    /// The id of the device that encrypted the event.
    pub device_id: OwnedDeviceId,
    /// The id of the Megolm session that encrypted the event.
    pub session_id: String,
    /// The actual ciphertext.
    pub ciphertext: MegolmMessage,
}

/// The Olm encrypted content of an `m.room.encrypted` event.
///
/// The same shape is used for encrypted to-device events; the ciphertext map
/// carries one Olm message per recipient device, keyed by the recipient's
/// curve25519 identity key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OlmV1Curve25519AesSha2Content {
    /// The curve25519 identity key of the device that encrypted the event.
    #[serde(
        serialize_with = "serialize_curve_key",
        deserialize_with = "deserialize_curve_key"
    )]
    pub sender_key: Curve25519PublicKey,
    /// Per-recipient-device ciphertexts, keyed by the recipient's base64
    /// curve25519 identity key.
    pub ciphertext: BTreeMap<String, OlmMessage>,
}

/// The content of an encrypted to-device event.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "algorithm")]
pub enum ToDeviceEncryptedEventContent {
    /// Content encrypted with the one-to-one Olm algorithm.
    #[serde(rename = "m.olm.v1.curve25519-aes-sha2")]
    OlmV1Curve25519AesSha2(OlmV1Curve25519AesSha2Content),
}

impl EventType for ToDeviceEncryptedEventContent {
    const EVENT_TYPE: &'static str = "m.room.encrypted";
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use vodozemac::{
        megolm::{GroupSession, SessionConfig},
        olm::Account,
    };

    use super::{RoomEncryptedEventContent, ToDeviceEncryptedEventContent};

    #[test]
    fn megolm_content_round_trip() {
        let mut session = GroupSession::new(SessionConfig::version_1());
        let ciphertext = session.encrypt("plaintext");

        let json = json!({
            "algorithm": "m.megolm.v1.aes-sha2",
            "sender_key": "Nn0L2hkcCMFKqynTjyGsJbth7QrVmX3lbrksMkrGOAw",
            "device_id": "DEWRCMENGS",
            "session_id": session.session_id(),
            "ciphertext": ciphertext,
        });

        let content: RoomEncryptedEventContent = serde_json::from_value(json.clone()).unwrap();
        assert!(matches!(content, RoomEncryptedEventContent::MegolmV1AesSha2(_)));
        assert_eq!(serde_json::to_value(&content).unwrap(), json);
    }

    #[test]
    fn olm_content_round_trip() {
        let alice = Account::new();
        let mut bob = Account::new();
        bob.generate_one_time_keys(1);

        let one_time_key = *bob.one_time_keys().values().next().unwrap();
        let mut session = alice.create_outbound_session(
            vodozemac::olm::SessionConfig::version_1(),
            bob.curve25519_key(),
            one_time_key,
        );
        let message = session.encrypt("it's a secret to everybody");

        let json = json!({
            "algorithm": "m.olm.v1.curve25519-aes-sha2",
            "sender_key": alice.curve25519_key(),
            "ciphertext": {
                (bob.curve25519_key().to_base64()): message,
            }
        });

        let content: ToDeviceEncryptedEventContent = serde_json::from_value(json).unwrap();
        let ToDeviceEncryptedEventContent::OlmV1Curve25519AesSha2(content) = content;

        assert_eq!(content.ciphertext.len(), 1);
        assert!(content.ciphertext.contains_key(&bob.curve25519_key().to_base64()));
    }
}
