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

use ruma::{OwnedDeviceId, OwnedRoomId, OwnedTransactionId};
use serde::{Deserialize, Serialize};
use vodozemac::Curve25519PublicKey;

use super::EventType;
use crate::types::{deserialize_curve_key, serialize_curve_key, EventEncryptionAlgorithm};

/// The body of an `m.room_key_request`, identifying one specific room key.
///
/// Two requests for the same `RequestedKeyInfo` are requests for the same
/// thing and must be deduplicated to a single outgoing request.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestedKeyInfo {
    /// The algorithm of the requested session.
    pub algorithm: EventEncryptionAlgorithm,
    /// The room the requested session is used in.
    pub room_id: OwnedRoomId,
    /// The curve25519 key of the device that created the session.
    #[serde(
        serialize_with = "serialize_curve_key",
        deserialize_with = "deserialize_curve_key"
    )]
    pub sender_key: Curve25519PublicKey,
    /// The unique id of the requested session.
    pub session_id: String,
}

impl RequestedKeyInfo {
    /// Create a new info for a Megolm v1 session.
    pub fn new(
        algorithm: EventEncryptionAlgorithm,
        room_id: OwnedRoomId,
        sender_key: Curve25519PublicKey,
        session_id: String,
    ) -> Self {
        Self { algorithm, room_id, sender_key, session_id }
    }

    /// Serialize the info into a stable string, usable as a store key for
    /// deduplication.
    pub fn as_key(&self) -> String {
        format!("{}|{}|{}|{}", self.algorithm, self.room_id, self.sender_key.to_base64(), self.session_id)
    }
}

/// The action of an `m.room_key_request` event.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum RoomKeyRequestAction {
    /// A new request for a room key.
    #[serde(rename = "request")]
    Request,
    /// A cancellation of a previously sent request.
    #[serde(rename = "request_cancellation")]
    CancelRequest,
}

/// The content of an `m.room_key_request` event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoomKeyRequestContent {
    /// Whether this is a request or the cancellation of one.
    pub action: RoomKeyRequestAction,
    /// The requested key. Absent for cancellations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<RequestedKeyInfo>,
    /// The device that is requesting the key.
    pub requesting_device_id: OwnedDeviceId,
    /// The unique id of the request; a cancellation carries the id of the
    /// request it cancels.
    pub request_id: OwnedTransactionId,
}

impl RoomKeyRequestContent {
    /// Create a new request content for the given key info.
    pub fn new_request(
        body: RequestedKeyInfo,
        requesting_device_id: OwnedDeviceId,
        request_id: OwnedTransactionId,
    ) -> Self {
        Self {
            action: RoomKeyRequestAction::Request,
            body: Some(body),
            requesting_device_id,
            request_id,
        }
    }

    /// Create a cancellation content for the request with the given id.
    pub fn new_cancellation(
        requesting_device_id: OwnedDeviceId,
        request_id: OwnedTransactionId,
    ) -> Self {
        Self {
            action: RoomKeyRequestAction::CancelRequest,
            body: None,
            requesting_device_id,
            request_id,
        }
    }
}

impl EventType for RoomKeyRequestContent {
    const EVENT_TYPE: &'static str = "m.room_key_request";
}

#[cfg(test)]
mod tests {
    use ruma::room_id;
    use serde_json::json;
    use vodozemac::Curve25519PublicKey;

    use super::{RequestedKeyInfo, RoomKeyRequestAction, RoomKeyRequestContent};
    use crate::types::EventEncryptionAlgorithm;

    #[test]
    fn request_round_trip() {
        let json = json!({
            "action": "request",
            "body": {
                "algorithm": "m.megolm.v1.aes-sha2",
                "room_id": "!room:localhost",
                "sender_key": "RF3s+E7RkTQTGF2d8Deol0FkQvgII2aJDf3/Jp5mxVU",
                "session_id": "X3lUlvLELLYxeTx4yOVu6UDpasGEVO0Jbu+QFnm0cKQ"
            },
            "request_id": "1495474790150.19",
            "requesting_device_id": "RJYKSTBOIE"
        });

        let content: RoomKeyRequestContent = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(content.action, RoomKeyRequestAction::Request);

        let body = content.body.as_ref().unwrap();
        assert_eq!(body.room_id, room_id!("!room:localhost"));
        assert_eq!(body.algorithm, EventEncryptionAlgorithm::MegolmV1AesSha2);

        assert_eq!(serde_json::to_value(&content).unwrap(), json);
    }

    #[test]
    fn info_key_is_stable() {
        let sender_key =
            Curve25519PublicKey::from_base64("RF3s+E7RkTQTGF2d8Deol0FkQvgII2aJDf3/Jp5mxVU")
                .unwrap();

        let a = RequestedKeyInfo::new(
            EventEncryptionAlgorithm::MegolmV1AesSha2,
            room_id!("!room:localhost").to_owned(),
            sender_key,
            "session".to_owned(),
        );
        let b = a.clone();

        assert_eq!(a.as_key(), b.as_key());
    }
}
