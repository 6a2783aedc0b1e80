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

use std::fmt;

use ruma::OwnedRoomId;
use serde::{Deserialize, Serialize};
use vodozemac::{megolm::ExportedSessionKey, Curve25519PublicKey, Ed25519PublicKey};

use super::EventType;
use crate::types::{
    deserialize_curve_key, deserialize_ed25519_key, serialize_curve_key, serialize_ed25519_key,
    EventEncryptionAlgorithm,
};

/// The content of an `m.forwarded_room_key` event.
///
/// Unlike an `m.room_key`, the embedded session key is not self-signed, so
/// everything in here is merely a claim made by the forwarding device.
#[derive(Serialize, Deserialize)]
pub struct ForwardedRoomKeyContent {
    /// The algorithm the session key is to be used with.
    pub algorithm: EventEncryptionAlgorithm,
    /// The room the session is claimed to be scoped to.
    pub room_id: OwnedRoomId,
    /// The claimed curve25519 identity key of the device that created the
    /// session.
    #[serde(
        serialize_with = "serialize_curve_key",
        deserialize_with = "deserialize_curve_key"
    )]
    pub sender_key: Curve25519PublicKey,
    /// The unique id of the session.
    pub session_id: String,
    /// The exported Megolm session key.
    pub session_key: ExportedSessionKey,
    /// The claimed ed25519 key of the device that created the session.
    #[serde(
        serialize_with = "serialize_ed25519_key",
        deserialize_with = "deserialize_ed25519_key"
    )]
    pub sender_claimed_ed25519_key: Ed25519PublicKey,
    /// The chain of curve25519 keys the session was forwarded through, each
    /// forward appending the key of the previous holder.
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,
}

impl fmt::Debug for ForwardedRoomKeyContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardedRoomKeyContent")
            .field("algorithm", &self.algorithm)
            .field("room_id", &self.room_id)
            .field("sender_key", &self.sender_key)
            .field("session_id", &self.session_id)
            .field("sender_claimed_ed25519_key", &self.sender_claimed_ed25519_key)
            .field("forwarding_curve25519_key_chain", &self.forwarding_curve25519_key_chain)
            .finish()
    }
}

impl EventType for ForwardedRoomKeyContent {
    const EVENT_TYPE: &'static str = "m.forwarded_room_key";
}
