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
use vodozemac::megolm::SessionKey;

use super::EventType;
use crate::types::EventEncryptionAlgorithm;

/// The content of an `m.room_key` event.
///
/// The event is only ever sent inside an Olm envelope; the `session_key`
/// inside it is self-signed, so the creator of the Megolm session is implied
/// by the Olm channel the event arrived through.
#[derive(Serialize, Deserialize)]
pub struct RoomKeyContent {
    /// The algorithm the session key is to be used with.
    pub algorithm: EventEncryptionAlgorithm,
    /// The room the session is scoped to.
    pub room_id: OwnedRoomId,
    /// The unique id of the session.
    pub session_id: String,
    /// The actual Megolm session key.
    pub session_key: SessionKey,
}

impl fmt::Debug for RoomKeyContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomKeyContent")
            .field("algorithm", &self.algorithm)
            .field("room_id", &self.room_id)
            .field("session_id", &self.session_id)
            .finish()
    }
}

impl RoomKeyContent {
    /// Create a new `m.room_key` content for a Megolm v1 session.
    pub fn new(room_id: OwnedRoomId, session_id: String, session_key: SessionKey) -> Self {
        Self {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            room_id,
            session_id,
            session_key,
        }
    }
}

impl EventType for RoomKeyContent {
    const EVENT_TYPE: &'static str = "m.room_key";
}
