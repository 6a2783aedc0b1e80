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

mod inbound;
mod outbound;

use serde::{Deserialize, Serialize};
use ruma::OwnedRoomId;
use vodozemac::{megolm::ExportedSessionKey, Curve25519PublicKey, Ed25519PublicKey};

pub use inbound::{InboundGroupSession, PickledInboundGroupSession};
pub(crate) use outbound::ShareState;
pub use outbound::{
    EncryptionSettings, OutboundGroupSession, PickledOutboundGroupSession, ShareInfo,
};

use crate::types::{
    deserialize_curve_key, deserialize_ed25519_key, serialize_curve_key, serialize_ed25519_key,
    events::forwarded_room_key::ForwardedRoomKeyContent,
    EventEncryptionAlgorithm,
};

/// The keys the creator of a session claimed to own.
///
/// Nothing proves the claim for imported or forwarded sessions; events
/// decrypted with such a session must be displayed accordingly.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SenderClaimedKeys {
    /// The claimed ed25519 signing key.
    #[serde(
        rename = "ed25519",
        serialize_with = "serialize_ed25519_key",
        deserialize_with = "deserialize_ed25519_key"
    )]
    pub ed25519: Ed25519PublicKey,
}

/// An exported version of an [`InboundGroupSession`].
///
/// This is the shape sessions travel in when written to an export file or
/// forwarded to another device.
#[derive(Deserialize, Serialize)]
#[allow(missing_debug_implementations)]
pub struct ExportedRoomKey {
    /// The encryption algorithm the session uses.
    pub algorithm: EventEncryptionAlgorithm,

    /// The room where the session is used.
    pub room_id: OwnedRoomId,

    /// The curve25519 key of the device which initiated the session.
    #[serde(
        serialize_with = "serialize_curve_key",
        deserialize_with = "deserialize_curve_key"
    )]
    pub sender_key: Curve25519PublicKey,

    /// The id of the session.
    pub session_id: String,

    /// The ratchet state, exported at some message index.
    pub session_key: ExportedSessionKey,

    /// The claimed signing keys of the device which initiated the session.
    pub sender_claimed_keys: SenderClaimedKeys,

    /// Chain of curve25519 keys through which this session was forwarded,
    /// via `m.forwarded_room_key` events.
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,
}

/// A backed up version of an [`InboundGroupSession`].
///
/// Same as [`ExportedRoomKey`] minus the room and session ids, which the
/// backup structure carries on its outside.
#[derive(Deserialize, Serialize)]
#[allow(missing_debug_implementations)]
pub struct BackedUpRoomKey {
    /// The encryption algorithm the session uses.
    pub algorithm: EventEncryptionAlgorithm,

    /// The curve25519 key of the device which initiated the session.
    #[serde(
        serialize_with = "serialize_curve_key",
        deserialize_with = "deserialize_curve_key"
    )]
    pub sender_key: Curve25519PublicKey,

    /// The ratchet state, exported at some message index.
    pub session_key: ExportedSessionKey,

    /// The claimed signing keys of the device which initiated the session.
    pub sender_claimed_keys: SenderClaimedKeys,

    /// Chain of curve25519 keys through which this session was forwarded.
    #[serde(default)]
    pub forwarding_curve25519_key_chain: Vec<String>,
}

impl From<ExportedRoomKey> for BackedUpRoomKey {
    fn from(k: ExportedRoomKey) -> Self {
        Self {
            algorithm: k.algorithm,
            sender_key: k.sender_key,
            session_key: k.session_key,
            sender_claimed_keys: k.sender_claimed_keys,
            forwarding_curve25519_key_chain: k.forwarding_curve25519_key_chain,
        }
    }
}

impl From<ExportedRoomKey> for ForwardedRoomKeyContent {
    /// Convert an exported room key into the content of an
    /// `m.forwarded_room_key` event.
    fn from(k: ExportedRoomKey) -> Self {
        Self {
            algorithm: k.algorithm,
            room_id: k.room_id,
            sender_key: k.sender_key,
            session_id: k.session_id,
            session_key: k.session_key,
            sender_claimed_ed25519_key: k.sender_claimed_keys.ed25519,
            forwarding_curve25519_key_chain: k.forwarding_curve25519_key_chain,
        }
    }
}

impl From<ForwardedRoomKeyContent> for ExportedRoomKey {
    /// Convert the content of an `m.forwarded_room_key` event into an
    /// exported room key.
    fn from(content: ForwardedRoomKeyContent) -> Self {
        Self {
            algorithm: content.algorithm,
            room_id: content.room_id,
            sender_key: content.sender_key,
            session_id: content.session_id,
            session_key: content.session_key,
            sender_claimed_keys: SenderClaimedKeys { ed25519: content.sender_claimed_ed25519_key },
            forwarding_curve25519_key_chain: content.forwarding_curve25519_key_chain,
        }
    }
}
