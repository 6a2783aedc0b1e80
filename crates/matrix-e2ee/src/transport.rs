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

//! The contract between the crypto machine and whatever does the actual
//! network IO.
//!
//! The machine never retries; transient failures are reported as
//! [`TransportError`] values and retrying is the caller's policy. Responses
//! may be delivered more than once, the machine treats all of them
//! idempotently.

use std::{collections::BTreeMap, fmt};

use async_trait::async_trait;
use ruma::{OwnedRoomId, OwnedTransactionId, OwnedUserId, DeviceId, TransactionId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::{DeviceKeys, OneTimeKeys, UsersDevicesMap};

/// The ways a transport operation can fail, collapsed into one sum type so
/// continuation logic has a single branch point.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The request never produced a response: connection refused, timeout,
    /// DNS failure.
    #[error("the network request failed: {0}")]
    Network(String),

    /// The server answered with a protocol-level error.
    #[error("the server returned an error, status {status}: {message}")]
    Api {
        /// The HTTP status code of the response.
        status: u16,
        /// The error message of the response.
        message: String,
    },

    /// Something that should never happen happened.
    #[error("unexpected transport failure: {0}")]
    Unexpected(String),
}

/// A request uploading our device keys and freshly generated one-time keys.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysUploadRequest {
    /// The signed device keys, present on the first upload only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_keys: Option<DeviceKeys>,
    /// Freshly generated signed one-time keys.
    pub one_time_keys: OneTimeKeys,
    /// Freshly generated signed fallback keys.
    #[serde(default)]
    pub fallback_keys: OneTimeKeys,
}

/// The response to a key upload.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysUploadResponse {
    /// How many one-time keys the server now holds for us, per algorithm.
    pub one_time_key_counts: BTreeMap<String, u64>,
}

/// A request for the device lists of the given users.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysQueryRequest {
    /// The users whose device keys we want.
    pub users: Vec<OwnedUserId>,
}

/// The response to a key query.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysQueryResponse {
    /// The signed device keys, per user and device.
    pub device_keys: UsersDevicesMap<DeviceKeys>,
    /// Homeservers that couldn't be reached.
    #[serde(default)]
    pub failures: BTreeMap<String, Value>,
}

/// A request claiming one one-time key per listed device.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysClaimRequest {
    /// The devices to claim keys for, mapped to the wanted key algorithm.
    pub one_time_keys: UsersDevicesMap<String>,
}

/// The response to a one-time key claim.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysClaimResponse {
    /// The claimed keys, per user and device. A device that ran out of keys
    /// has no entry.
    pub one_time_keys: UsersDevicesMap<OneTimeKeys>,
    /// Homeservers that couldn't be reached.
    #[serde(default)]
    pub failures: BTreeMap<String, Value>,
}

/// A batch of to-device messages of one event type.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToDeviceRequest {
    /// The type of the events being sent.
    pub event_type: String,
    /// The unique id of this request, used for deduplication on the server.
    pub txn_id: OwnedTransactionId,
    /// The per-device message contents. The device id `*` addresses all
    /// devices of a user.
    pub messages: UsersDevicesMap<Value>,
}

impl ToDeviceRequest {
    /// Create a new to-device request with a fresh transaction id, carrying
    /// one message for one recipient.
    pub fn new(
        recipient: &UserId,
        recipient_device: &DeviceId,
        event_type: &str,
        content: Value,
    ) -> Self {
        Self::with_id(recipient, recipient_device, event_type, content, TransactionId::new())
    }

    /// Create a new to-device request with the given transaction id.
    pub fn with_id(
        recipient: &UserId,
        recipient_device: &DeviceId,
        event_type: &str,
        content: Value,
        txn_id: OwnedTransactionId,
    ) -> Self {
        let mut messages = UsersDevicesMap::new();
        messages.insert(recipient, recipient_device, content);

        Self { event_type: event_type.to_owned(), txn_id, messages }
    }

    /// The device id that addresses every device of a user.
    pub fn all_devices() -> ruma::OwnedDeviceId {
        "*".into()
    }
}

/// The per-session payload stored in a key backup.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyBackupData {
    /// The first message index the backed up session can decrypt.
    pub first_message_index: u32,
    /// How many times the session was forwarded before we received it.
    pub forwarded_count: u32,
    /// Whether the device that created the session has been verified.
    pub is_verified: bool,
    /// The actual encrypted session data.
    pub session_data: EncryptedSessionData,
}

/// A session export, encrypted with the backup public key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptedSessionData {
    /// The unpadded base64 ephemeral curve25519 key of the encryption.
    pub ephemeral: String,
    /// The unpadded base64 ciphertext.
    pub ciphertext: String,
    /// The unpadded base64 message authentication code.
    pub mac: String,
}

/// The backed up sessions of one room.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RoomKeyBackup {
    /// The sessions, keyed by session id.
    pub sessions: BTreeMap<String, KeyBackupData>,
}

/// A request uploading a batch of encrypted room keys to the backup.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeysBackupRequest {
    /// The version of the backup that is being written to.
    pub version: String,
    /// The encrypted room keys, grouped by room.
    pub rooms: BTreeMap<OwnedRoomId, RoomKeyBackup>,
}

/// The response to a key backup download.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KeysBackupResponse {
    /// The encrypted room keys held by the server, grouped by room.
    pub rooms: BTreeMap<OwnedRoomId, RoomKeyBackup>,
}

/// The network operations the crypto machine needs a homeserver to perform.
///
/// Implementations own the HTTP stack, authentication, and the retry policy.
#[async_trait]
pub trait CryptoTransport: fmt::Debug + Send + Sync {
    /// Upload device keys and one-time keys.
    async fn upload_keys(
        &self,
        request: KeysUploadRequest,
    ) -> Result<KeysUploadResponse, TransportError>;

    /// Query the device lists of a set of users.
    async fn query_keys(
        &self,
        request: KeysQueryRequest,
    ) -> Result<KeysQueryResponse, TransportError>;

    /// Claim one-time keys so Olm sessions can be established.
    async fn claim_keys(
        &self,
        request: KeysClaimRequest,
    ) -> Result<KeysClaimResponse, TransportError>;

    /// Send a batch of to-device events.
    async fn send_to_device(&self, request: ToDeviceRequest) -> Result<(), TransportError>;

    /// Upload a batch of encrypted room keys to the server-side backup.
    async fn upload_backup(&self, request: KeysBackupRequest) -> Result<(), TransportError>;

    /// Download all encrypted room keys of the given backup version.
    async fn download_backup(&self, version: &str) -> Result<KeysBackupResponse, TransportError>;
}
