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

//! Persistence for the crypto state.
//!
//! Everything the machine mutates goes through [`Changes`] batches handed to
//! a [`CryptoStore`] implementation, which must write them durably before
//! returning; losing this state silently downgrades security (verified
//! devices would revert to unknown ones).

pub mod caches;
mod memorystore;

use std::{collections::HashMap, fmt, ops::Deref, sync::Arc};

use async_trait::async_trait;
use ruma::{
    OwnedRoomId, OwnedUserId, DeviceId, RoomId, TransactionId, UserId,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use vodozemac::{megolm::SessionOrdering, Curve25519PublicKey};

pub use memorystore::MemoryStore;

use crate::{
    gossip::OutgoingKeyRequest,
    identities::{DeviceData, UserDevices},
    olm::{
        InboundGroupSession, OlmMessageHash, OutboundGroupSession, PickledAccount, Session,
    },
    types::{events::room_key_request::RequestedKeyInfo, EventEncryptionAlgorithm},
};

/// The error type for the storage layer.
#[derive(Debug, Error)]
pub enum CryptoStoreError {
    /// The store detected at open time that its content is corrupted. The
    /// only safe reaction is wiping the store and re-bootstrapping the whole
    /// crypto state; a partial repair would silently downgrade trust.
    #[error("the crypto store is corrupted, the crypto state needs to be re-initialized")]
    Corrupted,

    /// A value in the store couldn't be (de)serialized.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// A pickled Olm object in the store couldn't be restored.
    #[error(transparent)]
    Pickle(#[from] vodozemac::PickleError),

    /// The backing storage reported an error.
    #[error("the underlying store failed: {0}")]
    Backend(String),
}

/// The result type for the storage layer.
pub type Result<T, E = CryptoStoreError> = std::result::Result<T, E>;

/// How up to date our copy of a user's device list is.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeviceTrackingStatus {
    /// We don't track the device list of this user.
    #[default]
    NotTracked,
    /// The device list is outdated and a key query needs to be sent out.
    PendingDownload,
    /// A key query for the user is in flight.
    Downloading,
    /// The device list is up to date.
    UpToDate,
    /// The last key query failed; the list stays outdated until the server
    /// becomes reachable again.
    UnreachableServer,
}

/// Per-room encryption configuration.
///
/// The algorithm is write-once: once a room is configured, an event claiming
/// a different algorithm is a policy violation and is rejected.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomSettings {
    /// The algorithm the room encrypts events with.
    pub algorithm: EventEncryptionAlgorithm,
    /// Should unverified devices be excluded from the room key in this room.
    #[serde(default)]
    pub only_allow_trusted_devices: bool,
    /// How long an outbound session may live before rotation; `None` uses
    /// the built-in default.
    #[serde(default)]
    pub rotation_period: Option<std::time::Duration>,
    /// How many messages an outbound session may encrypt before rotation;
    /// `None` uses the built-in default.
    #[serde(default)]
    pub rotation_period_msgs: Option<u64>,
}

impl RoomSettings {
    /// Create settings for a room using the given algorithm, with default
    /// rotation thresholds.
    pub fn new(algorithm: EventEncryptionAlgorithm) -> Self {
        Self {
            algorithm,
            only_allow_trusted_devices: false,
            rotation_period: None,
            rotation_period_msgs: None,
        }
    }
}

/// The number of room keys we hold, and how many of them made it to the
/// backup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RoomKeyCounts {
    /// The total number of inbound group sessions.
    pub total: usize,
    /// The number of inbound group sessions that are backed up.
    pub backed_up: usize,
}

/// Device additions, updates and removals collected from a key query.
#[derive(Debug, Default)]
pub struct DeviceChanges {
    /// Devices we saw for the first time.
    pub new: Vec<DeviceData>,
    /// Devices that changed some non-identity data.
    pub changed: Vec<DeviceData>,
    /// Devices the server no longer lists.
    pub deleted: Vec<DeviceData>,
}

impl DeviceChanges {
    /// Are there no changes at all.
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.changed.is_empty() && self.deleted.is_empty()
    }
}

/// A batch of state changes that is persisted atomically.
#[derive(Debug, Default)]
pub struct Changes {
    /// The account, if its key material or counters changed.
    pub account: Option<PickledAccount>,
    /// Olm sessions that were created or ratcheted.
    pub sessions: Vec<Session>,
    /// Inbound group sessions that were received or imported.
    pub inbound_group_sessions: Vec<InboundGroupSession>,
    /// Outbound group sessions that were created or rotated.
    pub outbound_group_sessions: Vec<OutboundGroupSession>,
    /// Device list changes.
    pub devices: DeviceChanges,
    /// Hashes of received Olm messages, for replay detection.
    pub message_hashes: Vec<OlmMessageHash>,
    /// Outgoing room key requests that were created or changed state.
    pub key_requests: Vec<OutgoingKeyRequest>,
    /// Room encryption settings that changed.
    pub room_settings: HashMap<OwnedRoomId, RoomSettings>,
    /// The backup version, if it changed.
    pub backup_version: Option<String>,
}

/// The contract a persistent store for the crypto state has to fulfill.
///
/// Reads of different keys may run concurrently, but a write to a user's
/// device map or a session list must be exclusive with reads of the same
/// key; the in-memory reference implementation gets this from its sharded
/// maps.
#[async_trait]
pub trait CryptoStore: fmt::Debug + Send + Sync {
    /// Load the pickled account, if one was stored before.
    async fn load_account(&self) -> Result<Option<PickledAccount>>;

    /// Persist a batch of changes. The batch must be fully written before
    /// the method returns successfully.
    async fn save_changes(&self, changes: Changes) -> Result<()>;

    /// Get all Olm sessions we share with the device owning the given
    /// curve25519 key.
    async fn get_sessions(&self, sender_key: &str) -> Result<Option<Arc<Mutex<Vec<Session>>>>>;

    /// Get the inbound group session for the given room, sender and session
    /// id.
    async fn get_inbound_group_session(
        &self,
        room_id: &RoomId,
        sender_key: &str,
        session_id: &str,
    ) -> Result<Option<InboundGroupSession>>;

    /// Get all inbound group sessions.
    async fn get_inbound_group_sessions(&self) -> Result<Vec<InboundGroupSession>>;

    /// Count the inbound group sessions, total and backed up.
    async fn inbound_group_session_counts(&self) -> Result<RoomKeyCounts>;

    /// Get a bounded batch of inbound group sessions that still need to be
    /// backed up.
    async fn inbound_group_sessions_for_backup(
        &self,
        limit: usize,
    ) -> Result<Vec<InboundGroupSession>>;

    /// Flip the backed-up flag of the listed sessions, identified by room
    /// and session id.
    async fn mark_inbound_group_sessions_as_backed_up(
        &self,
        room_and_session_ids: &[(&RoomId, &str)],
    ) -> Result<()>;

    /// Reset the backed-up flag of every inbound group session.
    async fn reset_backup_state(&self) -> Result<()>;

    /// The currently enabled backup version, if any.
    async fn load_backup_version(&self) -> Result<Option<String>>;

    /// Get the active outbound group session for the given room.
    async fn get_outbound_group_session(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<OutboundGroupSession>>;

    /// Get the device with the given id belonging to the given user.
    async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceData>>;

    /// Get all devices of the given user.
    async fn get_user_devices(&self, user_id: &UserId) -> Result<UserDevices>;

    /// Find the device of the given user that owns the given curve25519
    /// identity key.
    async fn get_device_by_curve_key(
        &self,
        user_id: &UserId,
        curve_key: Curve25519PublicKey,
    ) -> Result<Option<DeviceData>>;

    /// The users whose device lists we keep track of.
    async fn tracked_users(&self) -> Result<Vec<OwnedUserId>>;

    /// How up to date our copy of the given user's device list is.
    async fn tracking_status(&self, user_id: &UserId) -> Result<DeviceTrackingStatus>;

    /// Update how up to date our copy of the given user's device list is.
    async fn set_tracking_status(
        &self,
        user_id: &UserId,
        status: DeviceTrackingStatus,
    ) -> Result<()>;

    /// Have we seen an Olm message with this hash before.
    async fn is_message_known(&self, message_hash: &OlmMessageHash) -> Result<bool>;

    /// Get the outgoing key request with the given request id.
    async fn get_outgoing_key_request(
        &self,
        request_id: &TransactionId,
    ) -> Result<Option<OutgoingKeyRequest>>;

    /// Get the outgoing key request asking for the given key, regardless of
    /// its request id.
    async fn get_key_request_by_info(
        &self,
        info: &RequestedKeyInfo,
    ) -> Result<Option<OutgoingKeyRequest>>;

    /// Get all outgoing key requests that still need to be sent out, either
    /// as fresh requests or as cancellations.
    async fn get_unsent_key_requests(&self) -> Result<Vec<OutgoingKeyRequest>>;

    /// Remove the outgoing key request with the given request id.
    async fn delete_outgoing_key_request(&self, request_id: &TransactionId) -> Result<()>;

    /// Get the encryption settings of the given room.
    async fn get_room_settings(&self, room_id: &RoomId) -> Result<Option<RoomSettings>>;
}

/// Handle to the crypto store, shared by all parts of the machine.
#[derive(Clone, Debug)]
pub struct Store {
    inner: Arc<dyn CryptoStore>,
}

impl Store {
    /// Create a new store handle.
    pub fn new(inner: Arc<dyn CryptoStore>) -> Self {
        Self { inner }
    }

    /// Persist the given sessions.
    pub async fn save_sessions(&self, sessions: &[Session]) -> Result<()> {
        self.save_changes(Changes { sessions: sessions.to_vec(), ..Default::default() }).await
    }

    /// Persist the given inbound group sessions.
    pub async fn save_inbound_group_sessions(
        &self,
        sessions: Vec<InboundGroupSession>,
    ) -> Result<()> {
        self.save_changes(Changes { inbound_group_sessions: sessions, ..Default::default() })
            .await
    }

    /// Merge the given inbound group sessions into the store.
    ///
    /// A session we already hold is only replaced if the incoming copy can
    /// decrypt strictly more than the stored one; decryption completeness
    /// never decreases. Returns how many sessions were actually stored.
    pub(crate) async fn import_inbound_group_sessions(
        &self,
        sessions: Vec<InboundGroupSession>,
    ) -> Result<usize> {
        let mut to_save = Vec::new();

        for session in sessions {
            let existing = self
                .get_inbound_group_session(
                    session.room_id(),
                    &session.sender_key().to_base64(),
                    session.session_id(),
                )
                .await?;

            let keep = match &existing {
                None => true,
                Some(existing) => {
                    session.compare_ratchet(existing).await == SessionOrdering::Better
                }
            };

            if keep {
                to_save.push(session);
            }
        }

        let count = to_save.len();
        self.save_inbound_group_sessions(to_save).await?;

        Ok(count)
    }
}

impl Deref for Store {
    type Target = dyn CryptoStore;

    fn deref(&self) -> &Self::Target {
        self.inner.deref()
    }
}
