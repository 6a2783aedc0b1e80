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

use std::{
    cmp::max,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use dashmap::DashMap;
use ruma::{
    OwnedDeviceId, OwnedRoomId, OwnedUserId, RoomId, SecondsSinceUnixEpoch, DeviceId, UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::debug;
use vodozemac::{
    megolm::{GroupSession, GroupSessionPickle, SessionConfig, SessionKey},
    olm::IdentityKeys,
    Curve25519PublicKey, PickleError,
};

use crate::{
    error::SessionCreationError,
    identities::DeviceData,
    types::{
        events::{
            encrypted::{MegolmV1AesSha2Content, RoomEncryptedEventContent},
            room_key::RoomKeyContent,
        },
        EventEncryptionAlgorithm,
    },
};

const ROTATION_PERIOD: Duration = Duration::from_secs(3600 * 24 * 7);
const ROTATION_MESSAGES: u64 = 100;

/// Whether an outbound session was shared with a specific device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShareState {
    /// The session was never shared with the device.
    NotShared,
    /// The session was shared with the device, but the device changed its
    /// curve25519 key since then.
    SharedButChangedSenderKey,
    /// The session was shared with the device, starting at the contained
    /// message index.
    Shared(u32),
}

/// Settings for an encrypted room, determining the algorithm and the
/// rotation policy of its outbound group session.
///
/// The thresholds are deliberately explicit configuration inputs; rooms can
/// tighten them but hostile values are clamped at evaluation time.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct EncryptionSettings {
    /// The encryption algorithm to use in the room.
    pub algorithm: EventEncryptionAlgorithm,
    /// How long a session may be used before it is rotated.
    pub rotation_period: Duration,
    /// How many messages a session may encrypt before it is rotated.
    pub rotation_period_msgs: u64,
    /// Should devices the user hasn't verified be excluded from the room
    /// key.
    #[serde(default)]
    pub only_allow_trusted_devices: bool,
}

impl Default for EncryptionSettings {
    fn default() -> Self {
        Self {
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            rotation_period: ROTATION_PERIOD,
            rotation_period_msgs: ROTATION_MESSAGES,
            only_allow_trusted_devices: false,
        }
    }
}

/// The outbound half of a Megolm session, used to encrypt our own messages
/// for one room.
///
/// At most one outbound session is active per room; once rotated, a session
/// is never used for new encryptions again.
#[derive(Clone)]
pub struct OutboundGroupSession {
    inner: Arc<RwLock<GroupSession>>,
    device_id: OwnedDeviceId,
    our_identity_keys: Arc<IdentityKeys>,
    session_id: Arc<str>,
    room_id: OwnedRoomId,
    pub(crate) creation_time: SecondsSinceUnixEpoch,
    message_count: Arc<AtomicU64>,
    shared: Arc<AtomicBool>,
    invalidated: Arc<AtomicBool>,
    settings: Arc<EncryptionSettings>,
    /// Who already received the session key, and from which message index
    /// onwards.
    pub(crate) shared_with_set: Arc<DashMap<OwnedUserId, DashMap<OwnedDeviceId, ShareInfo>>>,
}

/// Info about the share of an outbound session with one device.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShareInfo {
    /// The curve25519 key the recipient device had when it received the
    /// session.
    pub sender_key: Curve25519PublicKey,
    /// The message index the recipient can decrypt from.
    pub message_index: u32,
}

impl OutboundGroupSession {
    pub(crate) fn session_config(
        algorithm: &EventEncryptionAlgorithm,
    ) -> Result<SessionConfig, SessionCreationError> {
        match algorithm {
            EventEncryptionAlgorithm::MegolmV1AesSha2 => Ok(SessionConfig::version_1()),
            _ => Err(SessionCreationError::Algorithm(algorithm.clone())),
        }
    }

    /// Create a new outbound session for the given room.
    pub fn new(
        device_id: OwnedDeviceId,
        our_identity_keys: Arc<IdentityKeys>,
        room_id: &RoomId,
        settings: EncryptionSettings,
    ) -> Result<Self, SessionCreationError> {
        let config = Self::session_config(&settings.algorithm)?;

        let session = GroupSession::new(config);
        let session_id = session.session_id();

        Ok(OutboundGroupSession {
            inner: Arc::new(RwLock::new(session)),
            device_id,
            our_identity_keys,
            session_id: session_id.into(),
            room_id: room_id.to_owned(),
            creation_time: SecondsSinceUnixEpoch::now(),
            message_count: Arc::new(AtomicU64::new(0)),
            shared: Arc::new(AtomicBool::new(false)),
            invalidated: Arc::new(AtomicBool::new(false)),
            settings: Arc::new(settings),
            shared_with_set: Arc::new(DashMap::new()),
        })
    }

    /// The encryption settings of this session.
    pub fn settings(&self) -> &EncryptionSettings {
        &self.settings
    }

    pub(crate) async fn encrypt_helper(&self, plaintext: String) -> vodozemac::megolm::MegolmMessage {
        let mut session = self.inner.write().await;
        self.message_count.fetch_add(1, Ordering::SeqCst);
        session.encrypt(&plaintext)
    }

    /// Encrypt the given event content for the room this session belongs to.
    ///
    /// The room id and event type are folded into the plaintext so the
    /// receiving side can detect cross-room replays.
    ///
    /// The session key needs to be shared with the recipients before this is
    /// called.
    pub async fn encrypt(&self, event_type: &str, content: Value) -> RoomEncryptedEventContent {
        let plaintext = json!({
            "room_id": &self.room_id,
            "type": event_type,
            "content": content,
        })
        .to_string();

        let ciphertext = self.encrypt_helper(plaintext).await;

        RoomEncryptedEventContent::MegolmV1AesSha2(MegolmV1AesSha2Content {
            sender_key: self.our_identity_keys.curve25519,
            device_id: self.device_id.clone(),
            session_id: self.session_id().to_owned(),
            ciphertext,
        })
    }

    fn elapsed(&self) -> bool {
        let creation_time = Duration::from_secs(self.creation_time.get().into());
        let now = Duration::from_secs(SecondsSinceUnixEpoch::now().get().into());

        // Room state is attacker-influenced, so an absurdly short rotation
        // period is clamped to an hour.
        now.checked_sub(creation_time)
            .map(|elapsed| elapsed >= max(self.settings.rotation_period, Duration::from_secs(3600)))
            .unwrap_or(true)
    }

    /// Has the session reached the end of its life and needs to be rotated.
    pub fn expired(&self) -> bool {
        let count = self.message_count.load(Ordering::SeqCst);
        // A session must be usable for at least one message, and Megolm's
        // u32-sized counter aside, 10k messages is plenty for one key.
        let rotation_period_msgs = self.settings.rotation_period_msgs.clamp(1, 10_000);

        count >= rotation_period_msgs || self.elapsed()
    }

    /// Flag the session for rotation regardless of its age, e.g. because the
    /// recipient set changed.
    pub fn invalidate_session(&self) {
        self.invalidated.store(true, Ordering::Relaxed);

        debug!(
            room_id = ?self.room_id,
            session_id = self.session_id(),
            "Invalidated the outbound group session"
        );
    }

    /// Has the session been flagged for rotation.
    pub fn invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Relaxed)
    }

    /// Mark the session as shared with all its recipients.
    ///
    /// Messages must not be encrypted with the session before this point.
    pub fn mark_as_shared(&self) {
        self.shared.store(true, Ordering::Relaxed);
    }

    /// Has the session key been shared with the recipients.
    pub fn shared(&self) -> bool {
        self.shared.load(Ordering::Relaxed)
    }

    /// The current session key, which lets an [`InboundGroupSession`] decrypt
    /// from the current message index onwards.
    ///
    /// [`InboundGroupSession`]: super::InboundGroupSession
    pub async fn session_key(&self) -> SessionKey {
        self.inner.read().await.session_key()
    }

    /// The message index the next encrypted message will use.
    pub async fn message_index(&self) -> u32 {
        self.inner.read().await.message_index()
    }

    /// The curve25519 key of the device that created this session, i.e. our
    /// own.
    pub fn sender_key(&self) -> Curve25519PublicKey {
        self.our_identity_keys.curve25519
    }

    /// The room this session encrypts messages for.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// The unique identifier of the session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The `m.room_key` content that shares this session.
    pub(crate) async fn as_room_key_content(&self) -> RoomKeyContent {
        RoomKeyContent::new(
            self.room_id.clone(),
            self.session_id().to_owned(),
            self.session_key().await,
        )
    }

    /// Record that the session key was sent to the given device, starting at
    /// the given message index.
    pub(crate) fn mark_shared_with(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        sender_key: Curve25519PublicKey,
        message_index: u32,
    ) {
        self.shared_with_set
            .entry(user_id.to_owned())
            .or_default()
            .insert(device_id.to_owned(), ShareInfo { sender_key, message_index });
    }

    /// Has the session been shared with the given device.
    pub(crate) fn is_shared_with(&self, device: &DeviceData) -> ShareState {
        self.shared_with_set
            .get(device.user_id())
            .and_then(|d| {
                d.get(device.device_id()).map(|info| {
                    if Some(info.sender_key) == device.curve25519_key() {
                        ShareState::Shared(info.message_index)
                    } else {
                        ShareState::SharedButChangedSenderKey
                    }
                })
            })
            .unwrap_or(ShareState::NotShared)
    }

    /// Serialize the session so it can be persisted.
    pub async fn pickle(&self) -> PickledOutboundGroupSession {
        let pickle = self.inner.read().await.pickle();

        PickledOutboundGroupSession {
            pickle,
            room_id: self.room_id.clone(),
            settings: self.settings.clone(),
            creation_time: self.creation_time,
            message_count: self.message_count.load(Ordering::SeqCst),
            shared: self.shared(),
            invalidated: self.invalidated(),
            shared_with_set: self
                .shared_with_set
                .iter()
                .map(|u| {
                    (
                        u.key().clone(),
                        u.value().iter().map(|d| (d.key().clone(), d.value().clone())).collect(),
                    )
                })
                .collect(),
        }
    }

    /// Restore a session from its persisted form.
    pub fn from_pickle(
        device_id: OwnedDeviceId,
        our_identity_keys: Arc<IdentityKeys>,
        pickle: PickledOutboundGroupSession,
    ) -> Result<Self, PickleError> {
        let session: GroupSession = pickle.pickle.into();
        let session_id = session.session_id();

        Ok(Self {
            inner: Arc::new(RwLock::new(session)),
            device_id,
            our_identity_keys,
            session_id: session_id.into(),
            room_id: pickle.room_id,
            creation_time: pickle.creation_time,
            message_count: Arc::new(AtomicU64::new(pickle.message_count)),
            shared: Arc::new(AtomicBool::new(pickle.shared)),
            invalidated: Arc::new(AtomicBool::new(pickle.invalidated)),
            settings: pickle.settings,
            shared_with_set: Arc::new(
                pickle
                    .shared_with_set
                    .into_iter()
                    .map(|(u, d)| (u, d.into_iter().collect()))
                    .collect(),
            ),
        })
    }
}

impl fmt::Debug for OutboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundGroupSession")
            .field("session_id", &self.session_id)
            .field("room_id", &self.room_id)
            .field("creation_time", &self.creation_time)
            .field("message_count", &self.message_count)
            .finish()
    }
}

/// A serializable version of an [`OutboundGroupSession`].
#[derive(Serialize, Deserialize)]
#[allow(missing_debug_implementations)]
pub struct PickledOutboundGroupSession {
    /// The pickled ratchet state.
    pub pickle: GroupSessionPickle,
    /// The settings the session adheres to.
    pub settings: Arc<EncryptionSettings>,
    /// The room the session encrypts messages for.
    pub room_id: OwnedRoomId,
    /// When the session was created.
    pub creation_time: SecondsSinceUnixEpoch,
    /// The number of messages the session encrypted so far.
    pub message_count: u64,
    /// Was the session key shared with the recipients.
    pub shared: bool,
    /// Was the session flagged for rotation.
    pub invalidated: bool,
    /// Who already received the session key.
    pub shared_with_set:
        std::collections::BTreeMap<OwnedUserId, std::collections::BTreeMap<OwnedDeviceId, ShareInfo>>,
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::Ordering, time::Duration};

    use ruma::{device_id, room_id, uint, user_id, SecondsSinceUnixEpoch};
    use serde_json::json;

    use super::{EncryptionSettings, OutboundGroupSession, ROTATION_MESSAGES, ROTATION_PERIOD};
    use crate::olm::Account;

    fn new_session(settings: EncryptionSettings) -> OutboundGroupSession {
        let account = Account::new(user_id!("@alice:example.org"), device_id!("DEVICEID"));

        OutboundGroupSession::new(
            account.device_id().to_owned(),
            account.identity_keys_arc(),
            room_id!("!test_room:example.org"),
            settings,
        )
        .unwrap()
    }

    #[test]
    fn default_settings() {
        let settings = EncryptionSettings::default();

        assert_eq!(settings.rotation_period, ROTATION_PERIOD);
        assert_eq!(settings.rotation_period_msgs, ROTATION_MESSAGES);
        assert!(!settings.only_allow_trusted_devices);
    }

    #[tokio::test]
    async fn expiration_by_message_count() {
        let settings = EncryptionSettings { rotation_period_msgs: 1, ..Default::default() };
        let session = new_session(settings);

        assert!(!session.expired());
        let _ = session.encrypt("m.room.message", json!({ "body": "Test message" })).await;
        assert!(session.expired());
    }

    #[tokio::test]
    async fn expiration_by_age() {
        let settings = EncryptionSettings {
            rotation_period: Duration::from_millis(100),
            ..Default::default()
        };
        let mut session = new_session(settings);

        assert!(!session.expired());

        let now = SecondsSinceUnixEpoch::now();
        session.creation_time = SecondsSinceUnixEpoch(now.get() - uint!(3600));
        assert!(session.expired());
    }

    #[tokio::test]
    async fn message_count_clamping() {
        let settings = EncryptionSettings { rotation_period_msgs: 100_000, ..Default::default() };
        let session = new_session(settings);

        session.message_count.store(9_999, Ordering::SeqCst);
        assert!(!session.expired());
        session.message_count.store(10_000, Ordering::SeqCst);
        assert!(session.expired());
    }
}
