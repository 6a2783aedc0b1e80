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

use std::{collections::BTreeMap, sync::Arc};

use ruma::{OwnedDeviceId, OwnedUserId, DeviceId, RoomId, UserId};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use vodozemac::{olm::OlmMessage, Curve25519PublicKey, Ed25519PublicKey};

use crate::{
    backups::BackupMachine,
    error::{EventError, MegolmError, MegolmResult, OlmError, OlmResult},
    gossip::GossipMachine,
    identities::{DeviceData, IdentityManager, LocalTrust, UserDevices},
    olm::{
        Account, EncryptionSettings, ExportedRoomKey, IdentityKeys, InboundGroupSession,
        SessionType,
    },
    session_manager::{GroupSessionManager, SessionManager},
    store::{
        Changes, CryptoStore, DeviceChanges, MemoryStore, Result as StoreResult, RoomSettings,
        Store,
    },
    transport::{CryptoTransport, KeysUploadRequest, ToDeviceRequest},
    types::{
        events::{
            encrypted::{
                EncryptedEvent, OlmV1Curve25519AesSha2Content, RoomEncryptedEventContent,
                ToDeviceEncryptedEventContent,
            },
            olm_v1::{DecryptedForwardedRoomKeyEvent, DecryptedRoomKeyEvent},
            room_key_request::{RequestedKeyInfo, RoomKeyRequestContent},
            ToDeviceEvent,
        },
        EventEncryptionAlgorithm,
    },
};

/// A member's room membership, as far as encryption cares about it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MembershipChange {
    /// The user is part of the room and should receive room keys.
    Joined,
    /// The user left the room (or was removed); the active room key must not
    /// encrypt anything further for them.
    Left,
}

/// A decrypted room event, together with the metadata proving (or merely
/// claiming) who sent it.
#[derive(Clone, Debug)]
pub struct DecryptedRoomEvent {
    /// The decrypted event, an object with `type` and `content` fields.
    pub clear_event: Value,
    /// The sender of the encrypted event.
    pub sender: OwnedUserId,
    /// The curve25519 key of the device that encrypted the event.
    pub sender_curve25519_key: Curve25519PublicKey,
    /// The ed25519 key the sender claims to own. Proven only for directly
    /// received sessions; imported or forwarded ones make it a claim.
    pub claimed_ed25519_key: Option<Ed25519PublicKey>,
    /// The chain of devices the decryption key travelled through before it
    /// reached us. Empty if we got the key directly from its creator.
    pub forwarding_curve25519_key_chain: Vec<String>,
}

/// State machine implementation of the Olm/Megolm encryption protocol used
/// for Matrix end to end encryption.
///
/// One `OlmMachine` is scoped to exactly one logged-in account; running
/// several accounts means running several independent machines. All network
/// traffic flows through the [`CryptoTransport`] handed in at construction,
/// all persistence through the [`CryptoStore`].
#[derive(Clone)]
pub struct OlmMachine {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    account: Arc<Mutex<Account>>,
    store: Store,
    transport: Arc<dyn CryptoTransport>,
    identity_manager: IdentityManager,
    session_manager: SessionManager,
    group_session_manager: GroupSessionManager,
    gossip_machine: GossipMachine,
    backup_machine: BackupMachine,
}

impl std::fmt::Debug for OlmMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OlmMachine")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .finish()
    }
}

impl OlmMachine {
    /// Create a new machine that keeps all its state in memory.
    pub async fn new(
        user_id: &UserId,
        device_id: &DeviceId,
        transport: Arc<dyn CryptoTransport>,
    ) -> Self {
        Self::with_store(user_id, device_id, transport, Arc::new(MemoryStore::new()))
            .await
            .expect("the in-memory store can't fail to load")
    }

    /// Create a new machine on top of a persistent store.
    ///
    /// If the store already holds an account for this user and device it is
    /// restored, otherwise fresh identity keys are generated. A store that
    /// reports itself corrupted makes this fail; the only safe path forward
    /// is wiping the store and starting over.
    pub async fn with_store(
        user_id: &UserId,
        device_id: &DeviceId,
        transport: Arc<dyn CryptoTransport>,
        store: Arc<dyn CryptoStore>,
    ) -> StoreResult<Self> {
        let account = match store.load_account().await? {
            Some(pickle) => {
                debug!(?user_id, ?device_id, "Restored the account from the store");
                Account::from_pickle(pickle)?
            }
            None => {
                debug!(?user_id, ?device_id, "Created a new account");
                Account::new(user_id, device_id)
            }
        };

        let store = Store::new(store);

        // Our own device is part of the device store like everyone else's,
        // so key requests from our other devices can look it up.
        let own_device = DeviceData::from_own_device_keys(account.device_keys());
        store
            .save_changes(Changes {
                account: Some(account.pickle()),
                devices: DeviceChanges { new: vec![own_device], ..Default::default() },
                ..Default::default()
            })
            .await?;

        let account = Arc::new(Mutex::new(account));

        let identity_manager =
            IdentityManager::new(user_id.to_owned(), device_id.to_owned(), store.clone());
        let session_manager = SessionManager::new(
            user_id.to_owned(),
            device_id.to_owned(),
            account.clone(),
            store.clone(),
        );
        let group_session_manager = GroupSessionManager::new(
            user_id.to_owned(),
            device_id.to_owned(),
            account.clone(),
            store.clone(),
        );
        let gossip_machine =
            GossipMachine::new(user_id.to_owned(), device_id.to_owned(), store.clone());
        let backup_machine = BackupMachine::new(store.clone(), transport.clone());

        Ok(Self {
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            account,
            store,
            transport,
            identity_manager,
            session_manager,
            group_session_manager,
            gossip_machine,
            backup_machine,
        })
    }

    /// The user this machine belongs to.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The device this machine belongs to.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// The public identity keys of this device.
    pub async fn identity_keys(&self) -> IdentityKeys {
        self.account.lock().await.identity_keys()
    }

    /// The backup half of the machine.
    pub fn backup_machine(&self) -> &BackupMachine {
        &self.backup_machine
    }

    /// Upload our device keys and enough one-time keys to the server.
    ///
    /// Needs to be called once after login and again whenever the server
    /// reports a low one-time key count (see
    /// [`OlmMachine::receive_one_time_key_counts`]). Uploading the same
    /// batch twice is harmless, the server counts keys by their ids.
    pub async fn upload_keys(&self) -> OlmResult<()> {
        let request = {
            let mut account = self.account.lock().await;
            account.generate_one_time_keys_if_needed();

            let device_keys = (!account.shared()).then(|| account.device_keys());
            let one_time_keys = account.signed_one_time_keys();
            let fallback_keys = account.signed_fallback_keys();

            if device_keys.is_none() && one_time_keys.is_empty() && fallback_keys.is_empty() {
                return Ok(());
            }

            KeysUploadRequest { device_keys, one_time_keys, fallback_keys }
        };

        let response = self.transport.upload_keys(request).await?;

        let mut account = self.account.lock().await;
        if !account.shared() {
            debug!("Marking the account as shared");
        }
        account.mark_as_shared();
        account.mark_keys_as_published();
        account.update_key_counts(&response.one_time_key_counts, None);

        let pickle = account.pickle();
        drop(account);

        self.store
            .save_changes(Changes { account: Some(pickle), ..Default::default() })
            .await?;

        Ok(())
    }

    /// Feed in the one-time key counts a sync response reported.
    pub async fn receive_one_time_key_counts(
        &self,
        counts: &BTreeMap<String, u64>,
        unused_fallback_keys: Option<&[String]>,
    ) -> OlmResult<()> {
        let pickle = {
            let mut account = self.account.lock().await;
            account.update_key_counts(counts, unused_fallback_keys);
            account.pickle()
        };

        self.store
            .save_changes(Changes { account: Some(pickle), ..Default::default() })
            .await?;

        Ok(())
    }

    /// Start tracking the device lists of the given users.
    pub async fn update_tracked_users(
        &self,
        users: impl Iterator<Item = &UserId>,
    ) -> StoreResult<()> {
        self.identity_manager.update_tracked_users(users).await
    }

    /// The server announced that a user's device list changed, e.g. because
    /// they logged in on a new device.
    pub async fn receive_device_list_change(&self, user_id: &UserId) -> StoreResult<()> {
        self.identity_manager.mark_user_as_changed(user_id).await
    }

    /// Download the device lists of every tracked user whose list is
    /// outdated.
    pub async fn download_device_keys(&self) -> OlmResult<DeviceChanges> {
        self.identity_manager.download_device_keys(self.transport.as_ref()).await
    }

    /// Get a device of a user from the store.
    pub async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> StoreResult<Option<DeviceData>> {
        self.store.get_device(user_id, device_id).await
    }

    /// Get all devices of a user from the store.
    pub async fn get_user_devices(&self, user_id: &UserId) -> StoreResult<UserDevices> {
        self.store.get_user_devices(user_id).await
    }

    /// Manually set the trust state of a device, after the user compared
    /// fingerprints out of band (or decided to blacklist the device).
    ///
    /// Blacklisting takes effect at the next room key share: the key the
    /// device already holds can't be taken back, but the session is rotated
    /// away from it.
    pub async fn set_device_trust(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        trust: LocalTrust,
    ) -> OlmResult<()> {
        let device = self
            .store
            .get_device(user_id, device_id)
            .await?
            .ok_or_else(|| OlmError::MissingDevice(user_id.to_owned(), device_id.to_owned()))?;

        info!(?user_id, ?device_id, ?trust, "Updated the trust state of a device");
        device.set_trust_state(trust);

        self.store
            .save_changes(Changes {
                devices: DeviceChanges { changed: vec![device], ..Default::default() },
                ..Default::default()
            })
            .await?;

        Ok(())
    }

    /// Configure the encryption settings of a room.
    ///
    /// The algorithm of a room is write-once; an attempt to change it is
    /// rejected, no matter whether it arrives through this method or through
    /// a room state event. Other settings may be tightened at any time.
    pub async fn set_room_settings(
        &self,
        room_id: &RoomId,
        settings: RoomSettings,
    ) -> MegolmResult<()> {
        if let Some(existing) = self.store.get_room_settings(room_id).await? {
            if existing.algorithm != settings.algorithm {
                warn!(
                    ?room_id,
                    current = %existing.algorithm,
                    requested = %settings.algorithm,
                    "Rejecting an attempt to change the encryption algorithm of a room",
                );

                return Err(MegolmError::AlgorithmChange(
                    room_id.to_owned(),
                    settings.algorithm,
                ));
            }
        }

        match settings.algorithm {
            EventEncryptionAlgorithm::OlmV1Curve25519AesSha2
            | EventEncryptionAlgorithm::MegolmV1AesSha2 => {}
            ref algorithm => {
                return Err(MegolmError::Event(EventError::UnsupportedAlgorithm(
                    algorithm.clone(),
                )))
            }
        }

        self.store
            .save_changes(Changes {
                room_settings: [(room_id.to_owned(), settings)].into(),
                ..Default::default()
            })
            .await?;

        Ok(())
    }

    async fn room_settings(&self, room_id: &RoomId) -> MegolmResult<RoomSettings> {
        self.store
            .get_room_settings(room_id)
            .await?
            .ok_or_else(|| MegolmError::EncryptionNotEnabled(room_id.to_owned()))
    }

    fn encryption_settings(settings: &RoomSettings) -> EncryptionSettings {
        let defaults = EncryptionSettings::default();

        EncryptionSettings {
            algorithm: settings.algorithm.clone(),
            rotation_period: settings.rotation_period.unwrap_or(defaults.rotation_period),
            rotation_period_msgs: settings
                .rotation_period_msgs
                .unwrap_or(defaults.rotation_period_msgs),
            only_allow_trusted_devices: settings.only_allow_trusted_devices,
        }
    }

    /// Make sure the current room key is shared with (and only with) the
    /// devices of the given users.
    ///
    /// Downloads outdated device lists, establishes Olm sessions, rotates
    /// the session if a previous recipient is no longer one, and sends the
    /// key to every device that doesn't have it yet. Needs to be called
    /// before [`OlmMachine::encrypt_room_event`], and again whenever the
    /// room members change.
    pub async fn share_room_key(
        &self,
        room_id: &RoomId,
        users: &[OwnedUserId],
    ) -> MegolmResult<()> {
        let settings = self.room_settings(room_id).await?;

        self.identity_manager.update_tracked_users(users.iter().map(|u| &**u)).await?;
        self.identity_manager.download_device_keys(self.transport.as_ref()).await?;

        match settings.algorithm {
            EventEncryptionAlgorithm::MegolmV1AesSha2 => {
                self.group_session_manager
                    .share_room_key(
                        self.transport.as_ref(),
                        &self.session_manager,
                        room_id,
                        users,
                        Self::encryption_settings(&settings),
                    )
                    .await?;
            }
            EventEncryptionAlgorithm::OlmV1Curve25519AesSha2 => {
                self.session_manager
                    .ensure_sessions(self.transport.as_ref(), users.iter().map(|u| &**u))
                    .await?;
            }
            ref algorithm => {
                return Err(MegolmError::Event(EventError::UnsupportedAlgorithm(
                    algorithm.clone(),
                )))
            }
        }

        Ok(())
    }

    /// Encrypt the given event content for the given room.
    ///
    /// The room key must have been shared with [`OlmMachine::share_room_key`]
    /// beforehand; the recipients are needed here only for rooms using the
    /// Olm algorithm, where every event is encrypted per device.
    pub async fn encrypt_room_event(
        &self,
        room_id: &RoomId,
        users: &[OwnedUserId],
        event_type: &str,
        content: Value,
    ) -> MegolmResult<RoomEncryptedEventContent> {
        let settings = self.room_settings(room_id).await?;

        match settings.algorithm {
            EventEncryptionAlgorithm::MegolmV1AesSha2 => {
                self.encrypt_megolm(room_id, event_type, content).await
            }
            EventEncryptionAlgorithm::OlmV1Curve25519AesSha2 => {
                self.encrypt_olm(room_id, users, event_type, content).await
            }
            ref algorithm => Err(MegolmError::Event(EventError::UnsupportedAlgorithm(
                algorithm.clone(),
            ))),
        }
    }

    async fn encrypt_megolm(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: Value,
    ) -> MegolmResult<RoomEncryptedEventContent> {
        let session = self
            .store
            .get_outbound_group_session(room_id)
            .await?
            .filter(|s| s.shared() && !s.expired() && !s.invalidated())
            .ok_or_else(|| MegolmError::SessionNotShared(room_id.to_owned()))?;

        let encrypted = session.encrypt(event_type, content).await;

        self.store
            .save_changes(Changes {
                outbound_group_sessions: vec![session],
                ..Default::default()
            })
            .await?;

        Ok(encrypted)
    }

    async fn encrypt_olm(
        &self,
        room_id: &RoomId,
        users: &[OwnedUserId],
        event_type: &str,
        content: Value,
    ) -> MegolmResult<RoomEncryptedEventContent> {
        let payload = json!({
            "room_id": room_id,
            "content": content,
        });

        let mut ciphertexts = BTreeMap::new();

        for user_id in users {
            for device in self.store.get_user_devices(user_id).await?.devices() {
                if device.is_blacklisted()
                    || (user_id == &self.user_id && device.device_id() == self.device_id())
                {
                    continue;
                }

                match device.encrypt(&self.store, event_type, payload.clone()).await {
                    Ok(ToDeviceEncryptedEventContent::OlmV1Curve25519AesSha2(content)) => {
                        ciphertexts.extend(content.ciphertext);
                    }
                    Err(e) => {
                        warn!(
                            user_id = ?device.user_id(),
                            device_id = ?device.device_id(),
                            error = ?e,
                            "Couldn't encrypt an Olm room event for a device",
                        );
                    }
                }
            }
        }

        if ciphertexts.is_empty() {
            return Err(MegolmError::Event(EventError::MissingCiphertext));
        }

        let sender_key = self.identity_keys().await.curve25519;

        Ok(RoomEncryptedEventContent::OlmV1Curve25519AesSha2(OlmV1Curve25519AesSha2Content {
            sender_key,
            ciphertext: ciphertexts,
        }))
    }

    /// Decrypt an `m.room.encrypted` event that was received in the given
    /// room.
    ///
    /// A missing room key automatically queues an outgoing key request (send
    /// it with [`OlmMachine::send_outgoing_key_requests`]); every failed
    /// authenticity check surfaces as a typed error and the event must be
    /// shown as undecryptable.
    pub async fn decrypt_room_event(
        &self,
        event: &EncryptedEvent,
        room_id: &RoomId,
    ) -> MegolmResult<DecryptedRoomEvent> {
        match &event.content {
            RoomEncryptedEventContent::MegolmV1AesSha2(content) => {
                self.decrypt_megolm_event(event, room_id, content).await
            }
            RoomEncryptedEventContent::OlmV1Curve25519AesSha2(content) => {
                self.decrypt_olm_room_event(event, room_id, content).await
            }
        }
    }

    async fn decrypt_megolm_event(
        &self,
        event: &EncryptedEvent,
        room_id: &RoomId,
        content: &crate::types::events::encrypted::MegolmV1AesSha2Content,
    ) -> MegolmResult<DecryptedRoomEvent> {
        let session = match self
            .store
            .get_inbound_group_session(
                room_id,
                &content.sender_key.to_base64(),
                &content.session_id,
            )
            .await?
        {
            Some(session) => session,
            None => {
                debug!(
                    ?room_id,
                    session_id = content.session_id.as_str(),
                    "A room key is missing, queueing a key request",
                );

                self.gossip_machine
                    .request_key(RequestedKeyInfo::new(
                        EventEncryptionAlgorithm::MegolmV1AesSha2,
                        room_id.to_owned(),
                        content.sender_key,
                        content.session_id.clone(),
                    ))
                    .await?;

                return Err(MegolmError::MissingRoomKey);
            }
        };

        let decrypted = session.decrypt_helper(&content.ciphertext).await?;
        let payload: Value = serde_json::from_slice(&decrypted.plaintext)?;

        let payload_room = payload
            .get("room_id")
            .and_then(Value::as_str)
            .and_then(|r| RoomId::parse(r).ok());

        // An attacker could try replaying the event into another room where
        // the same key is known; the room id baked into the plaintext is
        // authenticated, the outer one is not.
        if payload_room.as_deref() != Some(session.room_id()) {
            return Err(EventError::MismatchedRoom(payload_room, room_id.to_owned()).into());
        }

        let event_type = payload
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| EventError::MissingField("type".to_owned()))?;

        let clear_event = json!({
            "type": event_type,
            "content": payload.get("content").cloned().unwrap_or_else(|| json!({})),
        });

        Ok(DecryptedRoomEvent {
            clear_event,
            sender: event.sender.clone(),
            sender_curve25519_key: session.sender_key(),
            claimed_ed25519_key: Some(session.sender_claimed_keys().ed25519),
            forwarding_curve25519_key_chain: session.forwarding_key_chain().to_vec(),
        })
    }

    async fn decrypt_olm_room_event(
        &self,
        event: &EncryptedEvent,
        room_id: &RoomId,
        content: &OlmV1Curve25519AesSha2Content,
    ) -> MegolmResult<DecryptedRoomEvent> {
        let (payload, claimed_key) =
            self.decrypt_olm_content(&event.sender, content).await.map_err(MegolmError::from)?;

        let inner = payload
            .get("content")
            .ok_or_else(|| EventError::MissingField("content".to_owned()))?;

        let payload_room = inner
            .get("room_id")
            .and_then(Value::as_str)
            .and_then(|r| RoomId::parse(r).ok());

        if payload_room.as_deref() != Some(room_id) {
            return Err(EventError::MismatchedRoom(payload_room, room_id.to_owned()).into());
        }

        let event_type = payload
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| EventError::MissingField("type".to_owned()))?;

        let clear_event = json!({
            "type": event_type,
            "content": inner.get("content").cloned().unwrap_or_else(|| json!({})),
        });

        Ok(DecryptedRoomEvent {
            clear_event,
            sender: event.sender.clone(),
            sender_curve25519_key: content.sender_key,
            claimed_ed25519_key: Some(claimed_key),
            forwarding_curve25519_key_chain: Vec::new(),
        })
    }

    /// Decrypt an Olm ciphertext meant for us and run the mandatory payload
    /// checks, returning the decrypted payload and the sender's claimed
    /// ed25519 key.
    async fn decrypt_olm_content(
        &self,
        sender: &UserId,
        content: &OlmV1Curve25519AesSha2Content,
    ) -> OlmResult<(Value, Ed25519PublicKey)> {
        let our_key = self.identity_keys().await.curve25519.to_base64();

        let message: &OlmMessage = content
            .ciphertext
            .get(&our_key)
            .ok_or(EventError::NotIncludedInRecipients)?;

        let decryption_result = {
            let mut account = self.account.lock().await;
            account
                .decrypt_olm_helper(&self.store, sender, content.sender_key, message)
                .await
        };

        let (session_type, plaintext, message_hash) = match decryption_result {
            Ok(result) => result,
            Err(OlmError::SessionWedged(user_id, sender_key)) => {
                // Try to heal the channel; the current message stays lost.
                if let Err(e) = self
                    .session_manager
                    .mark_device_as_wedged(self.transport.as_ref(), &user_id, sender_key)
                    .await
                {
                    warn!(error = ?e, "Failed to unwedge a device");
                }

                return Err(OlmError::SessionWedged(user_id, sender_key));
            }
            Err(e) => return Err(e),
        };

        // Persist the new account state (an inbound session creation used up
        // a one-time key) and remember the message hash for replay
        // detection.
        let pickle = self.account.lock().await.pickle();
        self.store
            .save_changes(Changes {
                account: Some(pickle),
                message_hashes: vec![message_hash],
                ..Default::default()
            })
            .await?;

        if let SessionType::New(_) = &session_type {
            // A fresh session may unblock key requests that waited for one.
            if let Some(device) = self
                .store
                .get_device_by_curve_key(sender, content.sender_key)
                .await?
            {
                self.gossip_machine.retry_keyshare(device.user_id(), device.device_id());
            }
        }

        let payload: Value = serde_json::from_str(&plaintext)?;
        let claimed_key = self.check_olm_payload(sender, &payload).await?;

        Ok((payload, claimed_key))
    }

    /// The checks every decrypted Olm payload has to pass before it is
    /// trusted: the sender, the recipient and both parties' signing keys are
    /// bound into the plaintext exactly so relayed, misdirected or
    /// republished ciphertexts fail here.
    async fn check_olm_payload(
        &self,
        sender: &UserId,
        payload: &Value,
    ) -> OlmResult<Ed25519PublicKey> {
        let field = |name: &str| -> OlmResult<&Value> {
            payload.get(name).ok_or_else(|| EventError::MissingField(name.to_owned()).into())
        };

        let payload_sender: OwnedUserId = serde_json::from_value(field("sender")?.clone())?;
        let recipient: OwnedUserId = serde_json::from_value(field("recipient")?.clone())?;

        if recipient != self.user_id {
            return Err(EventError::MismatchedRecipient(recipient, self.user_id.clone()).into());
        }

        if payload_sender != sender {
            return Err(
                EventError::MismatchedSender(payload_sender, sender.to_owned()).into()
            );
        }

        let our_ed25519 = self.identity_keys().await.ed25519;
        let recipient_key = field("recipient_keys")?
            .get("ed25519")
            .and_then(Value::as_str)
            .ok_or(EventError::MissingSigningKey)?;

        if recipient_key != our_ed25519.to_base64() {
            return Err(EventError::MismatchedKeys.into());
        }

        let claimed_key = field("keys")?
            .get("ed25519")
            .and_then(Value::as_str)
            .and_then(|k| Ed25519PublicKey::from_base64(k).ok())
            .ok_or(EventError::MissingSigningKey)?;

        Ok(claimed_key)
    }

    /// Decrypt an encrypted to-device event and handle its payload: room
    /// keys and forwarded room keys are absorbed into the store, dummy
    /// events only establish sessions.
    ///
    /// Returns the decrypted payload so callers can react to event types
    /// this crate doesn't handle itself.
    pub async fn receive_encrypted_to_device_event(
        &self,
        event: &ToDeviceEvent<ToDeviceEncryptedEventContent>,
    ) -> OlmResult<Value> {
        let ToDeviceEncryptedEventContent::OlmV1Curve25519AesSha2(content) = &event.content;

        let (payload, claimed_key) =
            self.decrypt_olm_content(&event.sender, content).await?;

        let event_type =
            payload.get("type").and_then(Value::as_str).unwrap_or_default().to_owned();

        match event_type.as_str() {
            "m.room_key" => {
                let room_key_event: DecryptedRoomKeyEvent =
                    serde_json::from_value(payload.clone())?;
                self.receive_room_key(content.sender_key, claimed_key, &room_key_event).await?;
            }
            "m.forwarded_room_key" => {
                let forwarded: DecryptedForwardedRoomKeyEvent =
                    serde_json::from_value(payload.clone())?;

                if let Some(session) = self
                    .gossip_machine
                    .receive_forwarded_room_key(content.sender_key, &forwarded)
                    .await?
                {
                    self.store.import_inbound_group_sessions(vec![session]).await?;
                }
            }
            "m.dummy" => {
                debug!(sender = ?event.sender, "Received an m.dummy event");
            }
            other => {
                debug!(event_type = other, "Received an unhandled encrypted to-device event");
            }
        }

        Ok(payload)
    }

    async fn receive_room_key(
        &self,
        sender_key: Curve25519PublicKey,
        signing_key: Ed25519PublicKey,
        event: &DecryptedRoomKeyEvent,
    ) -> OlmResult<()> {
        if event.content.algorithm != EventEncryptionAlgorithm::MegolmV1AesSha2 {
            warn!(
                algorithm = %event.content.algorithm,
                "Received a room key with an unsupported algorithm",
            );
            return Ok(());
        }

        let session =
            InboundGroupSession::from_room_key_content(sender_key, signing_key, &event.content)?;

        info!(
            sender = ?event.sender,
            room_id = ?session.room_id(),
            session_id = session.session_id(),
            "Received a new room key",
        );

        let info = RequestedKeyInfo::new(
            event.content.algorithm.clone(),
            event.content.room_id.clone(),
            sender_key,
            event.content.session_id.clone(),
        );

        self.store.import_inbound_group_sessions(vec![session]).await?;

        // If we were asking other devices for this key the need just
        // evaporated.
        self.gossip_machine.cancel_request_for_key(&info).await?;

        Ok(())
    }

    /// Handle an incoming `m.room_key_request` to-device event.
    ///
    /// The requests are only queued here; [`OlmMachine::process_key_requests`]
    /// answers them.
    pub fn receive_room_key_request(&self, event: &ToDeviceEvent<RoomKeyRequestContent>) {
        self.gossip_machine.receive_incoming_key_request(event);
    }

    /// Answer every queued room key request that passes the trust policy:
    /// only our own, verified, non-blacklisted devices are served.
    pub async fn process_key_requests(&self) -> OlmResult<()> {
        self.gossip_machine.collect_incoming_key_requests(self.transport.as_ref()).await
    }

    /// Send out every pending room key request and cancellation.
    pub async fn send_outgoing_key_requests(&self) -> OlmResult<()> {
        self.gossip_machine.send_outgoing_requests(self.transport.as_ref()).await
    }

    /// A member of an encrypted room joined or left; adjust tracking and
    /// session rotation accordingly.
    pub async fn receive_room_membership_change(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        change: MembershipChange,
    ) -> OlmResult<()> {
        match change {
            MembershipChange::Joined => {
                self.identity_manager.update_tracked_users([user_id].into_iter()).await?;
            }
            MembershipChange::Left => {
                // The next share must use a session the leaver never saw.
                if self.group_session_manager.invalidate_group_session(room_id).await? {
                    debug!(
                        ?room_id,
                        ?user_id,
                        "Invalidated the outbound group session because a member left",
                    );
                }
            }
        }

        Ok(())
    }

    /// Export room keys matching the given predicate.
    pub async fn export_room_keys(
        &self,
        predicate: impl Fn(&InboundGroupSession) -> bool,
    ) -> StoreResult<Vec<ExportedRoomKey>> {
        let mut exported = Vec::new();

        for session in self.store.get_inbound_group_sessions().await? {
            if predicate(&session) {
                exported.push(session.export().await);
            }
        }

        Ok(exported)
    }

    /// Import previously exported room keys.
    ///
    /// An import never makes a session worse: a key we already hold with a
    /// lower first-known-index stays untouched. Returns the number of
    /// sessions that were actually imported.
    pub async fn import_room_keys(&self, keys: Vec<ExportedRoomKey>) -> OlmResult<usize> {
        let mut sessions = Vec::new();
        let mut infos = Vec::new();

        for key in keys {
            let info = RequestedKeyInfo::new(
                key.algorithm.clone(),
                key.room_id.clone(),
                key.sender_key,
                key.session_id.clone(),
            );

            match InboundGroupSession::from_export(&key) {
                Ok(session) => {
                    sessions.push(session);
                    infos.push(info);
                }
                Err(e) => {
                    warn!(
                        room_id = ?key.room_id,
                        session_id = key.session_id,
                        error = ?e,
                        "Couldn't import an exported room key",
                    );
                }
            }
        }

        let imported = self.store.import_inbound_group_sessions(sessions).await?;

        for info in infos {
            self.gossip_machine.cancel_request_for_key(&info).await?;
        }

        Ok(imported)
    }

    /// Encrypt the given content for a single device and send it as a
    /// to-device event.
    ///
    /// An Olm session with the device has to exist.
    pub async fn encrypt_to_device_event(
        &self,
        device: &DeviceData,
        event_type: &str,
        content: Value,
    ) -> OlmResult<()> {
        let encrypted = device.encrypt(&self.store, event_type, content).await?;

        let request = ToDeviceRequest::new(
            device.user_id(),
            device.device_id(),
            "m.room.encrypted",
            serde_json::to_value(&encrypted)?,
        );

        self.transport.send_to_device(request).await?;

        Ok(())
    }

    /// Establish Olm sessions with all devices of the given users that we
    /// don't share one with yet.
    pub async fn ensure_sessions(&self, users: &[OwnedUserId]) -> OlmResult<()> {
        self.session_manager
            .ensure_sessions(self.transport.as_ref(), users.iter().map(|u| &**u))
            .await
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use ruma::{device_id, room_id, user_id};
    use serde_json::json;
    use std::sync::Arc;

    use super::OlmMachine;
    use crate::{
        error::MegolmError,
        store::RoomSettings,
        transport::{
            CryptoTransport, KeysBackupRequest, KeysClaimRequest, KeysClaimResponse,
            KeysQueryRequest, KeysQueryResponse, KeysBackupResponse, KeysUploadRequest,
            KeysUploadResponse, ToDeviceRequest, TransportError,
        },
        types::EventEncryptionAlgorithm,
    };

    /// A transport for tests that need a machine but no working network.
    #[derive(Debug, Default)]
    struct DeadTransport;

    #[async_trait::async_trait]
    impl CryptoTransport for DeadTransport {
        async fn upload_keys(
            &self,
            _: KeysUploadRequest,
        ) -> Result<KeysUploadResponse, TransportError> {
            Ok(KeysUploadResponse::default())
        }

        async fn query_keys(
            &self,
            _: KeysQueryRequest,
        ) -> Result<KeysQueryResponse, TransportError> {
            Ok(KeysQueryResponse::default())
        }

        async fn claim_keys(
            &self,
            _: KeysClaimRequest,
        ) -> Result<KeysClaimResponse, TransportError> {
            Ok(KeysClaimResponse::default())
        }

        async fn send_to_device(&self, _: ToDeviceRequest) -> Result<(), TransportError> {
            Ok(())
        }

        async fn upload_backup(&self, _: KeysBackupRequest) -> Result<(), TransportError> {
            Ok(())
        }

        async fn download_backup(
            &self,
            _: &str,
        ) -> Result<KeysBackupResponse, TransportError> {
            Ok(KeysBackupResponse::default())
        }
    }

    async fn machine() -> OlmMachine {
        OlmMachine::new(
            user_id!("@alice:localhost"),
            device_id!("ALICEDEVICE"),
            Arc::new(DeadTransport),
        )
        .await
    }

    #[tokio::test]
    async fn room_algorithm_is_write_once() {
        let machine = machine().await;
        let room_id = room_id!("!room:localhost");

        machine
            .set_room_settings(
                room_id,
                RoomSettings::new(EventEncryptionAlgorithm::MegolmV1AesSha2),
            )
            .await
            .unwrap();

        let error = machine
            .set_room_settings(
                room_id,
                RoomSettings::new(EventEncryptionAlgorithm::OlmV1Curve25519AesSha2),
            )
            .await
            .unwrap_err();

        assert_matches!(error, MegolmError::AlgorithmChange(..));

        // Re-setting the same algorithm with tightened settings is fine.
        let mut settings = RoomSettings::new(EventEncryptionAlgorithm::MegolmV1AesSha2);
        settings.only_allow_trusted_devices = true;
        machine.set_room_settings(room_id, settings).await.unwrap();
    }

    #[tokio::test]
    async fn encrypting_without_a_shared_session_fails() {
        let machine = machine().await;
        let room_id = room_id!("!room:localhost");

        machine
            .set_room_settings(
                room_id,
                RoomSettings::new(EventEncryptionAlgorithm::MegolmV1AesSha2),
            )
            .await
            .unwrap();

        let error = machine
            .encrypt_room_event(room_id, &[], "m.room.message", json!({ "body": "hello" }))
            .await
            .unwrap_err();

        assert_matches!(error, MegolmError::SessionNotShared(_));
    }

    #[tokio::test]
    async fn encrypting_in_an_unconfigured_room_fails() {
        let machine = machine().await;

        let error = machine
            .encrypt_room_event(
                room_id!("!room:localhost"),
                &[],
                "m.room.message",
                json!({ "body": "hello" }),
            )
            .await
            .unwrap_err();

        assert_matches!(error, MegolmError::EncryptionNotEnabled(_));
    }
}
