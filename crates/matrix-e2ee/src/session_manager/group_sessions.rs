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

use std::{collections::HashSet, sync::Arc};

use dashmap::DashMap;
use ruma::{OwnedDeviceId, OwnedRoomId, OwnedUserId, RoomId, UserId};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    error::{MegolmResult, OlmResult},
    identities::DeviceData,
    olm::{
        Account, EncryptionSettings, InboundGroupSession, OutboundGroupSession, ShareState,
    },
    store::{Changes, Store},
    transport::{CryptoTransport, ToDeviceRequest},
    types::UsersDevicesMap,
    session_manager::SessionManager,
};

/// The result of checking which devices should receive an outbound session.
#[derive(Debug, Default)]
struct CollectedRecipients {
    /// The devices that should hold the session key.
    devices: Vec<DeviceData>,
    /// True if the existing session was shared with a device that is no
    /// longer in the recipient set; the session key must not travel to a
    /// device its owner retired, so the session gets rotated.
    should_rotate: bool,
}

/// Manages the outbound Megolm sessions: creation, rotation and key
/// sharing.
#[derive(Debug, Clone)]
pub(crate) struct GroupSessionManager {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    account: Arc<Mutex<Account>>,
    store: Store,
    /// One lock per room; held over the in-memory rotation decision only,
    /// never across a network round-trip.
    room_locks: Arc<DashMap<OwnedRoomId, Arc<Mutex<()>>>>,
}

impl GroupSessionManager {
    pub(crate) fn new(
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
        account: Arc<Mutex<Account>>,
        store: Store,
    ) -> Self {
        Self { user_id, device_id, account, store, room_locks: Arc::new(DashMap::new()) }
    }

    fn room_lock(&self, room_id: &RoomId) -> Arc<Mutex<()>> {
        self.room_locks.entry(room_id.to_owned()).or_default().clone()
    }

    /// Get the active outbound session of the room, creating a fresh one
    /// (with its matching inbound copy for our own timeline) if there is
    /// none yet or the active one reached the end of its life.
    ///
    /// The returned session may still need its key shared before use.
    pub(crate) async fn get_or_create_outbound_session(
        &self,
        room_id: &RoomId,
        settings: EncryptionSettings,
    ) -> MegolmResult<OutboundGroupSession> {
        let lock = self.room_lock(room_id);
        let _guard = lock.lock().await;

        if let Some(session) = self.store.get_outbound_group_session(room_id).await? {
            if !session.expired() && !session.invalidated() {
                return Ok(session);
            }

            debug!(
                ?room_id,
                session_id = session.session_id(),
                expired = session.expired(),
                invalidated = session.invalidated(),
                "Rotating the outbound group session"
            );
        }

        let (outbound, inbound) = {
            let account = self.account.lock().await;

            let outbound = OutboundGroupSession::new(
                account.device_id().to_owned(),
                account.identity_keys_arc(),
                room_id,
                settings,
            )?;

            let inbound = InboundGroupSession::new(
                account.identity_keys().curve25519,
                account.identity_keys().ed25519,
                room_id,
                &outbound.session_key().await,
            );

            (outbound, inbound)
        };

        info!(?room_id, session_id = outbound.session_id(), "Created a new outbound group session");

        self.store
            .save_changes(Changes {
                outbound_group_sessions: vec![outbound.clone()],
                inbound_group_sessions: vec![inbound],
                ..Default::default()
            })
            .await?;

        Ok(outbound)
    }

    /// Work out which devices of the given users should receive the session
    /// key, and whether the session has to be rotated first.
    async fn collect_session_recipients(
        &self,
        users: &[OwnedUserId],
        settings: &EncryptionSettings,
        outbound: &OutboundGroupSession,
    ) -> MegolmResult<CollectedRecipients> {
        let users: HashSet<&UserId> = users.iter().map(|u| &**u).collect();
        let mut devices = Vec::new();

        // A session shared with a user that left the room, or with a device
        // that got blacklisted since, must not encrypt anything further.
        let mut should_rotate = outbound
            .shared_with_set
            .iter()
            .any(|entry| !users.contains(&**entry.key()));

        for user_id in &users {
            let user_devices = self.store.get_user_devices(user_id).await?;

            for device in user_devices.devices() {
                // Our own device holds the matching inbound session already.
                if device.user_id() == self.user_id && device.device_id() == self.device_id {
                    continue;
                }

                if device.is_blacklisted()
                    || (settings.only_allow_trusted_devices && !device.is_verified())
                {
                    if outbound.is_shared_with(device) != ShareState::NotShared {
                        should_rotate = true;
                    }
                    continue;
                }

                devices.push(device.clone());
            }
        }

        Ok(CollectedRecipients { devices, should_rotate })
    }

    /// Share the room key of the active outbound session with every device
    /// of the given users that is allowed to have it.
    ///
    /// Rotates the session first when the recipient set no longer matches
    /// the set the session was originally shared with.
    pub(crate) async fn share_room_key(
        &self,
        transport: &dyn CryptoTransport,
        session_manager: &SessionManager,
        room_id: &RoomId,
        users: &[OwnedUserId],
        settings: EncryptionSettings,
    ) -> MegolmResult<OutboundGroupSession> {
        let mut outbound =
            self.get_or_create_outbound_session(room_id, settings.clone()).await?;

        let mut collected =
            self.collect_session_recipients(users, &settings, &outbound).await?;

        if collected.should_rotate {
            outbound.invalidate_session();
            outbound = self.get_or_create_outbound_session(room_id, settings.clone()).await?;
            collected = self.collect_session_recipients(users, &settings, &outbound).await?;
        }

        // Make sure we can reach every recipient device over Olm.
        session_manager
            .ensure_sessions(transport, collected.devices.iter().map(|d| d.user_id()).collect::<HashSet<_>>().into_iter())
            .await?;

        let message_index = outbound.message_index().await;
        let key_content = serde_json::to_value(&outbound.as_room_key_content().await)
            .map_err(crate::error::MegolmError::Json)?;

        let mut messages = UsersDevicesMap::new();
        let mut shared_with: Vec<(OwnedUserId, OwnedDeviceId, _)> = Vec::new();

        for device in &collected.devices {
            match outbound.is_shared_with(device) {
                ShareState::Shared(_) => continue,
                ShareState::SharedButChangedSenderKey | ShareState::NotShared => {}
            }

            match device.encrypt(&self.store, "m.room_key", key_content.clone()).await {
                Ok(content) => {
                    messages.insert(
                        device.user_id(),
                        device.device_id(),
                        serde_json::to_value(&content)
                            .map_err(crate::error::MegolmError::Json)?,
                    );
                    shared_with.push((
                        device.user_id().to_owned(),
                        device.device_id().to_owned(),
                        device.curve25519_key(),
                    ));
                }
                Err(e) => {
                    // No Olm session could be established, e.g. the device
                    // ran out of one-time keys. The device simply doesn't
                    // receive this session.
                    warn!(
                        user_id = ?device.user_id(),
                        device_id = ?device.device_id(),
                        error = ?e,
                        "Couldn't encrypt the room key for a device"
                    );
                }
            }
        }

        if !messages.is_empty() {
            let request = ToDeviceRequest {
                event_type: "m.room.encrypted".to_owned(),
                txn_id: ruma::TransactionId::new(),
                messages,
            };

            let recipient_count = request.messages.len();
            transport.send_to_device(request).await.map_err(crate::error::OlmError::from)?;

            info!(
                ?room_id,
                session_id = outbound.session_id(),
                recipients = recipient_count,
                "Shared the room key with the room's devices"
            );
        }

        for (user_id, device_id, sender_key) in shared_with {
            if let Some(sender_key) = sender_key {
                outbound.mark_shared_with(&user_id, &device_id, sender_key, message_index);
            }
        }

        outbound.mark_as_shared();

        self.store
            .save_changes(Changes {
                outbound_group_sessions: vec![outbound.clone()],
                ..Default::default()
            })
            .await?;

        Ok(outbound)
    }

    /// Invalidate the active outbound session of the given room, forcing a
    /// rotation on the next send.
    pub(crate) async fn invalidate_group_session(&self, room_id: &RoomId) -> OlmResult<bool> {
        if let Some(session) = self.store.get_outbound_group_session(room_id).await? {
            session.invalidate_session();

            self.store
                .save_changes(Changes {
                    outbound_group_sessions: vec![session],
                    ..Default::default()
                })
                .await?;

            Ok(true)
        } else {
            Ok(false)
        }
    }
}
