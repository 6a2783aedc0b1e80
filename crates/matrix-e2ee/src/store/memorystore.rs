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
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, RwLock as StdRwLock},
};

use async_trait::async_trait;
use ruma::{
    OwnedRoomId, OwnedTransactionId, OwnedUserId, DeviceId, RoomId, TransactionId, UserId,
};
use tokio::sync::Mutex;
use vodozemac::Curve25519PublicKey;

use super::{
    caches::{DeviceStore, GroupSessionStore, SessionStore},
    Changes, CryptoStore, DeviceTrackingStatus, Result, RoomKeyCounts, RoomSettings,
};
use crate::{
    gossip::OutgoingKeyRequest,
    identities::{DeviceData, UserDevices},
    olm::{InboundGroupSession, OlmMessageHash, OutboundGroupSession, PickledAccount, Session},
    types::events::room_key_request::RequestedKeyInfo,
};

/// An in-memory only store that forgets all the keys once it's dropped.
#[derive(Debug, Default)]
pub struct MemoryStore {
    account: StdRwLock<Option<PickledAccount>>,
    sessions: SessionStore,
    inbound_group_sessions: GroupSessionStore,
    outbound_group_sessions: StdRwLock<BTreeMap<OwnedRoomId, OutboundGroupSession>>,
    devices: DeviceStore,
    tracked_users: StdRwLock<HashMap<OwnedUserId, DeviceTrackingStatus>>,
    olm_hashes: StdRwLock<HashMap<String, HashSet<String>>>,
    key_requests: StdRwLock<HashMap<OwnedTransactionId, OutgoingKeyRequest>>,
    key_requests_by_info: StdRwLock<HashMap<String, OwnedTransactionId>>,
    room_settings: StdRwLock<HashMap<OwnedRoomId, RoomSettings>>,
    backup_version: StdRwLock<Option<String>>,
}

impl MemoryStore {
    /// Create a new empty `MemoryStore`.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CryptoStore for MemoryStore {
    async fn load_account(&self) -> Result<Option<PickledAccount>> {
        let account = self.account.read().unwrap();

        Ok(match &*account {
            Some(pickle) => {
                // Round-trip through serde so the caller gets an owned copy.
                Some(serde_json::from_value(serde_json::to_value(pickle)?)?)
            }
            None => None,
        })
    }

    async fn save_changes(&self, changes: Changes) -> Result<()> {
        if let Some(account) = changes.account {
            *self.account.write().unwrap() = Some(account);
        }

        for session in changes.sessions {
            self.sessions.add(session).await;
        }

        for session in changes.inbound_group_sessions {
            self.inbound_group_sessions.add(session);
        }

        for session in changes.outbound_group_sessions {
            self.outbound_group_sessions
                .write()
                .unwrap()
                .insert(session.room_id().to_owned(), session);
        }

        for device in changes.devices.new.into_iter().chain(changes.devices.changed) {
            self.devices.add(device);
        }

        for device in changes.devices.deleted {
            self.devices.remove(device.user_id(), device.device_id());
        }

        {
            let mut olm_hashes = self.olm_hashes.write().unwrap();
            for hash in changes.message_hashes {
                olm_hashes.entry(hash.sender_key).or_default().insert(hash.hash);
            }
        }

        {
            let mut requests = self.key_requests.write().unwrap();
            let mut by_info = self.key_requests_by_info.write().unwrap();

            for request in changes.key_requests {
                by_info.insert(request.info.as_key(), request.request_id.clone());
                requests.insert(request.request_id.clone(), request);
            }
        }

        self.room_settings.write().unwrap().extend(changes.room_settings);

        if let Some(version) = changes.backup_version {
            *self.backup_version.write().unwrap() = Some(version);
        }

        Ok(())
    }

    async fn get_sessions(&self, sender_key: &str) -> Result<Option<Arc<Mutex<Vec<Session>>>>> {
        Ok(self.sessions.get(sender_key))
    }

    async fn get_inbound_group_session(
        &self,
        room_id: &RoomId,
        sender_key: &str,
        session_id: &str,
    ) -> Result<Option<InboundGroupSession>> {
        Ok(self.inbound_group_sessions.get(room_id, sender_key, session_id))
    }

    async fn get_inbound_group_sessions(&self) -> Result<Vec<InboundGroupSession>> {
        Ok(self.inbound_group_sessions.get_all())
    }

    async fn inbound_group_session_counts(&self) -> Result<RoomKeyCounts> {
        let backed_up =
            self.inbound_group_sessions.get_all().into_iter().filter(|s| s.backed_up()).count();

        Ok(RoomKeyCounts { total: self.inbound_group_sessions.count(), backed_up })
    }

    async fn inbound_group_sessions_for_backup(
        &self,
        limit: usize,
    ) -> Result<Vec<InboundGroupSession>> {
        Ok(self
            .inbound_group_sessions
            .get_all()
            .into_iter()
            .filter(|s| !s.backed_up())
            .take(limit)
            .collect())
    }

    async fn mark_inbound_group_sessions_as_backed_up(
        &self,
        room_and_session_ids: &[(&RoomId, &str)],
    ) -> Result<()> {
        for session in self.inbound_group_sessions.get_all() {
            if room_and_session_ids
                .iter()
                .any(|(r, s)| *r == session.room_id() && *s == session.session_id())
            {
                session.mark_as_backed_up();
            }
        }

        Ok(())
    }

    async fn reset_backup_state(&self) -> Result<()> {
        for session in self.inbound_group_sessions.get_all() {
            session.reset_backup_state();
        }

        Ok(())
    }

    async fn load_backup_version(&self) -> Result<Option<String>> {
        Ok(self.backup_version.read().unwrap().clone())
    }

    async fn get_outbound_group_session(
        &self,
        room_id: &RoomId,
    ) -> Result<Option<OutboundGroupSession>> {
        Ok(self.outbound_group_sessions.read().unwrap().get(room_id).cloned())
    }

    async fn get_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceData>> {
        Ok(self.devices.get(user_id, device_id))
    }

    async fn get_user_devices(&self, user_id: &UserId) -> Result<UserDevices> {
        Ok(self.devices.user_devices(user_id))
    }

    async fn get_device_by_curve_key(
        &self,
        user_id: &UserId,
        curve_key: Curve25519PublicKey,
    ) -> Result<Option<DeviceData>> {
        Ok(self
            .devices
            .user_devices(user_id)
            .devices()
            .find(|d| d.curve25519_key() == Some(curve_key))
            .cloned())
    }

    async fn tracked_users(&self) -> Result<Vec<OwnedUserId>> {
        Ok(self
            .tracked_users
            .read()
            .unwrap()
            .iter()
            .filter(|(_, status)| **status != DeviceTrackingStatus::NotTracked)
            .map(|(user, _)| user.clone())
            .collect())
    }

    async fn tracking_status(&self, user_id: &UserId) -> Result<DeviceTrackingStatus> {
        Ok(self.tracked_users.read().unwrap().get(user_id).copied().unwrap_or_default())
    }

    async fn set_tracking_status(
        &self,
        user_id: &UserId,
        status: DeviceTrackingStatus,
    ) -> Result<()> {
        self.tracked_users.write().unwrap().insert(user_id.to_owned(), status);

        Ok(())
    }

    async fn is_message_known(&self, message_hash: &OlmMessageHash) -> Result<bool> {
        Ok(self
            .olm_hashes
            .read()
            .unwrap()
            .get(&message_hash.sender_key)
            .is_some_and(|hashes| hashes.contains(&message_hash.hash)))
    }

    async fn get_outgoing_key_request(
        &self,
        request_id: &TransactionId,
    ) -> Result<Option<OutgoingKeyRequest>> {
        Ok(self.key_requests.read().unwrap().get(request_id).cloned())
    }

    async fn get_key_request_by_info(
        &self,
        info: &RequestedKeyInfo,
    ) -> Result<Option<OutgoingKeyRequest>> {
        let id = self.key_requests_by_info.read().unwrap().get(&info.as_key()).cloned();

        Ok(id.and_then(|id| self.key_requests.read().unwrap().get(&id).cloned()))
    }

    async fn get_unsent_key_requests(&self) -> Result<Vec<OutgoingKeyRequest>> {
        Ok(self
            .key_requests
            .read()
            .unwrap()
            .values()
            .filter(|r| r.needs_sending())
            .cloned()
            .collect())
    }

    async fn delete_outgoing_key_request(&self, request_id: &TransactionId) -> Result<()> {
        if let Some(request) = self.key_requests.write().unwrap().remove(request_id) {
            self.key_requests_by_info.write().unwrap().remove(&request.info.as_key());
        }

        Ok(())
    }

    async fn get_room_settings(&self, room_id: &RoomId) -> Result<Option<RoomSettings>> {
        Ok(self.room_settings.read().unwrap().get(room_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use ruma::user_id;

    use super::MemoryStore;
    use crate::{
        identities::device::testing::get_device,
        store::{Changes, CryptoStore, DeviceChanges, DeviceTrackingStatus},
    };

    #[tokio::test]
    async fn device_store_round_trip() {
        let store = MemoryStore::new();
        let device = get_device();

        store
            .save_changes(Changes {
                devices: DeviceChanges { new: vec![device.clone()], ..Default::default() },
                ..Default::default()
            })
            .await
            .unwrap();

        let loaded = store.get_device(device.user_id(), device.device_id()).await.unwrap();
        assert_eq!(loaded.as_ref(), Some(&device));

        let by_curve = store
            .get_device_by_curve_key(device.user_id(), device.curve25519_key().unwrap())
            .await
            .unwrap();
        assert_eq!(by_curve.as_ref(), Some(&device));
    }

    #[tokio::test]
    async fn imports_never_downgrade_a_session() {
        use ruma::room_id;
        use vodozemac::megolm::{GroupSession, SessionConfig};

        use crate::{olm::InboundGroupSession, store::Store};

        let store = Store::new(Arc::new(MemoryStore::new()));

        let account = crate::olm::Account::new(
            user_id!("@alice:localhost"),
            ruma::device_id!("ALICEDEVICE"),
        );
        let keys = account.identity_keys();

        let mut outbound = GroupSession::new(SessionConfig::version_1());
        let full = InboundGroupSession::new(
            keys.curve25519,
            keys.ed25519,
            room_id!("!room:localhost"),
            &outbound.session_key(),
        );

        // Advance the ratchet and build a copy that only knows index 1.
        let _ = outbound.encrypt("an event");
        let partial =
            InboundGroupSession::from_export(&full.export_at_index(1).await).unwrap();

        // Importing the partial copy over the full one is a no-op...
        store.save_inbound_group_sessions(vec![full.clone()]).await.unwrap();
        let imported = store.import_inbound_group_sessions(vec![partial.clone()]).await.unwrap();
        assert_eq!(imported, 0);

        let held = store
            .get_inbound_group_session(
                full.room_id(),
                &full.sender_key().to_base64(),
                full.session_id(),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(held.first_known_index(), 0);

        // ...while importing the full copy over the partial one replaces it.
        let store = Store::new(Arc::new(MemoryStore::new()));
        store.save_inbound_group_sessions(vec![partial.clone()]).await.unwrap();
        let imported = store.import_inbound_group_sessions(vec![full.clone()]).await.unwrap();
        assert_eq!(imported, 1);

        let held = store
            .get_inbound_group_session(
                full.room_id(),
                &full.sender_key().to_base64(),
                full.session_id(),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(held.first_known_index(), 0);
    }

    #[tokio::test]
    async fn tracking_status_defaults_to_not_tracked() {
        let store = MemoryStore::new();
        let user = user_id!("@bob:localhost");

        assert_eq!(
            store.tracking_status(user).await.unwrap(),
            DeviceTrackingStatus::NotTracked
        );

        store.set_tracking_status(user, DeviceTrackingStatus::PendingDownload).await.unwrap();
        assert_eq!(
            store.tracking_status(user).await.unwrap(),
            DeviceTrackingStatus::PendingDownload
        );
        assert_eq!(store.tracked_users().await.unwrap(), vec![user.to_owned()]);
    }
}
