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

use std::collections::HashSet;

use ruma::{OwnedDeviceId, OwnedUserId, DeviceId, UserId};
use tracing::{debug, info, warn};

use super::DeviceData;
use crate::{
    error::OlmResult,
    store::{Changes, DeviceChanges, DeviceTrackingStatus, Result as StoreResult, Store},
    transport::{CryptoTransport, KeysQueryRequest, KeysQueryResponse},
};

/// Keeps our copy of the device lists of other users up to date.
///
/// Every tracked user walks through a small state machine: an outdated list
/// is `PendingDownload`, a key query in flight marks it `Downloading`, and a
/// processed response `UpToDate`. A failed query parks the user in
/// `UnreachableServer` so the next pass retries.
#[derive(Debug, Clone)]
pub(crate) struct IdentityManager {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    store: Store,
}

impl IdentityManager {
    pub(crate) fn new(user_id: OwnedUserId, device_id: OwnedDeviceId, store: Store) -> Self {
        Self { user_id, device_id, store }
    }

    fn user_id(&self) -> &UserId {
        &self.user_id
    }

    fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Start tracking the given users, marking unknown ones as needing a
    /// device list download.
    pub(crate) async fn update_tracked_users(
        &self,
        users: impl Iterator<Item = &UserId>,
    ) -> StoreResult<()> {
        for user_id in users {
            if self.store.tracking_status(user_id).await? == DeviceTrackingStatus::NotTracked {
                debug!(?user_id, "Started tracking the devices of a new user");
                self.store
                    .set_tracking_status(user_id, DeviceTrackingStatus::PendingDownload)
                    .await?;
            }
        }

        Ok(())
    }

    /// Mark a tracked user's device list as outdated, e.g. because the
    /// server announced a change or a new device appeared.
    pub(crate) async fn mark_user_as_changed(&self, user_id: &UserId) -> StoreResult<()> {
        self.store.set_tracking_status(user_id, DeviceTrackingStatus::PendingDownload).await
    }

    /// The users whose device lists need to be downloaded.
    pub(crate) async fn users_for_key_query(&self) -> StoreResult<Vec<OwnedUserId>> {
        let mut users = Vec::new();

        for user_id in self.store.tracked_users().await? {
            match self.store.tracking_status(&user_id).await? {
                DeviceTrackingStatus::PendingDownload
                | DeviceTrackingStatus::UnreachableServer => users.push(user_id),
                DeviceTrackingStatus::NotTracked
                | DeviceTrackingStatus::Downloading
                | DeviceTrackingStatus::UpToDate => {}
            }
        }

        Ok(users)
    }

    /// Download the device lists of every user that needs one, applying the
    /// result to the store.
    pub(crate) async fn download_device_keys(
        &self,
        transport: &dyn CryptoTransport,
    ) -> OlmResult<DeviceChanges> {
        let users = self.users_for_key_query().await?;

        if users.is_empty() {
            return Ok(DeviceChanges::default());
        }

        for user_id in &users {
            self.store.set_tracking_status(user_id, DeviceTrackingStatus::Downloading).await?;
        }

        let response =
            match transport.query_keys(KeysQueryRequest { users: users.clone() }).await {
                Ok(response) => response,
                Err(e) => {
                    // The lists stay outdated; the next pass will retry.
                    for user_id in &users {
                        self.store
                            .set_tracking_status(user_id, DeviceTrackingStatus::UnreachableServer)
                            .await?;
                    }

                    return Err(e.into());
                }
            };

        let changes = self.receive_keys_query_response(&users, &response).await?;

        for user_id in &users {
            self.store.set_tracking_status(user_id, DeviceTrackingStatus::UpToDate).await?;
        }

        Ok(changes)
    }

    /// Apply a key query response for the given users to the device store.
    pub(crate) async fn receive_keys_query_response(
        &self,
        queried_users: &[OwnedUserId],
        response: &KeysQueryResponse,
    ) -> OlmResult<DeviceChanges> {
        let mut changes = DeviceChanges::default();

        for user_id in queried_users {
            let stored_devices = self.store.get_user_devices(user_id).await?;
            let own_user = user_id == self.user_id();

            let current_devices: HashSet<&DeviceId> = response
                .device_keys
                .get(user_id)
                .map(|d| d.keys().map(|id| id.as_ref()).collect())
                .unwrap_or_default();

            if let Some(device_map) = response.device_keys.get(user_id) {
                for (device_id, device_keys) in device_map {
                    // Our own device doesn't pass through key queries.
                    if own_user && &**device_id == self.device_id() {
                        continue;
                    }

                    if user_id != &device_keys.user_id || *device_id != device_keys.device_id {
                        warn!(
                            ?user_id,
                            ?device_id,
                            "Mismatch in the device keys payload of a key query response",
                        );
                        continue;
                    }

                    if let Some(mut device) = stored_devices.get(device_id).cloned() {
                        match device.update_device(device_keys) {
                            Ok(()) => changes.changed.push(device),
                            Err(e) => {
                                // A key change is not an update, it's an alarm;
                                // the stored device and its trust state stay.
                                warn!(
                                    ?user_id,
                                    ?device_id,
                                    error = ?e,
                                    "Rejected a device update from a key query response",
                                );
                            }
                        }
                    } else {
                        match DeviceData::try_from_keys(device_keys) {
                            Ok(device) => {
                                info!(?user_id, ?device_id, "Discovered a new device");
                                changes.new.push(device);
                            }
                            Err(e) => {
                                warn!(
                                    ?user_id,
                                    ?device_id,
                                    error = ?e,
                                    "Rejected the device keys of a new device",
                                );
                            }
                        }
                    }
                }
            }

            // Sweep devices the server no longer lists; their owners logged
            // out of them.
            for device in stored_devices.devices() {
                if own_user && device.device_id() == self.device_id() {
                    continue;
                }

                if !current_devices.contains(device.device_id()) {
                    device.mark_as_deleted();
                    changes.deleted.push(device.clone());
                }
            }
        }

        if !changes.is_empty() {
            let device_changes = DeviceChanges {
                new: changes.new.clone(),
                changed: changes.changed.clone(),
                deleted: changes.deleted.clone(),
            };
            self.store
                .save_changes(Changes { devices: device_changes, ..Default::default() })
                .await?;
        }

        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ruma::{device_id, user_id};

    use super::IdentityManager;
    use crate::{
        olm::Account,
        store::{MemoryStore, Store},
        transport::KeysQueryResponse,
        types::UsersDevicesMap,
    };

    fn manager() -> IdentityManager {
        IdentityManager::new(
            user_id!("@alice:localhost").to_owned(),
            device_id!("ALICEDEVICE").to_owned(),
            Store::new(Arc::new(MemoryStore::new())),
        )
    }

    #[tokio::test]
    async fn tracking_state_machine() {
        let manager = manager();
        let bob = user_id!("@bob:localhost");

        manager.update_tracked_users([bob].into_iter()).await.unwrap();
        assert_eq!(manager.users_for_key_query().await.unwrap(), vec![bob.to_owned()]);

        // Applying an empty response marks nothing; the machinery setting
        // UpToDate lives in download_device_keys, exercised below through a
        // canned response.
        let bob_account = Account::new(bob, device_id!("BOBDEVICE"));
        let mut device_keys = UsersDevicesMap::new();
        device_keys.insert(bob, device_id!("BOBDEVICE"), bob_account.device_keys());

        let response = KeysQueryResponse { device_keys, ..Default::default() };
        let changes = manager
            .receive_keys_query_response(&[bob.to_owned()], &response)
            .await
            .unwrap();

        assert_eq!(changes.new.len(), 1);

        // A second identical response changes the device instead of
        // re-discovering it.
        let changes = manager
            .receive_keys_query_response(&[bob.to_owned()], &response)
            .await
            .unwrap();
        assert_eq!(changes.new.len(), 0);
        assert_eq!(changes.changed.len(), 1);
    }

    #[tokio::test]
    async fn deleted_devices_are_swept() {
        let manager = manager();
        let bob = user_id!("@bob:localhost");

        let bob_account = Account::new(bob, device_id!("BOBDEVICE"));
        let mut device_keys = UsersDevicesMap::new();
        device_keys.insert(bob, device_id!("BOBDEVICE"), bob_account.device_keys());
        let response = KeysQueryResponse { device_keys, ..Default::default() };

        manager.receive_keys_query_response(&[bob.to_owned()], &response).await.unwrap();

        // Bob logs out of the device; the next response no longer lists it.
        let response = KeysQueryResponse::default();
        let changes =
            manager.receive_keys_query_response(&[bob.to_owned()], &response).await.unwrap();

        assert_eq!(changes.deleted.len(), 1);

        let devices = manager.store.get_user_devices(bob).await.unwrap();
        assert!(devices.is_empty());
    }
}
