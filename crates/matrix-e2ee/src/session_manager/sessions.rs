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
    collections::HashSet,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use dashmap::DashMap;
use ruma::{OwnedDeviceId, OwnedUserId, SecondsSinceUnixEpoch, UserId};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use vodozemac::Curve25519PublicKey;

use crate::{
    error::OlmResult,
    olm::Account,
    store::Store,
    transport::{CryptoTransport, KeysClaimRequest, ToDeviceRequest},
    types::{events::dummy::DummyEventContent, UsersDevicesMap},
};

/// How long we wait before poking the same wedged device again.
const UNWEDGING_INTERVAL: Duration = Duration::from_secs(3600);

/// Establishes Olm sessions with other devices.
///
/// Session creation involves a network round-trip to claim a one-time key,
/// so overlapping callers are deduplicated through an in-flight set; the set
/// is only touched under its lock, never held across an await point.
#[derive(Debug, Clone)]
pub(crate) struct SessionManager {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    account: Arc<Mutex<Account>>,
    store: Store,
    sessions_being_created: Arc<StdMutex<HashSet<(OwnedUserId, OwnedDeviceId)>>>,
    last_unwedging_time: Arc<DashMap<(OwnedUserId, OwnedDeviceId), SecondsSinceUnixEpoch>>,
}

/// Removes its keys from the in-flight set when dropped, so an early return
/// or cancellation can't permanently block session creation for a device.
struct InFlightGuard {
    set: Arc<StdMutex<HashSet<(OwnedUserId, OwnedDeviceId)>>>,
    keys: Vec<(OwnedUserId, OwnedDeviceId)>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap();

        for key in &self.keys {
            set.remove(key);
        }
    }
}

impl SessionManager {
    pub(crate) fn new(
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
        account: Arc<Mutex<Account>>,
        store: Store,
    ) -> Self {
        Self {
            user_id,
            device_id,
            account,
            store,
            sessions_being_created: Arc::new(StdMutex::new(HashSet::new())),
            last_unwedging_time: Arc::new(DashMap::new()),
        }
    }

    /// The devices of the given users we don't share an Olm session with,
    /// mapped to the one-time key algorithm we need to claim for them.
    pub(crate) async fn get_missing_sessions(
        &self,
        users: impl Iterator<Item = &UserId>,
    ) -> OlmResult<UsersDevicesMap<String>> {
        let mut missing = UsersDevicesMap::new();

        for user_id in users {
            let user_devices = self.store.get_user_devices(user_id).await?;

            for device in user_devices.devices() {
                // No point in a session with the very device we are.
                if device.user_id() == self.user_id && device.device_id() == self.device_id {
                    continue;
                }

                if device.is_blacklisted() || !device.supports_olm() {
                    continue;
                }

                let Some(sender_key) = device.curve25519_key() else {
                    continue;
                };

                let is_missing = match self.store.get_sessions(&sender_key.to_base64()).await? {
                    Some(sessions) => sessions.lock().await.is_empty(),
                    None => true,
                };

                if is_missing {
                    missing.insert(user_id, device.device_id(), "signed_curve25519".to_owned());
                }
            }
        }

        Ok(missing)
    }

    /// Make sure we share an Olm session with every device of the given
    /// users, claiming one-time keys and creating sessions where needed.
    ///
    /// Devices that are already being handled by an overlapping call are
    /// skipped; devices whose server ran out of one-time keys are left
    /// session-less and reported at the next attempt.
    pub(crate) async fn ensure_sessions(
        &self,
        transport: &dyn CryptoTransport,
        users: impl Iterator<Item = &UserId>,
    ) -> OlmResult<()> {
        let missing = self.get_missing_sessions(users).await?;

        let (to_claim, _guard) = {
            let mut in_flight = self.sessions_being_created.lock().unwrap();
            let mut to_claim = UsersDevicesMap::new();
            let mut claimed_keys = Vec::new();

            for (user_id, device_id, algorithm) in missing.iter() {
                let key = (user_id.to_owned(), device_id.to_owned());

                if in_flight.insert(key.clone()) {
                    claimed_keys.push(key);
                    to_claim.insert(user_id, device_id, algorithm.clone());
                }
            }

            (
                to_claim,
                InFlightGuard {
                    set: self.sessions_being_created.clone(),
                    keys: claimed_keys,
                },
            )
        };

        if to_claim.is_empty() {
            return Ok(());
        }

        debug!(devices = to_claim.len(), "Claiming one-time keys for missing Olm sessions");

        let response =
            transport.claim_keys(KeysClaimRequest { one_time_keys: to_claim }).await?;

        self.receive_keys_claim_response(&response.one_time_keys).await
    }

    async fn receive_keys_claim_response(
        &self,
        one_time_keys: &UsersDevicesMap<crate::types::OneTimeKeys>,
    ) -> OlmResult<()> {
        let mut sessions = Vec::new();

        for (user_id, device_id, key_map) in one_time_keys.iter() {
            let device = match self.store.get_device(user_id, device_id).await? {
                Some(d) => d,
                None => {
                    warn!(
                        ?user_id,
                        ?device_id,
                        "Tried to create an Olm session but the device is unknown",
                    );
                    continue;
                }
            };

            match self.account.lock().await.create_outbound_session(&device, key_map) {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    warn!(
                        ?user_id,
                        ?device_id,
                        error = ?e,
                        "Couldn't create an Olm session from a claimed one-time key",
                    );
                    continue;
                }
            }
        }

        self.store.save_sessions(&sessions).await?;

        Ok(())
    }

    /// Handle a device whose session towards us got wedged: establish a
    /// fresh session and send an encrypted `m.dummy` through it so the other
    /// side moves over.
    ///
    /// Rate-limited per device, one attempt per hour.
    pub(crate) async fn mark_device_as_wedged(
        &self,
        transport: &dyn CryptoTransport,
        sender: &UserId,
        sender_key: Curve25519PublicKey,
    ) -> OlmResult<()> {
        let Some(device) = self.store.get_device_by_curve_key(sender, sender_key).await? else {
            warn!(
                ?sender,
                ?sender_key,
                "A message from an unknown device got wedged, no dummy will be sent",
            );
            return Ok(());
        };

        let key = (device.user_id().to_owned(), device.device_id().to_owned());
        let now = SecondsSinceUnixEpoch::now();

        if let Some(last) = self.last_unwedging_time.get(&key) {
            let elapsed = now.get().checked_sub(last.get()).map(u64::from).unwrap_or(0);

            if elapsed < UNWEDGING_INTERVAL.as_secs() {
                debug!(?key, "Not unwedging the device, we recently tried");
                return Ok(());
            }
        }
        self.last_unwedging_time.insert(key, now);

        info!(
            user_id = ?device.user_id(),
            device_id = ?device.device_id(),
            "Trying to unwedge a device by creating a fresh session and sending a dummy",
        );

        let mut to_claim = UsersDevicesMap::new();
        to_claim.insert(device.user_id(), device.device_id(), "signed_curve25519".to_owned());

        let response =
            transport.claim_keys(KeysClaimRequest { one_time_keys: to_claim }).await?;

        let Some(key_map) =
            response.one_time_keys.get_device(device.user_id(), device.device_id())
        else {
            warn!("The device we tried to unwedge has no one-time keys left");
            return Ok(());
        };

        let session = self.account.lock().await.create_outbound_session(&device, key_map)?;
        self.store.save_sessions(&[session]).await?;

        let content = device
            .encrypt(&self.store, "m.dummy", serde_json::to_value(DummyEventContent::new())?)
            .await?;

        let request = ToDeviceRequest::new(
            device.user_id(),
            device.device_id(),
            "m.room.encrypted",
            serde_json::to_value(&content)?,
        );

        transport.send_to_device(request).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ruma::{device_id, user_id};
    use tokio::sync::Mutex;

    use super::SessionManager;
    use crate::{
        olm::Account,
        store::{Changes, DeviceChanges, MemoryStore, Store},
        identities::DeviceData,
    };

    async fn manager_with_bob_device() -> (SessionManager, Account) {
        let account = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let store = Store::new(Arc::new(MemoryStore::new()));

        let bob = Account::new(user_id!("@bob:localhost"), device_id!("BOBDEVICE"));
        let bob_device = DeviceData::try_from_keys(&bob.device_keys()).unwrap();

        store
            .save_changes(Changes {
                devices: DeviceChanges { new: vec![bob_device], ..Default::default() },
                ..Default::default()
            })
            .await
            .unwrap();

        let manager = SessionManager::new(
            user_id!("@alice:localhost").to_owned(),
            device_id!("ALICEDEVICE").to_owned(),
            Arc::new(Mutex::new(account)),
            store,
        );

        (manager, bob)
    }

    #[tokio::test]
    async fn missing_sessions_are_reported() {
        let (manager, bob) = manager_with_bob_device().await;

        let missing = manager
            .get_missing_sessions([user_id!("@bob:localhost")].into_iter())
            .await
            .unwrap();

        assert_eq!(
            missing.get_device(bob.user_id(), bob.device_id()),
            Some(&"signed_curve25519".to_owned())
        );
    }

    #[tokio::test]
    async fn claimed_keys_create_sessions() {
        let (manager, mut bob) = manager_with_bob_device().await;

        let mut one_time_keys = crate::types::UsersDevicesMap::new();
        bob.generate_one_time_keys_if_needed();
        one_time_keys.insert(bob.user_id(), bob.device_id(), bob.signed_one_time_keys());
        bob.mark_keys_as_published();

        manager.receive_keys_claim_response(&one_time_keys).await.unwrap();

        let missing = manager
            .get_missing_sessions([user_id!("@bob:localhost")].into_iter())
            .await
            .unwrap();
        assert!(missing.is_empty());
    }
}
