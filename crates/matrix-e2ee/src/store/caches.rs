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

//! Small in-memory stores for the Olm objects, shared by the memory store
//! and usable as caches by persistent store implementations.

use std::{collections::HashMap, sync::Arc};

use dashmap::DashMap;
use ruma::{OwnedDeviceId, OwnedRoomId, OwnedUserId, DeviceId, RoomId, UserId};
use tokio::sync::Mutex;

use crate::{
    identities::{DeviceData, UserDevices},
    olm::{InboundGroupSession, Session},
};

/// In-memory store for Olm sessions, sharded by the peer's curve25519 key.
///
/// All sessions for one peer hide behind a single lock; ratchet mutation of
/// any of them is serialized with session-list changes that way.
#[derive(Clone, Debug, Default)]
pub struct SessionStore {
    entries: Arc<DashMap<String, Arc<Mutex<Vec<Session>>>>>,
}

impl SessionStore {
    /// Create a new empty session store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session to the store, unless an equal one is already present.
    pub async fn add(&self, session: Session) {
        let sessions_lock =
            self.entries.entry(session.sender_key().to_base64()).or_default().clone();

        let mut sessions = sessions_lock.lock().await;

        if !sessions.contains(&session) {
            sessions.push(session);
        }
    }

    /// Get all the sessions we share with the given peer.
    pub fn get(&self, sender_key: &str) -> Option<Arc<Mutex<Vec<Session>>>> {
        self.entries.get(sender_key).map(|s| s.clone())
    }
}

/// In-memory store for inbound group sessions, keyed by room, sender key and
/// session id.
#[derive(Clone, Debug, Default)]
pub struct GroupSessionStore {
    #[allow(clippy::type_complexity)]
    entries: Arc<DashMap<OwnedRoomId, HashMap<String, HashMap<String, InboundGroupSession>>>>,
}

impl GroupSessionStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an inbound group session to the store.
    ///
    /// Returns false if the very same session was already present.
    pub fn add(&self, session: InboundGroupSession) -> bool {
        self.entries
            .entry(session.room_id().to_owned())
            .or_default()
            .entry(session.sender_key().to_base64())
            .or_default()
            .insert(session.session_id().to_owned(), session)
            .is_none()
    }

    /// Get the session for the given room, sender and session id.
    pub fn get(
        &self,
        room_id: &RoomId,
        sender_key: &str,
        session_id: &str,
    ) -> Option<InboundGroupSession> {
        self.entries
            .get(room_id)
            .and_then(|m| m.get(sender_key).and_then(|m| m.get(session_id).cloned()))
    }

    /// Get all the group sessions the store knows about.
    pub fn get_all(&self) -> Vec<InboundGroupSession> {
        self.entries
            .iter()
            .flat_map(|d| {
                d.value()
                    .values()
                    .flat_map(|m| m.values().cloned().collect::<Vec<_>>())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// The number of sessions in the store.
    pub fn count(&self) -> usize {
        self.entries.iter().map(|d| d.value().values().map(|m| m.len()).sum::<usize>()).sum()
    }
}

/// In-memory store holding the devices of users.
#[derive(Clone, Debug, Default)]
pub struct DeviceStore {
    entries: Arc<DashMap<OwnedUserId, DashMap<OwnedDeviceId, DeviceData>>>,
}

impl DeviceStore {
    /// Create a new empty device store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device to the store.
    ///
    /// Returns true if the device was not yet in the store.
    pub fn add(&self, device: DeviceData) -> bool {
        let user_id = device.user_id().to_owned();
        self.entries
            .entry(user_id)
            .or_default()
            .insert(device.device_id().to_owned(), device)
            .is_none()
    }

    /// Get the device with the given id belonging to the given user.
    pub fn get(&self, user_id: &UserId, device_id: &DeviceId) -> Option<DeviceData> {
        self.entries.get(user_id).and_then(|m| m.get(device_id).map(|d| d.value().clone()))
    }

    /// Remove the device with the given id belonging to the given user.
    pub fn remove(&self, user_id: &UserId, device_id: &DeviceId) -> Option<DeviceData> {
        self.entries.get(user_id).and_then(|m| m.remove(device_id)).map(|(_, d)| d)
    }

    /// Get a view over all devices of the given user.
    pub fn user_devices(&self, user_id: &UserId) -> UserDevices {
        UserDevices {
            entries: self
                .entries
                .get(user_id)
                .map(|m| m.iter().map(|i| (i.key().to_owned(), i.value().clone())).collect())
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        identities::device::testing::get_device,
        store::caches::DeviceStore,
    };

    #[test]
    fn device_store_round_trip() {
        let device = get_device();
        let store = DeviceStore::new();

        assert!(store.add(device.clone()));
        assert!(!store.add(device.clone()));

        let loaded = store.get(device.user_id(), device.device_id()).unwrap();
        assert_eq!(loaded, device);

        let user_devices = store.user_devices(device.user_id());
        assert_eq!(user_devices.len(), 1);

        store.remove(device.user_id(), device.device_id());
        assert!(store.get(device.user_id(), device.device_id()).is_none());
    }
}
