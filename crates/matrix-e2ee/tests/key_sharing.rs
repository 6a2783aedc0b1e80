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

//! End-to-end scenarios: several `OlmMachine`s talking to each other
//! through an in-memory homeserver.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use assert_matches::assert_matches;
use async_trait::async_trait;
use matrix_e2ee::{
    store::RoomSettings,
    transport::{
        CryptoTransport, KeysBackupRequest, KeysBackupResponse, KeysClaimRequest,
        KeysClaimResponse, KeysQueryRequest, KeysQueryResponse, KeysUploadRequest,
        KeysUploadResponse, RoomKeyBackup, ToDeviceRequest, TransportError,
    },
    types::{
        events::{
            encrypted::{EncryptedEvent, ToDeviceEncryptedEventContent},
            room_key_request::RoomKeyRequestContent,
            ToDeviceEvent,
        },
        DeviceKeys, EventEncryptionAlgorithm, SignedOneTimeKey, UsersDevicesMap,
    },
    LocalTrust, MegolmError, OlmError, OlmMachine,
};
use ruma::{
    device_id, room_id, user_id, DeviceId, OwnedDeviceId, OwnedRoomId, OwnedUserId, UserId,
};
use serde_json::{json, Value};

/// The server side of the tests: stores uploaded keys, routes to-device
/// messages, holds backups.
#[derive(Debug, Default)]
struct MockServer {
    state: Mutex<ServerState>,
}

#[derive(Debug, Default)]
struct ServerState {
    device_keys: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, DeviceKeys>>,
    one_time_keys:
        BTreeMap<(OwnedUserId, OwnedDeviceId), BTreeMap<String, SignedOneTimeKey>>,
    to_device: BTreeMap<(OwnedUserId, OwnedDeviceId), Vec<(String, OwnedUserId, Value)>>,
    backups: BTreeMap<String, BTreeMap<OwnedRoomId, RoomKeyBackup>>,
}

impl MockServer {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn one_time_key_count(&self, user_id: &UserId, device_id: &DeviceId) -> usize {
        self.state
            .lock()
            .unwrap()
            .one_time_keys
            .get(&(user_id.to_owned(), device_id.to_owned()))
            .map(BTreeMap::len)
            .unwrap_or_default()
    }

    /// Drain the to-device inbox of the given device.
    fn take_to_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Vec<(String, OwnedUserId, Value)> {
        self.state
            .lock()
            .unwrap()
            .to_device
            .remove(&(user_id.to_owned(), device_id.to_owned()))
            .unwrap_or_default()
    }
}

/// One authenticated connection to the mock server.
#[derive(Debug)]
struct Client {
    server: Arc<MockServer>,
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
}

#[async_trait]
impl CryptoTransport for Client {
    async fn upload_keys(
        &self,
        request: KeysUploadRequest,
    ) -> Result<KeysUploadResponse, TransportError> {
        let mut state = self.server.state.lock().unwrap();

        if let Some(device_keys) = request.device_keys {
            state
                .device_keys
                .entry(self.user_id.clone())
                .or_default()
                .insert(self.device_id.clone(), device_keys);
        }

        let keys = state
            .one_time_keys
            .entry((self.user_id.clone(), self.device_id.clone()))
            .or_default();

        // Keyed by key id, so uploading the same batch twice can't double
        // count.
        for (key_id, key) in request.one_time_keys {
            keys.insert(key_id, key);
        }

        let mut counts = BTreeMap::new();
        counts.insert("signed_curve25519".to_owned(), keys.len() as u64);

        Ok(KeysUploadResponse { one_time_key_counts: counts })
    }

    async fn query_keys(
        &self,
        request: KeysQueryRequest,
    ) -> Result<KeysQueryResponse, TransportError> {
        let state = self.server.state.lock().unwrap();
        let mut device_keys = UsersDevicesMap::new();

        for user_id in request.users {
            if let Some(devices) = state.device_keys.get(&user_id) {
                for (device_id, keys) in devices {
                    device_keys.insert(&user_id, device_id, keys.clone());
                }
            }
        }

        Ok(KeysQueryResponse { device_keys, failures: BTreeMap::new() })
    }

    async fn claim_keys(
        &self,
        request: KeysClaimRequest,
    ) -> Result<KeysClaimResponse, TransportError> {
        let mut state = self.server.state.lock().unwrap();
        let mut claimed = UsersDevicesMap::new();

        for (user_id, device_id, _algorithm) in request.one_time_keys.iter() {
            let Some(keys) =
                state.one_time_keys.get_mut(&(user_id.to_owned(), device_id.to_owned()))
            else {
                continue;
            };

            // Hand out each key exactly once.
            let Some(key_id) = keys.keys().next().cloned() else {
                continue;
            };
            let key = keys.remove(&key_id).unwrap();

            let mut key_map = BTreeMap::new();
            key_map.insert(key_id, key);
            claimed.insert(user_id, device_id, key_map);
        }

        Ok(KeysClaimResponse { one_time_keys: claimed, failures: BTreeMap::new() })
    }

    async fn send_to_device(&self, request: ToDeviceRequest) -> Result<(), TransportError> {
        let mut state = self.server.state.lock().unwrap();

        for (user_id, device_id, content) in request.messages.iter() {
            let recipients: Vec<OwnedDeviceId> = if device_id.as_str() == "*" {
                state
                    .device_keys
                    .get(user_id)
                    .map(|d| d.keys().cloned().collect())
                    .unwrap_or_default()
            } else {
                vec![device_id.to_owned()]
            };

            for device_id in recipients {
                state
                    .to_device
                    .entry((user_id.to_owned(), device_id))
                    .or_default()
                    .push((
                        request.event_type.clone(),
                        self.user_id.clone(),
                        content.clone(),
                    ));
            }
        }

        Ok(())
    }

    async fn upload_backup(&self, request: KeysBackupRequest) -> Result<(), TransportError> {
        let mut state = self.server.state.lock().unwrap();
        let backup = state.backups.entry(request.version).or_default();

        for (room_id, room_backup) in request.rooms {
            backup
                .entry(room_id)
                .or_default()
                .sessions
                .extend(room_backup.sessions);
        }

        Ok(())
    }

    async fn download_backup(
        &self,
        version: &str,
    ) -> Result<KeysBackupResponse, TransportError> {
        let state = self.server.state.lock().unwrap();

        Ok(KeysBackupResponse {
            rooms: state.backups.get(version).cloned().unwrap_or_default(),
        })
    }
}

async fn login(
    server: &Arc<MockServer>,
    user_id: &UserId,
    device_id: &DeviceId,
) -> OlmMachine {
    let client = Client {
        server: server.clone(),
        user_id: user_id.to_owned(),
        device_id: device_id.to_owned(),
    };

    let machine = OlmMachine::new(user_id, device_id, Arc::new(client)).await;
    machine.upload_keys().await.unwrap();

    machine
}

/// Deliver every pending to-device message to the given machine.
async fn sync_to_device(server: &Arc<MockServer>, machine: &OlmMachine) {
    for (event_type, sender, content) in
        server.take_to_device(machine.user_id(), machine.device_id())
    {
        match event_type.as_str() {
            "m.room.encrypted" => {
                let content: ToDeviceEncryptedEventContent =
                    serde_json::from_value(content).unwrap();
                machine
                    .receive_encrypted_to_device_event(&ToDeviceEvent::new(sender, content))
                    .await
                    .unwrap();
            }
            "m.room_key_request" => {
                let content: RoomKeyRequestContent = serde_json::from_value(content).unwrap();
                machine.receive_room_key_request(&ToDeviceEvent::new(sender, content));
            }
            other => panic!("unexpected to-device event type {other}"),
        }
    }
}

#[tokio::test]
async fn uploaded_device_keys_are_returned_by_a_query() {
    let server = MockServer::new();
    let bob = login(&server, user_id!("@bob:localhost"), device_id!("BOBDEVICE")).await;

    let alice = login(&server, user_id!("@alice:localhost"), device_id!("ALICEDEVICE")).await;
    alice.update_tracked_users([bob.user_id()].into_iter()).await.unwrap();
    alice.download_device_keys().await.unwrap();

    let devices = alice.get_user_devices(bob.user_id()).await.unwrap();
    assert_eq!(devices.len(), 1);

    let device = devices.get(device_id!("BOBDEVICE")).unwrap();
    assert_eq!(device.ed25519_key(), Some(bob.identity_keys().await.ed25519));
    assert_eq!(device.curve25519_key(), Some(bob.identity_keys().await.curve25519));
}

#[tokio::test]
async fn one_time_keys_are_claimed_at_most_once() {
    let server = MockServer::new();
    let bob = login(&server, user_id!("@bob:localhost"), device_id!("BOBDEVICE")).await;

    let uploaded = server.one_time_key_count(bob.user_id(), bob.device_id());
    assert!(uploaded >= 2, "a fresh login should upload a batch of one-time keys");

    // Re-uploading doesn't duplicate anything: the server counts by key id.
    bob.upload_keys().await.unwrap();
    assert_eq!(server.one_time_key_count(bob.user_id(), bob.device_id()), uploaded);

    let alice = login(&server, user_id!("@alice:localhost"), device_id!("ALICEDEVICE")).await;
    alice.update_tracked_users([bob.user_id()].into_iter()).await.unwrap();
    alice.download_device_keys().await.unwrap();

    alice.ensure_sessions(&[bob.user_id().to_owned()]).await.unwrap();

    // Exactly one key was consumed.
    assert_eq!(server.one_time_key_count(bob.user_id(), bob.device_id()), uploaded - 1);
}

#[tokio::test]
async fn room_key_share_and_message_round_trip() {
    let server = MockServer::new();
    let room_id = room_id!("!room:localhost");

    let alice = login(&server, user_id!("@alice:localhost"), device_id!("ALICEDEVICE")).await;
    let bob = login(&server, user_id!("@bob:localhost"), device_id!("BOBDEVICE")).await;

    let members = vec![alice.user_id().to_owned(), bob.user_id().to_owned()];

    alice
        .set_room_settings(room_id, RoomSettings::new(EventEncryptionAlgorithm::MegolmV1AesSha2))
        .await
        .unwrap();
    alice.share_room_key(room_id, &members).await.unwrap();

    let encrypted = alice
        .encrypt_room_event(room_id, &members, "m.room.message", json!({ "body": "It's a secret to everybody" }))
        .await
        .unwrap();

    let event = EncryptedEvent { sender: alice.user_id().to_owned(), content: encrypted };

    // Before the room key arrives the event is undecryptable, and a key
    // request gets queued.
    let error = bob.decrypt_room_event(&event, room_id).await.unwrap_err();
    assert_matches!(error, MegolmError::MissingRoomKey);

    sync_to_device(&server, &bob).await;

    let decrypted = bob.decrypt_room_event(&event, room_id).await.unwrap();
    assert_eq!(decrypted.sender, alice.user_id());
    assert_eq!(decrypted.clear_event["type"], "m.room.message");
    assert_eq!(decrypted.clear_event["content"]["body"], "It's a secret to everybody");
    assert_eq!(decrypted.sender_curve25519_key, alice.identity_keys().await.curve25519);
    assert_eq!(
        decrypted.claimed_ed25519_key,
        Some(alice.identity_keys().await.ed25519)
    );

    // Decrypting historical messages again is idempotent for readers.
    let again = bob.decrypt_room_event(&event, room_id).await.unwrap();
    assert_eq!(again.clear_event, decrypted.clear_event);
}

#[tokio::test]
async fn replayed_prekey_messages_are_rejected() {
    let server = MockServer::new();
    let room_id = room_id!("!room:localhost");

    let alice = login(&server, user_id!("@alice:localhost"), device_id!("ALICEDEVICE")).await;
    let bob = login(&server, user_id!("@bob:localhost"), device_id!("BOBDEVICE")).await;

    let members = vec![alice.user_id().to_owned(), bob.user_id().to_owned()];

    alice
        .set_room_settings(room_id, RoomSettings::new(EventEncryptionAlgorithm::MegolmV1AesSha2))
        .await
        .unwrap();
    alice.share_room_key(room_id, &members).await.unwrap();

    // Capture the raw encrypted room key event instead of syncing it in.
    let mut inbox = server.take_to_device(bob.user_id(), bob.device_id());
    assert_eq!(inbox.len(), 1);
    let (event_type, sender, content) = inbox.remove(0);
    assert_eq!(event_type, "m.room.encrypted");

    let content: ToDeviceEncryptedEventContent = serde_json::from_value(content).unwrap();
    let event = ToDeviceEvent::new(sender, content);

    // The first delivery creates exactly one fresh inbound session and
    // decrypts.
    bob.receive_encrypted_to_device_event(&event).await.unwrap();

    // A replay of the identical ciphertext is detected as such; it neither
    // decrypts nor corrupts the session that the original delivery created.
    let error = bob.receive_encrypted_to_device_event(&event).await.unwrap_err();
    assert_matches!(error, OlmError::ReplayedMessage(..));
}

#[tokio::test]
async fn events_replayed_into_another_room_fail_to_decrypt() {
    let server = MockServer::new();
    let room_id = room_id!("!room:localhost");
    let other_room = room_id!("!other:localhost");

    let alice = login(&server, user_id!("@alice:localhost"), device_id!("ALICEDEVICE")).await;
    let bob = login(&server, user_id!("@bob:localhost"), device_id!("BOBDEVICE")).await;

    let members = vec![alice.user_id().to_owned(), bob.user_id().to_owned()];

    alice
        .set_room_settings(room_id, RoomSettings::new(EventEncryptionAlgorithm::MegolmV1AesSha2))
        .await
        .unwrap();
    alice.share_room_key(room_id, &members).await.unwrap();

    let encrypted = alice
        .encrypt_room_event(room_id, &members, "m.room.message", json!({ "body": "hello" }))
        .await
        .unwrap();
    let event = EncryptedEvent { sender: alice.user_id().to_owned(), content: encrypted };

    sync_to_device(&server, &bob).await;

    // The same ciphertext claimed to belong to another room must never
    // decrypt, no matter what the attacker does to the unprotected outer
    // fields.
    let error = bob.decrypt_room_event(&event, other_room).await.unwrap_err();
    assert_matches!(error, MegolmError::MissingRoomKey | MegolmError::Event(_));

    // And the legitimate room still works.
    bob.decrypt_room_event(&event, room_id).await.unwrap();
}

#[tokio::test]
async fn sessions_rotate_after_the_configured_message_count() {
    let server = MockServer::new();
    let room_id = room_id!("!room:localhost");

    let alice = login(&server, user_id!("@alice:localhost"), device_id!("ALICEDEVICE")).await;
    let bob = login(&server, user_id!("@bob:localhost"), device_id!("BOBDEVICE")).await;

    let members = vec![alice.user_id().to_owned(), bob.user_id().to_owned()];

    let mut settings = RoomSettings::new(EventEncryptionAlgorithm::MegolmV1AesSha2);
    settings.rotation_period_msgs = Some(1);
    alice.set_room_settings(room_id, settings).await.unwrap();

    alice.share_room_key(room_id, &members).await.unwrap();
    let first = alice
        .encrypt_room_event(room_id, &members, "m.room.message", json!({ "body": "one" }))
        .await
        .unwrap();

    // The single allowed message was sent; encrypting again without a fresh
    // share must fail...
    let error = alice
        .encrypt_room_event(room_id, &members, "m.room.message", json!({ "body": "two" }))
        .await
        .unwrap_err();
    assert_matches!(error, MegolmError::SessionNotShared(_));

    // ...and a fresh share rotates to a session with a new id.
    alice.share_room_key(room_id, &members).await.unwrap();
    let second = alice
        .encrypt_room_event(room_id, &members, "m.room.message", json!({ "body": "two" }))
        .await
        .unwrap();

    let first_id = session_id_of(&first);
    let second_id = session_id_of(&second);
    assert_ne!(first_id, second_id);

    fn session_id_of(
        content: &matrix_e2ee::types::events::encrypted::RoomEncryptedEventContent,
    ) -> String {
        let json = serde_json::to_value(content).unwrap();
        json["session_id"].as_str().unwrap().to_owned()
    }
}

#[tokio::test]
async fn a_verified_own_device_is_served_a_requested_room_key() {
    let server = MockServer::new();
    let room_id = room_id!("!room:localhost");

    let alice_id = user_id!("@alice:localhost");
    let first = login(&server, alice_id, device_id!("FIRSTDEVICE")).await;
    let second = login(&server, alice_id, device_id!("SECONDDEVICE")).await;
    let bob = login(&server, user_id!("@bob:localhost"), device_id!("BOBDEVICE")).await;

    let members = vec![alice_id.to_owned(), bob.user_id().to_owned()];

    // Bob encrypts a message; only the first device was around to receive
    // the room key.
    bob.set_room_settings(room_id, RoomSettings::new(EventEncryptionAlgorithm::MegolmV1AesSha2))
        .await
        .unwrap();
    bob.share_room_key(room_id, &members).await.unwrap();
    let encrypted = bob
        .encrypt_room_event(room_id, &members, "m.room.message", json!({ "body": "psst" }))
        .await
        .unwrap();
    let event = EncryptedEvent { sender: bob.user_id().to_owned(), content: encrypted };

    sync_to_device(&server, &first).await;
    first.decrypt_room_event(&event, room_id).await.unwrap();

    // The second device logged in too late: no room key, so it asks its
    // sibling devices for it.
    // Drop the copy that was addressed to it, simulating the late login.
    server.take_to_device(alice_id, device_id!("SECONDDEVICE"));

    let error = second.decrypt_room_event(&event, room_id).await.unwrap_err();
    assert_matches!(error, MegolmError::MissingRoomKey);
    second.send_outgoing_key_requests().await.unwrap();

    // The first device only serves devices it verified, and needs an Olm
    // channel to answer through.
    first.update_tracked_users([alice_id].into_iter()).await.unwrap();
    first.download_device_keys().await.unwrap();
    first
        .set_device_trust(alice_id, device_id!("SECONDDEVICE"), LocalTrust::Verified)
        .await
        .unwrap();
    first.ensure_sessions(&[alice_id.to_owned()]).await.unwrap();

    sync_to_device(&server, &first).await;
    first.process_key_requests().await.unwrap();

    sync_to_device(&server, &second).await;

    let decrypted = second.decrypt_room_event(&event, room_id).await.unwrap();
    assert_eq!(decrypted.clear_event["content"]["body"], "psst");

    // The forwarded key travelled through the first device, and that is
    // visible in the forwarding chain.
    assert_eq!(decrypted.forwarding_curve25519_key_chain.len(), 1);
    assert_eq!(
        decrypted.forwarding_curve25519_key_chain[0],
        first.identity_keys().await.curve25519.to_base64()
    );
}

#[tokio::test]
async fn backed_up_room_keys_can_be_restored_on_a_new_device() {
    let server = MockServer::new();
    let room_id = room_id!("!room:localhost");

    let alice = login(&server, user_id!("@alice:localhost"), device_id!("ALICEDEVICE")).await;
    let bob = login(&server, user_id!("@bob:localhost"), device_id!("BOBDEVICE")).await;

    let members = vec![alice.user_id().to_owned(), bob.user_id().to_owned()];

    alice
        .set_room_settings(room_id, RoomSettings::new(EventEncryptionAlgorithm::MegolmV1AesSha2))
        .await
        .unwrap();
    alice.share_room_key(room_id, &members).await.unwrap();
    let encrypted = alice
        .encrypt_room_event(room_id, &members, "m.room.message", json!({ "body": "remember me" }))
        .await
        .unwrap();
    let event = EncryptedEvent { sender: alice.user_id().to_owned(), content: encrypted };

    sync_to_device(&server, &bob).await;

    // Bob backs up his room keys.
    let recovery_key = matrix_e2ee::RecoveryKey::new();
    let backup_key = recovery_key.megolm_v1_public_key();
    backup_key.set_version("1".to_owned());

    bob.backup_machine().enable_backup_v1(backup_key).await.unwrap();
    let uploaded = bob.backup_machine().backup().await.unwrap();
    assert!(uploaded >= 1);

    // A fresh device of Bob's restores them with the recovery key.
    let bob2 = login(&server, user_id!("@bob:localhost"), device_id!("SECONDDEVICE")).await;
    let imported = bob2.backup_machine().restore("1", &recovery_key).await.unwrap();
    assert!(imported >= 1);

    let decrypted = bob2.decrypt_room_event(&event, room_id).await.unwrap();
    assert_eq!(decrypted.clear_event["content"]["body"], "remember me");
}
