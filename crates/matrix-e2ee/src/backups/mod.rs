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

//! Server-side backup of room keys, using the
//! `m.megolm_backup.v1.curve25519-aes-sha2` algorithm.

mod keys;

use std::{collections::BTreeMap, sync::Arc};

use ruma::OwnedRoomId;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub use keys::{DecodeError, DecryptionError, MegolmV1BackupKey, RecoveryKey};

use crate::{
    olm::InboundGroupSession,
    store::{Changes, CryptoStoreError, RoomKeyCounts, Store},
    transport::{CryptoTransport, KeysBackupRequest, RoomKeyBackup, TransportError},
};

/// The number of room keys one backup request carries at most, to bound the
/// request size.
const BACKUP_BATCH_LIMIT: usize = 100;

/// The error type for backup operations.
#[derive(Debug, Error)]
pub enum BackupError {
    /// Backups haven't been enabled, or the enabled key has no version.
    #[error("the backup isn't enabled")]
    Disabled,

    /// A backup key without an attached version can't be used to upload.
    #[error("the backup key has no backup version attached")]
    MissingVersion,

    /// The storage layer failed.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),

    /// The network collaborator failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A room key couldn't be (de)serialized.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// A state machine that uploads not-yet-backed-up room keys to the
/// server-side backup, and restores them from it.
#[derive(Debug, Clone)]
pub struct BackupMachine {
    store: Store,
    transport: Arc<dyn CryptoTransport>,
    backup_key: Arc<RwLock<Option<MegolmV1BackupKey>>>,
}

impl BackupMachine {
    pub(crate) fn new(store: Store, transport: Arc<dyn CryptoTransport>) -> Self {
        Self { store, transport, backup_key: Arc::new(RwLock::new(None)) }
    }

    /// Activate the backup with the given key.
    ///
    /// The key must carry the backup version it belongs to. Switching from a
    /// previously enabled version clears the backed-up markers of every
    /// session, so everything gets re-uploaded under the new version.
    pub async fn enable_backup_v1(&self, key: MegolmV1BackupKey) -> Result<(), BackupError> {
        let Some(version) = key.backup_version() else {
            return Err(BackupError::MissingVersion);
        };

        let previous_version = self.store.load_backup_version().await?;

        if previous_version.as_deref() != Some(version.as_str()) {
            if previous_version.is_some() {
                debug!(version, "The backup version changed, resetting the backup markers");
                self.store.reset_backup_state().await?;
            }

            self.store
                .save_changes(Changes { backup_version: Some(version.clone()), ..Default::default() })
                .await?;
        }

        info!(version, "Activated the room key backup");
        *self.backup_key.write().await = Some(key);

        Ok(())
    }

    /// Deactivate the backup.
    pub async fn disable_backup(&self) {
        *self.backup_key.write().await = None;
    }

    /// Is a backup currently activated.
    pub async fn enabled(&self) -> bool {
        self.backup_key.read().await.is_some()
    }

    /// How many room keys we hold, and how many of them made it into the
    /// backup.
    pub async fn room_key_counts(&self) -> Result<RoomKeyCounts, CryptoStoreError> {
        self.store.inbound_group_session_counts().await
    }

    /// Clear the backed-up flag of every session, process-wide.
    pub async fn reset_backup_markers(&self) -> Result<(), CryptoStoreError> {
        self.store.reset_backup_state().await
    }

    /// Encrypt and upload one batch of not-yet-backed-up room keys.
    ///
    /// Sessions are marked as backed up only after the upload succeeded.
    /// Returns the number of uploaded keys; call repeatedly until it
    /// returns zero to drain the backlog.
    pub async fn backup(&self) -> Result<usize, BackupError> {
        let Some(backup_key) = self.backup_key.read().await.clone() else {
            return Err(BackupError::Disabled);
        };
        let Some(version) = backup_key.backup_version() else {
            return Err(BackupError::MissingVersion);
        };

        let sessions =
            self.store.inbound_group_sessions_for_backup(BACKUP_BATCH_LIMIT).await?;

        if sessions.is_empty() {
            return Ok(0);
        }

        let mut rooms: BTreeMap<OwnedRoomId, RoomKeyBackup> = BTreeMap::new();

        for session in &sessions {
            let data = backup_key.encrypt(session).await;

            rooms
                .entry(session.room_id().to_owned())
                .or_default()
                .sessions
                .insert(session.session_id().to_owned(), data);
        }

        let count = sessions.len();
        debug!(count, version, "Uploading a batch of room keys to the backup");

        self.transport.upload_backup(KeysBackupRequest { version, rooms }).await?;

        let backed_up: Vec<_> =
            sessions.iter().map(|s| (s.room_id(), s.session_id())).collect();
        self.store.mark_inbound_group_sessions_as_backed_up(&backed_up).await?;

        Ok(count)
    }

    /// Download the given backup version and import every room key the
    /// recovery key can decrypt.
    ///
    /// An imported session never replaces a local session that already
    /// decrypts more than the imported copy would. Returns the number of
    /// newly usable sessions.
    pub async fn restore(
        &self,
        version: &str,
        recovery_key: &RecoveryKey,
    ) -> Result<usize, BackupError> {
        let response = self.transport.download_backup(version).await?;

        let mut sessions = Vec::new();

        for (room_id, backup) in response.rooms {
            for (session_id, data) in backup.sessions {
                let key = match recovery_key.decrypt_session_data(&data.session_data) {
                    Ok(key) => key,
                    Err(e) => {
                        warn!(
                            ?room_id,
                            session_id,
                            error = ?e,
                            "Couldn't decrypt an entry of the downloaded key backup",
                        );
                        continue;
                    }
                };

                match InboundGroupSession::from_backed_up_key(&room_id, &key) {
                    Ok(session) => sessions.push(session),
                    Err(e) => {
                        warn!(
                            ?room_id,
                            session_id,
                            error = ?e,
                            "A downloaded backup entry didn't contain a valid session",
                        );
                    }
                }
            }
        }

        let imported = self.store.import_inbound_group_sessions(sessions).await?;

        info!(version, imported, "Restored room keys from the backup");

        Ok(imported)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ruma::{device_id, room_id, user_id};

    use super::{BackupMachine, RecoveryKey};
    use crate::{
        olm::{Account, InboundGroupSession},
        store::{MemoryStore, Store},
        transport::{
            CryptoTransport, KeysBackupRequest, KeysBackupResponse, KeysClaimRequest,
            KeysClaimResponse, KeysQueryRequest, KeysQueryResponse, KeysUploadRequest,
            KeysUploadResponse, ToDeviceRequest, TransportError,
        },
    };

    #[derive(Debug)]
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

        async fn download_backup(&self, _: &str) -> Result<KeysBackupResponse, TransportError> {
            Ok(KeysBackupResponse::default())
        }
    }

    async fn machine_with_session() -> (BackupMachine, InboundGroupSession) {
        let account = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let identity_keys = account.identity_keys();

        let outbound = vodozemac::megolm::GroupSession::new(
            vodozemac::megolm::SessionConfig::version_1(),
        );
        let session = InboundGroupSession::new(
            identity_keys.curve25519,
            identity_keys.ed25519,
            room_id!("!room:localhost"),
            &outbound.session_key(),
        );

        let store = Store::new(Arc::new(MemoryStore::new()));
        store.save_inbound_group_sessions(vec![session.clone()]).await.unwrap();

        (BackupMachine::new(store, Arc::new(DeadTransport)), session)
    }

    #[tokio::test]
    async fn encrypt_and_decrypt_a_room_key() {
        let (_, session) = machine_with_session().await;

        let recovery_key = RecoveryKey::new();
        let backup_key = recovery_key.megolm_v1_public_key();

        let data = backup_key.encrypt(&session).await;
        let decrypted = recovery_key
            .decrypt_session_data(&data.session_data)
            .expect("the recovery key should decrypt what its public key encrypted");

        assert_eq!(decrypted.sender_key, session.sender_key());

        let restored =
            InboundGroupSession::from_backed_up_key(session.room_id(), &decrypted).unwrap();
        assert_eq!(restored.session_id(), session.session_id());
        assert!(restored.backed_up());
    }

    #[tokio::test]
    async fn counts_track_the_backed_up_flag() {
        let (machine, session) = machine_with_session().await;

        let counts = machine.room_key_counts().await.unwrap();
        assert_eq!(counts.total, 1);
        assert_eq!(counts.backed_up, 0);

        session.mark_as_backed_up();
        let counts = machine.room_key_counts().await.unwrap();
        assert_eq!(counts.backed_up, 1);

        machine.reset_backup_markers().await.unwrap();
        let counts = machine.room_key_counts().await.unwrap();
        assert_eq!(counts.backed_up, 0);
    }
}
