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
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering::SeqCst},
        Arc,
    },
};

use ruma::{OwnedRoomId, RoomId};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use vodozemac::{
    megolm::{
        DecryptedMessage, DecryptionError, InboundGroupSessionPickle, MegolmMessage,
        SessionConfig, SessionKey, SessionOrdering,
    },
    Curve25519PublicKey, Ed25519PublicKey, PickleError,
};

use super::{BackedUpRoomKey, ExportedRoomKey, SenderClaimedKeys};
use crate::{
    error::SessionCreationError,
    types::{
        deserialize_curve_key, serialize_curve_key,
        events::{forwarded_room_key::ForwardedRoomKeyContent, room_key::RoomKeyContent},
        EventEncryptionAlgorithm,
    },
};

/// A Megolm session used to decrypt the messages of one sender in one room,
/// also known as a room key.
///
/// The session is bound to the room it was created for and to the curve25519
/// key of its creator; an event that doesn't match both bindings is never
/// decrypted with it.
#[derive(Clone)]
pub struct InboundGroupSession {
    inner: Arc<Mutex<vodozemac::megolm::InboundGroupSession>>,
    session_id: Arc<str>,
    first_known_index: u32,

    /// The curve25519 key of the device that created the session.
    ///
    /// Proven by the Olm channel for sessions received in an `m.room_key`
    /// event, merely claimed for forwarded and imported ones.
    pub(crate) sender_key: Curve25519PublicKey,

    /// The signing keys the creator of the session claims to own.
    pub(crate) sender_claimed_keys: Arc<SenderClaimedKeys>,

    /// The room this session is scoped to.
    pub(crate) room_id: OwnedRoomId,

    /// The chain of curve25519 keys the session travelled through if it
    /// arrived via key forwarding; empty for sessions we got directly.
    pub(crate) forwarding_key_chain: Arc<[String]>,

    /// True if the session arrived via forwarding, file import or backup
    /// restore, in which case its creator info is unproven.
    imported: bool,

    algorithm: EventEncryptionAlgorithm,

    /// Was this session already uploaded to the server-side key backup.
    backed_up: Arc<AtomicBool>,
}

impl InboundGroupSession {
    /// Create a new session from the session key of the matching outbound
    /// session or of an `m.room_key` event.
    pub fn new(
        sender_key: Curve25519PublicKey,
        signing_key: Ed25519PublicKey,
        room_id: &RoomId,
        session_key: &SessionKey,
    ) -> Self {
        let session =
            vodozemac::megolm::InboundGroupSession::new(session_key, SessionConfig::version_1());
        let session_id = session.session_id();
        let first_known_index = session.first_known_index();

        InboundGroupSession {
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            first_known_index,
            sender_key,
            sender_claimed_keys: Arc::new(SenderClaimedKeys { ed25519: signing_key }),
            room_id: room_id.to_owned(),
            forwarding_key_chain: Vec::new().into(),
            imported: false,
            algorithm: EventEncryptionAlgorithm::MegolmV1AesSha2,
            backed_up: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Create a new session from the content of an `m.room_key` event that
    /// was received over a verified Olm channel.
    ///
    /// `sender_key` and `signing_key` must come from the Olm envelope, not
    /// from the content.
    pub fn from_room_key_content(
        sender_key: Curve25519PublicKey,
        signing_key: Ed25519PublicKey,
        content: &RoomKeyContent,
    ) -> Result<Self, SessionCreationError> {
        match content.algorithm {
            EventEncryptionAlgorithm::MegolmV1AesSha2 => {
                Ok(Self::new(sender_key, signing_key, &content.room_id, &content.session_key))
            }
            ref algorithm => Err(SessionCreationError::Algorithm(algorithm.clone())),
        }
    }

    /// Create a session from the content of an `m.forwarded_room_key` event.
    ///
    /// The key of the device that forwarded the session to us is appended to
    /// the forwarding chain.
    pub fn from_forwarded_key(
        forwarder_key: Curve25519PublicKey,
        content: &ForwardedRoomKeyContent,
    ) -> Result<Self, SessionCreationError> {
        if content.algorithm != EventEncryptionAlgorithm::MegolmV1AesSha2 {
            return Err(SessionCreationError::Algorithm(content.algorithm.clone()));
        }

        let session = vodozemac::megolm::InboundGroupSession::import(
            &content.session_key,
            SessionConfig::version_1(),
        );
        let session_id = session.session_id();
        let first_known_index = session.first_known_index();

        let mut forwarding_key_chain = content.forwarding_curve25519_key_chain.clone();
        forwarding_key_chain.push(forwarder_key.to_base64());

        Ok(InboundGroupSession {
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            first_known_index,
            sender_key: content.sender_key,
            sender_claimed_keys: Arc::new(SenderClaimedKeys {
                ed25519: content.sender_claimed_ed25519_key,
            }),
            room_id: content.room_id.clone(),
            forwarding_key_chain: forwarding_key_chain.into(),
            imported: true,
            algorithm: content.algorithm.clone(),
            backed_up: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Create a session from a previously exported one.
    pub fn from_export(exported: &ExportedRoomKey) -> Result<Self, SessionCreationError> {
        if exported.algorithm != EventEncryptionAlgorithm::MegolmV1AesSha2 {
            return Err(SessionCreationError::Algorithm(exported.algorithm.clone()));
        }

        let session = vodozemac::megolm::InboundGroupSession::import(
            &exported.session_key,
            SessionConfig::version_1(),
        );
        let session_id = session.session_id();
        let first_known_index = session.first_known_index();

        Ok(InboundGroupSession {
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            first_known_index,
            sender_key: exported.sender_key,
            sender_claimed_keys: Arc::new(exported.sender_claimed_keys.clone()),
            room_id: exported.room_id.clone(),
            forwarding_key_chain: exported.forwarding_curve25519_key_chain.clone().into(),
            imported: true,
            algorithm: exported.algorithm.clone(),
            backed_up: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Create a session from an entry of a downloaded key backup.
    pub fn from_backed_up_key(
        room_id: &RoomId,
        backed_up: &BackedUpRoomKey,
    ) -> Result<Self, SessionCreationError> {
        if backed_up.algorithm != EventEncryptionAlgorithm::MegolmV1AesSha2 {
            return Err(SessionCreationError::Algorithm(backed_up.algorithm.clone()));
        }

        let session = vodozemac::megolm::InboundGroupSession::import(
            &backed_up.session_key,
            SessionConfig::version_1(),
        );
        let session_id = session.session_id();
        let first_known_index = session.first_known_index();

        Ok(InboundGroupSession {
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            first_known_index,
            sender_key: backed_up.sender_key,
            sender_claimed_keys: Arc::new(backed_up.sender_claimed_keys.clone()),
            room_id: room_id.to_owned(),
            forwarding_key_chain: backed_up.forwarding_curve25519_key_chain.clone().into(),
            imported: true,
            algorithm: backed_up.algorithm.clone(),
            // This key is already in the backup, no need to upload it again.
            backed_up: Arc::new(AtomicBool::new(true)),
        })
    }

    /// The room this session is scoped to.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    /// The unique identifier of the session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The curve25519 key of the session creator.
    pub fn sender_key(&self) -> Curve25519PublicKey {
        self.sender_key
    }

    /// The signing keys the session creator claims to own.
    pub fn sender_claimed_keys(&self) -> &SenderClaimedKeys {
        &self.sender_claimed_keys
    }

    /// The algorithm this session decrypts messages of.
    pub fn algorithm(&self) -> &EventEncryptionAlgorithm {
        &self.algorithm
    }

    /// The first message index this session can decrypt.
    pub fn first_known_index(&self) -> u32 {
        self.first_known_index
    }

    /// The chain of curve25519 keys the session was forwarded through.
    pub fn forwarding_key_chain(&self) -> &[String] {
        &self.forwarding_key_chain
    }

    /// Did the session arrive via forwarding, import or backup restore,
    /// rather than directly from its creator.
    pub fn has_been_imported(&self) -> bool {
        self.imported
    }

    /// Has the session been uploaded to the server-side backup.
    pub fn backed_up(&self) -> bool {
        self.backed_up.load(SeqCst)
    }

    /// Mark the session as uploaded to the backup.
    pub(crate) fn mark_as_backed_up(&self) {
        self.backed_up.store(true, SeqCst);
    }

    /// Clear the backed-up flag, e.g. after the backup version changed.
    pub(crate) fn reset_backup_state(&self) {
        self.backed_up.store(false, SeqCst);
    }

    /// Decrypt the given ciphertext, returning the plaintext bytes and the
    /// message index the ciphertext was encrypted at.
    ///
    /// Ratchet state only ever advances; decrypting a historical index again
    /// is idempotent for readers.
    pub(crate) async fn decrypt_helper(
        &self,
        message: &MegolmMessage,
    ) -> Result<DecryptedMessage, DecryptionError> {
        self.inner.lock().await.decrypt(message)
    }

    /// Export the session so it can decrypt messages starting from the given
    /// index.
    ///
    /// The export never reaches below the first index we know ourselves.
    pub async fn export_at_index(&self, message_index: u32) -> ExportedRoomKey {
        let message_index = std::cmp::max(self.first_known_index(), message_index);

        let session_key = self
            .inner
            .lock()
            .await
            .export_at(message_index)
            .expect("an index clamped to first_known_index can always be exported");

        ExportedRoomKey {
            algorithm: self.algorithm.clone(),
            room_id: self.room_id.clone(),
            sender_key: self.sender_key,
            session_id: self.session_id().to_owned(),
            session_key,
            sender_claimed_keys: (*self.sender_claimed_keys).clone(),
            forwarding_curve25519_key_chain: self.forwarding_key_chain.to_vec(),
        }
    }

    /// Export the session at the first known message index.
    pub async fn export(&self) -> ExportedRoomKey {
        self.export_at_index(self.first_known_index()).await
    }

    /// Export the session in the shape the key backup uses.
    pub async fn to_backup(&self) -> BackedUpRoomKey {
        self.export().await.into()
    }

    /// Compare the ratchet state of this session with another copy of it.
    ///
    /// [`SessionOrdering::Better`] means our copy can decrypt everything the
    /// other one can, and more.
    pub async fn compare_ratchet(&self, other: &InboundGroupSession) -> SessionOrdering {
        // Comparing a session object with itself would deadlock on the inner
        // lock, and is always equal anyway.
        if Arc::ptr_eq(&self.inner, &other.inner) {
            SessionOrdering::Equal
        } else if self.sender_key != other.sender_key
            || self.algorithm != other.algorithm
            || self.room_id != other.room_id
        {
            SessionOrdering::Unconnected
        } else {
            let mut other_inner = other.inner.lock().await;
            self.inner.lock().await.compare(&mut other_inner)
        }
    }

    /// Serialize the session so it can be persisted.
    pub async fn pickle(&self) -> PickledInboundGroupSession {
        let pickle = self.inner.lock().await.pickle();

        PickledInboundGroupSession {
            pickle,
            sender_key: self.sender_key,
            sender_claimed_keys: (*self.sender_claimed_keys).clone(),
            room_id: self.room_id.clone(),
            forwarding_key_chain: self.forwarding_key_chain.to_vec(),
            imported: self.imported,
            backed_up: self.backed_up(),
            algorithm: self.algorithm.clone(),
        }
    }

    /// Restore a session from its persisted form.
    pub fn from_pickle(pickle: PickledInboundGroupSession) -> Result<Self, PickleError> {
        let session: vodozemac::megolm::InboundGroupSession = pickle.pickle.into();
        let session_id = session.session_id();
        let first_known_index = session.first_known_index();

        Ok(InboundGroupSession {
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            first_known_index,
            sender_key: pickle.sender_key,
            sender_claimed_keys: Arc::new(pickle.sender_claimed_keys),
            room_id: pickle.room_id,
            forwarding_key_chain: pickle.forwarding_key_chain.into(),
            imported: pickle.imported,
            algorithm: pickle.algorithm,
            backed_up: Arc::new(AtomicBool::new(pickle.backed_up)),
        })
    }
}

impl fmt::Debug for InboundGroupSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundGroupSession").field("session_id", &self.session_id()).finish()
    }
}

impl PartialEq for InboundGroupSession {
    fn eq(&self, other: &Self) -> bool {
        self.session_id() == other.session_id()
    }
}

/// A serializable version of an [`InboundGroupSession`], holding everything
/// needed to restore it from a database.
#[derive(Serialize, Deserialize)]
#[allow(missing_debug_implementations)]
pub struct PickledInboundGroupSession {
    /// The pickled ratchet state.
    pub pickle: InboundGroupSessionPickle,
    /// The curve25519 key of the device that created the session.
    #[serde(
        serialize_with = "serialize_curve_key",
        deserialize_with = "deserialize_curve_key"
    )]
    pub sender_key: Curve25519PublicKey,
    /// The claimed signing keys of the session creator.
    pub sender_claimed_keys: SenderClaimedKeys,
    /// The room the session is scoped to.
    pub room_id: OwnedRoomId,
    /// The forwarding chain of the session.
    #[serde(default)]
    pub forwarding_key_chain: Vec<String>,
    /// Did the session arrive via forwarding, import or restore.
    pub imported: bool,
    /// Has the session been uploaded to the backup.
    #[serde(default)]
    pub backed_up: bool,
    /// The algorithm of the session.
    pub algorithm: EventEncryptionAlgorithm,
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use ruma::room_id;
    use vodozemac::megolm::{GroupSession, SessionConfig, SessionOrdering};

    use super::InboundGroupSession;
    use crate::olm::Account;

    fn inbound_session() -> (GroupSession, InboundGroupSession) {
        let account =
            Account::new(ruma::user_id!("@alice:localhost"), ruma::device_id!("ALICEDEVICE"));
        let identity_keys = account.identity_keys();

        let outbound = GroupSession::new(SessionConfig::version_1());
        let inbound = InboundGroupSession::new(
            identity_keys.curve25519,
            identity_keys.ed25519,
            room_id!("!test:localhost"),
            &outbound.session_key(),
        );

        (outbound, inbound)
    }

    #[tokio::test]
    async fn export_and_import_at_a_later_index() {
        let (mut outbound, inbound) = inbound_session();

        // Advance the outbound ratchet past index 0.
        let _ = outbound.encrypt("message at index 0");
        let first_ciphertext = outbound.encrypt("message at index 1");

        let exported = inbound.export_at_index(1).await;
        let imported = InboundGroupSession::from_export(&exported).unwrap();

        assert_eq!(imported.first_known_index(), 1);
        assert!(imported.has_been_imported());
        assert_eq!(imported.session_id(), inbound.session_id());

        // The partial copy decrypts everything from index 1 onwards...
        let decrypted = imported.decrypt_helper(&first_ciphertext).await.unwrap();
        assert_eq!(decrypted.plaintext, b"message at index 1".to_vec());
        assert_eq!(decrypted.message_index, 1);

        // ...and the full copy is strictly better than the partial one.
        assert_eq!(inbound.compare_ratchet(&imported).await, SessionOrdering::Better);
        assert_eq!(imported.compare_ratchet(&inbound).await, SessionOrdering::Worse);
    }

    #[tokio::test]
    async fn pickle_round_trip() {
        let (_, inbound) = inbound_session();

        let pickle = inbound.pickle().await;
        let restored = InboundGroupSession::from_pickle(pickle).unwrap();

        assert_eq!(restored.session_id(), inbound.session_id());
        assert_eq!(restored.room_id(), inbound.room_id());
        assert_eq!(restored.first_known_index(), inbound.first_known_index());
        assert_matches!(restored.compare_ratchet(&inbound).await, SessionOrdering::Equal);
    }
}
