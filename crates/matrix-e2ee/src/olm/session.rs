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

use std::{collections::BTreeMap, fmt, sync::Arc};

use ruma::{OwnedDeviceId, OwnedUserId, SecondsSinceUnixEpoch};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::trace;
use vodozemac::{
    olm::{DecryptionError, IdentityKeys, OlmMessage, SessionPickle},
    Curve25519PublicKey,
};

use crate::{
    error::{EventError, OlmResult},
    identities::DeviceData,
    types::events::encrypted::{OlmV1Curve25519AesSha2Content, ToDeviceEncryptedEventContent},
};

/// A one-to-one encrypted channel between our device and another device.
///
/// The ratchet state advances on every encryption and decryption and can
/// never be rolled back; all mutation goes through the internal lock so
/// concurrent users of a cloned `Session` stay strictly ordered.
#[derive(Clone)]
pub struct Session {
    /// Our own user id.
    pub(crate) user_id: OwnedUserId,
    /// Our own device id.
    pub(crate) device_id: OwnedDeviceId,
    /// Our own identity keys.
    pub(crate) our_identity_keys: Arc<IdentityKeys>,
    /// The ratchet state.
    pub(crate) inner: Arc<Mutex<vodozemac::olm::Session>>,
    session_id: Arc<str>,
    /// The curve25519 identity key of the peer.
    pub(crate) sender_key: Curve25519PublicKey,
    /// Whether the session was established using a fallback key rather than
    /// a one-time key.
    pub(crate) created_using_fallback_key: bool,
    /// When the session was created.
    pub(crate) creation_time: SecondsSinceUnixEpoch,
    /// When the session last encrypted or decrypted a message. The most
    /// recently used session wins when picking one for a new message.
    pub(crate) last_use_time: SecondsSinceUnixEpoch,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id())
            .field("sender_key", &self.sender_key)
            .finish()
    }
}

impl Session {
    /// Decrypt the given Olm message, advancing the ratchet.
    pub async fn decrypt(&mut self, message: &OlmMessage) -> Result<String, DecryptionError> {
        let plaintext = self.inner.lock().await.decrypt(message)?;
        let plaintext = String::from_utf8_lossy(&plaintext).to_string();

        trace!(session_id = self.session_id(), "Decrypted an Olm message");

        self.last_use_time = SecondsSinceUnixEpoch::now();

        Ok(plaintext)
    }

    pub(crate) async fn encrypt_helper(&mut self, plaintext: &str) -> OlmMessage {
        let message = self.inner.lock().await.encrypt(plaintext);
        self.last_use_time = SecondsSinceUnixEpoch::now();

        message
    }

    /// Encrypt the given event content for the device this session is shared
    /// with, producing the content of an encrypted to-device event.
    ///
    /// The payload embeds our user id and ed25519 key as well as the
    /// recipient's, so the receiving side can detect relayed or misdirected
    /// messages.
    pub async fn encrypt(
        &mut self,
        recipient_device: &DeviceData,
        event_type: &str,
        content: Value,
    ) -> OlmResult<ToDeviceEncryptedEventContent> {
        let recipient_signing_key =
            recipient_device.ed25519_key().ok_or(EventError::MissingSigningKey)?;

        let payload = json!({
            "sender": &self.user_id,
            "sender_device": &self.device_id,
            "keys": {
                "ed25519": self.our_identity_keys.ed25519.to_base64(),
            },
            "recipient": recipient_device.user_id(),
            "recipient_keys": {
                "ed25519": recipient_signing_key.to_base64(),
            },
            "type": event_type,
            "content": content,
        });

        let plaintext = serde_json::to_string(&payload)?;
        let ciphertext = self.encrypt_helper(&plaintext).await;

        let mut ciphertexts = BTreeMap::new();
        ciphertexts.insert(self.sender_key.to_base64(), ciphertext);

        Ok(ToDeviceEncryptedEventContent::OlmV1Curve25519AesSha2(
            OlmV1Curve25519AesSha2Content {
                sender_key: self.our_identity_keys.curve25519,
                ciphertext: ciphertexts,
            },
        ))
    }

    /// The curve25519 identity key of the peer this session was established
    /// with.
    pub fn sender_key(&self) -> Curve25519PublicKey {
        self.sender_key
    }

    /// The unique identifier of the session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Serialize the session so it can be persisted.
    pub async fn pickle(&self) -> PickledSession {
        let pickle = self.inner.lock().await.pickle();

        PickledSession {
            pickle,
            sender_key: self.sender_key,
            created_using_fallback_key: self.created_using_fallback_key,
            creation_time: self.creation_time,
            last_use_time: self.last_use_time,
        }
    }

    /// Restore a session from its persisted form.
    pub fn from_pickle(
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
        our_identity_keys: Arc<IdentityKeys>,
        pickle: PickledSession,
    ) -> Self {
        let session: vodozemac::olm::Session = pickle.pickle.into();
        let session_id = session.session_id();

        Session {
            user_id,
            device_id,
            our_identity_keys,
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            sender_key: pickle.sender_key,
            created_using_fallback_key: pickle.created_using_fallback_key,
            creation_time: pickle.creation_time,
            last_use_time: pickle.last_use_time,
        }
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.session_id() == other.session_id()
    }
}

/// A serializable version of a [`Session`], holding everything needed to
/// restore it from a database.
#[derive(Serialize, Deserialize)]
#[allow(missing_debug_implementations)]
pub struct PickledSession {
    /// The pickled ratchet state.
    pub pickle: SessionPickle,
    /// The curve25519 identity key of the peer.
    pub sender_key: Curve25519PublicKey,
    /// Was the session created using a fallback key.
    #[serde(default)]
    pub created_using_fallback_key: bool,
    /// When the session was created.
    pub creation_time: SecondsSinceUnixEpoch,
    /// When the session was last used.
    pub last_use_time: SecondsSinceUnixEpoch,
}
