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
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock as StdRwLock,
    },
};

use ruma::{
    DeviceKeyAlgorithm, DeviceKeyId, OwnedDeviceId, OwnedDeviceKeyId, OwnedUserId, DeviceId,
    UserId,
};
use serde::{Deserialize, Serialize};
use tracing::warn;
use vodozemac::{olm::SessionConfig, Curve25519PublicKey, Ed25519PublicKey};

use serde_json::Value;

use crate::{
    error::{OlmError, OlmResult, SessionCreationError, SignatureError},
    olm::utility::verify_signed_json,
    store::Store,
    types::{
        events::encrypted::ToDeviceEncryptedEventContent, DeviceKeys, EventEncryptionAlgorithm,
        SignedOneTimeKey,
    },
};

/// The local trust state of a device.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum LocalTrust {
    /// The user confirmed the device's fingerprint out of band.
    Verified,
    /// The user decided this device must never receive any keys.
    Blacklisted,
    /// No trust decision has been made yet.
    Unset,
}

/// A device belonging to some user, together with everything we know about
/// it.
///
/// Devices are created exclusively from `/keys/query` responses and are only
/// ever updated in place; a device whose identity keys change stops being the
/// same device and the update is refused.
#[derive(Clone, Debug)]
pub struct DeviceData {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    algorithms: Arc<[EventEncryptionAlgorithm]>,
    keys: Arc<BTreeMap<OwnedDeviceKeyId, String>>,
    device_keys: Arc<DeviceKeys>,
    trust_state: Arc<StdRwLock<LocalTrust>>,
    /// Set once the device was legitimately observed in a key-query
    /// response for its user.
    known: Arc<AtomicBool>,
    deleted: Arc<AtomicBool>,
}

impl DeviceData {
    /// Create a device from a verified `/keys/query` entry.
    ///
    /// The self-signature of the key object is checked; an unsigned or
    /// incorrectly signed device is rejected.
    pub fn try_from_keys(device_keys: &DeviceKeys) -> Result<Self, SignatureError> {
        Self::verify_device_keys(device_keys)?;

        Ok(Self {
            user_id: device_keys.user_id.clone(),
            device_id: device_keys.device_id.clone(),
            algorithms: device_keys.algorithms.clone().into(),
            keys: Arc::new(device_keys.keys.clone()),
            device_keys: Arc::new(device_keys.clone()),
            trust_state: Arc::new(StdRwLock::new(LocalTrust::Unset)),
            known: Arc::new(AtomicBool::new(true)),
            deleted: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Create the device entry for our own account.
    ///
    /// Our own keys don't pass through a key query, so they are known and
    /// implicitly verified.
    pub(crate) fn from_own_device_keys(device_keys: DeviceKeys) -> Self {
        Self {
            user_id: device_keys.user_id.clone(),
            device_id: device_keys.device_id.clone(),
            algorithms: device_keys.algorithms.clone().into(),
            keys: Arc::new(device_keys.keys.clone()),
            device_keys: Arc::new(device_keys),
            trust_state: Arc::new(StdRwLock::new(LocalTrust::Verified)),
            known: Arc::new(AtomicBool::new(true)),
            deleted: Arc::new(AtomicBool::new(false)),
        }
    }

    fn verify_device_keys(device_keys: &DeviceKeys) -> Result<(), SignatureError> {
        let signing_key = device_keys.ed25519_key().ok_or(SignatureError::NoSignatureFound)?;
        let key_id =
            DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &device_keys.device_id);
        let json = serde_json::to_value(device_keys)
            .map_err(|_| SignatureError::NotAnObject)?;

        verify_signed_json(signing_key, &device_keys.user_id, &key_id, &json)
    }

    /// The user this device belongs to.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// The unique id of the device.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// The encryption algorithms the device claims to support.
    pub fn algorithms(&self) -> &[EventEncryptionAlgorithm] {
        &self.algorithms
    }

    /// Does the device support the one-to-one Olm algorithm, the transport
    /// every key share relies on.
    pub fn supports_olm(&self) -> bool {
        self.algorithms.contains(&EventEncryptionAlgorithm::OlmV1Curve25519AesSha2)
    }

    /// Get a key of the given algorithm from the device's key map.
    pub fn get_key(&self, algorithm: DeviceKeyAlgorithm) -> Option<&str> {
        self.keys
            .get(&DeviceKeyId::from_parts(algorithm, &self.device_id))
            .map(String::as_str)
    }

    /// The long-term curve25519 identity key of the device.
    pub fn curve25519_key(&self) -> Option<Curve25519PublicKey> {
        self.get_key(DeviceKeyAlgorithm::Curve25519)
            .and_then(|k| Curve25519PublicKey::from_base64(k).ok())
    }

    /// The ed25519 signing key of the device.
    pub fn ed25519_key(&self) -> Option<Ed25519PublicKey> {
        self.get_key(DeviceKeyAlgorithm::Ed25519)
            .and_then(|k| Ed25519PublicKey::from_base64(k).ok())
    }

    /// The fingerprint a user compares out of band before verifying the
    /// device; this is the base64 ed25519 key.
    pub fn fingerprint(&self) -> Option<&str> {
        self.get_key(DeviceKeyAlgorithm::Ed25519)
    }

    /// The full signed key object of the device.
    pub fn as_device_keys(&self) -> &DeviceKeys {
        &self.device_keys
    }

    /// The session configuration to use when establishing an Olm session
    /// with this device.
    pub(crate) fn olm_session_config(&self) -> SessionConfig {
        SessionConfig::version_1()
    }

    /// The local trust state of the device.
    pub fn local_trust_state(&self) -> LocalTrust {
        *self.trust_state.read().unwrap()
    }

    /// Was the device manually verified by the user.
    pub fn is_verified(&self) -> bool {
        self.local_trust_state() == LocalTrust::Verified
    }

    /// Was the device manually blacklisted by the user.
    pub fn is_blacklisted(&self) -> bool {
        self.local_trust_state() == LocalTrust::Blacklisted
    }

    /// Set the local trust state of the device.
    pub fn set_trust_state(&self, state: LocalTrust) {
        *self.trust_state.write().unwrap() = state;
    }

    /// Has the device been observed in a key-query response for its user.
    pub fn is_known(&self) -> bool {
        self.known.load(Ordering::SeqCst)
    }

    /// Was the device deleted by the server, i.e. the user logged out of it.
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_as_deleted(&self) {
        self.deleted.store(true, Ordering::SeqCst);
    }

    /// Update the device with a fresh `/keys/query` entry.
    ///
    /// The identity keys of a device never change during its lifetime; an
    /// entry claiming new keys for a known device id means somebody is trying
    /// to impersonate the device and the update is rejected, keeping the old
    /// keys and trust state intact.
    pub(crate) fn update_device(&mut self, device_keys: &DeviceKeys) -> Result<(), SignatureError> {
        if self.user_id != device_keys.user_id || self.device_id != device_keys.device_id {
            return Err(SignatureError::UserIdMismatch);
        }

        Self::verify_device_keys(device_keys)?;

        if self.ed25519_key() != device_keys.ed25519_key()
            || self.curve25519_key() != device_keys.curve25519_key()
        {
            warn!(
                user_id = ?self.user_id,
                device_id = ?self.device_id,
                "The identity keys of a known device changed, refusing the update",
            );

            return Err(SignatureError::SigningKeyChanged);
        }

        self.algorithms = device_keys.algorithms.clone().into();
        self.keys = Arc::new(device_keys.keys.clone());
        self.device_keys = Arc::new(device_keys.clone());

        Ok(())
    }

    /// Encrypt the given event content for this device, using the most
    /// recently used Olm session we share with it.
    ///
    /// The ratcheted session is persisted before the content is handed back.
    pub(crate) async fn encrypt(
        &self,
        store: &Store,
        event_type: &str,
        content: Value,
    ) -> OlmResult<ToDeviceEncryptedEventContent> {
        let sender_key = self.curve25519_key().ok_or_else(|| {
            OlmError::SessionCreation(SessionCreationError::DeviceMissingCurveKey(
                self.user_id().to_owned(),
                self.device_id().to_owned(),
            ))
        })?;

        let sessions = store.get_sessions(&sender_key.to_base64()).await?.ok_or_else(|| {
            OlmError::MissingSession(self.user_id().to_owned(), self.device_id().to_owned())
        })?;

        let mut sessions = sessions.lock().await;

        let session = sessions
            .iter_mut()
            .max_by_key(|s| s.last_use_time)
            .ok_or_else(|| {
                OlmError::MissingSession(self.user_id().to_owned(), self.device_id().to_owned())
            })?;

        let message = session.encrypt(self, event_type, content).await?;
        let session = session.clone();

        drop(sessions);
        store.save_sessions(&[session]).await?;

        Ok(message)
    }

    /// Check that the given one-time key was signed by this device.
    pub(crate) fn verify_one_time_key(
        &self,
        key: &SignedOneTimeKey,
    ) -> Result<(), SignatureError> {
        let signing_key = self.ed25519_key().ok_or(SignatureError::NoSignatureFound)?;
        let key_id = DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &self.device_id);
        let json = serde_json::to_value(key).map_err(|_| SignatureError::NotAnObject)?;

        verify_signed_json(signing_key, &self.user_id, &key_id, &json)
    }
}

impl PartialEq for DeviceData {
    fn eq(&self, other: &Self) -> bool {
        self.user_id == other.user_id && self.device_id == other.device_id
    }
}

/// A read-only view over all devices of a single user.
#[derive(Clone, Debug, Default)]
pub struct UserDevices {
    pub(crate) entries: HashMap<OwnedDeviceId, DeviceData>,
}

impl UserDevices {
    /// Get the device with the given id, if the user has one.
    pub fn get(&self, device_id: &DeviceId) -> Option<&DeviceData> {
        self.entries.get(device_id)
    }

    /// Iterate over the ids of all devices of the user.
    pub fn keys(&self) -> impl Iterator<Item = &OwnedDeviceId> {
        self.entries.keys()
    }

    /// Iterate over all devices of the user.
    pub fn devices(&self) -> impl Iterator<Item = &DeviceData> {
        self.entries.values()
    }

    /// The number of devices the user has.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Does the user have no devices at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use ruma::{device_id, user_id};

    use super::DeviceData;
    use crate::olm::Account;

    /// Create a signed device for testing purposes.
    pub(crate) fn get_device() -> DeviceData {
        let account = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        DeviceData::try_from_keys(&account.device_keys()).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use ruma::{device_id, user_id};

    use super::{testing::get_device, DeviceData, LocalTrust};
    use crate::{error::SignatureError, olm::Account};

    #[test]
    fn device_creation_from_signed_keys() {
        let device = get_device();

        assert_eq!(device.user_id(), user_id!("@alice:localhost"));
        assert_eq!(device.device_id(), device_id!("ALICEDEVICE"));
        assert!(device.curve25519_key().is_some());
        assert!(device.ed25519_key().is_some());
        assert!(device.is_known());
        assert_eq!(device.local_trust_state(), LocalTrust::Unset);
    }

    #[test]
    fn unsigned_device_keys_are_rejected() {
        let account = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let mut device_keys = account.device_keys();
        device_keys.signatures.clear();

        DeviceData::try_from_keys(&device_keys)
            .expect_err("device keys without a self-signature should be rejected");
    }

    #[test]
    fn changed_identity_keys_are_rejected() {
        let account = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let mut device = DeviceData::try_from_keys(&account.device_keys()).unwrap();
        device.set_trust_state(LocalTrust::Verified);

        // A different account claiming the same device id.
        let imposter = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));

        let error = device.update_device(&imposter.device_keys()).unwrap_err();
        assert_matches!(error, SignatureError::SigningKeyChanged);

        // The old keys and the trust decision survive the attempted update.
        assert_eq!(device.ed25519_key(), Some(account.identity_keys().ed25519));
        assert!(device.is_verified());
    }

    #[test]
    fn update_with_same_keys_succeeds() {
        let account = Account::new(user_id!("@alice:localhost"), device_id!("ALICEDEVICE"));
        let mut device = DeviceData::try_from_keys(&account.device_keys()).unwrap();

        device.update_device(&account.device_keys()).expect("an unchanged update should succeed");
    }
}
