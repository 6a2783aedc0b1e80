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
    fmt,
    sync::Arc,
    time::Duration,
};

use ruma::{
    DeviceKeyAlgorithm, DeviceKeyId, MilliSecondsSinceUnixEpoch, OwnedDeviceId, OwnedUserId,
    SecondsSinceUnixEpoch, DeviceId, UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};
use vodozemac::{
    base64_encode,
    olm::{AccountPickle, IdentityKeys, OlmMessage, OneTimeKeyGenerationResult, PreKeyMessage},
    Curve25519PublicKey, Ed25519Signature, KeyId, PickleError,
};

use super::{utility::canonical_json, Session};
use crate::{
    error::{OlmError, OlmResult, SessionCreationError, SignatureError},
    identities::DeviceData,
    store::Store,
    types::{DeviceKeys, EventEncryptionAlgorithm, OneTimeKeys, SignedOneTimeKey},
};

/// How often we rotate the fallback key, lower bound of the X3DH
/// recommendation for signed pre-key rotation.
const FALLBACK_KEY_MAX_AGE: Duration = Duration::from_secs(3600 * 24 * 7);

/// A hash of a received Olm message, recorded so a replayed copy of the
/// ciphertext can be told apart from a wedged session.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OlmMessageHash {
    /// The curve25519 key of the sender that sent us the message.
    pub sender_key: String,
    /// The SHA-256 of the base64 ciphertext.
    pub hash: String,
}

impl OlmMessageHash {
    pub(crate) fn new(sender_key: Curve25519PublicKey, ciphertext: &OlmMessage) -> Self {
        let (message_type, ciphertext) = ciphertext.clone().to_parts();
        let sha = Sha256::new()
            .chain_update(sender_key.as_bytes())
            .chain_update([message_type as u8])
            .chain_update(ciphertext);

        Self { sender_key: sender_key.to_base64(), hash: base64_encode(sha.finalize()) }
    }
}

/// A session together with the information of whether it was freshly created
/// by the message it decrypted.
#[derive(Debug)]
pub(crate) enum SessionType {
    /// A session that was established by a pre-key message we just received.
    New(Session),
    /// A session that already existed.
    Existing(Session),
}

impl SessionType {
    #[cfg(test)]
    pub(crate) fn session(self) -> Session {
        match self {
            SessionType::New(s) => s,
            SessionType::Existing(s) => s,
        }
    }
}

/// The result of creating an inbound session from a pre-key message.
pub(crate) struct InboundCreationResult {
    /// The newly created session.
    pub session: Session,
    /// The plaintext the pre-key message carried.
    pub plaintext: String,
}

/// An Olm account, the long-term cryptographic identity of our own device.
///
/// Holds the identity key pair, the published one-time and fallback keys, and
/// is the factory for all one-to-one sessions.
pub struct Account {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    inner: Box<vodozemac::olm::Account>,
    identity_keys: Arc<IdentityKeys>,
    /// Have our device keys been uploaded to the server.
    shared: bool,
    /// The number of signed one-time keys the server still holds for us; the
    /// server echoes this after every upload and sync.
    uploaded_key_count: u64,
    /// When we last generated a fallback key.
    fallback_creation_timestamp: Option<MilliSecondsSinceUnixEpoch>,
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("identity_keys", &self.identity_keys)
            .field("shared", &self.shared)
            .finish()
    }
}

impl Account {
    /// Create a fresh account, generating a new identity key pair and an
    /// initial batch of one-time keys.
    pub fn new(user_id: &UserId, device_id: &DeviceId) -> Self {
        let mut inner = vodozemac::olm::Account::new();
        let identity_keys = inner.identity_keys();

        // A brand new account has nothing on the server, so we can generate
        // the full batch of one-time keys right away and upload them together
        // with the device keys.
        inner.generate_one_time_keys(inner.max_number_of_one_time_keys());

        Self {
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            inner: Box::new(inner),
            identity_keys: Arc::new(identity_keys),
            shared: false,
            uploaded_key_count: 0,
            fallback_creation_timestamp: None,
        }
    }

    /// Our own user id.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Our own device id.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// The public identity keys of the account.
    pub fn identity_keys(&self) -> IdentityKeys {
        *self.identity_keys
    }

    pub(crate) fn identity_keys_arc(&self) -> Arc<IdentityKeys> {
        self.identity_keys.clone()
    }

    /// Have the device keys of this account been uploaded.
    pub fn shared(&self) -> bool {
        self.shared
    }

    /// Mark the account as having had its device keys uploaded.
    pub fn mark_as_shared(&mut self) {
        self.shared = true;
    }

    /// The number of one-time keys the server holds for us, according to the
    /// last count it echoed back.
    pub fn uploaded_key_count(&self) -> u64 {
        self.uploaded_key_count
    }

    /// The unpublished one-time keys of the account.
    pub fn one_time_keys(&self) -> HashMap<KeyId, Curve25519PublicKey> {
        self.inner.one_time_keys()
    }

    fn fallback_key(&self) -> HashMap<KeyId, Curve25519PublicKey> {
        self.inner.fallback_key()
    }

    /// Generate new one-time keys if the server is running low on them.
    ///
    /// Returns `None` if the server already holds the maximum number of
    /// keys; `Some(0)` means previously generated keys still await upload.
    pub fn generate_one_time_keys_if_needed(&mut self) -> Option<u64> {
        if !self.one_time_keys().is_empty() {
            return Some(0);
        }

        let count = self.uploaded_key_count();
        let max_keys = self.inner.max_number_of_one_time_keys();

        if count >= max_keys as u64 {
            return None;
        }

        let key_count = (max_keys as u64) - count;
        let key_count: usize = key_count.try_into().unwrap_or(max_keys);

        let result: OneTimeKeyGenerationResult = self.inner.generate_one_time_keys(key_count);

        debug!(
            count = key_count,
            discarded_keys = ?result.removed,
            created_keys = ?result.created,
            "Generated new one-time keys"
        );

        Some(key_count as u64)
    }

    fn fallback_key_expired(&self) -> bool {
        if let Some(time) = self.fallback_creation_timestamp {
            let Some(system_time) = time.to_system_time() else {
                return true;
            };

            // A clock that jumped backwards also rotates the key; it costs
            // us nothing and keeps the timestamps sane.
            let Ok(elapsed) = system_time.elapsed() else {
                return true;
            };

            elapsed > FALLBACK_KEY_MAX_AGE
        } else {
            true
        }
    }

    /// Generate a new fallback key if we never had one or the current one
    /// expired.
    pub(crate) fn generate_fallback_key_if_needed(&mut self) {
        if self.inner.fallback_key().is_empty() && self.fallback_key_expired() {
            let removed_fallback_key = self.inner.generate_fallback_key();
            self.fallback_creation_timestamp = Some(MilliSecondsSinceUnixEpoch::now());

            debug!(
                ?removed_fallback_key,
                "The fallback key either expired or we didn't have one: generated a new one",
            );
        }
    }

    /// Update our book-keeping after the server echoed the current one-time
    /// key counts.
    ///
    /// Counts are absolute, so receiving the same response twice is
    /// harmless.
    pub fn update_key_counts(
        &mut self,
        one_time_key_counts: &BTreeMap<String, u64>,
        unused_fallback_keys: Option<&[String]>,
    ) {
        if let Some(count) = one_time_key_counts.get("signed_curve25519") {
            let old_count = self.uploaded_key_count();

            if *count != old_count {
                debug!(old_count, new_count = count, "Updated uploaded one-time key count");
            }

            self.uploaded_key_count = *count;
            self.generate_one_time_keys_if_needed();
        }

        if unused_fallback_keys.is_some() || self.fallback_creation_timestamp.is_some() {
            self.generate_fallback_key_if_needed();
        }
    }

    /// Should device keys or one-time keys be uploaded to the server.
    pub fn should_upload_keys(&self) -> bool {
        !self.shared()
            || !self.one_time_keys().is_empty()
            || !self.fallback_key().is_empty()
    }

    /// Mark the current batch of one-time and fallback keys as uploaded.
    pub fn mark_keys_as_published(&mut self) {
        self.inner.mark_keys_as_published();
    }

    /// Sign the given string with the account's ed25519 key.
    pub fn sign(&self, message: &str) -> Ed25519Signature {
        self.inner.sign(message)
    }

    /// Sign the canonical form of the given JSON object.
    pub fn sign_json(&self, json: Value) -> Result<Ed25519Signature, SignatureError> {
        Ok(self.sign(&canonical_json(json)?))
    }

    /// The signed device keys of this account, ready for upload.
    pub fn device_keys(&self) -> DeviceKeys {
        let mut keys = BTreeMap::new();
        keys.insert(
            DeviceKeyId::from_parts(DeviceKeyAlgorithm::Curve25519, &self.device_id),
            self.identity_keys.curve25519.to_base64(),
        );
        keys.insert(
            DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &self.device_id),
            self.identity_keys.ed25519.to_base64(),
        );

        let mut device_keys = DeviceKeys::new(
            self.user_id.clone(),
            self.device_id.clone(),
            vec![
                EventEncryptionAlgorithm::OlmV1Curve25519AesSha2,
                EventEncryptionAlgorithm::MegolmV1AesSha2,
            ],
            keys,
        );

        let json = serde_json::to_value(&device_keys)
            .expect("our own device keys can always be serialized");
        let signature = self
            .sign_json(json)
            .expect("our own device keys are an object and can always be signed");

        device_keys
            .signatures
            .entry(self.user_id.clone())
            .or_default()
            .insert(
                DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &self.device_id),
                signature.to_base64(),
            );

        device_keys
    }

    fn sign_one_time_key(&self, key: Curve25519PublicKey, fallback: bool) -> SignedOneTimeKey {
        let mut signed = SignedOneTimeKey { key, fallback, signatures: Default::default() };

        let json = serde_json::to_value(&signed)
            .expect("a one-time key can always be serialized");
        let signature =
            self.sign_json(json).expect("a one-time key is an object and can always be signed");

        signed.signatures.entry(self.user_id.clone()).or_default().insert(
            DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &self.device_id),
            signature.to_base64(),
        );

        signed
    }

    /// The signed, unpublished one-time keys, keyed the way the key upload
    /// endpoint expects them.
    pub fn signed_one_time_keys(&self) -> OneTimeKeys {
        self.one_time_keys()
            .into_iter()
            .map(|(key_id, key)| {
                (
                    format!("signed_curve25519:{}", key_id.to_base64()),
                    self.sign_one_time_key(key, false),
                )
            })
            .collect()
    }

    /// The signed, unpublished fallback keys.
    pub fn signed_fallback_keys(&self) -> OneTimeKeys {
        self.fallback_key()
            .into_iter()
            .map(|(key_id, key)| {
                (
                    format!("signed_curve25519:{}", key_id.to_base64()),
                    self.sign_one_time_key(key, true),
                )
            })
            .collect()
    }

    /// Create a new outbound session with the given device, consuming one of
    /// the one-time keys we claimed for it.
    ///
    /// The claimed key's self-signature is verified before the session is
    /// created.
    pub fn create_outbound_session(
        &self,
        device: &DeviceData,
        key_map: &OneTimeKeys,
    ) -> Result<Session, SessionCreationError> {
        let one_time_key = key_map.values().next().ok_or_else(|| {
            SessionCreationError::OneTimeKeyMissing(
                device.user_id().to_owned(),
                device.device_id().to_owned(),
            )
        })?;

        device.verify_one_time_key(one_time_key).map_err(|e| {
            SessionCreationError::InvalidSignature(
                device.user_id().to_owned(),
                device.device_id().to_owned(),
                e,
            )
        })?;

        let identity_key = device.curve25519_key().ok_or_else(|| {
            SessionCreationError::DeviceMissingCurveKey(
                device.user_id().to_owned(),
                device.device_id().to_owned(),
            )
        })?;

        let config = device.olm_session_config();
        let session =
            self.inner.create_outbound_session(config, identity_key, one_time_key.key);

        let now = SecondsSinceUnixEpoch::now();
        let session_id = session.session_id();

        info!(
            user_id = ?device.user_id(),
            device_id = ?device.device_id(),
            session_id,
            "Created a new outbound Olm session"
        );

        Ok(Session {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            our_identity_keys: self.identity_keys.clone(),
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            sender_key: identity_key,
            created_using_fallback_key: one_time_key.fallback,
            creation_time: now,
            last_use_time: now,
        })
    }

    /// Create a new inbound session from a pre-key message, consuming the
    /// one-time key the message was encrypted with.
    pub(crate) fn create_inbound_session(
        &mut self,
        sender_key: Curve25519PublicKey,
        message: &PreKeyMessage,
    ) -> Result<InboundCreationResult, SessionCreationError> {
        trace!(session_id = message.session_id(), "Creating a new Olm session from a pre-key message");

        let result = self.inner.create_inbound_session(sender_key, message)?;
        let now = SecondsSinceUnixEpoch::now();
        let session_id = result.session.session_id();

        let session = Session {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            our_identity_keys: self.identity_keys.clone(),
            inner: Arc::new(Mutex::new(result.session)),
            session_id: session_id.into(),
            sender_key,
            created_using_fallback_key: false,
            creation_time: now,
            last_use_time: now,
        };

        let plaintext = String::from_utf8_lossy(&result.plaintext).to_string();

        Ok(InboundCreationResult { session, plaintext })
    }

    /// Decrypt an Olm message, creating a new inbound session if the message
    /// is a pre-key message without a matching session.
    ///
    /// A pre-key message is only ever tried against the session its embedded
    /// session id names; consuming ratchet state of an unrelated session with
    /// replayed or malformed ciphertext would wedge that session.
    pub(crate) async fn decrypt_olm_message(
        &mut self,
        store: &Store,
        sender: &UserId,
        sender_key: Curve25519PublicKey,
        message: &OlmMessage,
    ) -> OlmResult<(SessionType, String)> {
        let existing_sessions = store.get_sessions(&sender_key.to_base64()).await?;

        match message {
            OlmMessage::Normal(_) => {
                // We don't know which session was used to encrypt the
                // message, so try them all. The session list lock is
                // released before the winning session is persisted, the
                // store takes the same lock.
                let mut decrypted = None;

                if let Some(sessions) = existing_sessions {
                    let mut sessions = sessions.lock().await;

                    for session in sessions.iter_mut() {
                        if let Ok(plaintext) = session.decrypt(message).await {
                            decrypted = Some((session.clone(), plaintext));
                            break;
                        }
                    }
                }

                if let Some((session, plaintext)) = decrypted {
                    store.save_sessions(&[session.clone()]).await?;
                    return Ok((SessionType::Existing(session), plaintext));
                }

                warn!(
                    ?sender,
                    ?sender_key,
                    "Failed to decrypt a non-pre-key message with all available sessions"
                );
                Err(OlmError::SessionWedged(sender.to_owned(), sender_key))
            }

            OlmMessage::PreKey(prekey_message) => {
                // A pre-key message names the only session it can belong
                // to; decryption is never attempted against any other one.
                let mut matching_session_outcome = None;

                if let Some(sessions) = existing_sessions {
                    let mut sessions = sessions.lock().await;

                    for session in sessions.iter_mut() {
                        if prekey_message.session_id() != session.session_id() {
                            continue;
                        }

                        matching_session_outcome = match session.decrypt(message).await {
                            Ok(plaintext) => Some(Ok((session.clone(), plaintext))),
                            Err(_) => Some(Err(())),
                        };
                        break;
                    }
                }

                match matching_session_outcome {
                    Some(Ok((session, plaintext))) => {
                        store.save_sessions(&[session.clone()]).await?;
                        Ok((SessionType::Existing(session), plaintext))
                    }
                    Some(Err(())) => {
                        // The message names a session we hold but the
                        // session can't decrypt it. The one-time key that
                        // would be needed to re-create the session has been
                        // used up, so there's no point in trying anything
                        // else.
                        warn!(
                            session_id = prekey_message.session_id(),
                            "Failed to decrypt a pre-key message with the corresponding session"
                        );

                        Err(OlmError::SessionWedged(sender.to_owned(), sender_key))
                    }
                    None => {
                        let result = match self.create_inbound_session(sender_key, prekey_message)
                        {
                            Ok(r) => r,
                            Err(e) => {
                                warn!(
                                    "Failed to create a new Olm session from a pre-key message: {e}"
                                );
                                return Err(OlmError::SessionWedged(sender.to_owned(), sender_key));
                            }
                        };

                        // The session has to hit the store before we return,
                        // otherwise a replay of this exact message could
                        // create a second session.
                        store.save_sessions(&[result.session.clone()]).await?;

                        Ok((SessionType::New(result.session), result.plaintext))
                    }
                }
            }
        }
    }

    /// Decrypt an Olm message and distinguish replayed ciphertext from a
    /// wedged session using the stored message hashes.
    pub(crate) async fn decrypt_olm_helper(
        &mut self,
        store: &Store,
        sender: &UserId,
        sender_key: Curve25519PublicKey,
        ciphertext: &OlmMessage,
    ) -> OlmResult<(SessionType, String, OlmMessageHash)> {
        let message_hash = OlmMessageHash::new(sender_key, ciphertext);

        match self.decrypt_olm_message(store, sender, sender_key, ciphertext).await {
            Ok((session, plaintext)) => Ok((session, plaintext, message_hash)),
            Err(OlmError::SessionWedged(user_id, sender_key)) => {
                if store.is_message_known(&message_hash).await? {
                    info!(?sender_key, "An Olm message got replayed, decryption failed");
                    Err(OlmError::ReplayedMessage(user_id, sender_key))
                } else {
                    Err(OlmError::SessionWedged(user_id, sender_key))
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Serialize the account so it can be persisted.
    pub fn pickle(&self) -> PickledAccount {
        PickledAccount {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            pickle: self.inner.pickle(),
            shared: self.shared,
            uploaded_signed_key_count: self.uploaded_key_count,
            fallback_key_creation_timestamp: self.fallback_creation_timestamp,
        }
    }

    /// Restore an account from its persisted form.
    pub fn from_pickle(pickle: PickledAccount) -> Result<Self, PickleError> {
        let inner = vodozemac::olm::Account::from_pickle(pickle.pickle);
        let identity_keys = inner.identity_keys();

        Ok(Self {
            user_id: pickle.user_id,
            device_id: pickle.device_id,
            inner: Box::new(inner),
            identity_keys: Arc::new(identity_keys),
            shared: pickle.shared,
            uploaded_key_count: pickle.uploaded_signed_key_count,
            fallback_creation_timestamp: pickle.fallback_key_creation_timestamp,
        })
    }
}

/// A serializable version of an [`Account`], holding everything needed to
/// restore it from a database.
#[derive(Serialize, Deserialize)]
#[allow(missing_debug_implementations)]
pub struct PickledAccount {
    /// The user id of the account owner.
    pub user_id: OwnedUserId,
    /// The device id of the account owner.
    pub device_id: OwnedDeviceId,
    /// The pickled Olm account.
    pub pickle: AccountPickle,
    /// Were the device keys uploaded.
    pub shared: bool,
    /// The number of one-time keys the server holds for us.
    pub uploaded_signed_key_count: u64,
    /// When we last generated a fallback key.
    #[serde(default)]
    pub fallback_key_creation_timestamp: Option<MilliSecondsSinceUnixEpoch>,
}

impl fmt::Debug for PickledAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PickledAccount")
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .field("shared", &self.shared)
            .field("uploaded_signed_key_count", &self.uploaded_signed_key_count)
            .field("fallback_key_creation_timestamp", &self.fallback_key_creation_timestamp)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, user_id, DeviceId, UserId};

    use super::Account;
    use crate::identities::DeviceData;

    fn user_id() -> &'static UserId {
        user_id!("@alice:localhost")
    }

    fn device_id() -> &'static DeviceId {
        device_id!("ALICEDEVICE")
    }

    #[test]
    fn fresh_account_has_keys_to_upload() {
        let account = Account::new(user_id(), device_id());

        assert!(!account.shared());
        assert!(account.should_upload_keys());
        assert!(!account.signed_one_time_keys().is_empty());
    }

    #[test]
    fn one_time_keys_are_self_signed() {
        let account = Account::new(user_id(), device_id());
        let device = DeviceData::try_from_keys(&account.device_keys()).unwrap();

        for key in account.signed_one_time_keys().values() {
            device.verify_one_time_key(key).expect("our own one-time keys should verify");
        }
    }

    #[test]
    fn key_count_update_is_idempotent() {
        let mut account = Account::new(user_id(), device_id());
        account.mark_keys_as_published();
        account.mark_as_shared();

        let counts = [("signed_curve25519".to_owned(), 49u64)].into();

        account.update_key_counts(&counts, None);
        let generated = account.one_time_keys().len();
        assert!(generated > 0, "a low count should trigger fresh one-time keys");

        // The same echo once more must not generate another batch on top.
        account.update_key_counts(&counts, None);
        assert_eq!(account.one_time_keys().len(), generated);
        assert_eq!(account.uploaded_key_count(), 49);
    }

    #[test]
    fn account_pickle_round_trip() {
        let account = Account::new(user_id(), device_id());
        let identity_keys = account.identity_keys();

        let pickle = account.pickle();
        let restored = Account::from_pickle(pickle).unwrap();

        assert_eq!(restored.identity_keys(), identity_keys);
        assert_eq!(restored.user_id(), user_id());
        assert_eq!(restored.device_id(), device_id());
    }
}
