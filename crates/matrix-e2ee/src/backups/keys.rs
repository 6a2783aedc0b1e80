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

//! The key pair of the `m.megolm_backup.v1.curve25519-aes-sha2` backup
//! algorithm: the public half encrypts room keys for upload, the private
//! "recovery key" decrypts a downloaded backup.

use std::{
    fmt,
    sync::{Arc, Mutex as StdMutex},
};

use thiserror::Error;
use vodozemac::{
    base64_decode, base64_encode,
    pk_encryption::{Message, PkDecryption, PkEncryption},
    Curve25519PublicKey, Curve25519SecretKey,
};
use zeroize::Zeroizing;

use crate::{
    olm::{BackedUpRoomKey, InboundGroupSession},
    transport::{EncryptedSessionData, KeyBackupData},
};

/// Error type describing why a recovery key couldn't be decoded.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The decoded recovery key has an invalid prefix.
    #[error("the decoded recovery key has an invalid prefix")]
    Prefix,

    /// The decoded recovery key has a parity byte that doesn't match the
    /// rest of the key.
    #[error("the parity byte of the recovery key doesn't match")]
    Parity,

    /// The decoded recovery key has an invalid length.
    #[error("the decoded recovery key has an invalid length, expected {0} bytes, got {1}")]
    Length(usize, usize),

    /// The recovery key isn't valid base64.
    #[error(transparent)]
    Base64(#[from] vodozemac::Base64DecodeError),

    /// The recovery key isn't valid base58.
    #[error(transparent)]
    Base58(#[from] bs58::decode::Error),

    /// An embedded public key couldn't be parsed.
    #[error(transparent)]
    PublicKey(#[from] vodozemac::KeyError),
}

/// Error type describing why a backup entry couldn't be decrypted.
#[derive(Debug, Error)]
pub enum DecryptionError {
    /// A field of the entry couldn't be decoded.
    #[error("a field of the backup entry couldn't be decoded: {0}")]
    Decode(#[from] DecodeError),

    /// The ciphertext failed to decrypt, e.g. because the MAC didn't match.
    #[error("the backup entry failed to decrypt: {0}")]
    Decryption(String),

    /// The decrypted entry isn't a valid room key.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

const PREFIX: [u8; 2] = [0x8B, 0x01];

/// The private half of the backup key pair, derived from the user's
/// recovery passphrase or stored in secret storage.
///
/// The key material is zeroized when the value is dropped.
pub struct RecoveryKey {
    inner: Curve25519SecretKey,
}

impl fmt::Debug for RecoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RecoveryKey").field(&"...").finish()
    }
}

impl RecoveryKey {
    /// The number of bytes the recovery key is made of.
    pub const KEY_SIZE: usize = 32;

    /// Generate a fresh random recovery key.
    pub fn new() -> Self {
        Self { inner: Curve25519SecretKey::new() }
    }

    /// Create a recovery key from raw bytes.
    pub fn from_bytes(key: &[u8; Self::KEY_SIZE]) -> Self {
        Self { inner: Curve25519SecretKey::from_slice(key) }
    }

    fn parity_byte(bytes: &[u8]) -> u8 {
        PREFIX.iter().chain(bytes.iter()).fold(0u8, |acc, b| acc ^ b)
    }

    /// Decode a recovery key from its unpadded base64 form.
    pub fn from_base64(key: &str) -> Result<Self, DecodeError> {
        let decoded = Zeroizing::new(base64_decode(key)?);

        if decoded.len() != Self::KEY_SIZE {
            return Err(DecodeError::Length(Self::KEY_SIZE, decoded.len()));
        }

        let mut bytes = Zeroizing::new([0u8; Self::KEY_SIZE]);
        bytes.copy_from_slice(&decoded);

        Ok(Self::from_bytes(&bytes))
    }

    /// Decode a recovery key from its base58 form, the form users see and
    /// type.
    pub fn from_base58(key: &str) -> Result<Self, DecodeError> {
        // Base58 recovery keys are traditionally displayed in groups of
        // four characters.
        let key: String = key.split_whitespace().collect();
        let decoded = Zeroizing::new(bs58::decode(key).into_vec()?);

        let expected_length = 2 + Self::KEY_SIZE + 1;
        if decoded.len() != expected_length {
            return Err(DecodeError::Length(expected_length, decoded.len()));
        }

        if decoded[0..2] != PREFIX {
            return Err(DecodeError::Prefix);
        }

        let key_bytes = &decoded[2..2 + Self::KEY_SIZE];
        let parity = decoded[2 + Self::KEY_SIZE];

        if Self::parity_byte(key_bytes) != parity {
            return Err(DecodeError::Parity);
        }

        let mut bytes = Zeroizing::new([0u8; Self::KEY_SIZE]);
        bytes.copy_from_slice(key_bytes);

        Ok(Self::from_bytes(&bytes))
    }

    /// Encode the recovery key as unpadded base64.
    pub fn to_base64(&self) -> String {
        base64_encode(self.inner.to_bytes().as_slice())
    }

    /// Encode the recovery key in its base58 form.
    pub fn to_base58(&self) -> String {
        let bytes = self.inner.to_bytes();

        let mut encoded = Vec::with_capacity(2 + Self::KEY_SIZE + 1);
        encoded.extend_from_slice(&PREFIX);
        encoded.extend_from_slice(bytes.as_slice());
        encoded.push(Self::parity_byte(bytes.as_slice()));

        let base58 = bs58::encode(encoded).into_string();

        // Match the traditional display form, groups of four characters.
        base58
            .as_bytes()
            .chunks(4)
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn decryption(&self) -> PkDecryption {
        PkDecryption::from_key(Curve25519SecretKey::from_slice(&self.inner.to_bytes()))
    }

    /// The public half of this key pair.
    pub fn public_key(&self) -> Curve25519PublicKey {
        self.decryption().public_key()
    }

    /// The [`MegolmV1BackupKey`] that encrypts room keys towards this
    /// recovery key.
    pub fn megolm_v1_public_key(&self) -> MegolmV1BackupKey {
        MegolmV1BackupKey::new(self.public_key(), None)
    }

    /// Decrypt one entry of a downloaded key backup.
    pub fn decrypt_session_data(
        &self,
        data: &EncryptedSessionData,
    ) -> Result<BackedUpRoomKey, DecryptionError> {
        let message = Message {
            ciphertext: base64_decode(&data.ciphertext).map_err(DecodeError::Base64)?,
            mac: base64_decode(&data.mac).map_err(DecodeError::Base64)?,
            ephemeral_key: Curve25519PublicKey::from_base64(&data.ephemeral)
                .map_err(DecodeError::PublicKey)?,
        };

        let decrypted = self
            .decryption()
            .decrypt(&message)
            .map_err(|e| DecryptionError::Decryption(e.to_string()))?;

        Ok(serde_json::from_slice(&decrypted)?)
    }
}

impl Default for RecoveryKey {
    fn default() -> Self {
        Self::new()
    }
}

/// The public half of the backup key pair, used to encrypt room keys before
/// they are uploaded.
#[derive(Clone, Debug)]
pub struct MegolmV1BackupKey {
    inner: Curve25519PublicKey,
    version: Arc<StdMutex<Option<String>>>,
}

impl MegolmV1BackupKey {
    /// Create a new backup key from its public curve25519 key and,
    /// optionally, the backup version it belongs to.
    pub fn new(public_key: Curve25519PublicKey, version: Option<String>) -> Self {
        Self { inner: public_key, version: Arc::new(StdMutex::new(version)) }
    }

    /// Parse a backup key from its unpadded base64 form.
    pub fn from_base64(public_key: &str) -> Result<Self, DecodeError> {
        Ok(Self::new(Curve25519PublicKey::from_base64(public_key)?, None))
    }

    /// The unpadded base64 form of the public key.
    pub fn to_base64(&self) -> String {
        self.inner.to_base64()
    }

    /// The backup version this key belongs to, if known.
    pub fn backup_version(&self) -> Option<String> {
        self.version.lock().unwrap().clone()
    }

    /// Remember which backup version this key belongs to.
    pub fn set_version(&self, version: String) {
        *self.version.lock().unwrap() = Some(version);
    }

    /// Encrypt the given session for upload into the backup.
    pub async fn encrypt(&self, session: &InboundGroupSession) -> KeyBackupData {
        let backed_up = session.to_backup().await;
        let json = serde_json::to_string(&backed_up)
            .expect("a backed up room key can always be serialized");

        let pk = PkEncryption::from_key(self.inner);
        let message = pk.encrypt(json.as_bytes());

        KeyBackupData {
            first_message_index: session.first_known_index(),
            forwarded_count: session.forwarding_key_chain().len() as u32,
            is_verified: false,
            session_data: EncryptedSessionData {
                ephemeral: base64_encode(message.ephemeral_key.as_bytes()),
                ciphertext: base64_encode(message.ciphertext),
                mac: base64_encode(message.mac),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RecoveryKey;

    #[test]
    fn base58_round_trip() {
        let key = RecoveryKey::new();
        let encoded = key.to_base58();
        let decoded = RecoveryKey::from_base58(&encoded).unwrap();

        assert_eq!(key.to_base64(), decoded.to_base64());
    }

    #[test]
    fn base64_round_trip() {
        let key = RecoveryKey::new();
        let decoded = RecoveryKey::from_base64(&key.to_base64()).unwrap();

        assert_eq!(key.to_base64(), decoded.to_base64());
    }

    #[test]
    fn tampered_base58_is_rejected() {
        let key = RecoveryKey::new();
        let encoded: String = key.to_base58().split_whitespace().collect();

        // Flip a bit in one of the key bytes without touching the parity
        // byte.
        let mut bytes = bs58::decode(encoded).into_vec().unwrap();
        bytes[10] ^= 0b0000_0001;
        let tampered = bs58::encode(bytes).into_string();

        RecoveryKey::from_base58(&tampered)
            .expect_err("a tampered recovery key should fail to decode");
    }
}
