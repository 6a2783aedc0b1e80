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

//! The armored, passphrase-encrypted room key export file format.
//!
//! A PBKDF2-SHA512 derived key pair encrypts the JSON list of exported room
//! keys with AES-256-CTR and authenticates the whole blob with HMAC-SHA256.

use aes::{
    cipher::{KeyIvInit, StreamCipher},
    Aes256,
};
use ctr::Ctr128BE;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::{thread_rng, RngCore};
use sha2::{Sha256, Sha512};
use thiserror::Error;
use vodozemac::{base64_decode, base64_encode};
use zeroize::Zeroizing;

use crate::olm::ExportedRoomKey;

type Aes256Ctr = Ctr128BE<Aes256>;
type HmacSha256 = Hmac<Sha256>;

const HEADER: &str = "-----BEGIN MEGOLM SESSION DATA-----";
const FOOTER: &str = "-----END MEGOLM SESSION DATA-----";

const VERSION: u8 = 1;
const SALT_SIZE: usize = 16;
const IV_SIZE: usize = 16;
const MAC_SIZE: usize = 32;
const KEY_SIZE: usize = 32;
const DERIVED_SIZE: usize = 64;

/// Error describing why a room key export file couldn't be read.
#[derive(Debug, Error)]
pub enum KeyExportError {
    /// The armor header or footer is missing.
    #[error("the key export is missing its header or footer")]
    InvalidHeaders,

    /// The export claims a version of the format we don't implement.
    #[error("the key export has an unsupported format version")]
    UnsupportedVersion,

    /// The binary payload is too short to contain all required fields.
    #[error("the key export is too short")]
    InvalidLength,

    /// The MAC over the export doesn't verify; the passphrase is wrong or
    /// the file was tampered with.
    #[error("the MAC of the key export doesn't match")]
    InvalidMac,

    /// The payload isn't valid base64.
    #[error(transparent)]
    Base64(#[from] vodozemac::Base64DecodeError),

    /// The decrypted payload isn't a valid list of room keys.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

fn derive_keys(passphrase: &str, salt: &[u8], rounds: u32) -> Zeroizing<[u8; DERIVED_SIZE]> {
    let mut derived = Zeroizing::new([0u8; DERIVED_SIZE]);
    pbkdf2_hmac::<Sha512>(passphrase.as_bytes(), salt, rounds, &mut *derived);

    derived
}

/// Encrypt a list of exported room keys into the armored export format.
///
/// # Arguments
///
/// * `keys` - The exported room keys that should be written to the file.
///
/// * `passphrase` - The passphrase protecting the file.
///
/// * `rounds` - The number of PBKDF2 rounds used for key derivation; the
///   Matrix spec recommends at least 100,000.
pub fn encrypt_room_key_export(
    keys: &[ExportedRoomKey],
    passphrase: &str,
    rounds: u32,
) -> Result<String, KeyExportError> {
    let mut plaintext = Zeroizing::new(serde_json::to_vec(keys)?);

    let mut salt = [0u8; SALT_SIZE];
    let mut iv = [0u8; IV_SIZE];

    let mut rng = thread_rng();
    rng.fill_bytes(&mut salt);
    rng.fill_bytes(&mut iv);

    // Clear bit 63 of the counter so the CTR counter can't overflow even
    // for absurdly large exports.
    iv[8] &= 0b0111_1111;

    let derived = derive_keys(passphrase, &salt, rounds);
    let (aes_key, hmac_key) = derived.split_at(KEY_SIZE);

    let mut cipher = Aes256Ctr::new_from_slices(aes_key, &iv)
        .expect("the derived key and IV always have the right length");
    cipher.apply_keystream(&mut plaintext);
    let ciphertext = plaintext;

    let mut payload = Vec::with_capacity(
        1 + SALT_SIZE + IV_SIZE + 4 + ciphertext.len() + MAC_SIZE,
    );
    payload.push(VERSION);
    payload.extend_from_slice(&salt);
    payload.extend_from_slice(&iv);
    payload.extend_from_slice(&rounds.to_be_bytes());
    payload.extend_from_slice(&ciphertext);

    let mut hmac = HmacSha256::new_from_slice(hmac_key)
        .expect("HMAC keys of any length are accepted");
    hmac.update(&payload);
    payload.extend_from_slice(&hmac.finalize().into_bytes());

    Ok(format!("{HEADER}\n{}\n{FOOTER}", base64_encode(payload)))
}

/// Decrypt an armored room key export file.
pub fn decrypt_room_key_export(
    export: &str,
    passphrase: &str,
) -> Result<Vec<ExportedRoomKey>, KeyExportError> {
    let payload: String = export
        .lines()
        .map(str::trim)
        .skip_while(|l| *l != HEADER)
        .skip(1)
        .take_while(|l| *l != FOOTER)
        .collect();

    if payload.is_empty() || !export.contains(HEADER) || !export.contains(FOOTER) {
        return Err(KeyExportError::InvalidHeaders);
    }

    let payload = base64_decode(payload)?;

    if payload.len() < 1 + SALT_SIZE + IV_SIZE + 4 + MAC_SIZE {
        return Err(KeyExportError::InvalidLength);
    }

    if payload[0] != VERSION {
        return Err(KeyExportError::UnsupportedVersion);
    }

    let (authenticated, mac) = payload.split_at(payload.len() - MAC_SIZE);

    let salt = &authenticated[1..1 + SALT_SIZE];
    let iv = &authenticated[1 + SALT_SIZE..1 + SALT_SIZE + IV_SIZE];
    let mut rounds = [0u8; 4];
    rounds.copy_from_slice(&authenticated[1 + SALT_SIZE + IV_SIZE..1 + SALT_SIZE + IV_SIZE + 4]);
    let rounds = u32::from_be_bytes(rounds);
    let ciphertext = &authenticated[1 + SALT_SIZE + IV_SIZE + 4..];

    let derived = derive_keys(passphrase, salt, rounds);
    let (aes_key, hmac_key) = derived.split_at(KEY_SIZE);

    let mut hmac = HmacSha256::new_from_slice(hmac_key)
        .expect("HMAC keys of any length are accepted");
    hmac.update(authenticated);
    hmac.verify_slice(mac).map_err(|_| KeyExportError::InvalidMac)?;

    let mut plaintext = Zeroizing::new(ciphertext.to_vec());

    let mut cipher = Aes256Ctr::new_from_slices(aes_key, iv)
        .expect("the derived key and IV always have the right length");
    cipher.apply_keystream(&mut plaintext);

    Ok(serde_json::from_slice(&plaintext)?)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use ruma::room_id;
    use vodozemac::megolm::{GroupSession, SessionConfig};

    use super::{decrypt_room_key_export, encrypt_room_key_export, KeyExportError};
    use crate::olm::InboundGroupSession;

    async fn exported_keys() -> Vec<crate::olm::ExportedRoomKey> {
        let account = vodozemac::olm::Account::new();
        let outbound = GroupSession::new(SessionConfig::version_1());

        let session = InboundGroupSession::new(
            account.curve25519_key(),
            account.ed25519_key(),
            room_id!("!room:localhost"),
            &outbound.session_key(),
        );

        vec![session.export().await]
    }

    #[tokio::test]
    async fn export_round_trip() {
        let keys = exported_keys().await;

        let export = encrypt_room_key_export(&keys, "1234", 1000).unwrap();
        let decrypted = decrypt_room_key_export(&export, "1234").unwrap();

        assert_eq!(decrypted.len(), 1);
        assert_eq!(decrypted[0].session_id, keys[0].session_id);
        assert_eq!(decrypted[0].room_id, keys[0].room_id);
    }

    #[tokio::test]
    async fn wrong_passphrase_is_detected() {
        let keys = exported_keys().await;

        let export = encrypt_room_key_export(&keys, "1234", 1000).unwrap();
        let error = decrypt_room_key_export(&export, "4321").unwrap_err();

        assert_matches!(error, KeyExportError::InvalidMac);
    }

    #[test]
    fn garbage_is_rejected() {
        let error = decrypt_room_key_export("not an export", "1234").unwrap_err();
        assert_matches!(error, KeyExportError::InvalidHeaders);
    }
}
