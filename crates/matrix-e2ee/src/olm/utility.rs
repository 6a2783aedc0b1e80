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

use ruma::{CanonicalJsonValue, DeviceKeyId, UserId};
use serde_json::Value;
use vodozemac::{Ed25519PublicKey, Ed25519Signature};

use crate::error::SignatureError;

/// Convert a JSON object into the canonical string form that Matrix
/// signatures are computed over.
///
/// The `signatures` and `unsigned` fields are stripped before
/// canonicalization.
pub(crate) fn canonical_json(mut value: Value) -> Result<String, SignatureError> {
    let json_object = value.as_object_mut().ok_or(SignatureError::NotAnObject)?;

    json_object.remove("signatures");
    json_object.remove("unsigned");

    let canonical_json: CanonicalJsonValue = value.try_into()?;

    Ok(canonical_json.to_string())
}

/// Verify that the given JSON object carries a valid signature from the given
/// user and key.
pub(crate) fn verify_signed_json(
    signing_key: Ed25519PublicKey,
    user_id: &UserId,
    key_id: &DeviceKeyId,
    signed: &Value,
) -> Result<(), SignatureError> {
    let signature = signed
        .get("signatures")
        .and_then(|s| s.get(user_id.as_str()))
        .and_then(|s| s.get(key_id.as_str()))
        .and_then(|s| s.as_str())
        .ok_or(SignatureError::NoSignatureFound)?;

    let signature = Ed25519Signature::from_base64(signature)?;
    let canonical = canonical_json(signed.clone())?;

    Ok(signing_key.verify(canonical.as_bytes(), &signature)?)
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, user_id, DeviceKeyAlgorithm, DeviceKeyId};
    use serde_json::json;
    use vodozemac::olm::Account;

    use super::verify_signed_json;

    #[test]
    fn json_signature_verification() {
        let account = Account::new();
        let user_id = user_id!("@alice:localhost");
        let key_id = DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, device_id!("DEVICEID"));

        let mut json = json!({
            "algorithms": ["m.megolm.v1.aes-sha2"],
            "unsigned": { "device_display_name": "Alice's phone" },
        });

        let canonical = super::canonical_json(json.clone()).unwrap();
        let signature = account.sign(&canonical);

        json.as_object_mut().unwrap().insert(
            "signatures".to_owned(),
            json!({ user_id.as_str(): { key_id.as_str(): signature.to_base64() } }),
        );

        verify_signed_json(account.ed25519_key(), user_id, &key_id, &json)
            .expect("the self-signed object should verify");

        json.as_object_mut().unwrap().insert("algorithms".to_owned(), json!([]));
        verify_signed_json(account.ed25519_key(), user_id, &key_id, &json)
            .expect_err("a modified object should not verify");
    }
}
