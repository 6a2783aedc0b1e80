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

//! Strict serde types for the E2EE wire formats.
//!
//! These mirror the JSON shapes the Matrix client-server API uses for device
//! keys, one-time keys and encrypted events, but parse the embedded public
//! keys into their `vodozemac` representations eagerly, so the rest of the
//! crate never handles unvalidated base64.

use std::{collections::BTreeMap, fmt};

use ruma::{
    DeviceKeyAlgorithm, DeviceKeyId, OwnedDeviceId, OwnedDeviceKeyId, OwnedUserId, DeviceId,
    UserId,
};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey, Ed25519Signature, KeyError};

pub mod events;

/// A map from a user, to a map from their devices, to some per-device value.
///
/// This is the standard shape of every batched per-device operation: claimed
/// one-time keys, queried device keys, per-device to-device messages.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct UsersDevicesMap<E> {
    map: BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, E>>,
}

impl<E> Default for UsersDevicesMap<E> {
    fn default() -> Self {
        Self { map: Default::default() }
    }
}

impl<E> UsersDevicesMap<E> {
    /// Create a new, empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Does this map contain no entries at all.
    pub fn is_empty(&self) -> bool {
        self.map.values().all(|d| d.is_empty())
    }

    /// The total number of per-device entries.
    pub fn len(&self) -> usize {
        self.map.values().map(|d| d.len()).sum()
    }

    /// The users that have at least one entry in the map.
    pub fn users(&self) -> impl Iterator<Item = &UserId> {
        self.map.keys().map(|u| &**u)
    }

    /// Get the device map of the given user.
    pub fn get(&self, user_id: &UserId) -> Option<&BTreeMap<OwnedDeviceId, E>> {
        self.map.get(user_id)
    }

    /// Get the entry for the given user and device, if any.
    pub fn get_device(&self, user_id: &UserId, device_id: &DeviceId) -> Option<&E> {
        self.map.get(user_id).and_then(|d| d.get(device_id))
    }

    /// Insert a value for the given user and device.
    ///
    /// Returns the previous value if one was present.
    pub fn insert(&mut self, user_id: &UserId, device_id: &DeviceId, value: E) -> Option<E> {
        self.map.entry(user_id.to_owned()).or_default().insert(device_id.to_owned(), value)
    }

    /// Remove the entry for the given user and device.
    pub fn remove(&mut self, user_id: &UserId, device_id: &DeviceId) -> Option<E> {
        self.map.get_mut(user_id).and_then(|d| d.remove(device_id))
    }

    /// Iterate over `(user, device, value)` triples.
    pub fn iter(&self) -> impl Iterator<Item = (&UserId, &DeviceId, &E)> {
        self.map
            .iter()
            .flat_map(|(u, devices)| devices.iter().map(move |(d, e)| (&**u, &**d, e)))
    }

    /// Destructure into the underlying two-level `BTreeMap`.
    pub fn into_inner(self) -> BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceId, E>> {
        self.map
    }
}

impl<E> FromIterator<(OwnedUserId, OwnedDeviceId, E)> for UsersDevicesMap<E> {
    fn from_iter<T: IntoIterator<Item = (OwnedUserId, OwnedDeviceId, E)>>(iter: T) -> Self {
        let mut map = Self::new();

        for (user_id, device_id, value) in iter {
            map.insert(&user_id, &device_id, value);
        }

        map
    }
}

/// An E2EE message algorithm.
///
/// This is deliberately an enum rather than a string so that every dispatch
/// site has to match on it exhaustively; adding an algorithm is a
/// compile-time-checked change. Values we don't implement deserialize into
/// [`EventEncryptionAlgorithm::Unknown`] and are rejected at the dispatch
/// sites.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventEncryptionAlgorithm {
    /// The one-to-one Olm algorithm, `m.olm.v1.curve25519-aes-sha2`.
    OlmV1Curve25519AesSha2,
    /// The Megolm group algorithm, `m.megolm.v1.aes-sha2`.
    MegolmV1AesSha2,
    /// An algorithm this crate doesn't implement.
    Unknown(String),
}

impl EventEncryptionAlgorithm {
    /// The wire name of the algorithm.
    pub fn as_str(&self) -> &str {
        match self {
            EventEncryptionAlgorithm::OlmV1Curve25519AesSha2 => "m.olm.v1.curve25519-aes-sha2",
            EventEncryptionAlgorithm::MegolmV1AesSha2 => "m.megolm.v1.aes-sha2",
            EventEncryptionAlgorithm::Unknown(a) => a,
        }
    }
}

impl From<&str> for EventEncryptionAlgorithm {
    fn from(value: &str) -> Self {
        match value {
            "m.olm.v1.curve25519-aes-sha2" => EventEncryptionAlgorithm::OlmV1Curve25519AesSha2,
            "m.megolm.v1.aes-sha2" => EventEncryptionAlgorithm::MegolmV1AesSha2,
            other => EventEncryptionAlgorithm::Unknown(other.to_owned()),
        }
    }
}

impl fmt::Display for EventEncryptionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventEncryptionAlgorithm {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventEncryptionAlgorithm {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(EventEncryptionAlgorithm::from(s.as_str()))
    }
}

/// The signatures of a signed JSON object, keyed by user then key id.
pub type Signatures = BTreeMap<OwnedUserId, BTreeMap<OwnedDeviceKeyId, String>>;

/// The identity keys of a device, in the `/keys/upload` and `/keys/query`
/// wire format.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceKeys {
    /// The user that owns the device.
    pub user_id: OwnedUserId,
    /// The device these keys belong to.
    pub device_id: OwnedDeviceId,
    /// The encryption algorithms the device supports.
    pub algorithms: Vec<EventEncryptionAlgorithm>,
    /// Public identity keys, keyed by `<algorithm>:<device_id>`.
    pub keys: BTreeMap<OwnedDeviceKeyId, String>,
    /// Signatures over the canonical form of this object.
    #[serde(default)]
    pub signatures: Signatures,
}

impl DeviceKeys {
    /// Create a new `DeviceKeys` object without any signatures.
    pub fn new(
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
        algorithms: Vec<EventEncryptionAlgorithm>,
        keys: BTreeMap<OwnedDeviceKeyId, String>,
    ) -> Self {
        Self { user_id, device_id, algorithms, keys, signatures: Signatures::new() }
    }

    fn get_key(&self, algorithm: DeviceKeyAlgorithm) -> Option<&str> {
        self.keys
            .get(&DeviceKeyId::from_parts(algorithm, &self.device_id))
            .map(String::as_str)
    }

    /// The long-term curve25519 identity key of the device, if present and
    /// valid base64.
    pub fn curve25519_key(&self) -> Option<Curve25519PublicKey> {
        self.get_key(DeviceKeyAlgorithm::Curve25519)
            .and_then(|k| Curve25519PublicKey::from_base64(k).ok())
    }

    /// The ed25519 signing key of the device, if present and valid base64.
    pub fn ed25519_key(&self) -> Option<Ed25519PublicKey> {
        self.get_key(DeviceKeyAlgorithm::Ed25519)
            .and_then(|k| Ed25519PublicKey::from_base64(k).ok())
    }

    /// Get the self-signature of the device, the ed25519 signature the device
    /// created over its own key object.
    pub fn self_signature(&self) -> Option<Ed25519Signature> {
        self.signatures
            .get(&self.user_id)
            .and_then(|s| s.get(&DeviceKeyId::from_parts(DeviceKeyAlgorithm::Ed25519, &self.device_id)))
            .and_then(|s| Ed25519Signature::from_base64(s).ok())
    }
}

/// A one-time or fallback key, signed by the device that published it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedOneTimeKey {
    /// The public curve25519 key.
    #[serde(
        serialize_with = "serialize_curve_key",
        deserialize_with = "deserialize_curve_key"
    )]
    pub key: Curve25519PublicKey,
    /// True if this is a fallback key rather than a single-use one.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fallback: bool,
    /// Signatures over the canonical form of this object.
    #[serde(default)]
    pub signatures: Signatures,
}

/// A batch of signed one-time keys ready for upload, keyed by
/// `signed_curve25519:<key_id>`.
pub type OneTimeKeys = BTreeMap<String, SignedOneTimeKey>;

/// Serialize a curve25519 public key as unpadded base64.
pub fn serialize_curve_key<S: Serializer>(
    key: &Curve25519PublicKey,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&key.to_base64())
}

/// Deserialize a curve25519 public key from unpadded base64.
pub fn deserialize_curve_key<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Curve25519PublicKey, D::Error> {
    let key = String::deserialize(deserializer)?;
    Curve25519PublicKey::from_base64(&key).map_err(|e: KeyError| de::Error::custom(e.to_string()))
}

/// Serialize an ed25519 public key as unpadded base64.
pub fn serialize_ed25519_key<S: Serializer>(
    key: &Ed25519PublicKey,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&key.to_base64())
}

/// Deserialize an ed25519 public key from unpadded base64.
pub fn deserialize_ed25519_key<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Ed25519PublicKey, D::Error> {
    let key = String::deserialize(deserializer)?;
    Ed25519PublicKey::from_base64(&key).map_err(|e: KeyError| de::Error::custom(e.to_string()))
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, user_id};
    use serde_json::json;

    use super::{DeviceKeys, EventEncryptionAlgorithm, SignedOneTimeKey, UsersDevicesMap};

    #[test]
    fn algorithm_round_trip() {
        let megolm: EventEncryptionAlgorithm =
            serde_json::from_value(json!("m.megolm.v1.aes-sha2")).unwrap();
        assert_eq!(megolm, EventEncryptionAlgorithm::MegolmV1AesSha2);

        let unknown: EventEncryptionAlgorithm =
            serde_json::from_value(json!("m.megolm.v2.aes-sha2")).unwrap();
        assert_eq!(unknown, EventEncryptionAlgorithm::Unknown("m.megolm.v2.aes-sha2".to_owned()));

        assert_eq!(
            serde_json::to_value(&EventEncryptionAlgorithm::OlmV1Curve25519AesSha2).unwrap(),
            json!("m.olm.v1.curve25519-aes-sha2")
        );
    }

    #[test]
    fn device_keys_deserialization() {
        let json = json!({
            "algorithms": ["m.olm.v1.curve25519-aes-sha2", "m.megolm.v1.aes-sha2"],
            "device_id": "BNYQQWUMXO",
            "user_id": "@example:localhost",
            "keys": {
                "curve25519:BNYQQWUMXO": "xfgbLIC5WAl1OIkpOzoxpCe8FsRDT6nch7NQsOb15nc",
                "ed25519:BNYQQWUMXO": "2/5LWJMow5zhJqakV88SIc7q/1pa8fmkfgAzx72w9G4"
            },
            "signatures": {
                "@example:localhost": {
                    "ed25519:BNYQQWUMXO": "kTwMrbsLJJM/uFGOj/oqlCaRuw7i9p/6eGrTlXjo8UJMCFAetoyWzoMcF35vSe4S6FTx8RJmqX6rM7ep53MHDQ"
                }
            }
        });

        let device_keys: DeviceKeys = serde_json::from_value(json).unwrap();

        assert_eq!(device_keys.user_id, user_id!("@example:localhost"));
        assert_eq!(device_keys.device_id, device_id!("BNYQQWUMXO"));
        assert!(device_keys.curve25519_key().is_some());
        assert!(device_keys.ed25519_key().is_some());
        assert!(device_keys.self_signature().is_some());
    }

    #[test]
    fn one_time_key_fallback_flag() {
        let json = json!({
            "key": "xfgbLIC5WAl1OIkpOzoxpCe8FsRDT6nch7NQsOb15nc",
            "signatures": {}
        });

        let key: SignedOneTimeKey = serde_json::from_value(json).unwrap();
        assert!(!key.fallback);
    }

    #[test]
    fn users_devices_map_accessors() {
        let mut map = UsersDevicesMap::new();
        assert!(map.is_empty());

        map.insert(user_id!("@alice:localhost"), device_id!("ALICEDEV"), 1u8);
        map.insert(user_id!("@alice:localhost"), device_id!("ALICEDEV2"), 2u8);
        map.insert(user_id!("@bob:localhost"), device_id!("BOBDEVICE"), 3u8);

        assert_eq!(map.len(), 3);
        assert_eq!(
            map.get_device(user_id!("@alice:localhost"), device_id!("ALICEDEV2")),
            Some(&2)
        );
        assert_eq!(map.users().count(), 2);
        assert_eq!(map.remove(user_id!("@bob:localhost"), device_id!("BOBDEVICE")), Some(3));
    }
}
