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

use ruma::{CanonicalJsonError, OwnedDeviceId, OwnedRoomId, OwnedUserId};
use serde_json::Error as JsonError;
use thiserror::Error;
use vodozemac::Curve25519PublicKey;

use crate::{store::CryptoStoreError, transport::TransportError, types::EventEncryptionAlgorithm};

/// The result type for one-to-one encryption operations.
pub type OlmResult<T> = std::result::Result<T, OlmError>;

/// The result type for group encryption operations.
pub type MegolmResult<T> = std::result::Result<T, MegolmError>;

/// Error representing a failure during a device to device cryptographic
/// operation.
#[derive(Error, Debug)]
pub enum OlmError {
    /// The event that should have been decrypted is malformed or failed one
    /// of the mandatory post-decryption checks.
    #[error(transparent)]
    Event(#[from] EventError),

    /// The received decrypted event couldn't be deserialized.
    #[error(transparent)]
    Json(#[from] JsonError),

    /// The underlying storage layer returned an error.
    #[error("failed to read or write to the crypto store: {0}")]
    Store(#[from] CryptoStoreError),

    /// The network collaborator returned an error.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A new Olm session couldn't be created.
    #[error("couldn't create an Olm session: {0}")]
    SessionCreation(#[from] SessionCreationError),

    /// None of the sessions we share with the given sender could decrypt the
    /// message; the session on the sender's side is likely wedged.
    #[error("decryption failed likely because an Olm session from {0} with sender key {1} was wedged")]
    SessionWedged(OwnedUserId, Curve25519PublicKey),

    /// An Olm message got replayed while the olm machine was handling it.
    #[error("decryption failed because the message from {0} with sender key {1} was replayed")]
    ReplayedMessage(OwnedUserId, Curve25519PublicKey),

    /// An Olm message needs to be sent to a device we don't know about.
    #[error("tried to encrypt a message for an unknown device {0} {1}")]
    MissingDevice(OwnedUserId, OwnedDeviceId),

    /// An Olm message needs to be sent to a device we don't share a session
    /// with and no one-time key is available to create one.
    #[error("no Olm session exists with the device {0} {1}")]
    MissingSession(OwnedUserId, OwnedDeviceId),
}

/// Error representing a failure during a group encryption operation.
#[derive(Error, Debug)]
pub enum MegolmError {
    /// The room key to decrypt the event is missing; legitimately resolved by
    /// requesting the key from other devices.
    #[error("decryption failed because the room key to decrypt the message is missing")]
    MissingRoomKey,

    /// The event couldn't be decrypted with the room key we hold, or failed
    /// one of the mandatory post-decryption checks.
    #[error(transparent)]
    Event(#[from] EventError),

    /// The decrypted payload couldn't be deserialized.
    #[error(transparent)]
    Json(#[from] JsonError),

    /// The Megolm ratchet refused to decrypt the ciphertext.
    #[error(transparent)]
    Decryption(#[from] vodozemac::megolm::DecryptionError),

    /// The underlying storage layer returned an error.
    #[error("failed to read or write to the crypto store: {0}")]
    Store(#[from] CryptoStoreError),

    /// The room isn't configured for encryption, or is configured for an
    /// algorithm this crate doesn't implement.
    #[error("encryption isn't enabled for room {0}")]
    EncryptionNotEnabled(OwnedRoomId),

    /// An attempt was made to change the established encryption algorithm of
    /// a room; algorithms never change once set, anything else would allow
    /// downgrades to a weaker algorithm.
    #[error("the encryption algorithm of room {0} is already set and can't be changed to {1}")]
    AlgorithmChange(OwnedRoomId, EventEncryptionAlgorithm),

    /// Messages can't be encrypted before the room key was shared with the
    /// recipients.
    #[error("the outbound group session for room {0} hasn't been shared yet")]
    SessionNotShared(OwnedRoomId),

    /// A new Megolm session couldn't be created.
    #[error("couldn't create a Megolm session: {0}")]
    SessionCreation(#[from] SessionCreationError),

    /// An underlying one-to-one encryption operation failed, e.g. while
    /// sharing the room key with the recipient devices.
    #[error(transparent)]
    Olm(Box<OlmError>),
}

impl From<OlmError> for MegolmError {
    fn from(e: OlmError) -> Self {
        MegolmError::Olm(Box::new(e))
    }
}

/// Error describing why an encrypted event is rejected, either before or
/// after it was decrypted.
#[derive(Error, Debug)]
pub enum EventError {
    /// The Olm message had a type other than pre-key or normal.
    #[error("the Olm message has an unsupported type")]
    UnsupportedOlmType,

    /// The event claims an algorithm this crate doesn't implement, or one
    /// weaker than the room is configured for.
    #[error("the message was encrypted using an unsupported algorithm {0}")]
    UnsupportedAlgorithm(EventEncryptionAlgorithm),

    /// The expected ciphertext is absent from the payload.
    #[error("the encrypted message is missing the ciphertext")]
    MissingCiphertext,

    /// The per-device ciphertext map doesn't contain an entry for our own
    /// curve25519 key.
    #[error("the encrypted message doesn't contain a ciphertext for our device")]
    NotIncludedInRecipients,

    /// A required field is absent from the decrypted payload.
    #[error("the decrypted payload is missing the field {0}")]
    MissingField(String),

    /// The payload lacks the signing key that binds its authenticity.
    #[error("the decrypted payload is missing the signing key of the sender")]
    MissingSigningKey,

    /// The sender inside the decrypted payload doesn't match the sender of
    /// the encrypted event; somebody may be relaying a captured message.
    #[error("the sender of the decrypted payload ({0}) doesn't match the sender of the event ({1})")]
    MismatchedSender(OwnedUserId, OwnedUserId),

    /// The payload names a recipient other than us; the message was either
    /// misdirected or republished.
    #[error("the decrypted payload was meant for {0}, but we are {1}")]
    MismatchedRecipient(OwnedUserId, OwnedUserId),

    /// The recipient keys inside the payload don't match our own identity
    /// keys.
    #[error("the keys in the decrypted payload don't match our own identity keys")]
    MismatchedKeys,

    /// The room id inside the decrypted payload doesn't match the room the
    /// event was received in; the event may be replayed from another room.
    #[error("the decrypted payload was scoped to room {0:?}, but the event was received in {1}")]
    MismatchedRoom(Option<OwnedRoomId>, OwnedRoomId),

    /// A device advertised identity keys that don't match what we have on
    /// record for it.
    #[error("the sender's keys don't match the keys we have on record")]
    UnexpectedIdentityKeys,
}

/// Error that can occur while creating a new Olm or Megolm session.
#[derive(Error, Debug)]
pub enum SessionCreationError {
    /// The target device doesn't advertise a curve25519 identity key.
    #[error("the device {0} {1} doesn't have a curve25519 key")]
    DeviceMissingCurveKey(OwnedUserId, OwnedDeviceId),

    /// No one-time key for the target device was claimed.
    #[error("no one-time key was claimed for the device {0} {1}")]
    OneTimeKeyMissing(OwnedUserId, OwnedDeviceId),

    /// The claimed one-time key wasn't signed by the device it supposedly
    /// belongs to.
    #[error("the one-time key for the device {0} {1} carried an invalid signature: {2}")]
    InvalidSignature(OwnedUserId, OwnedDeviceId, #[source] SignatureError),

    /// The underlying Olm library refused to create an inbound session from
    /// the pre-key message.
    #[error(transparent)]
    InboundCreation(#[from] vodozemac::olm::SessionCreationError),

    /// The requested algorithm can't be used to create a group session.
    #[error("can't create a session for the unsupported algorithm {0}")]
    Algorithm(EventEncryptionAlgorithm),
}

/// Error that can occur while checking a signed JSON object.
#[derive(Error, Debug)]
pub enum SignatureError {
    /// The value that should have been signed isn't a JSON object.
    #[error("the signed JSON value isn't an object")]
    NotAnObject,

    /// The object carries no signature from the expected user and key.
    #[error("the signed JSON object doesn't contain the requested signature")]
    NoSignatureFound,

    /// The object can't be converted into canonical JSON.
    #[error("the JSON object can't be converted into canonical form: {0}")]
    CanonicalJson(#[from] CanonicalJsonError),

    /// The signature is valid base64 but doesn't verify against the key.
    #[error("the signature didn't match the provided key")]
    VerificationError,

    /// The signature isn't valid base64.
    #[error("the signature couldn't be decoded: {0}")]
    InvalidSignature(#[from] vodozemac::KeyError),

    /// The key object that was updated doesn't belong to the same device.
    #[error("the signed JSON object belongs to a different user or device")]
    UserIdMismatch,

    /// The identity keys of a known device changed; this must never happen
    /// for a legitimate device and voids any established trust.
    #[error("the signing key of a known device changed")]
    SigningKeyChanged,
}

impl From<vodozemac::SignatureError> for SignatureError {
    fn from(_: vodozemac::SignatureError) -> Self {
        SignatureError::VerificationError
    }
}
