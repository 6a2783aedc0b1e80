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

#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations)]

mod backups;
mod error;
mod file_encryption;
mod gossip;
mod identities;
mod machine;
pub mod olm;
mod session_manager;
pub mod store;
pub mod transport;
pub mod types;

pub use backups::{
    BackupError, BackupMachine, DecodeError, DecryptionError, MegolmV1BackupKey, RecoveryKey,
};
pub use error::{
    EventError, MegolmError, MegolmResult, OlmError, OlmResult, SessionCreationError,
    SignatureError,
};
pub use file_encryption::{decrypt_room_key_export, encrypt_room_key_export, KeyExportError};
pub use gossip::{KeyForwardDecision, KeyRequestState, OutgoingKeyRequest};
pub use identities::{DeviceData, LocalTrust, UserDevices};
pub use machine::{DecryptedRoomEvent, MembershipChange, OlmMachine};
