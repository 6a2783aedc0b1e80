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

//! Wrappers over the vodozemac Olm and Megolm primitives, adding the
//! Matrix-specific bookkeeping: timestamps, room bindings, share state and
//! persistence formats.

mod account;
mod group_sessions;
mod session;
pub(crate) mod utility;

pub use account::{Account, OlmMessageHash, PickledAccount};
pub(crate) use account::SessionType;
pub use group_sessions::{
    BackedUpRoomKey, EncryptionSettings, ExportedRoomKey, InboundGroupSession,
    OutboundGroupSession, PickledInboundGroupSession, PickledOutboundGroupSession,
    SenderClaimedKeys, ShareInfo,
};
pub(crate) use group_sessions::ShareState;
pub use session::{PickledSession, Session};
pub use vodozemac::olm::IdentityKeys;
