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

//! Everything we track about the devices of other users: their published
//! keys, their trust state, and the machinery to keep the device lists in
//! sync with the server.

pub(crate) mod device;
pub(crate) mod manager;

pub use device::{DeviceData, LocalTrust, UserDevices};
pub(crate) use manager::IdentityManager;
