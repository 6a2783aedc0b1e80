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

use serde::{Deserialize, Serialize};

use super::EventType;

/// The content of an `m.dummy` event.
///
/// Dummy events carry no payload; they exist to force the establishment of a
/// fresh Olm session when the previous one got wedged.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DummyEventContent {}

impl DummyEventContent {
    /// Create a new, empty `m.dummy` content.
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventType for DummyEventContent {
    const EVENT_TYPE: &'static str = "m.dummy";
}
