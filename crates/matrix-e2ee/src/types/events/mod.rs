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

//! Typed content for the E2EE related Matrix events.

pub mod dummy;
pub mod encrypted;
pub mod forwarded_room_key;
pub mod olm_v1;
pub mod room_key;
pub mod room_key_request;

use ruma::OwnedUserId;
use serde::{Deserialize, Serialize};

/// A trait for event contents to declare their event type.
pub trait EventType {
    /// The event type of the event content.
    const EVENT_TYPE: &'static str;

    /// Get the event type of the event content.
    fn event_type(&self) -> &str {
        Self::EVENT_TYPE
    }
}

/// A to-device event, as delivered in the to-device section of a sync
/// response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToDeviceEvent<C> {
    /// The user that sent the event.
    pub sender: OwnedUserId,
    /// The content of the event.
    pub content: C,
}

impl<C> ToDeviceEvent<C> {
    /// Create a new to-device event.
    pub fn new(sender: OwnedUserId, content: C) -> Self {
        Self { sender, content }
    }
}

pub(crate) fn from_str<'a, T, E>(string: &'a str) -> Result<T, E>
where
    T: serde::Deserialize<'a>,
    E: serde::de::Error,
{
    serde_json::from_str(string).map_err(serde::de::Error::custom)
}
