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

//! The room key request protocol: asking other devices for keys we are
//! missing, and answering their requests for keys we hold.

mod machine;

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, RwLock as StdRwLock},
};

pub(crate) use machine::GossipMachine;
use ruma::{
    OwnedDeviceId, OwnedTransactionId, OwnedUserId, DeviceId, TransactionId, UserId,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    error::OlmResult,
    transport::ToDeviceRequest,
    types::events::{
        room_key_request::{RequestedKeyInfo, RoomKeyRequestContent},
        ToDeviceEvent,
    },
};

/// The lifecycle of an outgoing room key request.
///
/// ```text
///    Unsent ──► Sent ──► CancellationPending ──► (removed)
///                │                 ▲
///                │                 │ need re-appeared before the
///                │                 │ cancellation went out
///                └──► CancellationPendingAndWillResend ──► Unsent
/// ```
///
/// The resend only materializes once the cancellation of the stale request
/// was acknowledged by the transport; a resend can never overtake its own
/// cancellation.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum KeyRequestState {
    /// The request was created but not yet sent out.
    Unsent,
    /// The request went out and we're waiting for a key or a reason to
    /// cancel.
    Sent,
    /// The need for the key evaporated; a cancellation still has to go out,
    /// after which the request is removed.
    CancellationPending,
    /// The stale request needs to be cancelled, but the key is wanted
    /// again; a fresh request follows the cancellation.
    CancellationPendingAndWillResend,
}

/// An outgoing room key request, tracked until it is answered or cancelled.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutgoingKeyRequest {
    /// The user we request the key from; key requests go to all of their
    /// devices.
    pub request_recipient: OwnedUserId,
    /// The unique id of the request.
    pub request_id: OwnedTransactionId,
    /// Which key is being requested.
    pub info: RequestedKeyInfo,
    /// Where in its lifecycle the request is.
    pub state: KeyRequestState,
}

impl OutgoingKeyRequest {
    pub(crate) fn new(recipient: OwnedUserId, info: RequestedKeyInfo) -> Self {
        Self {
            request_recipient: recipient,
            request_id: TransactionId::new(),
            info,
            state: KeyRequestState::Unsent,
        }
    }

    /// Does this request still need some to-device message to go out.
    pub fn needs_sending(&self) -> bool {
        match self.state {
            KeyRequestState::Unsent
            | KeyRequestState::CancellationPending
            | KeyRequestState::CancellationPendingAndWillResend => true,
            KeyRequestState::Sent => false,
        }
    }

    fn to_request(&self, own_device_id: &DeviceId) -> OlmResult<ToDeviceRequest> {
        let content = RoomKeyRequestContent::new_request(
            self.info.clone(),
            own_device_id.to_owned(),
            self.request_id.clone(),
        );

        Ok(ToDeviceRequest::with_id(
            &self.request_recipient,
            &ToDeviceRequest::all_devices(),
            "m.room_key_request",
            serde_json::to_value(&content)?,
            self.request_id.clone(),
        ))
    }

    fn to_cancellation(&self, own_device_id: &DeviceId) -> OlmResult<ToDeviceRequest> {
        let content = RoomKeyRequestContent::new_cancellation(
            own_device_id.to_owned(),
            self.request_id.clone(),
        );

        Ok(ToDeviceRequest::new(
            &self.request_recipient,
            &ToDeviceRequest::all_devices(),
            "m.room_key_request",
            serde_json::to_value(&content)?,
        ))
    }
}

impl PartialEq for OutgoingKeyRequest {
    fn eq(&self, other: &Self) -> bool {
        self.request_id == other.request_id && self.info == other.info
    }
}

/// Why an incoming key request won't be honored.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyForwardDecision {
    /// We don't hold the requested session at all.
    #[error("the requested room key isn't in the store")]
    MissingSession,
    /// The request came from a user other than ourselves; we only re-share
    /// keys between our own devices.
    #[error("room keys are only shared with our own devices")]
    NotOurDevice,
    /// The requesting device is ours but the user never verified it.
    #[error("the requesting device isn't trusted")]
    UntrustedDevice,
    /// The requesting device is blacklisted.
    #[error("the requesting device is blacklisted")]
    BlacklistedDevice,
}

/// The identity of one incoming key request, used for deduplication.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct RequestInfo {
    sender: OwnedUserId,
    requesting_device_id: OwnedDeviceId,
    request_id: OwnedTransactionId,
}

impl RequestInfo {
    fn new(
        sender: OwnedUserId,
        requesting_device_id: OwnedDeviceId,
        request_id: OwnedTransactionId,
    ) -> Self {
        Self { sender, requesting_device_id, request_id }
    }

    pub(crate) fn from_event(event: &ToDeviceEvent<RoomKeyRequestContent>) -> Self {
        Self::new(
            event.sender.clone(),
            event.content.requesting_device_id.clone(),
            event.content.request_id.clone(),
        )
    }
}

/// Requests we want to serve but can't yet, because the requesting device
/// doesn't share an Olm session with us.
///
/// Entries come back out once a session with the device exists.
#[derive(Clone, Debug, Default)]
pub(crate) struct WaitQueue {
    inner: Arc<StdRwLock<WaitQueueInner>>,
}

#[derive(Debug, Default)]
struct WaitQueueInner {
    requests_waiting_for_session: BTreeMap<RequestInfo, ToDeviceEvent<RoomKeyRequestContent>>,
    request_ids_waiting: BTreeMap<(OwnedUserId, OwnedDeviceId), BTreeSet<OwnedTransactionId>>,
}

impl WaitQueue {
    fn new() -> Self {
        Self::default()
    }

    fn insert(&self, event: ToDeviceEvent<RoomKeyRequestContent>) {
        let key = RequestInfo::from_event(&event);
        let ids_key = (key.sender.clone(), key.requesting_device_id.clone());
        let request_id = key.request_id.clone();

        let mut guard = self.inner.write().unwrap();
        guard.requests_waiting_for_session.insert(key, event);
        guard.request_ids_waiting.entry(ids_key).or_default().insert(request_id);
    }

    fn remove(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Vec<ToDeviceEvent<RoomKeyRequestContent>> {
        let mut guard = self.inner.write().unwrap();

        guard
            .request_ids_waiting
            .remove(&(user_id.to_owned(), device_id.to_owned()))
            .map(|request_ids| {
                request_ids
                    .iter()
                    .filter_map(|id| {
                        let key =
                            RequestInfo::new(user_id.to_owned(), device_id.to_owned(), id.clone());
                        guard.requests_waiting_for_session.remove(&key)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn remove_request(&self, sender: &UserId, device_id: &DeviceId, request_id: &TransactionId) {
        let mut guard = self.inner.write().unwrap();

        let key =
            RequestInfo::new(sender.to_owned(), device_id.to_owned(), request_id.to_owned());
        guard.requests_waiting_for_session.remove(&key);

        let ids_key = (sender.to_owned(), device_id.to_owned());
        if let Some(ids) = guard.request_ids_waiting.get_mut(&ids_key) {
            ids.remove(request_id);

            if ids.is_empty() {
                guard.request_ids_waiting.remove(&ids_key);
            }
        }
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        let guard = self.inner.read().unwrap();
        guard.requests_waiting_for_session.is_empty() && guard.request_ids_waiting.is_empty()
    }
}
