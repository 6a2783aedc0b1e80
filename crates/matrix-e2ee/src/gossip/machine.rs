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

use std::sync::Arc;

use dashmap::DashMap;
use ruma::{OwnedDeviceId, OwnedUserId, DeviceId, UserId};
use tracing::{debug, info, warn};
use vodozemac::Curve25519PublicKey;

use super::{
    KeyForwardDecision, KeyRequestState, OutgoingKeyRequest, RequestInfo, WaitQueue,
};
use crate::{
    error::OlmResult,
    identities::DeviceData,
    olm::InboundGroupSession,
    store::{Changes, CryptoStoreError, Store},
    transport::{CryptoTransport, ToDeviceRequest},
    types::events::{
        olm_v1::DecryptedForwardedRoomKeyEvent,
        room_key_request::{RequestedKeyInfo, RoomKeyRequestAction, RoomKeyRequestContent},
        ToDeviceEvent,
    },
};

/// Handles the `m.room_key_request` protocol in both directions.
///
/// Outgoing requests walk the [`KeyRequestState`] machine; incoming ones are
/// queued here and served once the policy allows it.
#[derive(Debug, Clone)]
pub(crate) struct GossipMachine {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    store: Store,
    incoming_key_requests:
        Arc<DashMap<RequestInfo, ToDeviceEvent<RoomKeyRequestContent>>>,
    wait_queue: WaitQueue,
}

impl GossipMachine {
    pub(crate) fn new(user_id: OwnedUserId, device_id: OwnedDeviceId, store: Store) -> Self {
        Self {
            user_id,
            device_id,
            store,
            incoming_key_requests: Arc::new(DashMap::new()),
            wait_queue: WaitQueue::new(),
        }
    }

    fn user_id(&self) -> &UserId {
        &self.user_id
    }

    fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Create a new outgoing key request for the given key, unless an
    /// equivalent request is already tracked.
    ///
    /// Two requests are equivalent if they ask for the same key, regardless
    /// of their request ids. A request that is being cancelled is flipped
    /// into the cancel-then-resend state instead.
    pub(crate) async fn request_key(
        &self,
        info: RequestedKeyInfo,
    ) -> Result<(), CryptoStoreError> {
        if let Some(mut request) = self.store.get_key_request_by_info(&info).await? {
            match request.state {
                KeyRequestState::Unsent | KeyRequestState::Sent => {
                    debug!(?info, "A key request for this room key is already tracked");
                    return Ok(());
                }
                KeyRequestState::CancellationPendingAndWillResend => return Ok(()),
                KeyRequestState::CancellationPending => {
                    request.state = KeyRequestState::CancellationPendingAndWillResend;
                    self.save_request(request).await?;
                    return Ok(());
                }
            }
        }

        let request = OutgoingKeyRequest::new(self.user_id.clone(), info);

        info!(
            info = ?request.info,
            request_id = ?request.request_id,
            "Created a new outgoing room key request"
        );

        self.save_request(request).await
    }

    /// The need for a requested key evaporated, e.g. because the key arrived
    /// through another path. Queue a cancellation for the request tracking
    /// it, if any.
    pub(crate) async fn cancel_request_for_key(
        &self,
        info: &RequestedKeyInfo,
    ) -> Result<(), CryptoStoreError> {
        let Some(mut request) = self.store.get_key_request_by_info(info).await? else {
            return Ok(());
        };

        match request.state {
            // Never left the house, nothing to cancel remotely.
            KeyRequestState::Unsent => {
                self.store.delete_outgoing_key_request(&request.request_id).await?;
            }
            KeyRequestState::Sent => {
                request.state = KeyRequestState::CancellationPending;
                self.save_request(request).await?;
            }
            // The resend became pointless too, downgrade to a plain
            // cancellation.
            KeyRequestState::CancellationPendingAndWillResend => {
                request.state = KeyRequestState::CancellationPending;
                self.save_request(request).await?;
            }
            KeyRequestState::CancellationPending => {}
        }

        Ok(())
    }

    async fn save_request(&self, request: OutgoingKeyRequest) -> Result<(), CryptoStoreError> {
        self.store
            .save_changes(Changes { key_requests: vec![request], ..Default::default() })
            .await
    }

    /// Send out every request or cancellation that is due.
    ///
    /// Cancellations are acknowledged by the transport before any resend
    /// materializes; a transport error leaves the state untouched so the
    /// next pass retries.
    pub(crate) async fn send_outgoing_requests(
        &self,
        transport: &dyn CryptoTransport,
    ) -> OlmResult<()> {
        // Two passes: the first turns acknowledged cancellations into fresh
        // unsent requests, the second sends those out.
        for _ in 0..2 {
            let requests = self.store.get_unsent_key_requests().await?;

            if requests.is_empty() {
                break;
            }

            for mut request in requests {
                match request.state {
                    KeyRequestState::Unsent => {
                        transport.send_to_device(request.to_request(self.device_id())?).await?;

                        debug!(request_id = ?request.request_id, "Sent a room key request");

                        request.state = KeyRequestState::Sent;
                        self.save_request(request).await?;
                    }
                    KeyRequestState::CancellationPending => {
                        transport
                            .send_to_device(request.to_cancellation(self.device_id())?)
                            .await?;

                        debug!(
                            request_id = ?request.request_id,
                            "Cancelled a room key request"
                        );

                        self.store.delete_outgoing_key_request(&request.request_id).await?;
                    }
                    KeyRequestState::CancellationPendingAndWillResend => {
                        transport
                            .send_to_device(request.to_cancellation(self.device_id())?)
                            .await?;

                        // The stale request is gone from the other side's
                        // point of view; now the fresh one may follow.
                        self.store.delete_outgoing_key_request(&request.request_id).await?;

                        let new_request =
                            OutgoingKeyRequest::new(self.user_id.clone(), request.info.clone());

                        debug!(
                            old_request_id = ?request.request_id,
                            request_id = ?new_request.request_id,
                            "Cancelled a room key request and queued a fresh one"
                        );

                        self.save_request(new_request).await?;
                    }
                    KeyRequestState::Sent => {}
                }
            }
        }

        Ok(())
    }

    /// Queue an incoming `m.room_key_request` event for processing.
    ///
    /// Duplicate deliveries of the same request collapse into one entry.
    pub(crate) fn receive_incoming_key_request(
        &self,
        event: &ToDeviceEvent<RoomKeyRequestContent>,
    ) {
        let info = RequestInfo::from_event(event);

        match event.content.action {
            RoomKeyRequestAction::Request => {
                self.incoming_key_requests.insert(info, event.clone());
            }
            RoomKeyRequestAction::CancelRequest => {
                self.incoming_key_requests.remove(&info);
                self.wait_queue.remove_request(
                    &event.sender,
                    &event.content.requesting_device_id,
                    &event.content.request_id,
                );
            }
        }
    }

    /// A new Olm session with the given device exists; requests that waited
    /// for one can be retried.
    pub(crate) fn retry_keyshare(&self, user_id: &UserId, device_id: &DeviceId) {
        for event in self.wait_queue.remove(user_id, device_id) {
            let info = RequestInfo::from_event(&event);
            self.incoming_key_requests.insert(info, event);
        }
    }

    /// Decide whether the requested session may be shared with the
    /// requesting device.
    async fn should_share_key(
        &self,
        device: &DeviceData,
        info: &RequestedKeyInfo,
    ) -> Result<InboundGroupSession, Box<KeyForwardDecision>> {
        if device.user_id() != self.user_id() {
            return Err(Box::new(KeyForwardDecision::NotOurDevice));
        }

        if device.is_blacklisted() {
            return Err(Box::new(KeyForwardDecision::BlacklistedDevice));
        }

        if !device.is_verified() {
            return Err(Box::new(KeyForwardDecision::UntrustedDevice));
        }

        let session = self
            .store
            .get_inbound_group_session(
                &info.room_id,
                &info.sender_key.to_base64(),
                &info.session_id,
            )
            .await
            .ok()
            .flatten()
            .ok_or_else(|| Box::new(KeyForwardDecision::MissingSession))?;

        Ok(session)
    }

    /// Serve every queued incoming key request that the policy allows.
    pub(crate) async fn collect_incoming_key_requests(
        &self,
        transport: &dyn CryptoTransport,
    ) -> OlmResult<()> {
        let requests: Vec<_> =
            self.incoming_key_requests.iter().map(|e| e.value().clone()).collect();
        self.incoming_key_requests.clear();

        for event in requests {
            self.handle_key_request(transport, &event).await?;
        }

        Ok(())
    }

    async fn handle_key_request(
        &self,
        transport: &dyn CryptoTransport,
        event: &ToDeviceEvent<RoomKeyRequestContent>,
    ) -> OlmResult<()> {
        let Some(info) = &event.content.body else {
            debug!("Received a room key request without a body, ignoring");
            return Ok(());
        };

        let Some(device) = self
            .store
            .get_device(&event.sender, &event.content.requesting_device_id)
            .await?
        else {
            warn!(
                sender = ?event.sender,
                device_id = ?event.content.requesting_device_id,
                "Received a room key request from an unknown device",
            );
            return Ok(());
        };

        let session = match self.should_share_key(&device, info).await {
            Ok(session) => session,
            Err(decision) => {
                debug!(
                    sender = ?event.sender,
                    device_id = ?event.content.requesting_device_id,
                    reason = %decision,
                    "Refusing to serve a room key request",
                );
                return Ok(());
            }
        };

        info!(
            sender = ?event.sender,
            device_id = ?event.content.requesting_device_id,
            session_id = session.session_id(),
            "Serving a room key request",
        );

        let export = session.export_at_index(session.first_known_index()).await;
        let content = serde_json::to_value(
            &crate::types::events::forwarded_room_key::ForwardedRoomKeyContent::from(export),
        )?;

        match device.encrypt(&self.store, "m.forwarded_room_key", content).await {
            Ok(encrypted) => {
                let request = ToDeviceRequest::new(
                    device.user_id(),
                    device.device_id(),
                    "m.room.encrypted",
                    serde_json::to_value(&encrypted)?,
                );

                transport.send_to_device(request).await?;
            }
            Err(crate::error::OlmError::MissingSession(..)) => {
                debug!(
                    sender = ?event.sender,
                    device_id = ?event.content.requesting_device_id,
                    "No Olm session with the requesting device, putting the \
                     request into the wait queue",
                );
                self.wait_queue.insert(event.clone());
            }
            Err(e) => return Err(e),
        }

        Ok(())
    }

    /// Handle a received `m.forwarded_room_key` event.
    ///
    /// The key is only accepted if we actually asked for it; the matching
    /// request is cancelled afterwards so other devices stop working on it.
    pub(crate) async fn receive_forwarded_room_key(
        &self,
        forwarder_key: Curve25519PublicKey,
        event: &DecryptedForwardedRoomKeyEvent,
    ) -> OlmResult<Option<InboundGroupSession>> {
        let info = RequestedKeyInfo::new(
            event.content.algorithm.clone(),
            event.content.room_id.clone(),
            event.content.sender_key,
            event.content.session_id.clone(),
        );

        if self.store.get_key_request_by_info(&info).await?.is_none() {
            warn!(
                sender = ?event.sender,
                room_id = ?event.content.room_id,
                session_id = event.content.session_id,
                "Received a forwarded room key we didn't ask for, dropping it",
            );
            return Ok(None);
        }

        let session = InboundGroupSession::from_forwarded_key(forwarder_key, &event.content)
            .map_err(crate::error::OlmError::SessionCreation)?;

        self.cancel_request_for_key(&info).await?;

        Ok(Some(session))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use ruma::{device_id, room_id, user_id};
    use vodozemac::Curve25519PublicKey;

    use super::GossipMachine;
    use crate::{
        gossip::KeyRequestState,
        store::{MemoryStore, Store},
        types::{events::room_key_request::RequestedKeyInfo, EventEncryptionAlgorithm},
    };

    fn sender_key() -> Curve25519PublicKey {
        vodozemac::olm::Account::new().curve25519_key()
    }

    fn machine() -> GossipMachine {
        GossipMachine::new(
            user_id!("@alice:localhost").to_owned(),
            device_id!("ALICEDEVICE").to_owned(),
            Store::new(Arc::new(MemoryStore::new())),
        )
    }

    fn key_info(sender_key: Curve25519PublicKey) -> RequestedKeyInfo {
        RequestedKeyInfo::new(
            EventEncryptionAlgorithm::MegolmV1AesSha2,
            room_id!("!room:localhost").to_owned(),
            sender_key,
            "sessionid".to_owned(),
        )
    }

    #[tokio::test]
    async fn duplicate_requests_are_deduplicated() {
        let machine = machine();
        let info = key_info(sender_key());

        machine.request_key(info.clone()).await.unwrap();
        machine.request_key(info.clone()).await.unwrap();

        let unsent = machine.store.get_unsent_key_requests().await.unwrap();
        assert_eq!(unsent.len(), 1);
        assert_matches!(unsent[0].state, KeyRequestState::Unsent);
    }

    #[tokio::test]
    async fn unsent_requests_are_cancelled_locally() {
        let machine = machine();
        let info = key_info(sender_key());

        machine.request_key(info.clone()).await.unwrap();
        machine.cancel_request_for_key(&info).await.unwrap();

        assert!(machine.store.get_unsent_key_requests().await.unwrap().is_empty());
        assert!(machine.store.get_key_request_by_info(&info).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn re_requesting_a_cancelled_key_resends_after_cancellation() {
        let machine = machine();
        let info = key_info(sender_key());

        machine.request_key(info.clone()).await.unwrap();

        // Pretend the request went out.
        let mut request =
            machine.store.get_key_request_by_info(&info).await.unwrap().unwrap();
        request.state = KeyRequestState::Sent;
        machine.save_request(request).await.unwrap();

        machine.cancel_request_for_key(&info).await.unwrap();
        let request = machine.store.get_key_request_by_info(&info).await.unwrap().unwrap();
        assert_matches!(request.state, KeyRequestState::CancellationPending);

        // The key is wanted again before the cancellation went out.
        machine.request_key(info.clone()).await.unwrap();
        let request = machine.store.get_key_request_by_info(&info).await.unwrap().unwrap();
        assert_matches!(request.state, KeyRequestState::CancellationPendingAndWillResend);
    }
}
