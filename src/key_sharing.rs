// Copyright 2020 The Matrix.org Foundation C.I.C.
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

//! The key-sharing coordinator: decides which devices need the current
//! outbound Megolm session, claims one-time keys and opens Olm sessions for
//! the ones that don't have one yet, wraps `m.room_key` and dispatches it.

use std::{collections::HashMap, sync::Arc, time::Duration};

use dashmap::DashMap;
use ruma::{OwnedRoomId, OwnedServerName, OwnedUserId, RoomId, ServerName};
use serde_json::json;
use thiserror::Error;
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, warn};

use crate::{
    config::SessionConfig,
    error::OlmError,
    external::{ClaimedOneTimeKey, DeviceRegistry, DeviceRegistryError, TargetDeviceSet, Transport, TransportError},
    olm::{
        group_sessions::outbound::{OutboundGroupSession, ShareError, ShareInfo},
        OlmDevice,
    },
    store::SharedStore,
    types::{Algorithm, RoomKeyContent},
};

#[derive(Debug, Error)]
pub enum KeySharingError {
    #[error(transparent)]
    Olm(#[from] OlmError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    DeviceRegistry(#[from] DeviceRegistryError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// A transient per-server claim-failure backoff: a homeserver that just
/// failed a `/keys/claim` isn't retried again for `backoff`.
struct FailureCache {
    backoff: Duration,
    failures: Mutex<HashMap<OwnedServerName, Instant>>,
}

impl FailureCache {
    fn new(backoff: Duration) -> Self {
        Self { backoff, failures: Mutex::new(HashMap::new()) }
    }

    async fn is_backed_off(&self, server: &ServerName) -> bool {
        match self.failures.lock().await.get(server) {
            Some(failed_at) => failed_at.elapsed() < self.backoff,
            None => false,
        }
    }

    async fn record_failure(&self, server: OwnedServerName) {
        self.failures.lock().await.insert(server, Instant::now());
    }
}

/// A handle returned by [`KeySharingCoordinator::prepare_to_encrypt`].
/// Dropping or calling [`Self::cancel`] stops the device list warm-up from
/// being treated as "prepared" for the next share's OTK claim timeout; it
/// never unwinds a share already in flight.
pub struct PrepareHandle {
    room_id: OwnedRoomId,
    prepared: Arc<DashMap<OwnedRoomId, ()>>,
}

impl PrepareHandle {
    pub fn cancel(self) {
        self.prepared.remove(&self.room_id);
    }
}

/// Drains the device registry and the to-device transport on the outbound
/// session manager's behalf.
#[derive(Debug)]
pub struct KeySharingCoordinator {
    olm: Arc<Mutex<OlmDevice>>,
    store: SharedStore,
    device_registry: Arc<dyn DeviceRegistry>,
    transport: Arc<dyn Transport>,
    config: Arc<SessionConfig>,
    prepared: Arc<DashMap<OwnedRoomId, ()>>,
    claim_failures: FailureCache,
}

impl std::fmt::Debug for FailureCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureCache").finish_non_exhaustive()
    }
}

impl KeySharingCoordinator {
    pub fn new(
        olm: Arc<Mutex<OlmDevice>>,
        store: SharedStore,
        device_registry: Arc<dyn DeviceRegistry>,
        transport: Arc<dyn Transport>,
        config: Arc<SessionConfig>,
    ) -> Self {
        let claim_failures = FailureCache::new(Duration::from_secs(60));
        Self {
            olm,
            store,
            device_registry,
            transport,
            config,
            prepared: Arc::new(DashMap::new()),
            claim_failures,
        }
    }

    /// Warm the device list ahead of user input. Widens the OTK claim
    /// timeout for the next
    /// share in this room from `otk_claim_timeout_standard_ms` to
    /// `otk_claim_timeout_prepared_ms`.
    pub async fn prepare_to_encrypt(&self, room_id: &RoomId, members: &[OwnedUserId]) -> PrepareHandle {
        if let Err(err) = self.device_registry.download_keys(members, false).await {
            warn!(room_id = room_id.as_str(), error = %err, "prepare_to_encrypt: device list warm-up failed");
        }

        self.prepared.insert(room_id.to_owned(), ());
        PrepareHandle { room_id: room_id.to_owned(), prepared: self.prepared.clone() }
    }

    fn otk_timeout(&self, room_id: &RoomId) -> Duration {
        self.config.otk_claim_timeout(self.prepared.contains_key(room_id))
    }

    /// Does a usable (not wedged) Olm session already exist for this
    /// device? A session that hasn't produced a successful decrypt in
    /// `unwedging_interval_ms` is treated as absent, forcing a fresh claim
    /// and session.
    async fn has_usable_session(&self, curve25519_key: vodozemac::Curve25519PublicKey) -> bool {
        let olm = self.olm.lock().await;
        olm.sessions_for(curve25519_key)
            .first()
            .map(|session| !session.seems_wedged(self.config.unwedging_interval()))
            .unwrap_or(false)
    }

    /// Verify a claimed one-time key's signature against the device's own
    /// Ed25519 signing key. The signed payload for `signed_curve25519` keys
    /// is the canonical JSON of `{"key": <base64 key>}`.
    fn verify_claimed_key(
        key: &ClaimedOneTimeKey,
        signing_key: vodozemac::Ed25519PublicKey,
    ) -> bool {
        let message = json!({ "key": key.key.to_base64() }).to_string();
        signing_key.verify(message.as_bytes(), &key.signature).is_ok()
    }

    /// For every target device with no usable session, claim a one-time
    /// key and open an outbound Olm session.
    async fn ensure_olm_sessions(
        &self,
        room_id: &RoomId,
        target_device_set: &TargetDeviceSet,
    ) -> Result<(), KeySharingError> {
        let mut to_claim = Vec::new();

        for (user_id, devices) in target_device_set {
            if self.claim_failures.is_backed_off(user_id.server_name()).await {
                debug!(server = user_id.server_name().as_str(), "skipping claim, server is backed off");
                continue;
            }

            for device_id in devices.keys() {
                let device = &devices[device_id];
                if !self.has_usable_session(device.curve25519_key).await {
                    to_claim.push((user_id.clone(), device_id.clone()));
                }
            }
        }

        if to_claim.is_empty() {
            return Ok(());
        }

        let timeout = self.otk_timeout(room_id);
        let claimed = match self
            .transport
            .claim_one_time_keys(&to_claim, OlmDevice::one_time_key_algorithm(), timeout)
            .await
        {
            Ok(claimed) => claimed,
            Err(err) => {
                // A total claim failure (the whole RPC failed, not just
                // individual devices) is retried by the caller; we surface
                // it so `ensure_outbound` leaves the session in `Setting
                // up`. Back off every server we just tried so an immediate
                // retry doesn't hammer a homeserver that's down.
                let mut servers: Vec<_> =
                    to_claim.iter().map(|(user_id, _)| user_id.server_name().to_owned()).collect();
                servers.sort();
                servers.dedup();
                for server in servers {
                    self.claim_failures.record_failure(server).await;
                }
                return Err(err.into());
            }
        };

        let mut to_persist = Vec::new();
        {
            let mut olm = self.olm.lock().await;

            for (user_id, devices) in &claimed {
                for (device_id, claimed_key) in devices {
                    let Some(device) = target_device_set.get(user_id).and_then(|d| d.get(device_id)) else {
                        continue;
                    };

                    if !Self::verify_claimed_key(claimed_key, device.ed25519_key) {
                        warn!(
                            user_id = user_id.as_str(),
                            device_id = device_id.as_str(),
                            "discarding a one-time key with an unverifiable signature"
                        );
                        continue;
                    }

                    olm.create_outbound(device.curve25519_key, claimed_key.key);
                    to_persist.extend(olm.session_pickles_for(device.curve25519_key));
                }
            }
        }

        for pickle in to_persist {
            if let Err(err) = self.store.save_session(pickle).await {
                warn!(error = %err, "failed to persist an Olm session");
            }
        }

        Ok(())
    }

    /// Compute the share-delta, ensure Olm sessions, wrap `m.room_key`,
    /// bulk-send, and only then advance `shared_with`.
    pub async fn share(
        &self,
        room_id: &RoomId,
        session: &OutboundGroupSession,
        target_device_set: &TargetDeviceSet,
    ) -> Result<(), KeySharingError> {
        let delta = session.share_delta(target_device_set);
        if delta.is_empty() {
            return Ok(());
        }

        self.ensure_olm_sessions(room_id, target_device_set).await?;

        let chain_index = session.message_index().await;
        let room_key = RoomKeyContent {
            algorithm: Algorithm::MegolmV1AesSha2,
            room_id: room_id.to_owned(),
            session_id: session.session_id().to_owned(),
            session_key: session.session_key().await.to_base64(),
            chain_index,
        };
        let room_key_content = serde_json::to_value(&room_key)?;

        let (our_user_id, our_device_id, our_signing_key) = {
            let olm = self.olm.lock().await;
            (
                olm.account().user_id().to_owned(),
                olm.account().device_id().to_owned(),
                olm.account().ed25519_key().to_base64(),
            )
        };

        let mut messages: HashMap<OwnedUserId, HashMap<ruma::OwnedDeviceId, serde_json::Value>> =
            HashMap::new();
        let mut recipients = Vec::new();
        let mut encrypted_with = Vec::new();

        {
            let mut olm = self.olm.lock().await;

            for (user_id, device_id) in &delta {
                let Some(device) = target_device_set.get(user_id).and_then(|d| d.get(device_id))
                else {
                    continue;
                };

                // A plain `m.room_key` body never goes straight into the
                // Olm ciphertext unwrapped; it's addressed the way every
                // Olm to-device event is, so the recipient's invariant
                // checks (recipient/recipient_keys/sender) have something
                // to verify.
                let plaintext = json!({
                    "type": "m.room_key",
                    "sender": our_user_id,
                    "sender_device": our_device_id,
                    "keys": { "ed25519": our_signing_key },
                    "recipient": user_id,
                    "recipient_keys": { "ed25519": device.ed25519_key.to_base64() },
                    "room_id": room_id,
                    "content": room_key_content,
                });

                let ciphertext = match olm.encrypt(device.curve25519_key, &plaintext.to_string()) {
                    Ok(ciphertext) => ciphertext,
                    Err(OlmError::NoSession(_)) => {
                        debug!(
                            user_id = user_id.as_str(),
                            device_id = device_id.as_str(),
                            "skipping device with no usable Olm session after claim"
                        );
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                };

                let mut ciphertext_map = serde_json::Map::new();
                ciphertext_map.insert(
                    device.curve25519_key.to_base64(),
                    json!({ "type": ciphertext.msg_type, "body": ciphertext.body }),
                );

                let content = json!({
                    "algorithm": Algorithm::OlmV1Curve25519AesSha2.as_str(),
                    "sender_key": olm.account().curve25519_key().to_base64(),
                    "ciphertext": ciphertext_map,
                });

                messages.entry(user_id.clone()).or_default().insert(device_id.clone(), content);
                recipients.push((user_id.clone(), device_id.clone()));
                encrypted_with.push(device.curve25519_key);
            }
        }

        if messages.is_empty() {
            return Ok(());
        }

        let to_persist: Vec<_> = {
            let olm = self.olm.lock().await;
            encrypted_with.iter().flat_map(|key| olm.session_pickles_for(*key)).collect()
        };
        for pickle in to_persist {
            if let Err(err) = self.store.save_session(pickle).await {
                warn!(error = %err, "failed to persist an Olm session");
            }
        }

        self.transport.send_to_device("m.room.encrypted", messages).await?;

        for (user_id, device_id) in recipients {
            let Some(device) = target_device_set.get(&user_id).and_then(|d| d.get(&device_id)) else {
                continue;
            };
            session.mark_shared_with(
                user_id,
                device_id,
                ShareInfo { sender_key: device.curve25519_key, message_index: chain_index },
            );
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl crate::olm::group_sessions::outbound::RoomKeyShare for KeySharingCoordinator {
    async fn share_room_key(
        &self,
        room_id: &RoomId,
        session: &OutboundGroupSession,
        target_device_set: &TargetDeviceSet,
    ) -> Result<(), ShareError> {
        self.share(room_id, session, target_device_set).await.map_err(|e| Box::new(e) as ShareError)
    }
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, room_id, user_id};
    use vodozemac::olm::Account as InnerAccount;

    use super::*;
    use crate::{
        olm::group_sessions::outbound::EncryptionSettings,
        types::DeviceInfo,
    };

    #[derive(Debug)]
    struct FakeDeviceRegistry;

    #[async_trait::async_trait]
    impl DeviceRegistry for FakeDeviceRegistry {
        async fn download_keys(
            &self,
            _users: &[OwnedUserId],
            _force: bool,
        ) -> Result<TargetDeviceSet, DeviceRegistryError> {
            Ok(HashMap::new())
        }

        async fn get_stored_device(
            &self,
            _user_id: &ruma::UserId,
            _device_id: &ruma::DeviceId,
        ) -> Result<Option<DeviceInfo>, DeviceRegistryError> {
            Ok(None)
        }
    }

    #[derive(Debug)]
    struct FakeTransport {
        bob: Mutex<InnerAccount>,
    }

    #[async_trait::async_trait]
    impl Transport for FakeTransport {
        async fn claim_one_time_keys(
            &self,
            devices: &[(OwnedUserId, ruma::OwnedDeviceId)],
            _algorithm: ruma::DeviceKeyAlgorithm,
            _timeout: Duration,
        ) -> Result<HashMap<OwnedUserId, HashMap<ruma::OwnedDeviceId, ClaimedOneTimeKey>>, TransportError>
        {
            let mut bob = self.bob.lock().await;
            bob.generate_one_time_keys(1);
            let (_, key) = bob.one_time_keys().into_iter().next().unwrap();
            let signature = bob.sign(&json!({ "key": key.to_base64() }).to_string());
            bob.mark_keys_as_published();

            let mut result = HashMap::new();
            for (user_id, device_id) in devices {
                let mut per_device = HashMap::new();
                per_device.insert(
                    device_id.clone(),
                    ClaimedOneTimeKey { key_id: key.to_base64(), key, signature },
                );
                result.insert(user_id.clone(), per_device);
            }
            Ok(result)
        }

        async fn send_to_device(
            &self,
            _event_type: &str,
            _messages: HashMap<OwnedUserId, HashMap<ruma::OwnedDeviceId, serde_json::Value>>,
        ) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn sharing_claims_a_key_and_marks_the_device_shared() {
        let alice = InnerAccount::new();
        let bob = InnerAccount::new();
        let bob_identity = bob.curve25519_key();
        let bob_signing = bob.ed25519_key();

        let olm_device =
            crate::olm::OlmDevice::from_account(crate::olm::account::Account::from_pickle(
                crate::olm::account::PickledAccount {
                    user_id: user_id!("@alice:example.org").to_owned(),
                    device_id: device_id!("ALICE1").to_owned(),
                    pickle: alice.pickle(),
                    published: HashMap::new(),
                },
            ));

        let coordinator = KeySharingCoordinator::new(
            Arc::new(Mutex::new(olm_device)),
            Arc::new(crate::store::MemoryStore::new()),
            Arc::new(FakeDeviceRegistry),
            Arc::new(FakeTransport { bob: Mutex::new(bob) }),
            Arc::new(SessionConfig::default()),
        );

        let room_id = room_id!("!room:example.org").to_owned();
        let session = OutboundGroupSession::new(
            device_id!("ALICE1").to_owned(),
            vodozemac::olm::Account::new().curve25519_key(),
            room_id.clone(),
            EncryptionSettings::default(),
        );

        let bob_user = user_id!("@bob:example.org").to_owned();
        let bob_device_id = device_id!("BOB1").to_owned();
        let mut devices = HashMap::new();
        devices.insert(
            bob_device_id.clone(),
            DeviceInfo {
                user_id: bob_user.clone(),
                device_id: bob_device_id.clone(),
                curve25519_key: bob_identity,
                ed25519_key: bob_signing,
                blocked: false,
                verified: true,
                algorithms: vec!["m.megolm.v1.aes-sha2".to_owned()],
            },
        );
        let mut targets = HashMap::new();
        targets.insert(bob_user.clone(), devices);

        coordinator.share(&room_id, &session, &targets).await.unwrap();

        assert!(matches!(
            session.is_shared_with(&bob_user, &bob_device_id, bob_identity),
            crate::olm::group_sessions::outbound::ShareState::Shared(0)
        ));
    }
}
