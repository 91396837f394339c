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

//! The engine's single public entry point: owns the Olm device, the
//! outbound session manager and the key-sharing coordinator it drives, and
//! the event pipeline built on top of both.

use std::sync::Arc;

use ruma::{DeviceId, OwnedDeviceId, OwnedRoomId, OwnedUserId, RoomId, UserId};
use serde_json::Value;
use tokio::sync::Mutex;
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey, Ed25519Signature};

use crate::{
    config::SessionConfig,
    external::{DeviceRegistry, Transport},
    key_sharing::{KeySharingCoordinator, PrepareHandle},
    olm::{account::Account, group_sessions::outbound::OutboundSessionManager, OlmDevice, Session},
    pipeline::{EncryptedEnvelope, EventPipeline, PipelineError},
    store::{CryptoStoreError, SharedStore},
    types::Algorithm,
};

pub use crate::olm::group_sessions::outbound::EncryptionSettings;
pub use crate::external::TargetDeviceSet;

/// The engine's public surface: everything a client needs to turn its
/// sync loop and compose box into encrypt/decrypt calls, without reaching
/// into the Olm device, key-sharing coordinator, or event pipeline directly.
#[derive(Debug)]
pub struct CryptoEngine {
    olm: Arc<Mutex<OlmDevice>>,
    store: SharedStore,
    key_sharing: Arc<KeySharingCoordinator>,
    pipeline: EventPipeline,
}

impl CryptoEngine {
    /// Load the account from `store`, creating a brand new identity on
    /// first run, then wire up the outbound session manager, key-sharing
    /// coordinator and event pipeline around it.
    pub async fn new(
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
        store: SharedStore,
        device_registry: Arc<dyn DeviceRegistry>,
        transport: Arc<dyn Transport>,
        config: SessionConfig,
    ) -> Result<Self, CryptoStoreError> {
        let config = Arc::new(config);

        let account = match store.load_account().await? {
            Some(pickled) => Account::from_pickle(pickled),
            None => {
                let account = Account::new(user_id.clone(), device_id.clone());
                store.save_account(account.pickle()).await?;
                account
            }
        };

        let identity_key = account.curve25519_key();
        let mut olm_device = OlmDevice::from_account(account);
        for pickled in store.get_all_sessions().await? {
            olm_device.insert_session(Session::from_pickle(pickled));
        }
        let olm = Arc::new(Mutex::new(olm_device));

        let key_sharing = Arc::new(KeySharingCoordinator::new(
            olm.clone(),
            store.clone(),
            device_registry,
            transport,
            config.clone(),
        ));

        let outbound =
            Arc::new(OutboundSessionManager::new(device_id.clone(), identity_key, key_sharing.clone()));

        let pipeline = EventPipeline::new(
            user_id,
            olm.clone(),
            store.clone(),
            outbound,
            config.pending_queue_max_per_session,
            config.seen_index_eviction_threshold,
        );

        for pickled in store.get_all_inbound_group_sessions().await? {
            pipeline.load_inbound_session(pickled).await;
        }

        Ok(Self { olm, store, key_sharing, pipeline })
    }

    pub async fn device_id(&self) -> OwnedDeviceId {
        self.olm.lock().await.account().device_id().to_owned()
    }

    pub async fn identity_keys(&self) -> (Curve25519PublicKey, Ed25519PublicKey) {
        let olm = self.olm.lock().await;
        (olm.account().curve25519_key(), olm.account().ed25519_key())
    }

    /// Sign an arbitrary payload (a device-keys upload, a cross-signing
    /// key...) with our Ed25519 identity key.
    pub async fn sign(&self, message: &str) -> Ed25519Signature {
        self.olm.lock().await.account().sign(message)
    }

    /// Top up the one-time key pool and persist the account immediately;
    /// an account whose freshly generated keys were lost before the next
    /// save would leave devices claiming keys we can no longer decrypt
    /// with. Returns the unpublished keys ready to sign and upload; the
    /// caller must call
    /// [`Self::mark_keys_published`] once the upload actually succeeds.
    pub async fn ensure_one_time_keys(
        &self,
    ) -> Result<std::collections::BTreeMap<vodozemac::KeyId, Curve25519PublicKey>, CryptoStoreError> {
        let mut olm = self.olm.lock().await;
        olm.generate_one_time_keys(50);
        self.store.save_account(olm.account().pickle()).await?;
        Ok(olm.account().unpublished_one_time_keys())
    }

    pub async fn mark_keys_published<'a>(
        &self,
        keys: impl IntoIterator<Item = &'a Curve25519PublicKey>,
    ) -> Result<(), CryptoStoreError> {
        let mut olm = self.olm.lock().await;
        olm.mark_keys_published(keys);
        self.store.save_account(olm.account().pickle()).await
    }

    /// Warm the device list for a room ahead of user input, so the first
    /// keystroke in a compose box doesn't block on a `/keys/query` round
    /// trip.
    pub async fn prepare_to_encrypt(&self, room_id: &RoomId, members: &[OwnedUserId]) -> PrepareHandle {
        self.key_sharing.prepare_to_encrypt(room_id, members).await
    }

    /// Record a room's `m.room.encryption` policy; `encrypt_event` refuses
    /// to run for a room this hasn't been called for.
    pub async fn set_room_encryption(&self, room_id: OwnedRoomId, settings: EncryptionSettings) {
        self.pipeline.set_room_settings(room_id, settings).await
    }

    pub async fn room_encryption(&self, room_id: &RoomId) -> Option<EncryptionSettings> {
        self.pipeline.room_settings(room_id).await
    }

    /// Membership reaction: a member left, so the room's outbound session
    /// is invalidated and the next `encrypt_event` rotates.
    pub async fn on_member_left(&self, room_id: &RoomId) {
        self.pipeline.on_member_left(room_id).await
    }

    pub async fn encrypt_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: &Value,
        target_device_set: &TargetDeviceSet,
    ) -> Result<Value, PipelineError> {
        self.pipeline.encrypt_event(room_id, event_type, content, target_device_set).await
    }

    pub async fn decrypt_event(&self, envelope: &EncryptedEnvelope) -> Result<Value, PipelineError> {
        self.pipeline.decrypt_event(envelope).await
    }

    /// Re-run the undecryptable backlog for a session, e.g. after an
    /// `m.room_key` arrived out of band of `decrypt_event`'s own
    /// reactive install (a forwarded key accepted via a side channel).
    pub async fn drain_pending(&self, sender_key: Curve25519PublicKey, session_id: &str) -> Vec<Value> {
        self.pipeline.drain_pending(sender_key, session_id).await
    }

    /// Whether a remote device's advertised algorithms include ours, used
    /// by a caller assembling a `TargetDeviceSet` from a raw device list.
    pub fn supports_megolm(algorithms: &[String]) -> bool {
        algorithms.iter().any(|a| a == Algorithm::MegolmV1AesSha2.as_str())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use ruma::{device_id, room_id, user_id};

    use super::*;
    use crate::{
        external::{ClaimedOneTimeKey, DeviceRegistryError, TransportError},
        store::MemoryStore,
    };

    #[derive(Debug)]
    struct NullRegistry;
    #[async_trait]
    impl DeviceRegistry for NullRegistry {
        async fn download_keys(
            &self,
            _users: &[OwnedUserId],
            _force: bool,
        ) -> Result<TargetDeviceSet, DeviceRegistryError> {
            Ok(HashMap::new())
        }
        async fn get_stored_device(
            &self,
            _user_id: &UserId,
            _device_id: &DeviceId,
        ) -> Result<Option<crate::types::DeviceInfo>, DeviceRegistryError> {
            Ok(None)
        }
    }

    #[derive(Debug)]
    struct NullTransport;
    #[async_trait]
    impl Transport for NullTransport {
        async fn claim_one_time_keys(
            &self,
            _devices: &[(OwnedUserId, OwnedDeviceId)],
            _algorithm: ruma::DeviceKeyAlgorithm,
            _timeout: std::time::Duration,
        ) -> Result<HashMap<OwnedUserId, HashMap<OwnedDeviceId, ClaimedOneTimeKey>>, TransportError> {
            Ok(HashMap::new())
        }
        async fn send_to_device(
            &self,
            _event_type: &str,
            _messages: HashMap<OwnedUserId, HashMap<OwnedDeviceId, Value>>,
        ) -> Result<(), TransportError> {
            Ok(())
        }
    }

    async fn engine() -> CryptoEngine {
        CryptoEngine::new(
            user_id!("@alice:example.org").to_owned(),
            device_id!("ALICE1").to_owned(),
            Arc::new(MemoryStore::new()),
            Arc::new(NullRegistry),
            Arc::new(NullTransport),
            SessionConfig::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn fresh_engine_has_no_room_encryption_until_set() {
        let engine = engine().await;
        assert!(engine.room_encryption(room_id!("!room:example.org")).await.is_none());

        engine
            .set_room_encryption(room_id!("!room:example.org").to_owned(), EncryptionSettings::default())
            .await;
        assert!(engine.room_encryption(room_id!("!room:example.org")).await.is_some());
    }

    #[tokio::test]
    async fn one_time_keys_persist_through_the_store() {
        let store = Arc::new(MemoryStore::new());
        let engine = CryptoEngine::new(
            user_id!("@alice:example.org").to_owned(),
            device_id!("ALICE1").to_owned(),
            store.clone(),
            Arc::new(NullRegistry),
            Arc::new(NullTransport),
            SessionConfig::default(),
        )
        .await
        .unwrap();

        let keys = engine.ensure_one_time_keys().await.unwrap();
        assert!(!keys.is_empty());

        let pickled = store.load_account().await.unwrap().unwrap();
        assert_eq!(pickled.published.len(), keys.len());
    }
}
