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

//! The event pipeline: encrypts outgoing room events, decrypts
//! incoming ones, and owns the undecryptable-event queue that drains once
//! the matching `m.room_key` arrives.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use ruma::{
    MilliSecondsSinceUnixEpoch, OwnedEventId, OwnedRoomId, OwnedUserId, RoomId, UserId,
};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use vodozemac::{
    megolm::{ExportedSessionKey, MegolmMessage},
    Curve25519PublicKey, Ed25519PublicKey,
};

use crate::{
    error::{EventError, MegolmError, OlmError},
    external::TargetDeviceSet,
    key_sharing::KeySharingCoordinator,
    olm::{
        group_sessions::{
            inbound::EventIdRef,
            outbound::{EncryptionSettings, OutboundSessionManager},
            InboundGroupSession, PickledInboundGroupSession,
        },
        OlmCiphertext, OlmDevice,
    },
    store::{InboundSessionKey, SharedStore},
    types::{Algorithm, ForwardedRoomKeyContent, RoomKeyContent},
};

/// The wire envelope an `m.room.encrypted` event arrives in, flattened from
/// whichever transport shape delivered it (to-device or timeline).
#[derive(Debug, Clone)]
pub struct EncryptedEnvelope {
    pub sender: OwnedUserId,
    /// Present for timeline (Megolm) events, absent for to-device (Olm)
    /// ones.
    pub room_id: Option<OwnedRoomId>,
    pub event_id: Option<OwnedEventId>,
    pub origin_server_ts: Option<MilliSecondsSinceUnixEpoch>,
    /// The raw `m.room.encrypted` content, still carrying `algorithm` and
    /// the algorithm-specific fields.
    pub content: Value,
}

/// An undecryptable event, held until its session's `m.room_key` arrives.
#[derive(Debug, Clone)]
pub struct PendingEvent {
    pub envelope: EncryptedEnvelope,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Event(#[from] EventError),

    #[error(transparent)]
    Megolm(#[from] MegolmError),

    #[error(transparent)]
    Olm(#[from] OlmError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// A base64 key, session key or ciphertext in the envelope didn't parse.
    #[error("malformed envelope field: {0}")]
    Decode(String),

    /// The share that `ensure_outbound` ran to deliver a fresh or
    /// newly-eligible ratchet failed; see the underlying message for which
    /// stage (claim, Olm encrypt, or the to-device send) failed.
    #[error("room key share failed: {0}")]
    Share(String),
}

/// Wires the Olm device, the outbound session manager and the
/// inbound session table together into the two operations a client
/// actually calls, `encrypt_event` and `decrypt_event`.
#[derive(Debug)]
pub struct EventPipeline {
    user_id: OwnedUserId,
    olm: Arc<Mutex<OlmDevice>>,
    store: SharedStore,
    outbound: Arc<OutboundSessionManager<KeySharingCoordinator>>,
    inbound_sessions: Mutex<HashMap<InboundSessionKey, InboundGroupSession>>,
    pending: Mutex<HashMap<(String, String), VecDeque<PendingEvent>>>,
    room_settings: Mutex<HashMap<OwnedRoomId, EncryptionSettings>>,
    pending_queue_max_per_session: usize,
    seen_index_eviction_threshold: usize,
}

impl EventPipeline {
    pub fn new(
        user_id: OwnedUserId,
        olm: Arc<Mutex<OlmDevice>>,
        store: SharedStore,
        outbound: Arc<OutboundSessionManager<KeySharingCoordinator>>,
        pending_queue_max_per_session: usize,
        seen_index_eviction_threshold: usize,
    ) -> Self {
        Self {
            user_id,
            olm,
            store,
            outbound,
            inbound_sessions: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            room_settings: Mutex::new(HashMap::new()),
            pending_queue_max_per_session,
            seen_index_eviction_threshold,
        }
    }

    /// Repopulate the inbound session table from a persisted pickle, used
    /// at startup to restore sessions installed in a previous run.
    pub async fn load_inbound_session(&self, pickle: PickledInboundGroupSession) {
        let session = InboundGroupSession::from_pickle(pickle);
        let key = InboundSessionKey::new(
            session.room_id(),
            &session.sender_key().to_base64(),
            session.session_id(),
        );
        self.inbound_sessions.lock().await.insert(key, session);
    }

    /// Record (or update) a room's `m.room.encryption` settings, feeding
    /// `encrypt_event`'s rotation decision.
    pub async fn set_room_settings(&self, room_id: OwnedRoomId, settings: EncryptionSettings) {
        self.room_settings.lock().await.insert(room_id, settings);
    }

    pub async fn room_settings(&self, room_id: &RoomId) -> Option<EncryptionSettings> {
        self.room_settings.lock().await.get(room_id).cloned()
    }

    /// Membership reaction: a leaving member invalidates
    /// the outbound session so the next `encrypt_event` rotates. Joins need
    /// no immediate action; the next `encrypt_event`'s `share_delta` against
    /// a refreshed `target_device_set` picks the new member up.
    pub async fn on_member_left(&self, room_id: &RoomId) {
        self.outbound.discard(room_id).await;
    }

    /// Encrypt `content` for `room_id`, sharing the outbound session with
    /// any devices in `target_device_set` that don't already have it.
    pub async fn encrypt_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: &Value,
        target_device_set: &TargetDeviceSet,
    ) -> Result<Value, PipelineError> {
        let settings = self
            .room_settings(room_id)
            .await
            .ok_or_else(|| EventError::UnencryptedRoom(room_id.to_owned()))?;

        let session = self
            .outbound
            .ensure_outbound(room_id, &settings, target_device_set)
            .await
            .map_err(|e| PipelineError::Share(e.to_string()))?;
        let encrypted = session.encrypt(event_type, content).await;
        Ok(serde_json::to_value(encrypted)?)
    }

    /// Decrypt an `m.room.encrypted` envelope, dispatching on its
    /// `algorithm` field.
    pub async fn decrypt_event(&self, envelope: &EncryptedEnvelope) -> Result<Value, PipelineError> {
        let algorithm_str = envelope.content.get("algorithm").and_then(Value::as_str).unwrap_or("");

        match Algorithm::from(algorithm_str) {
            Algorithm::OlmV1Curve25519AesSha2 => self.decrypt_olm(envelope).await,
            Algorithm::MegolmV1AesSha2 => self.decrypt_megolm(envelope).await,
            Algorithm::Unknown(other) => Err(EventError::UnsupportedAlgorithm(other).into()),
        }
    }

    async fn decrypt_olm(&self, envelope: &EncryptedEnvelope) -> Result<Value, PipelineError> {
        let sender_key_str = envelope
            .content
            .get("sender_key")
            .and_then(Value::as_str)
            .ok_or_else(|| EventError::MalformedEnvelope("missing sender_key".to_owned()))?;
        let sender_key = Curve25519PublicKey::from_base64(sender_key_str)
            .map_err(|e| PipelineError::Decode(e.to_string()))?;

        let our_key_str = { self.olm.lock().await.account().curve25519_key().to_base64() };
        let our_entry = envelope
            .content
            .get("ciphertext")
            .and_then(Value::as_object)
            .and_then(|ciphertext| ciphertext.get(&our_key_str))
            .ok_or(OlmError::UnknownSession)?;

        let msg_type = our_entry.get("type").and_then(Value::as_u64).unwrap_or(1) as u8;
        let body = our_entry.get("body").and_then(Value::as_str).unwrap_or_default().to_owned();

        let (plaintext, to_persist) = {
            let mut olm = self.olm.lock().await;
            let plaintext = olm.decrypt(sender_key, OlmCiphertext { msg_type, body })?;
            (plaintext, olm.session_pickles_for(sender_key))
        };
        for pickle in to_persist {
            if let Err(err) = self.store.save_session(pickle).await {
                tracing::warn!(error = %err, "failed to persist an Olm session");
            }
        }

        let payload: Value = serde_json::from_str(&plaintext)?;
        self.check_olm_payload_invariants(envelope, &payload).await?;

        let event_type = payload.get("type").and_then(Value::as_str);
        if let Some(content) = payload.get("content") {
            let sender_ed25519_key = payload
                .get("keys")
                .and_then(|keys| keys.get("ed25519"))
                .and_then(Value::as_str)
                .map(Ed25519PublicKey::from_base64)
                .transpose()
                .map_err(|e| PipelineError::Decode(e.to_string()))?;

            if let Some(sender_ed25519_key) = sender_ed25519_key {
                match event_type {
                    Some("m.room_key") => {
                        self.install_room_key(sender_key, sender_ed25519_key, content).await?;
                    }
                    Some("m.forwarded_room_key") => {
                        self.install_forwarded_room_key(sender_key, content).await?;
                    }
                    _ => {}
                }
            }
        }

        Ok(payload)
    }

    async fn check_olm_payload_invariants(
        &self,
        envelope: &EncryptedEnvelope,
        payload: &Value,
    ) -> Result<(), PipelineError> {
        let recipient = payload.get("recipient").and_then(Value::as_str);
        if recipient != Some(self.user_id.as_str()) {
            let actual = recipient.map(ToOwned::to_owned).unwrap_or_default();
            let actual = ruma::UserId::parse(actual).unwrap_or_else(|_| self.user_id.clone());
            return Err(EventError::RecipientMismatch { expected: self.user_id.clone(), actual }.into());
        }

        let our_signing_key = { self.olm.lock().await.account().ed25519_key().to_base64() };
        let claimed_signing_key =
            payload.get("recipient_keys").and_then(|k| k.get("ed25519")).and_then(Value::as_str);
        if claimed_signing_key != Some(our_signing_key.as_str()) {
            return Err(EventError::MismatchedKeys.into());
        }

        let claimed_sender = payload.get("sender").and_then(Value::as_str);
        if claimed_sender != Some(envelope.sender.as_str()) {
            let claimed = claimed_sender
                .and_then(|s| ruma::UserId::parse(s).ok())
                .unwrap_or_else(|| envelope.sender.clone());
            return Err(EventError::SenderMismatch { claimed, envelope: envelope.sender.clone() }.into());
        }

        if let (Some(payload_room_id), Some(envelope_room_id)) =
            (payload.get("room_id").and_then(Value::as_str), &envelope.room_id)
        {
            if payload_room_id != envelope_room_id.as_str() {
                return Err(EventError::RoomMismatch.into());
            }
        }

        Ok(())
    }

    async fn install_room_key(
        &self,
        sender_curve25519_key: Curve25519PublicKey,
        sender_ed25519_key: Ed25519PublicKey,
        content: &Value,
    ) -> Result<(), PipelineError> {
        let mut room_key: RoomKeyContent = serde_json::from_value(content.clone())?;
        let session_key_b64 = zeroize::Zeroizing::new(std::mem::take(&mut room_key.session_key));
        let session_key = vodozemac::megolm::SessionKey::from_base64(&session_key_b64)
            .map_err(|e| PipelineError::Decode(e.to_string()))?;

        let new_session = InboundGroupSession::new(
            sender_curve25519_key,
            sender_ed25519_key,
            &room_key.room_id,
            &session_key,
            self.seen_capacity_for(),
        );

        let key = InboundSessionKey::new(
            &room_key.room_id,
            &sender_curve25519_key.to_base64(),
            &room_key.session_id,
        );

        self.install_inbound_session(key, new_session, sender_curve25519_key, &room_key.session_id).await
    }

    /// Install a room key forwarded via `m.forwarded_room_key`. The session's
    /// sender/signing identity is taken from the content's own
    /// `sender_key`/`sender_claimed_ed25519_key` (the device that originally
    /// created the Megolm session), not from the Olm layer's sender, which is
    /// only the most recent device in the forwarding chain.
    async fn install_forwarded_room_key(
        &self,
        forwarder_curve25519_key: Curve25519PublicKey,
        content: &Value,
    ) -> Result<(), PipelineError> {
        let mut forwarded: ForwardedRoomKeyContent = serde_json::from_value(content.clone())?;
        let session_key_b64 = zeroize::Zeroizing::new(std::mem::take(&mut forwarded.session_key));
        let exported_key = ExportedSessionKey::from_base64(&session_key_b64)
            .map_err(|e| PipelineError::Decode(e.to_string()))?;

        let mut forwarding_chain = forwarded.forwarding_curve25519_key_chain.clone();
        forwarding_chain.push(forwarder_curve25519_key);

        let new_session = InboundGroupSession::from_export(
            forwarded.sender_key,
            forwarded.sender_claimed_ed25519_key,
            &forwarded.room_id,
            &exported_key,
            forwarding_chain,
            self.seen_capacity_for(),
        );

        let key = InboundSessionKey::new(
            &forwarded.room_id,
            &forwarded.sender_key.to_base64(),
            &forwarded.session_id,
        );

        self.install_inbound_session(key, new_session, forwarded.sender_key, &forwarded.session_id).await
    }

    /// Shared idempotent install: keep the session with the lower
    /// `first_known_index`, persist it, and drain whatever was queued for it.
    async fn install_inbound_session(
        &self,
        key: InboundSessionKey,
        new_session: InboundGroupSession,
        sender_key: Curve25519PublicKey,
        session_id: &str,
    ) -> Result<(), PipelineError> {
        let install = {
            let mut sessions = self.inbound_sessions.lock().await;
            let install = match sessions.get(&key) {
                Some(existing) => new_session.is_better_than(existing),
                None => true,
            };
            if install {
                sessions.insert(key.clone(), new_session.clone());
            }
            install
        };

        if install {
            let pickle = new_session.pickle().await;
            if let Err(err) = self.store.save_inbound_group_session(key, pickle).await {
                tracing::warn!(error = %err, "failed to persist an inbound Megolm session");
            }
            self.drain_pending(sender_key, session_id).await;
        }

        Ok(())
    }

    fn seen_capacity_for(&self) -> usize {
        self.seen_index_eviction_threshold
    }

    async fn decrypt_megolm(&self, envelope: &EncryptedEnvelope) -> Result<Value, PipelineError> {
        let room_id = envelope
            .room_id
            .clone()
            .ok_or_else(|| EventError::MalformedEnvelope("missing room_id".to_owned()))?;
        let event_id = envelope
            .event_id
            .clone()
            .ok_or_else(|| EventError::MalformedEnvelope("missing event_id".to_owned()))?;
        let origin_server_ts = envelope
            .origin_server_ts
            .ok_or_else(|| EventError::MalformedEnvelope("missing origin_server_ts".to_owned()))?;

        let sender_key_str = envelope
            .content
            .get("sender_key")
            .and_then(Value::as_str)
            .ok_or_else(|| EventError::MalformedEnvelope("missing sender_key".to_owned()))?
            .to_owned();
        let session_id = envelope
            .content
            .get("session_id")
            .and_then(Value::as_str)
            .ok_or_else(|| EventError::MalformedEnvelope("missing session_id".to_owned()))?
            .to_owned();
        let ciphertext = envelope
            .content
            .get("ciphertext")
            .and_then(Value::as_str)
            .ok_or_else(|| EventError::MalformedEnvelope("missing ciphertext".to_owned()))?;
        let ciphertext = MegolmMessage::from_base64(ciphertext)
            .map_err(|e| PipelineError::Decode(e.to_string()))?;

        let key = InboundSessionKey::new(&room_id, &sender_key_str, &session_id);
        let session = { self.inbound_sessions.lock().await.get(&key).cloned() };

        let Some(session) = session else {
            self.enqueue_pending(sender_key_str, session_id.clone(), envelope.clone()).await;
            return Err(MegolmError::UnknownSession(session_id).into());
        };

        let event_id_ref = EventIdRef(&event_id);
        match session.decrypt(&ciphertext, &event_id_ref, origin_server_ts).await {
            Ok((payload, _index)) => {
                let payload_room_id = payload.get("room_id").and_then(Value::as_str);
                if payload_room_id != Some(room_id.as_str()) {
                    return Err(MegolmError::RoomMismatch.into());
                }
                Ok(payload)
            }
            Err(err) if err.is_recoverable() => {
                self.enqueue_pending(sender_key_str, session_id, envelope.clone()).await;
                Err(err.into())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn enqueue_pending(&self, sender_key: String, session_id: String, envelope: EncryptedEnvelope) {
        let mut pending = self.pending.lock().await;
        let queue = pending.entry((sender_key, session_id)).or_default();
        queue.push_back(PendingEvent { envelope });

        while queue.len() > self.pending_queue_max_per_session {
            queue.pop_front();
            debug!("pending queue full, dropped oldest undecryptable event");
        }
    }

    /// Replay every event queued for `(sender_key, session_id)` now that its
    /// key has arrived. Idempotent: a second drain with nothing new queued
    /// returns nothing, since the queue was already removed by the first.
    pub async fn drain_pending(&self, sender_key: Curve25519PublicKey, session_id: &str) -> Vec<Value> {
        let key = (sender_key.to_base64(), session_id.to_owned());
        let Some(queue) = self.pending.lock().await.remove(&key) else {
            return Vec::new();
        };

        let mut decrypted = Vec::new();
        let mut still_pending = VecDeque::new();

        for event in queue {
            match self.decrypt_megolm(&event.envelope).await {
                Ok(payload) => decrypted.push(payload),
                Err(_) => still_pending.push_back(event),
            }
        }

        if !still_pending.is_empty() {
            self.pending.lock().await.insert(key, still_pending);
        }

        decrypted
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ruma::{event_id, room_id, user_id};
    use vodozemac::{megolm::GroupSession, olm::Account as InnerAccount};

    use super::*;
    use crate::{
        config::SessionConfig,
        key_sharing::KeySharingCoordinator,
        olm::account::{Account, PickledAccount},
    };

    fn dummy_pipeline(user_id: &UserId) -> (EventPipeline, Arc<Mutex<OlmDevice>>) {
        let inner = InnerAccount::new();
        let pickled = PickledAccount {
            user_id: user_id.to_owned(),
            device_id: ruma::device_id!("DEVICE1").to_owned(),
            pickle: inner.pickle(),
            published: HashMap::new(),
        };
        let account = Account::from_pickle(pickled);
        let olm = Arc::new(Mutex::new(OlmDevice::from_account(account)));

        struct NullRegistry;
        #[async_trait::async_trait]
        impl crate::external::DeviceRegistry for NullRegistry {
            async fn download_keys(
                &self,
                _users: &[OwnedUserId],
                _force: bool,
            ) -> Result<TargetDeviceSet, crate::external::DeviceRegistryError> {
                Ok(HashMap::new())
            }
            async fn get_stored_device(
                &self,
                _user_id: &UserId,
                _device_id: &ruma::DeviceId,
            ) -> Result<Option<crate::types::DeviceInfo>, crate::external::DeviceRegistryError> {
                Ok(None)
            }
        }
        impl std::fmt::Debug for NullRegistry {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct("NullRegistry").finish()
            }
        }

        struct NullTransport;
        #[async_trait::async_trait]
        impl crate::external::Transport for NullTransport {
            async fn claim_one_time_keys(
                &self,
                _devices: &[(OwnedUserId, ruma::OwnedDeviceId)],
                _algorithm: ruma::DeviceKeyAlgorithm,
                _timeout: std::time::Duration,
            ) -> Result<
                HashMap<OwnedUserId, HashMap<ruma::OwnedDeviceId, crate::external::ClaimedOneTimeKey>>,
                crate::external::TransportError,
            > {
                Ok(HashMap::new())
            }
            async fn send_to_device(
                &self,
                _event_type: &str,
                _messages: HashMap<OwnedUserId, HashMap<ruma::OwnedDeviceId, Value>>,
            ) -> Result<(), crate::external::TransportError> {
                Ok(())
            }
        }
        impl std::fmt::Debug for NullTransport {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct("NullTransport").finish()
            }
        }

        let store: SharedStore = Arc::new(crate::store::MemoryStore::new());

        let coordinator = Arc::new(KeySharingCoordinator::new(
            olm.clone(),
            store.clone(),
            Arc::new(NullRegistry),
            Arc::new(NullTransport),
            Arc::new(SessionConfig::default()),
        ));

        let device_id = ruma::device_id!("DEVICE1").to_owned();
        let identity_key = inner.curve25519_key();
        let manager = Arc::new(OutboundSessionManager::new(device_id, identity_key, coordinator));

        let pipeline = EventPipeline::new(
            user_id.to_owned(),
            olm.clone(),
            store,
            manager,
            10,
            SessionConfig::default().seen_index_eviction_threshold,
        );
        (pipeline, olm)
    }

    #[tokio::test]
    async fn encrypting_into_an_unencrypted_room_fails() {
        let (pipeline, _olm) = dummy_pipeline(user_id!("@alice:example.org"));
        let targets: TargetDeviceSet = HashMap::new();

        let result = pipeline
            .encrypt_event(room_id!("!room:example.org"), "m.room.message", &serde_json::json!({}), &targets)
            .await;

        assert!(matches!(result, Err(PipelineError::Event(EventError::UnencryptedRoom(_)))));
    }

    #[tokio::test]
    async fn an_m_room_key_installs_a_session_and_drains_the_backlog() {
        let (pipeline, olm) = dummy_pipeline(user_id!("@alice:example.org"));
        let room = room_id!("!room:example.org");

        let mut outbound = GroupSession::new(vodozemac::megolm::SessionConfig::version_2());
        let session_key = outbound.session_key();
        let sender_key = vodozemac::olm::Account::new().curve25519_key();
        let signing_key = vodozemac::olm::Account::new().ed25519_key();

        let plaintext = serde_json::json!({
            "room_id": room.as_str(),
            "type": "m.room.message",
            "content": {"body": "hi"},
        });
        let ciphertext = outbound.encrypt(plaintext.to_string().as_bytes());

        let envelope = EncryptedEnvelope {
            sender: user_id!("@bob:example.org").to_owned(),
            room_id: Some(room.to_owned()),
            event_id: Some(event_id!("$a").to_owned()),
            origin_server_ts: Some(MilliSecondsSinceUnixEpoch(ruma::UInt::try_from(1000u64).unwrap())),
            content: serde_json::json!({
                "algorithm": "m.megolm.v1.aes-sha2",
                "sender_key": sender_key.to_base64(),
                "session_id": outbound.session_id(),
                "ciphertext": ciphertext.to_base64(),
            }),
        };

        // No session installed yet: queues for later.
        let first = pipeline.decrypt_event(&envelope).await;
        assert!(matches!(first, Err(PipelineError::Megolm(MegolmError::UnknownSession(_)))));

        let room_key_content = RoomKeyContent {
            algorithm: Algorithm::MegolmV1AesSha2,
            room_id: room.to_owned(),
            session_id: outbound.session_id(),
            session_key: session_key.to_base64(),
            chain_index: 0,
        };

        pipeline
            .install_room_key(sender_key, signing_key, &serde_json::to_value(&room_key_content).unwrap())
            .await
            .unwrap();

        let drained = pipeline.drain_pending(sender_key, &outbound.session_id()).await;
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0]["content"]["body"], "hi");

        // A second decrypt of the same event now succeeds directly too.
        let second = pipeline.decrypt_event(&envelope).await.unwrap();
        assert_eq!(second["content"]["body"], "hi");

        let _ = olm;
    }

    #[tokio::test]
    async fn a_forwarded_room_key_installs_under_the_contents_own_sender_identity() {
        let (pipeline, _olm) = dummy_pipeline(user_id!("@alice:example.org"));
        let room = room_id!("!room:example.org");

        let mut outbound = GroupSession::new(vodozemac::megolm::SessionConfig::version_2());
        let session_key = outbound.session_key();

        // The device that originally created the session, distinct from
        // whichever device actually forwarded it to us.
        let original_sender_key = vodozemac::olm::Account::new().curve25519_key();
        let original_signing_key = vodozemac::olm::Account::new().ed25519_key();
        let forwarder_key = vodozemac::olm::Account::new().curve25519_key();

        let exported = InboundGroupSession::new(
            original_sender_key,
            original_signing_key,
            room,
            &session_key,
            10_000,
        )
        .export()
        .await
        .unwrap();

        let forwarded_content = ForwardedRoomKeyContent {
            algorithm: Algorithm::MegolmV1AesSha2,
            room_id: room.to_owned(),
            session_id: outbound.session_id(),
            session_key: exported.to_base64(),
            chain_index: 0,
            sender_key: original_sender_key,
            sender_claimed_ed25519_key: original_signing_key,
            forwarding_curve25519_key_chain: Vec::new(),
        };

        pipeline
            .install_forwarded_room_key(
                forwarder_key,
                &serde_json::to_value(&forwarded_content).unwrap(),
            )
            .await
            .unwrap();

        let plaintext = serde_json::json!({
            "room_id": room.as_str(),
            "type": "m.room.message",
            "content": {"body": "forwarded"},
        });
        let ciphertext = outbound.encrypt(plaintext.to_string().as_bytes());

        let envelope = EncryptedEnvelope {
            sender: user_id!("@bob:example.org").to_owned(),
            room_id: Some(room.to_owned()),
            event_id: Some(event_id!("$b").to_owned()),
            origin_server_ts: Some(MilliSecondsSinceUnixEpoch(ruma::UInt::try_from(2000u64).unwrap())),
            content: serde_json::json!({
                "algorithm": "m.megolm.v1.aes-sha2",
                "sender_key": original_sender_key.to_base64(),
                "session_id": outbound.session_id(),
                "ciphertext": ciphertext.to_base64(),
            }),
        };

        let decrypted = pipeline.decrypt_event(&envelope).await.unwrap();
        assert_eq!(decrypted["content"]["body"], "forwarded");
    }
}
