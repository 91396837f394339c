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

//! The Megolm outbound manager: the ratchet a room currently encrypts
//! with, its share bookkeeping, rotation triggers, and the setup state
//! machine that serializes concurrent `ensure_outbound` calls per room.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use dashmap::DashMap;
use ruma::{
    events::room::{
        encrypted::{EncryptedEventScheme, MegolmV1AesSha2ContentInit, RoomEncryptedEventContent},
        encryption::RoomEncryptionEventContent,
        history_visibility::HistoryVisibility,
    },
    DeviceId, OwnedDeviceId, OwnedRoomId, OwnedUserId, RoomId, UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use vodozemac::{
    megolm::{
        GroupSession as InnerSession, GroupSessionPickle as InnerPickle, SessionConfig,
        SessionKey,
    },
    Curve25519PublicKey,
};

use crate::{
    config::SessionConfig as EngineConfig, external::TargetDeviceSet, types::Algorithm,
};

fn megolm_session_config() -> SessionConfig {
    SessionConfig::version_2()
}

/// The sender key and ratchet position a device was shared with. Recorded
/// on every successful key share so a later re-share can tell whether a
/// device already has a usable copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareInfo {
    pub sender_key: Curve25519PublicKey,
    pub message_index: u32,
}

/// Whether (and at what index) a device already has this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareState {
    NotShared,
    SharedButChangedSenderKey,
    Shared(u32),
}

/// The setup lifecycle: `Idle` before any encrypt, `Preparing` while a new
/// ratchet is being created, `Sharing` while the key-sharing coordinator's
/// share is in flight, `Done` once the session is usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupState {
    Idle,
    Preparing,
    Sharing,
    Done,
}

/// Per-room encryption policy: the algorithm and the rotation bounds, taken
/// from the room's `m.room.encryption` state event with the engine-wide
/// [`EngineConfig`] supplying defaults for anything the room doesn't
/// override.
#[derive(Debug, Clone)]
pub struct EncryptionSettings {
    pub algorithm: Algorithm,
    pub rotation_period: Duration,
    pub rotation_period_msgs: u64,
    pub history_visibility: HistoryVisibility,
}

impl Default for EncryptionSettings {
    fn default() -> Self {
        let defaults = EngineConfig::default();
        Self {
            algorithm: Algorithm::MegolmV1AesSha2,
            rotation_period: defaults.rotation_period(),
            rotation_period_msgs: defaults.rotation_period_msgs,
            history_visibility: HistoryVisibility::Shared,
        }
    }
}

impl EncryptionSettings {
    /// Build from a room's `m.room.encryption` content, falling back to
    /// `defaults` for any field the room doesn't set.
    pub fn new(
        content: &RoomEncryptionEventContent,
        history_visibility: HistoryVisibility,
        defaults: &EngineConfig,
    ) -> Self {
        Self {
            algorithm: Algorithm::from(content.algorithm.as_str()),
            rotation_period: content
                .rotation_period_ms
                .map(|ms| Duration::from_millis(ms.into()))
                .unwrap_or_else(|| defaults.rotation_period()),
            rotation_period_msgs: content
                .rotation_period_msgs
                .map(Into::into)
                .unwrap_or(defaults.rotation_period_msgs),
            history_visibility,
        }
    }
}

/// The group session a room currently encrypts with: one ratchet, its
/// use-count, and the `shared_with` map.
#[derive(Clone)]
pub struct OutboundGroupSession {
    inner: Arc<Mutex<InnerSession>>,
    device_id: OwnedDeviceId,
    account_identity_key: Curve25519PublicKey,
    session_id: Arc<str>,
    room_id: OwnedRoomId,
    creation_time: SystemTime,
    use_count: Arc<AtomicU64>,
    shared: Arc<AtomicBool>,
    invalidated: Arc<AtomicBool>,
    settings: Arc<EncryptionSettings>,
    shared_with_set: Arc<DashMap<OwnedUserId, DashMap<OwnedDeviceId, ShareInfo>>>,
}

impl OutboundGroupSession {
    pub fn new(
        device_id: OwnedDeviceId,
        account_identity_key: Curve25519PublicKey,
        room_id: OwnedRoomId,
        settings: EncryptionSettings,
    ) -> Self {
        let session = InnerSession::new(megolm_session_config());
        let session_id = session.session_id();

        Self {
            inner: Arc::new(Mutex::new(session)),
            device_id,
            account_identity_key,
            session_id: session_id.into(),
            room_id,
            creation_time: SystemTime::now(),
            use_count: Arc::new(AtomicU64::new(0)),
            shared: Arc::new(AtomicBool::new(false)),
            invalidated: Arc::new(AtomicBool::new(false)),
            settings: Arc::new(settings),
            shared_with_set: Arc::new(DashMap::new()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn sender_key(&self) -> Curve25519PublicKey {
        self.account_identity_key
    }

    pub fn use_count(&self) -> u64 {
        self.use_count.load(Ordering::SeqCst)
    }

    pub fn shared(&self) -> bool {
        self.shared.load(Ordering::SeqCst)
    }

    pub fn invalidated(&self) -> bool {
        self.invalidated.load(Ordering::SeqCst)
    }

    pub fn mark_shared(&self) {
        self.shared.store(true, Ordering::SeqCst);
    }

    /// Discard this session: the next `ensure_outbound` for the room must
    /// create a fresh one.
    pub fn invalidate(&self) {
        self.invalidated.store(true, Ordering::SeqCst);
    }

    pub fn elapsed(&self) -> Duration {
        SystemTime::now().duration_since(self.creation_time).unwrap_or_default()
    }

    /// Any of the three rotation triggers: invalidated, message-count
    /// bound reached, or time bound reached.
    pub fn needs_rotation(&self, target_device_set: &TargetDeviceSet) -> bool {
        if self.invalidated() {
            return true;
        }

        if self.use_count() >= self.settings.rotation_period_msgs {
            return true;
        }

        if self.elapsed() >= self.settings.rotation_period {
            return true;
        }

        // A device we shared with is no longer in the eligible set. This
        // only marks the session for rotation — it's applied lazily, at
        // the caller's next `ensure_outbound`, not torn down immediately.
        self.shared_with_set.iter().any(|entry| {
            let eligible = target_device_set.get(entry.key());
            entry.value().iter().any(|device| {
                eligible.map(|devices| !devices.contains_key(device.key())).unwrap_or(true)
            })
        })
    }

    /// Devices in `target_device_set` this session hasn't been shared with
    /// yet. Devices we shared with but that dropped out of the eligible
    /// set are *not* unshared —
    /// there is no key revocation, they only drive `needs_rotation`.
    pub fn share_delta(&self, target_device_set: &TargetDeviceSet) -> Vec<(OwnedUserId, OwnedDeviceId)> {
        let mut delta = Vec::new();

        for (user_id, devices) in target_device_set {
            let shared = self.shared_with_set.get(user_id);
            for device_id in devices.keys() {
                let already_shared =
                    shared.as_ref().map(|d| d.contains_key(device_id)).unwrap_or(false);
                if !already_shared {
                    delta.push((user_id.clone(), device_id.clone()));
                }
            }
        }

        delta
    }

    /// Record that `(user_id, device_id)` now has the session, at the given
    /// sender key and ratchet position.
    pub fn mark_shared_with(&self, user_id: OwnedUserId, device_id: OwnedDeviceId, info: ShareInfo) {
        self.shared_with_set.entry(user_id).or_default().insert(device_id, info);
    }

    pub fn is_shared_with(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        sender_key: Curve25519PublicKey,
    ) -> ShareState {
        match self.shared_with_set.get(user_id).and_then(|m| m.get(device_id).map(|e| *e.value())) {
            None => ShareState::NotShared,
            Some(info) if info.sender_key != sender_key => ShareState::SharedButChangedSenderKey,
            Some(info) => ShareState::Shared(info.message_index),
        }
    }

    pub async fn session_key(&self) -> SessionKey {
        self.inner.lock().await.session_key()
    }

    /// The ratchet's current position: the `chain_index` a freshly-shared
    /// device should start decrypting from.
    pub async fn message_index(&self) -> u32 {
        self.inner.lock().await.message_index()
    }

    /// Encrypt one room event, advancing the ratchet and incrementing
    /// `use_count` atomically with it.
    pub async fn encrypt(
        &self,
        event_type: &str,
        content: &Value,
    ) -> RoomEncryptedEventContent {
        let plaintext = json!({
            "room_id": self.room_id,
            "type": event_type,
            "content": content,
        })
        .to_string();

        let ciphertext = {
            let mut session = self.inner.lock().await;
            let ciphertext = session.encrypt(plaintext.as_bytes()).to_base64();
            self.use_count.fetch_add(1, Ordering::SeqCst);
            ciphertext
        };

        RoomEncryptedEventContent::new(
            EncryptedEventScheme::MegolmV1AesSha2(
                MegolmV1AesSha2ContentInit {
                    ciphertext,
                    sender_key: self.account_identity_key.to_base64(),
                    session_id: self.session_id.to_string(),
                    device_id: self.device_id.clone(),
                }
                .into(),
            ),
            None,
        )
    }

    pub async fn pickle(&self) -> PickledOutboundGroupSession {
        let pickle = self.inner.lock().await.pickle();
        let shared_with_set = self
            .shared_with_set
            .iter()
            .map(|entry| {
                let devices =
                    entry.value().iter().map(|d| (d.key().clone(), *d.value())).collect();
                (entry.key().clone(), devices)
            })
            .collect();

        PickledOutboundGroupSession {
            pickle,
            device_id: self.device_id.clone(),
            account_identity_key: self.account_identity_key,
            room_id: self.room_id.clone(),
            creation_time: self.creation_time,
            use_count: self.use_count(),
            shared: self.shared(),
            settings: SerializableSettings::from(&*self.settings),
            shared_with_set,
        }
    }

    pub fn from_pickle(pickle: PickledOutboundGroupSession) -> Self {
        let session = InnerSession::from_pickle(pickle.pickle);
        let session_id = session.session_id();

        let shared_with_set = DashMap::new();
        for (user_id, devices) in pickle.shared_with_set {
            let inner = DashMap::new();
            for (device_id, info) in devices {
                inner.insert(device_id, info);
            }
            shared_with_set.insert(user_id, inner);
        }

        Self {
            inner: Arc::new(Mutex::new(session)),
            device_id: pickle.device_id,
            account_identity_key: pickle.account_identity_key,
            session_id: session_id.into(),
            room_id: pickle.room_id,
            creation_time: pickle.creation_time,
            use_count: Arc::new(AtomicU64::new(pickle.use_count)),
            shared: Arc::new(AtomicBool::new(pickle.shared)),
            invalidated: Arc::new(AtomicBool::new(false)),
            settings: Arc::new(pickle.settings.into()),
            shared_with_set: Arc::new(shared_with_set),
        }
    }
}

impl std::fmt::Debug for OutboundGroupSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundGroupSession")
            .field("session_id", &self.session_id)
            .field("room_id", &self.room_id)
            .field("use_count", &self.use_count())
            .field("shared", &self.shared())
            .finish()
    }
}

/// `EncryptionSettings` without the `Duration`, which isn't portable across
/// a plain JSON pickle the way the rest of this crate writes milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializableSettings {
    pub rotation_period_ms: u64,
    pub rotation_period_msgs: u64,
}

impl From<&EncryptionSettings> for SerializableSettings {
    fn from(settings: &EncryptionSettings) -> Self {
        Self {
            rotation_period_ms: settings.rotation_period.as_millis() as u64,
            rotation_period_msgs: settings.rotation_period_msgs,
        }
    }
}

impl From<SerializableSettings> for EncryptionSettings {
    fn from(settings: SerializableSettings) -> Self {
        Self {
            algorithm: Algorithm::MegolmV1AesSha2,
            rotation_period: Duration::from_millis(settings.rotation_period_ms),
            rotation_period_msgs: settings.rotation_period_msgs,
            history_visibility: HistoryVisibility::Shared,
        }
    }
}

/// A pickled, storable [`OutboundGroupSession`].
#[derive(Serialize, Deserialize)]
pub struct PickledOutboundGroupSession {
    pub pickle: InnerPickle,
    pub device_id: OwnedDeviceId,
    pub account_identity_key: Curve25519PublicKey,
    pub room_id: OwnedRoomId,
    pub creation_time: SystemTime,
    pub use_count: u64,
    pub shared: bool,
    pub settings: SerializableSettings,
    pub shared_with_set: HashMap<OwnedUserId, HashMap<OwnedDeviceId, ShareInfo>>,
}

/// The error type the key-sharing coordinator reports back through
/// [`RoomKeyShare`]. Boxed rather than naming `key_sharing::KeySharingError`
/// directly, since that module depends on this one for
/// `OutboundGroupSession` — a direct reference back would form a cycle.
pub type ShareError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Implemented by the key-sharing coordinator. Kept as a trait here,
/// rather than a concrete dependency on `key_sharing`, so this module can
/// drive a share without the coordinator needing to know about its setup
/// bookkeeping.
#[async_trait]
pub trait RoomKeyShare: Send + Sync {
    async fn share_room_key(
        &self,
        room_id: &RoomId,
        session: &OutboundGroupSession,
        target_device_set: &TargetDeviceSet,
    ) -> Result<(), ShareError>;
}

struct SetupSlot {
    session: Option<OutboundGroupSession>,
    state: SetupState,
}

/// Owns one [`SetupSlot`] per room and serializes `ensure_outbound` calls
/// against it: the lock is held across the `share_room_key` await, so
/// additional encrypt requests arriving during Setting up await the same
/// completion rather than racing it.
pub struct OutboundSessionManager<S> {
    device_id: OwnedDeviceId,
    account_identity_key: Curve25519PublicKey,
    sharer: Arc<S>,
    rooms: DashMap<OwnedRoomId, Arc<Mutex<SetupSlot>>>,
}

impl<S: RoomKeyShare> OutboundSessionManager<S> {
    pub fn new(device_id: OwnedDeviceId, account_identity_key: Curve25519PublicKey, sharer: Arc<S>) -> Self {
        Self { device_id, account_identity_key, sharer, rooms: DashMap::new() }
    }

    fn slot_for(&self, room_id: &RoomId) -> Arc<Mutex<SetupSlot>> {
        self.rooms
            .entry(room_id.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(SetupSlot { session: None, state: SetupState::Idle })))
            .clone()
    }

    /// `ensure_outbound(room, target_device_set) -> ratchet`, internally
    /// invoking the key-sharing coordinator via `sharer` whenever a fresh
    /// ratchet or a share-delta needs delivering.
    pub async fn ensure_outbound(
        &self,
        room_id: &RoomId,
        settings: &EncryptionSettings,
        target_device_set: &TargetDeviceSet,
    ) -> Result<OutboundGroupSession, ShareError> {
        let slot = self.slot_for(room_id);
        let mut guard = slot.lock().await;

        let needs_new = match &guard.session {
            None => true,
            Some(session) => session.needs_rotation(target_device_set),
        };

        if needs_new {
            debug!(room_id = room_id.as_str(), "creating a new outbound Megolm session");
            guard.state = SetupState::Preparing;
            guard.session =
                Some(OutboundGroupSession::new(
                    self.device_id.clone(),
                    self.account_identity_key,
                    room_id.to_owned(),
                    settings.clone(),
                ));
        }

        let session = guard.session.clone().expect("just created or already present above");
        let delta = session.share_delta(target_device_set);

        if !delta.is_empty() || !session.shared() {
            guard.state = SetupState::Sharing;

            match self.sharer.share_room_key(room_id, &session, target_device_set).await {
                Ok(()) => {
                    session.mark_shared();
                    guard.state = SetupState::Done;
                }
                Err(err) => {
                    // Leave the session installed, still effectively
                    // "Setting up": `shared_with` was not advanced by a
                    // failed share, so a retry replays the same session key.
                    warn!(room_id = room_id.as_str(), error = %err, "room key share failed");
                    guard.state = SetupState::Preparing;
                    return Err(err);
                }
            }
        } else {
            guard.state = SetupState::Done;
        }

        Ok(session)
    }

    /// Membership reaction: discard the room's current session so the next
    /// `ensure_outbound` starts fresh.
    pub async fn discard(&self, room_id: &RoomId) {
        let slot = self.slot_for(room_id);
        let mut guard = slot.lock().await;
        if let Some(session) = guard.session.take() {
            session.invalidate();
        }
        guard.state = SetupState::Idle;
    }

    pub async fn state(&self, room_id: &RoomId) -> SetupState {
        self.slot_for(room_id).lock().await.state
    }

    pub async fn current(&self, room_id: &RoomId) -> Option<OutboundGroupSession> {
        self.slot_for(room_id).lock().await.session.clone()
    }
}
