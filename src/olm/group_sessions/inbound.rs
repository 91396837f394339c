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

//! The Megolm inbound store: one session per `(room_id, sender_key,
//! session_id)`, with replay detection over the decrypted message index.

use std::{collections::BTreeMap, sync::Arc};

use ruma::{MilliSecondsSinceUnixEpoch, OwnedEventId, OwnedRoomId, RoomId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use vodozemac::{
    megolm::{
        ExportedSessionKey, InboundGroupSession as InnerSession,
        InboundGroupSessionPickle as InnerPickle, MegolmMessage, SessionConfig, SessionKey,
    },
    Curve25519PublicKey, Ed25519PublicKey,
};

use crate::error::MegolmError;

fn session_config() -> SessionConfig {
    SessionConfig::version_2()
}

/// The `(event_id, origin_ts)` accepted at a given message index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenEntry {
    pub event_id: OwnedEventId,
    pub origin_ts: MilliSecondsSinceUnixEpoch,
}

/// One installed Megolm room key, able to decrypt every message encrypted
/// with it from `first_known_index` onward.
#[derive(Clone)]
pub struct InboundGroupSession {
    inner: Arc<Mutex<InnerSession>>,
    session_id: Arc<str>,
    room_id: OwnedRoomId,
    sender_key: Curve25519PublicKey,
    signing_key: Ed25519PublicKey,
    /// Curve25519 identity keys of any devices the key was forwarded
    /// through, oldest first; empty when received directly.
    forwarding_curve25519_key_chain: Arc<[Curve25519PublicKey]>,
    first_known_index: u32,
    /// `message_index -> (event_id, origin_ts)`, bounded to
    /// `seen_capacity` by evicting the lowest indices first.
    seen: Arc<Mutex<BTreeMap<u32, SeenEntry>>>,
    seen_capacity: usize,
}

impl InboundGroupSession {
    /// Install a freshly received `m.room_key` (or the initial leg of an
    /// `m.forwarded_room_key`, via [`Self::with_forwarding_chain`]).
    pub fn new(
        sender_key: Curve25519PublicKey,
        signing_key: Ed25519PublicKey,
        room_id: &RoomId,
        session_key: &SessionKey,
        seen_capacity: usize,
    ) -> Self {
        Self::with_forwarding_chain(
            sender_key,
            signing_key,
            room_id,
            session_key,
            Vec::new(),
            seen_capacity,
        )
    }

    pub fn with_forwarding_chain(
        sender_key: Curve25519PublicKey,
        signing_key: Ed25519PublicKey,
        room_id: &RoomId,
        session_key: &SessionKey,
        forwarding_curve25519_key_chain: Vec<Curve25519PublicKey>,
        seen_capacity: usize,
    ) -> Self {
        let session = InnerSession::new(session_key, session_config());
        let session_id = session.session_id();
        let first_known_index = session.first_known_index();

        Self {
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            room_id: room_id.to_owned(),
            sender_key,
            signing_key,
            forwarding_curve25519_key_chain: forwarding_curve25519_key_chain.into(),
            first_known_index,
            seen: Arc::new(Mutex::new(BTreeMap::new())),
            seen_capacity,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn sender_key(&self) -> Curve25519PublicKey {
        self.sender_key
    }

    pub fn signing_key(&self) -> Ed25519PublicKey {
        self.signing_key
    }

    pub fn first_known_index(&self) -> u32 {
        self.first_known_index
    }

    pub fn forwarding_curve25519_key_chain(&self) -> &[Curve25519PublicKey] {
        &self.forwarding_curve25519_key_chain
    }

    /// Is `other` a strictly better copy of the same session (lower
    /// `first_known_index`, i.e. can decrypt more of the history)? Used by
    /// the idempotent `install` operation.
    pub fn is_better_than(&self, other: &InboundGroupSession) -> bool {
        self.session_id() == other.session_id()
            && self.first_known_index() < other.first_known_index()
    }

    /// Decrypt a Megolm ciphertext, enforcing the index floor and replay
    /// invariants. Returns the parsed JSON payload
    /// (still carrying its own `room_id`/`type`/`content` fields so the
    /// caller can perform the room-binding check) plus the message index.
    pub async fn decrypt(
        &self,
        ciphertext: &MegolmMessage,
        event_id: &EventIdRef<'_>,
        origin_ts: MilliSecondsSinceUnixEpoch,
    ) -> Result<(Value, u32), MegolmError> {
        let message_index = ciphertext.message_index();
        if message_index < self.first_known_index {
            return Err(MegolmError::UnknownIndex {
                index: message_index,
                first_known_index: self.first_known_index,
            });
        }

        let decrypted = {
            let mut session = self.inner.lock().await;
            session.decrypt(ciphertext)?
        };

        self.check_and_record_replay(decrypted.message_index, event_id.0, origin_ts).await?;

        let payload: Value = serde_json::from_slice(&decrypted.plaintext)?;
        Ok((payload, decrypted.message_index))
    }

    async fn check_and_record_replay(
        &self,
        index: u32,
        event_id: &ruma::EventId,
        origin_ts: MilliSecondsSinceUnixEpoch,
    ) -> Result<(), MegolmError> {
        let mut seen = self.seen.lock().await;

        if let Some(existing) = seen.get(&index) {
            if existing.event_id == *event_id && existing.origin_ts == origin_ts {
                return Ok(());
            }
            return Err(MegolmError::Replay(index));
        }

        seen.insert(index, SeenEntry { event_id: event_id.to_owned(), origin_ts });

        while seen.len() > self.seen_capacity {
            if let Some(&lowest) = seen.keys().next() {
                seen.remove(&lowest);
            } else {
                break;
            }
        }

        Ok(())
    }

    /// Export the session at its current floor.
    pub async fn export_at(&self, index: u32) -> Option<ExportedSessionKey> {
        let index = index.max(self.first_known_index);
        self.inner.lock().await.export_at(index)
    }

    /// Export at `first_known_index`: the full history this device can
    /// decrypt.
    pub async fn export(&self) -> Option<ExportedSessionKey> {
        self.export_at(self.first_known_index).await
    }

    /// Re-create a session from an exported blob.
    pub fn from_export(
        sender_key: Curve25519PublicKey,
        signing_key: Ed25519PublicKey,
        room_id: &RoomId,
        exported: &ExportedSessionKey,
        forwarding_curve25519_key_chain: Vec<Curve25519PublicKey>,
        seen_capacity: usize,
    ) -> Self {
        let session = InnerSession::import(exported, session_config());
        let session_id = session.session_id();
        let first_known_index = session.first_known_index();

        Self {
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            room_id: room_id.to_owned(),
            sender_key,
            signing_key,
            forwarding_curve25519_key_chain: forwarding_curve25519_key_chain.into(),
            first_known_index,
            seen: Arc::new(Mutex::new(BTreeMap::new())),
            seen_capacity,
        }
    }

    pub async fn pickle(&self) -> PickledInboundGroupSession {
        let pickle = self.inner.lock().await.pickle();
        let seen = self.seen.lock().await.clone();

        PickledInboundGroupSession {
            pickle,
            room_id: self.room_id.clone(),
            sender_key: self.sender_key,
            signing_key: self.signing_key,
            forwarding_curve25519_key_chain: self.forwarding_curve25519_key_chain.to_vec(),
            first_known_index: self.first_known_index,
            seen,
            seen_capacity: self.seen_capacity,
        }
    }

    pub fn from_pickle(pickle: PickledInboundGroupSession) -> Self {
        let session = InnerSession::from_pickle(pickle.pickle);
        let session_id = session.session_id();

        Self {
            inner: Arc::new(Mutex::new(session)),
            session_id: session_id.into(),
            room_id: pickle.room_id,
            sender_key: pickle.sender_key,
            signing_key: pickle.signing_key,
            forwarding_curve25519_key_chain: pickle.forwarding_curve25519_key_chain.into(),
            first_known_index: pickle.first_known_index,
            seen: Arc::new(Mutex::new(pickle.seen)),
            seen_capacity: pickle.seen_capacity,
        }
    }
}

/// Thin wrapper so `decrypt` can take `event_id` alongside the ciphertext
/// without borrowing issues around `ruma::EventId`'s unsized `?Sized` form.
pub struct EventIdRef<'a>(pub &'a ruma::EventId);

impl std::fmt::Debug for InboundGroupSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundGroupSession")
            .field("session_id", &self.session_id)
            .field("room_id", &self.room_id)
            .field("first_known_index", &self.first_known_index)
            .finish()
    }
}

/// A pickled, storable [`InboundGroupSession`].
#[derive(Serialize, Deserialize)]
pub struct PickledInboundGroupSession {
    pub pickle: InnerPickle,
    pub room_id: OwnedRoomId,
    pub sender_key: Curve25519PublicKey,
    pub signing_key: Ed25519PublicKey,
    pub forwarding_curve25519_key_chain: Vec<Curve25519PublicKey>,
    pub first_known_index: u32,
    pub seen: BTreeMap<u32, SeenEntry>,
    pub seen_capacity: usize,
}

#[cfg(test)]
mod tests {
    use ruma::{event_id, room_id, MilliSecondsSinceUnixEpoch};
    use vodozemac::{megolm::GroupSession, Curve25519PublicKey, Ed25519PublicKey};

    use super::*;

    fn dummy_keys() -> (Curve25519PublicKey, Ed25519PublicKey) {
        let account = vodozemac::olm::Account::new();
        (account.curve25519_key(), account.ed25519_key())
    }

    async fn paired_sessions(
        seen_capacity: usize,
    ) -> (GroupSession, InboundGroupSession) {
        let outbound = GroupSession::new(session_config_outbound());
        let (sender_key, signing_key) = dummy_keys();
        let inbound = InboundGroupSession::new(
            sender_key,
            signing_key,
            room_id!("!room:example.org"),
            &outbound.session_key(),
            seen_capacity,
        );
        (outbound, inbound)
    }

    fn session_config_outbound() -> vodozemac::megolm::SessionConfig {
        vodozemac::megolm::SessionConfig::version_2()
    }

    #[tokio::test]
    async fn replay_with_identical_tuple_is_accepted() {
        let (mut outbound, inbound) = paired_sessions(100).await;
        let message = outbound.encrypt(
            serde_json::json!({"room_id": "!room:example.org", "type": "m.room.message", "content": {}})
                .to_string()
                .as_bytes(),
        );

        let event_id = EventIdRef(event_id!("$a"));
        let ts = MilliSecondsSinceUnixEpoch(ruma::UInt::try_from(1000u64).unwrap());

        inbound.decrypt(&message, &event_id, ts).await.unwrap();
        // Re-decrypting the identical (event_id, origin_ts) pair is allowed.
        inbound.decrypt(&message, &event_id, ts).await.unwrap();
    }

    #[tokio::test]
    async fn replay_with_different_tuple_is_rejected() {
        let (mut outbound, inbound) = paired_sessions(100).await;
        let message = outbound.encrypt(b"{\"room_id\":\"!room:example.org\",\"type\":\"m.room.message\",\"content\":{}}");

        let ts_a = MilliSecondsSinceUnixEpoch(ruma::UInt::try_from(1000u64).unwrap());
        let ts_b = MilliSecondsSinceUnixEpoch(ruma::UInt::try_from(2000u64).unwrap());

        inbound.decrypt(&message, &EventIdRef(event_id!("$a")), ts_a).await.unwrap();
        let result = inbound.decrypt(&message, &EventIdRef(event_id!("$b")), ts_b).await;
        assert!(matches!(result, Err(MegolmError::Replay(0))));
    }

    #[tokio::test]
    async fn seen_map_evicts_lowest_index_first() {
        let (mut outbound, inbound) = paired_sessions(2).await;

        for i in 0..3u64 {
            let message = outbound.encrypt(b"{\"room_id\":\"!room:example.org\",\"type\":\"m.room.message\",\"content\":{}}");
            let event_id_str = format!("$event{i}");
            let ts = MilliSecondsSinceUnixEpoch(ruma::UInt::try_from(1000 + i).unwrap());
            let owned = ruma::OwnedEventId::try_from(event_id_str).unwrap();
            inbound.decrypt(&message, &EventIdRef(&owned), ts).await.unwrap();
        }

        let seen = inbound.seen.lock().await;
        assert_eq!(seen.len(), 2);
        assert!(!seen.contains_key(&0));
        assert!(seen.contains_key(&2));
    }

    #[tokio::test]
    async fn index_below_floor_is_rejected() {
        let (mut outbound, _) = paired_sessions(10).await;
        let message = outbound.encrypt(b"{\"room_id\":\"!room:example.org\",\"type\":\"m.room.message\",\"content\":{}}");

        let exported = {
            let session_key = outbound.session_key();
            let (sender_key, signing_key) = dummy_keys();
            let full = InboundGroupSession::new(
                sender_key,
                signing_key,
                room_id!("!room:example.org"),
                &session_key,
                10,
            );
            // Advance past index 0 so a re-export starts at index 1.
            let ts = MilliSecondsSinceUnixEpoch(ruma::UInt::try_from(1000u64).unwrap());
            full.decrypt(&message, &EventIdRef(event_id!("$a")), ts).await.unwrap();
            let second = outbound.encrypt(b"{\"room_id\":\"!room:example.org\",\"type\":\"m.room.message\",\"content\":{}}");
            let ts2 = MilliSecondsSinceUnixEpoch(ruma::UInt::try_from(1001u64).unwrap());
            full.decrypt(&second, &EventIdRef(event_id!("$b")), ts2).await.unwrap();
            full.export_at(1).await.unwrap()
        };

        let (sender_key, signing_key) = dummy_keys();
        let truncated = InboundGroupSession::from_export(
            sender_key,
            signing_key,
            room_id!("!room:example.org"),
            &exported,
            Vec::new(),
            10,
        );
        assert_eq!(truncated.first_known_index(), 1);

        let replay = outbound.encrypt(b"never used");
        let _ = replay; // first message (index 0) is not re-derivable from `truncated`.

        let ts = MilliSecondsSinceUnixEpoch(ruma::UInt::try_from(1000u64).unwrap());
        let result = truncated.decrypt(&message, &EventIdRef(event_id!("$a")), ts).await;
        assert!(matches!(result, Err(MegolmError::UnknownIndex { index: 0, .. })));
    }
}
