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

//! The persistence contract and an in-memory implementation used by
//! default and by tests.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use ruma::RoomId;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::olm::{
    account::PickledAccount, group_sessions::PickledInboundGroupSession, session::PickledSession,
};

/// Errors a `CryptoStore` implementation can raise.
#[derive(Debug, Error)]
pub enum CryptoStoreError {
    /// The backing serialization format rejected a pickle.
    #[error("failed to (de)serialize a stored pickle: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An opaque backend-specific failure (disk I/O, a poisoned transaction,
    /// ...). Kept as a string since the engine doesn't know the backend.
    #[error("crypto store backend error: {0}")]
    Backend(String),
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, CryptoStoreError>;

/// Key identifying an inbound Megolm session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InboundSessionKey {
    pub room_id: ruma::OwnedRoomId,
    pub sender_key: String,
    pub session_id: String,
}

impl InboundSessionKey {
    pub fn new(room_id: &RoomId, sender_key: &str, session_id: &str) -> Self {
        Self {
            room_id: room_id.to_owned(),
            sender_key: sender_key.to_owned(),
            session_id: session_id.to_owned(),
        }
    }
}

/// Opaque transactional get/put store for Olm account state, Olm sessions
/// keyed by remote identity key, Megolm inbound sessions, and the two
/// tracking bits the engine needs durable (`shared_with`, replay `seen`
/// indices are embedded in the pickled outbound/inbound session so they
/// ride along for free).
///
/// Implementations must make every method safe to call concurrently; the
/// default `MemoryStore` does so with an internal mutex per map.
#[async_trait]
pub trait CryptoStore: std::fmt::Debug + Send + Sync {
    /// Load the single Olm account, if one has been created yet.
    async fn load_account(&self) -> Result<Option<PickledAccount>>;

    /// Persist the Olm account. Called after every mutation (one-time key
    /// generation, signature, marking keys published) since the account is
    /// not safe to lose.
    async fn save_account(&self, account: PickledAccount) -> Result<()>;

    /// Load every pairwise Olm session for a remote identity key, in
    /// deterministic (session id ascending) order.
    async fn get_sessions(&self, remote_identity_key: &str) -> Result<Vec<PickledSession>>;

    /// Persist a pairwise Olm session.
    async fn save_session(&self, session: PickledSession) -> Result<()>;

    /// List every pairwise Olm session across every remote identity key,
    /// used to repopulate the Olm device's session table on startup.
    async fn get_all_sessions(&self) -> Result<Vec<PickledSession>>;

    /// Load the inbound Megolm session for a given key, if installed.
    async fn get_inbound_group_session(
        &self,
        key: &InboundSessionKey,
    ) -> Result<Option<PickledInboundGroupSession>>;

    /// Persist an inbound Megolm session (including its replay-detection
    /// `seen` map and `first_known_index`).
    async fn save_inbound_group_session(
        &self,
        key: InboundSessionKey,
        session: PickledInboundGroupSession,
    ) -> Result<()>;

    /// List every inbound Megolm session, for bulk export/backup.
    async fn get_all_inbound_group_sessions(&self) -> Result<Vec<PickledInboundGroupSession>>;
}

/// A simple in-process `CryptoStore`, used as the default backend and in
/// tests: one guarded map per entity kind, no cross-map transactions since
/// nothing here needs atomic multi-map writes.
#[derive(Debug, Default)]
pub struct MemoryStore {
    account: Mutex<Option<PickledAccount>>,
    sessions: Mutex<HashMap<String, Vec<PickledSession>>>,
    inbound_sessions: Mutex<HashMap<InboundSessionKey, PickledInboundGroupSession>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CryptoStore for MemoryStore {
    async fn load_account(&self) -> Result<Option<PickledAccount>> {
        Ok(self.account.lock().await.clone())
    }

    async fn save_account(&self, account: PickledAccount) -> Result<()> {
        *self.account.lock().await = Some(account);
        Ok(())
    }

    async fn get_sessions(&self, remote_identity_key: &str) -> Result<Vec<PickledSession>> {
        Ok(self.sessions.lock().await.get(remote_identity_key).cloned().unwrap_or_default())
    }

    async fn save_session(&self, session: PickledSession) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        let entry = sessions.entry(session.remote_identity_key_str()).or_default();

        if let Some(existing) = entry.iter_mut().find(|s| s.session_id == session.session_id) {
            *existing = session;
        } else {
            entry.push(session);
        }

        entry.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(())
    }

    async fn get_all_sessions(&self) -> Result<Vec<PickledSession>> {
        Ok(self.sessions.lock().await.values().flatten().cloned().collect())
    }

    async fn get_inbound_group_session(
        &self,
        key: &InboundSessionKey,
    ) -> Result<Option<PickledInboundGroupSession>> {
        Ok(self.inbound_sessions.lock().await.get(key).cloned())
    }

    async fn save_inbound_group_session(
        &self,
        key: InboundSessionKey,
        session: PickledInboundGroupSession,
    ) -> Result<()> {
        self.inbound_sessions.lock().await.insert(key, session);
        Ok(())
    }

    async fn get_all_inbound_group_sessions(&self) -> Result<Vec<PickledInboundGroupSession>> {
        Ok(self.inbound_sessions.lock().await.values().cloned().collect())
    }
}

/// A shared handle to a store, cheap to clone.
pub type SharedStore = Arc<dyn CryptoStore>;
