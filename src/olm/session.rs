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

//! A single pairwise Olm (double-ratchet) session.

use std::time::{Duration, SystemTime};

use ruma::{OwnedDeviceId, OwnedUserId};
use serde::{Deserialize, Serialize};
use vodozemac::{
    olm::{Session as InnerSession, SessionConfig, SessionPickle as InnerSessionPickle},
    Curve25519PublicKey,
};

/// A cryptographic session that enables secure pairwise communication
/// between two devices. Identified by `(remote_identity_key,
/// local_session_id)` as the data model requires.
pub struct Session {
    pub(crate) user_id: OwnedUserId,
    pub(crate) device_id: OwnedDeviceId,
    pub(crate) remote_identity_key: Curve25519PublicKey,
    pub(crate) inner: InnerSession,
    pub(crate) created_using_fallback_key: bool,
    pub(crate) creation_time: SystemTime,
    pub(crate) last_use_time: SystemTime,
}

impl Session {
    pub(crate) fn from_vodozemac(
        user_id: OwnedUserId,
        device_id: OwnedDeviceId,
        remote_identity_key: Curve25519PublicKey,
        inner: InnerSession,
        created_using_fallback_key: bool,
    ) -> Self {
        let now = SystemTime::now();

        Self {
            user_id,
            device_id,
            remote_identity_key,
            inner,
            created_using_fallback_key,
            creation_time: now,
            last_use_time: now,
        }
    }

    /// Returns the unique identifier for this session.
    pub fn session_id(&self) -> String {
        self.inner.session_id()
    }

    pub fn remote_identity_key(&self) -> Curve25519PublicKey {
        self.remote_identity_key
    }

    /// Check if a pre-key Olm message was encrypted for this session,
    /// without mutating ratchet state. Used by the session-selection rule
    /// when deciding which existing session to try against an inbound
    /// prekey message.
    pub fn matches_inbound(&self, message: &vodozemac::olm::PreKeyMessage) -> bool {
        self.inner.session_keys() == message.session_keys()
    }

    /// Encrypt the given plaintext, advancing the ratchet.
    pub fn encrypt(&mut self, plaintext: &str) -> vodozemac::olm::OlmMessage {
        self.last_use_time = SystemTime::now();
        self.inner.encrypt(plaintext)
    }

    /// Decrypt the given message, advancing the ratchet.
    pub fn decrypt(
        &mut self,
        message: &vodozemac::olm::OlmMessage,
    ) -> Result<String, vodozemac::olm::DecryptionError> {
        let plaintext = self.inner.decrypt(message)?;
        self.last_use_time = SystemTime::now();
        String::from_utf8(plaintext).map_err(|_| vodozemac::olm::DecryptionError::InvalidMessage)
    }

    /// Has this session gone unused for long enough that we should suspect
    /// it's wedged (the remote device silently rotated under us)?
    pub fn seems_wedged(&self, unwedging_interval: Duration) -> bool {
        SystemTime::now()
            .duration_since(self.creation_time)
            .map(|elapsed| elapsed >= unwedging_interval)
            .unwrap_or(true)
            && self.last_use_time == self.creation_time
    }

    pub fn pickle(&self) -> PickledSession {
        PickledSession {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            remote_identity_key: self.remote_identity_key,
            session_id: self.session_id(),
            pickle: self.inner.pickle(),
            created_using_fallback_key: self.created_using_fallback_key,
            creation_time: self.creation_time,
            last_use_time: self.last_use_time,
        }
    }

    pub fn from_pickle(pickle: PickledSession) -> Self {
        Self {
            user_id: pickle.user_id,
            device_id: pickle.device_id,
            remote_identity_key: pickle.remote_identity_key,
            inner: InnerSession::from_pickle(pickle.pickle),
            created_using_fallback_key: pickle.created_using_fallback_key,
            creation_time: pickle.creation_time,
            last_use_time: pickle.last_use_time,
        }
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.session_id() == other.session_id()
    }
}

/// A pickled, storable version of a [`Session`]; `remote_identity_key` plus
/// `session_id` together form the store key.
#[derive(Serialize, Deserialize)]
pub struct PickledSession {
    pub user_id: OwnedUserId,
    pub device_id: OwnedDeviceId,
    pub remote_identity_key: Curve25519PublicKey,
    pub session_id: String,
    pub pickle: InnerSessionPickle,
    pub created_using_fallback_key: bool,
    pub creation_time: SystemTime,
    pub last_use_time: SystemTime,
}

impl PickledSession {
    /// The map key under which the store groups sessions:
    /// `remote_identity_key`.
    pub fn remote_identity_key_str(&self) -> String {
        self.remote_identity_key.to_base64()
    }
}

pub(crate) fn default_session_config() -> SessionConfig {
    SessionConfig::version_2()
}
