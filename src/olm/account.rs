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

//! The Olm identity: the long-lived identity key pair, the one-time
//! key pool, and creation of new pairwise sessions.

use std::collections::{BTreeMap, HashMap};

use ruma::{OwnedDeviceId, OwnedUserId};
use serde::{Deserialize, Serialize};
use vodozemac::{
    olm::{
        Account as InnerAccount, AccountPickle as InnerAccountPickle, InboundCreationResult,
        OlmMessage, PreKeyMessage, SessionConfig, SessionCreationError,
    },
    Curve25519PublicKey, Ed25519PublicKey, Ed25519Signature, KeyId,
};

use crate::{error::OlmError, olm::session::Session};

/// The lifecycle state of a one-time key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OneTimeKeyState {
    Unpublished,
    Published,
}

/// The long-lived Olm identity for this device: the Curve25519/Ed25519
/// key pair plus the one-time key pool.
///
/// Owned exclusively by the engine; every mutation (new keys generated, keys
/// marked published, a session created) is followed by a `save_account`
/// call to the store so the identity is never reused across a crash.
pub struct Account {
    user_id: OwnedUserId,
    device_id: OwnedDeviceId,
    inner: InnerAccount,
    /// Tracks which one-time keys have been published, keyed by the key's
    /// own base64 public value rather than its `KeyId` index, so the pickle
    /// is a plain string-keyed JSON map. `publish_one_time_keys` only
    /// returns the unpublished subset and a key is never signed and
    /// uploaded twice.
    published: HashMap<String, OneTimeKeyState>,
}

/// Target size of the one-time key pool; new keys are generated on demand
/// up to this count.
pub const ONE_TIME_KEY_TARGET: usize = 50;

impl Account {
    /// Create a brand new identity. Called once per device, at first use;
    /// after this the identity is loaded from the store.
    pub fn new(user_id: OwnedUserId, device_id: OwnedDeviceId) -> Self {
        Self { user_id, device_id, inner: InnerAccount::new(), published: HashMap::new() }
    }

    pub fn user_id(&self) -> &ruma::UserId {
        &self.user_id
    }

    pub fn device_id(&self) -> &ruma::DeviceId {
        &self.device_id
    }

    pub fn curve25519_key(&self) -> Curve25519PublicKey {
        self.inner.curve25519_key()
    }

    pub fn ed25519_key(&self) -> Ed25519PublicKey {
        self.inner.ed25519_key()
    }

    /// Sign an arbitrary message with our Ed25519 signing key, used to sign
    /// the device-keys upload and every one-time key we publish.
    pub fn sign(&self, message: &str) -> Ed25519Signature {
        self.inner.sign(message)
    }

    /// Generate `count` new one-time keys, on top of whatever is already
    /// unpublished. Keeps the pool at `ONE_TIME_KEY_TARGET` by capping how
    /// many are generated if the pool is already large enough.
    pub fn generate_one_time_keys(&mut self, count: usize) {
        let unpublished =
            self.published.values().filter(|s| **s == OneTimeKeyState::Unpublished).count();
        let to_generate = count.min(ONE_TIME_KEY_TARGET.saturating_sub(unpublished));

        if to_generate == 0 {
            return;
        }

        self.inner.generate_one_time_keys(to_generate);

        for key in self.inner.one_time_keys().into_values() {
            self.published.entry(key.to_base64()).or_insert(OneTimeKeyState::Unpublished);
        }
    }

    /// Return the one-time keys that have not yet been uploaded, signed and
    /// ready to hand to the transport. Does not mark them published — the
    /// caller must call [`Account::mark_keys_published`] once the upload
    /// actually succeeds, otherwise a retried upload would skip them.
    pub fn unpublished_one_time_keys(&self) -> BTreeMap<KeyId, Curve25519PublicKey> {
        self.inner
            .one_time_keys()
            .into_iter()
            .filter(|(_, key)| {
                matches!(self.published.get(&key.to_base64()), None | Some(OneTimeKeyState::Unpublished))
            })
            .collect()
    }

    /// Mark the given one-time keys as published. Idempotent: marking an
    /// already-published key a second time is a no-op, so a duplicated retry
    /// of the upload response can't sign-and-send the same key twice.
    pub fn mark_keys_published<'a>(&mut self, keys: impl IntoIterator<Item = &'a Curve25519PublicKey>) {
        for key in keys {
            self.published.insert(key.to_base64(), OneTimeKeyState::Published);
        }
    }

    pub fn max_one_time_keys(&self) -> usize {
        self.inner.max_number_of_one_time_keys()
    }

    /// Create a brand-new outbound pairwise session using a one-time key we
    /// claimed from the remote device. Returns the `Session` wrapper; the
    /// caller (the key-sharing coordinator) installs it via the session
    /// manager.
    pub fn create_outbound_session(
        &self,
        remote_identity_key: Curve25519PublicKey,
        remote_one_time_key: Curve25519PublicKey,
    ) -> Session {
        let session = self.inner.create_outbound_session(
            crate::olm::session::default_session_config(),
            remote_identity_key,
            remote_one_time_key,
        );

        Session::from_vodozemac(
            self.user_id.clone(),
            self.device_id.clone(),
            remote_identity_key,
            session,
            false,
        )
    }

    /// Attempt to create an inbound session from a prekey message. A
    /// created-but-unused inbound session is *not*
    /// committed if decryption fails — this is enforced by the caller only
    /// installing the returned `Session` once it has successfully produced
    /// `plaintext`; this method itself can't partially mutate `self` since
    /// `vodozemac::olm::Account::create_inbound_session` is a pure
    /// function of the account's own keys plus the message.
    pub fn create_inbound_session(
        &mut self,
        remote_identity_key: Curve25519PublicKey,
        message: &PreKeyMessage,
    ) -> Result<(Session, String), OlmError> {
        let InboundCreationResult { session, plaintext } =
            self.inner.create_inbound_session(remote_identity_key, message).map_err(|e| match e {
                SessionCreationError::Decryption(d) => OlmError::Decryption(d),
                other => OlmError::Session(other),
            })?;

        let plaintext = String::from_utf8(plaintext)
            .map_err(|e| OlmError::CorruptSession(e.utf8_error().to_string()))?;

        Ok((
            Session::from_vodozemac(
                self.user_id.clone(),
                self.device_id.clone(),
                remote_identity_key,
                session,
                false,
            ),
            plaintext,
        ))
    }

    /// Decrypt a regular (non-prekey) message is not possible without an
    /// existing `Session` — kept here only as a reminder of the invariant:
    /// non-prekey + no session => `UnknownSession`.
    pub fn decrypt_requires_session(message: &OlmMessage) -> bool {
        !matches!(message, OlmMessage::PreKey(_))
    }

    pub fn pickle(&self) -> PickledAccount {
        PickledAccount {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            pickle: self.inner.pickle(),
            published: self.published.clone(),
        }
    }

    pub fn from_pickle(pickle: PickledAccount) -> Self {
        Self {
            user_id: pickle.user_id,
            device_id: pickle.device_id,
            inner: InnerAccount::from_pickle(pickle.pickle),
            published: pickle.published,
        }
    }
}

/// A pickled, storable version of an [`Account`].
#[derive(Serialize, Deserialize)]
pub struct PickledAccount {
    pub user_id: OwnedUserId,
    pub device_id: OwnedDeviceId,
    pub pickle: InnerAccountPickle,
    pub published: HashMap<String, OneTimeKeyState>,
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, user_id};

    use super::*;

    fn alice() -> Account {
        Account::new(user_id!("@alice:example.org").to_owned(), device_id!("ALICE1").to_owned())
    }

    #[test]
    fn one_time_keys_are_never_published_twice() {
        let mut account = alice();
        account.generate_one_time_keys(5);

        let first_batch: Vec<_> = account.unpublished_one_time_keys().into_values().collect();
        assert_eq!(first_batch.len(), 5);

        account.mark_keys_published(&first_batch);
        assert!(account.unpublished_one_time_keys().is_empty());

        // Marking the same ids published again must stay a no-op.
        account.mark_keys_published(&first_batch);
        assert!(account.unpublished_one_time_keys().is_empty());
    }

    #[test]
    fn pool_is_capped_at_target_size() {
        let mut account = alice();
        account.generate_one_time_keys(ONE_TIME_KEY_TARGET + 20);
        assert_eq!(account.unpublished_one_time_keys().len(), ONE_TIME_KEY_TARGET);
    }
}
