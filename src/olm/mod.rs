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

//! The Olm device: identity key pair, one-time key pool, and the set
//! of pairwise Olm sessions keyed by remote Curve25519 identity key.

pub mod account;
pub mod group_sessions;
pub mod session;

use std::collections::HashMap;

use ruma::{DeviceKeyAlgorithm, OwnedDeviceId, OwnedUserId};
use vodozemac::{
    olm::{OlmMessage, PreKeyMessage},
    Curve25519PublicKey, KeyId,
};

pub use account::Account;
pub use group_sessions::{InboundGroupSession, OutboundGroupSession};
pub use session::Session;

use crate::error::OlmError;

/// Wire representation of an Olm message's `msg_type`/`body` pair:
/// `0` for a prekey message, `1` for a regular one.
#[derive(Debug, Clone)]
pub struct OlmCiphertext {
    pub msg_type: u8,
    pub body: String,
}

impl OlmCiphertext {
    fn from_message(message: OlmMessage) -> Self {
        match message {
            OlmMessage::PreKey(m) => Self { msg_type: 0, body: m.to_base64() },
            OlmMessage::Normal(m) => Self { msg_type: 1, body: m.to_base64() },
        }
    }

    fn into_message(self) -> Result<OlmMessage, OlmError> {
        match self.msg_type {
            0 => {
                let message = PreKeyMessage::from_base64(&self.body)
                    .map_err(|e| OlmError::CorruptSession(e.to_string()))?;
                Ok(OlmMessage::PreKey(message))
            }
            1 => {
                let message = vodozemac::olm::Message::from_base64(&self.body)
                    .map_err(|e| OlmError::CorruptSession(e.to_string()))?;
                Ok(OlmMessage::Normal(message))
            }
            other => Err(OlmError::CorruptSession(format!("unknown Olm message type {other}"))),
        }
    }
}

/// The Olm device: owns the identity and every pairwise session we have
/// with other devices, keyed by the remote device's Curve25519 identity
/// key (base64).
#[derive(Debug)]
pub struct OlmDevice {
    account: Account,
    /// Sessions per remote identity key, kept sorted by session id
    /// ascending so the session-selection rule is a simple linear
    /// scan.
    sessions: HashMap<String, Vec<Session>>,
}

impl OlmDevice {
    pub fn new(user_id: OwnedUserId, device_id: OwnedDeviceId) -> Self {
        Self { account: Account::new(user_id, device_id), sessions: HashMap::new() }
    }

    pub fn from_account(account: Account) -> Self {
        Self { account, sessions: HashMap::new() }
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn account_mut(&mut self) -> &mut Account {
        &mut self.account
    }

    /// Insert a previously-created or loaded session, keeping the
    /// per-identity list sorted by session id ascending as the selection
    /// rule requires.
    pub fn insert_session(&mut self, session: Session) {
        let key = session.remote_identity_key().to_base64();
        let list = self.sessions.entry(key).or_default();

        if !list.iter().any(|s| s.session_id() == session.session_id()) {
            list.push(session);
            list.sort_by_key(|s| s.session_id());
        }
    }

    pub fn sessions_for(&self, remote_identity_key: Curve25519PublicKey) -> &[Session] {
        self.sessions.get(&remote_identity_key.to_base64()).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Pickle every session held for a remote identity key, for the caller
    /// to write through to the store after a mutation (creation, encrypt,
    /// or decrypt all advance or add to this list).
    pub fn session_pickles_for(
        &self,
        remote_identity_key: Curve25519PublicKey,
    ) -> Vec<session::PickledSession> {
        self.sessions_for(remote_identity_key).iter().map(Session::pickle).collect()
    }

    /// `create_outbound(remote_identity_key, remote_one_time_key) ->
    /// session_id`.
    pub fn create_outbound(
        &mut self,
        remote_identity_key: Curve25519PublicKey,
        remote_one_time_key: Curve25519PublicKey,
    ) -> String {
        let session = self.account.create_outbound_session(remote_identity_key, remote_one_time_key);
        let session_id = session.session_id();
        self.insert_session(session);
        session_id
    }

    /// `encrypt(remote_identity_key, plaintext) -> {msg_type, body}`.
    ///
    /// Selects the lowest session id for outbound use. Fails with
    /// [`OlmError::NoSession`] if none exists; the caller (the key-sharing
    /// coordinator) is expected to claim a one-time key and retry.
    pub fn encrypt(
        &mut self,
        remote_identity_key: Curve25519PublicKey,
        plaintext: &str,
    ) -> Result<OlmCiphertext, OlmError> {
        let key = remote_identity_key.to_base64();
        let sessions =
            self.sessions.get_mut(&key).ok_or_else(|| OlmError::NoSession(key.clone()))?;

        let session = sessions.first_mut().ok_or(OlmError::NoSession(key))?;
        Ok(OlmCiphertext::from_message(session.encrypt(plaintext)))
    }

    /// `decrypt(remote_identity_key, msg_type, body) -> plaintext`.
    ///
    /// Tries each existing session for that identity in session-id order.
    /// For a prekey message with no matching session, attempts to create
    /// one; a created-but-unused inbound session is never committed
    /// (inserted into `self.sessions`) unless decryption actually succeeds.
    pub fn decrypt(
        &mut self,
        remote_identity_key: Curve25519PublicKey,
        ciphertext: OlmCiphertext,
    ) -> Result<String, OlmError> {
        let is_prekey = ciphertext.msg_type == 0;
        let message = ciphertext.into_message()?;
        let key = remote_identity_key.to_base64();

        if let Some(sessions) = self.sessions.get_mut(&key) {
            if let OlmMessage::PreKey(ref prekey) = message {
                if let Some(session) =
                    sessions.iter_mut().find(|s| s.matches_inbound(prekey))
                {
                    // A matching session that fails to decrypt is fatal and
                    // is not retried against a fresh session: we return the
                    // error as-is rather than falling through to session
                    // creation.
                    return session
                        .decrypt(&message)
                        .map_err(|e| OlmError::CorruptSession(e.to_string()));
                }
            } else {
                for session in sessions.iter_mut() {
                    if let Ok(plaintext) = session.decrypt(&message) {
                        return Ok(plaintext);
                    }
                }
                return Err(OlmError::UnknownSession);
            }
        } else if !is_prekey {
            return Err(OlmError::UnknownSession);
        }

        // No existing session matched. Only a prekey message can bootstrap
        // a new inbound session.
        let OlmMessage::PreKey(prekey) = message else {
            return Err(OlmError::UnknownSession);
        };

        let (session, plaintext) = self.account.create_inbound_session(remote_identity_key, &prekey)?;
        self.insert_session(session);
        Ok(plaintext)
    }

    pub fn generate_one_time_keys(&mut self, n: usize) {
        self.account.generate_one_time_keys(n);
    }

    pub fn publish_one_time_keys(&self) -> Vec<(KeyId, Curve25519PublicKey)> {
        self.account.unpublished_one_time_keys().into_iter().collect()
    }

    pub fn mark_keys_published<'a>(&mut self, keys: impl IntoIterator<Item = &'a Curve25519PublicKey>) {
        self.account.mark_keys_published(keys);
    }

    /// The key algorithm one-time keys are claimed with, exposed so the
    /// key-sharing coordinator can build `/keys/claim` requests without
    /// hard-coding the ruma type.
    pub fn one_time_key_algorithm() -> DeviceKeyAlgorithm {
        DeviceKeyAlgorithm::SignedCurve25519
    }
}

#[cfg(test)]
mod tests {
    use ruma::{device_id, user_id};

    use super::*;

    fn make_device(user: &str, device: &str) -> OlmDevice {
        OlmDevice::new(user_id!(user).to_owned(), device_id!(device).to_owned())
    }

    #[test]
    fn round_trip_via_prekey_message() {
        let mut alice = make_device("@alice:example.org", "ALICE1");
        let mut bob = make_device("@bob:example.org", "BOB1");

        bob.generate_one_time_keys(1);
        let (key_id, one_time_key) = bob.publish_one_time_keys()[0];
        bob.mark_keys_published(&[one_time_key]);

        let bob_identity = bob.account().curve25519_key();
        let alice_identity = alice.account().curve25519_key();

        alice.create_outbound(bob_identity, one_time_key);
        let ciphertext = alice.encrypt(bob_identity, "hello bob").unwrap();
        assert_eq!(ciphertext.msg_type, 0);

        let plaintext = bob.decrypt(alice_identity, ciphertext).unwrap();
        assert_eq!(plaintext, "hello bob");

        // The session bob just created is now usable for the reply.
        let reply = bob.encrypt(alice_identity, "hello alice").unwrap();
        assert_eq!(reply.msg_type, 1);
        let plaintext = alice.decrypt(bob_identity, reply).unwrap();
        assert_eq!(plaintext, "hello alice");
    }

    #[test]
    fn encrypt_without_a_session_fails() {
        let mut alice = make_device("@alice:example.org", "ALICE1");
        let bob_identity = Curve25519PublicKey::from_base64(
            &make_device("@bob:example.org", "BOB1").account().curve25519_key().to_base64(),
        )
        .unwrap();

        let result = alice.encrypt(bob_identity, "hello");
        assert!(matches!(result, Err(OlmError::NoSession(_))));
    }

    #[test]
    fn failed_prekey_decrypt_does_not_commit_a_session() {
        let mut alice = make_device("@alice:example.org", "ALICE1");
        let mut bob = make_device("@bob:example.org", "BOB1");

        bob.generate_one_time_keys(1);
        let (key_id, one_time_key) = bob.publish_one_time_keys()[0];
        bob.mark_keys_published(&[one_time_key]);

        let bob_identity = bob.account().curve25519_key();
        alice.create_outbound(bob_identity, one_time_key);
        let mut ciphertext = alice.encrypt(bob_identity, "hello bob").unwrap();
        // Corrupt the ciphertext body so decryption fails even though it
        // still parses as a prekey message.
        ciphertext.body = ciphertext.body.chars().rev().collect();

        let alice_identity = alice.account().curve25519_key();
        let before = bob.sessions_for(alice_identity).len();
        let result = bob.decrypt(alice_identity, ciphertext);
        assert!(result.is_err());
        assert_eq!(bob.sessions_for(alice_identity).len(), before);
    }
}
