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

//! Error types returned by the crypto engine, one enum per failure domain.

use ruma::{OwnedDeviceId, OwnedRoomId, OwnedUserId};
use thiserror::Error;

use crate::store::CryptoStoreError;

/// Errors that the Olm pairwise session manager can return.
#[derive(Debug, Error)]
pub enum OlmError {
    /// No pairwise session exists with the remote identity key and one could
    /// not be created from the message; the caller should claim a one-time
    /// key and retry.
    #[error("no Olm session exists for the remote identity key {0}")]
    NoSession(String),

    /// A prekey message matched an existing session but failed to decrypt.
    /// Fatal: the message is not retried against a freshly created session.
    #[error("a matching Olm session failed to decrypt a prekey message: {0}")]
    CorruptSession(String),

    /// A regular (non-prekey) message arrived but no session for that
    /// identity key is known; surfaced so the caller can request a re-share.
    #[error("received a non-prekey Olm message with no matching session")]
    UnknownSession,

    /// Decrypting/pickling the underlying `vodozemac` session failed.
    #[error(transparent)]
    Session(#[from] vodozemac::olm::SessionCreationError),

    /// `vodozemac` decryption error (MAC failure, bad padding, ...).
    #[error(transparent)]
    Decryption(#[from] vodozemac::olm::DecryptionError),

    /// JSON (de)serialization of an Olm payload failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// The crypto store could not be read or written.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),

    /// The recipient device carries no Ed25519 signing key.
    #[error("the recipient device {0} has no Ed25519 signing key")]
    MissingSigningKey(OwnedDeviceId),
}

/// Errors that the event pipeline raises when validating a decrypted
/// Olm-wrapped to-device payload against the envelope it arrived in.
#[derive(Debug, Error)]
pub enum EventError {
    /// The payload's `recipient` did not match our own user id.
    #[error("the Olm payload was addressed to {actual}, not to us ({expected})")]
    RecipientMismatch { expected: OwnedUserId, actual: OwnedUserId },

    /// The payload's claimed recipient signing key did not match ours.
    #[error("the Olm payload's recipient_keys.ed25519 does not match our signing key")]
    MismatchedKeys,

    /// The payload's `sender` did not match the envelope's `sender`.
    #[error("the Olm payload claims sender {claimed}, the envelope says {envelope}")]
    SenderMismatch { claimed: OwnedUserId, envelope: OwnedUserId },

    /// The payload's `room_id` did not match the envelope's `room_id`.
    #[error("the Olm payload's room_id does not match the envelope's room_id")]
    RoomMismatch,

    /// The algorithm named in the envelope is not one this engine supports.
    #[error("unsupported encryption algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// The envelope is missing a field its algorithm requires.
    #[error("malformed encrypted envelope: {0}")]
    MalformedEnvelope(String),

    /// The room named in the request has no `m.room.encryption` state event.
    #[error("room {0} is not encrypted")]
    UnencryptedRoom(OwnedRoomId),
}

/// Errors that the Megolm inbound store can return from `decrypt`.
#[derive(Debug, Error)]
pub enum MegolmError {
    /// No inbound session is installed for `(room_id, sender_key,
    /// session_id)`. The event should be queued until the matching
    /// `m.room_key` arrives.
    #[error("no inbound Megolm session for session_id {0}")]
    UnknownSession(String),

    /// The session exists but the message index is below
    /// `first_known_index`, so this device cannot derive the key for it.
    #[error("message index {index} precedes the first known index {first_known_index}")]
    UnknownIndex { index: u32, first_known_index: u32 },

    /// The same `(sender_key, session_id, message_index)` was already seen
    /// paired with a different `(event_id, origin_ts)`.
    #[error("replay detected at message index {0}")]
    Replay(u32),

    /// The decrypted payload's `room_id` did not match the envelope's.
    #[error("the decrypted payload's room_id does not match the envelope's room_id")]
    RoomMismatch,

    /// AES-CBC/HMAC verification failed.
    #[error(transparent)]
    Decryption(#[from] vodozemac::megolm::DecryptionError),

    /// The session key or export blob could not be parsed.
    #[error(transparent)]
    SessionCreation(#[from] vodozemac::megolm::SessionKeyDecodeError),

    /// JSON (de)serialization of the decrypted payload failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// The crypto store could not be read or written.
    #[error(transparent)]
    Store(#[from] CryptoStoreError),
}

/// Errors from verifying a signature over a claimed one-time key or a
/// cross-device payload.
#[derive(Debug, Error)]
pub enum SignatureError {
    /// No signature was present for the expected signing key.
    #[error("no signature found for key {0}")]
    MissingSignature(String),

    /// The signature did not verify against the claimed signing key.
    #[error(transparent)]
    Verification(#[from] vodozemac::SignatureError),

    /// The key or signature was not validly encoded base64.
    #[error(transparent)]
    Decode(#[from] vodozemac::KeyError),
}

/// The stable, user-facing decryption failure code. UI renders an "unable
/// to decrypt" placeholder keyed on this and may later replace it once the
/// pending queue drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecryptionErrorCode {
    UnencryptedRoom,
    UnsupportedAlgorithm,
    NoSession,
    UnknownSession,
    UnknownIndex,
    MacFailure,
    CorruptSession,
    RoomMismatch,
    RecipientMismatch,
    SenderMismatch,
    Replay,
}

impl MegolmError {
    /// Whether this failure is recoverable by queueing the event and waiting
    /// for a key (soft), or whether it is fatal for the event (hard).
    pub fn is_recoverable(&self) -> bool {
        matches!(self, MegolmError::UnknownSession(_) | MegolmError::UnknownIndex { .. })
    }

    /// The stable error code surfaced to the UI.
    pub fn code(&self) -> DecryptionErrorCode {
        match self {
            MegolmError::UnknownSession(_) => DecryptionErrorCode::UnknownSession,
            MegolmError::UnknownIndex { .. } => DecryptionErrorCode::UnknownIndex,
            MegolmError::Replay(_) => DecryptionErrorCode::Replay,
            MegolmError::RoomMismatch => DecryptionErrorCode::RoomMismatch,
            MegolmError::Decryption(_) => DecryptionErrorCode::MacFailure,
            MegolmError::SessionCreation(_) => DecryptionErrorCode::CorruptSession,
            MegolmError::Json(_) | MegolmError::Store(_) => DecryptionErrorCode::MacFailure,
        }
    }
}
