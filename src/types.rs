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

//! Wire payload shapes that `ruma`'s event-content types don't already
//! cover one-to-one (the `m.room_key`/`m.forwarded_room_key` inner payloads
//! carry a `chain_index` the real `ruma::events::room_key` content doesn't
//! have, and `m.room_key_request` has no `ruma` type in scope here), plus
//! the `Algorithm` dispatch tag used to route an encrypted envelope.

use ruma::{OwnedDeviceId, OwnedRoomId, OwnedTransactionId, OwnedUserId};
use serde::{Deserialize, Serialize};
use vodozemac::{Curve25519PublicKey, Ed25519PublicKey};

/// The `m.megolm…`/`m.olm…` dispatch tag used to route an encrypted
/// envelope to the right decryptor. `Unknown` is the forward-compat
/// fallback for wire strings this engine doesn't implement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Algorithm {
    MegolmV1AesSha2,
    OlmV1Curve25519AesSha2,
    Unknown(String),
}

impl Algorithm {
    pub fn as_str(&self) -> &str {
        match self {
            Algorithm::MegolmV1AesSha2 => "m.megolm.v1.aes-sha2",
            Algorithm::OlmV1Curve25519AesSha2 => "m.olm.v1.curve25519-aes-sha2",
            Algorithm::Unknown(s) => s,
        }
    }
}

impl From<&str> for Algorithm {
    fn from(value: &str) -> Self {
        match value {
            "m.megolm.v1.aes-sha2" => Algorithm::MegolmV1AesSha2,
            "m.olm.v1.curve25519-aes-sha2" => Algorithm::OlmV1Curve25519AesSha2,
            other => Algorithm::Unknown(other.to_owned()),
        }
    }
}

impl Serialize for Algorithm {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Algorithm {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Algorithm::from(String::deserialize(deserializer)?.as_str()))
    }
}

/// The `m.room_key` payload carried inside an Olm-encrypted to-device
/// message. `chain_index` is the message index at which the recipient
/// should start decrypting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomKeyContent {
    pub algorithm: Algorithm,
    pub room_id: OwnedRoomId,
    pub session_id: String,
    pub session_key: String,
    pub chain_index: u32,
}

/// The `m.forwarded_room_key` payload: a `RoomKeyContent` plus provenance of
/// who actually created the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardedRoomKeyContent {
    pub algorithm: Algorithm,
    pub room_id: OwnedRoomId,
    pub session_id: String,
    pub session_key: String,
    pub chain_index: u32,
    pub sender_key: Curve25519PublicKey,
    pub sender_claimed_ed25519_key: Ed25519PublicKey,
    pub forwarding_curve25519_key_chain: Vec<Curve25519PublicKey>,
}

/// `m.room_key_request`'s `action` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKeyRequestAction {
    Request,
    RequestCancellation,
}

/// The session identifying a room key being requested or forwarded, present
/// only when `action == "request"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomKeyRequestBody {
    pub algorithm: Algorithm,
    pub room_id: OwnedRoomId,
    pub sender_key: Curve25519PublicKey,
    pub session_id: String,
}

/// `m.room_key_request` / cancellation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomKeyRequestContent {
    pub action: RoomKeyRequestAction,
    pub requesting_device_id: OwnedDeviceId,
    pub request_id: OwnedTransactionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<RoomKeyRequestBody>,
}

/// A device as reported by the device registry's `download_keys`/
/// `get_stored_device` calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub user_id: OwnedUserId,
    pub device_id: OwnedDeviceId,
    pub curve25519_key: Curve25519PublicKey,
    pub ed25519_key: Ed25519PublicKey,
    pub blocked: bool,
    pub verified: bool,
    pub algorithms: Vec<String>,
}

impl DeviceInfo {
    /// Eligible to receive a room key: not blocked, and it advertises an
    /// algorithm this engine implements. Unverified-device exclusion is a
    /// room-level policy decision, applied by the caller building the
    /// `target_device_set` from its own trust/verification state.
    pub fn supports_megolm(&self) -> bool {
        !self.blocked
            && self.algorithms.iter().any(|a| a == Algorithm::MegolmV1AesSha2.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_algorithm_round_trips_its_wire_string() {
        let algorithm = Algorithm::from("m.future.algorithm");
        assert_eq!(algorithm.as_str(), "m.future.algorithm");
        assert_eq!(serde_json::to_string(&algorithm).unwrap(), "\"m.future.algorithm\"");
    }

    #[test]
    fn room_key_content_serializes_with_chain_index() {
        let content = RoomKeyContent {
            algorithm: Algorithm::MegolmV1AesSha2,
            room_id: ruma::room_id!("!room:example.org").to_owned(),
            session_id: "abc".to_owned(),
            session_key: "key".to_owned(),
            chain_index: 0,
        };

        let value = serde_json::to_value(&content).unwrap();
        assert_eq!(value["algorithm"], "m.megolm.v1.aes-sha2");
        assert_eq!(value["chain_index"], 0);
    }
}
