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

//! The external collaborators this engine consumes but does not own: the
//! device registry and the to-device transport. Both are injected
//! as trait objects so the engine stays free of HTTP/sync-loop concerns.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use ruma::{DeviceId, DeviceKeyAlgorithm, OwnedDeviceId, OwnedUserId, UserId};
use thiserror::Error;
use vodozemac::{Curve25519PublicKey, Ed25519Signature};

use crate::types::DeviceInfo;

/// `user -> device -> DeviceInfo`, filtered to the devices eligible to
/// receive a room key (blocked and, per room policy, unverified devices
/// already excluded by the caller that builds this set).
pub type TargetDeviceSet = HashMap<OwnedUserId, HashMap<OwnedDeviceId, DeviceInfo>>;

/// A one-time key as returned by `/keys/claim`, still unverified: the
/// key-sharing coordinator checks `signature` against the device's own
/// Ed25519 signing key before using it.
#[derive(Debug, Clone)]
pub struct ClaimedOneTimeKey {
    pub key_id: String,
    pub key: Curve25519PublicKey,
    pub signature: Ed25519Signature,
}

#[derive(Debug, Error)]
pub enum DeviceRegistryError {
    #[error("device registry backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("one-time-key claim timed out after {0:?}")]
    ClaimTimeout(Duration),

    #[error("to-device send failed: {0}")]
    SendFailed(String),

    #[error("transport backend error: {0}")]
    Backend(String),
}

/// Read-only view of `user -> device -> (identity_key, signing_key, blocked,
/// verified)`, consumed by the outbound session manager and key-sharing
/// coordinator.
#[async_trait]
pub trait DeviceRegistry: std::fmt::Debug + Send + Sync {
    /// Refresh (or force-refresh) the device list for the given users.
    async fn download_keys(
        &self,
        users: &[OwnedUserId],
        force: bool,
    ) -> Result<TargetDeviceSet, DeviceRegistryError>;

    /// Look up a single already-known device without a network round trip.
    async fn get_stored_device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceInfo>, DeviceRegistryError>;
}

/// Abstracts the to-device send and the one-time-key claim RPC, consumed by
/// the key-sharing coordinator.
#[async_trait]
pub trait Transport: std::fmt::Debug + Send + Sync {
    /// Claim one one-time key per `(user, device)`, per the given timeout
    /// (longer when the claim is a background prefetch than when a send is
    /// blocked on it).
    async fn claim_one_time_keys(
        &self,
        devices: &[(OwnedUserId, OwnedDeviceId)],
        algorithm: DeviceKeyAlgorithm,
        timeout: Duration,
    ) -> Result<HashMap<OwnedUserId, HashMap<OwnedDeviceId, ClaimedOneTimeKey>>, TransportError>;

    /// Bulk to-device send; `messages` is `user -> device -> content`.
    async fn send_to_device(
        &self,
        event_type: &str,
        messages: HashMap<OwnedUserId, HashMap<OwnedDeviceId, serde_json::Value>>,
    ) -> Result<(), TransportError>;
}
