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

//! Engine-wide configurable options: the defaults a room's
//! `EncryptionSettings` falls back to when the room's own
//! `m.room.encryption` content doesn't override them.

use std::time::Duration;

/// Engine-wide defaults; a room's own `m.room.encryption` content can
/// override the rotation fields on a per-room basis (see
/// `olm::group_sessions::outbound::EncryptionSettings::new`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// After which an outbound Megolm session must rotate. Default 7 days.
    pub rotation_period_ms: u64,
    /// Message-count rotation bound. Default 100.
    pub rotation_period_msgs: u64,
    /// One-time-key claim timeout for a normal (non-prepared) share.
    pub otk_claim_timeout_standard_ms: u64,
    /// One-time-key claim timeout once `prepare_to_encrypt` has warmed the
    /// device list.
    pub otk_claim_timeout_prepared_ms: u64,
    /// Cap on the undecryptable backlog kept per `(sender_key, session_id)`.
    pub pending_queue_max_per_session: usize,
    /// Cap on replay-detection memory kept per inbound Megolm session.
    pub seen_index_eviction_threshold: usize,
    /// How long an Olm session may go without a successfully decrypted
    /// reply before the next claim forces a fresh one (session
    /// un-wedging).
    pub unwedging_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rotation_period_ms: 604_800_000,
            rotation_period_msgs: 100,
            otk_claim_timeout_standard_ms: 2_000,
            otk_claim_timeout_prepared_ms: 10_000,
            pending_queue_max_per_session: 1_000,
            seen_index_eviction_threshold: 10_000,
            unwedging_interval_ms: 3_600_000,
        }
    }
}

impl SessionConfig {
    pub fn rotation_period(&self) -> Duration {
        Duration::from_millis(self.rotation_period_ms)
    }

    pub fn unwedging_interval(&self) -> Duration {
        Duration::from_millis(self.unwedging_interval_ms)
    }

    pub fn otk_claim_timeout(&self, prepared: bool) -> Duration {
        Duration::from_millis(if prepared {
            self.otk_claim_timeout_prepared_ms
        } else {
            self.otk_claim_timeout_standard_ms
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = SessionConfig::default();
        assert_eq!(config.rotation_period_ms, 604_800_000);
        assert_eq!(config.rotation_period_msgs, 100);
        assert_eq!(config.otk_claim_timeout_standard_ms, 2_000);
        assert_eq!(config.otk_claim_timeout_prepared_ms, 10_000);
    }
}
