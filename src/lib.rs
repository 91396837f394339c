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

#![doc = include_str!("../README.md")]
#![warn(
    missing_debug_implementations,
    dead_code,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications
)]

pub mod config;
pub mod engine;
pub mod error;
pub mod external;
pub mod key_sharing;
pub mod olm;
pub mod pipeline;
pub mod store;
pub mod types;

pub use config::SessionConfig;
pub use engine::{CryptoEngine, EncryptionSettings, TargetDeviceSet};
pub use error::{EventError, MegolmError, OlmError, SignatureError};
pub use external::{ClaimedOneTimeKey, DeviceRegistry, DeviceRegistryError, Transport, TransportError};
pub use key_sharing::{KeySharingCoordinator, PrepareHandle};
pub use pipeline::{EncryptedEnvelope, PendingEvent, PipelineError};
pub use store::{CryptoStore, CryptoStoreError, MemoryStore, SharedStore};
pub use types::{Algorithm, DeviceInfo};
