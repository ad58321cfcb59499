//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Settings the engine needs at startup.
///
/// Loaded by the executor from YAML and CLI flags; every field has a
/// default so a partial file is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Directory for persisted state. None keeps everything in memory.
    #[serde(default)]
    pub data_path: Option<PathBuf>,

    /// Per-subscriber queue length on the change bus
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,

    /// Lifetime of a permitted pairing code
    #[serde(default = "default_pairing_code_ttl_secs")]
    pub pairing_code_ttl_secs: u64,

    /// Lifetime of tokens minted from pairing codes. None = no expiry.
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: Option<u64>,

    /// Credential that redeems to an all-access token
    #[serde(default)]
    pub admin_credential: Option<String>,

    /// HMAC secret for capability tokens. None picks a random one per process,
    /// which invalidates issued tokens on restart.
    #[serde(default)]
    pub jwt_secret: Option<String>,

    #[serde(default)]
    pub kdf: KdfParams,
}

fn default_bus_capacity() -> usize {
    256
}

fn default_pairing_code_ttl_secs() -> u64 {
    300
}

fn default_token_ttl_secs() -> Option<u64> {
    Some(180 * 24 * 60 * 60)
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_path: None,
            bus_capacity: default_bus_capacity(),
            pairing_code_ttl_secs: default_pairing_code_ttl_secs(),
            token_ttl_secs: default_token_ttl_secs(),
            admin_credential: None,
            jwt_secret: None,
            kdf: KdfParams::default(),
        }
    }
}

impl CoreConfig {
    /// In-memory config with cheap key derivation, for tests and demos.
    pub fn ephemeral() -> Self {
        Self {
            kdf: KdfParams::fast(),
            ..Self::default()
        }
    }

    pub fn pairing_code_ttl(&self) -> Duration {
        Duration::from_secs(self.pairing_code_ttl_secs)
    }

    pub fn token_ttl(&self) -> Option<Duration> {
        self.token_ttl_secs.map(Duration::from_secs)
    }
}

/// Argon2id cost parameters for passphrase-derived keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 65536,
            iterations: 3,
            parallelism: 4,
        }
    }
}

impl KdfParams {
    pub fn fast() -> Self {
        Self {
            memory_kib: 256,
            iterations: 1,
            parallelism: 1,
        }
    }
}
