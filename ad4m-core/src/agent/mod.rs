//! The local agent: identity, key lifecycle and signing.
//!
//! An instance starts without keys. `initialize` generates an ed25519 key
//! pair and derives the agent's `did:key`. The private key is only ever
//! persisted sealed under the passphrase; `lock` wipes it from memory and
//! `unlock` must decrypt it again.
//!
//! Mutations take `turn` so a slow key derivation never races a profile
//! update.

pub mod crypto;

use crate::bus::ChangeBus;
use crate::config::KdfParams;
use crate::error::{CoreError, Result};
use crate::language::ExpressionSigner;
use crate::persistence::StateStore;
use ad4m_types::{Address, Agent, AgentStatus, ChangeEvent, ExpressionProof};
use crypto::SealedKey;
use ed25519_dalek::SigningKey;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use zeroize::Zeroizing;

pub use crypto::verify_expression;

/// Persisted agent record: profile plus sealed key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAgent {
    pub agent: Agent,
    pub key: SealedKey,
}

#[derive(Default)]
struct AgentState {
    stored: Option<StoredAgent>,
    /// Present only while unlocked
    signing_key: Option<SigningKey>,
}

/// Signs on behalf of the unlocked agent.
///
/// Holds its own copy of the key so no lock is held across adapter calls.
pub struct AgentSigner {
    did: String,
    key: SigningKey,
}

impl ExpressionSigner for AgentSigner {
    fn did(&self) -> &str {
        &self.did
    }

    fn sign(&self, payload: &[u8]) -> ExpressionProof {
        crypto::sign_payload(&self.key, payload)
    }
}

pub struct AgentService {
    state: RwLock<AgentState>,
    turn: Mutex<()>,
    kdf: KdfParams,
    store: Arc<dyn StateStore>,
    bus: ChangeBus,
}

impl AgentService {
    /// Load the persisted agent, if any. A loaded agent starts locked.
    pub async fn load(store: Arc<dyn StateStore>, bus: ChangeBus, kdf: KdfParams) -> Result<Self> {
        let stored = store.load_agent().await?.map(|mut stored| {
            stored.agent.locked = true;
            stored
        });
        if let Some(stored) = &stored {
            info!(did = %stored.agent.did, "agent loaded, locked");
        }
        Ok(Self {
            state: RwLock::new(AgentState {
                stored,
                signing_key: None,
            }),
            turn: Mutex::new(()),
            kdf,
            store,
            bus,
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.state.read().stored.is_some()
    }

    pub fn is_unlocked(&self) -> bool {
        self.state.read().signing_key.is_some()
    }

    pub fn did(&self) -> Option<String> {
        self.state.read().stored.as_ref().map(|s| s.agent.did.clone())
    }

    pub fn agent(&self) -> Option<Agent> {
        self.state.read().stored.as_ref().map(|s| s.agent.clone())
    }

    pub fn status(&self) -> AgentStatus {
        status_of(&self.state.read())
    }

    /// Generate keys for a fresh agent. The agent starts unlocked.
    pub async fn initialize(&self, passphrase: &str) -> Result<AgentStatus> {
        let _turn = self.turn.lock().await;
        if self.is_initialized() {
            return Err(CoreError::AgentAlreadyInitialized);
        }
        let (signing_key, verifying_key) = crypto::generate_keypair();
        let did = crypto::did_for_key(&verifying_key);
        let key = {
            let signing_key = signing_key.clone();
            let passphrase = Zeroizing::new(passphrase.to_string());
            let kdf = self.kdf;
            blocking(move || SealedKey::seal(&signing_key, &passphrase, kdf)).await?
        };
        let stored = StoredAgent {
            agent: Agent::new(did.clone()),
            key,
        };

        self.install(stored, signing_key).await?;
        info!(%did, "agent initialized");
        Ok(self.status())
    }

    /// Adopt an exported keystore for `did`.
    ///
    /// The blob must open with `passphrase` and its key must be `did`'s.
    pub async fn initialize_from_keystore(&self, did: &str, keystore: &str, passphrase: &str) -> Result<AgentStatus> {
        let _turn = self.turn.lock().await;
        if self.is_initialized() {
            return Err(CoreError::AgentAlreadyInitialized);
        }
        let mut stored: StoredAgent = serde_json::from_str(keystore)?;
        let signing_key = {
            let sealed = stored.key.clone();
            let passphrase = Zeroizing::new(passphrase.to_string());
            blocking(move || sealed.open(&passphrase)).await?
        };
        let derived = crypto::did_for_key(&signing_key.verifying_key());
        if derived != did || stored.agent.did != did {
            warn!(%did, %derived, "keystore does not belong to did");
            return Err(CoreError::AuthenticationFailed);
        }
        stored.agent.locked = false;

        self.install(stored, signing_key).await?;
        info!(%did, "agent initialized from keystore");
        Ok(self.status())
    }

    async fn install(&self, stored: StoredAgent, signing_key: SigningKey) -> Result<()> {
        self.store.save_agent(&stored).await?;
        let agent = stored.agent.clone();
        {
            let mut state = self.state.write();
            state.stored = Some(stored);
            state.signing_key = Some(signing_key);
        }
        self.bus.publish(ChangeEvent::AgentUpdated { agent });
        Ok(())
    }

    /// Re-seal the key under `passphrase` and wipe it from memory.
    pub async fn lock(&self, passphrase: &str) -> Result<AgentStatus> {
        let _turn = self.turn.lock().await;
        let (signing_key, mut agent) = {
            let state = self.state.read();
            let stored = state.stored.as_ref().ok_or(CoreError::AgentNotInitialized)?;
            let Some(signing_key) = &state.signing_key else {
                // Already locked; the sealed key stays as it is.
                return Ok(status_of(&state));
            };
            (signing_key.clone(), stored.agent.clone())
        };
        agent.locked = true;
        let sealed = {
            let passphrase = Zeroizing::new(passphrase.to_string());
            let kdf = self.kdf;
            blocking(move || SealedKey::seal(&signing_key, &passphrase, kdf)).await?
        };

        let stored = StoredAgent {
            agent: agent.clone(),
            key: sealed,
        };
        self.store.save_agent(&stored).await?;
        {
            let mut state = self.state.write();
            state.stored = Some(stored);
            // SigningKey zeroizes on drop.
            state.signing_key = None;
        }
        info!(did = %agent.did, "agent locked");
        self.bus.publish(ChangeEvent::AgentUpdated { agent });
        Ok(self.status())
    }

    /// Decrypt the sealed key. A wrong passphrase leaves the agent locked.
    pub async fn unlock(&self, passphrase: &str) -> Result<AgentStatus> {
        let _turn = self.turn.lock().await;
        let sealed = self
            .state
            .read()
            .stored
            .as_ref()
            .map(|s| s.key.clone())
            .ok_or(CoreError::AgentNotInitialized)?;

        let opened = {
            let passphrase = Zeroizing::new(passphrase.to_string());
            blocking(move || sealed.open(&passphrase)).await
        };
        let agent = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            let Some(stored) = state.stored.as_mut() else {
                return Err(CoreError::AgentNotInitialized);
            };
            match opened {
                Ok(signing_key) => {
                    stored.agent.locked = false;
                    let agent = stored.agent.clone();
                    state.signing_key = Some(signing_key);
                    agent
                }
                Err(e) => {
                    stored.agent.locked = true;
                    state.signing_key = None;
                    warn!(did = %stored.agent.did, "unlock failed");
                    return Err(e);
                }
            }
        };

        info!(did = %agent.did, "agent unlocked");
        self.bus.publish(ChangeEvent::AgentUpdated { agent });
        Ok(self.status())
    }

    /// A signer for the unlocked agent.
    pub fn signer(&self) -> Result<AgentSigner> {
        let state = self.state.read();
        let stored = state.stored.as_ref().ok_or(CoreError::AgentNotInitialized)?;
        let key = state.signing_key.as_ref().ok_or(CoreError::AgentLocked)?;
        Ok(AgentSigner {
            did: stored.agent.did.clone(),
            key: key.clone(),
        })
    }

    /// Replace the agent profile. The DID cannot change.
    pub async fn update_agent(&self, update: impl FnOnce(&mut Agent)) -> Result<Agent> {
        let _turn = self.turn.lock().await;
        let stored = {
            let state = self.state.read();
            let stored = state.stored.as_ref().ok_or(CoreError::AgentNotInitialized)?;
            if state.signing_key.is_none() {
                return Err(CoreError::AgentLocked);
            }
            let mut stored = stored.clone();
            let did = stored.agent.did.clone();
            update(&mut stored.agent);
            stored.agent.did = did;
            stored.agent.locked = false;
            stored
        };

        self.store.save_agent(&stored).await?;
        let agent = stored.agent.clone();
        self.state.write().stored = Some(stored);
        self.bus.publish(ChangeEvent::AgentUpdated {
            agent: agent.clone(),
        });
        Ok(agent)
    }

    pub async fn update_public_perspective(&self, perspective: Address) -> Result<Agent> {
        self.update_agent(|agent| agent.perspective = Some(perspective)).await
    }

    pub async fn update_direct_message_language(&self, language: Address) -> Result<Agent> {
        self.update_agent(|agent| agent.direct_message_language = Some(language))
            .await
    }

    /// The persisted record as JSON, for [`AgentService::initialize_from_keystore`].
    pub fn export_keystore(&self) -> Result<String> {
        let state = self.state.read();
        let stored = state.stored.as_ref().ok_or(CoreError::AgentNotInitialized)?;
        Ok(serde_json::to_string(stored)?)
    }
}

fn status_of(state: &AgentState) -> AgentStatus {
    match &state.stored {
        None => AgentStatus::default(),
        Some(stored) => AgentStatus {
            is_initialized: true,
            is_unlocked: state.signing_key.is_some(),
            did: Some(stored.agent.did.clone()),
            did_document: Some(did_document(&stored.agent.did)),
            error: None,
        },
    }
}

/// Run key derivation off the async workers.
async fn blocking<T: Send + 'static>(task: impl FnOnce() -> Result<T> + Send + 'static) -> Result<T> {
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| CoreError::Crypto(format!("key task failed: {e}")))?
}

fn did_document(did: &str) -> serde_json::Value {
    let key_id = format!("{did}#{}", did.trim_start_matches("did:key:"));
    json!({
        "@context": ["https://www.w3.org/ns/did/v1"],
        "id": did,
        "verificationMethod": [{
            "id": key_id,
            "type": "Ed25519VerificationKey2018",
            "controller": did,
        }],
        "authentication": [key_id],
    })
}
