//! Pairing requests: how an app obtains a capability token.
//!
//! Each request moves through
//!
//! ```text
//! Pending --permit--> Permitted{code, expires_at} --redeem--> Redeemed
//!                              |
//!                              +--(ttl passes)--> Expired
//! ```
//!
//! `Expired` is entered lazily, when a stale code is presented or the next
//! `permit` sweeps it. Codes are kept only as blake3 hashes. A new code
//! only has to differ from the live ones, so spent codes get reissued.

use super::CapabilityRequest;
use crate::error::{CoreError, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Number of decimal digits in a pairing code
pub const CODE_DIGITS: u32 = 6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum PairingState {
    Pending,
    Permitted {
        code_hash: String,
        expires_at: DateTime<Utc>,
    },
    Redeemed {
        token_id: String,
        redeemed_at: DateTime<Utc>,
    },
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingRequest {
    pub id: String,
    pub request: CapabilityRequest,
    pub requested_at: DateTime<Utc>,
    pub state: PairingState,
}

pub fn hash_code(code: &str) -> String {
    blake3::hash(code.as_bytes()).to_hex().to_string()
}

/// All pairing requests of one guard.
#[derive(Debug, Default)]
pub struct PairingBook {
    requests: HashMap<String, PairingRequest>,
    /// code hash -> request id, while the request is `Permitted`
    live: HashMap<String, String>,
    /// code hash -> request id, once redeemed or expired
    spent: HashMap<String, String>,
}

impl PairingBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&PairingRequest> {
        self.requests.get(id)
    }

    pub fn requests(&self) -> impl Iterator<Item = &PairingRequest> {
        self.requests.values()
    }

    /// Store a new pending request and return its id.
    pub fn request(&mut self, request: CapabilityRequest, now: DateTime<Utc>) -> String {
        let id = Uuid::new_v4().to_string();
        self.insert_pending(id.clone(), request, now);
        id
    }

    pub(super) fn insert_pending(&mut self, id: String, request: CapabilityRequest, now: DateTime<Utc>) {
        self.requests.insert(
            id.clone(),
            PairingRequest {
                id,
                request,
                requested_at: now,
                state: PairingState::Pending,
            },
        );
    }

    /// Move a pending request to `Permitted`, returning the fresh code.
    pub fn permit(&mut self, id: &str, now: DateTime<Utc>, ttl: chrono::Duration) -> Result<String> {
        let entry = self
            .requests
            .get(id)
            .ok_or_else(|| CoreError::NotFound(format!("pairing request {id}")))?;
        if entry.state != PairingState::Pending {
            return Err(CoreError::RequestNotPending(id.to_string()));
        }

        self.sweep(now);
        let space = 10u32.pow(CODE_DIGITS);
        if self.live.len() >= space as usize {
            return Err(CoreError::PairingCodesExhausted);
        }

        let mut rng = rand::thread_rng();
        let (code, code_hash) = loop {
            let code = format!("{:0width$}", rng.gen_range(0..space), width = CODE_DIGITS as usize);
            let code_hash = hash_code(&code);
            if !self.live.contains_key(&code_hash) {
                break (code, code_hash);
            }
        };

        self.mark_permitted(id, code_hash, now + ttl);
        Ok(code)
    }

    pub(super) fn mark_permitted(&mut self, id: &str, code_hash: String, expires_at: DateTime<Utc>) {
        if let Some(entry) = self.requests.get_mut(id) {
            self.spent.remove(&code_hash);
            self.live.insert(code_hash.clone(), id.to_string());
            entry.state = PairingState::Permitted {
                code_hash,
                expires_at,
            };
        }
    }

    /// Expire every permitted request whose code is past its ttl.
    fn sweep(&mut self, now: DateTime<Utc>) {
        let stale: Vec<String> = self
            .live
            .iter()
            .filter(|(_, id)| {
                !self.requests.get(*id).is_some_and(|entry| {
                    matches!(entry.state, PairingState::Permitted { expires_at, .. } if expires_at > now)
                })
            })
            .map(|(hash, _)| hash.clone())
            .collect();
        for hash in stale {
            if let Some(id) = self.live.remove(&hash) {
                if let Some(entry) = self.requests.get_mut(&id) {
                    if matches!(entry.state, PairingState::Permitted { .. }) {
                        entry.state = PairingState::Expired;
                    }
                }
                self.spent.insert(hash, id);
            }
        }
    }

    /// When the live code `code` stops being valid.
    pub(super) fn code_expiry(&self, code: &str) -> Option<DateTime<Utc>> {
        let id = self.live.get(&hash_code(code))?;
        match self.requests.get(id)?.state {
            PairingState::Permitted { expires_at, .. } => Some(expires_at),
            _ => None,
        }
    }

    /// Check `code` and mark its request redeemed, in one step.
    ///
    /// `token_id` names the token the caller is about to mint.
    pub fn redeem(&mut self, code: &str, token_id: &str, now: DateTime<Utc>) -> Result<&PairingRequest> {
        let code_hash = hash_code(code);
        let id = self
            .live
            .get(&code_hash)
            .or_else(|| self.spent.get(&code_hash))
            .cloned()
            .ok_or_else(|| CoreError::NotFound("pairing code".into()))?;
        let entry = self
            .requests
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound("pairing code".into()))?;

        let stale = matches!(
            entry.state,
            PairingState::Permitted { expires_at, .. } if expires_at <= now
        );
        match entry.state {
            PairingState::Redeemed { .. } => Err(CoreError::CodeAlreadyUsed),
            PairingState::Expired => Err(CoreError::CodeExpired),
            PairingState::Pending => Err(CoreError::RequestNotPending(entry.id.clone())),
            PairingState::Permitted { .. } if stale => {
                entry.state = PairingState::Expired;
                self.live.remove(&code_hash);
                self.spent.insert(code_hash, id);
                Err(CoreError::CodeExpired)
            }
            PairingState::Permitted { .. } => {
                entry.state = PairingState::Redeemed {
                    token_id: token_id.to_string(),
                    redeemed_at: now,
                };
                self.live.remove(&code_hash);
                self.spent.insert(code_hash, id);
                Ok(entry)
            }
        }
    }

    pub(super) fn mark_redeemed(&mut self, id: &str, token_id: String, redeemed_at: DateTime<Utc>) {
        if let Some(entry) = self.requests.get_mut(id) {
            if let PairingState::Permitted { code_hash, .. } = &entry.state {
                self.live.remove(code_hash);
                self.spent.insert(code_hash.clone(), id.to_string());
            }
            entry.state = PairingState::Redeemed {
                token_id,
                redeemed_at,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ad4m_types::{actions, domains, Resource};
    use chrono::Duration;

    fn app() -> CapabilityRequest {
        CapabilityRequest {
            app_name: "notes".into(),
            app_desc: "a notes app".into(),
            app_url: None,
            resources: vec![Resource::domain(domains::PERSPECTIVE)],
            actions: vec![actions::READ.into()],
        }
    }

    #[test]
    fn test_full_lifecycle() {
        let mut book = PairingBook::new();
        let now = Utc::now();
        let id = book.request(app(), now);
        assert_eq!(book.get(&id).unwrap().state, PairingState::Pending);

        let code = book.permit(&id, now, Duration::minutes(5)).unwrap();
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
        assert!(matches!(book.permit(&id, now, Duration::minutes(5)), Err(CoreError::RequestNotPending(_))));

        let redeemed = book.redeem(&code, "t1", now).unwrap();
        assert!(matches!(&redeemed.state, PairingState::Redeemed { token_id, .. } if token_id == "t1"));
        assert!(matches!(book.redeem(&code, "t2", now), Err(CoreError::CodeAlreadyUsed)));
    }

    #[test]
    fn test_code_expires_lazily() {
        let mut book = PairingBook::new();
        let now = Utc::now();
        let id = book.request(app(), now);
        let code = book.permit(&id, now, Duration::seconds(30)).unwrap();

        let later = now + Duration::seconds(31);
        assert!(matches!(book.redeem(&code, "t1", later), Err(CoreError::CodeExpired)));
        assert_eq!(book.get(&id).unwrap().state, PairingState::Expired);
        assert!(matches!(book.redeem(&code, "t1", now), Err(CoreError::CodeExpired)));
    }

    #[test]
    fn test_permit_sweeps_expired_codes() {
        let mut book = PairingBook::new();
        let now = Utc::now();
        let stale: Vec<_> = (0..50)
            .map(|_| {
                let id = book.request(app(), now);
                let code = book.permit(&id, now, Duration::seconds(30)).unwrap();
                (id, code)
            })
            .collect();
        assert_eq!(book.live.len(), 50);

        let later = now + Duration::seconds(31);
        let fresh = book.request(app(), later);
        let code = book.permit(&fresh, later, Duration::seconds(30)).unwrap();
        assert_eq!(book.live.len(), 1);
        for (id, old) in &stale {
            assert_eq!(book.get(id).unwrap().state, PairingState::Expired);
            if *old != code {
                assert!(matches!(book.redeem(old, "t", later), Err(CoreError::CodeExpired)));
            }
        }
        assert!(book.redeem(&code, "t1", later).is_ok());
        assert!(book.live.is_empty());
    }

    #[test]
    fn test_spent_code_can_be_reissued() {
        let mut book = PairingBook::new();
        let now = Utc::now();
        let first = book.request(app(), now);
        let code = book.permit(&first, now, Duration::minutes(5)).unwrap();
        book.redeem(&code, "t1", now).unwrap();

        // Same code handed to a second request once the first is spent.
        let second = book.request(app(), now);
        book.mark_permitted(&second, hash_code(&code), now + Duration::minutes(5));
        assert!(book.spent.is_empty());
        let redeemed = book.redeem(&code, "t2", now).unwrap();
        assert_eq!(redeemed.id, second);
        assert!(matches!(book.redeem(&code, "t3", now), Err(CoreError::CodeAlreadyUsed)));
    }

    #[test]
    fn test_unknown_code_and_request() {
        let mut book = PairingBook::new();
        assert!(matches!(book.redeem("000000", "t", Utc::now()), Err(CoreError::NotFound(_))));
        assert!(matches!(
            book.permit("nope", Utc::now(), Duration::minutes(1)),
            Err(CoreError::NotFound(_))
        ));
    }
}
