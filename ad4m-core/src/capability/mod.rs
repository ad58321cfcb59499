//! Capability-based authorization.
//!
//! A [`CapabilityToken`] grants a set of actions over resources. Tokens
//! travel as HS256 JWTs signed with the guard's secret. Apps obtain one
//! through pairing: they file a request, a human permits it out of band
//! (which yields a short one-time code) and the app redeems the code.
//!
//! The matching rule: a token authorizes `(domain, pointer, action)` when
//! it has not expired, lists `action`, and has a resource with that domain
//! whose pointers are empty (the whole domain) or contain `pointer`.

mod pairing;

pub use pairing::{PairingBook, PairingRequest, PairingState, CODE_DIGITS};

use crate::error::{CoreError, Result};
use crate::persistence::StateStore;
use ad4m_types::{CapabilityToken, Resource};
use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Issuer claim of every token this guard mints
pub const ISSUER: &str = "ad4m";

/// What an app asks for when pairing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityRequest {
    pub app_name: String,
    pub app_desc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_url: Option<String>,
    pub resources: Vec<Resource>,
    pub actions: Vec<String>,
}

/// Entry of the append-only capability log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum CapabilityRecord {
    Requested {
        request_id: String,
        request: CapabilityRequest,
        at: DateTime<Utc>,
    },
    Permitted {
        request_id: String,
        code_hash: String,
        expires_at: DateTime<Utc>,
        at: DateTime<Utc>,
    },
    Redeemed {
        request_id: String,
        token_id: String,
        at: DateTime<Utc>,
    },
}

/// A token minted from a pairing code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedToken {
    pub token: CapabilityToken,
    pub jwt: String,
}

/// An app holding a redeemed grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppGrant {
    pub request_id: String,
    pub token_id: String,
    pub redeemed_at: DateTime<Utc>,
    pub request: CapabilityRequest,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    iss: String,
    sub: String,
    /// Random per-token secret
    jti: String,
    resources: Vec<Resource>,
    actions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exp: Option<i64>,
}

/// The matching rule, without any I/O.
pub fn authorize(token: &CapabilityToken, domain: &str, pointer: &str, action: &str) -> bool {
    if token.is_expired(Utc::now()) {
        return false;
    }
    if !token.actions.iter().any(|a| a == action) {
        return false;
    }
    token.resources.iter().any(|resource| {
        resource.domain == domain
            && (resource.pointers.is_empty() || resource.pointers.iter().any(|p| p == pointer))
    })
}

pub struct CapabilityGuard {
    encoding: EncodingKey,
    decoding: DecodingKey,
    admin_credential: Option<String>,
    code_ttl: Duration,
    token_ttl: Option<Duration>,
    pairing: Mutex<PairingBook>,
    store: Arc<dyn StateStore>,
}

impl CapabilityGuard {
    pub fn new(
        secret: &[u8],
        admin_credential: Option<String>,
        code_ttl: Duration,
        token_ttl: Option<Duration>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            admin_credential,
            code_ttl,
            token_ttl,
            pairing: Mutex::new(PairingBook::new()),
            store,
        }
    }

    /// Rebuild pairing state from the capability log.
    pub async fn restore(&self) -> Result<usize> {
        let records = self.store.load_capability_log().await?;
        let mut book = self.pairing.lock();
        for record in &records {
            match record.clone() {
                CapabilityRecord::Requested {
                    request_id,
                    request,
                    at,
                } => book.insert_pending(request_id, request, at),
                CapabilityRecord::Permitted {
                    request_id,
                    code_hash,
                    expires_at,
                    ..
                } => book.mark_permitted(&request_id, code_hash, expires_at),
                CapabilityRecord::Redeemed {
                    request_id,
                    token_id,
                    at,
                } => book.mark_redeemed(&request_id, token_id, at),
            }
        }
        debug!(records = records.len(), "capability log replayed");
        Ok(records.len())
    }

    pub fn authorize(&self, token: &CapabilityToken, domain: &str, pointer: &str, action: &str) -> bool {
        authorize(token, domain, pointer, action)
    }

    pub fn check(&self, token: &CapabilityToken, domain: &str, pointer: &str, action: &str) -> Result<()> {
        if authorize(token, domain, pointer, action) {
            Ok(())
        } else {
            debug!(subject = %token.subject, domain, pointer, action, "capability denied");
            Err(CoreError::unauthorized(domain, pointer, action))
        }
    }

    /// Turn a presented credential into a token.
    ///
    /// The admin credential maps to the all-access token; anything else
    /// must be a JWT signed by this guard.
    pub fn resolve(&self, credential: &str) -> Result<CapabilityToken> {
        if self
            .admin_credential
            .as_deref()
            .is_some_and(|admin| !admin.is_empty() && admin == credential)
        {
            return Ok(CapabilityToken::admin(ISSUER, "admin"));
        }
        self.verify_jwt(credential)
    }

    pub fn issue_jwt(&self, token: &CapabilityToken) -> Result<String> {
        let token_id = hex::encode(rand::random::<[u8; 16]>());
        self.encode_claims(token, token_id)
    }

    fn encode_claims(&self, token: &CapabilityToken, token_id: String) -> Result<String> {
        let claims = Claims {
            iss: token.issuer.clone(),
            sub: token.subject.clone(),
            jti: token_id,
            resources: token.resources.clone(),
            actions: token.actions.clone(),
            exp: token.expiry.map(|e| e.timestamp()),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| CoreError::Crypto(format!("failed to encode token: {e}")))
    }

    pub fn verify_jwt(&self, jwt: &str) -> Result<CapabilityToken> {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is optional and checked against the capability below.
        validation.validate_exp = false;
        validation.required_spec_claims = HashSet::new();
        validation.validate_aud = false;
        validation.set_issuer(&[ISSUER]);

        let data = decode::<Claims>(jwt, &self.decoding, &validation)
            .map_err(|e| CoreError::InvalidToken(e.to_string()))?;
        let claims = data.claims;

        let mut token = CapabilityToken::new(claims.iss, claims.sub, claims.resources, claims.actions);
        if let Some(exp) = claims.exp {
            let expiry = DateTime::from_timestamp(exp, 0)
                .ok_or_else(|| CoreError::InvalidToken("expiry out of range".into()))?;
            token = token.with_expiry(expiry);
        }
        if token.is_expired(Utc::now()) {
            return Err(CoreError::InvalidToken("token expired".into()));
        }
        Ok(token)
    }

    /// File a pairing request. Returns the request id.
    pub async fn request_capability(&self, request: CapabilityRequest) -> Result<String> {
        let now = Utc::now();
        let request_id = self.pairing.lock().request(request.clone(), now);
        self.store
            .append_capability_record(&CapabilityRecord::Requested {
                request_id: request_id.clone(),
                request: request.clone(),
                at: now,
            })
            .await?;
        info!(%request_id, app = %request.app_name, "capability requested");
        Ok(request_id)
    }

    /// Approve a pending request, returning the one-time code.
    pub async fn permit(&self, request_id: &str) -> Result<String> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.code_ttl)
            .map_err(|e| CoreError::Crypto(format!("pairing ttl out of range: {e}")))?;

        let (code, record) = {
            let mut book = self.pairing.lock();
            let code = book.permit(request_id, now, ttl)?;
            let Some(PairingState::Permitted {
                code_hash,
                expires_at,
            }) = book.get(request_id).map(|r| r.state.clone())
            else {
                return Err(CoreError::RequestNotPending(request_id.to_string()));
            };
            (
                code,
                CapabilityRecord::Permitted {
                    request_id: request_id.to_string(),
                    code_hash,
                    expires_at,
                    at: now,
                },
            )
        };

        self.store.append_capability_record(&record).await?;
        info!(%request_id, "capability permitted");
        Ok(code)
    }

    /// Exchange a one-time code for a token. Each code works once.
    ///
    /// If the redemption cannot be logged the code stays valid.
    pub async fn redeem(&self, code: &str) -> Result<IssuedToken> {
        let now = Utc::now();
        let token_id = hex::encode(rand::random::<[u8; 16]>());

        let (request_id, request, expires_at) = {
            let mut book = self.pairing.lock();
            let expires_at = book.code_expiry(code);
            let entry = book.redeem(code, &token_id, now).inspect_err(|e| {
                warn!(error = %e, "pairing code rejected");
            })?;
            (entry.id.clone(), entry.request.clone(), expires_at)
        };
        let reopen = |error: CoreError| {
            if let Some(expires_at) = expires_at {
                self.pairing
                    .lock()
                    .mark_permitted(&request_id, pairing::hash_code(code), expires_at);
            }
            warn!(%request_id, %error, "redemption not recorded, code reopened");
            error
        };

        let mut token = CapabilityToken::new(ISSUER, request.app_name, request.resources, request.actions);
        if let Some(ttl) = self.token_ttl.and_then(|t| chrono::Duration::from_std(t).ok()) {
            token = token.with_expiry(now + ttl);
        }
        let jwt = self.encode_claims(&token, token_id.clone()).map_err(reopen)?;

        self.store
            .append_capability_record(&CapabilityRecord::Redeemed {
                request_id: request_id.clone(),
                token_id,
                at: now,
            })
            .await
            .map_err(reopen)?;
        info!(%request_id, subject = %token.subject, "capability redeemed");
        Ok(IssuedToken { token, jwt })
    }

    pub fn pairing_request(&self, request_id: &str) -> Option<PairingRequest> {
        self.pairing.lock().get(request_id).cloned()
    }

    /// Apps that redeemed a grant, oldest first.
    pub fn apps(&self) -> Vec<AppGrant> {
        let book = self.pairing.lock();
        let mut apps: Vec<AppGrant> = book
            .requests()
            .filter_map(|r| match &r.state {
                PairingState::Redeemed {
                    token_id,
                    redeemed_at,
                } => Some(AppGrant {
                    request_id: r.id.clone(),
                    token_id: token_id.clone(),
                    redeemed_at: *redeemed_at,
                    request: r.request.clone(),
                }),
                _ => None,
            })
            .collect();
        apps.sort_by_key(|app| app.redeemed_at);
        apps
    }
}
