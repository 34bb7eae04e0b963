//! Local access control: token minting and verification, the root
//! client token claim/confirm handshake, and the revocation list.

mod macaroon;
mod revocation;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::info;

use crate::config::{AuthScope, Config, RootClientTokenOwner};
use crate::error::Transience;
use crate::provider::{unix_seconds, Clock};

pub use revocation::{AccessRevocationManager, RevocationEntry};

const MIN_SECRET_LEN: usize = 32;
const ACCESS_TOKEN_MAC_LEN: usize = 32;

/// Bound on claims awaiting confirmation; the oldest is evicted when a
/// new claim arrives at capacity.
const MAX_PENDING_CLAIMS: usize = 10;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AuthError {
    #[error("root client token claim '{current}' -> '{claimer}' is not allowed")]
    ClaimNotAllowed { current: String, claimer: String },

    #[error("token does not match any pending claim")]
    UnknownClaimToken,
}

impl AuthError {
    pub fn transience(&self) -> Transience {
        Transience::Permanent
    }
}

/// Identity carried by an access token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserInfo {
    scope: AuthScope,
    user_id: u64,
}

impl UserInfo {
    /// An anonymous identity carries no user id.
    pub fn new(scope: AuthScope, user_id: u64) -> Self {
        Self {
            scope,
            user_id: if scope == AuthScope::None { 0 } else { user_id },
        }
    }

    pub fn anonymous() -> Self {
        Self::new(AuthScope::None, 0)
    }

    pub fn scope(&self) -> AuthScope {
        self.scope
    }

    pub fn user_id(&self) -> u64 {
        self.user_id
    }
}

pub(crate) fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; 32] {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key).expect("hmac-sha256 accepts any key length");
    mac.update(message);
    mac.finalize().into_bytes().into()
}

fn random_secret() -> Vec<u8> {
    let mut secret = vec![0u8; MIN_SECRET_LEN];
    OsRng.fill_bytes(&mut secret);
    secret
}

struct PendingClaim {
    auth: Box<AuthManager>,
    owner: RootClientTokenOwner,
}

/// Mints and verifies local tokens against a device secret.
///
/// Every outstanding token binds to the current secret; rotating the
/// secret invalidates them all.
pub struct AuthManager {
    config: Option<Rc<Config>>,
    revocation: Option<Rc<AccessRevocationManager>>,
    clock: Rc<dyn Clock>,
    certificate_fingerprint: Vec<u8>,
    secret: RefCell<Vec<u8>>,
    pending_claims: RefCell<VecDeque<PendingClaim>>,
}

impl AuthManager {
    /// Production constructor: adopts the persisted secret when valid,
    /// otherwise mints a fresh one (resetting token ownership) and
    /// persists it.
    pub fn new(
        config: Rc<Config>,
        revocation: Option<Rc<AccessRevocationManager>>,
        certificate_fingerprint: Vec<u8>,
        clock: Rc<dyn Clock>,
    ) -> Self {
        let persisted = config.with_settings(|settings| {
            BASE64
                .decode(settings.secret.as_bytes())
                .ok()
                .filter(|secret| secret.len() >= MIN_SECRET_LEN)
        });
        let manager = Self {
            config: Some(config),
            revocation,
            clock,
            certificate_fingerprint,
            secret: RefCell::new(persisted.clone().unwrap_or_default()),
            pending_claims: RefCell::new(VecDeque::new()),
        };
        if persisted.is_none() {
            info!("no usable auth secret persisted, minting a new one");
            manager.set_secret(random_secret(), RootClientTokenOwner::None);
        }
        manager
    }

    /// Constructor with an explicit secret and no persistence; used for
    /// pending claims and pinned-secret tests. An undersized secret is
    /// replaced with a random one.
    pub fn with_secret(
        secret: Vec<u8>,
        certificate_fingerprint: Vec<u8>,
        clock: Rc<dyn Clock>,
    ) -> Self {
        let secret = if secret.len() >= MIN_SECRET_LEN {
            secret
        } else {
            random_secret()
        };
        Self {
            config: None,
            revocation: None,
            clock,
            certificate_fingerprint,
            secret: RefCell::new(secret),
            pending_claims: RefCell::new(VecDeque::new()),
        }
    }

    pub fn secret(&self) -> Vec<u8> {
        self.secret.borrow().clone()
    }

    pub fn certificate_fingerprint(&self) -> &[u8] {
        &self.certificate_fingerprint
    }

    /// Replace the secret, invalidating every outstanding token, and
    /// persist it together with the new token owner.
    pub fn set_secret(&self, secret: Vec<u8>, owner: RootClientTokenOwner) {
        *self.secret.borrow_mut() = secret;
        if let Some(config) = &self.config {
            let encoded = BASE64.encode(&*self.secret.borrow());
            let mut tx = config.edit();
            tx.set_secret(encoded);
            tx.set_root_client_token_owner(owner);
            tx.commit();
        }
    }

    /// `HMAC(secret, payload) || payload` with
    /// `payload = "<scope_code>:<user_id>:<unix_seconds>"`.
    pub fn create_access_token(&self, user: &UserInfo) -> Vec<u8> {
        let payload = format!(
            "{}:{}:{}",
            user.scope().code(),
            user.user_id(),
            unix_seconds(self.clock.now())
        );
        let mut token = hmac_sha256(&self.secret.borrow(), payload.as_bytes()).to_vec();
        token.extend_from_slice(payload.as_bytes());
        token
    }

    /// Verify and decode an access token. Returns the anonymous identity
    /// and no timestamp on any failure, including revocation.
    pub fn parse_access_token(&self, token: &[u8]) -> (UserInfo, Option<SystemTime>) {
        let anonymous = (UserInfo::anonymous(), None);
        if token.len() <= ACCESS_TOKEN_MAC_LEN {
            return anonymous;
        }
        let (mac, payload) = token.split_at(ACCESS_TOKEN_MAC_LEN);
        let expected = hmac_sha256(&self.secret.borrow(), payload);
        if !bool::from(expected.ct_eq(mac)) {
            return anonymous;
        }
        let Ok(payload) = std::str::from_utf8(payload) else {
            return anonymous;
        };
        let mut parts = payload.splitn(3, ':');
        let (Some(code), Some(user), Some(issued)) = (parts.next(), parts.next(), parts.next())
        else {
            return anonymous;
        };
        let (Ok(code), Ok(user_id), Ok(issued)) =
            (code.parse::<u8>(), user.parse::<u64>(), issued.parse::<u64>())
        else {
            return anonymous;
        };
        let Some(scope) = AuthScope::from_code(code) else {
            return anonymous;
        };
        if let Some(revocation) = &self.revocation {
            if revocation.is_blocked(&user_id.to_be_bytes(), &[], issued) {
                return anonymous;
            }
        }
        (
            UserInfo::new(scope, user_id),
            Some(UNIX_EPOCH + Duration::from_secs(issued)),
        )
    }

    /// The deterministic owner-scoped root client token for this secret
    /// and instant.
    pub fn get_root_client_auth_token(&self) -> Vec<u8> {
        macaroon::encode_root_token(&self.secret.borrow(), unix_seconds(self.clock.now()))
    }

    pub fn is_valid_auth_token(&self, token: &[u8]) -> bool {
        macaroon::verify_root_token(&self.secret.borrow(), token)
    }

    /// First half of the ownership handshake: mint a candidate token
    /// under a fresh secret. Nothing persists until the claim is
    /// confirmed. Claiming for owner `none` is a programmer error.
    pub fn claim_root_client_auth_token(
        &self,
        claimer: RootClientTokenOwner,
    ) -> Result<Vec<u8>, AuthError> {
        assert!(
            claimer != RootClientTokenOwner::None,
            "root client token cannot be claimed for owner 'none'"
        );
        let current = self
            .config
            .as_ref()
            .map(|config| config.with_settings(|s| s.root_client_token_owner))
            .unwrap_or(RootClientTokenOwner::None);
        let allowed = matches!(
            (current, claimer),
            (RootClientTokenOwner::None, _)
                | (RootClientTokenOwner::Client, RootClientTokenOwner::Cloud)
                | (RootClientTokenOwner::Cloud, RootClientTokenOwner::Cloud)
        );
        if !allowed {
            return Err(AuthError::ClaimNotAllowed {
                current: owner_name(current).to_string(),
                claimer: owner_name(claimer).to_string(),
            });
        }

        let auth = Box::new(AuthManager::with_secret(
            random_secret(),
            Vec::new(),
            self.clock.clone(),
        ));
        let token = auth.get_root_client_auth_token();
        let mut pending = self.pending_claims.borrow_mut();
        pending.push_back(PendingClaim {
            auth,
            owner: claimer,
        });
        while pending.len() > MAX_PENDING_CLAIMS {
            pending.pop_front();
        }
        Ok(token)
    }

    /// Second half of the handshake: adopt the pending claim that minted
    /// `token`, committing secret and owner in one transaction.
    /// Re-confirming after commit is idempotent while the token still
    /// validates.
    pub fn confirm_client_auth_token(&self, token: &[u8]) -> Result<(), AuthError> {
        if self.pending_claims.borrow().is_empty() && self.is_valid_auth_token(token) {
            return Ok(());
        }
        let claim = {
            let mut pending = self.pending_claims.borrow_mut();
            let index = pending
                .iter()
                .position(|claim| claim.auth.is_valid_auth_token(token))
                .ok_or(AuthError::UnknownClaimToken)?;
            let claim = pending.remove(index).expect("index from position");
            pending.clear();
            claim
        };
        info!(owner = owner_name(claim.owner), "root client token confirmed");
        self.set_secret(claim.auth.secret(), claim.owner);
        Ok(())
    }
}

fn owner_name(owner: RootClientTokenOwner) -> &'static str {
    match owner {
        RootClientTokenOwner::None => "none",
        RootClientTokenOwner::Client => "client",
        RootClientTokenOwner::Cloud => "cloud",
    }
}
