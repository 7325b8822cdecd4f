//! Issuer keyset store and bearer-token verification.
//!
//! # Verification flow
//!
//! 1. Peek at the token payload (no signature check) to read the `iss` claim.
//! 2. Reject issuers absent from the current keyset snapshot.
//! 3. Pick the issuer key whose `kid` matches the token header.
//! 4. Verify the signature and decode the full claim set with that key.
//! 5. Reject tokens whose `exp` lies in the past.
//!
//! # Key selection
//!
//! A token without a `kid`, or whose `kid` matches none of the issuer's keys,
//! is verified against the issuer's *first* key. Any key of a trusted issuer
//! can therefore sign kid-less tokens for it.
//!
//! # Keyset file
//!
//! A JSON object mapping issuer to an array of JWKs. A reload is all or
//! nothing: one malformed key rejects the whole document and the previous
//! snapshot stays active.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{DecodingKey, Validation, jwk::Jwk};
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::Claims;
use crate::Result;
use crate::refresh::{RefreshingCache, Snapshot};

/// Why a presented bearer token was not accepted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationError {
    /// The token's issuer has no entry in the keyset.
    #[error("Unknown issuer: {0:?}")]
    UnknownIssuer(String),

    /// Malformed token, bad signature, or no usable key.
    #[error("JWT verification failed: {0}")]
    VerificationFailed(String),

    /// The `exp` claim lies in the past.
    #[error("Token expired at {expired_at}")]
    TokenExpired {
        /// Expiry, epoch seconds.
        expired_at: i64,
    },
}

/// A single verification key and its optional key identifier.
#[derive(Clone)]
pub struct VerificationKey {
    kid: Option<String>,
    key: DecodingKey,
}

impl VerificationKey {
    /// Parse one JWK object.
    pub fn from_jwk_value(value: Value) -> std::result::Result<Self, String> {
        let jwk: Jwk = serde_json::from_value(value).map_err(|e| format!("invalid JWK: {e}"))?;
        let key = DecodingKey::from_jwk(&jwk).map_err(|e| format!("unusable JWK: {e}"))?;
        Ok(Self {
            kid: jwk.common.key_id,
            key,
        })
    }

    /// Key identifier, if the JWK carried one.
    #[must_use]
    pub fn kid(&self) -> Option<&str> {
        self.kid.as_deref()
    }
}

impl std::fmt::Debug for VerificationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerificationKey")
            .field("kid", &self.kid)
            .finish_non_exhaustive()
    }
}

/// Verification keys grouped by issuer.
#[derive(Debug, Clone, Default)]
pub struct Keyset {
    issuers: HashMap<String, Vec<VerificationKey>>,
}

impl Keyset {
    /// Parse a keyset document. Any malformed key fails the whole parse.
    pub fn from_json(bytes: &[u8]) -> std::result::Result<Self, String> {
        let raw: HashMap<String, Vec<Value>> =
            serde_json::from_slice(bytes).map_err(|e| format!("invalid keyset document: {e}"))?;

        let mut issuers = HashMap::with_capacity(raw.len());
        for (issuer, keys) in raw {
            let parsed = keys
                .into_iter()
                .enumerate()
                .map(|(index, value)| {
                    VerificationKey::from_jwk_value(value)
                        .map_err(|e| format!("issuer {issuer:?}, key #{index}: {e}"))
                })
                .collect::<std::result::Result<Vec<_>, _>>()?;
            issuers.insert(issuer, parsed);
        }

        Ok(Self { issuers })
    }

    /// Keys trusted for `issuer`.
    #[must_use]
    pub fn keys(&self, issuer: &str) -> Option<&[VerificationKey]> {
        self.issuers.get(issuer).map(Vec::as_slice)
    }

    /// Number of issuers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.issuers.len()
    }

    /// Whether no issuer is trusted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.issuers.is_empty()
    }
}

/// Select the key matching `kid`, falling back to the first key.
fn select_key<'a>(keys: &'a [VerificationKey], kid: Option<&str>) -> Option<&'a VerificationKey> {
    kid.and_then(|kid| keys.iter().find(|k| k.kid() == Some(kid)))
        .or_else(|| keys.first())
}

/// Hot-reloaded issuer keyset.
#[derive(Debug)]
pub struct KeysetStore {
    keys: Snapshot<Keyset>,
    cache: RefreshingCache,
}

impl KeysetStore {
    /// Load the keyset file.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Config`] if the file is unreadable or any key
    /// in it is malformed.
    pub fn new(path: impl Into<PathBuf>, refresh_interval: Duration) -> Result<Self> {
        let keys = Snapshot::<Keyset>::default();
        let published = keys.clone();
        let cache = RefreshingCache::new(path, refresh_interval, move |bytes| {
            let keyset = Keyset::from_json(bytes)?;
            if keyset.is_empty() {
                warn!("Keyset trusts no issuer, every token will be rejected");
            }
            debug!(issuers = keyset.len(), "Keyset parsed");
            published.swap(keyset);
            Ok(())
        })?;

        Ok(Self { keys, cache })
    }

    /// Start the background refresh task.
    pub fn start(&self, cancel: CancellationToken) {
        self.cache.start(cancel);
    }

    /// Re-read the keyset file now.
    pub fn reload(&self) -> Result<()> {
        self.cache.reload()
    }

    /// The underlying cache.
    #[must_use]
    pub fn cache(&self) -> &RefreshingCache {
        &self.cache
    }

    /// Trusted issuers, sorted.
    #[must_use]
    pub fn issuers(&self) -> Vec<String> {
        let keyset = self.keys.load();
        let mut issuers: Vec<String> = keyset.issuers.keys().cloned().collect();
        issuers.sort();
        issuers
    }

    /// Number of keys trusted for `issuer`.
    #[must_use]
    pub fn key_count(&self, issuer: &str) -> usize {
        self.keys.load().keys(issuer).map_or(0, <[_]>::len)
    }

    /// Verify `raw_token` and return its claims.
    ///
    /// # Errors
    ///
    /// Returns [`VerificationError`] if the issuer is unknown, the token is
    /// malformed or badly signed, or it has expired.
    pub fn verify(&self, raw_token: &str) -> std::result::Result<Claims, VerificationError> {
        let issuer = peek_issuer(raw_token)?;

        let keyset = self.keys.load();
        let keys = keyset
            .keys(&issuer)
            .ok_or_else(|| VerificationError::UnknownIssuer(issuer.clone()))?;

        let header = jsonwebtoken::decode_header(raw_token)
            .map_err(|e| VerificationError::VerificationFailed(e.to_string()))?;

        let key = select_key(keys, header.kid.as_deref()).ok_or_else(|| {
            VerificationError::VerificationFailed(format!("no keys configured for issuer {issuer:?}"))
        })?;

        // Expiry is checked below with zero leeway; everything else the
        // library could validate is policy's business.
        let mut validation = Validation::new(header.alg);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();
        validation.leeway = 0;

        let data = jsonwebtoken::decode::<Map<String, Value>>(raw_token, &key.key, &validation)
            .map_err(|e| VerificationError::VerificationFailed(e.to_string()))?;

        let claims = Claims::new(data.claims);
        check_expiry(&claims, now_secs())?;
        Ok(claims)
    }
}

#[derive(Deserialize)]
struct IssuerPeek {
    #[serde(default)]
    iss: Option<String>,
}

/// Read `iss` from the payload segment without verifying anything.
fn peek_issuer(raw_token: &str) -> std::result::Result<String, VerificationError> {
    let malformed = || VerificationError::VerificationFailed("malformed token".to_string());

    let mut parts = raw_token.split('.');
    let (Some(_header), Some(payload), Some(_signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(malformed());
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|_| malformed())?;
    let peek: IssuerPeek = serde_json::from_slice(&bytes).map_err(|_| malformed())?;

    Ok(peek.iss.unwrap_or_default())
}

fn check_expiry(claims: &Claims, now: i64) -> std::result::Result<(), VerificationError> {
    if claims.get("exp").is_none() {
        return Ok(());
    }
    match claims.expires_at() {
        Some(expired_at) if expired_at < now => Err(VerificationError::TokenExpired { expired_at }),
        Some(_) => Ok(()),
        None => Err(VerificationError::VerificationFailed(
            "exp claim is not numeric".to_string(),
        )),
    }
}

fn now_secs() -> i64 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs();
    i64::try_from(secs).unwrap_or(i64::MAX)
}
