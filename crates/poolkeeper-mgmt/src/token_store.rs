//! Issued-token registry: lookup by content hash and validation by value.
//!
//! Tokens are HS256 JWTs minted by the login service with a shared secret.
//! A token is valid only if it was registered here, has not been revoked,
//! has not expired, carries a good signature and names the principal it was
//! registered for.

use std::collections::HashSet;

use chrono::Utc;
use dashmap::DashMap;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("no issued token matches hash")]
    UnknownHash,

    #[error("token was not issued")]
    UnknownToken,

    #[error("token revoked")]
    Revoked,

    #[error("token expired")]
    Expired,

    #[error("bad token signature")]
    BadSignature,

    #[error("token subject does not match issued principal")]
    SubjectMismatch,

    #[error("malformed token: {0}")]
    Malformed(String),
}

/// Claims carried by an issued token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

/// What a successful validation yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidToken {
    pub principal: String,
    pub token_hash: String,
    pub expires_at: i64,
}

/// Token store collaborator used by the auth gate.
pub trait TokenStore: Send + Sync {
    /// Resolves a content hash to the raw token.
    fn lookup_by_hash(&self, hash: &str) -> Result<String, TokenError>;

    fn validate(&self, token: &str) -> Result<ValidToken, TokenError>;
}

/// Lowercase hex SHA-256 of the token, the lookup key for `?hash=`.
pub fn token_hash(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[derive(Debug, Clone)]
struct IssuedToken {
    token: String,
    principal: String,
    expires_at: i64,
    revoked: bool,
}

pub struct IssuedTokenStore {
    secret: Vec<u8>,
    tokens: DashMap<String, IssuedToken>,
}

impl IssuedTokenStore {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            secret: secret.to_vec(),
            tokens: DashMap::new(),
        }
    }

    fn validation(check_exp: bool) -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_exp = check_exp;
        validation.required_spec_claims = HashSet::from(["exp".to_string(), "sub".to_string()]);
        validation
    }

    fn decode_claims(&self, token: &str, check_exp: bool) -> Result<TokenClaims, TokenError> {
        decode::<TokenClaims>(
            token,
            &DecodingKey::from_secret(&self.secret),
            &Self::validation(check_exp),
        )
        .map(|data| data.claims)
        .map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => TokenError::Expired,
            ErrorKind::InvalidSignature => TokenError::BadSignature,
            other => TokenError::Malformed(format!("{:?}", other)),
        })
    }

    /// Signs a token for `principal`, valid for `ttl_secs`, and registers it.
    pub fn issue(&self, principal: &str, ttl_secs: i64) -> Result<String, TokenError> {
        let token = mint(&self.secret, principal, ttl_secs)?;
        self.register(&token)?;
        Ok(token)
    }

    /// Registers a token issued elsewhere with the same secret. Returns its hash.
    pub fn register(&self, token: &str) -> Result<String, TokenError> {
        let claims = self.decode_claims(token, false)?;
        let hash = token_hash(token);
        self.tokens.insert(
            hash.clone(),
            IssuedToken {
                token: token.to_string(),
                principal: claims.sub,
                expires_at: claims.exp,
                revoked: false,
            },
        );
        Ok(hash)
    }

    /// Revokes by hash; returns false if the hash is unknown.
    pub fn revoke(&self, hash: &str) -> bool {
        match self.tokens.get_mut(hash) {
            Some(mut entry) => {
                entry.revoked = true;
                true
            }
            None => false,
        }
    }

    /// Drops expired and revoked entries.
    pub fn prune(&self, now: i64) -> usize {
        let before = self.tokens.len();
        self.tokens.retain(|_, t| !t.revoked && t.expires_at > now);
        before - self.tokens.len()
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl TokenStore for IssuedTokenStore {
    fn lookup_by_hash(&self, hash: &str) -> Result<String, TokenError> {
        self.tokens
            .get(&hash.to_ascii_lowercase())
            .map(|t| t.token.clone())
            .ok_or(TokenError::UnknownHash)
    }

    fn validate(&self, token: &str) -> Result<ValidToken, TokenError> {
        let hash = token_hash(token);
        let issued = self
            .tokens
            .get(&hash)
            .map(|t| t.value().clone())
            .ok_or(TokenError::UnknownToken)?;
        if !bool::from(issued.token.as_bytes().ct_eq(token.as_bytes())) {
            return Err(TokenError::UnknownToken);
        }
        if issued.revoked {
            return Err(TokenError::Revoked);
        }
        if Utc::now().timestamp() >= issued.expires_at {
            return Err(TokenError::Expired);
        }
        let claims = self.decode_claims(token, true)?;
        if claims.sub != issued.principal {
            return Err(TokenError::SubjectMismatch);
        }
        Ok(ValidToken {
            principal: issued.principal,
            token_hash: hash,
            expires_at: issued.expires_at,
        })
    }
}

/// Signs an HS256 token. Used by the login service and by `pk-mgmt token mint`.
pub fn mint(secret: &[u8], principal: &str, ttl_secs: i64) -> Result<String, TokenError> {
    let iat = Utc::now().timestamp();
    let exp = iat
        .checked_add(ttl_secs)
        .ok_or_else(|| TokenError::Malformed(format!("ttl {} seconds overflows expiry", ttl_secs)))?;
    let claims = TokenClaims {
        sub: principal.to_string(),
        iat,
        exp,
        jti: uuid::Uuid::new_v4().to_string(),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret),
    )
    .map_err(|e| TokenError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"test-secret";

    #[test]
    fn test_issue_and_validate() {
        let store = IssuedTokenStore::new(SECRET);
        let token = store.issue("admin", 3600).unwrap();
        let valid = store.validate(&token).unwrap();
        assert_eq!(valid.principal, "admin");
        assert_eq!(valid.token_hash, token_hash(&token));
    }

    #[test]
    fn test_lookup_by_hash() {
        let store = IssuedTokenStore::new(SECRET);
        let token = store.issue("admin", 3600).unwrap();
        assert_eq!(store.lookup_by_hash(&token_hash(&token)).unwrap(), token);
        assert_eq!(
            store.lookup_by_hash(&token_hash(&token).to_uppercase()).unwrap(),
            token
        );
        assert_eq!(store.lookup_by_hash("deadbeef"), Err(TokenError::UnknownHash));
    }

    #[test]
    fn test_unregistered_token_rejected() {
        let store = IssuedTokenStore::new(SECRET);
        let token = mint(SECRET, "admin", 3600).unwrap();
        assert_eq!(store.validate(&token), Err(TokenError::UnknownToken));
    }

    #[test]
    fn test_wrong_secret_cannot_register() {
        let store = IssuedTokenStore::new(SECRET);
        let token = mint(b"other-secret", "admin", 3600).unwrap();
        assert_eq!(store.register(&token), Err(TokenError::BadSignature));
    }

    #[test]
    fn test_expired_token_rejected() {
        let store = IssuedTokenStore::new(SECRET);
        let token = mint(SECRET, "admin", -10).unwrap();
        store.register(&token).unwrap();
        assert_eq!(store.validate(&token), Err(TokenError::Expired));
    }

    #[test]
    fn test_revoked_token_rejected() {
        let store = IssuedTokenStore::new(SECRET);
        let token = store.issue("admin", 3600).unwrap();
        assert!(store.revoke(&token_hash(&token)));
        assert_eq!(store.validate(&token), Err(TokenError::Revoked));
        assert!(!store.revoke("unknown"));
    }

    #[test]
    fn test_garbage_token_is_malformed() {
        let store = IssuedTokenStore::new(SECRET);
        assert!(matches!(store.register("not-a-jwt"), Err(TokenError::Malformed(_))));
    }

    #[test]
    fn test_prune_drops_expired_and_revoked() {
        let store = IssuedTokenStore::new(SECRET);
        let live = store.issue("admin", 3600).unwrap();
        let revoked = store.issue("ops", 3600).unwrap();
        store.register(&mint(SECRET, "old", -10).unwrap()).unwrap();
        store.revoke(&token_hash(&revoked));
        assert_eq!(store.prune(Utc::now().timestamp()), 2);
        assert_eq!(store.len(), 1);
        assert!(store.validate(&live).is_ok());
    }

    #[test]
    fn test_token_hash_is_hex_sha256() {
        assert_eq!(
            token_hash("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_mint_rejects_overflowing_ttl() {
        assert!(matches!(
            mint(SECRET, "admin", i64::MAX),
            Err(TokenError::Malformed(_))
        ));
        assert!(matches!(
            IssuedTokenStore::new(SECRET).issue("admin", i64::MAX),
            Err(TokenError::Malformed(_))
        ));
        assert!(mint(SECRET, "admin", 86_400 * 365).is_ok());
    }
}
