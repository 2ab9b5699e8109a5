//! Request authentication gate.
//!
//! [`AuthGate::authorize`] is a pure per-request decision over the path and
//! the credential material; [`auth_middleware`] adapts it to axum and hands
//! the resulting [`AuthContext`] to handlers through request extensions.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

use crate::error::AdminError;
use crate::token_store::{TokenError, TokenStore};

/// Login endpoint; reachable without a credential.
pub const LOGIN_PATH: &str = "/api/auth/login";

/// Public download prefix; reachable without a credential when followed by a
/// non-empty file segment.
pub const PUBLIC_DOWNLOAD_PREFIX: &str = "/api/utilities/downloads/";

/// Identity of an authenticated caller, passed explicitly to every
/// mutating operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub principal: String,
    pub token_hash: String,
    pub expires_at: i64,
}

impl AuthContext {
    /// Context for in-process callers that bypass HTTP (startup tasks, tests).
    pub fn system(principal: &str) -> Self {
        Self {
            principal: principal.to_string(),
            token_hash: String::new(),
            expires_at: i64::MAX,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    /// Public endpoint, no credential consulted.
    Public,
    Authenticated(AuthContext),
}

#[derive(Clone)]
pub struct AuthGate {
    store: Arc<dyn TokenStore>,
}

impl AuthGate {
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        Self { store }
    }

    pub fn is_public(path: &str) -> bool {
        if path == LOGIN_PATH {
            return true;
        }
        matches!(path.strip_prefix(PUBLIC_DOWNLOAD_PREFIX), Some(rest) if !rest.is_empty())
    }

    /// Decides whether a request may proceed.
    ///
    /// A non-empty `hash` takes precedence over the bearer header.
    pub fn authorize(
        &self,
        path: &str,
        bearer: Option<&str>,
        hash: Option<&str>,
    ) -> Result<AuthDecision, AdminError> {
        if Self::is_public(path) {
            return Ok(AuthDecision::Public);
        }

        let token = match hash.filter(|h| !h.is_empty()) {
            Some(hash) => self
                .store
                .lookup_by_hash(hash)
                .map_err(|_| AdminError::InvalidCredentialHash)?,
            None => bearer
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .ok_or(AdminError::MissingCredential)?,
        };

        let valid = self
            .store
            .validate(&token)
            .map_err(|e: TokenError| AdminError::InvalidCredential {
                reason: e.to_string(),
            })?;

        Ok(AuthDecision::Authenticated(AuthContext {
            principal: valid.principal,
            token_hash: valid.token_hash,
            expires_at: valid.expires_at,
        }))
    }
}

/// Extracts the token from `Authorization: Bearer <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
}

/// Extracts and percent-decodes the `hash` query parameter.
pub fn hash_param(query: Option<&str>) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == "hash")
        .and_then(|(_, v)| urlencoding::decode(v).ok())
        .map(|v| v.into_owned())
}

pub async fn auth_middleware(
    State(gate): State<Arc<AuthGate>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let hash = hash_param(request.uri().query());
    let decision = gate.authorize(&path, bearer_token(request.headers()), hash.as_deref());

    match decision {
        Ok(AuthDecision::Public) => next.run(request).await,
        Ok(AuthDecision::Authenticated(ctx)) => {
            debug!(path = %path, principal = %ctx.principal, "request authenticated");
            request.extensions_mut().insert(ctx);
            next.run(request).await
        }
        Err(err) => {
            warn!(path = %path, code = err.code(), "request rejected");
            let mut response = err.into_response();
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                header::HeaderValue::from_static(r#"Bearer realm="poolkeeper""#),
            );
            response
        }
    }
}
