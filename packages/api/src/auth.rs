// ABOUTME: Bearer token authentication for API requests
// ABOUTME: HMAC-signed JWT verification and the CurrentUser extractor for handlers

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use hmac::{digest::KeyInit, Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Sha256, Sha384, Sha512};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::AppError;
use crate::AppState;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing bearer token")]
    MissingToken,

    #[error("Malformed token")]
    Malformed,

    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Token expired")]
    Expired,

    #[error("Token is not yet valid")]
    NotYetValid,

    #[error("Token has no subject")]
    MissingSubject,
}

/// HMAC algorithms accepted for token signatures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JwtAlgorithm {
    HS256,
    HS384,
    HS512,
}

impl JwtAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HS256 => "HS256",
            Self::HS384 => "HS384",
            Self::HS512 => "HS512",
        }
    }
}

impl fmt::Display for JwtAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JwtAlgorithm {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "HS256" => Ok(Self::HS256),
            "HS384" => Ok(Self::HS384),
            "HS512" => Ok(Self::HS512),
            _ => Err(AuthError::UnsupportedAlgorithm(s.to_string())),
        }
    }
}

/// Identity carried by a verified token
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    pub id: String,
    pub email: Option<String>,
}

/// Verifies bearer tokens issued elsewhere
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Principal, AuthError>;
}

#[derive(Deserialize)]
struct Header {
    alg: String,
}

#[derive(Deserialize)]
struct Claims {
    #[serde(default)]
    sub: String,
    #[serde(default)]
    email: Option<String>,
    // Time claims must be integers; anything else fails to decode as Malformed
    #[serde(default)]
    exp: Option<i64>,
    #[serde(default)]
    nbf: Option<i64>,
    #[serde(default)]
    #[allow(dead_code)]
    iat: Option<i64>,
}

/// Compact JWT verifier for a shared secret
pub struct JwtVerifier {
    secret: Vec<u8>,
    algorithm: JwtAlgorithm,
}

impl JwtVerifier {
    pub fn new(secret: impl Into<Vec<u8>>, algorithm: JwtAlgorithm) -> Self {
        Self {
            secret: secret.into(),
            algorithm,
        }
    }

    pub fn algorithm(&self) -> JwtAlgorithm {
        self.algorithm
    }

    fn signature_matches(&self, message: &[u8], signature: &[u8]) -> bool {
        match self.algorithm {
            JwtAlgorithm::HS256 => verify_mac::<Hmac<Sha256>>(&self.secret, message, signature),
            JwtAlgorithm::HS384 => verify_mac::<Hmac<Sha384>>(&self.secret, message, signature),
            JwtAlgorithm::HS512 => verify_mac::<Hmac<Sha512>>(&self.secret, message, signature),
        }
    }
}

fn verify_mac<M: Mac + KeyInit>(secret: &[u8], message: &[u8], signature: &[u8]) -> bool {
    match <M as KeyInit>::new_from_slice(secret) {
        Ok(mut mac) => {
            Mac::update(&mut mac, message);
            mac.verify_slice(signature).is_ok()
        }
        Err(_) => false,
    }
}

fn decode_segment<T: for<'de> Deserialize<'de>>(segment: &str) -> Result<T, AuthError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| AuthError::Malformed)?;
    serde_json::from_slice(&bytes).map_err(|_| AuthError::Malformed)
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        let mut parts = token.split('.');
        let (Some(header), Some(payload), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::Malformed);
        };

        // The configured algorithm is authoritative; "none" and mismatches are refused
        let decoded: Header = decode_segment(header)?;
        if decoded.alg != self.algorithm.as_str() {
            return Err(AuthError::UnsupportedAlgorithm(decoded.alg));
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| AuthError::Malformed)?;
        let signed = &token[..header.len() + 1 + payload.len()];
        if !self.signature_matches(signed.as_bytes(), &signature) {
            return Err(AuthError::InvalidSignature);
        }

        let claims: Claims = decode_segment(payload)?;
        let now = Utc::now().timestamp();
        if claims.exp.is_some_and(|exp| exp <= now) {
            return Err(AuthError::Expired);
        }
        if claims.nbf.is_some_and(|nbf| nbf > now) {
            return Err(AuthError::NotYetValid);
        }
        if claims.sub.trim().is_empty() {
            return Err(AuthError::MissingSubject);
        }

        Ok(Principal {
            id: claims.sub,
            email: claims.email,
        })
    }
}

/// Authenticated caller of a handler
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub id: String,
    pub email: Option<String>,
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    let value = parts.headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") || token.trim().is_empty() {
        return None;
    }
    Some(token.trim())
}

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let path = parts.uri.path().to_string();
        let Some(token) = bearer_token(parts) else {
            warn!(path = %path, "Missing bearer token");
            return Err(AuthError::MissingToken.into());
        };

        let principal = state.verifier.verify(token).map_err(|e| {
            warn!(path = %path, error = %e, "Token verification failed");
            AppError::from(e)
        })?;

        debug!(user_id = %principal.id, "Token validated");
        Ok(Self {
            id: principal.id,
            email: principal.email,
        })
    }
}
