//! Connection authentication.
//!
//! The first frame of a session carries a bearer token. The gateway hands it
//! to a [`TokenVerifier`] and only joins the hub once it yields an
//! [`Identity`].
//!
//! [`JwtVerifier`] accepts HS256 JWTs issued by the account service:
//! `{ "userId": "...", "type": "access", "exp": <unix seconds> }`.
//! Refresh tokens are refused.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::{Duration, SystemTime};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Who is behind a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("bad signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("wrong token type {0:?}")]
    WrongType(String),
    #[error("unsupported algorithm {0:?}")]
    UnsupportedAlgorithm(String),
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

#[derive(Debug, Deserialize)]
struct Header {
    alg: String,
}

/// JWT payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "type")]
    pub token_type: String,
    /// Expiry, seconds since epoch.
    pub exp: u64,
}

impl Claims {
    pub fn access(user_id: impl Into<String>, ttl: Duration) -> Self {
        Self {
            user_id: user_id.into(),
            token_type: "access".into(),
            exp: unix_now() + ttl.as_secs(),
        }
    }
}

/// HS256 verifier with a shared secret.
#[derive(Clone)]
pub struct JwtVerifier {
    secret: Vec<u8>,
    leeway: Duration,
}

impl JwtVerifier {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self { secret: secret.as_ref().to_vec(), leeway: Duration::from_secs(30) }
    }

    /// Clock skew tolerated on `exp` (default: 30s).
    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.leeway = leeway;
        self
    }

    /// Issue a token signed with this verifier's secret.
    pub fn sign(&self, claims: &Claims) -> Result<String, AuthError> {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = serde_json::to_vec(claims).map_err(|e| AuthError::Malformed(e.to_string()))?;
        let signing_input = format!("{header}.{}", URL_SAFE_NO_PAD.encode(payload));
        let signature = self.mac(signing_input.as_bytes())?.finalize().into_bytes();
        Ok(format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(signature)))
    }

    pub fn decode(&self, token: &str) -> Result<Claims, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        let mut parts = token.split('.');
        let (Some(header), Some(payload), Some(signature), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::Malformed("expected three segments".into()));
        };

        let header: Header = serde_json::from_slice(&b64(header)?)
            .map_err(|e| AuthError::Malformed(e.to_string()))?;
        if header.alg != "HS256" {
            return Err(AuthError::UnsupportedAlgorithm(header.alg));
        }

        let signing_input = &token[..token.len() - signature.len() - 1];
        self.mac(signing_input.as_bytes())?
            .verify_slice(&b64(signature)?)
            .map_err(|_| AuthError::BadSignature)?;

        let claims: Claims = serde_json::from_slice(&b64(payload)?)
            .map_err(|e| AuthError::Malformed(e.to_string()))?;
        if claims.token_type != "access" {
            return Err(AuthError::WrongType(claims.token_type));
        }
        if claims.exp + self.leeway.as_secs() < unix_now() {
            return Err(AuthError::Expired);
        }
        Ok(claims)
    }

    fn mac(&self, input: &[u8]) -> Result<HmacSha256, AuthError> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| AuthError::Malformed(e.to_string()))?;
        mac.update(input);
        Ok(mac)
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let claims = self.decode(token)?;
        Ok(Identity { user_id: claims.user_id })
    }
}

/// Accepts any non-empty token and uses it as the user id. Development only.
#[derive(Debug, Clone, Default)]
pub struct AllowAnonymous;

#[async_trait]
impl TokenVerifier for AllowAnonymous {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        Ok(Identity { user_id: token.to_string() })
    }
}

fn b64(segment: &str) -> Result<Vec<u8>, AuthError> {
    URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|e| AuthError::Malformed(e.to_string()))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
