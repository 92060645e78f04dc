//! Auth Gate (§4.2). Bearer credentials are HMAC-signed tokens, verified with
//! the same `hmac`/`sha2`/`base64` crates the teacher already pulls in for
//! webhook signature verification — reused here instead of adding a JWT crate.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::ChatError;

type HmacSha256 = Hmac<Sha256>;

pub const ACCESS_TOKEN_TTL_SECS: i64 = 15 * 60;
pub const REFRESH_TOKEN_TTL_SECS: i64 = 30 * 24 * 60 * 60;

#[derive(Debug, Serialize, Deserialize)]
struct TokenPayload {
    sub: Uuid,
    exp: i64,
    kind: TokenKind,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Access,
    Refresh,
}

#[derive(Clone)]
pub struct AuthGate {
    secret: Vec<u8>,
}

impl AuthGate {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn from_env() -> Self {
        let secret = std::env::var("ACCESS_TOKEN_SECRET")
            .unwrap_or_else(|_| "dev-only-insecure-secret".to_string());
        Self::new(secret.into_bytes())
    }

    fn sign(&self, payload: &TokenPayload) -> String {
        let body = serde_json::to_vec(payload).expect("payload serializes");
        let body_b64 = URL_SAFE_NO_PAD.encode(&body);
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(body_b64.as_bytes());
        let sig = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{body_b64}.{sig}")
    }

    pub fn issue_access_token(&self, user_id: Uuid) -> String {
        self.sign(&TokenPayload {
            sub: user_id,
            exp: chrono::Utc::now().timestamp() + ACCESS_TOKEN_TTL_SECS,
            kind: TokenKind::Access,
        })
    }

    pub fn issue_refresh_token(&self, user_id: Uuid) -> String {
        self.sign(&TokenPayload {
            sub: user_id,
            exp: chrono::Utc::now().timestamp() + REFRESH_TOKEN_TTL_SECS,
            kind: TokenKind::Refresh,
        })
    }

    /// Verify signature and expiry, returning the bound user id on success.
    /// Distinguishes "missing" (caller's concern — no token presented) from
    /// "invalid" (bad signature/expired/wrong kind) per §4.2.
    fn verify(&self, token: &str, expected: TokenKind) -> Result<Uuid, ChatError> {
        let (body_b64, sig_b64) = token.split_once('.').ok_or(ChatError::Unauthorized)?;

        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(body_b64.as_bytes());
        let expected_sig = mac.finalize().into_bytes();
        let given_sig = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| ChatError::Unauthorized)?;
        if given_sig.len() != expected_sig.len() || !constant_time_eq(&given_sig, &expected_sig) {
            return Err(ChatError::Unauthorized);
        }

        let body = URL_SAFE_NO_PAD
            .decode(body_b64)
            .map_err(|_| ChatError::Unauthorized)?;
        let payload: TokenPayload =
            serde_json::from_slice(&body).map_err(|_| ChatError::Unauthorized)?;

        if payload.kind != expected {
            return Err(ChatError::Unauthorized);
        }
        if payload.exp < chrono::Utc::now().timestamp() {
            return Err(ChatError::Unauthorized);
        }
        Ok(payload.sub)
    }

    pub fn verify_access_token(&self, token: &str) -> Result<Uuid, ChatError> {
        self.verify(token, TokenKind::Access)
    }

    pub fn verify_refresh_token(&self, token: &str) -> Result<Uuid, ChatError> {
        self.verify(token, TokenKind::Refresh)
    }

    /// Hash a refresh credential for at-rest storage (§3 "Refresh credential").
    pub fn hash_refresh_token(token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        hex::encode(hasher.finalize())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
