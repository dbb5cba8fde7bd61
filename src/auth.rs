use axum::{
    body::Body,
    extract::Request,
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::error::AppError;

/// Configured admin tokens, held only as SHA-256 digests.
#[derive(Clone, Debug)]
pub struct AdminTokens {
    hashes: Vec<[u8; 32]>,
}

impl AdminTokens {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let hashes = tokens
            .into_iter()
            .map(|t| digest(t.as_ref()))
            .collect();
        Self { hashes }
    }

    /// Constant-time check of a plaintext token against every configured hash.
    pub fn verify(&self, plaintext: &str) -> bool {
        let candidate = digest(plaintext);
        self.hashes
            .iter()
            .fold(0u8, |found, h| found | h.ct_eq(&candidate).unwrap_u8())
            == 1
    }
}

fn digest(plaintext: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(plaintext.as_bytes());
    hasher.finalize().into()
}

/// SHA-256 hash of a plaintext token, returned as hex.
pub fn hash_token(plaintext: &str) -> String {
    hex::encode(digest(plaintext))
}

/// Extract Bearer token from Authorization header.
fn extract_bearer(req: &Request<Body>) -> Option<String> {
    let value = req.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?;
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

/// Middleware guarding the read-side API. Requires `Arc<AdminTokens>` in the
/// request extensions.
pub async fn require_admin_token(request: Request<Body>, next: Next) -> Result<Response, Response> {
    let tokens = request
        .extensions()
        .get::<Arc<AdminTokens>>()
        .cloned()
        .ok_or_else(|| {
            AppError::Internal("admin tokens not configured".to_string()).into_response()
        })?;

    let plaintext = extract_bearer(&request).ok_or_else(|| {
        AppError::Auth("missing bearer token".to_string()).into_response()
    })?;

    if !tokens.verify(&plaintext) {
        tracing::warn!(
            path = %request.uri().path(),
            token_hash_prefix = %&hash_token(&plaintext)[..8],
            "rejected admin token"
        );
        return Err(AppError::Auth("invalid token".to_string()).into_response());
    }

    Ok(next.run(request).await)
}
