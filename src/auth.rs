//! Connection authentication
//!
//! Peers present the shared secret in the `Authorization` header of the
//! WebSocket upgrade request, either bare or as `Bearer <secret>`.

use crate::error::BeaconError;
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;

pub struct BearerAuth {
    secret: String,
}

impl BearerAuth {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Check the upgrade request's credential
    pub fn verify(&self, headers: &HeaderMap) -> Result<(), BeaconError> {
        let value = headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(BeaconError::Unauthorized)?;
        let token = value.strip_prefix("Bearer ").unwrap_or(value).trim();

        if constant_time_eq(token.as_bytes(), self.secret.as_bytes()) {
            Ok(())
        } else {
            Err(BeaconError::Unauthorized)
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
