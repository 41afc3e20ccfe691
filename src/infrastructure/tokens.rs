//! Approval tokens: HMAC-SHA256 signed, time-bounded, bound to exactly one
//! approval request and the admin approver role.
//!
//! Format: `{approval_id}:{approver_role}:{expires_unix_seconds}:{hmac_hex}`.
//! The signature covers everything before the final separator.

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::models::Role;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed approval token")]
    Malformed,
    #[error("approval token signature invalid")]
    Signature,
    #[error("approval token expired")]
    Expired,
    #[error("approval token does not match this approval")]
    Mismatch,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApprovalToken {
    pub approval_id: Uuid,
    pub approver_role: Role,
    pub expires_at: DateTime<Utc>,
}

fn sign(secret: &[u8], payload: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Mints a token authorizing one admin decision on `approval_id`.
pub fn mint(secret: &[u8], approval_id: Uuid, ttl: Duration) -> (String, DateTime<Utc>) {
    let expires_at = Utc::now() + ttl;
    let payload = format!(
        "{approval_id}:{}:{}",
        Role::Admin.as_str(),
        expires_at.timestamp()
    );
    let signature = sign(secret, &payload);
    // Second precision is what the token encodes; keep the stored expiry in
    // step with it.
    let expires_at = DateTime::from_timestamp(expires_at.timestamp(), 0).unwrap_or(expires_at);
    (format!("{payload}:{signature}"), expires_at)
}

/// Verifies signature, expiry, role binding, and the approval binding.
pub fn verify(secret: &[u8], raw: &str, expected_approval_id: Uuid) -> Result<ApprovalToken, TokenError> {
    let parts: Vec<&str> = raw.splitn(4, ':').collect();
    if parts.len() != 4 {
        return Err(TokenError::Malformed);
    }
    let (id_part, role_part, expires_part, signature_hex) =
        (parts[0], parts[1], parts[2], parts[3]);

    let payload = format!("{id_part}:{role_part}:{expires_part}");
    let expected = sign(secret, &payload);
    let matches: bool = expected
        .as_bytes()
        .ct_eq(signature_hex.as_bytes())
        .into();
    if !matches {
        return Err(TokenError::Signature);
    }

    let approval_id: Uuid = id_part.parse().map_err(|_| TokenError::Malformed)?;
    if approval_id != expected_approval_id {
        return Err(TokenError::Mismatch);
    }

    let approver_role: Role = role_part.parse().map_err(|_| TokenError::Malformed)?;
    let expires_at = expires_part
        .parse::<i64>()
        .ok()
        .and_then(|seconds| DateTime::from_timestamp(seconds, 0))
        .ok_or(TokenError::Malformed)?;
    if expires_at <= Utc::now() {
        return Err(TokenError::Expired);
    }

    Ok(ApprovalToken {
        approval_id,
        approver_role,
        expires_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"integration-secret";

    #[test]
    fn mint_and_verify_round_trip() {
        let approval_id = Uuid::new_v4();
        let (token, expires_at) = mint(SECRET, approval_id, Duration::hours(24));

        let verified = verify(SECRET, &token, approval_id).expect("token should verify");

        assert_eq!(verified.approval_id, approval_id);
        assert_eq!(verified.approver_role, Role::Admin);
        assert_eq!(verified.expires_at, expires_at);
    }

    #[test]
    fn tampered_payload_fails_signature() {
        let approval_id = Uuid::new_v4();
        let (token, _) = mint(SECRET, approval_id, Duration::hours(1));
        let other_id = Uuid::new_v4();
        let forged = token.replacen(&approval_id.to_string(), &other_id.to_string(), 1);

        assert_eq!(
            verify(SECRET, &forged, other_id),
            Err(TokenError::Signature)
        );
    }

    #[test]
    fn wrong_secret_fails_signature() {
        let approval_id = Uuid::new_v4();
        let (token, _) = mint(SECRET, approval_id, Duration::hours(1));

        assert_eq!(
            verify(b"other-secret", &token, approval_id),
            Err(TokenError::Signature)
        );
    }

    #[test]
    fn token_is_bound_to_its_approval() {
        let approval_id = Uuid::new_v4();
        let (token, _) = mint(SECRET, approval_id, Duration::hours(1));

        assert_eq!(
            verify(SECRET, &token, Uuid::new_v4()),
            Err(TokenError::Mismatch)
        );
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let approval_id = Uuid::new_v4();
        let (token, _) = mint(SECRET, approval_id, Duration::seconds(-10));

        assert_eq!(verify(SECRET, &token, approval_id), Err(TokenError::Expired));
    }

    #[test]
    fn garbage_is_malformed() {
        assert_eq!(
            verify(SECRET, "not-a-token", Uuid::new_v4()),
            Err(TokenError::Malformed)
        );
    }
}
