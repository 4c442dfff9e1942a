//! Bearer token issuance and validation.
//!
//! Tokens are compact HMAC-SHA256 signed payloads:
//! `base64url(claims_json) "." hex(hmac_sha256(secret, base64url(claims_json)))`
//! where the claims carry the subject (user id) and a unix expiry.
//!
//! The session protocol consumes only the [`TokenValidator`] capability,
//! so the concrete token scheme is swappable without touching the state
//! machine.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{ChatError, Result};
use crate::models::Principal;

type HmacSha256 = Hmac<Sha256>;

/// Validates a bearer credential and resolves it to a principal.
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str) -> Result<Principal>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    /// Subject: the user id the token was issued for.
    sub: String,
    /// Unix expiry timestamp (seconds).
    exp: i64,
}

/// HMAC-SHA256 token scheme over a shared secret.
pub struct HmacTokenValidator {
    secret: Vec<u8>,
}

impl HmacTokenValidator {
    pub fn new(secret: &str) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
        }
    }

    /// Mint a token for `user_id` valid for `ttl_secs` from now.
    pub fn issue(&self, user_id: &str, ttl_secs: u64) -> Result<String> {
        let claims = Claims {
            sub: user_id.to_string(),
            exp: chrono::Utc::now().timestamp() + ttl_secs as i64,
        };
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?);
        let sig = hex::encode(self.sign(payload.as_bytes()));
        Ok(format!("{}.{}", payload, sig))
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }
}

impl TokenValidator for HmacTokenValidator {
    fn validate(&self, token: &str) -> Result<Principal> {
        let invalid = || ChatError::Auth("Invalid token".to_string());

        let (payload, sig_hex) = token.rsplit_once('.').ok_or_else(invalid)?;
        let sig = hex::decode(sig_hex).map_err(|_| invalid())?;

        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size");
        mac.update(payload.as_bytes());
        // Constant-time comparison.
        mac.verify_slice(&sig).map_err(|_| invalid())?;

        let claims_bytes = URL_SAFE_NO_PAD.decode(payload).map_err(|_| invalid())?;
        let claims: Claims = serde_json::from_slice(&claims_bytes).map_err(|_| invalid())?;

        if claims.exp <= chrono::Utc::now().timestamp() {
            return Err(invalid());
        }

        Ok(Principal {
            user_id: claims.sub,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_validate_roundtrip() {
        let v = HmacTokenValidator::new("test-secret");
        let token = v.issue("user-42", 3600).unwrap();
        let principal = v.validate(&token).unwrap();
        assert_eq!(principal.user_id, "user-42");
    }

    #[test]
    fn test_expired_token_rejected() {
        let v = HmacTokenValidator::new("test-secret");
        let token = v.issue("user-42", 0).unwrap();
        assert!(matches!(v.validate(&token), Err(ChatError::Auth(_))));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let v = HmacTokenValidator::new("test-secret");
        let token = v.issue("user-42", 3600).unwrap();
        let (payload, sig) = token.rsplit_once('.').unwrap();

        let forged_claims = serde_json::json!({
            "sub": "someone-else",
            "exp": chrono::Utc::now().timestamp() + 3600,
        });
        let forged_payload = URL_SAFE_NO_PAD.encode(forged_claims.to_string());
        assert_ne!(payload, forged_payload);

        let forged = format!("{}.{}", forged_payload, sig);
        assert!(matches!(v.validate(&forged), Err(ChatError::Auth(_))));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let issuer = HmacTokenValidator::new("secret-a");
        let verifier = HmacTokenValidator::new("secret-b");
        let token = issuer.issue("user-42", 3600).unwrap();
        assert!(matches!(verifier.validate(&token), Err(ChatError::Auth(_))));
    }

    #[test]
    fn test_garbage_token_rejected() {
        let v = HmacTokenValidator::new("test-secret");
        for junk in ["", "no-dot", "a.b", "a.zz"] {
            assert!(matches!(v.validate(junk), Err(ChatError::Auth(_))));
        }
    }
}
