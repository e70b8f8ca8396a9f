//! Signed stream tokens.
//!
//! Format: `base64url(json claims) "." base64url(hmac-sha256(claims part))`.
//! Tokens are checked once, when a stream is opened. There is no revocation.

use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use thiserror::Error;

type HmacSha256 = Hmac<sha2::Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamClaims {
    /// Session id.
    pub sid: String,
    /// User id.
    pub uid: String,
    /// Expiry, unix seconds.
    pub exp: i64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed stream token")]
    Malformed,
    #[error("stream token signature mismatch")]
    BadSignature,
    #[error("stream token expired")]
    Expired,
    #[error("stream token signing key is invalid")]
    Key,
}

#[derive(Clone)]
pub struct StreamTokenSigner {
    secret: Vec<u8>,
}

impl StreamTokenSigner {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn mac(&self) -> Result<HmacSha256, TokenError> {
        HmacSha256::new_from_slice(&self.secret).map_err(|_| TokenError::Key)
    }

    pub fn issue(
        &self,
        session_id: &str,
        user_id: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<String, TokenError> {
        let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let claims = StreamClaims {
            sid: session_id.to_string(),
            uid: user_id.to_string(),
            exp: now.timestamp().saturating_add(ttl),
        };
        let json = serde_json::to_vec(&claims).map_err(|_| TokenError::Malformed)?;
        let body = URL_SAFE_NO_PAD.encode(json);
        let mut mac = self.mac()?;
        mac.update(body.as_bytes());
        let sig = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{body}.{sig}"))
    }

    /// Check signature, then expiry. The signature comparison is constant time.
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<StreamClaims, TokenError> {
        let (body, sig) = token.split_once('.').ok_or(TokenError::Malformed)?;
        let sig = URL_SAFE_NO_PAD
            .decode(sig)
            .map_err(|_| TokenError::Malformed)?;
        let mut mac = self.mac()?;
        mac.update(body.as_bytes());
        mac.verify_slice(&sig).map_err(|_| TokenError::BadSignature)?;

        let json = URL_SAFE_NO_PAD
            .decode(body)
            .map_err(|_| TokenError::Malformed)?;
        let claims: StreamClaims =
            serde_json::from_slice(&json).map_err(|_| TokenError::Malformed)?;
        if now.timestamp() >= claims.exp {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> StreamTokenSigner {
        StreamTokenSigner::new("stream-secret")
    }

    #[test]
    fn issued_token_verifies() {
        let now = Utc::now();
        let token = signer().issue("s1", "user-1", Duration::from_secs(60), now).unwrap();
        let claims = signer().verify(&token, now).unwrap();
        assert_eq!(claims.sid, "s1");
        assert_eq!(claims.uid, "user-1");
    }

    #[test]
    fn expired_token_is_rejected() {
        let now = Utc::now();
        let token = signer().issue("s1", "u", Duration::from_secs(60), now).unwrap();
        let later = now + chrono::Duration::seconds(61);
        assert_eq!(signer().verify(&token, later), Err(TokenError::Expired));
    }

    #[test]
    fn tampered_claims_fail_signature() {
        let now = Utc::now();
        let token = signer().issue("s1", "u", Duration::from_secs(60), now).unwrap();
        let (_, sig) = token.split_once('.').unwrap();
        let forged_claims = StreamClaims {
            sid: "s2".into(),
            uid: "u".into(),
            exp: now.timestamp() + 60,
        };
        let forged_body = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged_claims).unwrap());
        let forged = format!("{forged_body}.{sig}");
        assert_eq!(signer().verify(&forged, now), Err(TokenError::BadSignature));
    }

    #[test]
    fn other_key_fails_signature() {
        let now = Utc::now();
        let token = signer().issue("s1", "u", Duration::from_secs(60), now).unwrap();
        let other = StreamTokenSigner::new("different");
        assert_eq!(other.verify(&token, now), Err(TokenError::BadSignature));
    }

    #[test]
    fn garbage_is_malformed() {
        let now = Utc::now();
        assert_eq!(signer().verify("no-dot-here", now), Err(TokenError::Malformed));
        assert_eq!(signer().verify("abc.!!!", now), Err(TokenError::Malformed));
    }
}
