//! Capability tokens for artifact URLs. A token is a 256-bit URL-safe random
//! string paired with an absolute expiry; it is reusable until expiry and is
//! the only credential on the artifact fetch routes.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use subtle::ConstantTimeEq;
use thiserror::Error;
use time::{Duration, OffsetDateTime};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    /// No token was ever issued for the resource.
    #[error("no token issued")]
    NotIssued,
    /// Token mismatch or past expiry.
    #[error("token rejected")]
    Forbidden,
}

/// A freshly issued token and its absolute expiry.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: OffsetDateTime,
}

/// Issues and validates capability tokens with a fixed TTL.
#[derive(Debug, Clone)]
pub struct TokenService {
    ttl: Duration,
}

impl TokenService {
    pub fn new(ttl: Duration) -> Self {
        // A zero or negative TTL would mint dead tokens.
        let ttl = if ttl <= Duration::ZERO {
            Duration::minutes(1)
        } else {
            ttl
        };
        Self { ttl }
    }

    pub fn from_ttl_minutes(minutes: i64) -> Self {
        Self::new(Duration::minutes(minutes.max(1)))
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn issue(&self) -> IssuedToken {
        self.issue_at(OffsetDateTime::now_utc())
    }

    pub fn issue_at(&self, now: OffsetDateTime) -> IssuedToken {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        IssuedToken {
            token: URL_SAFE_NO_PAD.encode(bytes),
            expires_at: now + self.ttl,
        }
    }

    /// Validation contract: `NotIssued` when the resource never had a token,
    /// `Forbidden` on mismatch or expiry, `Ok` otherwise. Matching uses
    /// constant-time comparison; a token is valid up to and including its
    /// expiry instant.
    pub fn validate(
        &self,
        stored: Option<(&str, Option<OffsetDateTime>)>,
        provided: &str,
    ) -> Result<(), TokenError> {
        self.validate_at(stored, provided, OffsetDateTime::now_utc())
    }

    pub fn validate_at(
        &self,
        stored: Option<(&str, Option<OffsetDateTime>)>,
        provided: &str,
        now: OffsetDateTime,
    ) -> Result<(), TokenError> {
        let Some((expected, expires_at)) = stored else {
            return Err(TokenError::NotIssued);
        };
        if expected.is_empty() {
            return Err(TokenError::NotIssued);
        }
        let matches = expected.len() == provided.len()
            && bool::from(expected.as_bytes().ct_eq(provided.as_bytes()));
        if !matches {
            return Err(TokenError::Forbidden);
        }
        if let Some(expires_at) = expires_at {
            if now > expires_at {
                return Err(TokenError::Forbidden);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn issued_tokens_are_high_entropy_and_url_safe() {
        let svc = TokenService::from_ttl_minutes(60);
        let a = svc.issue();
        let b = svc.issue();
        assert_ne!(a.token, b.token);
        assert_eq!(a.token.len(), 43); // 32 bytes, unpadded base64url
        assert!(a.token.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn valid_until_and_including_expiry() {
        let svc = TokenService::from_ttl_minutes(10);
        let issued_at = datetime!(2026-01-01 00:00 UTC);
        let t = svc.issue_at(issued_at);
        let stored = Some((t.token.as_str(), Some(t.expires_at)));
        assert_eq!(svc.validate_at(stored, &t.token, issued_at), Ok(()));
        assert_eq!(svc.validate_at(stored, &t.token, t.expires_at), Ok(()));
        assert_eq!(
            svc.validate_at(stored, &t.token, t.expires_at + Duration::seconds(1)),
            Err(TokenError::Forbidden)
        );
    }

    #[test]
    fn mismatch_is_forbidden_and_missing_is_not_issued() {
        let svc = TokenService::from_ttl_minutes(10);
        let t = svc.issue();
        let stored = Some((t.token.as_str(), Some(t.expires_at)));
        assert_eq!(svc.validate(stored, "nope"), Err(TokenError::Forbidden));
        assert_eq!(svc.validate(None, &t.token), Err(TokenError::NotIssued));
    }

    #[test]
    fn tokens_are_reusable_until_expiry() {
        let svc = TokenService::from_ttl_minutes(10);
        let t = svc.issue();
        let stored = Some((t.token.as_str(), Some(t.expires_at)));
        for _ in 0..3 {
            assert_eq!(svc.validate(stored, &t.token), Ok(()));
        }
    }
}
