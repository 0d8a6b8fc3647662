//! Bearer authentication.
//!
//! Two bearer forms are accepted on `Authorization: Bearer ..`:
//!
//! 1. A raw access key of the form `rag_<uuid>`, matched directly against
//!    the `access_token` table.
//! 2. A compact HS256 JWT whose `kid` header names a stored access key id;
//!    the signature must verify against that token's secret access key.
//!
//! This module only resolves bearers to access keys. Authorization proper
//! (per-tub ACL checks) happens in the metadata store so it shares the
//! transaction of the operation it guards.

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

/// Prefix of raw access keys.
pub const ACCESS_KEY_PREFIX: &str = "rag_";

/// Clock skew tolerated on the `iat` claim.
const IAT_SKEW_SECONDS: i64 = 10;

/// Per-tub permissions checked against `tub_acl`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclOperation {
    /// May create documents (or, globally, tubs).
    Create,
    /// May read tub contents (or, globally, list tubs).
    Read,
    /// May update tub settings or documents.
    Update,
    /// May delete tubs, documents, or chunks.
    Delete,
}

impl AclOperation {
    /// Column of `tub_acl` that grants this operation.
    pub fn acl_column(self) -> &'static str {
        match self {
            Self::Create => "allow_create",
            Self::Read => "allow_read",
            Self::Update => "allow_update",
            Self::Delete => "allow_delete",
        }
    }
}

/// Errors raised while resolving a bearer to an access key.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No `Authorization: Bearer ..` header was present.
    #[error("no access token was provided")]
    MissingBearer,
    /// The bearer was neither a valid access key nor a verifiable JWT.
    #[error("invalid access token: {0}")]
    InvalidToken(String),
}

/// Whether the bearer looks like a raw `rag_<uuid>` access key.
pub fn is_access_key(bearer: &str) -> bool {
    bearer
        .strip_prefix(ACCESS_KEY_PREFIX)
        .is_some_and(|suffix| Uuid::parse_str(suffix).is_ok())
}

#[derive(Debug, Deserialize)]
struct JwtClaims {
    #[serde(default)]
    iat: i64,
    #[allow(dead_code)]
    exp: i64,
}

/// Extract the `kid` from a compact JWT, requiring the HS256 algorithm.
pub fn jwt_key_id(token: &str) -> Result<String, AuthError> {
    let header =
        decode_header(token).map_err(|e| AuthError::InvalidToken(format!("bad header: {e}")))?;
    if header.alg != Algorithm::HS256 {
        return Err(AuthError::InvalidToken(format!(
            "unexpected signing method {:?}, expected HS256",
            header.alg
        )));
    }
    header
        .kid
        .filter(|kid| !kid.is_empty())
        .ok_or_else(|| AuthError::InvalidToken("kid not found in JWT header".into()))
}

/// Verify a JWT's signature and time claims against a stored access key.
pub fn verify_jwt(access_key: &str, token: &str) -> Result<(), AuthError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;
    validation.validate_exp = true;

    let data = decode::<JwtClaims>(
        token,
        &DecodingKey::from_secret(access_key.as_bytes()),
        &validation,
    )
    .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

    let now = Utc::now().timestamp();
    if data.claims.iat - IAT_SKEW_SECONDS > now {
        return Err(AuthError::InvalidToken("token is not yet valid".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims {
        iss: String,
        iat: i64,
        exp: i64,
        sub: String,
    }

    fn signed(key: &str, kid: Option<&str>, iat: i64, exp: i64) -> String {
        let mut header = Header::new(Algorithm::HS256);
        header.kid = kid.map(str::to_owned);
        let claims = TestClaims {
            iss: "test".into(),
            iat,
            exp,
            sub: "tester".into(),
        };
        encode(&header, &claims, &EncodingKey::from_secret(key.as_bytes())).unwrap()
    }

    #[test]
    fn detects_access_key_shape() {
        assert!(is_access_key("rag_0a361bcc-0a55-4f38-8f3e-f16f0f1a0b6e"));
        assert!(!is_access_key("rag_not-a-uuid"));
        assert!(!is_access_key("0a361bcc-0a55-4f38-8f3e-f16f0f1a0b6e"));
        assert!(!is_access_key(""));
    }

    #[test]
    fn extracts_kid_from_header() {
        let now = Utc::now().timestamp();
        let token = signed("secret", Some("key-1"), now, now + 60);
        assert_eq!(jwt_key_id(&token).unwrap(), "key-1");
    }

    #[test]
    fn rejects_missing_kid() {
        let now = Utc::now().timestamp();
        let token = signed("secret", None, now, now + 60);
        assert!(matches!(jwt_key_id(&token), Err(AuthError::InvalidToken(_))));
    }

    #[test]
    fn verifies_good_signature() {
        let now = Utc::now().timestamp();
        let token = signed("rag_secret", Some("key-1"), now, now + 60);
        verify_jwt("rag_secret", &token).expect("valid token verifies");
    }

    #[test]
    fn rejects_wrong_key() {
        let now = Utc::now().timestamp();
        let token = signed("rag_secret", Some("key-1"), now, now + 60);
        assert!(verify_jwt("other_key", &token).is_err());
    }

    #[test]
    fn rejects_expired_token() {
        let now = Utc::now().timestamp();
        let token = signed("rag_secret", Some("key-1"), now - 120, now - 60);
        assert!(verify_jwt("rag_secret", &token).is_err());
    }

    #[test]
    fn allows_small_iat_skew_but_not_future_tokens() {
        let now = Utc::now().timestamp();
        let slightly_ahead = signed("rag_secret", Some("key-1"), now + 5, now + 300);
        verify_jwt("rag_secret", &slightly_ahead).expect("5s skew tolerated");

        let far_ahead = signed("rag_secret", Some("key-1"), now + 120, now + 300);
        assert!(verify_jwt("rag_secret", &far_ahead).is_err());
    }
}
