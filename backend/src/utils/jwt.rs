use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::types::FamilyId;

/// Authentication method recorded for password logins.
pub const PASSWORD_AUTH_METHOD: &str = "pwd";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenKind {
    Access,
    Refresh,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Claims carried by both token kinds; kind-specific fields are optional so a
/// token of the wrong kind still decodes and can be reported precisely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub typ: TokenKind,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tok: Option<String>,
}

impl Claims {
    pub fn access(
        subject: String,
        roles: Vec<String>,
        auth_method: String,
        auth_time: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            sub: subject,
            typ: TokenKind::Access,
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
            jti: Uuid::new_v4().to_string(),
            roles,
            amr: Some(auth_method),
            auth_time: Some(auth_time.timestamp()),
            fid: None,
            tok: None,
        }
    }

    pub fn refresh(
        subject: String,
        family_id: FamilyId,
        secret: String,
        expires_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            sub: subject,
            typ: TokenKind::Refresh,
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            jti: Uuid::new_v4().to_string(),
            roles: Vec::new(),
            amr: None,
            auth_time: None,
            fid: Some(family_id.to_string()),
            tok: Some(secret),
        }
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("token is malformed")]
    Malformed,
    #[error("token has expired")]
    Expired,
    #[error("token signature or claims are invalid")]
    Invalid,
}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::InvalidToken
            | ErrorKind::Base64(_)
            | ErrorKind::Json(_)
            | ErrorKind::Utf8(_) => TokenError::Malformed,
            ErrorKind::ExpiredSignature => TokenError::Expired,
            _ => TokenError::Invalid,
        }
    }
}

/// Stateless signer/verifier for access and refresh tokens.
#[derive(Clone)]
pub struct TokenCodec {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec").finish_non_exhaustive()
    }
}

impl TokenCodec {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn sign(&self, claims: &Claims) -> anyhow::Result<String> {
        let token = encode(&Header::new(Algorithm::HS256), claims, &self.encoding)?;
        Ok(token)
    }

    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        self.decode_with(token, true)
    }

    /// Signature and structure are still checked; only `exp` is ignored.
    pub fn verify_ignoring_expiry(&self, token: &str) -> Result<Claims, TokenError> {
        self.decode_with(token, false)
    }

    fn decode_with(&self, token: &str, validate_exp: bool) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_exp = validate_exp;
        let data = decode::<Claims>(token.trim(), &self.decoding, &validation)?;
        Ok(data.claims)
    }
}

/// Fresh opaque per-rotation secret (256 bits, base64url).
pub fn generate_token_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Only this digest is ever persisted.
pub fn hash_token_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> TokenCodec {
        TokenCodec::new("unit-test-secret")
    }

    #[test]
    fn access_token_roundtrips_claims() {
        let codec = codec();
        let claims = Claims::access(
            "u1@example.com".into(),
            vec!["USER".into()],
            PASSWORD_AUTH_METHOD.into(),
            Utc::now(),
            Duration::minutes(15),
        );
        let token = codec.sign(&claims).expect("sign");
        let verified = codec.verify(&token).expect("verify");
        assert_eq!(verified, claims);
        assert_eq!(verified.typ, TokenKind::Access);
    }

    #[test]
    fn expired_token_is_classified_as_expired() {
        let codec = codec();
        let mut claims = Claims::access(
            "u1".into(),
            vec![],
            PASSWORD_AUTH_METHOD.into(),
            Utc::now(),
            Duration::minutes(15),
        );
        claims.exp = Utc::now().timestamp() - 10;
        let token = codec.sign(&claims).expect("sign");
        assert_eq!(codec.verify(&token), Err(TokenError::Expired));
        assert_eq!(
            codec.verify_ignoring_expiry(&token).expect("ignore expiry").sub,
            "u1"
        );
    }

    #[test]
    fn foreign_signature_is_invalid() {
        let claims = Claims::refresh(
            "u1".into(),
            FamilyId::new(),
            generate_token_secret(),
            Utc::now() + Duration::days(1),
        );
        let token = TokenCodec::new("other-secret").sign(&claims).expect("sign");
        assert_eq!(codec().verify(&token), Err(TokenError::Invalid));
        assert_eq!(
            codec().verify_ignoring_expiry(&token),
            Err(TokenError::Invalid)
        );
    }

    #[test]
    fn garbage_is_malformed() {
        assert_eq!(codec().verify("not-a-token"), Err(TokenError::Malformed));
        assert_eq!(
            codec().verify("invalid.token.here"),
            Err(TokenError::Malformed)
        );
    }

    #[test]
    fn unknown_kind_still_decodes() {
        let codec = codec();
        let token = encode(
            &Header::new(Algorithm::HS256),
            &serde_json::json!({
                "sub": "u1",
                "typ": "ID",
                "iat": Utc::now().timestamp(),
                "exp": Utc::now().timestamp() + 60,
                "jti": "x",
            }),
            &EncodingKey::from_secret("unit-test-secret".as_bytes()),
        )
        .expect("encode");
        let claims = codec.verify(&token).expect("verify");
        assert_eq!(claims.typ, TokenKind::Unknown);
    }

    #[test]
    fn token_secrets_are_unique_and_hash_deterministically() {
        let a = generate_token_secret();
        let b = generate_token_secret();
        assert_ne!(a, b);
        assert_eq!(hash_token_secret(&a), hash_token_secret(&a));
        assert_ne!(hash_token_secret(&a), a);
        assert_eq!(hash_token_secret(&a).len(), 64);
    }
}
