//! Bearer token verification.
//!
//! Tokens are JWTs signed with the auth service's private key. The gateway
//! only holds the public half and never issues tokens.
//!
//! Checks run in this order: signature, audience, issuer, expiry, required
//! claims (`id`, `email`, `role`). The first failing check decides the error.

use crate::error::{GatewayError, Result};
use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::info;

/// Numeric `exp` values below this are epoch seconds, otherwise milliseconds.
const EPOCH_MILLIS_CUTOFF: f64 = 1e12;

/// Platform role carried in the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Student,
    Teacher,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "STUDENT",
            Role::Teacher => "TEACHER",
            Role::Admin => "ADMIN",
        }
    }
}

impl FromStr for Role {
    type Err = AuthError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "STUDENT" => Ok(Role::Student),
            "TEACHER" => Ok(Role::Teacher),
            "ADMIN" => Ok(Role::Admin),
            other => Err(AuthError::UnknownRole(other.to_string())),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authenticated identity attached to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub id: String,
    pub email: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
}

impl Principal {
    /// Teachers and admins.
    pub fn is_staff(&self) -> bool {
        matches!(self.role, Role::Teacher | Role::Admin)
    }
}

/// Why a token was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("invalid token signature")]
    InvalidSignature,
    #[error("token audience mismatch")]
    InvalidAudience,
    #[error("token issuer mismatch")]
    InvalidIssuer,
    #[error("token expired")]
    Expired,
    #[error("token expiry is not a valid timestamp")]
    InvalidExpiry,
    #[error("token missing required claim: {0}")]
    MissingClaim(&'static str),
    #[error("unknown role: {0}")]
    UnknownRole(String),
    #[error("malformed token: {0}")]
    Malformed(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Audience {
    One(String),
    Many(Vec<String>),
}

impl Audience {
    fn contains(&self, expected: &str) -> bool {
        match self {
            Audience::One(aud) => aud == expected,
            Audience::Many(auds) => auds.iter().any(|aud| aud == expected),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenClaims {
    id: Option<String>,
    sub: Option<String>,
    email: Option<String>,
    role: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    aud: Option<Audience>,
    iss: Option<String>,
    #[serde(default)]
    exp: Value,
}

/// Verifies tokens against the trusted public key.
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
    audience: String,
    issuer: String,
}

impl fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("algorithms", &self.validation.algorithms)
            .field("audience", &self.audience)
            .field("issuer", &self.issuer)
            .finish()
    }
}

impl TokenVerifier {
    /// Build a verifier from a PEM public key (Ed25519, RSA or EC P-256).
    ///
    /// Fails closed: an empty or unparseable key is an error.
    pub fn from_pem(pem: &[u8], audience: &str, issuer: &str) -> Result<Self> {
        if pem.iter().all(u8::is_ascii_whitespace) {
            return Err(GatewayError::VerificationKey("key is empty".to_string()));
        }

        let (key, algorithms) = if let Ok(key) = DecodingKey::from_ed_pem(pem) {
            (key, vec![Algorithm::EdDSA])
        } else if let Ok(key) = DecodingKey::from_rsa_pem(pem) {
            (key, vec![Algorithm::RS256, Algorithm::RS384, Algorithm::RS512])
        } else if let Ok(key) = DecodingKey::from_ec_pem(pem) {
            (key, vec![Algorithm::ES256])
        } else {
            return Err(GatewayError::VerificationKey(
                "expected an Ed25519, RSA or EC public key in PEM format".to_string(),
            ));
        };

        info!("Token verifier initialized ({:?})", algorithms);

        let mut validation = Validation::new(algorithms[0]);
        validation.algorithms = algorithms;
        // Audience, issuer and expiry are checked in `check_claims`
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims = HashSet::new();

        Ok(Self {
            key,
            validation,
            audience: audience.to_string(),
            issuer: issuer.to_string(),
        })
    }

    /// Verify a token against the current time.
    pub fn verify(&self, token: &str) -> std::result::Result<Principal, AuthError> {
        self.verify_at(token, Utc::now())
    }

    /// Verify a token as if the current time were `now`.
    pub fn verify_at(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> std::result::Result<Principal, AuthError> {
        decode_header(token).map_err(|e| AuthError::Malformed(e.to_string()))?;
        let data = decode::<TokenClaims>(token, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => {
                    AuthError::InvalidSignature
                }
                other => AuthError::Malformed(format!("{other:?}")),
            }
        })?;
        self.check_claims(data.claims, now)
    }

    fn check_claims(
        &self,
        claims: TokenClaims,
        now: DateTime<Utc>,
    ) -> std::result::Result<Principal, AuthError> {
        if !claims.aud.is_some_and(|aud| aud.contains(&self.audience)) {
            return Err(AuthError::InvalidAudience);
        }
        if claims.iss.as_deref() != Some(self.issuer.as_str()) {
            return Err(AuthError::InvalidIssuer);
        }
        if let Some(expires_at) = parse_expiry(&claims.exp)? {
            if expires_at <= now {
                return Err(AuthError::Expired);
            }
        }

        let id = claims
            .id
            .or(claims.sub)
            .filter(|id| !id.is_empty())
            .ok_or(AuthError::MissingClaim("id"))?;
        let email = claims
            .email
            .filter(|email| !email.is_empty())
            .ok_or(AuthError::MissingClaim("email"))?;
        let role = claims
            .role
            .ok_or(AuthError::MissingClaim("role"))?
            .parse::<Role>()?;

        Ok(Principal {
            id,
            email,
            role,
            first_name: claims.first_name,
            last_name: claims.last_name,
        })
    }
}

/// Parse an `exp` claim. Accepts epoch seconds or milliseconds (decided by
/// magnitude), numeric strings, and RFC 3339 timestamps. `null`/absent means
/// the token does not expire.
fn parse_expiry(exp: &Value) -> std::result::Result<Option<DateTime<Utc>>, AuthError> {
    match exp {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_f64()
            .and_then(epoch_to_datetime)
            .map(Some)
            .ok_or(AuthError::InvalidExpiry),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(raw) = s.parse::<f64>() {
                return epoch_to_datetime(raw)
                    .map(Some)
                    .ok_or(AuthError::InvalidExpiry);
            }
            DateTime::parse_from_rfc3339(s)
                .map(|dt| Some(dt.with_timezone(&Utc)))
                .map_err(|_| AuthError::InvalidExpiry)
        }
        _ => Err(AuthError::InvalidExpiry),
    }
}

fn epoch_to_datetime(raw: f64) -> Option<DateTime<Utc>> {
    if !raw.is_finite() {
        return None;
    }
    let millis = if raw < EPOCH_MILLIS_CUTOFF {
        raw * 1000.0
    } else {
        raw
    };
    DateTime::from_timestamp_millis(millis as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    const SIGNING_KEY: &[u8] = include_bytes!("../tests/fixtures/signing_key.pem");
    const FOREIGN_SIGNING_KEY: &[u8] = include_bytes!("../tests/fixtures/foreign_signing_key.pem");
    const VERIFYING_KEY: &[u8] = include_bytes!("../tests/fixtures/verifying_key.pem");

    fn verifier() -> TokenVerifier {
        TokenVerifier::from_pem(VERIFYING_KEY, "edu-platform", "auth-service").unwrap()
    }

    fn sign_with(key: &[u8], claims: &Value) -> String {
        let key = EncodingKey::from_ed_pem(key).unwrap();
        encode(&Header::new(Algorithm::EdDSA), claims, &key).unwrap()
    }

    fn sign(claims: &Value) -> String {
        sign_with(SIGNING_KEY, claims)
    }

    fn claims() -> Value {
        json!({
            "id": "u1",
            "email": "u1@school.test",
            "role": "STUDENT",
            "firstName": "Ada",
            "aud": "edu-platform",
            "iss": "auth-service",
        })
    }

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(2_000, 0).unwrap()
    }

    #[test]
    fn test_valid_token_yields_principal() {
        let principal = verifier().verify_at(&sign(&claims()), now()).unwrap();
        assert_eq!(principal.id, "u1");
        assert_eq!(principal.email, "u1@school.test");
        assert_eq!(principal.role, Role::Student);
        assert_eq!(principal.first_name.as_deref(), Some("Ada"));
        assert_eq!(principal.last_name, None);
    }

    #[test]
    fn test_missing_required_claims_fail() {
        for field in ["id", "email", "role"] {
            let mut claims = claims();
            claims.as_object_mut().unwrap().remove(field);
            let err = verifier().verify_at(&sign(&claims), now()).unwrap_err();
            assert_eq!(err, AuthError::MissingClaim(field), "field {field}");
        }
    }

    #[test]
    fn test_sub_is_accepted_as_id() {
        let mut claims = claims();
        claims.as_object_mut().unwrap().remove("id");
        claims["sub"] = json!("u7");
        let principal = verifier().verify_at(&sign(&claims), now()).unwrap();
        assert_eq!(principal.id, "u7");
    }

    #[test]
    fn test_unknown_role_fails() {
        let mut claims = claims();
        claims["role"] = json!("PARENT");
        let err = verifier().verify_at(&sign(&claims), now()).unwrap_err();
        assert_eq!(err, AuthError::UnknownRole("PARENT".to_string()));
    }

    #[test]
    fn test_foreign_signature_fails() {
        let token = sign_with(FOREIGN_SIGNING_KEY, &claims());
        let err = verifier().verify_at(&token, now()).unwrap_err();
        assert_eq!(err, AuthError::InvalidSignature);
    }

    #[test]
    fn test_wrong_audience_then_issuer() {
        let mut wrong_both = claims();
        wrong_both["aud"] = json!("other-platform");
        wrong_both["iss"] = json!("someone-else");
        let err = verifier().verify_at(&sign(&wrong_both), now()).unwrap_err();
        assert_eq!(err, AuthError::InvalidAudience);

        let mut wrong_issuer = claims();
        wrong_issuer["iss"] = json!("someone-else");
        let err = verifier().verify_at(&sign(&wrong_issuer), now()).unwrap_err();
        assert_eq!(err, AuthError::InvalidIssuer);

        let mut audience_list = claims();
        audience_list["aud"] = json!(["mobile", "edu-platform"]);
        assert!(verifier().verify_at(&sign(&audience_list), now()).is_ok());
    }

    #[test]
    fn test_expiry_in_epoch_seconds() {
        let mut expired = claims();
        expired["exp"] = json!(1000);
        let err = verifier().verify_at(&sign(&expired), now()).unwrap_err();
        assert_eq!(err, AuthError::Expired);

        let mut fresh = claims();
        fresh["exp"] = json!(3000);
        assert!(verifier().verify_at(&sign(&fresh), now()).is_ok());
    }

    #[test]
    fn test_expiry_in_epoch_millis_and_strings() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

        let mut millis = claims();
        millis["exp"] = json!(1_700_000_100_000_i64);
        assert!(verifier().verify_at(&sign(&millis), now).is_ok());

        let mut stale_millis = claims();
        stale_millis["exp"] = json!(1_699_999_999_000_i64);
        assert_eq!(
            verifier().verify_at(&sign(&stale_millis), now).unwrap_err(),
            AuthError::Expired
        );

        let mut rfc3339 = claims();
        rfc3339["exp"] = json!("2023-11-14T22:13:20Z");
        assert_eq!(
            verifier().verify_at(&sign(&rfc3339), now).unwrap_err(),
            AuthError::Expired
        );
        rfc3339["exp"] = json!("2030-01-01T00:00:00.000Z");
        assert!(verifier().verify_at(&sign(&rfc3339), now).is_ok());

        let mut garbage = claims();
        garbage["exp"] = json!("next tuesday");
        assert_eq!(
            verifier().verify_at(&sign(&garbage), now).unwrap_err(),
            AuthError::InvalidExpiry
        );
    }

    #[test]
    fn test_garbage_token_is_malformed() {
        let err = verifier().verify_at("not.a.token", now()).unwrap_err();
        assert!(matches!(err, AuthError::Malformed(_)));
    }

    #[test]
    fn test_empty_or_invalid_key_fails_closed() {
        assert!(TokenVerifier::from_pem(b"  \n", "a", "b").is_err());
        assert!(TokenVerifier::from_pem(b"-----BEGIN PUBLIC KEY-----\nAAAA\n-----END PUBLIC KEY-----\n", "a", "b").is_err());
    }
}
