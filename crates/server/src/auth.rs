use anyhow::{Context, Result};
use axum::http::HeaderMap;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, TokenData, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Which side of an engagement a token holder is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Participant {
    Agent,
    Visitor,
}

/// JWT claims issued by the identity provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Participant id (agent or visitor)
    pub sub: String,
    pub role: Participant,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
    /// Issued at (Unix timestamp)
    pub iat: u64,
}

impl Claims {
    pub fn is_agent(&self) -> bool {
        self.role == Participant::Agent
    }
}

const TOKEN_EXPIRY_SECS: u64 = 12 * 60 * 60;

/// Generate a JWT for a participant. Tokens are normally minted by the
/// identity provider sharing `secret`; the relay uses this in tests and
/// for operator tooling.
pub fn generate_jwt(sub: &str, role: Participant, secret: &str) -> Result<String> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("System clock error")?
        .as_secs();

    let claims = Claims {
        sub: sub.to_string(),
        role,
        iat: now,
        exp: now + TOKEN_EXPIRY_SECS,
    };

    let token = jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .context("Failed to encode JWT")?;

    Ok(token)
}

/// Validate a JWT token and return the claims.
pub fn validate_jwt(token: &str, secret: &str) -> Result<Claims> {
    let validation = Validation::new(Algorithm::HS256);

    let token_data: TokenData<Claims> = jsonwebtoken::decode(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .context("Invalid or expired token")?;

    Ok(token_data.claims)
}

/// Bearer token from the Authorization header, falling back to `?token=`.
pub fn bearer_token<'a>(headers: &'a HeaderMap, query_token: Option<&'a str>) -> Option<&'a str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or(query_token)
}

/// Random secret for when none is configured. Tokens signed by an external
/// provider will not validate against it.
pub fn generate_secret() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jwt_roundtrip() {
        let secret = "test-secret-for-jwt";
        let token = generate_jwt("agent-7", Participant::Agent, secret).unwrap();
        let claims = validate_jwt(&token, secret).unwrap();
        assert_eq!(claims.sub, "agent-7");
        assert_eq!(claims.role, Participant::Agent);
        assert!(claims.is_agent());
        assert_eq!(claims.exp - claims.iat, TOKEN_EXPIRY_SECS);
    }

    #[test]
    fn jwt_rejects_wrong_secret() {
        let token = generate_jwt("visitor-3", Participant::Visitor, "correct-secret").unwrap();
        assert!(validate_jwt(&token, "wrong-secret").is_err());
    }

    #[test]
    fn jwt_rejects_garbage() {
        assert!(validate_jwt("not.a.token", "secret").is_err());
    }

    #[test]
    fn jwt_rejects_expired_token() {
        let secret = "test-secret";
        let old_claims = Claims {
            sub: "agent-7".to_string(),
            role: Participant::Agent,
            iat: 1000,
            exp: 1000 + TOKEN_EXPIRY_SECS,
        };
        let token = jsonwebtoken::encode(
            &Header::default(),
            &old_claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap();
        assert!(validate_jwt(&token, secret).is_err());
    }

    #[test]
    fn role_is_lowercase_on_the_wire() {
        let claims = Claims {
            sub: "visitor-3".to_string(),
            role: Participant::Visitor,
            iat: 1,
            exp: 2,
        };
        let json = serde_json::to_value(&claims).unwrap();
        assert_eq!(json["role"], "visitor");
    }

    #[test]
    fn bearer_header_wins_over_query() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers, Some("q")), Some("q"));
        headers.insert("authorization", "Bearer h".parse().unwrap());
        assert_eq!(bearer_token(&headers, Some("q")), Some("h"));
        assert_eq!(bearer_token(&HeaderMap::new(), None), None);
    }

    #[test]
    fn generated_secrets_are_long_and_unique() {
        let s1 = generate_secret();
        let s2 = generate_secret();
        assert_eq!(s1.len(), 64);
        assert!(s1.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(s1, s2);
    }
}
