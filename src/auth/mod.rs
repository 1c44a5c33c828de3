//! Egress authentication for backing servers
//!
//! Session-scoped token cache, 401-driven OAuth challenges with browser
//! callback completion, ID-token forwarding, and RFC 8693 token exchange.

pub mod challenge;
pub mod egress;
pub mod token_store;

use crate::Result;
use serde::Deserialize;

pub use challenge::{AuthChallenge, ChallengeManager, CompletionCallback, OAuthClientConfig};
pub use egress::{EgressAuthenticator, build_auth};
pub use token_store::{TokenKey, TokenRefresher, TokenStore};

/// Claims extracted from an ID token for status display and forwarding.
///
/// Signature verification is the issuer's job; muster only reads the claims
/// of tokens it received over authenticated channels.
#[derive(Debug, Clone, Deserialize)]
pub struct IdTokenClaims {
    pub iss: Option<String>,
    pub sub: Option<String>,
    pub email: Option<String>,
    pub aud: Option<serde_json::Value>,
    pub exp: Option<i64>,
}

/// Decode ID token claims without verifying the signature
pub fn decode_id_token_claims(token: &str) -> Result<IdTokenClaims> {
    use jsonwebtoken::{Algorithm, DecodingKey, Validation};

    let mut validation = Validation::new(Algorithm::RS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    let data = jsonwebtoken::decode::<IdTokenClaims>(
        token,
        &DecodingKey::from_secret(&[]),
        &validation,
    )
    .map_err(|e| crate::MusterError::auth(format!("failed to decode ID token: {}", e)))?;

    Ok(data.claims)
}

/// Parse a `WWW-Authenticate` challenge header into (issuer, scope).
///
/// Understands the `Bearer realm="...", scope="..."` shape; a missing scope
/// defaults to `openid`.
pub fn parse_www_authenticate(header: &str) -> Option<(String, String)> {
    let rest = header.trim().strip_prefix("Bearer")?.trim();

    let mut realm = None;
    let mut scope = None;
    for part in rest.split(',') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            let value = value.trim().trim_matches('"');
            match key.trim() {
                "realm" => realm = Some(value.to_string()),
                "scope" => scope = Some(value.to_string()),
                _ => {}
            }
        }
    }

    realm.map(|realm| (realm, scope.unwrap_or_else(|| "openid".to_string())))
}

#[cfg(test)]
mod egress_test;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_www_authenticate_realm_and_scope() {
        let header = r#"Bearer realm="https://idp.example/", scope="openid profile""#;
        let (issuer, scope) = parse_www_authenticate(header).unwrap();
        assert_eq!(issuer, "https://idp.example/");
        assert_eq!(scope, "openid profile");
    }

    #[test]
    fn test_parse_www_authenticate_defaults_scope() {
        let (issuer, scope) =
            parse_www_authenticate(r#"Bearer realm="https://dex.local""#).unwrap();
        assert_eq!(issuer, "https://dex.local");
        assert_eq!(scope, "openid");
    }

    #[test]
    fn test_parse_www_authenticate_rejects_non_bearer() {
        assert!(parse_www_authenticate(r#"Basic realm="x""#).is_none());
        assert!(parse_www_authenticate("Bearer").is_none());
    }

    #[test]
    fn test_decode_id_token_claims() {
        // Unsigned JWT: header {"alg":"RS256"} + payload with claims.
        use base64::Engine;
        let b64 = |v: serde_json::Value| {
            base64::engine::general_purpose::URL_SAFE_NO_PAD
                .encode(serde_json::to_vec(&v).unwrap())
        };
        let header = b64(serde_json::json!({"alg": "RS256", "typ": "JWT"}));
        let payload = b64(serde_json::json!({
            "iss": "https://dex.local",
            "sub": "user-1",
            "email": "dev@example.com",
            "aud": ["dex-k8s-authenticator"],
            "exp": 4102444800i64
        }));
        let token = format!("{}.{}.sig", header, payload);

        let claims = decode_id_token_claims(&token).unwrap();
        assert_eq!(claims.iss.as_deref(), Some("https://dex.local"));
        assert_eq!(claims.sub.as_deref(), Some("user-1"));
        assert_eq!(claims.email.as_deref(), Some("dev@example.com"));
    }
}
