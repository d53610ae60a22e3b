//! Caller identity extraction from request headers.
//!
//! The invocation surface accepts an optional HS256 bearer token. A valid
//! token yields an authenticated caller with `sub`/`role`/`email` claims; a
//! missing or invalid token degrades to the anonymous caller so public
//! procedures stay reachable. A configured static service key
//! short-circuits to `service_role`.

use axum::http::{header, HeaderMap};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde_json::Value;
use tracing::debug;

use flux_rpc::executor::CallerIdentity;

#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub jwt_secret: Option<String>,
    pub service_key: Option<String>,
}

/// Resolves the caller for a request. Never fails: everything that does not
/// authenticate cleanly is the anonymous caller.
pub fn caller_from_headers(config: &AuthConfig, headers: &HeaderMap) -> CallerIdentity {
    let Some(token) = bearer_token(headers) else {
        return CallerIdentity::anonymous();
    };

    if let Some(service_key) = config.service_key.as_deref() {
        if token == service_key {
            return CallerIdentity::service_role();
        }
    }

    let Some(secret) = config.jwt_secret.as_deref() else {
        debug!("bearer token supplied but no JWT secret configured");
        return CallerIdentity::anonymous();
    };

    let mut validation = Validation::new(Algorithm::HS256);
    validation.required_spec_claims.clear();
    match decode::<Value>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    ) {
        Ok(data) => caller_from_claims(data.claims),
        Err(error) => {
            debug!(%error, "rejecting bearer token");
            CallerIdentity::anonymous()
        }
    }
}

fn caller_from_claims(claims: Value) -> CallerIdentity {
    let user_id = claims
        .get("sub")
        .and_then(Value::as_str)
        .map(str::to_string);
    let role = claims
        .get("role")
        .and_then(Value::as_str)
        .unwrap_or("authenticated")
        .to_string();
    let email = claims
        .get("email")
        .and_then(Value::as_str)
        .map(str::to_string);
    CallerIdentity {
        user_id,
        role,
        email,
        claims,
        is_authenticated: true,
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    fn config() -> AuthConfig {
        AuthConfig {
            jwt_secret: Some("test-secret".to_string()),
            service_key: Some("svc-key-123".to_string()),
        }
    }

    fn headers_with(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            format!("Bearer {token}").parse().unwrap(),
        );
        headers
    }

    #[test]
    fn no_header_is_anonymous() {
        let caller = caller_from_headers(&config(), &HeaderMap::new());
        assert!(!caller.is_authenticated);
        assert_eq!(caller.role, "anon");
    }

    #[test]
    fn service_key_short_circuits() {
        let caller = caller_from_headers(&config(), &headers_with("svc-key-123"));
        assert!(caller.is_authenticated);
        assert_eq!(caller.role, "service_role");
    }

    #[test]
    fn valid_jwt_yields_authenticated_caller() {
        let token = encode(
            &Header::default(),
            &json!({"sub": "u1", "role": "user", "email": "u1@example.com"}),
            &EncodingKey::from_secret("test-secret".as_bytes()),
        )
        .unwrap();

        let caller = caller_from_headers(&config(), &headers_with(&token));
        assert!(caller.is_authenticated);
        assert_eq!(caller.user_id.as_deref(), Some("u1"));
        assert_eq!(caller.role, "user");
        assert_eq!(caller.email.as_deref(), Some("u1@example.com"));
        assert_eq!(caller.claims["sub"], json!("u1"));
    }

    #[test]
    fn tampered_jwt_is_anonymous() {
        let token = encode(
            &Header::default(),
            &json!({"sub": "u1"}),
            &EncodingKey::from_secret("wrong-secret".as_bytes()),
        )
        .unwrap();

        let caller = caller_from_headers(&config(), &headers_with(&token));
        assert!(!caller.is_authenticated);
    }

    #[test]
    fn missing_role_defaults_to_authenticated() {
        let token = encode(
            &Header::default(),
            &json!({"sub": "u2"}),
            &EncodingKey::from_secret("test-secret".as_bytes()),
        )
        .unwrap();

        let caller = caller_from_headers(&config(), &headers_with(&token));
        assert_eq!(caller.role, "authenticated");
    }
}
