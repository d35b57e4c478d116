//! Token verification.
//!
//! Tokens are HS256 JWTs issued elsewhere. The server only verifies them and
//! binds the connection or request to the `user_id` claim.

use axum::http::{header, HeaderMap, Uri};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use relay_core::UserId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Query parameter that may carry the token, for clients that cannot set
/// headers on a WebSocket upgrade.
pub const TOKEN_QUERY_PARAM: &str = "token";

/// JWT claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User the token was issued to.
    pub user_id: UserId,
    /// User email.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// User role.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Expiration (Unix timestamp).
    pub exp: i64,
    /// Issued at (Unix timestamp).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
}

/// Verification errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No token was presented.
    #[error("Missing token")]
    MissingToken,

    /// The token failed signature or claim validation.
    #[error("Invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),

    /// The token names no user.
    #[error("Token has an empty user_id")]
    EmptySubject,
}

/// The authenticated user of a request, inserted by the auth middleware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser(pub UserId);

/// Verifies HS256 tokens with a shared secret.
#[derive(Clone)]
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// Create a verifier for `secret`.
    #[must_use]
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp"]);
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Verify `token` and return its claims.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidToken`] for a bad signature, expired or
    /// malformed token, and [`AuthError::EmptySubject`] when `user_id` is
    /// empty.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let claims = decode::<Claims>(token, &self.key, &self.validation)?.claims;
        if claims.user_id.is_empty() {
            return Err(AuthError::EmptySubject);
        }
        Ok(claims)
    }

    /// Find and verify the token on a request.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::MissingToken`] when the request carries none,
    /// otherwise as [`JwtVerifier::verify`].
    pub fn authenticate(
        &self,
        headers: &HeaderMap,
        uri: &Uri,
        cookie_name: &str,
    ) -> Result<Claims, AuthError> {
        let token = token_from_request(headers, uri, cookie_name).ok_or(AuthError::MissingToken)?;
        self.verify(token)
    }
}

/// Locate a token: `Authorization: Bearer` first, then the named cookie,
/// then the `token` query parameter.
#[must_use]
pub fn token_from_request<'a>(
    headers: &'a HeaderMap,
    uri: &'a Uri,
    cookie_name: &str,
) -> Option<&'a str> {
    bearer_token(headers)
        .or_else(|| cookie_token(headers, cookie_name))
        .or_else(|| query_token(uri))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn cookie_token<'a>(headers: &'a HeaderMap, cookie_name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == cookie_name)
        .map(|(_, value)| value.trim())
        .filter(|t| !t.is_empty())
}

fn query_token(uri: &Uri) -> Option<&str> {
    uri.query()?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(name, _)| *name == TOKEN_QUERY_PARAM)
        .map(|(_, value)| value)
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &[u8] = b"test-secret";

    fn token(user_id: &str, exp_offset: i64, secret: &[u8]) -> String {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        let claims = Claims {
            user_id: user_id.to_string(),
            email: Some(format!("{}@example.com", user_id)),
            role: None,
            exp: now + exp_offset,
            iat: Some(now),
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret)).unwrap()
    }

    #[test]
    fn test_verify_valid_token() {
        let verifier = JwtVerifier::new(SECRET);
        let claims = verifier.verify(&token("u1", 900, SECRET)).unwrap();
        assert_eq!(claims.user_id, "u1");
        assert_eq!(claims.email.as_deref(), Some("u1@example.com"));
    }

    #[test]
    fn test_verify_rejects_wrong_secret() {
        let verifier = JwtVerifier::new(SECRET);
        let result = verifier.verify(&token("u1", 900, b"other"));
        assert!(matches!(result, Err(AuthError::InvalidToken(_))));
    }

    #[test]
    fn test_verify_rejects_expired() {
        let verifier = JwtVerifier::new(SECRET);
        let result = verifier.verify(&token("u1", -3600, SECRET));
        assert!(matches!(result, Err(AuthError::InvalidToken(_))));
    }

    #[test]
    fn test_verify_rejects_empty_user() {
        let verifier = JwtVerifier::new(SECRET);
        let result = verifier.verify(&token("", 900, SECRET));
        assert!(matches!(result, Err(AuthError::EmptySubject)));
    }

    #[test]
    fn test_verify_rejects_garbage() {
        let verifier = JwtVerifier::new(SECRET);
        assert!(verifier.verify("not.a.jwt").is_err());
    }

    #[test]
    fn test_token_lookup_order() {
        let uri: Uri = "/ws?room=1&token=from-query".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(token_from_request(&headers, &uri, "access"), Some("from-query"));

        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; access=from-cookie"),
        );
        assert_eq!(token_from_request(&headers, &uri, "access"), Some("from-cookie"));

        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer from-header"),
        );
        assert_eq!(token_from_request(&headers, &uri, "access"), Some("from-header"));
    }

    #[test]
    fn test_token_missing() {
        let uri: Uri = "/ws".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        headers.insert(header::COOKIE, HeaderValue::from_static("session=xyz"));
        assert_eq!(token_from_request(&headers, &uri, "access"), None);

        let verifier = JwtVerifier::new(SECRET);
        let result = verifier.authenticate(&headers, &uri, "access");
        assert!(matches!(result, Err(AuthError::MissingToken)));
    }

    #[test]
    fn test_authenticate_from_cookie() {
        let uri: Uri = "/rooms/r1".parse().unwrap();
        let mut headers = HeaderMap::new();
        let cookie = format!("access={}", token("u7", 900, SECRET));
        headers.insert(header::COOKIE, HeaderValue::from_str(&cookie).unwrap());

        let verifier = JwtVerifier::new(SECRET);
        let claims = verifier.authenticate(&headers, &uri, "access").unwrap();
        assert_eq!(claims.user_id, "u7");
    }
}
