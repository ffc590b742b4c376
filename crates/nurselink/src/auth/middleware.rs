//! Token verification and authentication middleware.

use axum::{
    extract::{FromRequestParts, State},
    http::{header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use log::{debug, warn};
use std::sync::Arc;

use super::{AuthConfig, AuthError, Claims, Role};

/// Verifies an opaque bearer credential and returns its claims.
///
/// Implementations must fail closed: any token that cannot be fully
/// validated yields an error.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Claims, AuthError>;
}

/// Shared handle to the verifier used by the middleware and the gateway.
pub type SharedVerifier = Arc<dyn TokenVerifier>;

/// Extract a Bearer token from an Authorization header value.
fn bearer_token_from_header(header_value: &str) -> Result<&str, AuthError> {
    let mut parts = header_value.split_whitespace();
    let scheme = parts.next().ok_or(AuthError::InvalidAuthHeader)?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::InvalidAuthHeader);
    }

    let token = parts.next().ok_or(AuthError::InvalidAuthHeader)?;
    if parts.next().is_some() {
        return Err(AuthError::InvalidAuthHeader);
    }

    Ok(token)
}

fn token_from_cookie_header<'a>(cookie_header: &'a str, cookie_name: &str) -> Option<&'a str> {
    cookie_header.split(';').map(str::trim).find_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        if name.trim() == cookie_name {
            Some(value.trim())
        } else {
            None
        }
    })
}

fn token_from_query(query: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        if key == "token" {
            urlencoding::decode(value).ok().map(|s| s.into_owned())
        } else {
            None
        }
    })
}

/// HS256 verifier built from [`AuthConfig`].
#[derive(Clone)]
pub struct AuthState {
    config: Arc<AuthConfig>,
    secret: Option<String>,
    decoding_key: Option<DecodingKey>,
}

impl AuthState {
    /// Create new auth state from config.
    /// Resolves `env:VAR_NAME` syntax in jwt_secret at construction time.
    pub fn new(config: AuthConfig) -> Self {
        let secret = config.resolve_jwt_secret().ok().flatten();
        let decoding_key = secret
            .as_ref()
            .map(|s| DecodingKey::from_secret(s.as_bytes()));

        Self {
            config: Arc::new(config),
            secret,
            decoding_key,
        }
    }

    /// Check if dev mode is enabled.
    pub fn is_dev_mode(&self) -> bool {
        self.config.dev_mode
    }

    /// Get allowed CORS origins from config.
    pub fn allowed_origins(&self) -> &[String] {
        &self.config.allowed_origins
    }

    /// Validate a JWT (or, in dev mode, a `dev:<user_id>` token).
    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        if token.is_empty() {
            return Err(AuthError::InvalidAuthHeader);
        }

        if self.config.dev_mode
            && let Some(user_id) = token.strip_prefix("dev:")
        {
            return self.dev_user_claims(user_id);
        }

        let decoding_key = self
            .decoding_key
            .as_ref()
            .ok_or_else(|| AuthError::InvalidToken("no JWT secret configured".to_string()))?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_nbf = false;
        validation.set_required_spec_claims(&["exp", "sub"]);

        let token_data = decode::<Claims>(token, decoding_key, &validation).map_err(|e| {
            warn!("JWT validation failed: {:?}", e);
            match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken(e.to_string()),
            }
        })?;

        Ok(token_data.claims)
    }

    fn dev_user_claims(&self, user_id: &str) -> Result<Claims, AuthError> {
        let user = self
            .config
            .dev_user(user_id)
            .ok_or(AuthError::UserNotFound)?;

        let now = Utc::now().timestamp();
        Ok(Claims {
            sub: user.id.clone(),
            exp: now + self.config.token_ttl_secs,
            iat: Some(now),
            name: Some(user.name.clone()),
            roles: vec![],
            role: Some(user.role.to_string()),
        })
    }

    /// Mint an HS256 token for a participant.
    pub fn generate_token(&self, user_id: &str, name: &str, role: Role) -> Result<String, AuthError> {
        let secret = self
            .secret
            .as_ref()
            .ok_or_else(|| AuthError::Internal("no JWT secret configured".to_string()))?;

        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: user_id.to_string(),
            exp: now + self.config.token_ttl_secs,
            iat: Some(now),
            name: Some(name.to_string()),
            roles: vec![],
            role: Some(role.to_string()),
        };

        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .map_err(|e| AuthError::Internal(e.to_string()))
    }
}

impl TokenVerifier for AuthState {
    fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        self.validate_token(token)
    }
}

/// Authenticated user extracted from request.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    /// User claims.
    pub claims: Claims,
}

impl CurrentUser {
    /// Get the user ID.
    pub fn id(&self) -> &str {
        &self.claims.sub
    }

    /// Check if user is admin.
    pub fn is_admin(&self) -> bool {
        self.claims.is_admin()
    }
}

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentUser>()
            .cloned()
            .ok_or(AuthError::MissingAuthHeader)
    }
}

/// Authentication middleware.
///
/// Verifies the bearer credential and injects `CurrentUser` into request
/// extensions. Credential sources in priority order:
/// 1. Authorization: Bearer <token> header
/// 2. auth_token cookie
/// 3. token query parameter (browsers can't set headers on WebSocket upgrades)
pub async fn auth_middleware(
    State(verifier): State<SharedVerifier>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, AuthError> {
    let auth_header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    let cookie_token = req
        .headers()
        .get(axum::http::header::COOKIE)
        .and_then(|h| h.to_str().ok())
        .and_then(|cookie_header| token_from_cookie_header(cookie_header, "auth_token"));

    let query_token = req.uri().query().and_then(token_from_query);

    let claims = if let Some(header) = auth_header {
        verifier.verify(bearer_token_from_header(header)?)?
    } else if let Some(token) = cookie_token {
        verifier.verify(token)?
    } else if let Some(ref token) = query_token {
        debug!("Using query token for {}", req.uri().path());
        verifier.verify(token)?
    } else {
        return Err(AuthError::MissingAuthHeader);
    };

    req.extensions_mut().insert(CurrentUser { claims });

    Ok(next.run(req).await)
}

#[cfg(test)]
#[allow(clippy::field_reassign_with_default)]
mod tests {
    use super::*;
    use crate::auth::DevUser;

    const SECRET: &str = "test-secret-for-unit-tests-minimum-32-chars-long";

    fn state(dev_mode: bool) -> AuthState {
        let mut config = AuthConfig::default();
        config.dev_mode = dev_mode;
        config.jwt_secret = Some(SECRET.to_string());
        config.dev_users = vec![DevUser {
            id: "nurse-1".to_string(),
            name: "Nina Nurse".to_string(),
            role: Role::Nurse,
        }];
        AuthState::new(config)
    }

    #[test]
    fn test_bearer_token_from_header_valid() {
        assert_eq!(
            bearer_token_from_header("Bearer abc.def.ghi").unwrap(),
            "abc.def.ghi"
        );
        assert_eq!(
            bearer_token_from_header("bearer   token123").unwrap(),
            "token123"
        );
    }

    #[test]
    fn test_bearer_token_from_header_invalid() {
        for case in ["", "Bearer", "Bearer ", "Token something", "Bearer a b"] {
            assert!(
                bearer_token_from_header(case).is_err(),
                "{case} should fail"
            );
        }
    }

    #[test]
    fn test_token_from_query_and_cookie() {
        assert_eq!(
            token_from_query("foo=1&token=abc%2Edef").as_deref(),
            Some("abc.def")
        );
        assert_eq!(token_from_query("foo=1"), None);
        assert_eq!(
            token_from_cookie_header("a=1; auth_token=xyz", "auth_token"),
            Some("xyz")
        );
    }

    #[test]
    fn test_generate_and_validate_token() {
        let state = state(false);
        let token = state
            .generate_token("patient-7", "Pat Patient", Role::Patient)
            .unwrap();

        let claims = state.verify(&token).unwrap();
        assert_eq!(claims.sub, "patient-7");
        assert_eq!(claims.display_name(), Some("Pat Patient"));
        assert_eq!(claims.effective_role(), Some(Role::Patient));
    }

    #[test]
    fn test_rejects_token_signed_with_other_secret() {
        let mut other = AuthConfig::default();
        other.jwt_secret = Some("a-completely-different-secret-of-enough-length".to_string());
        let token = AuthState::new(other)
            .generate_token("p", "P", Role::Patient)
            .unwrap();

        assert!(matches!(
            state(false).verify(&token),
            Err(AuthError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_rejects_expired_token() {
        let claims = Claims {
            sub: "p".to_string(),
            exp: Utc::now().timestamp() - 3600,
            iat: None,
            name: Some("P".to_string()),
            roles: vec![],
            role: Some("patient".to_string()),
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();

        assert!(matches!(state(false).verify(&token), Err(AuthError::TokenExpired)));
    }

    #[test]
    fn test_rejects_garbage_and_missing_secret() {
        assert!(state(false).verify("not-a-jwt").is_err());
        assert!(state(false).verify("").is_err());

        let no_secret = AuthState::new(AuthConfig::default());
        assert!(no_secret.verify("a.b.c").is_err());
        assert!(no_secret.generate_token("p", "P", Role::Patient).is_err());
    }

    #[test]
    fn test_dev_token_validation() {
        let claims = state(true).verify("dev:nurse-1").unwrap();
        assert_eq!(claims.sub, "nurse-1");
        assert_eq!(claims.effective_role(), Some(Role::Nurse));

        assert!(matches!(
            state(true).verify("dev:unknown"),
            Err(AuthError::UserNotFound)
        ));
        // Dev tokens are plain garbage outside dev mode.
        assert!(state(false).verify("dev:nurse-1").is_err());
    }
}
