/*!
 * # Authentication and Authorization
 *
 * Bearer JWT (HS256) authentication for the checkout API. A token's `sub` is
 * the user id and its `role` is `user` or `admin`; handlers receive the caller
 * as an [`AuthUser`] extractor, or [`AdminUser`] for back-office routes.
 */

use async_trait::async_trait;
use axum::{
    extract::{FromRef, FromRequestParts},
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{Duration as ChronoDuration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::entities::user_account::{self, UserRole};

/// Claim structure for JWT tokens
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,  // Subject (user ID)
    pub role: String, // "user" or "admin"
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
}

/// Authenticated caller resolved from the bearer token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub role: UserRole,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role == UserRole::Admin
    }

    /// Owner-or-admin access check for user-scoped resources.
    pub fn can_access(&self, owner: Uuid) -> bool {
        self.user_id == owner || self.is_admin()
    }
}

/// An [`AuthUser`] whose token carries the admin role.
#[derive(Debug, Clone)]
pub struct AdminUser(pub AuthUser);

/// Authentication configuration
#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub access_token_expiration: Duration,
}

impl AuthConfig {
    pub fn new(jwt_secret: String, access_token_expiration: Duration) -> Self {
        Self {
            jwt_secret,
            jwt_issuer: "supermarket-checkout".to_string(),
            access_token_expiration,
        }
    }
}

/// Issues and validates tokens, and verifies login credentials.
#[derive(Debug, Clone)]
pub struct AuthService {
    pub config: AuthConfig,
    pub db: Arc<DatabaseConnection>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TokenPair {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct LoginCredentials {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 1))]
    pub password: String,
}

impl AuthService {
    pub fn new(config: AuthConfig, db: Arc<DatabaseConnection>) -> Self {
        Self { config, db }
    }

    /// Generate an access token for a user
    pub fn generate_token(&self, user: &user_account::Model) -> Result<TokenPair, AuthError> {
        let now = Utc::now();
        let expires = now
            + ChronoDuration::from_std(self.config.access_token_expiration)
                .map_err(|_| AuthError::InternalError("Invalid token duration".to_string()))?;

        let claims = Claims {
            sub: user.id.to_string(),
            role: user.role.to_string(),
            iss: self.config.jwt_issuer.clone(),
            iat: now.timestamp(),
            exp: expires.timestamp(),
        };

        let access_token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.config.jwt_secret.as_bytes()),
        )
        .map_err(|e| AuthError::TokenCreation(e.to_string()))?;

        Ok(TokenPair {
            access_token,
            token_type: "Bearer".to_string(),
            expires_in: self.config.access_token_expiration.as_secs() as i64,
        })
    }

    /// Validate a JWT token and extract the claims
    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[self.config.jwt_issuer.as_str()]);

        decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.config.jwt_secret.as_bytes()),
            &validation,
        )
        .map(|data| data.claims)
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
            _ => AuthError::InvalidToken,
        })
    }

    /// Resolves the caller from a token.
    pub fn authenticate(&self, token: &str) -> Result<AuthUser, AuthError> {
        let claims = self.validate_token(token)?;
        let user_id = Uuid::parse_str(&claims.sub).map_err(|_| AuthError::InvalidToken)?;
        let role = claims
            .role
            .parse::<UserRole>()
            .map_err(|_| AuthError::InvalidToken)?;
        Ok(AuthUser { user_id, role })
    }

    /// Exchanges email and password for a token. Disabled accounts are refused.
    #[instrument(skip(self, credentials), fields(email = %credentials.email))]
    pub async fn login(&self, credentials: &LoginCredentials) -> Result<TokenPair, AuthError> {
        let user = user_account::Entity::find()
            .filter(user_account::Column::Email.eq(credentials.email.trim().to_lowercase()))
            .one(&*self.db)
            .await
            .map_err(|e| AuthError::DatabaseError(e.to_string()))?
            .ok_or(AuthError::InvalidCredentials)?;

        if !verify_password(&credentials.password, &user.password_hash) {
            debug!("password mismatch");
            return Err(AuthError::InvalidCredentials);
        }
        if user.is_disabled {
            warn!(user_id = %user.id, "login refused for disabled account");
            return Err(AuthError::AccountDisabled);
        }

        self.generate_token(&user)
    }
}

pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    use argon2::password_hash::rand_core::OsRng;
    use argon2::password_hash::SaltString;
    use argon2::{Argon2, PasswordHasher};
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default().hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    use argon2::{Argon2, PasswordHash, PasswordVerifier};
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Authentication error types
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Authentication required")]
    MissingAuth,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token has expired")]
    TokenExpired,

    #[error("Token creation failed: {0}")]
    TokenCreation(String),

    #[error("Account is disabled")]
    AccountDisabled,

    #[error("Insufficient permissions")]
    InsufficientPermissions,

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, error_code, error_message): (StatusCode, &str, String) = match &self {
            Self::MissingAuth => (
                StatusCode::UNAUTHORIZED,
                "AUTH_MISSING",
                "Authentication required".to_string(),
            ),
            Self::InvalidCredentials => (
                StatusCode::UNAUTHORIZED,
                "AUTH_INVALID_CREDENTIALS",
                "Invalid credentials".to_string(),
            ),
            Self::InvalidToken => (
                StatusCode::UNAUTHORIZED,
                "AUTH_INVALID_TOKEN",
                "Invalid authentication token".to_string(),
            ),
            Self::TokenExpired => (
                StatusCode::UNAUTHORIZED,
                "AUTH_TOKEN_EXPIRED",
                "Token has expired".to_string(),
            ),
            Self::AccountDisabled => (
                StatusCode::FORBIDDEN,
                "AUTH_ACCOUNT_DISABLED",
                "Your account has been disabled. Please contact support.".to_string(),
            ),
            Self::InsufficientPermissions => (
                StatusCode::FORBIDDEN,
                "AUTH_INSUFFICIENT_PERMISSIONS",
                "Insufficient permissions".to_string(),
            ),
            Self::TokenCreation(_) | Self::DatabaseError(_) | Self::InternalError(_) => {
                tracing::error!(error = %self, "authentication failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "AUTH_INTERNAL_ERROR",
                    "Internal server error".to_string(),
                )
            }
        };

        let body = Json(serde_json::json!({
            "error": {
                "code": error_code,
                "message": error_message,
            }
        }));

        (status, body).into_response()
    }
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    Arc<AuthService>: FromRef<S>,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let auth_service = Arc::<AuthService>::from_ref(state);
        let token = bearer_token(parts).ok_or(AuthError::MissingAuth)?;
        let user = auth_service.authenticate(token)?;
        tracing::Span::current().record("user_id", tracing::field::display(user.user_id));
        Ok(user)
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AdminUser
where
    S: Send + Sync,
    Arc<AuthService>: FromRef<S>,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let user = AuthUser::from_request_parts(parts, state).await?;
        if !user.is_admin() {
            return Err(AuthError::InsufficientPermissions);
        }
        Ok(AdminUser(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> AuthService {
        let db = DatabaseConnection::default();
        AuthService::new(
            AuthConfig::new(
                "an_adequately_long_secret_for_test_tokens".into(),
                Duration::from_secs(3600),
            ),
            Arc::new(db),
        )
    }

    fn account(role: UserRole) -> user_account::Model {
        let now = Utc::now();
        user_account::Model {
            id: Uuid::new_v4(),
            username: "shopper".into(),
            email: "shopper@example.com".into(),
            password_hash: String::new(),
            role,
            plan: user_account::MembershipPlan::Basic,
            wallet_cents: 0,
            loyalty_points: 0,
            refund_flag_until: None,
            fraud_warning_sent_at: None,
            fraud_warning_reason: None,
            is_disabled: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn token_round_trips_identity_and_role() {
        let svc = service();
        let admin = account(UserRole::Admin);
        let pair = svc.generate_token(&admin).unwrap();
        let user = svc.authenticate(&pair.access_token).unwrap();
        assert_eq!(user.user_id, admin.id);
        assert!(user.is_admin());
    }

    #[test]
    fn tampered_token_is_rejected() {
        let svc = service();
        let pair = svc.generate_token(&account(UserRole::User)).unwrap();
        let mut token = pair.access_token;
        token.push('x');
        assert!(matches!(svc.authenticate(&token), Err(AuthError::InvalidToken)));
    }

    #[test]
    fn password_hash_verifies() {
        let hash = hash_password("correct horse").unwrap();
        assert!(verify_password("correct horse", &hash));
        assert!(!verify_password("battery staple", &hash));
        assert!(!verify_password("anything", "not-a-phc-string"));
    }
}
