use axum::{extract::State, Json};
use validator::Validate;

use crate::{
    auth::{AuthError, LoginCredentials, TokenPair},
    handlers::common::ok,
    ApiResponse, AppState,
};

#[utoipa::path(
    post,
    path = "/api/v1/auth/login",
    summary = "Log in",
    description = "Exchange email and password for a bearer token",
    request_body = LoginCredentials,
    responses(
        (status = 200, description = "Token issued", body = ApiResponse<TokenPair>),
        (status = 401, description = "Invalid credentials", body = crate::errors::ErrorResponse),
        (status = 403, description = "Account disabled", body = crate::errors::ErrorResponse),
    ),
    tag = "Auth"
)]
pub async fn login(
    State(state): State<AppState>,
    Json(credentials): Json<LoginCredentials>,
) -> Result<Json<ApiResponse<TokenPair>>, AuthError> {
    credentials
        .validate()
        .map_err(|_| AuthError::InvalidCredentials)?;
    let tokens = state.auth.login(&credentials).await?;
    Ok(ok(tokens))
}
