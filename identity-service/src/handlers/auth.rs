//! Authentication handlers: login, logout, validate, activation, and
//! password reset.

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    Json,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::config::Environment;
use crate::handlers::ClientInfo;
use crate::models::AccountResponse;
use crate::services::SessionVerdict;
use crate::utils::validation::ValidatedJson;
use crate::AppState;
use service_core::error::AppError;

// ============================================================================
// Request/Response DTOs
// ============================================================================

#[derive(Debug, Deserialize, Validate)]
pub struct LoginRequest {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 1))]
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub account: AccountResponse,
    pub session_id: Uuid,
    pub token: String,
    pub expires_utc: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ValidateRequest {
    pub token: Option<String>,
}

/// Always 200: validation is safe for unauthenticated callers, the verdict
/// is in the body.
#[derive(Debug, Serialize)]
pub struct ValidateResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_utc: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ActivateRequest {
    #[validate(length(min = 1))]
    pub token: String,
    #[validate(length(min = 12))]
    pub new_password: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct PasswordResetRequest {
    #[validate(email)]
    pub email: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct PasswordResetConfirm {
    #[validate(length(min = 1))]
    pub token: String,
    #[validate(length(min = 12))]
    pub new_password: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

// ============================================================================
// Handlers
// ============================================================================

fn session_cookie(state: &AppState, token: String) -> Cookie<'static> {
    Cookie::build((state.config.security.session_cookie.clone(), token))
        .http_only(true)
        .secure(state.config.environment == Environment::Prod)
        .same_site(SameSite::Strict)
        .path("/")
        .build()
}

fn bearer_or_cookie(state: &AppState, headers: &HeaderMap, jar: &CookieJar) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.to_string())
        .or_else(|| {
            jar.get(&state.config.security.session_cookie)
                .map(|c| c.value().to_string())
        })
}

/// POST /auth/login
pub async fn login(
    State(state): State<AppState>,
    ClientInfo(ctx): ClientInfo,
    jar: CookieJar,
    ValidatedJson(req): ValidatedJson<LoginRequest>,
) -> Result<(CookieJar, Json<LoginResponse>), AppError> {
    let success = state.login.login(&req.email, &req.password, &ctx).await?;

    let jar = jar.add(session_cookie(&state, success.token.clone()));

    Ok((
        jar,
        Json(LoginResponse {
            account: success.account,
            session_id: success.session_id,
            token: success.token,
            expires_utc: success.expires_utc,
        }),
    ))
}

/// POST /auth/logout
pub async fn logout(
    State(state): State<AppState>,
    ClientInfo(ctx): ClientInfo,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<(CookieJar, Json<MessageResponse>), AppError> {
    if let Some(token) = bearer_or_cookie(&state, &headers, &jar) {
        state.login.logout(&token, &ctx).await?;
    }

    let jar = jar.remove(Cookie::from(state.config.security.session_cookie.clone()));
    Ok((
        jar,
        Json(MessageResponse {
            message: "Logged out".to_string(),
        }),
    ))
}

/// POST /auth/validate
pub async fn validate(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(req): Json<ValidateRequest>,
) -> Result<Json<ValidateResponse>, AppError> {
    let token = req
        .token
        .or_else(|| bearer_or_cookie(&state, &headers, &jar));

    let Some(token) = token else {
        return Ok(Json(ValidateResponse {
            valid: false,
            reason: Some("missing_token".to_string()),
            account_id: None,
            role: None,
            expires_utc: None,
        }));
    };

    let response = match state.sessions.validate(&token).await? {
        SessionVerdict::Valid(v) => ValidateResponse {
            valid: true,
            reason: None,
            account_id: Some(v.account_id),
            role: Some(v.role),
            expires_utc: Some(v.expires_utc),
        },
        SessionVerdict::Rejected(rejection) => ValidateResponse {
            valid: false,
            reason: Some(rejection.reason().to_string()),
            account_id: None,
            role: None,
            expires_utc: None,
        },
    };

    Ok(Json(response))
}

/// POST /auth/activate
pub async fn activate(
    State(state): State<AppState>,
    ClientInfo(ctx): ClientInfo,
    ValidatedJson(req): ValidatedJson<ActivateRequest>,
) -> Result<Json<AccountResponse>, AppError> {
    let account = state
        .login
        .activate_account(&req.token, &req.new_password, &ctx)
        .await?;
    Ok(Json(account))
}

/// POST /auth/password-reset/request
///
/// Always 202: whether the email exists is not observable.
pub async fn password_reset_request(
    State(state): State<AppState>,
    ClientInfo(ctx): ClientInfo,
    ValidatedJson(req): ValidatedJson<PasswordResetRequest>,
) -> Result<(StatusCode, Json<MessageResponse>), AppError> {
    state.login.request_password_reset(&req.email, &ctx).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(MessageResponse {
            message: "If the email is registered, a reset link has been sent".to_string(),
        }),
    ))
}

/// POST /auth/password-reset/confirm
pub async fn password_reset_confirm(
    State(state): State<AppState>,
    ClientInfo(ctx): ClientInfo,
    ValidatedJson(req): ValidatedJson<PasswordResetConfirm>,
) -> Result<Json<MessageResponse>, AppError> {
    state
        .login
        .confirm_password_reset(&req.token, &req.new_password, &ctx)
        .await?;
    Ok(Json(MessageResponse {
        message: "Password updated".to_string(),
    }))
}
