use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, StatusCode},
    middleware::Next,
    response::IntoResponse,
    Json,
};
use axum_extra::extract::cookie::CookieJar;
use serde::Serialize;
use uuid::Uuid;

use crate::models::{AuditActor, Role};
use crate::services::SessionVerdict;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Authenticated administrator attached to the request by
/// `require_admin`.
#[derive(Debug, Clone)]
pub struct AdminActor {
    pub account_id: Uuid,
    pub email: String,
    pub role: String,
}

impl AdminActor {
    pub fn audit_actor(&self) -> AuditActor {
        AuditActor::account(self.account_id, &self.email, &self.role)
    }
}

fn unauthorized(message: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
}

/// Session token from the Authorization header, falling back to the session
/// cookie browsers carry.
fn extract_token(req: &Request, cookie_name: &str) -> Option<String> {
    if let Some(token) = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
    {
        return Some(token.to_string());
    }

    let jar = CookieJar::from_headers(req.headers());
    jar.get(cookie_name).map(|c| c.value().to_string())
}

/// Middleware gating the administrative surface: a valid session whose
/// account currently holds the admin role.
pub async fn require_admin(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorResponse>)> {
    let token = extract_token(&req, &state.config.security.session_cookie)
        .ok_or_else(|| unauthorized("Missing session token"))?;

    let verdict = state.sessions.validate(&token).await.map_err(|e| {
        tracing::error!(error = %e, "Session validation failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: "Internal server error".to_string(),
            }),
        )
    })?;

    let validated = match verdict {
        SessionVerdict::Valid(v) => v,
        SessionVerdict::Rejected(rejection) => {
            return Err(unauthorized(rejection.reason()));
        }
    };

    // Role is re-read from the account, not trusted from the token: a
    // demotion takes effect on the next request, not at token expiry.
    let account = state
        .store
        .find_account_by_id(validated.account_id)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Account lookup failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "Internal server error".to_string(),
                }),
            )
        })?
        .ok_or_else(|| unauthorized("Account no longer exists"))?;

    if account.role() != Some(Role::Admin) {
        return Err((
            StatusCode::FORBIDDEN,
            Json(ErrorResponse {
                error: "Administrator role required".to_string(),
            }),
        ));
    }

    req.extensions_mut().insert(AdminActor {
        account_id: account.account_id,
        email: account.email.clone(),
        role: account.role_code.clone(),
    });

    Ok(next.run(req).await)
}

/// Extractor for handlers behind `require_admin`.
pub struct Admin(pub AdminActor);

#[axum::async_trait]
impl<S> FromRequestParts<S> for Admin
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<ErrorResponse>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let actor = parts.extensions.get::<AdminActor>().ok_or((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: "Admin actor missing from request extensions".to_string(),
            }),
        ))?;

        Ok(Admin(actor.clone()))
    }
}
