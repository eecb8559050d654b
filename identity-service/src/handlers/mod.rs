pub mod admin;
pub mod auth;

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::{header, request::Parts};
use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;

use crate::models::ClientContext;
use crate::AppState;

/// Extracts the caller's network context for audit and session records.
/// Prefers `x-forwarded-for` (first hop), falls back to the peer address.
pub struct ClientInfo(pub ClientContext);

#[axum::async_trait]
impl<S> FromRequestParts<S> for ClientInfo
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|s| s.trim().to_string());

        let ip_address = forwarded
            .or_else(|| {
                parts
                    .extensions
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| addr.ip().to_string())
            })
            .unwrap_or_else(|| "unknown".to_string());

        let user_agent = parts
            .headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        Ok(ClientInfo(ClientContext {
            ip_address,
            user_agent,
        }))
    }
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let counters = match state.counters.health_check().await {
        Ok(()) => "up",
        Err(_) => "down",
    };

    Json(json!({
        "status": "ok",
        "service": state.config.service_name,
        "version": state.config.service_version,
        "counters": counters,
    }))
}
