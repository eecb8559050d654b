pub mod config;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod utils;

use axum::http::{header, HeaderValue, Method};
use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::rate_limit::{ip_rate_limit_middleware, IpRateLimiter};
use service_core::middleware::security_headers::security_headers_middleware;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::IdentityConfig;
use crate::services::rate_limit::CounterStore;
use crate::services::{
    AuditLogger, IdentityStore, JwtService, LoginService, MigrationService, RollbackService,
    SessionService,
};

#[derive(Clone)]
pub struct AppState {
    pub config: IdentityConfig,
    pub store: Arc<dyn IdentityStore>,
    pub audit: AuditLogger,
    pub counters: Arc<dyn CounterStore>,
    pub jwt: JwtService,
    pub sessions: SessionService,
    pub login: LoginService,
    pub migration: MigrationService,
    pub rollback: RollbackService,
    pub ip_rate_limiter: IpRateLimiter,
}

pub fn build_router(state: AppState) -> Result<Router, AppError> {
    let origins: Vec<HeaderValue> = state
        .config
        .security
        .allowed_origins
        .iter()
        .map(|origin| {
            origin
                .parse::<HeaderValue>()
                .map_err(|e| AppError::ConfigError(anyhow::anyhow!("Bad origin '{origin}': {e}")))
        })
        .collect::<Result<_, _>>()?;

    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_credentials(true);

    let admin_routes = Router::new()
        .route("/admin/migrations", post(handlers::admin::run_migration))
        .route(
            "/admin/migrations/advance-cohort",
            post(handlers::admin::advance_cohort),
        )
        .route(
            "/admin/migrations/recent",
            get(handlers::admin::recent_migrations),
        )
        .route("/admin/rollbacks", post(handlers::admin::run_rollback))
        .route(
            "/admin/audit/verify",
            get(handlers::admin::verify_audit_chain),
        )
        .route(
            "/admin/audit/events",
            post(handlers::admin::append_audit_event),
        )
        .layer(from_fn_with_state(
            state.clone(),
            middleware::require_admin,
        ));

    let auth_routes = Router::new()
        .route("/auth/login", post(handlers::auth::login))
        .route("/auth/logout", post(handlers::auth::logout))
        .route("/auth/validate", post(handlers::auth::validate))
        .route("/auth/activate", post(handlers::auth::activate))
        .route(
            "/auth/password-reset/request",
            post(handlers::auth::password_reset_request),
        )
        .route(
            "/auth/password-reset/confirm",
            post(handlers::auth::password_reset_confirm),
        );

    let router = Router::new()
        .route("/health", get(handlers::health))
        .merge(auth_routes)
        .merge(admin_routes)
        .layer(from_fn_with_state(
            state.ip_rate_limiter.clone(),
            ip_rate_limit_middleware,
        ))
        .layer(from_fn(security_headers_middleware))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    Ok(router)
}
