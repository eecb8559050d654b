use identity_service::{
    build_router,
    config::IdentityConfig,
    services::{
        AuditLogger, Database, HttpIdentityProvider, HttpNotifier, JwtService, LoginService,
        MigrationService, RedisCounters, RollbackService, SessionService, WindowLimiter,
    },
    AppState,
};
use service_core::middleware::rate_limit::create_ip_rate_limiter;
use service_core::observability::logging::init_tracing;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), service_core::error::AppError> {
    // Load configuration - fail fast if invalid
    let config = IdentityConfig::from_env()?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        std::env::var("OTLP_ENDPOINT").ok().as_deref(),
    );

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        environment = ?config.environment,
        "Starting identity service"
    );

    // Durable store
    let database = Database::new(&config.database)
        .await
        .map_err(service_core::error::AppError::from)?;
    database.run_migrations().await?;
    let store: Arc<dyn identity_service::services::IdentityStore> = Arc::new(database.clone());
    let audit_store: Arc<dyn identity_service::services::AuditStore> = Arc::new(database.clone());
    let audit = AuditLogger::new(audit_store);

    // Shared counters for the per-identifier rate limiters
    let counters = Arc::new(
        RedisCounters::new(&config.redis)
            .await
            .map_err(service_core::error::AppError::InternalError)?,
    );
    let login_limiter = WindowLimiter::new(
        counters.clone(),
        "rl:login:",
        config.rate_limit.login_attempts,
        config.rate_limit.login_window_seconds,
    );
    let reset_limiter = WindowLimiter::new(
        counters.clone(),
        "rl:pwreset:",
        config.rate_limit.password_reset_attempts,
        config.rate_limit.password_reset_window_seconds,
    );
    let ip_rate_limiter = create_ip_rate_limiter(
        config.rate_limit.global_ip_limit,
        config.rate_limit.global_ip_window_seconds,
    );

    // Crypto and session plumbing
    let jwt = JwtService::new(&config.jwt)
        .map_err(service_core::error::AppError::InternalError)?;
    let sessions = SessionService::new(jwt.clone(), store.clone(), config.jwt.audience.clone());

    // Outbound clients
    let notifier = Arc::new(
        HttpNotifier::new(
            &config.notifications.base_url,
            config.notifications.request_timeout_seconds,
        )
        .map_err(service_core::error::AppError::InternalError)?,
    );
    let provider = Arc::new(
        HttpIdentityProvider::new(&config.provider)
            .map_err(service_core::error::AppError::InternalError)?,
    );

    // Orchestration services
    let login = LoginService::new(
        store.clone(),
        audit.clone(),
        sessions.clone(),
        login_limiter,
        reset_limiter,
        config.lockout.clone(),
        notifier.clone(),
    );
    let migration = MigrationService::new(
        store.clone(),
        audit.clone(),
        provider,
        notifier,
        config.migration.batch_size,
    );
    let rollback = RollbackService::new(store.clone(), audit.clone(), sessions.clone());

    let state = AppState {
        config: config.clone(),
        store,
        audit,
        counters,
        jwt,
        sessions,
        login,
        migration,
        rollback,
        ip_rate_limiter,
    };

    let app = build_router(state)?;
    let addr: SocketAddr = format!("{}:{}", config.common.host, config.common.port)
        .parse()
        .map_err(|e: std::net::AddrParseError| {
            service_core::error::AppError::ConfigError(anyhow::anyhow!("Invalid bind address: {e}"))
        })?;

    tracing::info!(address = %addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Service shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
