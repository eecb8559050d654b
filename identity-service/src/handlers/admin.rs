//! Administrative surface: migration, rollback, and audit-chain operations.
//!
//! Every route here sits behind `require_admin`; the acting administrator is
//! attributed in the audit chain.

use axum::{
    extract::{Query, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::handlers::ClientInfo;
use crate::middleware::Admin;
use crate::models::audit_event::ChainVerification;
use crate::models::{AuditAction, AuditDraft, AuditEvent, CredentialMode};
use crate::services::migration::AdvanceOutcome;
use crate::services::rollback::{RecentMigration, RollbackReport};
use crate::services::{MapOptions, MigrationReport};
use crate::utils::validation::ValidatedJson;
use crate::AppState;
use service_core::error::AppError;

// ============================================================================
// Request/Response DTOs
// ============================================================================

#[derive(Debug, Deserialize, Validate)]
pub struct MigrationRequest {
    pub scope: MigrationScope,
    /// Required for `single`, used for `batch`.
    #[serde(default)]
    pub provider_user_ids: Vec<String>,
    #[serde(default = "default_auth_mode")]
    pub set_auth_mode: String,
    #[serde(default)]
    pub force_password_change: bool,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationScope {
    Single,
    Batch,
    All,
}

fn default_auth_mode() -> String {
    "local".to_string()
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    #[serde(default = "default_hours_back")]
    pub hours_back: i64,
}

fn default_hours_back() -> i64 {
    24
}

#[derive(Debug, Serialize)]
pub struct RecentResponse {
    pub migrations: Vec<RecentMigration>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RollbackRequest {
    pub scope: RollbackScope,
    pub account_id: Option<Uuid>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    #[validate(length(min = 1))]
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollbackScope {
    Single,
    Window,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum RollbackResponse {
    Single { account: crate::models::AccountResponse },
    Window { report: RollbackReport },
}

#[derive(Debug, Deserialize, Validate)]
pub struct AppendEventRequest {
    #[validate(length(min = 1))]
    pub action: String,
    #[validate(length(min = 1))]
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /admin/migrations
pub async fn run_migration(
    State(state): State<AppState>,
    Admin(actor): Admin,
    ClientInfo(ctx): ClientInfo,
    ValidatedJson(req): ValidatedJson<MigrationRequest>,
) -> Result<Json<MigrationReport>, AppError> {
    let mode = CredentialMode::parse(&req.set_auth_mode).ok_or_else(|| {
        AppError::BadRequest(anyhow::anyhow!(
            "Unknown auth mode '{}'",
            req.set_auth_mode
        ))
    })?;

    let options = MapOptions {
        set_auth_mode: mode,
        force_password_change: req.force_password_change,
        actor: actor.audit_actor(),
        actor_ip: ctx.ip_address.clone(),
        notes: req.notes.clone(),
    };

    let report = match req.scope {
        MigrationScope::All => state.migration.migrate_all(&options).await?,
        MigrationScope::Single | MigrationScope::Batch => {
            if req.scope == MigrationScope::Single && req.provider_user_ids.len() != 1 {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "scope 'single' requires exactly one provider_user_id"
                )));
            }
            if req.provider_user_ids.is_empty() {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "provider_user_ids must not be empty"
                )));
            }

            let mut users = Vec::with_capacity(req.provider_user_ids.len());
            for id in &req.provider_user_ids {
                let user = state
                    .migration
                    .export_account(id)
                    .await?
                    .ok_or_else(|| {
                        AppError::NotFound(anyhow::anyhow!("Provider user '{}' not found", id))
                    })?;
                users.push(user);
            }
            state.migration.batch_map(&users, &options).await?
        }
    };

    Ok(Json(report))
}

/// POST /admin/migrations/advance-cohort
pub async fn advance_cohort(
    State(state): State<AppState>,
    Admin(actor): Admin,
    ClientInfo(ctx): ClientInfo,
) -> Result<Json<AdvanceOutcome>, AppError> {
    let options = MapOptions {
        set_auth_mode: CredentialMode::Local,
        force_password_change: true,
        actor: actor.audit_actor(),
        actor_ip: ctx.ip_address.clone(),
        notes: None,
    };

    let outcome = state.migration.advance_cohort(&options).await?;
    Ok(Json(outcome))
}

/// GET /admin/migrations/recent
pub async fn recent_migrations(
    State(state): State<AppState>,
    Admin(_actor): Admin,
    Query(query): Query<RecentQuery>,
) -> Result<Json<RecentResponse>, AppError> {
    let migrations = state
        .rollback
        .list_recently_migrated(query.hours_back)
        .await?;
    Ok(Json(RecentResponse { migrations }))
}

/// POST /admin/rollbacks
pub async fn run_rollback(
    State(state): State<AppState>,
    Admin(actor): Admin,
    ClientInfo(ctx): ClientInfo,
    ValidatedJson(req): ValidatedJson<RollbackRequest>,
) -> Result<Json<RollbackResponse>, AppError> {
    let audit_actor = actor.audit_actor();

    match req.scope {
        RollbackScope::Single => {
            let account_id = req.account_id.ok_or_else(|| {
                AppError::BadRequest(anyhow::anyhow!("scope 'single' requires account_id"))
            })?;
            let account = state
                .rollback
                .rollback_one(account_id, &audit_actor, &ctx.ip_address, &req.reason)
                .await?;
            Ok(Json(RollbackResponse::Single { account }))
        }
        RollbackScope::Window => {
            let (start, end) = match (req.start, req.end) {
                (Some(start), Some(end)) => (start, end),
                _ => {
                    return Err(AppError::BadRequest(anyhow::anyhow!(
                        "scope 'window' requires start and end"
                    )))
                }
            };
            let report = state
                .rollback
                .rollback_window(start, end, &audit_actor, &ctx.ip_address, &req.reason)
                .await?;
            Ok(Json(RollbackResponse::Window { report }))
        }
    }
}

/// GET /admin/audit/verify
pub async fn verify_audit_chain(
    State(state): State<AppState>,
    Admin(actor): Admin,
    ClientInfo(ctx): ClientInfo,
) -> Result<Json<ChainVerification>, AppError> {
    let verification = state.audit.verify_chain().await?;

    // The verification run is itself an audited action, appended after the
    // walk so it does not perturb the result it reports.
    state
        .audit
        .record(
            AuditDraft::new(
                actor.audit_actor(),
                &ctx.ip_address,
                AuditAction::AuditChainVerified,
                "audit_chain",
                None,
            )
            .with_metadata(serde_json::json!({
                "valid": verification.valid,
                "total_entries": verification.total_entries,
                "broken_at_id": verification.broken_at_id,
            })),
        )
        .await;

    Ok(Json(verification))
}

/// POST /admin/audit/events
///
/// Manual administrative annotation in the chain (e.g. recording an
/// out-of-band intervention).
pub async fn append_audit_event(
    State(state): State<AppState>,
    Admin(actor): Admin,
    ClientInfo(ctx): ClientInfo,
    ValidatedJson(req): ValidatedJson<AppendEventRequest>,
) -> Result<Json<AuditEvent>, AppError> {
    let action = AuditAction::parse(&req.action).ok_or_else(|| {
        AppError::BadRequest(anyhow::anyhow!("Unknown audit action '{}'", req.action))
    })?;

    let mut draft = AuditDraft::new(
        actor.audit_actor(),
        &ctx.ip_address,
        action,
        req.resource_type,
        req.resource_id,
    );
    if let Some(metadata) = req.metadata {
        draft = draft.with_metadata(metadata);
    }

    let event = state.audit.append(draft).await?;
    Ok(Json(event))
}
