//! Rollback: return migrated accounts to provider-backed authentication.
//!
//! Rollback is local-only. The provider is never re-notified; its copy of the
//! user was never touched by migration, so reverting our side is sufficient.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::{AccountResponse, AuditAction, AuditActor, AuditDraft};
use crate::services::audit::AuditLogger;
use crate::services::session::SessionService;
use crate::services::store::IdentityStore;
use crate::services::ServiceError;

/// Tally for a windowed rollback run. Per-item failures never abort the
/// remainder.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RollbackReport {
    pub rolled_back: u64,
    pub errors: Vec<RollbackError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackError {
    pub account_id: Uuid,
    pub message: String,
}

/// One row of the recently-migrated listing.
#[derive(Debug, Clone, Serialize)]
pub struct RecentMigration {
    pub account: AccountResponse,
    pub migrated_utc: DateTime<Utc>,
    pub migrated_by: Option<String>,
    /// Hours since migration. Informational only; rollback itself enforces
    /// no cutoff.
    pub elapsed_hours: i64,
}

#[derive(Clone)]
pub struct RollbackService {
    store: Arc<dyn IdentityStore>,
    audit: AuditLogger,
    sessions: SessionService,
}

impl RollbackService {
    pub fn new(
        store: Arc<dyn IdentityStore>,
        audit: AuditLogger,
        sessions: SessionService,
    ) -> Self {
        Self {
            store,
            audit,
            sessions,
        }
    }

    /// Revert one account to provider mode.
    ///
    /// Clears provenance and the local password hash (an account back in
    /// provider mode must hold no local credential), restores `active`
    /// status, and revokes every open session. Fails for accounts that were
    /// never migrated.
    pub async fn rollback_one(
        &self,
        account_id: Uuid,
        actor: &AuditActor,
        actor_ip: &str,
        reason: &str,
    ) -> Result<AccountResponse, ServiceError> {
        let account = self
            .store
            .find_account_by_id(account_id)
            .await?
            .ok_or(ServiceError::AccountNotFound)?;

        if !account.is_migrated() {
            return Err(ServiceError::NotMigrated);
        }

        let previous = serde_json::json!({
            "credential_mode": account.credential_mode_code,
            "status": account.status_code,
            "migrated_utc": account.migrated_utc,
            "migrated_by": account.migrated_by,
        });

        let now = Utc::now();
        self.store.clear_migration(account_id, now).await?;
        let revoked = self.sessions.revoke_all_for_account(account_id).await?;

        let restored = self
            .store
            .find_account_by_id(account_id)
            .await?
            .ok_or(ServiceError::AccountNotFound)?;

        self.audit
            .record(
                AuditDraft::new(
                    actor.clone(),
                    actor_ip,
                    AuditAction::MigrationRolledBack,
                    "account",
                    Some(account_id.to_string()),
                )
                .with_states(
                    Some(previous),
                    Some(serde_json::json!({
                        "credential_mode": restored.credential_mode_code,
                        "status": restored.status_code,
                    })),
                )
                .with_metadata(serde_json::json!({
                    "reason": reason,
                    "sessions_revoked": revoked,
                })),
            )
            .await;

        tracing::info!(account_id = %account_id, reason, "Account rolled back to provider mode");
        Ok(restored.sanitized())
    }

    /// Roll back every account migrated within `[start, end)`.
    pub async fn rollback_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        actor: &AuditActor,
        actor_ip: &str,
        reason: &str,
    ) -> Result<RollbackReport, ServiceError> {
        if start >= end {
            return Err(ServiceError::Validation(
                "Rollback window start must precede end".to_string(),
            ));
        }

        let accounts = self.store.find_migrated_between(start, end).await?;
        let mut report = RollbackReport::default();

        for account in accounts {
            match self
                .rollback_one(account.account_id, actor, actor_ip, reason)
                .await
            {
                Ok(_) => report.rolled_back += 1,
                Err(e) => {
                    tracing::error!(account_id = %account.account_id, error = %e,
                        "Rollback failed for account");
                    report.errors.push(RollbackError {
                        account_id: account.account_id,
                        message: e.to_string(),
                    });
                }
            }
        }

        self.audit
            .record(
                AuditDraft::new(
                    actor.clone(),
                    actor_ip,
                    AuditAction::RollbackWindowCompleted,
                    "rollback_window",
                    None,
                )
                .with_metadata(serde_json::json!({
                    "start": start.to_rfc3339(),
                    "end": end.to_rfc3339(),
                    "rolled_back": report.rolled_back,
                    "errors": report.errors.len(),
                    "reason": reason,
                })),
            )
            .await;

        Ok(report)
    }

    /// Accounts migrated in the last `hours_back` hours, newest window
    /// first, annotated with elapsed time.
    pub async fn list_recently_migrated(
        &self,
        hours_back: i64,
    ) -> Result<Vec<RecentMigration>, ServiceError> {
        let now = Utc::now();
        let start = now - Duration::hours(hours_back.max(0));
        let accounts = self.store.find_migrated_between(start, now).await?;

        Ok(accounts
            .into_iter()
            .filter_map(|account| {
                let migrated_utc = account.migrated_utc?;
                Some(RecentMigration {
                    elapsed_hours: (now - migrated_utc).num_hours(),
                    migrated_by: account.migrated_by.clone(),
                    account: account.sanitized(),
                    migrated_utc,
                })
            })
            .collect())
    }
}
