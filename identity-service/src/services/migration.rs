//! Migration orchestrator: maps provider users onto local accounts.
//!
//! Mapping is idempotent by normalized email, never destroys a native local
//! account, and records every outcome in the audit chain attributed to the
//! administrator who triggered it.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

use crate::models::single_use_token::{SingleUseToken, TokenPurpose};
use crate::models::{
    Account, AccountStatus, AuditAction, AuditActor, AuditDraft, CredentialMode, MigrationCohort,
    ProviderUser, Role,
};
use crate::services::audit::AuditLogger;
use crate::services::notify::{NotificationRequest, Notifier};
use crate::services::provider::IdentityProvider;
use crate::services::store::{IdentityStore, MigrationUpdate};
use crate::services::ServiceError;
use crate::utils::normalize_email;

/// Activation links issued to migrated accounts stay valid longer than the
/// interactive reset flow: migrated users may not see the email for days.
const MIGRATION_ACTIVATION_TTL_HOURS: i64 = 168;

/// How one provider user was handled by `map_account`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MapOutcome {
    Created { email: String },
    Updated { email: String },
    Skipped { email: String, reason: String },
}

/// Caller-supplied knobs for a mapping run.
#[derive(Clone)]
pub struct MapOptions {
    /// Credential mode the mapped account lands in.
    pub set_auth_mode: CredentialMode,
    /// Park the account in `pending_activation` and issue an activation
    /// token so a password must be set before first use. Implied for
    /// local/migrating modes, which start with no password.
    pub force_password_change: bool,
    /// Administrator attributed in the audit chain.
    pub actor: AuditActor,
    pub actor_ip: String,
    pub notes: Option<String>,
}

/// Tally for one batch run. Per-item failures land in `errors` and never
/// abort the remainder of the batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MigrationReport {
    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
    pub errors: Vec<MigrationError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationError {
    pub email: String,
    pub message: String,
}

impl MigrationReport {
    pub fn absorb(&mut self, outcome: &MapOutcome) {
        match outcome {
            MapOutcome::Created { .. } => self.created += 1,
            MapOutcome::Updated { .. } => self.updated += 1,
            MapOutcome::Skipped { .. } => self.skipped += 1,
        }
    }

    pub fn merge(&mut self, other: MigrationReport) {
        self.created += other.created;
        self.updated += other.updated;
        self.skipped += other.skipped;
        self.errors.extend(other.errors);
    }

    pub fn processed(&self) -> u64 {
        self.created + self.updated + self.skipped + self.errors.len() as u64
    }
}

/// Result of one cohort-advance call.
#[derive(Debug, Clone, Serialize)]
pub struct AdvanceOutcome {
    pub cohort_tag: String,
    pub report: MigrationReport,
    /// Set when no eligible members remained and the cohort was marked
    /// complete.
    pub cohort_completed: bool,
}

#[derive(Clone)]
pub struct MigrationService {
    store: Arc<dyn IdentityStore>,
    audit: AuditLogger,
    provider: Arc<dyn IdentityProvider>,
    notifier: Arc<dyn Notifier>,
    batch_size: usize,
}

impl MigrationService {
    pub fn new(
        store: Arc<dyn IdentityStore>,
        audit: AuditLogger,
        provider: Arc<dyn IdentityProvider>,
        notifier: Arc<dyn Notifier>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            audit,
            provider,
            notifier,
            batch_size: batch_size.max(1),
        }
    }

    /// Pull the provider's complete user list, page by page.
    pub async fn export_accounts(&self) -> Result<Vec<ProviderUser>, ServiceError> {
        let mut users = Vec::new();
        let mut page_token = None;

        loop {
            let page = self.provider.list_users(page_token).await?;
            users.extend(page.users);
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        tracing::info!(count = users.len(), "Exported provider users");
        Ok(users)
    }

    pub async fn export_account(&self, id: &str) -> Result<Option<ProviderUser>, ServiceError> {
        self.provider.get_user(id).await
    }

    /// Map one provider user onto a local account. Idempotent: running the
    /// same mapping twice updates the existing account in place, never a
    /// duplicate. Only native local accounts are skipped.
    pub async fn map_account(
        &self,
        user: &ProviderUser,
        options: &MapOptions,
    ) -> Result<MapOutcome, ServiceError> {
        let email = normalize_email(&user.email);
        if email.is_empty() {
            return Err(ServiceError::Validation(
                "Provider user has no email".to_string(),
            ));
        }

        let now = Utc::now();
        let target_status = self.target_status(options);

        let outcome = match self.store.find_account_by_email(&email).await? {
            None => {
                let mut account = Account::new(
                    email.clone(),
                    Role::Member,
                    options.set_auth_mode,
                    target_status,
                );
                account.first_name = user.first_name.clone();
                account.last_name = user.last_name.clone();
                account.provider_metadata = Some(provider_snapshot(user));
                account.migrated_utc = Some(now);
                account.migrated_by = Some(options.actor.chain_id());
                account.migration_notes = options.notes.clone();
                self.store.insert_account(&account).await?;

                if target_status == AccountStatus::PendingActivation {
                    self.issue_activation(&account, &options.actor_ip).await?;
                }

                MapOutcome::Created { email: email.clone() }
            }
            Some(existing) => {
                // A native local account is one whose credentials were
                // established here, not imported. It is never overwritten.
                let native_local = existing.credential_mode()
                    == Some(CredentialMode::Local)
                    && !existing.is_migrated();
                if native_local {
                    return Ok(MapOutcome::Skipped {
                        email,
                        reason: "native_local_account".to_string(),
                    });
                }

                // An account that already holds a local password keeps its
                // status on re-map; only profile and provenance refresh.
                // Knocking it back to pending would strand its credentials.
                let status = if target_status == AccountStatus::PendingActivation
                    && existing.password_hash.is_some()
                {
                    None
                } else {
                    Some(target_status)
                };

                let update = MigrationUpdate {
                    account_id: existing.account_id,
                    credential_mode: options.set_auth_mode,
                    status,
                    first_name: user.first_name.clone(),
                    last_name: user.last_name.clone(),
                    provider_metadata: provider_snapshot(user),
                    migrated_utc: now,
                    migrated_by: options.actor.chain_id(),
                    notes: options.notes.clone(),
                };
                self.store.apply_migration(&update).await?;

                if status == Some(AccountStatus::PendingActivation) {
                    let refreshed = self
                        .store
                        .find_account_by_id(existing.account_id)
                        .await?
                        .ok_or(ServiceError::AccountNotFound)?;
                    self.issue_activation(&refreshed, &options.actor_ip).await?;
                }

                MapOutcome::Updated { email: email.clone() }
            }
        };

        self.audit
            .record(
                AuditDraft::new(
                    options.actor.clone(),
                    &options.actor_ip,
                    AuditAction::AccountMigrated,
                    "account",
                    Some(email),
                )
                .with_metadata(serde_json::json!({
                    "provider_id": user.id,
                    "auth_mode": options.set_auth_mode.as_str(),
                    "outcome": outcome,
                })),
            )
            .await;

        Ok(outcome)
    }

    /// Map a slice of provider users with per-item error isolation.
    pub async fn batch_map(
        &self,
        users: &[ProviderUser],
        options: &MapOptions,
    ) -> Result<MigrationReport, ServiceError> {
        let mut report = MigrationReport::default();

        for user in users {
            match self.map_account(user, options).await {
                Ok(outcome) => report.absorb(&outcome),
                Err(e) => {
                    tracing::error!(email = %user.email, error = %e, "Account mapping failed");
                    report.errors.push(MigrationError {
                        email: user.email.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        self.audit
            .record(
                AuditDraft::new(
                    options.actor.clone(),
                    &options.actor_ip,
                    AuditAction::MigrationBatchCompleted,
                    "migration_batch",
                    None,
                )
                .with_metadata(serde_json::json!({
                    "created": report.created,
                    "updated": report.updated,
                    "skipped": report.skipped,
                    "errors": report.errors.len(),
                })),
            )
            .await;

        Ok(report)
    }

    /// Export everything from the provider and map it all.
    pub async fn migrate_all(&self, options: &MapOptions) -> Result<MigrationReport, ServiceError> {
        let users = self.export_accounts().await?;
        self.batch_map(&users, options).await
    }

    /// Advance the staged rollout by one step: map up to `batch_size`
    /// not-yet-migrated members of the first incomplete cohort, marking the
    /// cohort complete once no eligible members remain.
    pub async fn advance_cohort(&self, options: &MapOptions) -> Result<AdvanceOutcome, ServiceError> {
        let cohorts = self.store.list_cohorts().await?;
        let Some(current) = cohorts.iter().find(|c| !c.is_complete()) else {
            return Err(ServiceError::Validation(
                "All migration cohorts are complete".to_string(),
            ));
        };

        let eligible = self.eligible_members(current).await?;

        if eligible.is_empty() {
            let now = Utc::now();
            self.store.complete_cohort(&current.cohort_tag, now).await?;
            self.audit
                .record(
                    AuditDraft::new(
                        options.actor.clone(),
                        &options.actor_ip,
                        AuditAction::CohortAdvanced,
                        "migration_cohort",
                        Some(current.cohort_tag.clone()),
                    )
                    .with_metadata(serde_json::json!({ "completed": true })),
                )
                .await;

            return Ok(AdvanceOutcome {
                cohort_tag: current.cohort_tag.clone(),
                report: MigrationReport::default(),
                cohort_completed: true,
            });
        }

        let slice: Vec<ProviderUser> =
            eligible.into_iter().take(self.batch_size).collect();
        let report = self.batch_map(&slice, options).await?;

        self.audit
            .record(
                AuditDraft::new(
                    options.actor.clone(),
                    &options.actor_ip,
                    AuditAction::CohortAdvanced,
                    "migration_cohort",
                    Some(current.cohort_tag.clone()),
                )
                .with_metadata(serde_json::json!({
                    "completed": false,
                    "processed": report.processed(),
                })),
            )
            .await;

        Ok(AdvanceOutcome {
            cohort_tag: current.cohort_tag.clone(),
            report,
            cohort_completed: false,
        })
    }

    /// Provider users belonging to the cohort that have not been migrated
    /// yet. Native local accounts do not count as eligible: mapping would
    /// only skip them, so they must not keep the cohort open forever.
    async fn eligible_members(
        &self,
        cohort: &MigrationCohort,
    ) -> Result<Vec<ProviderUser>, ServiceError> {
        let users = self.export_accounts().await?;
        let mut eligible = Vec::new();

        for user in users {
            let email = normalize_email(&user.email);
            if !cohort.contains(&email) {
                continue;
            }
            match self.store.find_account_by_email(&email).await? {
                Some(existing) if existing.is_migrated() => continue,
                Some(existing)
                    if existing.credential_mode() == Some(CredentialMode::Local) =>
                {
                    continue
                }
                _ => eligible.push(user),
            }
        }

        Ok(eligible)
    }

    fn target_status(&self, options: &MapOptions) -> AccountStatus {
        // A local-credential account with no password cannot be active;
        // provider-mode accounts keep authenticating upstream unless the
        // administrator forces an activation pass.
        if options.force_password_change {
            return AccountStatus::PendingActivation;
        }
        match options.set_auth_mode {
            CredentialMode::Provider => AccountStatus::Active,
            CredentialMode::Local | CredentialMode::Migrating => AccountStatus::PendingActivation,
        }
    }

    async fn issue_activation(&self, account: &Account, ip: &str) -> Result<(), ServiceError> {
        let now = Utc::now();
        self.store
            .invalidate_tokens(account.account_id, TokenPurpose::Activation, now)
            .await?;

        let (record, raw) = SingleUseToken::issue(
            account.account_id,
            TokenPurpose::Activation,
            ip.to_string(),
            MIGRATION_ACTIVATION_TTL_HOURS,
        );
        self.store.insert_token(&record).await?;

        if let Err(e) = self
            .notifier
            .send(NotificationRequest {
                recipient: account.email.clone(),
                template: "account_activation".to_string(),
                params: serde_json::json!({ "token": raw }),
            })
            .await
        {
            tracing::error!(error = %e, account_id = %account.account_id,
                "Failed to send activation notification");
        }

        Ok(())
    }
}

/// The subset of provider data persisted on the account. Only already
/// sanitized fields reach this point.
fn provider_snapshot(user: &ProviderUser) -> serde_json::Value {
    serde_json::json!({
        "provider_id": user.id,
        "public_metadata": user.public_metadata,
        "email_verified": user.email_verified,
        "provider_created_at": user.created_at,
        "provider_last_sign_in_at": user.last_sign_in_at,
    })
}
