//! Login, logout, activation, and password-reset flows.
//!
//! This is the enforcement order for an authentication attempt: rate limit,
//! account lookup, eligibility, lockout, password verification, then session
//! issuance.
//! Every branch lands in the audit chain; the caller only ever learns
//! "invalid email or password" for credential failures.

use chrono::{Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::LockoutSchedule;
use crate::models::{
    Account, AccountResponse, AccountStatus, AuditAction, AuditActor, AuditDraft, ClientContext,
    CredentialMode, Session,
};
use crate::models::single_use_token::{parse_raw_token, SingleUseToken, TokenPurpose};
use crate::services::audit::AuditLogger;
use crate::services::detector::{self, LoginSample};
use crate::services::notify::{NotificationRequest, Notifier};
use crate::services::rate_limit::WindowLimiter;
use crate::services::session::{SessionService, SessionVerdict};
use crate::services::store::IdentityStore;
use crate::services::ServiceError;
use crate::utils::normalize_email;
use crate::utils::password::{
    hash_password_blocking, verify_password_blocking, Password, PasswordHashString, DUMMY_HASH,
};

/// Interactive reset links are short-lived; migration activation links are
/// issued by the migration service with their own TTL.
const RESET_TOKEN_TTL_HOURS: i64 = 2;

/// Prior successful logins consulted by the suspicious-login heuristics.
const DETECTOR_HISTORY_LIMIT: i64 = 20;

#[derive(Debug, Clone, Serialize)]
pub struct LoginSuccess {
    pub account: AccountResponse,
    pub session_id: Uuid,
    pub token: String,
    pub expires_utc: chrono::DateTime<Utc>,
}

#[derive(Clone)]
pub struct LoginService {
    store: Arc<dyn IdentityStore>,
    audit: AuditLogger,
    sessions: SessionService,
    login_limiter: WindowLimiter,
    reset_limiter: WindowLimiter,
    lockout: LockoutSchedule,
    notifier: Arc<dyn Notifier>,
}

impl LoginService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn IdentityStore>,
        audit: AuditLogger,
        sessions: SessionService,
        login_limiter: WindowLimiter,
        reset_limiter: WindowLimiter,
        lockout: LockoutSchedule,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            audit,
            sessions,
            login_limiter,
            reset_limiter,
            lockout,
            notifier,
        }
    }

    /// Authenticate a local-credential account and issue a session.
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        ctx: &ClientContext,
    ) -> Result<LoginSuccess, ServiceError> {
        let email = normalize_email(email);

        // Keyed by origin and target so one IP cannot burn the budget of
        // every account, and one account cannot be locked out from a single
        // hostile IP alone.
        let limiter_key = format!("{}:{}", ctx.ip_address, email);
        let decision = self.login_limiter.check(&limiter_key).await;
        if !decision.allowed {
            self.audit
                .record(
                    AuditDraft::new(
                        AuditActor::System,
                        &ctx.ip_address,
                        AuditAction::LoginRateLimited,
                        "account",
                        None,
                    )
                    .with_metadata(serde_json::json!({
                        "email": email,
                        "retry_after_seconds": decision.retry_after_seconds,
                    })),
                )
                .await;
            return Err(ServiceError::RateLimited {
                retry_after: decision.retry_after_seconds,
            });
        }

        let account = self.store.find_account_by_email(&email).await?;

        let Some(account) = account else {
            // Burn a real hash verification so "unknown email" and "wrong
            // password" take the same time.
            verify_password_blocking(
                Password::new(password.to_string()),
                PasswordHashString::new(DUMMY_HASH.to_string()),
            )
            .await;
            self.record_failure_event(None, &email, ctx, "unknown_account")
                .await;
            return Err(ServiceError::InvalidCredentials);
        };

        let now = Utc::now();
        if !account.can_authenticate() {
            // Provider-mode, pending, suspended, and deactivated accounts
            // all take the dummy-verification path: none of them may learn
            // anything a nonexistent account would not - not even that a
            // lockout is in force.
            verify_password_blocking(
                Password::new(password.to_string()),
                PasswordHashString::new(DUMMY_HASH.to_string()),
            )
            .await;
            let reason = if account.password_hash.is_none() {
                "no_local_credentials"
            } else {
                "account_inactive"
            };
            self.record_failure_event(Some(&account), &email, ctx, reason)
                .await;
            return Err(ServiceError::InvalidCredentials);
        }

        if account.is_locked(now) {
            let until = account.locked_until.unwrap_or(now);
            self.record_failure_event(Some(&account), &email, ctx, "account_locked")
                .await;
            return Err(ServiceError::AccountLocked { until });
        }

        let stored_hash = account
            .password_hash
            .clone()
            .ok_or_else(|| ServiceError::Internal(anyhow::anyhow!("account lost password hash")))?;

        let verified = verify_password_blocking(
            Password::new(password.to_string()),
            PasswordHashString::new(stored_hash),
        )
        .await;

        if !verified {
            return Err(self.handle_failed_password(&account, &email, ctx).await?);
        }

        // Fetch history before the new session exists so the current login
        // is compared against prior ones only.
        let history = self
            .store
            .recent_sessions(account.account_id, DETECTOR_HISTORY_LIMIT)
            .await
            .unwrap_or_default();

        self.store
            .record_login_success(account.account_id, &ctx.ip_address, now)
            .await?;

        let (session, token) = self.sessions.issue(&account, ctx).await?;

        self.audit
            .record(
                AuditDraft::new(
                    AuditActor::account(account.account_id, &account.email, &account.role_code),
                    &ctx.ip_address,
                    AuditAction::LoginSucceeded,
                    "session",
                    Some(session.session_id.to_string()),
                )
                .with_metadata(serde_json::json!({
                    "credential_mode": account.credential_mode_code,
                })),
            )
            .await;

        // Provider-backed logins are observed by the provider itself; the
        // heuristics run only once an account holds local credentials.
        if account.credential_mode() == Some(CredentialMode::Local) {
            self.flag_if_suspicious(&account, &history, &session, ctx);
        }

        Ok(LoginSuccess {
            account: account.sanitized(),
            session_id: session.session_id,
            token,
            expires_utc: session.expires_utc,
        })
    }

    /// Count a wrong password and apply the progressive lockout schedule.
    ///
    /// Returns the error to surface; infrastructure failures propagate as
    /// `Err`.
    async fn handle_failed_password(
        &self,
        account: &Account,
        email: &str,
        ctx: &ClientContext,
    ) -> Result<ServiceError, ServiceError> {
        let count = self.store.record_login_failure(account.account_id).await?;

        self.record_failure_event(Some(account), email, ctx, "invalid_password")
            .await;

        // Locks and their audit events fire only at exact tier crossings.
        // Failures between tiers (after an earlier lock expired) just count.
        if self.lockout.is_threshold(count) {
            let minutes = self
                .lockout
                .lock_duration_minutes(count)
                .ok_or_else(|| ServiceError::Internal(anyhow::anyhow!("threshold without tier")))?;
            let until = Utc::now() + Duration::minutes(minutes);
            self.store.set_lockout(account.account_id, until).await?;

            self.audit
                .record(
                    AuditDraft::new(
                        AuditActor::System,
                        &ctx.ip_address,
                        AuditAction::AccountLocked,
                        "account",
                        Some(account.account_id.to_string()),
                    )
                    .with_metadata(serde_json::json!({
                        "failed_attempts": count,
                        "locked_until": until.to_rfc3339(),
                        "lock_minutes": minutes,
                    })),
                )
                .await;
        }

        // Even a crossing attempt stays generic: the informative lock
        // message (with unlock time) appears only on subsequent attempts
        // against the already-locked account.
        Ok(ServiceError::InvalidCredentials)
    }

    async fn record_failure_event(
        &self,
        account: Option<&Account>,
        email: &str,
        ctx: &ClientContext,
        reason: &str,
    ) {
        let resource_id = account.map(|a| a.account_id.to_string());
        self.audit
            .record(
                AuditDraft::new(
                    AuditActor::System,
                    &ctx.ip_address,
                    AuditAction::LoginFailed,
                    "account",
                    resource_id,
                )
                .with_metadata(serde_json::json!({
                    "email": email,
                    "reason": reason,
                })),
            )
            .await;
    }

    /// Run the suspicious-login heuristics and, when flagged, dispatch the
    /// notification as a detached task. Login latency never waits on it.
    fn flag_if_suspicious(
        &self,
        account: &Account,
        history: &[Session],
        session: &Session,
        ctx: &ClientContext,
    ) {
        let samples: Vec<LoginSample> = history.iter().map(LoginSample::from).collect();
        let current = LoginSample::from(session);
        let assessment = detector::assess(&samples, &current);
        if !assessment.suspicious {
            return;
        }

        let reasons: Vec<&'static str> =
            assessment.reasons.iter().map(|r| r.as_str()).collect();
        tracing::warn!(
            account_id = %account.account_id,
            reasons = ?reasons,
            "Suspicious login detected"
        );

        let audit = self.audit.clone();
        let notifier = self.notifier.clone();
        let draft = AuditDraft::new(
            AuditActor::account(account.account_id, &account.email, &account.role_code),
            &ctx.ip_address,
            AuditAction::SuspiciousLoginFlagged,
            "session",
            Some(session.session_id.to_string()),
        )
        .with_metadata(serde_json::json!({ "reasons": reasons }));
        let notification = NotificationRequest {
            recipient: account.email.clone(),
            template: "suspicious_login".to_string(),
            params: serde_json::json!({
                "ip_address": ctx.ip_address,
                "reasons": reasons,
                "at": session.created_utc.to_rfc3339(),
            }),
        };

        tokio::spawn(async move {
            audit.record(draft).await;
            if let Err(e) = notifier.send(notification).await {
                tracing::error!(error = %e, "Failed to send suspicious-login notification");
            }
        });
    }

    /// Revoke the session behind a presented token. Idempotent: an already
    /// revoked or unknown session is not an error to the caller.
    pub async fn logout(&self, token: &str, ctx: &ClientContext) -> Result<(), ServiceError> {
        let verdict = self.sessions.validate(token).await?;
        let SessionVerdict::Valid(validated) = verdict else {
            return Ok(());
        };

        let revoked = self.sessions.revoke(validated.session_id).await?;
        if revoked {
            self.audit
                .record(
                    AuditDraft::new(
                        AuditActor::System,
                        &ctx.ip_address,
                        AuditAction::SessionRevoked,
                        "session",
                        Some(validated.session_id.to_string()),
                    )
                    .with_metadata(serde_json::json!({ "trigger": "logout" })),
                )
                .await;
        }
        Ok(())
    }

    /// Consume an activation token: set the first local password and move
    /// the account from `pending_activation` to `active`.
    pub async fn activate_account(
        &self,
        raw_token: &str,
        new_password: &str,
        ctx: &ClientContext,
    ) -> Result<AccountResponse, ServiceError> {
        let account_id = self
            .consume_single_use_token(raw_token, TokenPurpose::Activation, new_password, ctx)
            .await?;

        let account = self
            .store
            .find_account_by_id(account_id)
            .await?
            .ok_or(ServiceError::AccountNotFound)?;

        self.audit
            .record(
                AuditDraft::new(
                    AuditActor::account(account_id, &account.email, &account.role_code),
                    &ctx.ip_address,
                    AuditAction::AccountActivated,
                    "account",
                    Some(account_id.to_string()),
                )
                .with_states(
                    Some(serde_json::json!({
                        "status": AccountStatus::PendingActivation.as_str()
                    })),
                    Some(serde_json::json!({ "status": AccountStatus::Active.as_str() })),
                ),
            )
            .await;

        Ok(account.sanitized())
    }

    /// Issue a password-reset token for a local-credential account.
    ///
    /// Always returns success to the caller: whether the email maps to an
    /// eligible account is not observable from outside.
    pub async fn request_password_reset(
        &self,
        email: &str,
        ctx: &ClientContext,
    ) -> Result<(), ServiceError> {
        let email = normalize_email(email);

        let decision = self
            .reset_limiter
            .check(&format!("{}:{}", ctx.ip_address, email))
            .await;
        if !decision.allowed {
            return Err(ServiceError::RateLimited {
                retry_after: decision.retry_after_seconds,
            });
        }

        let Some(account) = self.store.find_account_by_email(&email).await? else {
            tracing::debug!("Password reset requested for unknown email");
            return Ok(());
        };

        // Provider-mode accounts have no local password to reset.
        let eligible = matches!(
            account.credential_mode(),
            Some(CredentialMode::Local) | Some(CredentialMode::Migrating)
        ) && account.status_code == AccountStatus::Active.as_str();
        if !eligible {
            tracing::debug!(account_id = %account.account_id, "Password reset not applicable");
            return Ok(());
        }

        let now = Utc::now();
        // A fresh request supersedes any outstanding reset link.
        self.store
            .invalidate_tokens(account.account_id, TokenPurpose::PasswordReset, now)
            .await?;

        let (record, raw) = SingleUseToken::issue(
            account.account_id,
            TokenPurpose::PasswordReset,
            ctx.ip_address.clone(),
            RESET_TOKEN_TTL_HOURS,
        );
        self.store.insert_token(&record).await?;

        self.audit
            .record(
                AuditDraft::new(
                    AuditActor::System,
                    &ctx.ip_address,
                    AuditAction::PasswordResetRequested,
                    "account",
                    Some(account.account_id.to_string()),
                )
                .with_metadata(serde_json::json!({
                    "token_id": record.token_id,
                    "expires_utc": record.expires_utc.to_rfc3339(),
                })),
            )
            .await;

        if let Err(e) = self
            .notifier
            .send(NotificationRequest {
                recipient: account.email.clone(),
                template: "password_reset".to_string(),
                params: serde_json::json!({ "token": raw }),
            })
            .await
        {
            tracing::error!(error = %e, "Failed to send password-reset notification");
        }

        Ok(())
    }

    /// Consume a reset token, set the new password, and revoke every open
    /// session for the account.
    pub async fn confirm_password_reset(
        &self,
        raw_token: &str,
        new_password: &str,
        ctx: &ClientContext,
    ) -> Result<(), ServiceError> {
        let account_id = self
            .consume_single_use_token(raw_token, TokenPurpose::PasswordReset, new_password, ctx)
            .await?;

        // A credential change invalidates everything issued under the old
        // one.
        let revoked = self.sessions.revoke_all_for_account(account_id).await?;

        self.audit
            .record(
                AuditDraft::new(
                    AuditActor::System,
                    &ctx.ip_address,
                    AuditAction::PasswordResetCompleted,
                    "account",
                    Some(account_id.to_string()),
                )
                .with_metadata(serde_json::json!({ "sessions_revoked": revoked })),
            )
            .await;

        Ok(())
    }

    /// Shared validate-then-consume path for activation and reset tokens.
    /// Returns the owning account on success.
    async fn consume_single_use_token(
        &self,
        raw_token: &str,
        purpose: TokenPurpose,
        new_password: &str,
        ctx: &ClientContext,
    ) -> Result<Uuid, ServiceError> {
        if new_password.len() < 12 {
            return Err(ServiceError::Validation(
                "Password must be at least 12 characters".to_string(),
            ));
        }

        let (token_id, secret) =
            parse_raw_token(raw_token).ok_or(ServiceError::InvalidToken)?;

        let token = self
            .store
            .find_token(token_id)
            .await?
            .ok_or(ServiceError::InvalidToken)?;

        if token.purpose() != Some(purpose) || !token.matches_secret(secret) {
            return Err(ServiceError::InvalidToken);
        }

        let now = Utc::now();
        if token.is_used() {
            return Err(ServiceError::TokenAlreadyUsed);
        }
        if token.is_expired(now) {
            return Err(ServiceError::TokenExpired);
        }

        let hash = hash_password_blocking(Password::new(new_password.to_string()))
            .await
            .map_err(ServiceError::Internal)?;

        // Consumption and the credential write are one storage transaction;
        // losing the race to a concurrent consumer surfaces as already-used.
        let consumed = self
            .store
            .consume_token_and_set_password(
                token_id,
                &ctx.ip_address,
                hash.as_str(),
                AccountStatus::Active,
                now,
            )
            .await?;
        if !consumed {
            return Err(ServiceError::TokenAlreadyUsed);
        }

        Ok(token.account_id)
    }
}
