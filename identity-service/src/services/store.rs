//! Storage abstraction for the durable control-plane state.
//!
//! The Postgres implementation lives in [`super::database`]; the in-memory
//! implementation here backs the test suite and mirrors the same contracts,
//! including atomic failed-attempt increments and the audit append
//! serialization point.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::models::{
    Account, AccountStatus, AuditDraft, AuditEvent, CredentialMode, MigrationCohort, Session,
    SingleUseToken, TokenPurpose,
};
use crate::services::audit::seal_entry;
use crate::services::ServiceError;

/// Fields written when an account is mapped from the external provider.
#[derive(Debug, Clone)]
pub struct MigrationUpdate {
    pub account_id: Uuid,
    pub credential_mode: CredentialMode,
    pub status: Option<AccountStatus>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub provider_metadata: serde_json::Value,
    pub migrated_utc: DateTime<Utc>,
    pub migrated_by: String,
    pub notes: Option<String>,
}

/// Durable store for accounts, sessions, single-use tokens, and cohorts.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    // ==================== Accounts ====================

    async fn insert_account(&self, account: &Account) -> Result<(), ServiceError>;
    async fn find_account_by_id(&self, account_id: Uuid) -> Result<Option<Account>, ServiceError>;
    async fn find_account_by_email(&self, email: &str) -> Result<Option<Account>, ServiceError>;

    /// Atomically increment the failed-attempt counter and return the new
    /// value. Concurrent failures for the same account must not lose updates.
    async fn record_login_failure(&self, account_id: Uuid) -> Result<i32, ServiceError>;

    async fn set_lockout(
        &self,
        account_id: Uuid,
        until: DateTime<Utc>,
    ) -> Result<(), ServiceError>;

    /// Reset the failure counter and lockout, stamp last-login metadata.
    async fn record_login_success(
        &self,
        account_id: Uuid,
        ip: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError>;

    async fn apply_migration(&self, update: &MigrationUpdate) -> Result<(), ServiceError>;

    /// Revert an account to provider mode: clears password hash, provenance,
    /// and lockout state, restoring `active` status.
    async fn clear_migration(
        &self,
        account_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError>;

    /// Accounts whose migration timestamp falls in `[start, end)`.
    async fn find_migrated_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Account>, ServiceError>;

    // ==================== Sessions ====================

    async fn insert_session(&self, session: &Session) -> Result<(), ServiceError>;
    async fn find_session(&self, session_id: Uuid) -> Result<Option<Session>, ServiceError>;

    /// Returns false when the session does not exist or is already revoked.
    async fn revoke_session(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, ServiceError>;

    async fn revoke_sessions_for_account(
        &self,
        account_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, ServiceError>;

    /// Most recent sessions for an account, newest first.
    async fn recent_sessions(
        &self,
        account_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Session>, ServiceError>;

    /// Physically delete sessions that expired before `cutoff`.
    async fn purge_expired_sessions(&self, cutoff: DateTime<Utc>) -> Result<u64, ServiceError>;

    // ==================== Single-use tokens ====================

    async fn insert_token(&self, token: &SingleUseToken) -> Result<(), ServiceError>;
    async fn find_token(&self, token_id: Uuid) -> Result<Option<SingleUseToken>, ServiceError>;

    /// Expire outstanding tokens of one purpose for an account (superseding
    /// issuance).
    async fn invalidate_tokens(
        &self,
        account_id: Uuid,
        purpose: TokenPurpose,
        now: DateTime<Utc>,
    ) -> Result<u64, ServiceError>;

    /// Consume a token and mutate the owning account's credentials in one
    /// transaction. Returns false if the token was already used, expired, or
    /// lost a race to a concurrent consumer.
    async fn consume_token_and_set_password(
        &self,
        token_id: Uuid,
        used_by_ip: &str,
        password_hash: &str,
        new_status: AccountStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, ServiceError>;

    // ==================== Cohorts ====================

    /// All cohorts in rollout order.
    async fn list_cohorts(&self) -> Result<Vec<MigrationCohort>, ServiceError>;
    async fn complete_cohort(&self, cohort_tag: &str, now: DateTime<Utc>)
        -> Result<(), ServiceError>;
}

/// Append-only store for the hash-chained audit log.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Seal and persist one entry. Implementations must serialize the
    /// "read last hash, then write" step: concurrent appends that capture the
    /// same previous hash would corrupt the chain.
    async fn append_event(&self, draft: AuditDraft) -> Result<AuditEvent, ServiceError>;

    /// All entries in chain order.
    async fn load_chain(&self) -> Result<Vec<AuditEvent>, ServiceError>;
}

// ==================== In-memory implementation ====================

#[derive(Default)]
struct MemoryInner {
    accounts: HashMap<Uuid, Account>,
    sessions: HashMap<Uuid, Session>,
    tokens: HashMap<Uuid, SingleUseToken>,
    cohorts: Vec<MigrationCohort>,
}

/// In-memory store used by the test suite.
///
/// The audit vector is public so integrity tests can tamper with persisted
/// entries directly.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    pub audit: Mutex<Vec<AuditEvent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cohorts(cohorts: Vec<MigrationCohort>) -> Self {
        let store = Self::new();
        if let Ok(mut inner) = store.inner.lock() {
            inner.cohorts = cohorts;
        }
        store
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryInner>, ServiceError> {
        self.inner
            .lock()
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("store mutex poisoned: {e}")))
    }

    fn lock_audit(&self) -> Result<MutexGuard<'_, Vec<AuditEvent>>, ServiceError> {
        self.audit
            .lock()
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("audit mutex poisoned: {e}")))
    }
}

#[async_trait]
impl IdentityStore for MemoryStore {
    async fn insert_account(&self, account: &Account) -> Result<(), ServiceError> {
        let mut inner = self.lock()?;
        if inner
            .accounts
            .values()
            .any(|a| a.email.eq_ignore_ascii_case(&account.email))
        {
            return Err(ServiceError::EmailConflict);
        }
        inner.accounts.insert(account.account_id, account.clone());
        Ok(())
    }

    async fn find_account_by_id(&self, account_id: Uuid) -> Result<Option<Account>, ServiceError> {
        Ok(self.lock()?.accounts.get(&account_id).cloned())
    }

    async fn find_account_by_email(&self, email: &str) -> Result<Option<Account>, ServiceError> {
        Ok(self
            .lock()?
            .accounts
            .values()
            .find(|a| a.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn record_login_failure(&self, account_id: Uuid) -> Result<i32, ServiceError> {
        let mut inner = self.lock()?;
        let account = inner
            .accounts
            .get_mut(&account_id)
            .ok_or(ServiceError::AccountNotFound)?;
        account.failed_attempts += 1;
        account.updated_utc = Utc::now();
        Ok(account.failed_attempts)
    }

    async fn set_lockout(
        &self,
        account_id: Uuid,
        until: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        let mut inner = self.lock()?;
        let account = inner
            .accounts
            .get_mut(&account_id)
            .ok_or(ServiceError::AccountNotFound)?;
        account.locked_until = Some(until);
        account.updated_utc = Utc::now();
        Ok(())
    }

    async fn record_login_success(
        &self,
        account_id: Uuid,
        ip: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        let mut inner = self.lock()?;
        let account = inner
            .accounts
            .get_mut(&account_id)
            .ok_or(ServiceError::AccountNotFound)?;
        account.failed_attempts = 0;
        account.locked_until = None;
        account.last_login_utc = Some(now);
        account.last_login_ip = Some(ip.to_string());
        account.updated_utc = now;
        Ok(())
    }

    async fn apply_migration(&self, update: &MigrationUpdate) -> Result<(), ServiceError> {
        let mut inner = self.lock()?;
        let account = inner
            .accounts
            .get_mut(&update.account_id)
            .ok_or(ServiceError::AccountNotFound)?;
        account.credential_mode_code = update.credential_mode.as_str().to_string();
        if let Some(status) = update.status {
            account.status_code = status.as_str().to_string();
        }
        if update.first_name.is_some() {
            account.first_name = update.first_name.clone();
        }
        if update.last_name.is_some() {
            account.last_name = update.last_name.clone();
        }
        account.provider_metadata = Some(update.provider_metadata.clone());
        account.migrated_utc = Some(update.migrated_utc);
        account.migrated_by = Some(update.migrated_by.clone());
        account.migration_notes = update.notes.clone();
        account.updated_utc = Utc::now();
        Ok(())
    }

    async fn clear_migration(
        &self,
        account_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        let mut inner = self.lock()?;
        let account = inner
            .accounts
            .get_mut(&account_id)
            .ok_or(ServiceError::AccountNotFound)?;
        account.credential_mode_code = CredentialMode::Provider.as_str().to_string();
        account.status_code = AccountStatus::Active.as_str().to_string();
        account.password_hash = None;
        account.migrated_utc = None;
        account.migrated_by = None;
        account.migration_notes = None;
        account.provider_metadata = None;
        account.failed_attempts = 0;
        account.locked_until = None;
        account.updated_utc = now;
        Ok(())
    }

    async fn find_migrated_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Account>, ServiceError> {
        let inner = self.lock()?;
        let mut matched: Vec<Account> = inner
            .accounts
            .values()
            .filter(|a| {
                a.migrated_utc
                    .is_some_and(|at| at >= start && at < end)
            })
            .cloned()
            .collect();
        matched.sort_by_key(|a| a.migrated_utc);
        Ok(matched)
    }

    async fn insert_session(&self, session: &Session) -> Result<(), ServiceError> {
        self.lock()?
            .sessions
            .insert(session.session_id, session.clone());
        Ok(())
    }

    async fn find_session(&self, session_id: Uuid) -> Result<Option<Session>, ServiceError> {
        Ok(self.lock()?.sessions.get(&session_id).cloned())
    }

    async fn revoke_session(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, ServiceError> {
        let mut inner = self.lock()?;
        match inner.sessions.get_mut(&session_id) {
            Some(session) if session.revoked_utc.is_none() => {
                session.revoked_utc = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke_sessions_for_account(
        &self,
        account_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, ServiceError> {
        let mut inner = self.lock()?;
        let mut revoked = 0;
        for session in inner.sessions.values_mut() {
            if session.account_id == account_id && session.revoked_utc.is_none() {
                session.revoked_utc = Some(now);
                revoked += 1;
            }
        }
        Ok(revoked)
    }

    async fn recent_sessions(
        &self,
        account_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Session>, ServiceError> {
        let inner = self.lock()?;
        let mut sessions: Vec<Session> = inner
            .sessions
            .values()
            .filter(|s| s.account_id == account_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.created_utc.cmp(&a.created_utc));
        sessions.truncate(limit.max(0) as usize);
        Ok(sessions)
    }

    async fn purge_expired_sessions(&self, cutoff: DateTime<Utc>) -> Result<u64, ServiceError> {
        let mut inner = self.lock()?;
        let before = inner.sessions.len();
        inner.sessions.retain(|_, s| s.expires_utc >= cutoff);
        Ok((before - inner.sessions.len()) as u64)
    }

    async fn insert_token(&self, token: &SingleUseToken) -> Result<(), ServiceError> {
        self.lock()?.tokens.insert(token.token_id, token.clone());
        Ok(())
    }

    async fn find_token(&self, token_id: Uuid) -> Result<Option<SingleUseToken>, ServiceError> {
        Ok(self.lock()?.tokens.get(&token_id).cloned())
    }

    async fn invalidate_tokens(
        &self,
        account_id: Uuid,
        purpose: TokenPurpose,
        now: DateTime<Utc>,
    ) -> Result<u64, ServiceError> {
        let mut inner = self.lock()?;
        let mut invalidated = 0;
        for token in inner.tokens.values_mut() {
            if token.account_id == account_id
                && token.purpose_code == purpose.as_str()
                && token.used_utc.is_none()
                && token.expires_utc > now
            {
                token.expires_utc = now;
                invalidated += 1;
            }
        }
        Ok(invalidated)
    }

    async fn consume_token_and_set_password(
        &self,
        token_id: Uuid,
        used_by_ip: &str,
        password_hash: &str,
        new_status: AccountStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, ServiceError> {
        let mut inner = self.lock()?;
        let account_id = match inner.tokens.get_mut(&token_id) {
            Some(token) if token.used_utc.is_none() && token.expires_utc > now => {
                token.used_utc = Some(now);
                token.used_by_ip = Some(used_by_ip.to_string());
                token.account_id
            }
            _ => return Ok(false),
        };
        let account = inner
            .accounts
            .get_mut(&account_id)
            .ok_or(ServiceError::AccountNotFound)?;
        account.password_hash = Some(password_hash.to_string());
        account.status_code = new_status.as_str().to_string();
        account.updated_utc = now;
        Ok(true)
    }

    async fn list_cohorts(&self) -> Result<Vec<MigrationCohort>, ServiceError> {
        let inner = self.lock()?;
        let mut cohorts = inner.cohorts.clone();
        cohorts.sort_by_key(|c| c.position);
        Ok(cohorts)
    }

    async fn complete_cohort(
        &self,
        cohort_tag: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        let mut inner = self.lock()?;
        for cohort in &mut inner.cohorts {
            if cohort.cohort_tag == cohort_tag {
                cohort.completed_utc = Some(now);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn append_event(&self, draft: AuditDraft) -> Result<AuditEvent, ServiceError> {
        // The mutex is the serialization point: previous-hash capture and
        // insert happen under one guard.
        let mut chain = self.lock_audit()?;
        let (previous_hash, chain_seq) = match chain.last() {
            Some(last) => (Some(last.entry_hash.clone()), last.chain_seq + 1),
            None => (None, 1),
        };
        let event = seal_entry(draft, previous_hash, chain_seq, Utc::now());
        chain.push(event.clone());
        Ok(event)
    }

    async fn load_chain(&self) -> Result<Vec<AuditEvent>, ServiceError> {
        Ok(self.lock_audit()?.clone())
    }
}
