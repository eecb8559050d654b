//! Audit event model - tamper-evident security logging.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Sentinel fed into the hash input of the first chain entry.
pub const GENESIS_HASH: &str = "genesis";

/// Closed enumeration of auditable actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    LoginSucceeded,
    LoginFailed,
    LoginRateLimited,
    AccountLocked,
    AccountCreated,
    AccountActivated,
    PasswordResetRequested,
    PasswordResetCompleted,
    SessionRevoked,
    SuspiciousLoginFlagged,
    AccountMigrated,
    MigrationBatchCompleted,
    CohortAdvanced,
    MigrationRolledBack,
    RollbackWindowCompleted,
    AuditChainVerified,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::LoginSucceeded => "login_succeeded",
            AuditAction::LoginFailed => "login_failed",
            AuditAction::LoginRateLimited => "login_rate_limited",
            AuditAction::AccountLocked => "account_locked",
            AuditAction::AccountCreated => "account_created",
            AuditAction::AccountActivated => "account_activated",
            AuditAction::PasswordResetRequested => "password_reset_requested",
            AuditAction::PasswordResetCompleted => "password_reset_completed",
            AuditAction::SessionRevoked => "session_revoked",
            AuditAction::SuspiciousLoginFlagged => "suspicious_login_flagged",
            AuditAction::AccountMigrated => "account_migrated",
            AuditAction::MigrationBatchCompleted => "migration_batch_completed",
            AuditAction::CohortAdvanced => "cohort_advanced",
            AuditAction::MigrationRolledBack => "migration_rolled_back",
            AuditAction::RollbackWindowCompleted => "rollback_window_completed",
            AuditAction::AuditChainVerified => "audit_chain_verified",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "login_succeeded" => Some(AuditAction::LoginSucceeded),
            "login_failed" => Some(AuditAction::LoginFailed),
            "login_rate_limited" => Some(AuditAction::LoginRateLimited),
            "account_locked" => Some(AuditAction::AccountLocked),
            "account_created" => Some(AuditAction::AccountCreated),
            "account_activated" => Some(AuditAction::AccountActivated),
            "password_reset_requested" => Some(AuditAction::PasswordResetRequested),
            "password_reset_completed" => Some(AuditAction::PasswordResetCompleted),
            "session_revoked" => Some(AuditAction::SessionRevoked),
            "suspicious_login_flagged" => Some(AuditAction::SuspiciousLoginFlagged),
            "account_migrated" => Some(AuditAction::AccountMigrated),
            "migration_batch_completed" => Some(AuditAction::MigrationBatchCompleted),
            "cohort_advanced" => Some(AuditAction::CohortAdvanced),
            "migration_rolled_back" => Some(AuditAction::MigrationRolledBack),
            "rollback_window_completed" => Some(AuditAction::RollbackWindowCompleted),
            "audit_chain_verified" => Some(AuditAction::AuditChainVerified),
            _ => None,
        }
    }
}

/// Who performed an audited action.
#[derive(Debug, Clone)]
pub enum AuditActor {
    Account {
        account_id: Uuid,
        email: String,
        role: String,
    },
    /// Actions taken by the platform itself (e.g. pre-authentication
    /// rejections where no principal is established).
    System,
}

impl AuditActor {
    pub fn account(account_id: Uuid, email: impl Into<String>, role: impl Into<String>) -> Self {
        AuditActor::Account {
            account_id,
            email: email.into(),
            role: role.into(),
        }
    }

    /// Actor identifier as committed into the chain hash.
    pub fn chain_id(&self) -> String {
        match self {
            AuditActor::Account { account_id, .. } => account_id.to_string(),
            AuditActor::System => "system".to_string(),
        }
    }
}

/// Everything the caller supplies for one audit entry; the store seals it
/// into the chain (assigning sequence, previous hash, and entry hash) inside
/// its serialization point.
#[derive(Debug, Clone)]
pub struct AuditDraft {
    pub actor: AuditActor,
    pub ip_address: String,
    pub action: AuditAction,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub previous_state: Option<serde_json::Value>,
    pub new_state: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
}

impl AuditDraft {
    pub fn new(
        actor: AuditActor,
        ip_address: impl Into<String>,
        action: AuditAction,
        resource_type: impl Into<String>,
        resource_id: Option<String>,
    ) -> Self {
        Self {
            actor,
            ip_address: ip_address.into(),
            action,
            resource_type: resource_type.into(),
            resource_id,
            previous_state: None,
            new_state: None,
            metadata: None,
        }
    }

    pub fn with_states(
        mut self,
        previous: Option<serde_json::Value>,
        new: Option<serde_json::Value>,
    ) -> Self {
        self.previous_state = previous;
        self.new_state = new;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Sealed, append-only audit entry. Never updated or deleted.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub chain_seq: i64,
    pub actor_id: Option<Uuid>,
    pub actor_email: Option<String>,
    pub actor_role: Option<String>,
    pub ip_address: String,
    pub action_code: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub previous_state: Option<serde_json::Value>,
    pub new_state: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
    pub created_utc: DateTime<Utc>,
    pub previous_hash: Option<String>,
    pub entry_hash: String,
}

impl AuditEvent {
    /// Actor identifier as committed into the chain hash.
    pub fn chain_actor_id(&self) -> String {
        self.actor_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "system".to_string())
    }
}

/// Result of a full chain verification pass.
#[derive(Debug, Clone, Serialize)]
pub struct ChainVerification {
    pub valid: bool,
    /// First entry whose link or recomputed hash failed; later entries are
    /// untrustworthy once the chain breaks, so verification stops here.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broken_at_id: Option<Uuid>,
    pub total_entries: u64,
}
