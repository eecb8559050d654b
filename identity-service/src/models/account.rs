//! Account model - local principals capable of authenticating.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Account roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Manager,
    Member,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Manager => "manager",
            Role::Member => "member",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "admin" => Some(Role::Admin),
            "manager" => Some(Role::Manager),
            "member" => Some(Role::Member),
            _ => None,
        }
    }
}

/// Account lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    PendingActivation,
    Active,
    Suspended,
    Deactivated,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::PendingActivation => "pending_activation",
            AccountStatus::Active => "active",
            AccountStatus::Suspended => "suspended",
            AccountStatus::Deactivated => "deactivated",
        }
    }
}

/// Which credential back-end is authoritative for an account's password.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialMode {
    Provider,
    Local,
    Migrating,
}

impl CredentialMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialMode::Provider => "provider",
            CredentialMode::Local => "local",
            CredentialMode::Migrating => "migrating",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "provider" => Some(CredentialMode::Provider),
            "local" => Some(CredentialMode::Local),
            "migrating" => Some(CredentialMode::Migrating),
            _ => None,
        }
    }
}

/// Account entity.
///
/// Accounts are never physically deleted; lifecycle ends at `deactivated`.
/// Invariant: `password_hash` is set iff credential mode is local/migrating
/// and status is not `pending_activation`.
#[derive(Debug, Clone, FromRow)]
pub struct Account {
    pub account_id: Uuid,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub password_hash: Option<String>,
    pub role_code: String,
    pub status_code: String,
    pub failed_attempts: i32,
    pub locked_until: Option<DateTime<Utc>>,
    pub last_login_utc: Option<DateTime<Utc>>,
    pub last_login_ip: Option<String>,
    pub credential_mode_code: String,
    pub migrated_utc: Option<DateTime<Utc>>,
    pub migrated_by: Option<String>,
    pub migration_notes: Option<String>,
    pub provider_metadata: Option<serde_json::Value>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl Account {
    /// Create a new, provider-backed account (administrative provisioning
    /// and migration import both start here).
    pub fn new(email: String, role: Role, mode: CredentialMode, status: AccountStatus) -> Self {
        let now = Utc::now();
        Self {
            account_id: Uuid::new_v4(),
            email,
            first_name: None,
            last_name: None,
            password_hash: None,
            role_code: role.as_str().to_string(),
            status_code: status.as_str().to_string(),
            failed_attempts: 0,
            locked_until: None,
            last_login_utc: None,
            last_login_ip: None,
            credential_mode_code: mode.as_str().to_string(),
            migrated_utc: None,
            migrated_by: None,
            migration_notes: None,
            provider_metadata: None,
            created_utc: now,
            updated_utc: now,
        }
    }

    pub fn role(&self) -> Option<Role> {
        Role::parse(&self.role_code)
    }

    pub fn credential_mode(&self) -> Option<CredentialMode> {
        CredentialMode::parse(&self.credential_mode_code)
    }

    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }

    pub fn can_authenticate(&self) -> bool {
        self.status_code == AccountStatus::Active.as_str() && self.password_hash.is_some()
    }

    pub fn is_migrated(&self) -> bool {
        self.migrated_utc.is_some()
    }

    /// Convert to sanitized response (no credential material).
    pub fn sanitized(&self) -> AccountResponse {
        AccountResponse {
            account_id: self.account_id,
            email: self.email.clone(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            role: self.role_code.clone(),
            status: self.status_code.clone(),
            credential_mode: self.credential_mode_code.clone(),
            last_login_utc: self.last_login_utc,
            created_utc: self.created_utc,
        }
    }
}

/// Account response for API (without credential material or lockout state).
#[derive(Debug, Clone, Serialize)]
pub struct AccountResponse {
    pub account_id: Uuid,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub role: String,
    pub status: String,
    pub credential_mode: String,
    pub last_login_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
}
