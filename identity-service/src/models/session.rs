//! Session model - revocable grants backing signed bearer tokens.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

/// Client metadata captured at issuance.
#[derive(Debug, Clone)]
pub struct ClientContext {
    pub ip_address: String,
    pub user_agent: Option<String>,
}

/// Session entity.
///
/// Only a SHA-256 of the raw token is persisted; a leaked table dump cannot
/// be replayed as a bearer token. Valid while `revoked_utc` is null and
/// `expires_utc` is in the future - both are re-checked against this row on
/// every verification, never inferred from the signed token alone.
#[derive(Debug, Clone, FromRow)]
pub struct Session {
    pub session_id: Uuid,
    pub account_id: Uuid,
    pub token_hash: String,
    pub ip_address: String,
    pub user_agent: Option<String>,
    pub client_app: String,
    pub created_utc: DateTime<Utc>,
    pub expires_utc: DateTime<Utc>,
    pub revoked_utc: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_utc <= now
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked_utc.is_some()
    }
}
