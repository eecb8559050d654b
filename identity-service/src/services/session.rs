//! Durable session lifecycle: issuance, verification, revocation, GC.

use chrono::{Duration, Utc};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::models::{Account, ClientContext, Session};
use crate::services::jwt::{token_hash, JwtService};
use crate::services::store::IdentityStore;
use crate::services::ServiceError;

/// Why a presented token was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRejection {
    InvalidToken,
    SessionNotFound,
    SessionRevoked,
    SessionExpired,
}

impl SessionRejection {
    pub fn reason(&self) -> &'static str {
        match self {
            SessionRejection::InvalidToken => "invalid_token",
            SessionRejection::SessionNotFound => "session_not_found",
            SessionRejection::SessionRevoked => "session_revoked",
            SessionRejection::SessionExpired => "session_expired",
        }
    }
}

/// Payload returned for a token that passed both checks.
#[derive(Debug, Clone)]
pub struct ValidatedSession {
    pub account_id: Uuid,
    pub session_id: Uuid,
    pub role: String,
    pub expires_utc: chrono::DateTime<Utc>,
}

/// Outcome of a validation call. Infrastructure failures surface separately
/// as `ServiceError`; a rejection is a normal, non-error outcome.
#[derive(Debug, Clone)]
pub enum SessionVerdict {
    Valid(ValidatedSession),
    Rejected(SessionRejection),
}

#[derive(Clone)]
pub struct SessionService {
    jwt: JwtService,
    store: Arc<dyn IdentityStore>,
    client_app: String,
}

impl SessionService {
    pub fn new(jwt: JwtService, store: Arc<dyn IdentityStore>, client_app: String) -> Self {
        Self {
            jwt,
            store,
            client_app,
        }
    }

    /// Issue a signed token and persist the backing session record.
    ///
    /// Only a hash of the token is stored; the raw value exists in the
    /// response and nowhere else.
    pub async fn issue(
        &self,
        account: &Account,
        ctx: &ClientContext,
    ) -> Result<(Session, String), ServiceError> {
        let session_id = Uuid::new_v4();
        let (token, expires_utc) = self
            .jwt
            .issue_session_token(account.account_id, &account.role_code, session_id)
            .map_err(ServiceError::Internal)?;

        let session = Session {
            session_id,
            account_id: account.account_id,
            token_hash: token_hash(&token),
            ip_address: ctx.ip_address.clone(),
            user_agent: ctx.user_agent.clone(),
            client_app: self.client_app.clone(),
            created_utc: Utc::now(),
            expires_utc,
            revoked_utc: None,
        };

        self.store.insert_session(&session).await?;
        Ok((session, token))
    }

    /// Two-phase verification: signature/temporal claims first, then the
    /// durable session record. Revocation is out-of-band from the token, so
    /// the second check is mandatory - a validly signed token for a revoked
    /// session must fail here with no propagation delay.
    pub async fn validate(&self, token: &str) -> Result<SessionVerdict, ServiceError> {
        let claims = match self.jwt.decode_session_token(token) {
            Ok(claims) => claims,
            Err(_) => return Ok(SessionVerdict::Rejected(SessionRejection::InvalidToken)),
        };

        let Ok(session_id) = Uuid::parse_str(&claims.sid) else {
            return Ok(SessionVerdict::Rejected(SessionRejection::InvalidToken));
        };

        let Some(session) = self.store.find_session(session_id).await? else {
            return Ok(SessionVerdict::Rejected(SessionRejection::SessionNotFound));
        };

        if session.is_revoked() {
            return Ok(SessionVerdict::Rejected(SessionRejection::SessionRevoked));
        }

        if session.is_expired(Utc::now()) {
            return Ok(SessionVerdict::Rejected(SessionRejection::SessionExpired));
        }

        // The stored hash must match the presented token; a forged or
        // spliced token with a valid-looking sid fails here.
        let presented = token_hash(token);
        let hash_ok: bool = presented
            .as_bytes()
            .ct_eq(session.token_hash.as_bytes())
            .into();
        if !hash_ok {
            return Ok(SessionVerdict::Rejected(SessionRejection::InvalidToken));
        }

        Ok(SessionVerdict::Valid(ValidatedSession {
            account_id: session.account_id,
            session_id: session.session_id,
            role: claims.role,
            expires_utc: session.expires_utc,
        }))
    }

    /// Pure state mutation; already-issued tokens fail validation
    /// immediately afterwards.
    pub async fn revoke(&self, session_id: Uuid) -> Result<bool, ServiceError> {
        self.store.revoke_session(session_id, Utc::now()).await
    }

    pub async fn revoke_all_for_account(&self, account_id: Uuid) -> Result<u64, ServiceError> {
        self.store
            .revoke_sessions_for_account(account_id, Utc::now())
            .await
    }

    /// Physically delete sessions expired longer than `retention_hours` ago.
    pub async fn purge_expired(&self, retention_hours: i64) -> Result<u64, ServiceError> {
        let cutoff = Utc::now() - Duration::hours(retention_hours);
        self.store.purge_expired_sessions(cutoff).await
    }
}
