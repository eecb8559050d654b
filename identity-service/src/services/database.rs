//! PostgreSQL implementation of the durable stores.

use async_trait::async_trait;
use chrono::{DateTime, DurationRound, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::models::{
    Account, AccountStatus, AuditDraft, AuditEvent, CredentialMode, MigrationCohort, Session,
    SingleUseToken, TokenPurpose,
};
use crate::services::audit::seal_entry;
use crate::services::store::{AuditStore, IdentityStore, MigrationUpdate};
use crate::services::ServiceError;

/// Advisory lock key serializing audit appends across all connections.
const AUDIT_CHAIN_LOCK: i64 = 0x41554449;

const ACCOUNT_COLUMNS: &str = "account_id, email, first_name, last_name, password_hash, \
     role_code, status_code, failed_attempts, locked_until, last_login_utc, last_login_ip, \
     credential_mode_code, migrated_utc, migrated_by, migration_notes, provider_metadata, \
     created_utc, updated_utc";

const SESSION_COLUMNS: &str = "session_id, account_id, token_hash, ip_address, user_agent, \
     client_app, created_utc, expires_utc, revoked_utc";

const TOKEN_COLUMNS: &str = "token_id, account_id, purpose_code, salt, secret_hash, \
     requested_ip, expires_utc, used_utc, used_by_ip, created_utc";

const AUDIT_COLUMNS: &str = "event_id, chain_seq, actor_id, actor_email, actor_role, \
     ip_address, action_code, resource_type, resource_id, previous_state, new_state, metadata, \
     created_utc, previous_hash, entry_hash";

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    #[instrument(skip(config), fields(service = "identity-service"))]
    pub async fn new(config: &DatabaseConfig) -> Result<Self, ServiceError> {
        info!(
            max_connections = config.max_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(&config.url)
            .await?;

        info!("PostgreSQL connection pool established");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), ServiceError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), ServiceError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl IdentityStore for Database {
    async fn insert_account(&self, account: &Account) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            INSERT INTO accounts (account_id, email, first_name, last_name, password_hash,
                role_code, status_code, failed_attempts, locked_until, last_login_utc,
                last_login_ip, credential_mode_code, migrated_utc, migrated_by,
                migration_notes, provider_metadata, created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(account.account_id)
        .bind(&account.email)
        .bind(&account.first_name)
        .bind(&account.last_name)
        .bind(&account.password_hash)
        .bind(&account.role_code)
        .bind(&account.status_code)
        .bind(account.failed_attempts)
        .bind(account.locked_until)
        .bind(account.last_login_utc)
        .bind(&account.last_login_ip)
        .bind(&account.credential_mode_code)
        .bind(account.migrated_utc)
        .bind(&account.migrated_by)
        .bind(&account.migration_notes)
        .bind(&account.provider_metadata)
        .bind(account.created_utc)
        .bind(account.updated_utc)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                ServiceError::EmailConflict
            }
            _ => ServiceError::Database(e),
        })?;

        Ok(())
    }

    async fn find_account_by_id(&self, account_id: Uuid) -> Result<Option<Account>, ServiceError> {
        let account = sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE account_id = $1"
        ))
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(account)
    }

    async fn find_account_by_email(&self, email: &str) -> Result<Option<Account>, ServiceError> {
        let account = sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE lower(email) = lower($1)"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(account)
    }

    async fn record_login_failure(&self, account_id: Uuid) -> Result<i32, ServiceError> {
        // Single-statement increment: concurrent failures each observe their
        // own distinct count.
        let row = sqlx::query(
            r#"
            UPDATE accounts
            SET failed_attempts = failed_attempts + 1, updated_utc = now()
            WHERE account_id = $1
            RETURNING failed_attempts
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(ServiceError::AccountNotFound)?;

        Ok(row.get("failed_attempts"))
    }

    async fn set_lockout(
        &self,
        account_id: Uuid,
        until: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        let result = sqlx::query(
            "UPDATE accounts SET locked_until = $2, updated_utc = now() WHERE account_id = $1",
        )
        .bind(account_id)
        .bind(until)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ServiceError::AccountNotFound);
        }
        Ok(())
    }

    async fn record_login_success(
        &self,
        account_id: Uuid,
        ip: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET failed_attempts = 0, locked_until = NULL,
                last_login_utc = $2, last_login_ip = $3, updated_utc = $2
            WHERE account_id = $1
            "#,
        )
        .bind(account_id)
        .bind(now)
        .bind(ip)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ServiceError::AccountNotFound);
        }
        Ok(())
    }

    async fn apply_migration(&self, update: &MigrationUpdate) -> Result<(), ServiceError> {
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET credential_mode_code = $2,
                status_code = COALESCE($3, status_code),
                first_name = COALESCE($4, first_name),
                last_name = COALESCE($5, last_name),
                provider_metadata = $6,
                migrated_utc = $7,
                migrated_by = $8,
                migration_notes = $9,
                updated_utc = now()
            WHERE account_id = $1
            "#,
        )
        .bind(update.account_id)
        .bind(update.credential_mode.as_str())
        .bind(update.status.map(|s| s.as_str()))
        .bind(&update.first_name)
        .bind(&update.last_name)
        .bind(&update.provider_metadata)
        .bind(update.migrated_utc)
        .bind(&update.migrated_by)
        .bind(&update.notes)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ServiceError::AccountNotFound);
        }
        Ok(())
    }

    async fn clear_migration(
        &self,
        account_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        let result = sqlx::query(
            r#"
            UPDATE accounts
            SET credential_mode_code = $2, status_code = $3, password_hash = NULL,
                migrated_utc = NULL, migrated_by = NULL, migration_notes = NULL,
                provider_metadata = NULL, failed_attempts = 0, locked_until = NULL,
                updated_utc = $4
            WHERE account_id = $1
            "#,
        )
        .bind(account_id)
        .bind(CredentialMode::Provider.as_str())
        .bind(AccountStatus::Active.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ServiceError::AccountNotFound);
        }
        Ok(())
    }

    async fn find_migrated_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Account>, ServiceError> {
        let accounts = sqlx::query_as::<_, Account>(&format!(
            r#"
            SELECT {ACCOUNT_COLUMNS} FROM accounts
            WHERE migrated_utc >= $1 AND migrated_utc < $2
            ORDER BY migrated_utc
            "#
        ))
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(accounts)
    }

    async fn insert_session(&self, session: &Session) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            INSERT INTO sessions (session_id, account_id, token_hash, ip_address, user_agent,
                client_app, created_utc, expires_utc, revoked_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(session.session_id)
        .bind(session.account_id)
        .bind(&session.token_hash)
        .bind(&session.ip_address)
        .bind(&session.user_agent)
        .bind(&session.client_app)
        .bind(session.created_utc)
        .bind(session.expires_utc)
        .bind(session.revoked_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_session(&self, session_id: Uuid) -> Result<Option<Session>, ServiceError> {
        let session = sqlx::query_as::<_, Session>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = $1"
        ))
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(session)
    }

    async fn revoke_session(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, ServiceError> {
        let result = sqlx::query(
            "UPDATE sessions SET revoked_utc = $2 WHERE session_id = $1 AND revoked_utc IS NULL",
        )
        .bind(session_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn revoke_sessions_for_account(
        &self,
        account_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<u64, ServiceError> {
        let result = sqlx::query(
            "UPDATE sessions SET revoked_utc = $2 WHERE account_id = $1 AND revoked_utc IS NULL",
        )
        .bind(account_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn recent_sessions(
        &self,
        account_id: Uuid,
        limit: i64,
    ) -> Result<Vec<Session>, ServiceError> {
        let sessions = sqlx::query_as::<_, Session>(&format!(
            r#"
            SELECT {SESSION_COLUMNS} FROM sessions
            WHERE account_id = $1
            ORDER BY created_utc DESC
            LIMIT $2
            "#
        ))
        .bind(account_id)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;
        Ok(sessions)
    }

    async fn purge_expired_sessions(&self, cutoff: DateTime<Utc>) -> Result<u64, ServiceError> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_utc < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_token(&self, token: &SingleUseToken) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            INSERT INTO single_use_tokens (token_id, account_id, purpose_code, salt,
                secret_hash, requested_ip, expires_utc, used_utc, used_by_ip, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(token.token_id)
        .bind(token.account_id)
        .bind(&token.purpose_code)
        .bind(&token.salt)
        .bind(&token.secret_hash)
        .bind(&token.requested_ip)
        .bind(token.expires_utc)
        .bind(token.used_utc)
        .bind(&token.used_by_ip)
        .bind(token.created_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_token(&self, token_id: Uuid) -> Result<Option<SingleUseToken>, ServiceError> {
        let token = sqlx::query_as::<_, SingleUseToken>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM single_use_tokens WHERE token_id = $1"
        ))
        .bind(token_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(token)
    }

    async fn invalidate_tokens(
        &self,
        account_id: Uuid,
        purpose: TokenPurpose,
        now: DateTime<Utc>,
    ) -> Result<u64, ServiceError> {
        let result = sqlx::query(
            r#"
            UPDATE single_use_tokens
            SET expires_utc = $3
            WHERE account_id = $1 AND purpose_code = $2
              AND used_utc IS NULL AND expires_utc > $3
            "#,
        )
        .bind(account_id)
        .bind(purpose.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn consume_token_and_set_password(
        &self,
        token_id: Uuid,
        used_by_ip: &str,
        password_hash: &str,
        new_status: AccountStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, ServiceError> {
        let mut tx = self.pool.begin().await?;

        // The guarded UPDATE is the single winner-selection step: of two
        // concurrent consumers, exactly one sees used_utc still NULL.
        let consumed = sqlx::query(
            r#"
            UPDATE single_use_tokens
            SET used_utc = $2, used_by_ip = $3
            WHERE token_id = $1 AND used_utc IS NULL AND expires_utc > $2
            RETURNING account_id
            "#,
        )
        .bind(token_id)
        .bind(now)
        .bind(used_by_ip)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = consumed else {
            tx.rollback().await?;
            return Ok(false);
        };
        let account_id: Uuid = row.get("account_id");

        sqlx::query(
            r#"
            UPDATE accounts
            SET password_hash = $2, status_code = $3, updated_utc = $4
            WHERE account_id = $1
            "#,
        )
        .bind(account_id)
        .bind(password_hash)
        .bind(new_status.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn list_cohorts(&self) -> Result<Vec<MigrationCohort>, ServiceError> {
        let cohorts = sqlx::query_as::<_, MigrationCohort>(
            r#"
            SELECT cohort_tag, position, member_emails, completed_utc
            FROM migration_cohorts
            ORDER BY position
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(cohorts)
    }

    async fn complete_cohort(
        &self,
        cohort_tag: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        sqlx::query("UPDATE migration_cohorts SET completed_utc = $2 WHERE cohort_tag = $1")
            .bind(cohort_tag)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl AuditStore for Database {
    async fn append_event(&self, draft: AuditDraft) -> Result<AuditEvent, ServiceError> {
        let mut tx = self.pool.begin().await?;

        // Transaction-scoped advisory lock: "read last hash, insert next
        // entry" is serialized across every connection. The unique chain_seq
        // constraint backstops it.
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(AUDIT_CHAIN_LOCK)
            .execute(&mut *tx)
            .await?;

        let last = sqlx::query(
            "SELECT entry_hash, chain_seq FROM audit_events ORDER BY chain_seq DESC LIMIT 1",
        )
        .fetch_optional(&mut *tx)
        .await?;

        let (previous_hash, chain_seq) = match last {
            Some(row) => (
                Some(row.get::<String, _>("entry_hash")),
                row.get::<i64, _>("chain_seq") + 1,
            ),
            None => (None, 1),
        };

        // TIMESTAMPTZ stores microseconds; sealing with sub-microsecond
        // precision would make the persisted entry hash unrecomputable.
        let now = Utc::now()
            .duration_trunc(chrono::Duration::microseconds(1))
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("clock truncation: {e}")))?;
        let event = seal_entry(draft, previous_hash, chain_seq, now);

        sqlx::query(
            r#"
            INSERT INTO audit_events (event_id, chain_seq, actor_id, actor_email, actor_role,
                ip_address, action_code, resource_type, resource_id, previous_state, new_state,
                metadata, created_utc, previous_hash, entry_hash)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(event.event_id)
        .bind(event.chain_seq)
        .bind(event.actor_id)
        .bind(&event.actor_email)
        .bind(&event.actor_role)
        .bind(&event.ip_address)
        .bind(&event.action_code)
        .bind(&event.resource_type)
        .bind(&event.resource_id)
        .bind(&event.previous_state)
        .bind(&event.new_state)
        .bind(&event.metadata)
        .bind(event.created_utc)
        .bind(&event.previous_hash)
        .bind(&event.entry_hash)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(event)
    }

    async fn load_chain(&self) -> Result<Vec<AuditEvent>, ServiceError> {
        let events = sqlx::query_as::<_, AuditEvent>(&format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_events ORDER BY chain_seq"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }
}
