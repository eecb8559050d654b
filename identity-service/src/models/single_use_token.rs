//! Single-use tokens for account activation and password reset.

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use subtle::ConstantTimeEq;
use uuid::Uuid;

/// What a single-use token is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPurpose {
    Activation,
    PasswordReset,
}

impl TokenPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenPurpose::Activation => "activation",
            TokenPurpose::PasswordReset => "password_reset",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "activation" => Some(TokenPurpose::Activation),
            "password_reset" => Some(TokenPurpose::PasswordReset),
            _ => None,
        }
    }
}

/// Single-use token entity.
///
/// The raw secret is only ever transmitted to the account owner as
/// `"{token_id}.{secret}"`; the table holds a salted SHA-256 of the secret.
/// A token may be consumed at most once; consumption and the paired account
/// mutation happen in one storage transaction.
#[derive(Debug, Clone, FromRow)]
pub struct SingleUseToken {
    pub token_id: Uuid,
    pub account_id: Uuid,
    pub purpose_code: String,
    pub salt: String,
    pub secret_hash: String,
    pub requested_ip: String,
    pub expires_utc: DateTime<Utc>,
    pub used_utc: Option<DateTime<Utc>>,
    pub used_by_ip: Option<String>,
    pub created_utc: DateTime<Utc>,
}

impl SingleUseToken {
    /// Mint a new token. Returns the record to persist plus the raw value to
    /// hand to the account owner (never stored).
    pub fn issue(
        account_id: Uuid,
        purpose: TokenPurpose,
        requested_ip: String,
        ttl_hours: i64,
    ) -> (Self, String) {
        let token_id = Uuid::new_v4();

        let mut secret_bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret_bytes);
        let secret = hex::encode(secret_bytes);

        let mut salt_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt_bytes);
        let salt = hex::encode(salt_bytes);

        let now = Utc::now();
        let record = Self {
            token_id,
            account_id,
            purpose_code: purpose.as_str().to_string(),
            secret_hash: hash_secret(&salt, &secret),
            salt,
            requested_ip,
            expires_utc: now + Duration::hours(ttl_hours),
            used_utc: None,
            used_by_ip: None,
            created_utc: now,
        };

        let raw = format!("{}.{}", token_id, secret);
        (record, raw)
    }

    pub fn purpose(&self) -> Option<TokenPurpose> {
        TokenPurpose::parse(&self.purpose_code)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_utc <= now
    }

    pub fn is_used(&self) -> bool {
        self.used_utc.is_some()
    }

    /// Constant-time check of a presented secret against the stored hash.
    pub fn matches_secret(&self, secret: &str) -> bool {
        let presented = hash_secret(&self.salt, secret);
        presented.as_bytes().ct_eq(self.secret_hash.as_bytes()).into()
    }
}

/// Split a raw `"{token_id}.{secret}"` value into its parts.
pub fn parse_raw_token(raw: &str) -> Option<(Uuid, &str)> {
    let (id, secret) = raw.split_once('.')?;
    let token_id = Uuid::parse_str(id).ok()?;
    if secret.is_empty() {
        return None;
    }
    Some((token_id, secret))
}

fn hash_secret(salt: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}
