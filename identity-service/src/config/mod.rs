use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub jwt: JwtConfig,
    pub provider: ProviderConfig,
    pub notifications: NotificationConfig,
    pub security: SecurityConfig,
    pub rate_limit: RateLimitConfig,
    pub lockout: LockoutSchedule,
    pub migration: MigrationConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub private_key_path: String,
    pub public_key_path: String,
    pub issuer: String,
    pub audience: String,
    pub session_ttl_hours: i64,
}

/// External managed identity provider (the system accounts migrate away
/// from).
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: String,
    pub request_timeout_seconds: u64,
    pub page_size: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    pub base_url: String,
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
    /// Name of the session cookie set on login.
    pub session_cookie: String,
    /// Hours a session row is retained after expiry before physical purge.
    pub session_retention_hours: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub login_attempts: u32,
    pub login_window_seconds: u64,
    pub password_reset_attempts: u32,
    pub password_reset_window_seconds: u64,
    pub global_ip_limit: u32,
    pub global_ip_window_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MigrationConfig {
    /// Accounts mapped per batch before yielding.
    pub batch_size: usize,
    /// Actor string recorded when no admin is attributable (scheduled runs).
    pub default_actor: String,
}

/// Progressive lockout schedule: failure-count thresholds mapped to lock
/// durations, parsed from `LOCKOUT_SCHEDULE` as `count:minutes` pairs
/// (e.g. `5:15,10:60,15:240,20:1440`). Pairs must be in strictly
/// increasing order on both sides.
#[derive(Debug, Clone, Deserialize)]
pub struct LockoutSchedule {
    tiers: Vec<(i32, i64)>,
}

impl LockoutSchedule {
    pub fn parse(spec: &str) -> Result<Self, AppError> {
        let mut tiers = Vec::new();
        for pair in spec.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (count, minutes) = pair.split_once(':').ok_or_else(|| {
                AppError::ConfigError(anyhow::anyhow!(
                    "LOCKOUT_SCHEDULE entry '{}' is not count:minutes",
                    pair
                ))
            })?;
            let count: i32 = count.trim().parse().map_err(|e| {
                AppError::ConfigError(anyhow::anyhow!("Bad lockout threshold '{}': {}", count, e))
            })?;
            let minutes: i64 = minutes.trim().parse().map_err(|e| {
                AppError::ConfigError(anyhow::anyhow!("Bad lockout duration '{}': {}", minutes, e))
            })?;
            if count <= 0 || minutes <= 0 {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "LOCKOUT_SCHEDULE entries must be positive: '{}'",
                    pair
                )));
            }
            tiers.push((count, minutes));
        }

        if tiers.is_empty() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "LOCKOUT_SCHEDULE must contain at least one tier"
            )));
        }

        let ordered = tiers
            .windows(2)
            .all(|w| w[0].0 < w[1].0 && w[0].1 < w[1].1);
        if !ordered {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "LOCKOUT_SCHEDULE tiers must strictly increase"
            )));
        }

        Ok(Self { tiers })
    }

    /// Lock duration in minutes for a failure count, or `None` below the
    /// first threshold.
    pub fn lock_duration_minutes(&self, failed_attempts: i32) -> Option<i64> {
        self.tiers
            .iter()
            .rev()
            .find(|(count, _)| failed_attempts >= *count)
            .map(|(_, minutes)| *minutes)
    }

    /// True exactly when `failed_attempts` sits on a tier boundary. Lockout
    /// audit events fire only at these crossings, not on every locked-out
    /// attempt.
    pub fn is_threshold(&self, failed_attempts: i32) -> bool {
        self.tiers.iter().any(|(count, _)| failed_attempts == *count)
    }
}

impl IdentityConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let config = IdentityConfig {
            common: common_config,
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some("identity-service"), is_prod)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", None, is_prod)?,
                max_connections: get_env("DATABASE_MAX_CONNECTIONS", Some("10"), is_prod)?
                    .parse()
                    .unwrap_or(10),
            },
            redis: RedisConfig {
                url: get_env("REDIS_URL", None, is_prod)?,
            },
            jwt: JwtConfig {
                private_key_path: get_env("JWT_PRIVATE_KEY_PATH", None, is_prod)?,
                public_key_path: get_env("JWT_PUBLIC_KEY_PATH", None, is_prod)?,
                issuer: get_env("JWT_ISSUER", Some("identity-service"), is_prod)?,
                audience: get_env("JWT_AUDIENCE", Some("compliance-app"), is_prod)?,
                session_ttl_hours: get_env("SESSION_TTL_HOURS", Some("8"), is_prod)?
                    .parse()
                    .map_err(|e: std::num::ParseIntError| {
                        AppError::ConfigError(anyhow::anyhow!(e.to_string()))
                    })?,
            },
            provider: ProviderConfig {
                base_url: get_env("PROVIDER_BASE_URL", None, is_prod)?,
                api_key: get_env("PROVIDER_API_KEY", None, is_prod)?,
                request_timeout_seconds: get_env(
                    "PROVIDER_REQUEST_TIMEOUT_SECONDS",
                    Some("15"),
                    is_prod,
                )?
                .parse()
                .unwrap_or(15),
                page_size: get_env("PROVIDER_PAGE_SIZE", Some("100"), is_prod)?
                    .parse()
                    .unwrap_or(100),
            },
            notifications: NotificationConfig {
                base_url: get_env(
                    "NOTIFICATION_SERVICE_URL",
                    Some("http://localhost:8086"),
                    is_prod,
                )?,
                request_timeout_seconds: get_env(
                    "NOTIFICATION_REQUEST_TIMEOUT_SECONDS",
                    Some("10"),
                    is_prod,
                )?
                .parse()
                .unwrap_or(10),
            },
            security: SecurityConfig {
                allowed_origins: get_env(
                    "ALLOWED_ORIGINS",
                    Some("http://localhost:3000"),
                    is_prod,
                )?
                .split(',')
                .map(|s| s.trim().to_string())
                .collect(),
                session_cookie: get_env("SESSION_COOKIE_NAME", Some("compliance_session"), is_prod)?,
                session_retention_hours: get_env("SESSION_RETENTION_HOURS", Some("720"), is_prod)?
                    .parse()
                    .unwrap_or(720),
            },
            rate_limit: RateLimitConfig {
                login_attempts: get_env("RATE_LIMIT_LOGIN_ATTEMPTS", Some("10"), is_prod)?
                    .parse()
                    .unwrap_or(10),
                login_window_seconds: get_env(
                    "RATE_LIMIT_LOGIN_WINDOW_SECONDS",
                    Some("900"),
                    is_prod,
                )?
                .parse()
                .unwrap_or(900),
                password_reset_attempts: get_env(
                    "RATE_LIMIT_PASSWORD_RESET_ATTEMPTS",
                    Some("3"),
                    is_prod,
                )?
                .parse()
                .unwrap_or(3),
                password_reset_window_seconds: get_env(
                    "RATE_LIMIT_PASSWORD_RESET_WINDOW_SECONDS",
                    Some("3600"),
                    is_prod,
                )?
                .parse()
                .unwrap_or(3600),
                global_ip_limit: get_env("RATE_LIMIT_GLOBAL_IP_LIMIT", Some("100"), is_prod)?
                    .parse()
                    .unwrap_or(100),
                global_ip_window_seconds: get_env(
                    "RATE_LIMIT_GLOBAL_IP_WINDOW_SECONDS",
                    Some("60"),
                    is_prod,
                )?
                .parse()
                .unwrap_or(60),
            },
            lockout: LockoutSchedule::parse(&get_env(
                "LOCKOUT_SCHEDULE",
                Some("5:15,10:60,15:240,20:1440"),
                is_prod,
            )?)?,
            migration: MigrationConfig {
                batch_size: get_env("MIGRATION_BATCH_SIZE", Some("100"), is_prod)?
                    .parse()
                    .unwrap_or(100),
                default_actor: get_env("MIGRATION_DEFAULT_ACTOR", Some("system"), is_prod)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        if self.jwt.session_ttl_hours <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "SESSION_TTL_HOURS must be positive"
            )));
        }

        if self.migration.batch_size == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "MIGRATION_BATCH_SIZE must be greater than 0"
            )));
        }

        if self.environment == Environment::Prod
            && self.security.allowed_origins.iter().any(|o| o == "*")
        {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "Wildcard CORS origin not allowed in production"
            )));
        }

        Ok(())
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule_escalates() {
        let schedule = LockoutSchedule::parse("5:15,10:60,15:240,20:1440").unwrap();

        assert_eq!(schedule.lock_duration_minutes(4), None);
        assert_eq!(schedule.lock_duration_minutes(5), Some(15));
        assert_eq!(schedule.lock_duration_minutes(9), Some(15));
        assert_eq!(schedule.lock_duration_minutes(10), Some(60));
        assert_eq!(schedule.lock_duration_minutes(15), Some(240));
        assert_eq!(schedule.lock_duration_minutes(20), Some(1440));
        assert_eq!(schedule.lock_duration_minutes(25), Some(1440));
    }

    #[test]
    fn thresholds_fire_only_at_exact_crossings() {
        let schedule = LockoutSchedule::parse("5:15,10:60").unwrap();

        assert!(schedule.is_threshold(5));
        assert!(schedule.is_threshold(10));
        assert!(!schedule.is_threshold(6));
        assert!(!schedule.is_threshold(11));
    }

    #[test]
    fn rejects_unordered_tiers() {
        assert!(LockoutSchedule::parse("10:60,5:15").is_err());
        assert!(LockoutSchedule::parse("5:60,10:15").is_err());
        assert!(LockoutSchedule::parse("").is_err());
        assert!(LockoutSchedule::parse("5").is_err());
        assert!(LockoutSchedule::parse("0:10").is_err());
    }
}
