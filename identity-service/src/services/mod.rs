pub mod audit;
pub mod database;
pub mod detector;
pub mod error;
pub mod jwt;
pub mod login;
pub mod migration;
pub mod notify;
pub mod provider;
pub mod rate_limit;
pub mod rollback;
pub mod session;
pub mod store;

pub use audit::AuditLogger;
pub use database::Database;
pub use error::ServiceError;
pub use jwt::JwtService;
pub use login::{LoginService, LoginSuccess};
pub use migration::{AdvanceOutcome, MapOptions, MapOutcome, MigrationReport, MigrationService};
pub use notify::{HttpNotifier, Notifier};
pub use provider::{HttpIdentityProvider, IdentityProvider};
pub use rate_limit::{CounterStore, RedisCounters, WindowLimiter};
pub use rollback::{RollbackReport, RollbackService};
pub use session::{SessionService, SessionVerdict, ValidatedSession};
pub use store::{AuditStore, IdentityStore, MemoryStore};
