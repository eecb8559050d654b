pub mod account;
pub mod audit_event;
pub mod cohort;
pub mod provider;
pub mod session;
pub mod single_use_token;

pub use account::{Account, AccountResponse, AccountStatus, CredentialMode, Role};
pub use audit_event::{AuditAction, AuditActor, AuditDraft, AuditEvent, GENESIS_HASH};
pub use cohort::MigrationCohort;
pub use provider::{ProviderPage, ProviderUser};
pub use session::{ClientContext, Session};
pub use single_use_token::{SingleUseToken, TokenPurpose};
