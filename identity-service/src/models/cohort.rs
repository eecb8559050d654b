//! Migration cohort model - ordered slices of the account population.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

/// One cohort in the gradual rollout (e.g. pilot -> wave1 -> wave2 -> final).
///
/// Membership is an explicit email list; a null list marks the catch-all
/// cohort that absorbs every remaining unmigrated account.
#[derive(Debug, Clone, FromRow)]
pub struct MigrationCohort {
    pub cohort_tag: String,
    pub position: i32,
    pub member_emails: Option<Vec<String>>,
    pub completed_utc: Option<DateTime<Utc>>,
}

impl MigrationCohort {
    pub fn is_complete(&self) -> bool {
        self.completed_utc.is_some()
    }

    /// Whether a (normalized) email belongs to this cohort.
    pub fn contains(&self, email: &str) -> bool {
        match &self.member_emails {
            Some(members) => members.iter().any(|m| m.eq_ignore_ascii_case(email)),
            None => true,
        }
    }
}
