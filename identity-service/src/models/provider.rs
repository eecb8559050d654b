//! Sanitized records from the external managed identity provider.

use serde::{Deserialize, Serialize};

/// One user as exported from the provider.
///
/// Already sanitized: private metadata and any provider-internal secrets are
/// stripped by the provider client before these records leave that module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderUser {
    pub id: String,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    #[serde(default)]
    pub public_metadata: serde_json::Value,
    /// Milliseconds since epoch, as the provider reports them.
    pub created_at: i64,
    pub last_sign_in_at: Option<i64>,
    pub email_verified: bool,
}

/// One page of the provider's user listing.
#[derive(Debug, Clone)]
pub struct ProviderPage {
    pub users: Vec<ProviderUser>,
    pub next_page_token: Option<String>,
    pub total_count: u64,
}
