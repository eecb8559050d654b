//! Client for the external managed identity provider.
//!
//! The provider is an opaque upstream: this module only pages through its
//! user list and fetches single users, sanitizing records (stripping private
//! metadata) before they reach the rest of the crate.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::config::ProviderConfig;
use crate::models::{ProviderPage, ProviderUser};
use crate::services::ServiceError;

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// One page of the provider's full user list.
    async fn list_users(&self, page_token: Option<String>) -> Result<ProviderPage, ServiceError>;

    /// Fetch one user by provider ID; `None` when the provider reports
    /// not-found.
    async fn get_user(&self, id: &str) -> Result<Option<ProviderUser>, ServiceError>;
}

/// Wire shape of a provider user, including fields we refuse to carry
/// forward.
#[derive(Debug, Deserialize)]
struct RawProviderUser {
    id: String,
    email: String,
    first_name: Option<String>,
    last_name: Option<String>,
    phone: Option<String>,
    #[serde(default)]
    public_metadata: serde_json::Value,
    #[serde(default)]
    #[allow(dead_code)]
    private_metadata: serde_json::Value,
    created_at: i64,
    last_sign_in_at: Option<i64>,
    #[serde(default)]
    email_verified: bool,
}

impl RawProviderUser {
    /// Drop provider-internal fields before the record leaves this module.
    fn sanitize(self) -> ProviderUser {
        ProviderUser {
            id: self.id,
            email: self.email,
            first_name: self.first_name,
            last_name: self.last_name,
            phone: self.phone,
            public_metadata: self.public_metadata,
            created_at: self.created_at,
            last_sign_in_at: self.last_sign_in_at,
            email_verified: self.email_verified,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListUsersResponse {
    users: Vec<RawProviderUser>,
    next_page_token: Option<String>,
    total_count: u64,
}

#[derive(Clone)]
pub struct HttpIdentityProvider {
    client: reqwest::Client,
    base_url: String,
    page_size: u32,
}

impl HttpIdentityProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self, anyhow::Error> {
        let mut headers = reqwest::header::HeaderMap::new();
        let mut auth = reqwest::header::HeaderValue::from_str(&format!(
            "Bearer {}",
            config.api_key
        ))
        .map_err(|e| anyhow::anyhow!("Invalid provider API key: {}", e))?;
        auth.set_sensitive(true);
        headers.insert(reqwest::header::AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .default_headers(headers)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build provider client: {}", e))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            page_size: config.page_size,
        })
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn list_users(&self, page_token: Option<String>) -> Result<ProviderPage, ServiceError> {
        let mut request = self
            .client
            .get(format!("{}/users", self.base_url))
            .query(&[("page_size", self.page_size.to_string())]);
        if let Some(token) = page_token {
            request = request.query(&[("page_token", token)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ServiceError::Upstream(format!("list_users request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(ServiceError::Upstream(format!(
                "list_users returned {}",
                response.status()
            )));
        }

        let body: ListUsersResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::Upstream(format!("malformed list_users response: {e}")))?;

        Ok(ProviderPage {
            users: body.users.into_iter().map(RawProviderUser::sanitize).collect(),
            next_page_token: body.next_page_token,
            total_count: body.total_count,
        })
    }

    async fn get_user(&self, id: &str) -> Result<Option<ProviderUser>, ServiceError> {
        let response = self
            .client
            .get(format!("{}/users/{}", self.base_url, id))
            .send()
            .await
            .map_err(|e| ServiceError::Upstream(format!("get_user request failed: {e}")))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if !response.status().is_success() {
            return Err(ServiceError::Upstream(format!(
                "get_user returned {}",
                response.status()
            )));
        }

        let raw: RawProviderUser = response
            .json()
            .await
            .map_err(|e| ServiceError::Upstream(format!("malformed get_user response: {e}")))?;

        Ok(Some(raw.sanitize()))
    }
}

/// In-memory provider for tests.
#[derive(Default)]
pub struct MockIdentityProvider {
    pub users: Vec<ProviderUser>,
    pub page_size: usize,
    /// When set, every call fails as if the provider were down.
    pub unavailable: bool,
}

impl MockIdentityProvider {
    pub fn with_users(users: Vec<ProviderUser>) -> Self {
        Self {
            users,
            page_size: 2,
            unavailable: false,
        }
    }
}

#[async_trait]
impl IdentityProvider for MockIdentityProvider {
    async fn list_users(&self, page_token: Option<String>) -> Result<ProviderPage, ServiceError> {
        if self.unavailable {
            return Err(ServiceError::Upstream("provider unavailable".to_string()));
        }

        let page_size = self.page_size.max(1);
        let offset = match page_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| ServiceError::Upstream("bad page token".to_string()))?,
            None => 0,
        };

        let users: Vec<ProviderUser> =
            self.users.iter().skip(offset).take(page_size).cloned().collect();
        let next = offset + users.len();
        let next_page_token = (next < self.users.len()).then(|| next.to_string());

        Ok(ProviderPage {
            users,
            next_page_token,
            total_count: self.users.len() as u64,
        })
    }

    async fn get_user(&self, id: &str) -> Result<Option<ProviderUser>, ServiceError> {
        if self.unavailable {
            return Err(ServiceError::Upstream("provider unavailable".to_string()));
        }
        Ok(self.users.iter().find(|u| u.id == id).cloned())
    }
}
