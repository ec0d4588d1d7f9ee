//! Linked accounts in the external identity provider
//!
//! Provisioning is a best-effort side effect of pushing a user; nothing here
//! is allowed to fail a push.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::User;
use crate::util::{compact_text, is_http_url, sanitize};

static E164_PHONE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+\d{7,15}$").expect("valid E.164 regex"));

/// Account details sent to the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityRequest {
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Only set when the number is valid E.164
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
}

impl IdentityRequest {
    pub fn for_user(user: &User) -> Self {
        Self {
            email: user.email.clone(),
            display_name: user.full_name.clone(),
            phone_number: user.phone.as_deref().and_then(e164_phone),
        }
    }
}

/// Normalize `phone` to E.164, or `None` when it cannot be.
///
/// Spaces, dashes, dots and parentheses are ignored.
pub fn e164_phone(phone: &str) -> Option<String> {
    let compact: String = phone
        .chars()
        .filter(|ch| !matches!(ch, ' ' | '-' | '.' | '(' | ')'))
        .collect();
    E164_PHONE.is_match(&compact).then_some(compact)
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Identity provider unavailable: {0}")]
    Unavailable(String),
    #[error("Identity provider rejected the account: {0}")]
    Rejected(String),
    #[error("Invalid identity provider response: {0}")]
    InvalidResponse(String),
}

/// External account provisioning
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Create (or find) the account and return its provider uid
    async fn provision(&self, request: &IdentityRequest) -> Result<String, IdentityError>;
}

#[derive(Clone)]
pub struct HttpIdentityProvider {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpIdentityProvider {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpIdentityProvider")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    uid: String,
}

#[derive(Debug, Deserialize)]
struct AccountList {
    #[serde(default)]
    accounts: Vec<AccountResponse>,
}

impl HttpIdentityProvider {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self, IdentityError> {
        let base_url = base_url.into().trim().trim_end_matches('/').to_string();
        if !is_http_url(&base_url) {
            return Err(IdentityError::InvalidResponse(format!(
                "identity provider URL must start with http:// or https://, got `{base_url}`"
            )));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|error| IdentityError::Unavailable(sanitize(&error)))?;
        Ok(Self {
            base_url,
            token,
            client,
        })
    }

    fn accounts_url(&self) -> String {
        format!("{}/v1/accounts", self.base_url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Look up an existing account by email after a conflict
    async fn find_by_email(&self, email: &str) -> Result<String, IdentityError> {
        let response = self
            .authorize(self.client.get(self.accounts_url()))
            .query(&[("email", email)])
            .send()
            .await
            .map_err(|error| IdentityError::Unavailable(sanitize(&error)))?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        let list = response
            .json::<AccountList>()
            .await
            .map_err(|error| IdentityError::InvalidResponse(sanitize(&error)))?;
        list.accounts
            .into_iter()
            .next()
            .map(|account| account.uid)
            .ok_or_else(|| {
                IdentityError::InvalidResponse("conflict reported but no account found".to_string())
            })
    }
}

async fn status_error(response: reqwest::Response) -> IdentityError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = format!("status {status}: {}", compact_text(&body));
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        IdentityError::Unavailable(message)
    } else {
        IdentityError::Rejected(message)
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn provision(&self, request: &IdentityRequest) -> Result<String, IdentityError> {
        let response = self
            .authorize(self.client.post(self.accounts_url()))
            .json(request)
            .send()
            .await
            .map_err(|error| IdentityError::Unavailable(sanitize(&error)))?;

        if response.status() == StatusCode::CONFLICT {
            return self.find_by_email(&request.email).await;
        }
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        let account = response
            .json::<AccountResponse>()
            .await
            .map_err(|error| IdentityError::InvalidResponse(sanitize(&error)))?;
        Ok(account.uid)
    }
}
