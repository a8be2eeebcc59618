//! Identity sources for the acting principal.

use crate::gcp::{parse_error_body, transport_error};
use crate::retry::RetryPolicy;
use crate::{classify, ops, IdentityProvider};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use warden_core::error::{ApiError, ApiResult};
use warden_core::{ErrorKind, Secret, TrustKind};

pub const DEFAULT_TOKEN_INFO_URL: &str = "https://oauth2.googleapis.com/tokeninfo";

#[derive(Debug, Deserialize)]
struct TokenInfo {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    email_verified: Option<String>,
}

/// Resolves the principal behind an OAuth access token via the token info
/// endpoint. The token needs the `email` scope for the address to be returned.
pub struct TokenInfoIdentity {
    client: Client,
    token: Secret,
    url: String,
    trust: TrustKind,
    retry: RetryPolicy,
}

impl TokenInfoIdentity {
    pub fn new(access_token: Secret, trust: TrustKind, retry: RetryPolicy) -> ApiResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| ApiError::new(ops::TOKEN_INFO, ErrorKind::Other, e.to_string()))?;
        Ok(Self {
            client,
            token: access_token,
            url: DEFAULT_TOKEN_INFO_URL.to_string(),
            trust,
            retry,
        })
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// The token goes in the form body, never in the URL.
    async fn lookup(&self) -> ApiResult<TokenInfo> {
        let op = ops::TOKEN_INFO;
        let response = self
            .client
            .post(self.url.as_str())
            .form(&[("access_token", self.token.expose())])
            .send()
            .await
            .map_err(|e| transport_error(op, e))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| transport_error(op, e))?;

        if !status.is_success() {
            let (rpc_status, message) = parse_error_body(&text);
            let kind = classify(Some(status.as_u16()), rpc_status.as_deref(), &message);
            return Err(ApiError::new(op, kind, message));
        }

        serde_json::from_str(&text)
            .map_err(|e| ApiError::new(op, ErrorKind::Other, format!("unexpected token info: {e}")))
    }
}

#[async_trait]
impl IdentityProvider for TokenInfoIdentity {
    async fn current_principal_email(&self) -> ApiResult<String> {
        let info = self.retry.run(ops::TOKEN_INFO, || self.lookup()).await?;

        if info.email_verified.as_deref() == Some("false") {
            return Err(ApiError::new(
                ops::TOKEN_INFO,
                ErrorKind::Reauthenticate,
                "token email is not verified",
            ));
        }
        info.email.filter(|e| !e.is_empty()).ok_or_else(|| {
            ApiError::new(
                ops::TOKEN_INFO,
                ErrorKind::Other,
                "token carries no email; request the `email` scope",
            )
        })
    }

    fn trust_kind(&self) -> TrustKind {
        self.trust
    }
}

/// Fixed identity, for dry runs and tests.
#[derive(Debug, Clone)]
pub struct StaticIdentity {
    email: String,
    trust: TrustKind,
}

impl StaticIdentity {
    pub fn new(email: impl Into<String>, trust: TrustKind) -> Self {
        Self {
            email: email.into(),
            trust,
        }
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn current_principal_email(&self) -> ApiResult<String> {
        Ok(self.email.clone())
    }

    fn trust_kind(&self) -> TrustKind {
        self.trust
    }
}
