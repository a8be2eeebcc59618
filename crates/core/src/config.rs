//! Run configuration.
//!
//! Deserializable from JSON (every field has a default) and validated once,
//! up front, before anything touches the network.

use crate::error::{WardenError, WardenResult};
use crate::types::{ScopeKind, ScopeTarget};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_CONSTRAINT: &str = "constraints/gcp.restrictServiceUsage";
pub const DEFAULT_CLIENT_ID: &str = "warden-web";

/// Services the OAuth setup depends on.
pub const DEFAULT_SERVICES: &[&str] = &[
    "iap.googleapis.com",
    "iam.googleapis.com",
    "cloudresourcemanager.googleapis.com",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    pub project_id: String,
    /// Numeric organization id. Without it the org-level steps are skipped.
    pub organization_id: Option<String>,
    /// The only email domain allowed to perform mutations.
    pub trusted_domain: String,
    pub application_title: String,
    pub support_email: String,
    pub client_id: String,
    pub client_display_name: String,
    pub redirect_uris: Vec<String>,
    pub services: Vec<String>,
    pub constraint: String,
    /// Create the project under the organization when it does not exist.
    pub create_project: bool,
    /// Read-modify-write cycles attempted when a policy token goes stale.
    pub policy_write_attempts: u32,
    pub wait: WaitConfig,
    pub retry: RetryConfig,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            organization_id: None,
            trusted_domain: String::new(),
            application_title: String::new(),
            support_email: String::new(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            client_display_name: "Web client".to_string(),
            redirect_uris: Vec::new(),
            services: DEFAULT_SERVICES.iter().map(|s| s.to_string()).collect(),
            constraint: DEFAULT_CONSTRAINT.to_string(),
            create_project: false,
            policy_write_attempts: 3,
            wait: WaitConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

/// Propagation wait bounds: fixed interval, overall timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitConfig {
    pub timeout_secs: u64,
    pub interval_ms: u64,
}

impl WaitConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            interval_ms: 5_000,
        }
    }
}

/// Gateway retry policy for rate-limited and unavailable calls.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

impl ProvisionConfig {
    pub fn organization_resource(&self) -> Option<String> {
        self.organization_id
            .as_ref()
            .map(|id| format!("organizations/{id}"))
    }

    pub fn project_resource(&self) -> String {
        format!("projects/{}", self.project_id)
    }

    /// Resource a scope level resolves to for this run, if it applies.
    ///
    /// Global and Organization both live on the organization node; without an
    /// organization only Project scope exists.
    pub fn scope_target(&self, kind: ScopeKind) -> Option<ScopeTarget> {
        match kind {
            ScopeKind::Global | ScopeKind::Organization => self
                .organization_resource()
                .map(|resource| ScopeTarget::new(kind, resource)),
            ScopeKind::Project => Some(ScopeTarget::new(kind, self.project_resource())),
        }
    }

    pub fn validate(&self) -> WardenResult<()> {
        validate_project_id(&self.project_id)?;

        if let Some(org) = &self.organization_id {
            if org.is_empty() || !org.chars().all(|c| c.is_ascii_digit()) {
                return Err(invalid(format!("organization id `{org}` must be numeric")));
            }
        }
        if self.trusted_domain.trim().is_empty() || !self.trusted_domain.contains('.') {
            return Err(invalid(format!(
                "trusted domain `{}` is not a domain name",
                self.trusted_domain
            )));
        }
        if self.application_title.trim().is_empty() {
            return Err(invalid("application title must not be empty"));
        }
        validate_email(&self.support_email)?;
        validate_client_id(&self.client_id)?;

        if self.redirect_uris.is_empty() {
            return Err(invalid("at least one redirect URI is required"));
        }
        for uri in &self.redirect_uris {
            validate_redirect_uri(uri)?;
        }
        if self.services.iter().any(|s| s.trim().is_empty()) {
            return Err(invalid("service names must not be empty"));
        }
        if self.create_project && self.organization_id.is_none() {
            return Err(invalid("creating a project requires an organization id"));
        }
        if self.policy_write_attempts == 0 || self.retry.max_attempts == 0 {
            return Err(invalid("attempt counts must be at least 1"));
        }
        if self.wait.interval_ms == 0 || self.wait.interval() > self.wait.timeout() {
            return Err(invalid("wait interval must be non-zero and shorter than the timeout"));
        }
        if self.retry.multiplier < 1.0 {
            return Err(invalid("retry multiplier must be >= 1.0"));
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> WardenError {
    WardenError::Validation(msg.into())
}

/// 6-30 chars, lowercase letter first, `[a-z0-9-]`, no trailing hyphen.
fn validate_project_id(id: &str) -> WardenResult<()> {
    let ok = (6..=30).contains(&id.len())
        && id.starts_with(|c: char| c.is_ascii_lowercase())
        && !id.ends_with('-')
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if ok {
        Ok(())
    } else {
        Err(invalid(format!("`{id}` is not a valid project id")))
    }
}

fn validate_client_id(id: &str) -> WardenResult<()> {
    let ok = (6..=63).contains(&id.len())
        && id.starts_with(|c: char| c.is_ascii_lowercase())
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if ok {
        Ok(())
    } else {
        Err(invalid(format!("`{id}` is not a valid OAuth client id")))
    }
}

fn validate_email(email: &str) -> WardenResult<()> {
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') && !domain.contains('@') => Ok(()),
        _ => Err(invalid(format!("`{email}` is not an email address"))),
    }
}

/// HTTPS only, except plain HTTP on loopback for local development.
fn validate_redirect_uri(uri: &str) -> WardenResult<()> {
    let parsed = url::Url::parse(uri).map_err(|e| invalid(format!("redirect URI `{uri}`: {e}")))?;

    if parsed.fragment().is_some() {
        return Err(invalid(format!("redirect URI `{uri}` must not contain a fragment")));
    }
    let loopback = matches!(parsed.host_str(), Some("localhost" | "127.0.0.1" | "[::1]"));
    match parsed.scheme() {
        "https" => Ok(()),
        "http" if loopback => Ok(()),
        scheme => Err(invalid(format!(
            "redirect URI `{uri}` uses `{scheme}`; only https (or http on loopback) is allowed"
        ))),
    }
}
