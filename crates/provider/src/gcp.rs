//! Google Cloud REST gateway backed by reqwest.
//!
//! Covers Cloud Resource Manager v3 (permissions, IAM policy, projects),
//! Org Policy v2, Service Usage v1, IAP brands (consent screen), and IAM
//! OAuth clients with their credentials.
//!
//! ```ignore
//! let gateway = GcpGateway::new(Secret::new(token), RetryPolicy::default())?;
//! let granted = gateway.test_permissions(&scope, &wanted).await?;
//! ```

use crate::classify::classify;
use crate::retry::RetryPolicy;
use crate::{ops, ResourceApi};
use async_trait::async_trait;
use reqwest::{Client, Method, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use warden_core::error::{ApiError, ApiResult};
use warden_core::types::{BindingCondition, ConditionalRule};
use warden_core::{
    ClientKey, ConsentScreen, ConsentScreenSpec, ConstraintPolicy, ConstraintRule, ErrorKind,
    OAuthClient, OAuthClientSpec, PermissionId, PolicyBinding, PolicyDocument, PolicyToken, Project,
    RoleBundle, ScopeTarget, Secret,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Requested so conditional bindings round-trip intact.
const IAM_POLICY_VERSION: u32 = 3;

/// `testIamPermissions` accepts at most 100 permissions per request.
const MAX_PERMISSIONS_PER_TEST: usize = 100;

const SERVICES_PAGE_SIZE: &str = "200";

/// API base URLs. Overridable so tests can point everything at a mock server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub resource_manager: String,
    pub org_policy: String,
    pub service_usage: String,
    pub iap: String,
    pub iam: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            resource_manager: "https://cloudresourcemanager.googleapis.com".into(),
            org_policy: "https://orgpolicy.googleapis.com".into(),
            service_usage: "https://serviceusage.googleapis.com".into(),
            iap: "https://iap.googleapis.com".into(),
            iam: "https://iam.googleapis.com".into(),
        }
    }
}

impl Endpoints {
    /// Every API served from one base URL.
    pub fn uniform(base: &str) -> Self {
        let base = base.trim_end_matches('/').to_string();
        Self {
            resource_manager: base.clone(),
            org_policy: base.clone(),
            service_usage: base.clone(),
            iap: base.clone(),
            iam: base,
        }
    }
}

/// Authenticated REST client. Every call goes through [`GcpGateway::execute`],
/// which classifies failures and applies the retry policy.
pub struct GcpGateway {
    client: Client,
    token: Secret,
    endpoints: Endpoints,
    retry: RetryPolicy,
}

impl GcpGateway {
    pub fn new(access_token: Secret, retry: RetryPolicy) -> ApiResult<Self> {
        if access_token.expose().trim().is_empty() {
            return Err(ApiError::new(
                "connect",
                ErrorKind::Reauthenticate,
                "access token is empty",
            ));
        }

        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ApiError::new("connect", ErrorKind::Other, e.to_string()))?;

        Ok(Self {
            client,
            token: access_token,
            endpoints: Endpoints::default(),
            retry,
        })
    }

    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> ApiResult<T> {
        self.retry
            .run(operation, || self.send_once(operation, method.clone(), url, body))
            .await
    }

    async fn send_once<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> ApiResult<T> {
        tracing::debug!(operation, %method, url, "request");

        let mut request = self
            .client
            .request(method, url)
            .bearer_auth(self.token.expose());
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| transport_error(operation, e))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| transport_error(operation, e))?;

        if status.is_success() {
            let text = if text.trim().is_empty() { "{}" } else { text.as_str() };
            return serde_json::from_str(text).map_err(|e| {
                ApiError::new(operation, ErrorKind::Other, format!("unexpected response body: {e}"))
            });
        }

        let (rpc_status, message) = parse_error_body(&text);
        let kind = classify(Some(status.as_u16()), rpc_status.as_deref(), &message);
        tracing::debug!(operation, status = status.as_u16(), %kind, "request failed");
        Err(ApiError::new(
            operation,
            kind,
            format!("HTTP {}: {message}", status.as_u16()),
        ))
    }

    fn clients_url(&self, project_id: &str) -> String {
        format!(
            "{}/v1/projects/{project_id}/locations/global/oauthClients",
            self.endpoints.iam
        )
    }
}

/// Transport failures carry the request URL, which may hold credentials in
/// its query; only the error text without it is kept.
pub(crate) fn transport_error(operation: &str, e: reqwest::Error) -> ApiError {
    let message = e.without_url().to_string();
    ApiError::new(operation, classify(None, None, &message), message)
}

fn with_query(operation: &str, base: &str, params: &[(&str, &str)]) -> ApiResult<String> {
    Url::parse_with_params(base, params)
        .map(String::from)
        .map_err(|e| ApiError::new(operation, ErrorKind::InvalidArgument, format!("bad URL {base}: {e}")))
}

/// Extracts the RPC status and message from a Google error body.
///
/// Handles both `{"error": {"status": .., "message": ..}}` and the OAuth
/// style `{"error": "invalid_token", "error_description": ..}`.
pub(crate) fn parse_error_body(text: &str) -> (Option<String>, String) {
    #[derive(Deserialize)]
    struct Envelope {
        error: ErrorBody,
        #[serde(default)]
        error_description: Option<String>,
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ErrorBody {
        Rpc {
            #[serde(default)]
            message: String,
            #[serde(default)]
            status: Option<String>,
        },
        Code(String),
    }

    match serde_json::from_str::<Envelope>(text) {
        Ok(Envelope {
            error: ErrorBody::Rpc { message, status },
            ..
        }) => (status, message),
        Ok(Envelope {
            error: ErrorBody::Code(code),
            error_description,
        }) => (
            None,
            match error_description {
                Some(desc) => format!("{code}: {desc}"),
                None => code,
            },
        ),
        Err(_) => (None, text.trim().to_string()),
    }
}

fn last_segment(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

static KEY_SEQ: AtomicU32 = AtomicU32::new(0);

/// `warden-<millis>-<seq>`: unique within a process even for keys created in
/// the same millisecond, and at most 32 characters.
fn new_key_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let seq = KEY_SEQ.fetch_add(1, Ordering::Relaxed) % 1000;
    format!("warden-{millis}-{seq}")
}

// ---------------------------------------------------------------------------
// Wire formats
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IamPolicyWire {
    #[serde(default)]
    version: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    etag: String,
    #[serde(default)]
    bindings: Vec<BindingWire>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BindingWire {
    role: String,
    #[serde(default)]
    members: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    condition: Option<BindingCondition>,
}

impl From<IamPolicyWire> for PolicyDocument {
    fn from(wire: IamPolicyWire) -> Self {
        PolicyDocument {
            bindings: wire
                .bindings
                .into_iter()
                .map(|b| PolicyBinding {
                    role: RoleBundle::new(b.role),
                    members: b.members.into_iter().collect(),
                    condition: b.condition,
                })
                .collect(),
            token: PolicyToken(wire.etag),
            version: wire.version,
        }
    }
}

impl From<&PolicyDocument> for IamPolicyWire {
    fn from(doc: &PolicyDocument) -> Self {
        IamPolicyWire {
            version: IAM_POLICY_VERSION,
            etag: doc.token.0.clone(),
            bindings: doc
                .bindings
                .iter()
                .map(|b| BindingWire {
                    role: b.role.0.clone(),
                    members: b.members.iter().cloned().collect(),
                    condition: b.condition.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct PermissionsWire {
    #[serde(default)]
    permissions: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrgPolicyWire {
    #[serde(default)]
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    spec: Option<PolicySpecWire>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PolicySpecWire {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    etag: String,
    #[serde(default)]
    rules: Vec<PolicyRuleWire>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    inherit_from_parent: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    reset: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PolicyRuleWire {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    values: Option<StringValuesWire>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    allow_all: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    deny_all: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    condition: Option<BindingCondition>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StringValuesWire {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    allowed_values: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    denied_values: Vec<String>,
}

/// `organizations/1/policies/gcp.restrictServiceUsage` for
/// `constraints/gcp.restrictServiceUsage`.
fn policy_name(organization: &str, constraint: &str) -> String {
    format!(
        "{organization}/policies/{}",
        constraint.trim_start_matches("constraints/")
    )
}

/// A wire rule carrying both allowed and denied values becomes a deny list
/// followed by an allow list, which evaluates the same way.
fn rules_from_wire(rules: Vec<PolicyRuleWire>) -> Vec<ConstraintRule> {
    let mut out = Vec::with_capacity(rules.len());
    for rule in rules {
        if let Some(condition) = rule.condition {
            let values = rule.values.unwrap_or_default();
            out.push(ConstraintRule::Conditional(ConditionalRule {
                condition,
                allowed: values.allowed_values,
                denied: values.denied_values,
                allow_all: rule.allow_all == Some(true),
                deny_all: rule.deny_all == Some(true),
            }));
        } else if rule.allow_all == Some(true) {
            out.push(ConstraintRule::AllowAll);
        } else if rule.deny_all == Some(true) {
            out.push(ConstraintRule::DenyAll);
        } else if let Some(values) = rule.values {
            if !values.denied_values.is_empty() {
                out.push(ConstraintRule::DenyList(values.denied_values));
            }
            if !values.allowed_values.is_empty() {
                out.push(ConstraintRule::AllowList(values.allowed_values));
            }
        }
    }
    out
}

fn rules_to_wire(rules: &[ConstraintRule]) -> Vec<PolicyRuleWire> {
    rules
        .iter()
        .map(|rule| match rule {
            ConstraintRule::AllowAll => PolicyRuleWire {
                allow_all: Some(true),
                ..Default::default()
            },
            ConstraintRule::DenyAll => PolicyRuleWire {
                deny_all: Some(true),
                ..Default::default()
            },
            ConstraintRule::AllowList(values) => PolicyRuleWire {
                values: Some(StringValuesWire {
                    allowed_values: values.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ConstraintRule::DenyList(values) => PolicyRuleWire {
                values: Some(StringValuesWire {
                    denied_values: values.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ConstraintRule::Conditional(rule) => PolicyRuleWire {
                values: (!rule.allowed.is_empty() || !rule.denied.is_empty()).then(|| StringValuesWire {
                    allowed_values: rule.allowed.clone(),
                    denied_values: rule.denied.clone(),
                }),
                allow_all: rule.allow_all.then_some(true),
                deny_all: rule.deny_all.then_some(true),
                condition: Some(rule.condition.clone()),
            },
        })
        .collect()
}

fn constraint_from_wire(constraint: &str, wire: OrgPolicyWire) -> ConstraintPolicy {
    let spec = wire.spec.unwrap_or_default();
    ConstraintPolicy {
        constraint: constraint.to_string(),
        rules: rules_from_wire(spec.rules),
        inherit_from_parent: spec.inherit_from_parent,
        reset: spec.reset,
        token: PolicyToken(spec.etag),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectWire {
    project_id: String,
    #[serde(default)]
    parent: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServicesPage {
    #[serde(default)]
    services: Vec<ServiceWire>,
    #[serde(default)]
    next_page_token: String,
}

#[derive(Debug, Deserialize)]
struct ServiceWire {
    name: String,
    #[serde(default)]
    config: Option<ServiceConfigWire>,
}

#[derive(Debug, Deserialize)]
struct ServiceConfigWire {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct BrandsWire {
    #[serde(default)]
    brands: Vec<BrandWire>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BrandWire {
    name: String,
    #[serde(default)]
    application_title: String,
    #[serde(default)]
    support_email: String,
}

impl From<BrandWire> for ConsentScreen {
    fn from(b: BrandWire) -> Self {
        ConsentScreen {
            name: b.name,
            application_title: b.application_title,
            support_email: b.support_email,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OAuthClientWire {
    name: String,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    allowed_redirect_uris: Vec<String>,
    #[serde(default)]
    state: String,
}

impl From<OAuthClientWire> for OAuthClient {
    fn from(c: OAuthClientWire) -> Self {
        OAuthClient {
            client_id: last_segment(&c.name).to_string(),
            display_name: c.display_name,
            redirect_uris: c.allowed_redirect_uris.into_iter().collect(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialsWire {
    #[serde(default)]
    oauth_client_credentials: Vec<CredentialWire>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialWire {
    name: String,
    #[serde(default)]
    client_secret: Option<String>,
}

impl From<CredentialWire> for ClientKey {
    fn from(c: CredentialWire) -> Self {
        ClientKey {
            key_id: last_segment(&c.name).to_string(),
            secret: c.client_secret.filter(|s| !s.is_empty()).map(Secret::new),
        }
    }
}

/// Maps `NotFound` to `Ok(None)`.
fn optional<T>(result: ApiResult<T>) -> ApiResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is(ErrorKind::NotFound) => Ok(None),
        Err(e) => Err(e),
    }
}

// ---------------------------------------------------------------------------
// ResourceApi
// ---------------------------------------------------------------------------

#[async_trait]
impl ResourceApi for GcpGateway {
    async fn test_permissions(
        &self,
        scope: &ScopeTarget,
        permissions: &[PermissionId],
    ) -> ApiResult<BTreeSet<PermissionId>> {
        let url = format!(
            "{}/v3/{}:testIamPermissions",
            self.endpoints.resource_manager, scope.resource
        );

        let mut granted = BTreeSet::new();
        for chunk in permissions.chunks(MAX_PERMISSIONS_PER_TEST) {
            let body = json!({
                "permissions": chunk.iter().map(PermissionId::as_str).collect::<Vec<_>>(),
            });
            let resp: PermissionsWire = self
                .execute(ops::TEST_PERMISSIONS, Method::POST, &url, Some(&body))
                .await?;
            granted.extend(resp.permissions.into_iter().map(PermissionId));
        }

        tracing::debug!(scope = %scope, requested = permissions.len(), granted = granted.len(), "tested permissions");
        Ok(granted)
    }

    async fn get_policy(&self, scope: &ScopeTarget) -> ApiResult<PolicyDocument> {
        let url = format!(
            "{}/v3/{}:getIamPolicy",
            self.endpoints.resource_manager, scope.resource
        );
        let body = json!({ "options": { "requestedPolicyVersion": IAM_POLICY_VERSION } });
        let wire: IamPolicyWire = self
            .execute(ops::GET_POLICY, Method::POST, &url, Some(&body))
            .await?;
        Ok(wire.into())
    }

    async fn set_policy(&self, scope: &ScopeTarget, policy: &PolicyDocument) -> ApiResult<PolicyDocument> {
        let url = format!(
            "{}/v3/{}:setIamPolicy",
            self.endpoints.resource_manager, scope.resource
        );
        let body = json!({ "policy": IamPolicyWire::from(policy) });
        let wire: IamPolicyWire = self
            .execute(ops::SET_POLICY, Method::POST, &url, Some(&body))
            .await?;
        Ok(wire.into())
    }

    async fn get_constraint_policy(
        &self,
        organization: &str,
        constraint: &str,
    ) -> ApiResult<Option<ConstraintPolicy>> {
        let url = format!(
            "{}/v2/{}",
            self.endpoints.org_policy,
            policy_name(organization, constraint)
        );
        let wire: Option<OrgPolicyWire> =
            optional(self.execute(ops::GET_CONSTRAINT, Method::GET, &url, None).await)?;
        Ok(wire.map(|w| constraint_from_wire(constraint, w)))
    }

    async fn set_constraint_policy(
        &self,
        organization: &str,
        policy: &ConstraintPolicy,
    ) -> ApiResult<ConstraintPolicy> {
        let name = policy_name(organization, &policy.constraint);
        let url = format!("{}/v2/{name}", self.endpoints.org_policy);
        let body = serde_json::to_value(OrgPolicyWire {
            name,
            spec: Some(PolicySpecWire {
                etag: policy.token.0.clone(),
                rules: rules_to_wire(&policy.rules),
                inherit_from_parent: policy.inherit_from_parent,
                reset: policy.reset,
            }),
        })
        .map_err(|e| ApiError::new(ops::SET_CONSTRAINT, ErrorKind::Other, e.to_string()))?;

        let wire: OrgPolicyWire = self
            .execute(ops::SET_CONSTRAINT, Method::PATCH, &url, Some(&body))
            .await?;
        Ok(constraint_from_wire(&policy.constraint, wire))
    }

    async fn get_project(&self, project_id: &str) -> ApiResult<Option<Project>> {
        let url = format!("{}/v3/projects/{project_id}", self.endpoints.resource_manager);
        let wire: Option<ProjectWire> =
            optional(self.execute(ops::GET_PROJECT, Method::GET, &url, None).await)?;
        Ok(wire.map(|p| Project {
            project_id: p.project_id,
            parent: p.parent,
        }))
    }

    async fn create_project(&self, project_id: &str, parent: &str) -> ApiResult<()> {
        let url = format!("{}/v3/projects", self.endpoints.resource_manager);
        let body = json!({ "projectId": project_id, "parent": parent });
        let _operation: Value = self
            .execute(ops::CREATE_PROJECT, Method::POST, &url, Some(&body))
            .await?;
        Ok(())
    }

    async fn list_enabled_services(&self, project_id: &str) -> ApiResult<BTreeSet<String>> {
        let base = format!(
            "{}/v1/projects/{project_id}/services",
            self.endpoints.service_usage
        );

        let mut enabled = BTreeSet::new();
        let mut page_token = String::new();
        loop {
            let mut params = vec![("filter", "state:ENABLED"), ("pageSize", SERVICES_PAGE_SIZE)];
            if !page_token.is_empty() {
                params.push(("pageToken", page_token.as_str()));
            }
            let url = with_query(ops::LIST_SERVICES, &base, &params)?;
            let page: ServicesPage = self
                .execute(ops::LIST_SERVICES, Method::GET, &url, None)
                .await?;

            enabled.extend(page.services.into_iter().map(|s| match s.config {
                Some(config) => config.name,
                None => last_segment(&s.name).to_string(),
            }));

            if page.next_page_token.is_empty() {
                break;
            }
            page_token = page.next_page_token;
        }
        Ok(enabled)
    }

    async fn enable_service(&self, project_id: &str, service: &str) -> ApiResult<()> {
        let url = format!(
            "{}/v1/projects/{project_id}/services/{service}:enable",
            self.endpoints.service_usage
        );
        let _operation: Value = self
            .execute(ops::ENABLE_SERVICE, Method::POST, &url, Some(&json!({})))
            .await?;
        Ok(())
    }

    async fn get_consent_screen(&self, project_id: &str) -> ApiResult<Option<ConsentScreen>> {
        let url = format!("{}/v1/projects/{project_id}/brands", self.endpoints.iap);
        let wire: BrandsWire = self.execute(ops::GET_BRAND, Method::GET, &url, None).await?;
        Ok(wire.brands.into_iter().next().map(ConsentScreen::from))
    }

    async fn create_consent_screen(
        &self,
        project_id: &str,
        spec: &ConsentScreenSpec,
    ) -> ApiResult<ConsentScreen> {
        let url = format!("{}/v1/projects/{project_id}/brands", self.endpoints.iap);
        let body = json!({
            "applicationTitle": spec.application_title,
            "supportEmail": spec.support_email,
        });
        let wire: BrandWire = self
            .execute(ops::CREATE_BRAND, Method::POST, &url, Some(&body))
            .await?;
        Ok(wire.into())
    }

    async fn get_oauth_client(&self, project_id: &str, client_id: &str) -> ApiResult<Option<OAuthClient>> {
        let url = format!("{}/{client_id}", self.clients_url(project_id));
        let wire: Option<OAuthClientWire> =
            optional(self.execute(ops::GET_CLIENT, Method::GET, &url, None).await)?;
        // Soft-deleted clients stay readable for a while; they are not usable.
        Ok(wire.filter(|c| c.state != "DELETED").map(OAuthClient::from))
    }

    async fn create_oauth_client(&self, project_id: &str, spec: &OAuthClientSpec) -> ApiResult<OAuthClient> {
        let url = with_query(
            ops::CREATE_CLIENT,
            &self.clients_url(project_id),
            &[("oauthClientId", spec.client_id.as_str())],
        )?;
        let body = json!({
            "displayName": spec.display_name,
            "allowedRedirectUris": spec.redirect_uris,
            "allowedGrantTypes": ["AUTHORIZATION_CODE_GRANT", "REFRESH_TOKEN_GRANT"],
            "allowedScopes": ["openid", "email"],
            "clientType": "CONFIDENTIAL_CLIENT",
        });
        let wire: OAuthClientWire = self
            .execute(ops::CREATE_CLIENT, Method::POST, &url, Some(&body))
            .await?;
        Ok(wire.into())
    }

    async fn update_oauth_client(&self, project_id: &str, client: &OAuthClient) -> ApiResult<OAuthClient> {
        let url = with_query(
            ops::UPDATE_CLIENT,
            &format!("{}/{}", self.clients_url(project_id), client.client_id),
            &[("updateMask", "displayName,allowedRedirectUris")],
        )?;
        let body = json!({
            "displayName": client.display_name,
            "allowedRedirectUris": client.redirect_uris,
        });
        let wire: OAuthClientWire = self
            .execute(ops::UPDATE_CLIENT, Method::PATCH, &url, Some(&body))
            .await?;
        Ok(wire.into())
    }

    async fn delete_oauth_client(&self, project_id: &str, client_id: &str) -> ApiResult<()> {
        let url = format!("{}/{client_id}", self.clients_url(project_id));
        let _deleted: Value = self
            .execute(ops::DELETE_CLIENT, Method::DELETE, &url, None)
            .await?;
        Ok(())
    }

    async fn list_client_keys(&self, project_id: &str, client_id: &str) -> ApiResult<Vec<ClientKey>> {
        let url = format!("{}/{client_id}/credentials", self.clients_url(project_id));
        let wire: CredentialsWire = self.execute(ops::LIST_KEYS, Method::GET, &url, None).await?;
        Ok(wire
            .oauth_client_credentials
            .into_iter()
            .map(ClientKey::from)
            .collect())
    }

    async fn create_client_key(&self, project_id: &str, client_id: &str) -> ApiResult<ClientKey> {
        let key_id = new_key_id();
        let url = with_query(
            ops::CREATE_KEY,
            &format!("{}/{client_id}/credentials", self.clients_url(project_id)),
            &[("oauthClientCredentialId", key_id.as_str())],
        )?;
        let body = json!({ "displayName": "managed by warden" });
        let wire: CredentialWire = self
            .execute(ops::CREATE_KEY, Method::POST, &url, Some(&body))
            .await?;
        Ok(wire.into())
    }

    async fn delete_client_key(&self, project_id: &str, client_id: &str, key_id: &str) -> ApiResult<()> {
        let key_url = format!("{}/{client_id}/credentials/{key_id}", self.clients_url(project_id));

        // Credentials must be disabled before they can be deleted.
        let disable_url = with_query(ops::DELETE_KEY, &key_url, &[("updateMask", "disabled")])?;
        let _disabled: Value = self
            .execute(ops::DELETE_KEY, Method::PATCH, &disable_url, Some(&json!({ "disabled": true })))
            .await?;

        let _deleted: Value = self
            .execute(ops::DELETE_KEY, Method::DELETE, &key_url, None)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rpc_error_body() {
        let body = r#"{"error":{"code":409,"message":"There were concurrent policy changes.","status":"ABORTED"}}"#;
        let (status, message) = parse_error_body(body);
        assert_eq!(status.as_deref(), Some("ABORTED"));
        assert!(message.contains("concurrent"));
    }

    #[test]
    fn parses_oauth_error_body() {
        let body = r#"{"error":"invalid_token","error_description":"Invalid Value"}"#;
        let (status, message) = parse_error_body(body);
        assert!(status.is_none());
        assert_eq!(message, "invalid_token: Invalid Value");
    }

    #[test]
    fn non_json_error_body_is_kept_verbatim() {
        let (status, message) = parse_error_body("  upstream connect error  ");
        assert!(status.is_none());
        assert_eq!(message, "upstream connect error");
    }

    #[test]
    fn key_ids_are_unique_back_to_back() {
        let ids: BTreeSet<String> = (0..50).map(|_| new_key_id()).collect();
        assert_eq!(ids.len(), 50);
        assert!(ids.iter().all(|id| id.starts_with("warden-") && id.len() <= 32));
    }

    #[test]
    fn policy_names_strip_constraint_prefix() {
        assert_eq!(
            policy_name("organizations/42", "constraints/gcp.restrictServiceUsage"),
            "organizations/42/policies/gcp.restrictServiceUsage"
        );
    }

    #[test]
    fn mixed_value_rule_splits_into_deny_then_allow() {
        let rules = rules_from_wire(vec![PolicyRuleWire {
            values: Some(StringValuesWire {
                allowed_values: vec!["a.googleapis.com".into()],
                denied_values: vec!["b.googleapis.com".into()],
            }),
            ..Default::default()
        }]);
        assert_eq!(
            rules,
            vec![
                ConstraintRule::DenyList(vec!["b.googleapis.com".into()]),
                ConstraintRule::AllowList(vec!["a.googleapis.com".into()]),
            ]
        );
    }

    #[test]
    fn org_policy_conditions_and_flags_survive_a_rewrite() {
        let read = json!({
            "name": "organizations/1/policies/gcp.restrictServiceUsage",
            "spec": {
                "etag": "CNa1",
                "inheritFromParent": true,
                "rules": [
                    {"values": {"deniedValues": ["iap.googleapis.com"]},
                     "condition": {"expression": "resource.matchTag('1/env', 'prod')", "title": "prod"}},
                    {"allowAll": true}
                ]
            }
        });
        let policy = constraint_from_wire(
            "constraints/gcp.restrictServiceUsage",
            serde_json::from_value(read).unwrap(),
        );
        assert!(policy.inherit_from_parent);
        assert!(!policy.reset);
        match &policy.rules[0] {
            ConstraintRule::Conditional(rule) => {
                assert_eq!(rule.condition.title, "prod");
                assert_eq!(rule.denied, vec!["iap.googleapis.com".to_string()]);
            }
            other => panic!("unexpected rule: {other:?}"),
        }

        let written = serde_json::to_value(PolicySpecWire {
            etag: policy.token.0.clone(),
            rules: rules_to_wire(&policy.rules),
            inherit_from_parent: policy.inherit_from_parent,
            reset: policy.reset,
        })
        .unwrap();
        assert_eq!(written["inheritFromParent"], json!(true));
        assert!(written.get("reset").is_none());
        assert_eq!(
            written["rules"][0]["condition"]["expression"],
            json!("resource.matchTag('1/env', 'prod')")
        );
        assert_eq!(written["rules"][0]["values"]["deniedValues"], json!(["iap.googleapis.com"]));
        assert_eq!(written["rules"][1], json!({"allowAll": true}));
    }

    #[test]
    fn policy_wire_keeps_conditions_and_etag() {
        let wire: IamPolicyWire = serde_json::from_value(json!({
            "version": 3,
            "etag": "BwX1",
            "bindings": [
                {"role": "roles/editor", "members": ["group:devs@example.com"]},
                {"role": "roles/viewer", "members": ["domain:example.com"],
                 "condition": {"expression": "true", "title": "always"}}
            ]
        }))
        .unwrap();
        let doc = PolicyDocument::from(wire);
        assert_eq!(doc.token.0, "BwX1");
        assert!(doc.bindings[1].condition.is_some());

        let back = serde_json::to_value(IamPolicyWire::from(&doc)).unwrap();
        assert_eq!(back["etag"], "BwX1");
        assert_eq!(back["version"], 3);
        assert_eq!(back["bindings"][1]["condition"]["title"], "always");
    }

    #[test]
    fn empty_token_is_rejected() {
        assert_eq!(
            GcpGateway::new(Secret::new(" "), RetryPolicy::none()).err().map(|e| e.kind),
            Some(ErrorKind::Reauthenticate)
        );
    }
}
