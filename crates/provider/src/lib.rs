//! Resource API abstraction for Warden.
//!
//! Everything the engine needs from the cloud goes through two traits:
//! [`IdentityProvider`] ("who am I") and [`ResourceApi`] (policies, services,
//! consent screen, OAuth clients). Implementations return [`ApiError`]s that
//! are already classified; see [`classify`].

pub mod classify;
pub mod gcp;
pub mod identity;
pub mod memory;
pub mod retry;

use async_trait::async_trait;
use std::collections::BTreeSet;
use warden_core::error::ApiResult;
use warden_core::{
    ClientKey, ConsentScreen, ConsentScreenSpec, ConstraintPolicy, OAuthClient, OAuthClientSpec,
    PermissionId, PolicyDocument, Project, ScopeTarget, TrustKind,
};

pub use classify::classify;
pub use gcp::{Endpoints, GcpGateway};
pub use identity::{StaticIdentity, TokenInfoIdentity};
pub use memory::InMemoryCloud;
pub use retry::RetryPolicy;

/// Operation names used in errors, logs, and call recording.
pub mod ops {
    pub const TEST_PERMISSIONS: &str = "testIamPermissions";
    pub const GET_POLICY: &str = "getIamPolicy";
    pub const SET_POLICY: &str = "setIamPolicy";
    pub const GET_CONSTRAINT: &str = "getOrgPolicy";
    pub const SET_CONSTRAINT: &str = "setOrgPolicy";
    pub const GET_PROJECT: &str = "getProject";
    pub const CREATE_PROJECT: &str = "createProject";
    pub const LIST_SERVICES: &str = "listServices";
    pub const ENABLE_SERVICE: &str = "enableService";
    pub const GET_BRAND: &str = "getBrand";
    pub const CREATE_BRAND: &str = "createBrand";
    pub const GET_CLIENT: &str = "getOAuthClient";
    pub const CREATE_CLIENT: &str = "createOAuthClient";
    pub const UPDATE_CLIENT: &str = "updateOAuthClient";
    pub const DELETE_CLIENT: &str = "deleteOAuthClient";
    pub const LIST_KEYS: &str = "listCredentials";
    pub const CREATE_KEY: &str = "createCredential";
    pub const DELETE_KEY: &str = "deleteCredential";
    pub const TOKEN_INFO: &str = "tokeninfo";
}

/// Source of the acting principal.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Fails with `ErrorKind::Reauthenticate` when credentials are stale.
    async fn current_principal_email(&self) -> ApiResult<String>;

    fn trust_kind(&self) -> TrustKind;
}

/// Remote calls the provisioning workflow depends on.
///
/// `Global` and `Organization` scope targets name an organization resource,
/// `Project` targets name a project resource.
#[async_trait]
pub trait ResourceApi: Send + Sync {
    /// Returns the subset of `permissions` the caller holds on `scope`.
    async fn test_permissions(
        &self,
        scope: &ScopeTarget,
        permissions: &[PermissionId],
    ) -> ApiResult<BTreeSet<PermissionId>>;

    async fn get_policy(&self, scope: &ScopeTarget) -> ApiResult<PolicyDocument>;

    /// Writes `policy` guarded by its token; a stale token fails with
    /// `ErrorKind::StaleToken`.
    async fn set_policy(&self, scope: &ScopeTarget, policy: &PolicyDocument) -> ApiResult<PolicyDocument>;

    /// `None` when no policy is set for the constraint (default-allow).
    async fn get_constraint_policy(
        &self,
        organization: &str,
        constraint: &str,
    ) -> ApiResult<Option<ConstraintPolicy>>;

    async fn set_constraint_policy(
        &self,
        organization: &str,
        policy: &ConstraintPolicy,
    ) -> ApiResult<ConstraintPolicy>;

    /// `None` on 404. Resource Manager also answers 403 for projects the
    /// caller cannot see, which is returned as `PermissionDenied`.
    async fn get_project(&self, project_id: &str) -> ApiResult<Option<Project>>;

    async fn create_project(&self, project_id: &str, parent: &str) -> ApiResult<()>;

    async fn list_enabled_services(&self, project_id: &str) -> ApiResult<BTreeSet<String>>;

    /// Fails with `ConstraintViolation` when an organization policy blocks the service.
    async fn enable_service(&self, project_id: &str, service: &str) -> ApiResult<()>;

    async fn get_consent_screen(&self, project_id: &str) -> ApiResult<Option<ConsentScreen>>;

    async fn create_consent_screen(
        &self,
        project_id: &str,
        spec: &ConsentScreenSpec,
    ) -> ApiResult<ConsentScreen>;

    async fn get_oauth_client(&self, project_id: &str, client_id: &str) -> ApiResult<Option<OAuthClient>>;

    async fn create_oauth_client(&self, project_id: &str, spec: &OAuthClientSpec) -> ApiResult<OAuthClient>;

    async fn update_oauth_client(&self, project_id: &str, client: &OAuthClient) -> ApiResult<OAuthClient>;

    async fn delete_oauth_client(&self, project_id: &str, client_id: &str) -> ApiResult<()>;

    async fn list_client_keys(&self, project_id: &str, client_id: &str) -> ApiResult<Vec<ClientKey>>;

    /// The returned key carries the secret; it is not retrievable later.
    async fn create_client_key(&self, project_id: &str, client_id: &str) -> ApiResult<ClientKey>;

    async fn delete_client_key(&self, project_id: &str, client_id: &str, key_id: &str) -> ApiResult<()>;
}
