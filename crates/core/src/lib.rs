//! Domain models, configuration, shared result types, and error definitions.
//!
//! Foundation crate -- no async or I/O dependencies.

pub mod config;
pub mod error;
pub mod resources;
pub mod state;
pub mod types;

pub use config::{ProvisionConfig, RetryConfig, WaitConfig};
pub use error::{ApiError, ApiResult, ErrorKind, WardenError, WardenResult};
pub use resources::{ClientKey, ConsentScreen, ConsentScreenSpec, OAuthClient, OAuthClientSpec, Project};
pub use state::{
    ProvisioningResult, ProvisioningState, ReconcileReport, ReconciliationResult, Secret, Step,
};
pub use types::{
    AuthorizationScope, BindingCondition, ConditionalRule, ConstraintPolicy, ConstraintRule,
    MissingSet, PermissionId, PolicyBinding, PolicyDocument, PolicyToken, Principal, RequiredPermission, RoleBundle, ScopeKind, ScopeTarget,
    TrustKind,
};
