//! Domain types for authorization state: principals, scopes, role bundles,
//! IAM policy documents, and organization constraint policies.

use crate::error::{WardenError, WardenResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Principal
// ---------------------------------------------------------------------------

/// How the acting identity authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrustKind {
    InteractiveUser,
    /// Short-lived credential obtained by impersonating a service account.
    DelegatedCredential,
    LongLivedKey,
}

impl TrustKind {
    /// IAM member prefix for this kind of identity.
    pub fn member_prefix(self) -> &'static str {
        match self {
            TrustKind::InteractiveUser => "user",
            TrustKind::DelegatedCredential | TrustKind::LongLivedKey => "serviceAccount",
        }
    }
}

/// The authenticated identity performing operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub email: String,
    pub domain: String,
    pub trust: TrustKind,
}

impl Principal {
    pub fn parse(email: &str, trust: TrustKind) -> WardenResult<Self> {
        let email = email.trim();
        let (local, domain) = email
            .rsplit_once('@')
            .ok_or_else(|| WardenError::Validation(format!("`{email}` is not an email address")))?;
        if local.is_empty() || domain.is_empty() || !domain.contains('.') {
            return Err(WardenError::Validation(format!(
                "`{email}` is not an email address"
            )));
        }

        Ok(Self {
            email: email.to_string(),
            domain: domain.to_ascii_lowercase(),
            trust,
        })
    }

    /// IAM member string: kind prefix, a colon, then the email.
    pub fn member(&self) -> String {
        format!("{}:{}", self.trust.member_prefix(), self.email)
    }

    /// Must hold before any mutation is attempted.
    pub fn ensure_trusted(&self, trusted_domain: &str) -> WardenResult<()> {
        if self.domain.eq_ignore_ascii_case(trusted_domain.trim()) {
            return Ok(());
        }
        Err(WardenError::Authentication {
            reason: format!(
                "{} belongs to `{}`, not the trusted domain `{trusted_domain}`",
                self.email, self.domain
            ),
            remedy: format!("sign in with an account from {trusted_domain} (gcloud auth login)"),
        })
    }
}

// ---------------------------------------------------------------------------
// Scopes and permissions
// ---------------------------------------------------------------------------

/// Level at which permissions and policies are evaluated.
///
/// Ordered `Global < Organization < Project`: the processing order, since a
/// grant at a higher scope can be what makes a lower scope queryable at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    Global,
    Organization,
    Project,
}

impl ScopeKind {
    pub const ORDER: [ScopeKind; 3] = [ScopeKind::Global, ScopeKind::Organization, ScopeKind::Project];

    pub fn get_policy_permission(self) -> &'static str {
        match self {
            ScopeKind::Global | ScopeKind::Organization => "resourcemanager.organizations.getIamPolicy",
            ScopeKind::Project => "resourcemanager.projects.getIamPolicy",
        }
    }

    pub fn set_policy_permission(self) -> &'static str {
        match self {
            ScopeKind::Global | ScopeKind::Organization => "resourcemanager.organizations.setIamPolicy",
            ScopeKind::Project => "resourcemanager.projects.setIamPolicy",
        }
    }

    /// Who can grant missing permissions at this scope.
    pub fn grantor(self) -> &'static str {
        match self {
            ScopeKind::Global | ScopeKind::Organization => "an organization administrator",
            ScopeKind::Project => "a project owner",
        }
    }
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScopeKind::Global => "global",
            ScopeKind::Organization => "organization",
            ScopeKind::Project => "project",
        })
    }
}

impl FromStr for ScopeKind {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "global" => Ok(ScopeKind::Global),
            "organization" | "org" => Ok(ScopeKind::Organization),
            "project" => Ok(ScopeKind::Project),
            other => Err(WardenError::Validation(format!(
                "unknown scope `{other}` (expected global, organization, or project)"
            ))),
        }
    }
}

/// A scope level bound to a concrete resource name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeTarget {
    pub kind: ScopeKind,
    /// e.g. `organizations/1234` or `projects/my-app`.
    pub resource: String,
}

impl ScopeTarget {
    pub fn new(kind: ScopeKind, resource: impl Into<String>) -> Self {
        Self {
            kind,
            resource: resource.into(),
        }
    }
}

impl fmt::Display for ScopeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} scope `{}`", self.kind, self.resource)
    }
}

/// Opaque capability name, e.g. `serviceusage.services.enable`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionId(pub String);

impl PermissionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PermissionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for PermissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A permission a scope requires. Progress is impossible without a critical one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequiredPermission {
    pub id: PermissionId,
    pub critical: bool,
}

impl RequiredPermission {
    pub fn critical(id: &str) -> Self {
        Self {
            id: id.into(),
            critical: true,
        }
    }

    pub fn optional(id: &str) -> Self {
        Self {
            id: id.into(),
            critical: false,
        }
    }
}

/// Permissions that were required but not held. Ordered for stable comparison.
pub type MissingSet = BTreeSet<PermissionId>;

/// A scope plus the ordered list of permissions the workflow needs there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationScope {
    pub target: ScopeTarget,
    pub required: Vec<RequiredPermission>,
}

impl AuthorizationScope {
    pub fn new(target: ScopeTarget, required: Vec<RequiredPermission>) -> Self {
        Self { target, required }
    }

    pub fn kind(&self) -> ScopeKind {
        self.target.kind
    }

    pub fn permission_ids(&self) -> Vec<PermissionId> {
        self.required.iter().map(|p| p.id.clone()).collect()
    }

    pub fn is_critical(&self, id: &PermissionId) -> bool {
        self.required.iter().any(|p| p.critical && &p.id == id)
    }

    /// First critical permission in `missing`, in declaration order.
    pub fn first_critical<'a>(&'a self, missing: &MissingSet) -> Option<&'a PermissionId> {
        self.required
            .iter()
            .find(|p| p.critical && missing.contains(&p.id))
            .map(|p| &p.id)
    }
}

// ---------------------------------------------------------------------------
// IAM policy documents
// ---------------------------------------------------------------------------

/// A named, atomically grantable set of permissions, e.g. `roles/editor`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleBundle(pub String);

impl RoleBundle {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoleBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque optimistic-concurrency token (etag).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyToken(pub String);

/// IAM condition attached to a binding. Carried through untouched on writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingCondition {
    pub expression: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyBinding {
    pub role: RoleBundle,
    pub members: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<BindingCondition>,
}

/// Ordered bindings plus the concurrency token the document was read with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDocument {
    pub bindings: Vec<PolicyBinding>,
    pub token: PolicyToken,
    #[serde(default)]
    pub version: u32,
}

impl PolicyDocument {
    /// Unconditional binding for `role`, if any.
    pub fn binding(&self, role: &RoleBundle) -> Option<&PolicyBinding> {
        self.bindings
            .iter()
            .find(|b| &b.role == role && b.condition.is_none())
    }

    pub fn has_member(&self, role: &RoleBundle, member: &str) -> bool {
        self.binding(role).is_some_and(|b| b.members.contains(member))
    }

    /// Adds `member` to the unconditional binding for `role`.
    ///
    /// Returns `false` when the member was already bound (no change).
    pub fn grant(&mut self, role: &RoleBundle, member: &str) -> bool {
        if let Some(binding) = self
            .bindings
            .iter_mut()
            .find(|b| &b.role == role && b.condition.is_none())
        {
            return binding.members.insert(member.to_string());
        }

        self.bindings.push(PolicyBinding {
            role: role.clone(),
            members: BTreeSet::from([member.to_string()]),
            condition: None,
        });
        true
    }
}

// ---------------------------------------------------------------------------
// Constraint policies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintRule {
    AllowAll,
    DenyAll,
    AllowList(Vec<String>),
    DenyList(Vec<String>),
    /// Applies only where its condition holds. Never edited.
    Conditional(ConditionalRule),
}

/// A constraint rule guarded by a CEL condition, kept exactly as read so it
/// is written back unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionalRule {
    pub condition: BindingCondition,
    #[serde(default)]
    pub allowed: Vec<String>,
    #[serde(default)]
    pub denied: Vec<String>,
    #[serde(default)]
    pub allow_all: bool,
    #[serde(default)]
    pub deny_all: bool,
}

impl ConditionalRule {
    /// Whether the rule blocks `service` on the resources its condition matches.
    pub fn may_deny(&self, service: &str) -> bool {
        if self.allow_all {
            return false;
        }
        self.deny_all
            || self.denied.iter().any(|v| v == service)
            || (!self.allowed.is_empty() && !self.allowed.iter().any(|v| v == service))
    }
}

/// Organization-level rule set governing which services may be used.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintPolicy {
    /// e.g. `constraints/gcp.restrictServiceUsage`.
    pub constraint: String,
    pub rules: Vec<ConstraintRule>,
    /// Merge with the parent's policy instead of replacing it (list constraints).
    #[serde(default)]
    pub inherit_from_parent: bool,
    /// Fall back to the constraint's default behaviour, ignoring `rules`.
    #[serde(default)]
    pub reset: bool,
    pub token: PolicyToken,
}

impl ConstraintPolicy {
    /// Whether `service` is usable under this policy.
    ///
    /// A deny list naming the service blocks it outright; otherwise the first
    /// allow-list, allow-all, or deny-all rule decides. No deciding rule means
    /// default-allow. A conditional rule counts only when it could block the
    /// service somewhere.
    pub fn allows(&self, service: &str) -> bool {
        for rule in &self.rules {
            match rule {
                ConstraintRule::Conditional(rule) => {
                    if rule.may_deny(service) {
                        return false;
                    }
                }
                ConstraintRule::DenyList(values) => {
                    if values.iter().any(|v| v == service) {
                        return false;
                    }
                }
                ConstraintRule::AllowList(values) => return values.iter().any(|v| v == service),
                ConstraintRule::AllowAll => return true,
                ConstraintRule::DenyAll => return false,
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE: &str = concat!("alice", "@Example.com");
    const MALLORY: &str = concat!("mallory", "@evil.test");
    const DEPLOYER: &str = concat!("deployer", "@example.com");

    #[test]
    fn principal_parse_and_member() {
        let p = Principal::parse(ALICE, TrustKind::InteractiveUser).unwrap();
        assert_eq!(p.domain, "example.com");
        assert_eq!(p.member(), format!("user:{ALICE}"));

        let sa = Principal::parse(DEPLOYER, TrustKind::DelegatedCredential).unwrap();
        assert_eq!(sa.member(), format!("serviceAccount:{DEPLOYER}"));
    }

    #[test]
    fn principal_rejects_malformed_email() {
        assert!(Principal::parse("alice", TrustKind::InteractiveUser).is_err());
        assert!(Principal::parse("@example.com", TrustKind::InteractiveUser).is_err());
        assert!(Principal::parse("alice@localhost", TrustKind::InteractiveUser).is_err());
    }

    #[test]
    fn untrusted_domain_is_an_authentication_error() {
        let p = Principal::parse(ALICE, TrustKind::InteractiveUser).unwrap();
        assert!(p.ensure_trusted("example.com").is_ok());
        let err = Principal::parse(MALLORY, TrustKind::InteractiveUser)
            .unwrap()
            .ensure_trusted("example.com")
            .unwrap_err();
        assert!(matches!(err, WardenError::Authentication { .. }));
    }

    #[test]
    fn scope_order_is_global_org_project() {
        let mut kinds = vec![ScopeKind::Project, ScopeKind::Global, ScopeKind::Organization];
        kinds.sort();
        assert_eq!(kinds, ScopeKind::ORDER.to_vec());
        assert_eq!("org".parse::<ScopeKind>().unwrap(), ScopeKind::Organization);
        assert!("folder".parse::<ScopeKind>().is_err());
    }

    #[test]
    fn grant_is_idempotent_and_skips_conditional_bindings() {
        let member = format!("user:{ALICE}");
        let editor = RoleBundle::new("roles/editor");
        let mut doc = PolicyDocument {
            bindings: vec![PolicyBinding {
                role: editor.clone(),
                members: BTreeSet::from([member.clone()]),
                condition: Some(BindingCondition {
                    expression: "request.time < timestamp('2030-01-01T00:00:00Z')".into(),
                    title: "temporary".into(),
                    description: String::new(),
                }),
            }],
            ..Default::default()
        };

        assert!(!doc.has_member(&editor, &member));
        assert!(doc.grant(&editor, &member));
        assert!(!doc.grant(&editor, &member));
        assert_eq!(doc.bindings.len(), 2);
        assert!(doc.has_member(&editor, &member));
    }

    #[test]
    fn first_critical_follows_declaration_order() {
        let scope = AuthorizationScope::new(
            ScopeTarget::new(ScopeKind::Project, "projects/p"),
            vec![
                RequiredPermission::optional("a.list"),
                RequiredPermission::critical("b.create"),
                RequiredPermission::critical("a.create"),
            ],
        );
        let missing: MissingSet = ["a.create", "b.create", "a.list"].into_iter().map(PermissionId::from).collect();
        assert_eq!(scope.first_critical(&missing).unwrap().as_str(), "b.create");
        assert!(!scope.is_critical(&"a.list".into()));
    }

    #[test]
    fn constraint_allows() {
        let svc = "iap.googleapis.com";
        let policy = |rules| ConstraintPolicy {
            constraint: "constraints/gcp.restrictServiceUsage".into(),
            rules,
            ..Default::default()
        };

        assert!(policy(vec![]).allows(svc));
        assert!(policy(vec![ConstraintRule::AllowAll]).allows(svc));
        assert!(!policy(vec![ConstraintRule::DenyAll]).allows(svc));
        assert!(!policy(vec![ConstraintRule::DenyList(vec![svc.into()]), ConstraintRule::AllowAll]).allows(svc));
        assert!(!policy(vec![ConstraintRule::AllowList(vec!["other".into()])]).allows(svc));
        assert!(policy(vec![
            ConstraintRule::DenyList(vec!["other".into()]),
            ConstraintRule::AllowList(vec![svc.into()]),
        ])
        .allows(svc));
    }

    #[test]
    fn conditional_rules_only_count_when_they_could_block() {
        let svc = "iap.googleapis.com";
        let conditional = |rule: ConditionalRule| ConstraintPolicy {
            constraint: "constraints/gcp.restrictServiceUsage".into(),
            rules: vec![ConstraintRule::Conditional(rule), ConstraintRule::AllowAll],
            ..Default::default()
        };
        let base = ConditionalRule {
            condition: BindingCondition {
                expression: "resource.matchTag('123/env', 'prod')".into(),
                title: "prod only".into(),
                description: String::new(),
            },
            allowed: vec![],
            denied: vec![],
            allow_all: false,
            deny_all: false,
        };

        assert!(!conditional(ConditionalRule { denied: vec![svc.into()], ..base.clone() }).allows(svc));
        assert!(!conditional(ConditionalRule { deny_all: true, ..base.clone() }).allows(svc));
        assert!(!conditional(ConditionalRule { allowed: vec!["other".into()], ..base.clone() }).allows(svc));
        assert!(conditional(ConditionalRule { denied: vec!["other".into()], ..base.clone() }).allows(svc));
        assert!(conditional(ConditionalRule { allow_all: true, ..base }).allows(svc));
    }
}
