//! Permissions the workflow needs at each scope.

use warden_core::{AuthorizationScope, ProvisionConfig, RequiredPermission, ScopeKind};

fn required(kind: ScopeKind) -> Vec<RequiredPermission> {
    use RequiredPermission as P;
    match kind {
        ScopeKind::Global => vec![P::critical("orgpolicy.policy.get"), P::optional("orgpolicy.policy.set")],
        ScopeKind::Organization => vec![
            P::critical("resourcemanager.organizations.get"),
            P::optional("resourcemanager.projects.create"),
        ],
        ScopeKind::Project => vec![
            P::critical("resourcemanager.projects.get"),
            P::critical("serviceusage.services.enable"),
            P::optional("serviceusage.services.list"),
            P::critical("iap.brands.create"),
            P::optional("iap.brands.list"),
            P::critical("iam.oauthClients.create"),
            P::optional("iam.oauthClients.update"),
            P::critical("iam.oauthClientCredentials.create"),
            P::optional("iam.oauthClientCredentials.delete"),
            P::optional("iam.oauthClientCredentials.list"),
        ],
    }
}

/// The scope for `kind`, or `None` when the run has no organization and
/// `kind` lives on the organization node.
pub fn required_scope(config: &ProvisionConfig, kind: ScopeKind) -> Option<AuthorizationScope> {
    let target = config.scope_target(kind)?;
    let mut permissions = required(kind);
    // Project creation is only needed when the run may create the project.
    if kind == ScopeKind::Organization && config.create_project {
        for p in &mut permissions {
            if p.id.as_str() == "resourcemanager.projects.create" {
                p.critical = true;
            }
        }
    }
    Some(AuthorizationScope::new(target, permissions))
}

/// Every applicable scope, in processing order.
pub fn required_scopes(config: &ProvisionConfig) -> Vec<AuthorizationScope> {
    ScopeKind::ORDER
        .iter()
        .filter_map(|kind| required_scope(config, *kind))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_only_without_organization() {
        let config = ProvisionConfig {
            project_id: "app".into(),
            ..Default::default()
        };
        let scopes = required_scopes(&config);
        assert_eq!(scopes.len(), 1);
        assert_eq!(scopes[0].target.resource, "projects/app");
    }

    #[test]
    fn scopes_come_in_processing_order() {
        let config = ProvisionConfig {
            project_id: "app".into(),
            organization_id: Some("42".into()),
            ..Default::default()
        };
        let kinds: Vec<_> = required_scopes(&config).iter().map(|s| s.kind()).collect();
        assert_eq!(kinds, ScopeKind::ORDER.to_vec());
    }

    #[test]
    fn project_creation_is_critical_only_when_requested() {
        let mut config = ProvisionConfig {
            project_id: "app".into(),
            organization_id: Some("42".into()),
            ..Default::default()
        };
        let id = "resourcemanager.projects.create".into();

        let org = required_scope(&config, ScopeKind::Organization).unwrap();
        assert!(!org.is_critical(&id));

        config.create_project = true;
        let org = required_scope(&config, ScopeKind::Organization).unwrap();
        assert!(org.is_critical(&id));
    }
}
