//! E2E tests against live Google Cloud APIs. Read-only.
//!
//! Run: `WARDEN_ACCESS_TOKEN=$(gcloud auth print-access-token) WARDEN_PROJECT=my-app \
//!       cargo test -p warden-engine --test e2e -- --ignored`

use std::sync::Arc;
use warden_core::{ProvisionConfig, ScopeKind, Secret, TrustKind};
use warden_engine::Provisioner;
use warden_provider::{GcpGateway, IdentityProvider, ResourceApi, RetryPolicy, TokenInfoIdentity};

fn token() -> Secret {
    Secret::new(std::env::var("WARDEN_ACCESS_TOKEN").expect("Set WARDEN_ACCESS_TOKEN to run E2E tests"))
}

fn project() -> String {
    std::env::var("WARDEN_PROJECT").expect("Set WARDEN_PROJECT to run E2E tests")
}

#[tokio::test]
#[ignore]
async fn token_resolves_to_an_email() {
    let identity = TokenInfoIdentity::new(token(), TrustKind::InteractiveUser, RetryPolicy::default())
        .expect("identity client");
    let email = identity.current_principal_email().await.expect("tokeninfo failed");

    assert!(email.contains('@'));
    eprintln!("[e2e] token belongs to {email}");
}

#[tokio::test]
#[ignore]
async fn project_and_services_are_readable() {
    let gateway = GcpGateway::new(token(), RetryPolicy::default()).expect("gateway");
    let project_id = project();

    let found = gateway.get_project(&project_id).await.expect("getProject failed");
    assert!(found.is_some(), "project {project_id} should be visible");

    let services = gateway
        .list_enabled_services(&project_id)
        .await
        .expect("listServices failed");
    eprintln!("[e2e] {project_id}: {} services enabled", services.len());
}

#[tokio::test]
#[ignore]
async fn check_reports_project_scope() {
    let identity = TokenInfoIdentity::new(token(), TrustKind::InteractiveUser, RetryPolicy::default())
        .expect("identity client");
    let email = identity.current_principal_email().await.expect("tokeninfo failed");
    let domain = email.rsplit('@').next().unwrap_or_default().to_string();

    let config = ProvisionConfig {
        project_id: project(),
        organization_id: std::env::var("WARDEN_ORGANIZATION").ok(),
        trusted_domain: domain,
        application_title: "Warden E2E".into(),
        support_email: email,
        redirect_uris: vec!["https://localhost.example.com/callback".into()],
        ..Default::default()
    };
    let gateway = GcpGateway::new(token(), RetryPolicy::default()).expect("gateway");
    let mut provisioner =
        Provisioner::build(config, Arc::new(gateway), Arc::new(identity)).expect("valid config");

    let checks = provisioner.check().await.expect("check failed");
    let project_check = checks
        .iter()
        .find(|c| c.scope.kind == ScopeKind::Project)
        .expect("project scope is always checked");

    eprintln!(
        "[e2e] {}: {} missing, {} critical",
        project_check.scope.resource,
        project_check.missing.len(),
        project_check.critical.len()
    );
}
