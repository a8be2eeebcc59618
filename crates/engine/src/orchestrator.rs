//! End-to-end provisioning workflow.
//!
//! ```text
//! Idle → ValidatingPrincipal → EnforcingPolicy → ReconcilingPermissions
//!      → EnablingServices → EnsuringConsentScreen → EnsuringCredentials
//!      → WiringRedirectUris → Done
//! ```
//!
//! Any step can move the run to `Failed`, which keeps the original cause.
//! Expected failures come back as [`ProvisioningResult::Failed`]; anything
//! else is returned as an error wrapped in [`WardenError::Step`].

use crate::patcher::PolicyPatcher;
use crate::reconciler::{escalate_denied, PermissionReconciler};
use crate::roles::RoleTable;
use crate::scopes::{required_scope, required_scopes};
use crate::waiter::PropagationWaiter;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use warden_core::{
    ApiError, ConsentScreenSpec, ErrorKind, MissingSet, OAuthClient, OAuthClientSpec, PermissionId,
    Principal, ProvisionConfig, ProvisioningResult, ProvisioningState, ReconciliationResult,
    ScopeKind, ScopeTarget, Step, WardenError, WardenResult,
};
use warden_provider::{IdentityProvider, ResourceApi};

const REAUTH_REMEDY: &str = "run `gcloud auth login` and retry with a fresh access token";

/// Whether the acting principal has been resolved and vetted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Session {
    Uninitialized,
    Initialized(Principal),
}

/// Missing permissions at one scope, as reported by [`Provisioner::check`].
#[derive(Debug, Clone, Serialize)]
pub struct ScopeCheck {
    pub scope: ScopeTarget,
    pub missing: MissingSet,
    /// The subset of `missing` the workflow cannot proceed without.
    pub critical: Vec<PermissionId>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TeardownReport {
    pub keys_deleted: Vec<String>,
    pub keys_failed: Vec<String>,
    pub client_deleted: bool,
}

/// Drives one provisioning run. Owns the run's [`ProvisioningState`].
pub struct Provisioner {
    config: ProvisionConfig,
    api: Arc<dyn ResourceApi>,
    identity: Arc<dyn IdentityProvider>,
    roles: Arc<RoleTable>,
    waiter: PropagationWaiter,
    session: Session,
}

impl Provisioner {
    /// Validates `config` and returns an uninitialized provisioner.
    pub fn build(
        config: ProvisionConfig,
        api: Arc<dyn ResourceApi>,
        identity: Arc<dyn IdentityProvider>,
    ) -> WardenResult<Self> {
        config.validate()?;
        let waiter = PropagationWaiter::from(config.wait);
        Ok(Self {
            config,
            api,
            identity,
            roles: Arc::new(RoleTable::default_gcp().clone()),
            waiter,
            session: Session::Uninitialized,
        })
    }

    pub fn with_roles(mut self, roles: RoleTable) -> Self {
        self.roles = Arc::new(roles);
        self
    }

    pub fn with_waiter(mut self, waiter: PropagationWaiter) -> Self {
        self.waiter = waiter;
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn config(&self) -> &ProvisionConfig {
        &self.config
    }

    fn reconciler(&self) -> PermissionReconciler {
        PermissionReconciler::new(self.api.clone(), self.roles.clone(), self.waiter)
            .with_write_attempts(self.config.policy_write_attempts)
    }

    fn patcher(&self) -> PolicyPatcher {
        PolicyPatcher::new(self.api.clone(), self.waiter).with_write_attempts(self.config.policy_write_attempts)
    }

    /// Resolves the acting principal and checks its domain. Idempotent.
    pub async fn initialize(&mut self) -> WardenResult<Principal> {
        if let Session::Initialized(principal) = &self.session {
            return Ok(principal.clone());
        }

        let email = self
            .identity
            .current_principal_email()
            .await
            .map_err(lift_api)?;
        let principal = Principal::parse(&email, self.identity.trust_kind())?;
        principal.ensure_trusted(&self.config.trusted_domain)?;

        tracing::info!(principal = %principal.email, trust = ?principal.trust, "principal validated");
        self.session = Session::Initialized(principal.clone());
        Ok(principal)
    }

    // ── Public operations ────────────────────────────────────

    /// Runs the whole workflow.
    pub async fn provision(&mut self) -> WardenResult<ProvisioningResult> {
        let mut state = ProvisioningState::new();
        tracing::info!(project = %self.config.project_id, "provisioning started");

        for step in Step::WORKFLOW {
            state.advance(step);
            tracing::info!(%step, "step started");

            if let Err(error) = self.run_step(step, &mut state).await {
                let error = lift(error);
                state.fail();
                if error.is_expected() {
                    tracing::warn!(%step, %error, "provisioning stopped");
                    return Ok(ProvisioningResult::Failed { step, error, state });
                }
                tracing::error!(%step, %error, "provisioning fault");
                return Err(WardenError::Step {
                    step,
                    source: Box::new(error),
                });
            }
        }

        state.advance(Step::Done);
        tracing::info!(
            policy_writes = state.policy_writes,
            client_id = state.client_id.as_deref().unwrap_or_default(),
            "provisioning complete"
        );
        Ok(ProvisioningResult::Completed(state))
    }

    /// Reconciles a single scope.
    pub async fn reconcile(&mut self, kind: ScopeKind) -> WardenResult<ReconciliationResult> {
        let fallback = self
            .config
            .scope_target(kind)
            .unwrap_or_else(|| ScopeTarget::new(kind, "organizations/-"));

        let outcome = async {
            let principal = self.initialize().await?;
            let scope = required_scope(&self.config, kind).ok_or_else(|| {
                WardenError::Validation(format!("{kind} scope needs an organization id"))
            })?;
            self.reconciler().ensure_permissions(&scope, &principal).await
        }
        .await
        .map_err(lift);

        match outcome {
            Ok(report) => Ok(ReconciliationResult::Reconciled(report)),
            Err(error) if error.is_expected() => Ok(ReconciliationResult::Failed {
                scope: fallback,
                error,
            }),
            Err(error) => Err(error),
        }
    }

    /// Reports missing permissions at every applicable scope. Never mutates.
    pub async fn check(&mut self) -> WardenResult<Vec<ScopeCheck>> {
        self.initialize().await.map_err(lift)?;
        let reconciler = self.reconciler();

        let mut out = Vec::new();
        for scope in required_scopes(&self.config) {
            let missing = reconciler.check_permissions(&scope).await.map_err(lift)?;
            let critical = scope
                .required
                .iter()
                .filter(|p| p.critical && missing.contains(&p.id))
                .map(|p| p.id.clone())
                .collect();
            out.push(ScopeCheck {
                scope: scope.target,
                missing,
                critical,
            });
        }
        Ok(out)
    }

    /// Deletes the OAuth client's keys, then the client. A missing client is a no-op.
    pub async fn teardown(&mut self) -> WardenResult<TeardownReport> {
        self.initialize().await.map_err(lift)?;
        let project = self.config.project_id.clone();
        let client_id = self.config.client_id.clone();
        let mut report = TeardownReport::default();

        if self
            .api
            .get_oauth_client(&project, &client_id)
            .await
            .map_err(lift_api)?
            .is_none()
        {
            tracing::info!(%client_id, "client does not exist, nothing to tear down");
            return Ok(report);
        }

        let (deleted, failed) = self.delete_keys(&project, &client_id).await?;
        report.keys_deleted = deleted;
        report.keys_failed = failed;

        match self.api.delete_oauth_client(&project, &client_id).await {
            Ok(()) => report.client_deleted = true,
            Err(e) if e.is(ErrorKind::NotFound) => {}
            Err(e) => return Err(lift(e.into())),
        }
        tracing::info!(%client_id, keys = report.keys_deleted.len(), "teardown complete");
        Ok(report)
    }

    // ── Steps ────────────────────────────────────────────────

    async fn run_step(&mut self, step: Step, state: &mut ProvisioningState) -> WardenResult<()> {
        match step {
            Step::ValidatingPrincipal => {
                state.principal = Some(self.initialize().await?);
                Ok(())
            }
            Step::EnforcingPolicy => self.enforce_policy(state).await,
            Step::ReconcilingPermissions => self.reconcile_permissions(state).await,
            Step::EnablingServices => self.enable_services(state).await,
            Step::EnsuringConsentScreen => self.ensure_consent_screen(state).await,
            Step::EnsuringCredentials => self.ensure_credentials(state).await,
            Step::WiringRedirectUris => self.wire_redirect_uris(state).await,
            Step::Idle | Step::Done | Step::Failed => Err(WardenError::Internal(format!(
                "`{step}` is not a working step"
            ))),
        }
    }

    fn principal(&self) -> WardenResult<&Principal> {
        match &self.session {
            Session::Initialized(principal) => Ok(principal),
            Session::Uninitialized => Err(WardenError::Internal("session not initialized".into())),
        }
    }

    /// Global scope (the org-policy tier) is reconciled here, ahead of the
    /// patch that needs it.
    async fn enforce_policy(&self, state: &mut ProvisioningState) -> WardenResult<()> {
        let Some(organization) = self.config.organization_resource() else {
            tracing::info!("no organization configured, skipping constraint policy");
            return Ok(());
        };

        self.reconcile_scope(ScopeKind::Global, state).await?;

        let patcher = self.patcher();
        for service in &self.config.services {
            let outcome = patcher
                .ensure_service_allowed(&organization, &self.config.constraint, service)
                .await?;
            tracing::debug!(%service, ?outcome, "constraint checked");
        }
        Ok(())
    }

    async fn reconcile_permissions(&self, state: &mut ProvisioningState) -> WardenResult<()> {
        self.reconcile_scope(ScopeKind::Organization, state).await?;
        self.ensure_project(state).await?;
        self.reconcile_scope(ScopeKind::Project, state).await
    }

    async fn reconcile_scope(&self, kind: ScopeKind, state: &mut ProvisioningState) -> WardenResult<()> {
        let Some(scope) = required_scope(&self.config, kind) else {
            return Ok(());
        };
        let report = self.reconciler().ensure_permissions(&scope, self.principal()?).await?;
        state.policy_writes += report.policy_writes;
        state
            .granted
            .extend(report.granted.into_iter().map(|bundle| (kind, bundle)));
        Ok(())
    }

    async fn ensure_project(&self, state: &mut ProvisioningState) -> WardenResult<()> {
        let project_id = &self.config.project_id;
        // Resource Manager answers 403 for projects that exist but are hidden
        // from the caller, and for ones that do not exist at all.
        let hidden = match self.api.get_project(project_id).await {
            Ok(Some(_)) => return Ok(()),
            Ok(None) => false,
            Err(e) if e.is(ErrorKind::PermissionDenied) => true,
            Err(e) => return Err(e.into()),
        };

        let parent = match (self.config.create_project, self.config.organization_resource()) {
            (true, Some(parent)) => parent,
            _ if hidden => {
                return Err(WardenError::Validation(format!(
                    "project `{project_id}` is not visible: it does not exist or the principal lacks \
                     `resourcemanager.projects.get`; grant access or enable project creation"
                )))
            }
            _ => {
                return Err(WardenError::Validation(format!(
                    "project `{project_id}` does not exist; create it or enable project creation"
                )))
            }
        };

        let org_scope = ScopeTarget::new(ScopeKind::Organization, parent.clone());
        match self.api.create_project(project_id, &parent).await {
            Ok(()) => tracing::info!(%project_id, %parent, "project created"),
            Err(e) if e.is(ErrorKind::AlreadyExists) => {
                return Err(WardenError::ResourceConflict(format!(
                    "project id `{project_id}` is taken by a project this principal cannot see"
                )))
            }
            Err(e) => return Err(escalate_denied(e, "resourcemanager.projects.create", &org_scope)),
        }

        let api = &self.api;
        self.waiter
            .wait_for(&format!("project `{project_id}` to become visible"), || async move {
                match api.get_project(project_id).await {
                    Err(e) if e.is(ErrorKind::PermissionDenied) => Ok(false),
                    found => Ok(found?.is_some()),
                }
            })
            .await?;
        state.project_created = true;
        Ok(())
    }

    async fn enable_services(&self, state: &mut ProvisioningState) -> WardenResult<()> {
        let project_id = &self.config.project_id;
        let scope = ScopeTarget::new(ScopeKind::Project, self.config.project_resource());
        let wanted: BTreeSet<String> = self.config.services.iter().cloned().collect();

        let enabled = self
            .api
            .list_enabled_services(project_id)
            .await
            .map_err(|e| escalate_denied(e, "serviceusage.services.list", &scope))?;

        let pending: Vec<&String> = wanted.difference(&enabled).collect();
        if pending.is_empty() {
            tracing::info!(services = wanted.len(), "services already enabled");
            state.enabled_services = wanted;
            return Ok(());
        }

        for service in &pending {
            match self.api.enable_service(project_id, service).await {
                Ok(()) => tracing::info!(service = %service, "service enable requested"),
                Err(e) if e.is(ErrorKind::PermissionDenied) => {
                    return Err(WardenError::escalation("serviceusage.services.enable", &scope))
                }
                Err(e) if e.is(ErrorKind::ConstraintViolation) => {
                    return Err(WardenError::PolicyConflict {
                        constraint: self.config.constraint.clone(),
                        reason: e.message,
                    })
                }
                Err(e) => return Err(e.into()),
            }
        }

        let (api, expected) = (&self.api, &wanted);
        self.waiter
            .wait_for("services to report enabled", || async move {
                let now = api.list_enabled_services(project_id).await?;
                Ok(expected.is_subset(&now))
            })
            .await?;

        state.enabled_services = wanted;
        Ok(())
    }

    async fn ensure_consent_screen(&self, state: &mut ProvisioningState) -> WardenResult<()> {
        let project_id = &self.config.project_id;
        let scope = ScopeTarget::new(ScopeKind::Project, self.config.project_resource());
        let spec = ConsentScreenSpec {
            application_title: self.config.application_title.clone(),
            support_email: self.config.support_email.clone(),
        };

        let existing = self
            .api
            .get_consent_screen(project_id)
            .await
            .map_err(|e| escalate_denied(e, "iap.brands.list", &scope))?;

        let screen = match existing {
            Some(screen) => screen,
            None => match self.api.create_consent_screen(project_id, &spec).await {
                Ok(screen) => {
                    tracing::info!(name = %screen.name, "consent screen created");
                    screen
                }
                Err(e) if e.is(ErrorKind::AlreadyExists) => {
                    // Created concurrently; verify it below.
                    self.api.get_consent_screen(project_id).await?.ok_or_else(|| {
                        WardenError::ResourceConflict("consent screen reported existing but is not readable".into())
                    })?
                }
                Err(e) => return Err(escalate_denied(e, "iap.brands.create", &scope)),
            },
        };

        if !screen.matches(&spec) {
            return Err(WardenError::ResourceConflict(format!(
                "consent screen `{}` is titled `{}` with support email `{}`; consent screens cannot be edited once created",
                screen.name, screen.application_title, screen.support_email
            )));
        }
        state.consent_screen = Some(screen.name);
        Ok(())
    }

    async fn ensure_credentials(&self, state: &mut ProvisioningState) -> WardenResult<()> {
        let project_id = &self.config.project_id;
        let client_id = &self.config.client_id;
        let scope = ScopeTarget::new(ScopeKind::Project, self.config.project_resource());
        let spec = OAuthClientSpec {
            client_id: client_id.clone(),
            display_name: self.config.client_display_name.clone(),
            redirect_uris: self.config.redirect_uris.iter().cloned().collect(),
        };

        let client = match self.api.get_oauth_client(project_id, client_id).await? {
            Some(client) => client,
            None => match self.api.create_oauth_client(project_id, &spec).await {
                Ok(client) => {
                    tracing::info!(%client_id, "oauth client created");
                    client
                }
                Err(e) if e.is(ErrorKind::AlreadyExists) => self
                    .api
                    .get_oauth_client(project_id, client_id)
                    .await?
                    .ok_or_else(|| {
                        WardenError::ResourceConflict(format!(
                            "client id `{client_id}` is reserved by a deleted client"
                        ))
                    })?,
                Err(e) => return Err(escalate_denied(e, "iam.oauthClients.create", &scope)),
            },
        };

        if client.display_name != spec.display_name {
            return Err(WardenError::ResourceConflict(format!(
                "client `{client_id}` exists with display name `{}`, expected `{}`",
                client.display_name, spec.display_name
            )));
        }
        state.client_id = Some(client.client_id.clone());

        // One active key: clear out whatever exists, then mint a fresh one.
        self.delete_keys(project_id, client_id).await?;
        let key = self
            .api
            .create_client_key(project_id, client_id)
            .await
            .map_err(|e| escalate_denied(e, "iam.oauthClientCredentials.create", &scope))?;
        tracing::info!(%client_id, key_id = %key.key_id, "client key created");

        state.key_id = Some(key.key_id);
        state.client_secret = key.secret;
        Ok(())
    }

    /// Deletes every key on the client. Individual failures are logged and
    /// skipped. Returns (deleted, failed) key ids.
    async fn delete_keys(&self, project_id: &str, client_id: &str) -> WardenResult<(Vec<String>, Vec<String>)> {
        let scope = ScopeTarget::new(ScopeKind::Project, self.config.project_resource());
        let keys = self
            .api
            .list_client_keys(project_id, client_id)
            .await
            .map_err(|e| escalate_denied(e, "iam.oauthClientCredentials.list", &scope))?;

        let (mut deleted, mut failed) = (Vec::new(), Vec::new());
        for key in keys {
            match self.api.delete_client_key(project_id, client_id, &key.key_id).await {
                Ok(()) => {
                    tracing::info!(client_id, key_id = %key.key_id, "client key deleted");
                    deleted.push(key.key_id);
                }
                Err(e) => {
                    tracing::warn!(client_id, key_id = %key.key_id, error = %e, "could not delete client key");
                    failed.push(key.key_id);
                }
            }
        }
        Ok((deleted, failed))
    }

    async fn wire_redirect_uris(&self, state: &mut ProvisioningState) -> WardenResult<()> {
        let project_id = &self.config.project_id;
        let client_id = &self.config.client_id;
        let scope = ScopeTarget::new(ScopeKind::Project, self.config.project_resource());
        let wanted: BTreeSet<String> = self.config.redirect_uris.iter().cloned().collect();

        let client = self
            .api
            .get_oauth_client(project_id, client_id)
            .await?
            .ok_or_else(|| WardenError::ResourceConflict(format!("client `{client_id}` disappeared")))?;

        if client.allows_all(&wanted) {
            tracing::info!(%client_id, uris = wanted.len(), "redirect URIs already registered");
            state.redirect_uris = client.redirect_uris;
            return Ok(());
        }

        let merged: BTreeSet<String> = client.redirect_uris.union(&wanted).cloned().collect();
        let updated = OAuthClient {
            redirect_uris: merged,
            ..client
        };
        let stored = self
            .api
            .update_oauth_client(project_id, &updated)
            .await
            .map_err(|e| escalate_denied(e, "iam.oauthClients.update", &scope))?;
        tracing::info!(%client_id, uris = stored.redirect_uris.len(), "redirect URIs updated");

        state.redirect_uris = stored.redirect_uris;
        Ok(())
    }
}

/// Stale credentials surface as an authentication failure with a remedy.
fn lift_api(e: ApiError) -> WardenError {
    lift(e.into())
}

fn lift(error: WardenError) -> WardenError {
    match error {
        WardenError::Api(e) if e.is(ErrorKind::Reauthenticate) => WardenError::Authentication {
            reason: e.message,
            remedy: REAUTH_REMEDY.to_string(),
        },
        other => other,
    }
}
