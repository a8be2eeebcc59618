//! In-memory cloud implementing [`ResourceApi`].
//!
//! Used by `warden provision --dry-run` and by the engine tests. Models
//! etag-guarded policy writes, org-to-project policy inheritance, constraint
//! enforcement on service enablement, propagation lag, and one-shot faults.
//!
//! ```ignore
//! let cloud = InMemoryCloud::new()
//!     .with_caller("user:alice@example.com")
//!     .with_role("roles/editor", &["iap.brands.create"])
//!     .with_project("my-app", Some("organizations/1"))
//!     .with_propagation_lag(2);
//! cloud.fail_next(ops::SET_POLICY, ErrorKind::StaleToken);
//! ```

use crate::{ops, ResourceApi};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use warden_core::error::{ApiError, ApiResult};
use warden_core::{
    ClientKey, ConsentScreen, ConsentScreenSpec, ConstraintPolicy, ErrorKind, OAuthClient,
    OAuthClientSpec, PermissionId, PolicyDocument, PolicyToken, Project, RoleBundle, ScopeTarget,
    Secret,
};

const OWNER_ROLE: &str = "roles/owner";

#[derive(Debug, Default)]
struct CloudState {
    caller: String,
    enforce: bool,
    catalog: BTreeMap<RoleBundle, BTreeSet<PermissionId>>,
    policies: BTreeMap<String, PolicyDocument>,
    etag_seq: u64,
    lag: u32,
    /// Pre-write documents still visible to permission checks, with the
    /// number of polls left before the write shows through.
    stale_views: BTreeMap<String, (PolicyDocument, u32)>,
    /// Keyed by (organization, constraint).
    constraints: BTreeMap<(String, String), ConstraintPolicy>,
    /// Pre-write constraint policies still returned by reads.
    stale_constraints: BTreeMap<(String, String), (Option<ConstraintPolicy>, u32)>,
    projects: BTreeMap<String, Project>,
    services: BTreeMap<String, BTreeSet<String>>,
    brands: BTreeMap<String, ConsentScreen>,
    /// Keyed by (project, client id).
    clients: BTreeMap<(String, String), OAuthClient>,
    keys: BTreeMap<(String, String), Vec<String>>,
    key_seq: u64,
    faults: HashMap<String, VecDeque<ErrorKind>>,
    calls: Vec<String>,
}

impl CloudState {
    /// Records the call and pops a queued fault for it, if any.
    fn begin(&mut self, op: &'static str) -> ApiResult<()> {
        self.calls.push(op.to_string());
        match self.faults.get_mut(op).and_then(VecDeque::pop_front) {
            Some(kind) => Err(ApiError::new(op, kind, "injected fault")),
            None => Ok(()),
        }
    }

    fn next_etag(&mut self) -> PolicyToken {
        self.etag_seq += 1;
        PolicyToken(format!("etag-{}", self.etag_seq))
    }

    /// The resource plus its ancestors, nearest first.
    fn hierarchy(&self, resource: &str) -> Vec<String> {
        let mut chain = vec![resource.to_string()];
        if let Some(project) = resource
            .strip_prefix("projects/")
            .and_then(|id| self.projects.get(id))
        {
            if let Some(parent) = &project.parent {
                chain.push(parent.clone());
            }
        }
        chain
    }

    /// Permissions `caller` holds on `resource` as currently visible.
    ///
    /// `consume_lag` burns one poll from any stale view it reads through.
    fn effective_permissions(&mut self, resource: &str, consume_lag: bool) -> BTreeSet<PermissionId> {
        let mut held = BTreeSet::new();
        for node in self.hierarchy(resource) {
            let doc = match self.stale_views.get_mut(&node) {
                Some((old, remaining)) if *remaining > 0 => {
                    if consume_lag {
                        *remaining -= 1;
                    }
                    old.clone()
                }
                _ => self.policies.get(&node).cloned().unwrap_or_default(),
            };

            for binding in doc.bindings.iter().filter(|b| b.condition.is_none()) {
                if binding.members.contains(&self.caller) {
                    if let Some(perms) = self.catalog.get(&binding.role) {
                        held.extend(perms.iter().cloned());
                    }
                }
            }
        }
        self.stale_views.retain(|_, (_, remaining)| *remaining > 0);
        held
    }

    fn authorize(&mut self, op: &'static str, resource: &str, permission: &str) -> ApiResult<()> {
        if !self.enforce {
            return Ok(());
        }
        if self
            .effective_permissions(resource, false)
            .contains(&PermissionId::from(permission))
        {
            return Ok(());
        }
        Err(ApiError::new(
            op,
            ErrorKind::PermissionDenied,
            format!("permission `{permission}` denied on `{resource}`"),
        ))
    }

    fn project(&self, op: &'static str, project_id: &str) -> ApiResult<&Project> {
        self.projects
            .get(project_id)
            .ok_or_else(|| ApiError::new(op, ErrorKind::NotFound, format!("project `{project_id}` not found")))
    }

    fn ensure_resource(&self, op: &'static str, resource: &str) -> ApiResult<()> {
        match resource.strip_prefix("projects/") {
            Some(id) => self.project(op, id).map(|_| ()),
            None => Ok(()),
        }
    }
}

/// Thread-safe fake of the cloud control plane.
#[derive(Debug, Default)]
pub struct InMemoryCloud {
    inner: Mutex<CloudState>,
}

impl InMemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CloudState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_mut(&mut self) -> &mut CloudState {
        self.inner.get_mut().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Seeding ──────────────────────────────────────────────

    /// IAM member string of the acting principal, e.g. `user:alice@example.com`.
    pub fn with_caller(mut self, member: impl Into<String>) -> Self {
        self.state_mut().caller = member.into();
        self
    }

    /// Makes every operation check the caller's permissions first.
    pub fn with_enforcement(mut self) -> Self {
        self.state_mut().enforce = true;
        self
    }

    pub fn with_role(mut self, role: &str, permissions: &[&str]) -> Self {
        self.state_mut()
            .catalog
            .entry(RoleBundle::new(role))
            .or_default()
            .extend(permissions.iter().map(|p| PermissionId::from(*p)));
        self
    }

    pub fn with_catalog(mut self, catalog: BTreeMap<RoleBundle, BTreeSet<PermissionId>>) -> Self {
        let state = self.state_mut();
        for (role, perms) in catalog {
            state.catalog.entry(role).or_default().extend(perms);
        }
        self
    }

    pub fn with_binding(mut self, resource: &str, role: &str, member: &str) -> Self {
        let state = self.state_mut();
        let token = state.next_etag();
        let doc = state.policies.entry(resource.to_string()).or_default();
        doc.grant(&RoleBundle::new(role), member);
        doc.token = token;
        self
    }

    pub fn with_project(mut self, project_id: &str, parent: Option<&str>) -> Self {
        self.state_mut().projects.insert(
            project_id.to_string(),
            Project {
                project_id: project_id.to_string(),
                parent: parent.map(str::to_string),
            },
        );
        self
    }

    pub fn with_constraint(mut self, organization: &str, policy: ConstraintPolicy) -> Self {
        self.state_mut()
            .constraints
            .insert((organization.to_string(), policy.constraint.clone()), policy);
        self
    }

    pub fn with_enabled_service(mut self, project_id: &str, service: &str) -> Self {
        self.state_mut()
            .services
            .entry(project_id.to_string())
            .or_default()
            .insert(service.to_string());
        self
    }

    pub fn with_consent_screen(mut self, project_id: &str, screen: ConsentScreen) -> Self {
        self.state_mut().brands.insert(project_id.to_string(), screen);
        self
    }

    pub fn with_client(mut self, project_id: &str, client: OAuthClient) -> Self {
        self.state_mut()
            .clients
            .insert((project_id.to_string(), client.client_id.clone()), client);
        self
    }

    pub fn with_key(mut self, project_id: &str, client_id: &str, key_id: &str) -> Self {
        self.state_mut()
            .keys
            .entry((project_id.to_string(), client_id.to_string()))
            .or_default()
            .push(key_id.to_string());
        self
    }

    /// Number of permission checks (and constraint policy reads) that still
    /// see a policy as it was before each write.
    pub fn with_propagation_lag(mut self, polls: u32) -> Self {
        self.state_mut().lag = polls;
        self
    }

    // ── Fault injection and inspection ───────────────────────

    /// Queues a one-shot failure for the next call to `op`.
    pub fn fail_next(&self, op: &str, kind: ErrorKind) {
        self.lock()
            .faults
            .entry(op.to_string())
            .or_default()
            .push_back(kind);
    }

    /// Every operation invoked so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.lock().calls.iter().filter(|c| c.as_str() == op).count()
    }

    pub fn policy(&self, resource: &str) -> PolicyDocument {
        self.lock().policies.get(resource).cloned().unwrap_or_default()
    }

    pub fn constraint(&self, organization: &str, constraint: &str) -> Option<ConstraintPolicy> {
        self.lock()
            .constraints
            .get(&(organization.to_string(), constraint.to_string()))
            .cloned()
    }

    pub fn project_exists(&self, project_id: &str) -> bool {
        self.lock().projects.contains_key(project_id)
    }

    pub fn enabled_services(&self, project_id: &str) -> BTreeSet<String> {
        self.lock().services.get(project_id).cloned().unwrap_or_default()
    }

    pub fn consent_screen(&self, project_id: &str) -> Option<ConsentScreen> {
        self.lock().brands.get(project_id).cloned()
    }

    pub fn client(&self, project_id: &str, client_id: &str) -> Option<OAuthClient> {
        self.lock()
            .clients
            .get(&(project_id.to_string(), client_id.to_string()))
            .cloned()
    }

    pub fn key_ids(&self, project_id: &str, client_id: &str) -> Vec<String> {
        self.lock()
            .keys
            .get(&(project_id.to_string(), client_id.to_string()))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl ResourceApi for InMemoryCloud {
    async fn test_permissions(
        &self,
        scope: &ScopeTarget,
        permissions: &[PermissionId],
    ) -> ApiResult<BTreeSet<PermissionId>> {
        let mut state = self.lock();
        state.begin(ops::TEST_PERMISSIONS)?;
        let held = state.effective_permissions(&scope.resource, true);
        Ok(permissions
            .iter()
            .filter(|p| held.contains(*p))
            .cloned()
            .collect())
    }

    async fn get_policy(&self, scope: &ScopeTarget) -> ApiResult<PolicyDocument> {
        let op = ops::GET_POLICY;
        let mut state = self.lock();
        state.begin(op)?;
        state.ensure_resource(op, &scope.resource)?;
        state.authorize(op, &scope.resource, scope.kind.get_policy_permission())?;
        Ok(state.policies.get(&scope.resource).cloned().unwrap_or_default())
    }

    async fn set_policy(&self, scope: &ScopeTarget, policy: &PolicyDocument) -> ApiResult<PolicyDocument> {
        let op = ops::SET_POLICY;
        let mut state = self.lock();
        state.begin(op)?;
        state.ensure_resource(op, &scope.resource)?;
        state.authorize(op, &scope.resource, scope.kind.set_policy_permission())?;

        let current = state.policies.get(&scope.resource).cloned().unwrap_or_default();
        if !policy.token.0.is_empty() && policy.token != current.token {
            return Err(ApiError::new(
                op,
                ErrorKind::StaleToken,
                "There were concurrent policy changes. Please retry the whole read-modify-write.",
            ));
        }

        let mut written = policy.clone();
        written.token = state.next_etag();

        if state.lag > 0 {
            let lag = state.lag;
            state
                .stale_views
                .entry(scope.resource.clone())
                .and_modify(|(_, remaining)| *remaining = lag)
                .or_insert((current, lag));
        }
        state.policies.insert(scope.resource.clone(), written.clone());
        Ok(written)
    }

    async fn get_constraint_policy(
        &self,
        organization: &str,
        constraint: &str,
    ) -> ApiResult<Option<ConstraintPolicy>> {
        let op = ops::GET_CONSTRAINT;
        let mut state = self.lock();
        state.begin(op)?;
        state.authorize(op, organization, "orgpolicy.policy.get")?;

        let key = (organization.to_string(), constraint.to_string());
        if let Some((old, remaining)) = state.stale_constraints.get_mut(&key) {
            *remaining -= 1;
            let old = old.clone();
            if *remaining == 0 {
                state.stale_constraints.remove(&key);
            }
            return Ok(old);
        }
        Ok(state.constraints.get(&key).cloned())
    }

    async fn set_constraint_policy(
        &self,
        organization: &str,
        policy: &ConstraintPolicy,
    ) -> ApiResult<ConstraintPolicy> {
        let op = ops::SET_CONSTRAINT;
        let mut state = self.lock();
        state.begin(op)?;
        state.authorize(op, organization, "orgpolicy.policy.set")?;

        let key = (organization.to_string(), policy.constraint.clone());
        if let Some(current) = state.constraints.get(&key) {
            if !policy.token.0.is_empty() && policy.token != current.token {
                return Err(ApiError::new(op, ErrorKind::StaleToken, "etag mismatch"));
            }
        }

        let mut written = policy.clone();
        written.token = state.next_etag();
        if state.lag > 0 {
            let (lag, previous) = (state.lag, state.constraints.get(&key).cloned());
            state.stale_constraints.insert(key.clone(), (previous, lag));
        }
        state.constraints.insert(key, written.clone());
        Ok(written)
    }

    async fn get_project(&self, project_id: &str) -> ApiResult<Option<Project>> {
        let mut state = self.lock();
        state.begin(ops::GET_PROJECT)?;
        Ok(state.projects.get(project_id).cloned())
    }

    async fn create_project(&self, project_id: &str, parent: &str) -> ApiResult<()> {
        let op = ops::CREATE_PROJECT;
        let mut state = self.lock();
        state.begin(op)?;
        state.authorize(op, parent, "resourcemanager.projects.create")?;
        if state.projects.contains_key(project_id) {
            return Err(ApiError::new(
                op,
                ErrorKind::AlreadyExists,
                format!("project `{project_id}` already exists"),
            ));
        }

        state.projects.insert(
            project_id.to_string(),
            Project {
                project_id: project_id.to_string(),
                parent: Some(parent.to_string()),
            },
        );

        // The creator owns the new project.
        let caller = state.caller.clone();
        let token = state.next_etag();
        let doc = state.policies.entry(format!("projects/{project_id}")).or_default();
        doc.grant(&RoleBundle::new(OWNER_ROLE), &caller);
        doc.token = token;
        Ok(())
    }

    async fn list_enabled_services(&self, project_id: &str) -> ApiResult<BTreeSet<String>> {
        let op = ops::LIST_SERVICES;
        let mut state = self.lock();
        state.begin(op)?;
        state.project(op, project_id)?;
        state.authorize(op, &format!("projects/{project_id}"), "serviceusage.services.list")?;
        Ok(state.services.get(project_id).cloned().unwrap_or_default())
    }

    async fn enable_service(&self, project_id: &str, service: &str) -> ApiResult<()> {
        let op = ops::ENABLE_SERVICE;
        let mut state = self.lock();
        state.begin(op)?;
        let parent = state.project(op, project_id)?.parent.clone();
        state.authorize(op, &format!("projects/{project_id}"), "serviceusage.services.enable")?;

        if let Some(org) = parent {
            let blocked = state
                .constraints
                .iter()
                .find(|((o, _), policy)| o == &org && !policy.allows(service));
            if let Some(((_, constraint), _)) = blocked {
                return Err(ApiError::new(
                    op,
                    ErrorKind::ConstraintViolation,
                    format!("`{service}` violates constraint `{constraint}`"),
                ));
            }
        }

        state
            .services
            .entry(project_id.to_string())
            .or_default()
            .insert(service.to_string());
        Ok(())
    }

    async fn get_consent_screen(&self, project_id: &str) -> ApiResult<Option<ConsentScreen>> {
        let op = ops::GET_BRAND;
        let mut state = self.lock();
        state.begin(op)?;
        state.project(op, project_id)?;
        state.authorize(op, &format!("projects/{project_id}"), "iap.brands.list")?;
        Ok(state.brands.get(project_id).cloned())
    }

    async fn create_consent_screen(
        &self,
        project_id: &str,
        spec: &ConsentScreenSpec,
    ) -> ApiResult<ConsentScreen> {
        let op = ops::CREATE_BRAND;
        let mut state = self.lock();
        state.begin(op)?;
        state.project(op, project_id)?;
        state.authorize(op, &format!("projects/{project_id}"), "iap.brands.create")?;
        if state.brands.contains_key(project_id) {
            return Err(ApiError::new(
                op,
                ErrorKind::AlreadyExists,
                "a brand already exists for this project",
            ));
        }

        let screen = ConsentScreen {
            name: format!("projects/{project_id}/brands/1"),
            application_title: spec.application_title.clone(),
            support_email: spec.support_email.clone(),
        };
        state.brands.insert(project_id.to_string(), screen.clone());
        Ok(screen)
    }

    async fn get_oauth_client(&self, project_id: &str, client_id: &str) -> ApiResult<Option<OAuthClient>> {
        let mut state = self.lock();
        state.begin(ops::GET_CLIENT)?;
        Ok(state
            .clients
            .get(&(project_id.to_string(), client_id.to_string()))
            .cloned())
    }

    async fn create_oauth_client(&self, project_id: &str, spec: &OAuthClientSpec) -> ApiResult<OAuthClient> {
        let op = ops::CREATE_CLIENT;
        let mut state = self.lock();
        state.begin(op)?;
        state.project(op, project_id)?;
        state.authorize(op, &format!("projects/{project_id}"), "iam.oauthClients.create")?;

        let key = (project_id.to_string(), spec.client_id.clone());
        if state.clients.contains_key(&key) {
            return Err(ApiError::new(
                op,
                ErrorKind::AlreadyExists,
                format!("client `{}` already exists", spec.client_id),
            ));
        }

        let client = OAuthClient {
            client_id: spec.client_id.clone(),
            display_name: spec.display_name.clone(),
            redirect_uris: spec.redirect_uris.clone(),
        };
        state.clients.insert(key, client.clone());
        Ok(client)
    }

    async fn update_oauth_client(&self, project_id: &str, client: &OAuthClient) -> ApiResult<OAuthClient> {
        let op = ops::UPDATE_CLIENT;
        let mut state = self.lock();
        state.begin(op)?;
        state.authorize(op, &format!("projects/{project_id}"), "iam.oauthClients.update")?;

        let key = (project_id.to_string(), client.client_id.clone());
        match state.clients.get_mut(&key) {
            Some(existing) => {
                *existing = client.clone();
                Ok(client.clone())
            }
            None => Err(ApiError::new(
                op,
                ErrorKind::NotFound,
                format!("client `{}` not found", client.client_id),
            )),
        }
    }

    async fn delete_oauth_client(&self, project_id: &str, client_id: &str) -> ApiResult<()> {
        let op = ops::DELETE_CLIENT;
        let mut state = self.lock();
        state.begin(op)?;
        let key = (project_id.to_string(), client_id.to_string());
        if state.clients.remove(&key).is_none() {
            return Err(ApiError::new(
                op,
                ErrorKind::NotFound,
                format!("client `{client_id}` not found"),
            ));
        }
        state.keys.remove(&key);
        Ok(())
    }

    async fn list_client_keys(&self, project_id: &str, client_id: &str) -> ApiResult<Vec<ClientKey>> {
        let op = ops::LIST_KEYS;
        let mut state = self.lock();
        state.begin(op)?;
        state.authorize(op, &format!("projects/{project_id}"), "iam.oauthClientCredentials.list")?;
        Ok(state
            .keys
            .get(&(project_id.to_string(), client_id.to_string()))
            .map(|ids| {
                ids.iter()
                    .map(|id| ClientKey {
                        key_id: id.clone(),
                        secret: None,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create_client_key(&self, project_id: &str, client_id: &str) -> ApiResult<ClientKey> {
        let op = ops::CREATE_KEY;
        let mut state = self.lock();
        state.begin(op)?;
        state.authorize(op, &format!("projects/{project_id}"), "iam.oauthClientCredentials.create")?;

        let key = (project_id.to_string(), client_id.to_string());
        if !state.clients.contains_key(&key) {
            return Err(ApiError::new(
                op,
                ErrorKind::NotFound,
                format!("client `{client_id}` not found"),
            ));
        }

        state.key_seq += 1;
        let key_id = format!("key-{}", state.key_seq);
        let secret = Secret::new(format!("GOCSPX-inmemory-{client_id}-{}", state.key_seq));
        state.keys.entry(key).or_default().push(key_id.clone());
        Ok(ClientKey {
            key_id,
            secret: Some(secret),
        })
    }

    async fn delete_client_key(&self, project_id: &str, client_id: &str, key_id: &str) -> ApiResult<()> {
        let op = ops::DELETE_KEY;
        let mut state = self.lock();
        state.begin(op)?;
        state.authorize(op, &format!("projects/{project_id}"), "iam.oauthClientCredentials.delete")?;

        let ids = state
            .keys
            .get_mut(&(project_id.to_string(), client_id.to_string()))
            .ok_or_else(|| ApiError::new(op, ErrorKind::NotFound, format!("client `{client_id}` has no keys")))?;
        let before = ids.len();
        ids.retain(|id| id != key_id);
        if ids.len() == before {
            return Err(ApiError::new(
                op,
                ErrorKind::NotFound,
                format!("key `{key_id}` not found"),
            ));
        }
        Ok(())
    }
}
