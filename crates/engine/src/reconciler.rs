//! Per-scope permission reconciliation.
//!
//! Measures which required permissions the principal lacks at a scope and
//! closes the gap by binding the principal to covering role bundles:
//!
//! 1. batch-test the required permissions;
//! 2. map each missing one to its bundle;
//! 3. read the scope's policy, add the missing bindings, write it back with
//!    the token it was read with (stale token: redo the whole cycle, bounded);
//! 4. wait for the grants to become visible;
//! 5. escalate if a critical permission is still missing.

use crate::roles::RoleTable;
use crate::waiter::PropagationWaiter;
use std::collections::BTreeSet;
use std::sync::Arc;
use warden_core::{
    ApiError, AuthorizationScope, ErrorKind, MissingSet, PermissionId, Principal, ReconcileReport,
    RoleBundle, ScopeTarget, WardenError, WardenResult,
};
use warden_provider::ResourceApi;

pub const DEFAULT_WRITE_ATTEMPTS: u32 = 3;

/// Stateless: nothing read from the remote side outlives a call.
pub struct PermissionReconciler {
    api: Arc<dyn ResourceApi>,
    roles: Arc<RoleTable>,
    waiter: PropagationWaiter,
    write_attempts: u32,
}

impl PermissionReconciler {
    pub fn new(api: Arc<dyn ResourceApi>, roles: Arc<RoleTable>, waiter: PropagationWaiter) -> Self {
        Self {
            api,
            roles,
            waiter,
            write_attempts: DEFAULT_WRITE_ATTEMPTS,
        }
    }

    pub fn with_write_attempts(mut self, attempts: u32) -> Self {
        self.write_attempts = attempts.max(1);
        self
    }

    /// Required permissions at `scope` the principal does not hold.
    pub async fn check_permissions(&self, scope: &AuthorizationScope) -> WardenResult<MissingSet> {
        let wanted = scope.permission_ids();
        if wanted.is_empty() {
            return Ok(MissingSet::new());
        }
        let granted = self.api.test_permissions(&scope.target, &wanted).await?;
        Ok(wanted.into_iter().filter(|p| !granted.contains(p)).collect())
    }

    /// Grants whatever is missing at `scope` to `principal`.
    ///
    /// Fails with `PermissionEscalation` when a critical permission cannot be
    /// obtained, and with `StalePolicyToken` when every write attempt raced
    /// another writer.
    pub async fn ensure_permissions(
        &self,
        scope: &AuthorizationScope,
        principal: &Principal,
    ) -> WardenResult<ReconcileReport> {
        let target = &scope.target;
        let missing = self.check_permissions(scope).await?;
        if missing.is_empty() {
            tracing::debug!(scope = %target, "all required permissions held");
            return Ok(ReconcileReport::satisfied(target.clone()));
        }
        tracing::info!(scope = %target, missing = missing.len(), "permissions missing");

        let (bundles, uncovered) = self.roles.cover(&missing);
        if let Some(id) = uncovered.iter().find(|p| scope.is_critical(p)) {
            return Err(WardenError::escalation(id.as_str(), target));
        }

        let mut report = ReconcileReport::satisfied(target.clone());
        let remaining = if bundles.is_empty() {
            missing
        } else {
            let (granted, writes) = self.grant(target, &bundles, &principal.member()).await?;
            report.granted = granted;
            report.policy_writes = writes;
            self.await_grants(scope, &missing).await?
        };

        if let Some(id) = scope.first_critical(&remaining) {
            return Err(WardenError::escalation(id.as_str(), target));
        }
        for id in &remaining {
            tracing::warn!(scope = %target, permission = %id, "optional permission still missing");
        }
        report.unresolved = remaining.into_iter().collect();
        Ok(report)
    }

    /// One read-modify-write of the scope policy, redone on a stale token.
    /// Returns the bundles newly bound and the number of writes made.
    async fn grant(
        &self,
        target: &ScopeTarget,
        bundles: &BTreeSet<RoleBundle>,
        member: &str,
    ) -> WardenResult<(Vec<RoleBundle>, u32)> {
        for attempt in 1..=self.write_attempts {
            let mut policy = self
                .api
                .get_policy(target)
                .await
                .map_err(|e| escalate_denied(e, target.kind.get_policy_permission(), target))?;

            let added: Vec<RoleBundle> = bundles
                .iter()
                .filter(|bundle| policy.grant(bundle, member))
                .cloned()
                .collect();
            if added.is_empty() {
                // Bound already; the grant has not propagated yet.
                tracing::debug!(scope = %target, "bindings present, nothing to write");
                return Ok((Vec::new(), 0));
            }

            match self.api.set_policy(target, &policy).await {
                Ok(_) => {
                    tracing::info!(
                        scope = %target,
                        member,
                        roles = ?added.iter().map(RoleBundle::as_str).collect::<Vec<_>>(),
                        "policy updated"
                    );
                    return Ok((added, 1));
                }
                Err(e) if e.is(ErrorKind::StaleToken) => {
                    tracing::warn!(scope = %target, attempt, "policy changed concurrently, re-reading");
                }
                Err(e) => return Err(escalate_denied(e, target.kind.set_policy_permission(), target)),
            }
        }

        Err(WardenError::StalePolicyToken {
            resource: target.resource.clone(),
            attempts: self.write_attempts,
        })
    }

    /// Waits until every covered permission is visible. Returns what is still
    /// missing afterwards; a timeout is not fatal by itself.
    async fn await_grants(&self, scope: &AuthorizationScope, missing: &MissingSet) -> WardenResult<MissingSet> {
        let covered: BTreeSet<&PermissionId> = missing
            .iter()
            .filter(|p| self.roles.bundle_for(p).is_some())
            .collect();
        let description = format!("new role bindings on {}", scope.target);

        let (this, expected) = (self, &covered);
        let waited = self
            .waiter
            .wait_for(&description, || async move {
                let now_missing = this.check_permissions(scope).await?;
                Ok(!now_missing.iter().any(|p| expected.contains(p)))
            })
            .await;

        match waited {
            Ok(_) => Ok(missing.iter().filter(|p| !covered.contains(p)).cloned().collect()),
            Err(WardenError::PropagationTimeout { elapsed, .. }) => {
                tracing::warn!(scope = %scope.target, ?elapsed, "grants not visible before timeout");
                self.check_permissions(scope).await
            }
            Err(e) => Err(e),
        }
    }
}

/// A denied policy read or write means the principal needs someone else.
pub(crate) fn escalate_denied(e: ApiError, permission: &str, target: &ScopeTarget) -> WardenError {
    if e.is(ErrorKind::PermissionDenied) {
        WardenError::escalation(permission, target)
    } else {
        e.into()
    }
}
