//! Organization constraint policy patching.
//!
//! Rules are walked in order:
//! - a deny list naming the service loses that entry, and scanning continues
//!   for a governing allow list;
//! - an allow list decides: the service is appended if absent;
//! - allow-all decides in favour;
//! - deny-all is a conflict the principal must not override;
//! - a conditional rule is never edited: one that could block the service is
//!   a conflict, any other is skipped.

use crate::reconciler::escalate_denied;
use crate::waiter::PropagationWaiter;
use std::sync::Arc;
use warden_core::{
    ConstraintPolicy, ConstraintRule, ErrorKind, PermissionId, ScopeKind, ScopeTarget, WardenError,
    WardenResult,
};
use warden_provider::ResourceApi;

const GET_PERMISSION: &str = "orgpolicy.policy.get";
const SET_PERMISSION: &str = "orgpolicy.policy.set";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    /// No policy is set for the constraint.
    Unconstrained,
    AlreadyAllowed,
    Patched,
}

/// Rewrites `policy` so that `service` is allowed.
///
/// `Ok(None)` when it already is; `PolicyConflict` on a deny-all rule.
pub fn allow_service(policy: &ConstraintPolicy, service: &str) -> WardenResult<Option<ConstraintPolicy>> {
    let mut rules = policy.rules.clone();
    let mut dirty = false;

    for rule in rules.iter_mut() {
        match rule {
            ConstraintRule::DenyList(values) => {
                let before = values.len();
                values.retain(|v| v != service);
                dirty |= values.len() != before;
            }
            ConstraintRule::AllowList(values) => {
                if !values.iter().any(|v| v == service) {
                    values.push(service.to_string());
                    dirty = true;
                }
                break;
            }
            ConstraintRule::AllowAll => break,
            ConstraintRule::DenyAll => {
                return Err(WardenError::PolicyConflict {
                    constraint: policy.constraint.clone(),
                    reason: format!("a deny-all rule blocks every service, including `{service}`"),
                })
            }
            ConstraintRule::Conditional(rule) if rule.may_deny(service) => {
                return Err(WardenError::PolicyConflict {
                    constraint: policy.constraint.clone(),
                    reason: format!(
                        "conditional rule `{}` may block `{service}`; edit it by hand",
                        rule.condition.expression
                    ),
                })
            }
            ConstraintRule::Conditional(_) => {}
        }
    }

    if !dirty {
        return Ok(None);
    }
    rules.retain(|r| !matches!(r, ConstraintRule::DenyList(v) if v.is_empty()));
    Ok(Some(ConstraintPolicy {
        rules,
        ..policy.clone()
    }))
}

pub struct PolicyPatcher {
    api: Arc<dyn ResourceApi>,
    waiter: PropagationWaiter,
    write_attempts: u32,
}

impl PolicyPatcher {
    pub fn new(api: Arc<dyn ResourceApi>, waiter: PropagationWaiter) -> Self {
        Self {
            api,
            waiter,
            write_attempts: crate::reconciler::DEFAULT_WRITE_ATTEMPTS,
        }
    }

    pub fn with_write_attempts(mut self, attempts: u32) -> Self {
        self.write_attempts = attempts.max(1);
        self
    }

    /// Makes sure `constraint` on `organization` lets `service` be used.
    pub async fn ensure_service_allowed(
        &self,
        organization: &str,
        constraint: &str,
        service: &str,
    ) -> WardenResult<PatchOutcome> {
        let target = ScopeTarget::new(ScopeKind::Global, organization);
        let mut may_set = false;

        for attempt in 1..=self.write_attempts {
            let current = self
                .api
                .get_constraint_policy(organization, constraint)
                .await
                .map_err(|e| escalate_denied(e, GET_PERMISSION, &target))?;
            let Some(current) = current else {
                tracing::debug!(constraint, service, "no policy set, default allow");
                return Ok(PatchOutcome::Unconstrained);
            };

            let Some(patched) = allow_service(&current, service)? else {
                tracing::debug!(constraint, service, "already allowed");
                return Ok(PatchOutcome::AlreadyAllowed);
            };

            if !may_set {
                self.ensure_can_set(&target).await?;
                may_set = true;
            }

            match self.api.set_constraint_policy(organization, &patched).await {
                Ok(_) => {
                    tracing::info!(constraint, service, "constraint policy updated");
                    self.await_allowed(organization, constraint, service).await?;
                    return Ok(PatchOutcome::Patched);
                }
                Err(e) if e.is(ErrorKind::StaleToken) => {
                    tracing::warn!(constraint, attempt, "constraint policy changed concurrently, re-reading");
                }
                Err(e) => return Err(escalate_denied(e, SET_PERMISSION, &target)),
            }
        }

        Err(WardenError::StalePolicyToken {
            resource: format!("{organization}/{constraint}"),
            attempts: self.write_attempts,
        })
    }

    async fn ensure_can_set(&self, target: &ScopeTarget) -> WardenResult<()> {
        let wanted = [PermissionId::from(SET_PERMISSION)];
        let granted = self.api.test_permissions(target, &wanted).await?;
        if granted.contains(&wanted[0]) {
            Ok(())
        } else {
            Err(WardenError::escalation(SET_PERMISSION, target))
        }
    }

    /// Read-after-write: polls until the stored policy allows `service`.
    async fn await_allowed(&self, organization: &str, constraint: &str, service: &str) -> WardenResult<()> {
        let api = &self.api;
        let description = format!("constraint `{constraint}` to allow `{service}`");
        self.waiter
            .wait_for(&description, || async move {
                let policy = api.get_constraint_policy(organization, constraint).await?;
                Ok(policy.map_or(true, |p| p.allows(service)))
            })
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::{BindingCondition, ConditionalRule, PolicyToken};

    fn policy(rules: Vec<ConstraintRule>) -> ConstraintPolicy {
        ConstraintPolicy {
            constraint: "constraints/gcp.restrictServiceUsage".into(),
            rules,
            token: PolicyToken("etag-1".into()),
            ..Default::default()
        }
    }

    fn list(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn deny_list_entry_is_removed() {
        let p = policy(vec![ConstraintRule::DenyList(list(&["x", "y"]))]);
        let patched = allow_service(&p, "x").unwrap().unwrap();
        assert_eq!(patched.rules, vec![ConstraintRule::DenyList(list(&["y"]))]);
        assert_eq!(patched.token, p.token);
    }

    #[test]
    fn emptied_deny_list_is_dropped() {
        let p = policy(vec![ConstraintRule::DenyList(list(&["x"]))]);
        assert!(allow_service(&p, "x").unwrap().unwrap().rules.is_empty());
    }

    #[test]
    fn deny_then_allow_list_is_fixed_in_both_places() {
        let p = policy(vec![
            ConstraintRule::DenyList(list(&["x"])),
            ConstraintRule::AllowList(list(&["a"])),
        ]);
        let patched = allow_service(&p, "x").unwrap().unwrap();
        assert_eq!(patched.rules, vec![ConstraintRule::AllowList(list(&["a", "x"]))]);
        assert!(patched.allows("x"));
    }

    #[test]
    fn allow_list_with_service_is_satisfied() {
        let p = policy(vec![ConstraintRule::AllowList(list(&["x"]))]);
        assert!(allow_service(&p, "x").unwrap().is_none());
    }

    #[test]
    fn allow_all_is_satisfied() {
        let p = policy(vec![ConstraintRule::AllowAll]);
        assert!(allow_service(&p, "x").unwrap().is_none());
    }

    #[test]
    fn deny_all_conflicts() {
        let p = policy(vec![ConstraintRule::DenyAll]);
        assert!(matches!(
            allow_service(&p, "x"),
            Err(WardenError::PolicyConflict { .. })
        ));
    }

    fn prod_only(denied: &[&str]) -> ConstraintRule {
        ConstraintRule::Conditional(ConditionalRule {
            condition: BindingCondition {
                expression: "resource.matchTag('1/env', 'prod')".into(),
                title: "prod".into(),
                description: String::new(),
            },
            allowed: vec![],
            denied: list(denied),
            allow_all: false,
            deny_all: false,
        })
    }

    #[test]
    fn conditional_rule_blocking_the_service_conflicts() {
        let p = policy(vec![prod_only(&["x"]), ConstraintRule::AllowAll]);
        assert!(matches!(
            allow_service(&p, "x"),
            Err(WardenError::PolicyConflict { .. })
        ));
    }

    #[test]
    fn unrelated_conditional_rule_and_flags_are_kept() {
        let mut p = policy(vec![prod_only(&["y"]), ConstraintRule::DenyList(list(&["x", "z"]))]);
        p.inherit_from_parent = true;

        let patched = allow_service(&p, "x").unwrap().unwrap();
        assert_eq!(patched.rules, vec![prod_only(&["y"]), ConstraintRule::DenyList(list(&["z"]))]);
        assert!(patched.inherit_from_parent);
        assert!(!patched.reset);
        assert_eq!(patched.token, p.token);
    }
}
