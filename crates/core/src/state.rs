//! Workflow cursor, accumulated artifacts, and the result values the engine
//! hands back to callers.

use crate::error::WardenError;
use crate::types::{PermissionId, Principal, RoleBundle, ScopeKind, ScopeTarget};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// Orchestrator states. `Failed` is absorbing and reachable from every other state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Step {
    Idle,
    ValidatingPrincipal,
    EnforcingPolicy,
    ReconcilingPermissions,
    EnablingServices,
    EnsuringConsentScreen,
    EnsuringCredentials,
    WiringRedirectUris,
    Done,
    Failed,
}

impl Step {
    /// The working steps, in execution order.
    pub const WORKFLOW: [Step; 7] = [
        Step::ValidatingPrincipal,
        Step::EnforcingPolicy,
        Step::ReconcilingPermissions,
        Step::EnablingServices,
        Step::EnsuringConsentScreen,
        Step::EnsuringCredentials,
        Step::WiringRedirectUris,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, Step::Done | Step::Failed)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Step::Idle => "idle",
            Step::ValidatingPrincipal => "validating principal",
            Step::EnforcingPolicy => "enforcing constraint policy",
            Step::ReconcilingPermissions => "reconciling permissions",
            Step::EnablingServices => "enabling services",
            Step::EnsuringConsentScreen => "ensuring consent screen",
            Step::EnsuringCredentials => "ensuring credentials",
            Step::WiringRedirectUris => "wiring redirect URIs",
            Step::Done => "done",
            Step::Failed => "failed",
        })
    }
}

// ---------------------------------------------------------------------------
// Secret
// ---------------------------------------------------------------------------

/// Credential material. `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Shortest secret whose tail is shown by [`Secret::masked`].
    pub const MIN_REVEAL_LEN: usize = 12;

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Last four characters, for display. Secrets shorter than
    /// [`Secret::MIN_REVEAL_LEN`] are masked entirely.
    pub fn masked(&self) -> String {
        let len = self.0.chars().count();
        if len < Self::MIN_REVEAL_LEN {
            return "********".to_string();
        }
        let tail: String = self.0.chars().skip(len - 4).collect();
        format!("****{tail}")
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

// ---------------------------------------------------------------------------
// Provisioning state
// ---------------------------------------------------------------------------

/// Step cursor plus everything earlier steps produced for later ones.
///
/// Owned by exactly one orchestrator run; lives for the run only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisioningState {
    pub step: Step,
    /// Step that was running when the run entered `Failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<Step>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub principal: Option<Principal>,
    pub policy_writes: u32,
    pub granted: Vec<(ScopeKind, RoleBundle)>,
    pub project_created: bool,
    pub enabled_services: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consent_screen: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<Secret>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    pub redirect_uris: BTreeSet<String>,
}

impl ProvisioningState {
    pub fn new() -> Self {
        Self {
            step: Step::Idle,
            failed_at: None,
            principal: None,
            policy_writes: 0,
            granted: Vec::new(),
            project_created: false,
            enabled_services: BTreeSet::new(),
            consent_screen: None,
            client_id: None,
            client_secret: None,
            key_id: None,
            redirect_uris: BTreeSet::new(),
        }
    }

    /// Moves the cursor forward. No transitions leave a terminal state.
    pub fn advance(&mut self, next: Step) {
        if self.step.is_terminal() {
            return;
        }
        self.step = next;
    }

    pub fn fail(&mut self) {
        if self.step == Step::Failed {
            return;
        }
        self.failed_at = Some(self.step);
        self.step = Step::Failed;
    }
}

impl Default for ProvisioningState {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// What one scope reconciliation did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub scope: ScopeTarget,
    pub granted: Vec<RoleBundle>,
    pub policy_writes: u32,
    /// Non-critical permissions still missing after the propagation wait.
    pub unresolved: Vec<PermissionId>,
}

impl ReconcileReport {
    pub fn satisfied(scope: ScopeTarget) -> Self {
        Self {
            scope,
            granted: Vec::new(),
            policy_writes: 0,
            unresolved: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub enum ReconciliationResult {
    Reconciled(ReconcileReport),
    Failed { scope: ScopeTarget, error: WardenError },
}

impl ReconciliationResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ReconciliationResult::Reconciled(_))
    }
}

#[derive(Debug)]
pub enum ProvisioningResult {
    Completed(ProvisioningState),
    Failed {
        step: Step,
        error: WardenError,
        state: ProvisioningState,
    },
}

impl ProvisioningResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ProvisioningResult::Completed(_))
    }

    pub fn state(&self) -> &ProvisioningState {
        match self {
            ProvisioningResult::Completed(state) => state,
            ProvisioningResult::Failed { state, .. } => state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_is_absorbing() {
        let mut state = ProvisioningState::new();
        state.advance(Step::EnablingServices);
        state.fail();
        assert_eq!(state.step, Step::Failed);
        assert_eq!(state.failed_at, Some(Step::EnablingServices));

        state.advance(Step::EnsuringConsentScreen);
        state.fail();
        assert_eq!(state.step, Step::Failed);
        assert_eq!(state.failed_at, Some(Step::EnablingServices));
    }

    #[test]
    fn secret_debug_is_redacted() {
        let secret = Secret::new("GOCSPX-abcdef1234");
        assert_eq!(format!("{secret:?}"), "Secret(***)");
        assert_eq!(secret.masked(), "****1234");
        assert_eq!(secret.expose(), "GOCSPX-abcdef1234");
    }

    #[test]
    fn short_secrets_are_fully_masked() {
        assert_eq!(Secret::new("abc").masked(), "********");
        assert_eq!(Secret::new("s3cr3t-pw").masked(), "********");
        assert_eq!(Secret::new("").masked(), "********");
        assert_eq!(Secret::new("abcdefgh1234").masked(), "****1234");
    }

    #[test]
    fn state_serializes_secret_value() {
        let mut state = ProvisioningState::new();
        state.client_secret = Some(Secret::new("s3cr3t"));
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["client_secret"], "s3cr3t");
        assert_eq!(json["step"], "Idle");
    }
}
