//! Text reports for provisioning runs.

use crate::orchestrator::ScopeCheck;
use warden_core::{ProvisioningResult, ProvisioningState, ReconciliationResult, Step};

const RULE_TOP: &str = "╔══════════════════════════════════════════════════════════════╗\n";
const RULE_MID: &str = "╠══════════════════════════════════════════════════════════════╣\n";
const RULE_END: &str = "╚══════════════════════════════════════════════════════════════╝\n";

fn title(out: &mut String, text: &str) {
    out.push_str(&format!("║{text:^62}║\n"));
}

fn row(out: &mut String, label: &str, value: impl std::fmt::Display) {
    out.push_str(&format!("║  {:<20}{:>39} ║\n", format!("{label}:"), value.to_string()));
}

fn line(out: &mut String, text: &str) {
    out.push_str(&format!("║  {text:<59} ║\n"));
}

/// Boxed summary of a provisioning run. The client secret is masked unless
/// `show_secret` is set.
pub fn render(result: &ProvisioningResult, show_secret: bool) -> String {
    let state = result.state();
    let mut out = String::from("\n");
    out.push_str(RULE_TOP);
    title(&mut out, "WARDEN PROVISIONING REPORT");
    out.push_str(RULE_MID);

    let outcome = match result {
        ProvisioningResult::Completed(_) => "completed".to_string(),
        ProvisioningResult::Failed { step, .. } => format!("failed at {step}"),
    };
    row(&mut out, "Outcome", outcome);
    if let Some(principal) = &state.principal {
        row(&mut out, "Principal", &principal.email);
    }
    row(&mut out, "Policy writes", state.policy_writes);
    if state.project_created {
        row(&mut out, "Project", "created");
    }
    row(&mut out, "Services enabled", state.enabled_services.len());
    out.push_str(RULE_MID);

    render_steps(&mut out, result);
    out.push_str(RULE_MID);

    render_artifacts(&mut out, state, show_secret);

    if let ProvisioningResult::Failed { error, .. } = result {
        out.push_str(RULE_MID);
        line(&mut out, "FAILURE");
        out.push_str(&format!("║  {error}\n"));
        if let Some(remedy) = error.remedy() {
            out.push_str(&format!("║  Next: {remedy}\n"));
        }
    }

    out.push_str(RULE_END);
    out
}

fn render_steps(out: &mut String, result: &ProvisioningResult) {
    let reached = match result {
        ProvisioningResult::Completed(_) => None,
        ProvisioningResult::Failed { step, .. } => Some(*step),
    };

    let mut done = true;
    for step in Step::WORKFLOW {
        let mark = match reached {
            Some(failed) if failed == step => {
                done = false;
                "✗"
            }
            _ if done => "✓",
            _ => "·",
        };
        line(out, &format!("{mark} {step}"));
    }
}

fn render_artifacts(out: &mut String, state: &ProvisioningState, show_secret: bool) {
    if let Some(name) = &state.consent_screen {
        row(out, "Consent screen", name);
    }
    if let Some(client_id) = &state.client_id {
        row(out, "Client id", client_id);
    }
    if let Some(key_id) = &state.key_id {
        row(out, "Key id", key_id);
    }
    if let Some(secret) = &state.client_secret {
        let shown = if show_secret {
            secret.expose().to_string()
        } else {
            secret.masked()
        };
        row(out, "Client secret", shown);
    }
    if !state.granted.is_empty() {
        line(out, "Granted:");
        for (kind, bundle) in &state.granted {
            line(out, &format!("  {bundle} ({kind})"));
        }
    }
    if !state.redirect_uris.is_empty() {
        line(out, "Redirect URIs:");
        for uri in &state.redirect_uris {
            out.push_str(&format!("║    {uri}\n"));
        }
    }
}

pub fn render_reconcile(result: &ReconciliationResult) -> String {
    let mut out = String::from("\n");
    out.push_str(RULE_TOP);
    title(&mut out, "WARDEN RECONCILIATION");
    out.push_str(RULE_MID);

    match result {
        ReconciliationResult::Reconciled(report) => {
            row(&mut out, "Scope", &report.scope.resource);
            row(&mut out, "Policy writes", report.policy_writes);
            for bundle in &report.granted {
                line(&mut out, &format!("granted {bundle}"));
            }
            for permission in &report.unresolved {
                line(&mut out, &format!("still missing {permission}"));
            }
            if report.granted.is_empty() && report.unresolved.is_empty() {
                line(&mut out, "All required permissions held.");
            }
        }
        ReconciliationResult::Failed { scope, error } => {
            row(&mut out, "Scope", &scope.resource);
            out.push_str(&format!("║  {error}\n"));
            if let Some(remedy) = error.remedy() {
                out.push_str(&format!("║  Next: {remedy}\n"));
            }
        }
    }

    out.push_str(RULE_END);
    out
}

pub fn render_check(checks: &[ScopeCheck]) -> String {
    let mut out = String::from("\n");
    out.push_str(RULE_TOP);
    title(&mut out, "WARDEN PERMISSION CHECK");

    for check in checks {
        out.push_str(RULE_MID);
        row(&mut out, &check.scope.kind.to_string(), &check.scope.resource);
        if check.missing.is_empty() {
            line(&mut out, "nothing missing");
        }
        for permission in &check.missing {
            let marker = if check.critical.contains(permission) { "critical" } else { "optional" };
            line(&mut out, &format!("{permission} ({marker})"));
        }
    }

    out.push_str(RULE_END);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::{Secret, WardenError};

    fn completed() -> ProvisioningResult {
        let mut state = ProvisioningState::new();
        state.client_id = Some("warden-web".into());
        state.client_secret = Some(Secret::new("GOCSPX-abcdef123456"));
        state.advance(Step::Done);
        ProvisioningResult::Completed(state)
    }

    #[test]
    fn secret_is_masked_by_default() {
        let text = render(&completed(), false);
        assert!(text.contains("****3456"));
        assert!(!text.contains("GOCSPX-abcdef123456"));
        assert!(text.contains("completed"));
    }

    #[test]
    fn secret_shown_on_request() {
        assert!(render(&completed(), true).contains("GOCSPX-abcdef123456"));
    }

    #[test]
    fn failure_names_step_and_remedy() {
        let mut state = ProvisioningState::new();
        state.advance(Step::EnablingServices);
        state.fail();
        let result = ProvisioningResult::Failed {
            step: Step::EnablingServices,
            error: WardenError::PolicyConflict {
                constraint: "constraints/gcp.restrictServiceUsage".into(),
                reason: "deny-all".into(),
            },
            state,
        };

        let text = render(&result, false);
        assert!(text.contains("failed at enabling services"));
        assert!(text.contains("✗ enabling services"));
        assert!(text.contains("✓ reconciling permissions"));
        assert!(text.contains("· ensuring consent screen"));
        assert!(text.contains("Next: ask an organization policy administrator"));
    }
}
