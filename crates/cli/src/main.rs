//! CLI for Warden.
//!
//! Pipeline: load config -> resolve principal -> reconcile permissions ->
//! enable services -> consent screen -> client + key -> redirect URIs -> report.
//!
//! Exit codes: 0 success, 1 the run stopped on an expected failure (missing
//! permission, policy conflict, ...), 2 configuration error or fault.

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use warden_core::{
    Principal, ProvisionConfig, ProvisioningResult, ReconciliationResult, ScopeKind, Secret,
    TrustKind, WardenError,
};
use warden_engine::{reporter, Provisioner, RoleTable};
use warden_provider::{
    GcpGateway, IdentityProvider, InMemoryCloud, ResourceApi, RetryPolicy, StaticIdentity,
    TokenInfoIdentity,
};

const ORG_ADMIN_ROLE: &str = "roles/resourcemanager.organizationAdmin";
const PROJECT_OWNER_ROLE: &str = "roles/owner";

#[derive(Parser, Debug)]
#[command(name = "warden", version, about = "OAuth client provisioner for Google Cloud")]
struct Cli {
    #[command(flatten)]
    target: TargetArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct TargetArgs {
    /// JSON config file; flags below override its fields.
    #[arg(short, long, env = "WARDEN_CONFIG", global = true)]
    config: Option<std::path::PathBuf>,

    #[arg(short, long, env = "WARDEN_PROJECT", global = true)]
    project: Option<String>,

    /// Numeric organization id.
    #[arg(short, long, env = "WARDEN_ORGANIZATION", global = true)]
    organization: Option<String>,

    #[arg(long, env = "WARDEN_TRUSTED_DOMAIN", global = true)]
    trusted_domain: Option<String>,

    #[arg(long, env = "WARDEN_APP_TITLE", global = true)]
    title: Option<String>,

    #[arg(long, env = "WARDEN_SUPPORT_EMAIL", global = true)]
    support_email: Option<String>,

    /// Repeatable.
    #[arg(long = "redirect-uri", global = true)]
    redirect_uris: Vec<String>,

    #[arg(long, global = true)]
    client_id: Option<String>,

    /// Create the project under the organization when it does not exist.
    #[arg(long, default_value_t = false, global = true)]
    create_project: bool,

    /// OAuth access token, e.g. `gcloud auth print-access-token`.
    #[arg(long, env = "WARDEN_ACCESS_TOKEN", hide_env_values = true, global = true)]
    access_token: Option<String>,

    #[arg(long, value_enum, default_value_t = Trust::User, global = true)]
    trust: Trust,

    /// Run against an in-memory cloud seeded with an organization admin.
    #[arg(long, default_value_t = false, global = true)]
    dry_run: bool,

    /// Acting identity for --dry-run; defaults to the support email.
    #[arg(long = "as", global = true)]
    principal: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the full provisioning workflow.
    Provision {
        #[arg(long, default_value_t = false)]
        json: bool,

        /// Print the new client secret in full.
        #[arg(long, default_value_t = false)]
        show_secret: bool,
    },
    /// Grant whatever is missing at a single scope.
    Reconcile {
        #[arg(short, long)]
        scope: ScopeKind,

        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Report missing permissions at every scope without changing anything.
    Check {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Delete the OAuth client's keys, then the client.
    Teardown {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Trust {
    User,
    Delegated,
    Key,
}

impl From<Trust> for TrustKind {
    fn from(t: Trust) -> Self {
        match t {
            Trust::User => TrustKind::InteractiveUser,
            Trust::Delegated => TrustKind::DelegatedCredential,
            Trust::Key => TrustKind::LongLivedKey,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            let mut chain = error_chain(e.as_ref()).into_iter();
            if let Some(head) = chain.next() {
                eprintln!("error: {head}");
            }
            for cause in chain {
                eprintln!("  caused by: {cause}");
            }
            if let Some(warden) = e.downcast_ref::<WardenError>() {
                if let Some(remedy) = warden.remedy() {
                    eprintln!("next: {remedy}");
                }
            }
            ExitCode::from(2)
        }
    }
}

/// The error followed by each of its causes, outermost first.
fn error_chain(error: &(dyn std::error::Error + 'static)) -> Vec<String> {
    std::iter::successors(Some(error), |e| e.source())
        .map(ToString::to_string)
        .collect()
}

async fn run(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let t0 = Instant::now();
    let config = load_config(&cli.target)?;
    let mut provisioner = build_provisioner(&cli.target, config)?;

    tracing::info!(
        project = %provisioner.config().project_id,
        dry_run = cli.target.dry_run,
        "warden starting"
    );

    let code = match cli.command {
        Commands::Provision { json, show_secret } => {
            let result = provisioner.provision().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&provisioning_json(&result, show_secret))?);
            } else {
                print!("{}", reporter::render(&result, show_secret));
            }
            exit_for(result.is_success())
        }
        Commands::Reconcile { scope, json } => {
            let result = provisioner.reconcile(scope).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&reconcile_json(&result))?);
            } else {
                print!("{}", reporter::render_reconcile(&result));
            }
            exit_for(result.is_success())
        }
        Commands::Check { json } => {
            let checks = provisioner.check().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&checks)?);
            } else {
                print!("{}", reporter::render_check(&checks));
            }
            exit_for(checks.iter().all(|c| c.critical.is_empty()))
        }
        Commands::Teardown { json } => {
            let report = provisioner.teardown().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "client deleted: {}, keys deleted: {}, keys failed: {}",
                    report.client_deleted,
                    report.keys_deleted.len(),
                    report.keys_failed.len()
                );
            }
            exit_for(report.keys_failed.is_empty())
        }
    };

    tracing::info!(elapsed_ms = t0.elapsed().as_millis() as u64, "warden finished");
    Ok(code)
}

fn exit_for(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}

/// File (if any) first, then flags and environment on top.
fn load_config(args: &TargetArgs) -> Result<ProvisionConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|e| format!("cannot read config {}: {e}", path.display()))?;
            serde_json::from_str::<ProvisionConfig>(&text)
                .map_err(|e| format!("invalid config {}: {e}", path.display()))?
        }
        None => ProvisionConfig::default(),
    };

    if let Some(v) = &args.project {
        config.project_id = v.clone();
    }
    if let Some(v) = &args.organization {
        config.organization_id = Some(v.clone());
    }
    if let Some(v) = &args.trusted_domain {
        config.trusted_domain = v.clone();
    }
    if let Some(v) = &args.title {
        config.application_title = v.clone();
    }
    if let Some(v) = &args.support_email {
        config.support_email = v.clone();
    }
    if !args.redirect_uris.is_empty() {
        config.redirect_uris = args.redirect_uris.clone();
    }
    if let Some(v) = &args.client_id {
        config.client_id = v.clone();
    }
    config.create_project |= args.create_project;
    Ok(config)
}

fn build_provisioner(args: &TargetArgs, config: ProvisionConfig) -> Result<Provisioner, Box<dyn std::error::Error>> {
    let trust = TrustKind::from(args.trust);

    let (api, identity): (Arc<dyn ResourceApi>, Arc<dyn IdentityProvider>) = if args.dry_run {
        let email = args.principal.clone().unwrap_or_else(|| config.support_email.clone());
        let principal = Principal::parse(&email, trust)?;
        tracing::info!(principal = %principal.email, "dry run against an in-memory cloud");
        (
            Arc::new(seeded_cloud(&config, &principal)),
            Arc::new(StaticIdentity::new(email, trust)),
        )
    } else {
        let token = args
            .access_token
            .clone()
            .ok_or("an access token is required (--access-token or WARDEN_ACCESS_TOKEN)")?;
        let retry = RetryPolicy::from(config.retry);
        (
            Arc::new(GcpGateway::new(Secret::new(token.clone()), retry)?),
            Arc::new(TokenInfoIdentity::new(Secret::new(token), trust, retry)?),
        )
    };

    Ok(Provisioner::build(config, api, identity)?)
}

/// An in-memory cloud where `principal` administers IAM on the organization
/// (or owns the project when there is none) and holds nothing else.
fn seeded_cloud(config: &ProvisionConfig, principal: &Principal) -> InMemoryCloud {
    let member = principal.member();
    let mut cloud = InMemoryCloud::new()
        .with_caller(member.clone())
        .with_catalog(RoleTable::default_gcp().catalog())
        .with_enforcement();

    match config.organization_resource() {
        Some(org) => {
            cloud = cloud
                .with_role(
                    ORG_ADMIN_ROLE,
                    &[
                        "resourcemanager.organizations.getIamPolicy",
                        "resourcemanager.organizations.setIamPolicy",
                        "resourcemanager.projects.getIamPolicy",
                        "resourcemanager.projects.setIamPolicy",
                    ],
                )
                .with_binding(&org, ORG_ADMIN_ROLE, &member);
            if !config.create_project {
                cloud = cloud.with_project(&config.project_id, Some(&org));
            }
        }
        None => {
            cloud = cloud
                .with_role(
                    PROJECT_OWNER_ROLE,
                    &[
                        "resourcemanager.projects.getIamPolicy",
                        "resourcemanager.projects.setIamPolicy",
                    ],
                )
                .with_project(&config.project_id, None)
                .with_binding(&config.project_resource(), PROJECT_OWNER_ROLE, &member);
        }
    }
    cloud
}

fn provisioning_json(result: &ProvisioningResult, show_secret: bool) -> Value {
    let state = result.state();
    let mut state_json = serde_json::to_value(state).unwrap_or(Value::Null);
    if let (Some(secret), Some(slot)) = (&state.client_secret, state_json.get_mut("client_secret")) {
        *slot = Value::String(if show_secret {
            secret.expose().to_string()
        } else {
            secret.masked()
        });
    }

    match result {
        ProvisioningResult::Completed(_) => json!({
            "outcome": "completed",
            "state": state_json,
        }),
        ProvisioningResult::Failed { step, error, .. } => json!({
            "outcome": "failed",
            "step": step,
            "error": error.to_string(),
            "remedy": error.remedy(),
            "state": state_json,
        }),
    }
}

fn reconcile_json(result: &ReconciliationResult) -> Value {
    match result {
        ReconciliationResult::Reconciled(report) => json!({
            "outcome": "reconciled",
            "report": report,
        }),
        ReconciliationResult::Failed { scope, error } => json!({
            "outcome": "failed",
            "scope": scope,
            "error": error.to_string(),
            "remedy": error.remedy(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::{ApiError, ErrorKind, ProvisioningState, Step};

    #[test]
    fn flags_override_config_defaults() {
        let cli = Cli::parse_from([
            "warden",
            "--project",
            "demo-app",
            "--organization",
            "42",
            "--redirect-uri",
            "https://a.example.com/cb",
            "--redirect-uri",
            "https://b.example.com/cb",
            "check",
        ]);
        let config = load_config(&cli.target).unwrap();
        assert_eq!(config.project_id, "demo-app");
        assert_eq!(config.organization_id.as_deref(), Some("42"));
        assert_eq!(config.redirect_uris.len(), 2);
        assert_eq!(config.client_id, warden_core::config::DEFAULT_CLIENT_ID);
    }

    #[test]
    fn scope_flag_parses() {
        let cli = Cli::parse_from(["warden", "reconcile", "--scope", "org"]);
        assert!(matches!(
            cli.command,
            Commands::Reconcile {
                scope: ScopeKind::Organization,
                ..
            }
        ));
    }

    #[test]
    fn step_failures_print_their_cause() {
        let error: Box<dyn std::error::Error> = Box::new(WardenError::Step {
            step: Step::EnsuringConsentScreen,
            source: Box::new(WardenError::Api(ApiError::new("getBrand", ErrorKind::Other, "backend exploded"))),
        });

        let chain = error_chain(error.as_ref());
        assert_eq!(chain.len(), 2);
        assert!(chain[0].starts_with("Step `"));
        assert_eq!(chain[1], "getBrand failed (other): backend exploded");
    }

    #[test]
    fn json_masks_secret_unless_asked() {
        let mut state = ProvisioningState::new();
        state.client_secret = Some(Secret::new("GOCSPX-abcdef123456"));
        state.advance(Step::Done);
        let result = ProvisioningResult::Completed(state);

        let masked = provisioning_json(&result, false);
        assert_eq!(masked["state"]["client_secret"], "****3456");
        let shown = provisioning_json(&result, true);
        assert_eq!(shown["state"]["client_secret"], "GOCSPX-abcdef123456");
    }

    #[tokio::test]
    async fn dry_run_provisions_end_to_end() {
        let email = concat!("alice", "@example.com");
        let config = ProvisionConfig {
            project_id: "demo-app".into(),
            organization_id: Some("42".into()),
            trusted_domain: "example.com".into(),
            application_title: "Demo".into(),
            support_email: email.into(),
            redirect_uris: vec!["https://app.example.com/cb".into()],
            wait: warden_core::WaitConfig {
                timeout_secs: 1,
                interval_ms: 5,
            },
            ..Default::default()
        };
        let principal = Principal::parse(email, TrustKind::InteractiveUser).unwrap();
        let cloud = Arc::new(seeded_cloud(&config, &principal));
        let identity = Arc::new(StaticIdentity::new(email, TrustKind::InteractiveUser));

        let mut provisioner = Provisioner::build(config, cloud, identity).unwrap();
        let result = provisioner.provision().await.unwrap();
        assert!(result.is_success());
        assert!(result.state().client_secret.is_some());
    }
}
