use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tenant_authz::config::{Config, TelemetryConfig};
use tenant_authz::domain::StringUuid;
use tenant_authz::state::AuthzContext;
use tenant_authz::{migration, policy, telemetry};
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "tenant-authz", about = "Tenant-scoped RBAC authorization operator tool.")]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the database if needed and apply migrations.
    Migrate,
    /// Create the demo tenants, roles, users and assignments.
    Seed,
    /// Check that a Rego file compiles.
    Validate {
        /// Policy source file.
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Load policies and reference data into the configured evaluator.
    Load,
    /// Load, then list stored policies that did not make it into the snapshot.
    Drift,
    /// Load, then keep refreshing policies until interrupted.
    Watch,
    /// Decide whether a user may perform an action on a resource in a tenant.
    Check {
        #[arg(long)]
        user: StringUuid,
        #[arg(long)]
        tenant: StringUuid,
        #[arg(long)]
        resource: String,
        #[arg(long)]
        action: String,
        /// Overrides AUTHZ_CHECK_TIMEOUT_MS.
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,
        /// Print only the verdict, without per-role detail.
        #[arg(long)]
        redacted: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::from_env();
    let telemetry_config = config
        .as_ref()
        .map(|c| c.telemetry.clone())
        .unwrap_or_else(|_| TelemetryConfig::default());
    telemetry::init(&telemetry_config);

    match cli.command {
        Command::Validate { file } => return validate(&file).await,
        Command::Migrate => {
            migration::run_migrations(&config?).await?;
        }
        Command::Seed => {
            let ctx = AuthzContext::build(config?).await?;
            let tenants = migration::seed_demo(&*ctx.tenants, &*ctx.roles, &*ctx.ledger).await?;
            print_json(&tenants)?;
        }
        Command::Load => {
            let ctx = AuthzContext::build(config?).await?;
            let info = ctx.loader.load().await?;
            print_json(&info)?;
        }
        Command::Drift => {
            let ctx = AuthzContext::build(config?).await?;
            ctx.loader.load().await?;
            let drift = ctx.loader.drift().await?;
            print_json(&drift)?;
            if !drift.is_empty() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Watch => {
            let ctx = AuthzContext::build(config?).await?;
            ctx.loader.load().await?;

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let Some(refresh) = ctx.spawn_refresh(shutdown_rx) else {
                error!("POLICY_REFRESH_INTERVAL_SECS must be set for watch");
                return Ok(ExitCode::FAILURE);
            };

            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for shutdown signal")?;
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
            refresh.await.context("Policy refresh task panicked")?;
        }
        Command::Check {
            user,
            tenant,
            resource,
            action,
            timeout_ms,
            redacted,
        } => {
            let mut config = config?;
            if let Some(ms) = timeout_ms {
                config.access.check_timeout = Duration::from_millis(ms);
            }
            let ctx = AuthzContext::build(config).await?;
            ctx.loader.load().await?;

            match ctx.access.check(user, tenant, &resource, &action).await {
                Ok(decision) => {
                    let allowed = decision.allowed;
                    if redacted {
                        print_json(&decision.redacted())?;
                    } else {
                        print_json(&decision)?;
                    }
                    if !allowed {
                        return Ok(ExitCode::from(2));
                    }
                }
                Err(e) => {
                    error!(kind = e.kind(), error = %e, "Access check failed");
                    eprintln!("{}", e.public_message());
                    return Ok(ExitCode::FAILURE);
                }
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn validate(file: &Path) -> Result<ExitCode> {
    let source = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;

    match policy::validate_source(&source) {
        Ok(()) => {
            let package = policy::package_of(&source)?;
            println!("{}: ok (package {})", file.display(), package);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("{}: {}", file.display(), e);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
