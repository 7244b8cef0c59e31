//! moltagent — MoltAgent control plane and worker.
//!
//! With no verb, the process runs the mode the environment selects: worker
//! (`MOLTAGENT_MANIFEST`), orchestrator (`MOLTAGENT_API_TOKEN` or
//! `MOLTAGENT_CONTROL_PLANE=1`), or both. The verbs are thin HTTP clients
//! against a running orchestrator, except `validate`, which is local.

use clap::{Parser, Subcommand};
use moltagent::api_client::ApiClient;
use moltagent::env::{Mode, RuntimeEnv};
use moltagent::{orchestrator, worker};
use molt_manifest::{Manifest, ParseOutcome};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "moltagent")]
#[command(about = "MoltAgent control plane and agent worker")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run in the mode the environment selects (default when no verb given)
    Run,

    /// Validate a manifest and deploy it through the control plane
    Provision {
        /// Path to the manifest JSON
        manifest: PathBuf,

        /// Override the manifest's provider
        #[arg(long)]
        provider: Option<String>,
    },

    /// List every agent the control plane knows
    List,

    /// Shut down a worker, destroy its instance, and drop the fleet record
    Destroy { agent_id: String },

    /// Worker mode: print this worker's manifest summary.
    /// Orchestrator mode: print the fleet summary.
    Status,

    /// Validate a manifest locally without deploying
    Validate { manifest: PathBuf },

    /// List pending approvals, or settle one
    Approve {
        /// Approve the given request id
        #[arg(long, value_name = "ID", conflicts_with = "deny")]
        approve: Option<String>,

        /// Deny the given request id
        #[arg(long, value_name = "ID")]
        deny: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let env = RuntimeEnv::from_env();

    // Long-running modes log; verbs keep stdout clean JSON.
    let long_running = matches!(cli.command, None | Some(Commands::Run));
    if long_running {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(EnvFilter::from_default_env().add_directive("moltagent=info".parse()?))
            .init();
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_modes(&env).await,
        Commands::Provision { manifest, provider } => provision(&env, &manifest, provider).await,
        Commands::List => print_result(client(&env)?.list_agents().await),
        Commands::Destroy { agent_id } => print_result(client(&env)?.destroy(&agent_id).await),
        Commands::Status => status(&env).await,
        Commands::Validate { manifest } => validate(&manifest),
        Commands::Approve { approve, deny } => approvals(&env, approve, deny).await,
    }
}

fn client(env: &RuntimeEnv) -> anyhow::Result<ApiClient> {
    let token = env
        .api_token
        .clone()
        .ok_or_else(|| anyhow::anyhow!("MOLTAGENT_API_TOKEN is not set"))?;
    Ok(ApiClient::new(env.api_base(), token))
}

fn print_result(result: anyhow::Result<serde_json::Value>) -> anyhow::Result<()> {
    match result {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}

async fn run_modes(env: &RuntimeEnv) -> anyhow::Result<()> {
    match env.mode() {
        Mode::Worker => {
            let path = env.manifest_path.clone().expect("worker mode has a manifest");
            worker::run(&path).await
        }
        Mode::Orchestrator => orchestrator::run(env).await,
        Mode::Hybrid => {
            let orchestrator_env = env.clone();
            tokio::spawn(async move {
                if let Err(e) = orchestrator::run(&orchestrator_env).await {
                    tracing::error!(error = %e, "orchestrator stopped");
                }
            });
            let path = env.manifest_path.clone().expect("hybrid mode has a manifest");
            worker::run(&path).await
        }
        Mode::Unconfigured => {
            eprintln!(
                "nothing to run: set MOLTAGENT_MANIFEST (worker) and/or \
                 MOLTAGENT_API_TOKEN / MOLTAGENT_CONTROL_PLANE=1 (orchestrator)"
            );
            std::process::exit(1);
        }
    }
}

async fn provision(
    env: &RuntimeEnv,
    path: &std::path::Path,
    provider: Option<String>,
) -> anyhow::Result<()> {
    let bytes = std::fs::read(path)?;
    let mut manifest = match Manifest::safe_parse(&bytes) {
        ParseOutcome::Valid(manifest) => *manifest,
        ParseOutcome::Invalid(issues) => {
            eprintln!("manifest invalid:");
            for issue in issues {
                eprintln!("  {issue}");
            }
            std::process::exit(1);
        }
    };
    if let Some(provider) = provider {
        manifest.resources.provider = provider;
    }

    let body = serde_json::to_value(&manifest)?;
    print_result(client(env)?.provision(&body).await)
}

async fn status(env: &RuntimeEnv) -> anyhow::Result<()> {
    if let Some(path) = &env.manifest_path {
        let bytes = std::fs::read(path)?;
        let manifest = Manifest::parse(&bytes)?;
        let summary = serde_json::json!({
            "mode": "worker",
            "agentId": manifest.identity.id,
            "name": manifest.identity.name,
            "controlPlane": manifest.control_plane.url,
            "heartbeatIntervalSec": manifest.control_plane.heartbeat_interval_sec,
            "goals": manifest.goals.len(),
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }
    print_result(client(env)?.overview().await)
}

fn validate(path: &std::path::Path) -> anyhow::Result<()> {
    let bytes = std::fs::read(path)?;
    match Manifest::safe_parse(&bytes) {
        ParseOutcome::Valid(manifest) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "valid": true,
                    "agentId": manifest.identity.id,
                    "name": manifest.identity.name,
                }))?
            );
            Ok(())
        }
        ParseOutcome::Invalid(issues) => {
            eprintln!("manifest invalid:");
            for issue in issues {
                eprintln!("  {issue}");
            }
            std::process::exit(1);
        }
    }
}

async fn approvals(
    env: &RuntimeEnv,
    approve: Option<String>,
    deny: Option<String>,
) -> anyhow::Result<()> {
    let client = client(env)?;
    match (approve, deny) {
        (Some(id), None) => print_result(client.respond_approval(&id, true).await),
        (None, Some(id)) => print_result(client.respond_approval(&id, false).await),
        (None, None) => print_result(client.pending_approvals().await),
        (Some(_), Some(_)) => unreachable!("clap rejects conflicting flags"),
    }
}
