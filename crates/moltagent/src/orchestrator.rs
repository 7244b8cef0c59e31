//! Orchestrator mode: wire the managers together and serve the control plane.

use crate::env::RuntimeEnv;
use anyhow::Context;
use molt_approval::ApprovalManager;
use molt_fleet::FleetManager;
use molt_provision::{ProviderRegistry, Provisioner};
use molt_server::{ControlPlane, http};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

/// Pick the default provider: the cloud backend when its token is present,
/// the local-container backend otherwise.
pub fn default_provider(registry: &ProviderRegistry) -> String {
    if registry.get("hetzner").is_some() {
        "hetzner".to_string()
    } else {
        "docker-local".to_string()
    }
}

/// Run the control plane until ctrl-c, then flush state and close sessions.
pub async fn run(env: &RuntimeEnv) -> anyhow::Result<()> {
    let token = env
        .api_token
        .clone()
        .context("MOLTAGENT_API_TOKEN must be set in orchestrator mode")?;

    let fleet_path = env.data_dir.join("fleet.json");
    info!(path = %fleet_path.display(), "loading fleet registry");
    let fleet = Arc::new(FleetManager::load(fleet_path));
    let approvals = ApprovalManager::new();

    let registry = Arc::new(ProviderRegistry::from_env());
    let provisioner = Arc::new(Provisioner::new(
        Arc::clone(&registry),
        default_provider(&registry),
    ));

    let control = ControlPlane::new(token, Arc::clone(&fleet), Arc::clone(&approvals));
    let state = http::AppState::new(
        Arc::clone(&control),
        Arc::clone(&fleet),
        Arc::clone(&approvals),
        Arc::clone(&provisioner),
    );

    let addr = format!("0.0.0.0:{}", env.cp_port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, providers = ?registry.names(), "control plane listening");

    http::serve(listener, state, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    })
    .await
    .context("control-plane server failed")?;

    control.shutdown().await;
    approvals.close().await;
    fleet.close().await;
    info!("control plane stopped");
    Ok(())
}
