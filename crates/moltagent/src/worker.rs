//! Worker mode: run the bridge and report status until told to stop.

use anyhow::Context;
use molt_bridge::{Bridge, BridgeConfig, BridgeEvent};
use molt_manifest::Manifest;
use molt_proto::{AgentState, StatusReport};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tracing::{info, warn};

/// Load, validate, and run the manifest at `path`. Returns only on explicit
/// `restart`/`shutdown` (process exit 0) or a startup error.
pub async fn run(path: &Path) -> anyhow::Result<()> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("reading manifest {}", path.display()))?;
    let manifest = Manifest::parse(&bytes).context("manifest rejected")?;

    info!(
        agent_id = %manifest.identity.id,
        name = %manifest.identity.name,
        control_plane = %manifest.control_plane.url,
        "starting worker"
    );

    let (bridge, mut events) = Bridge::new(BridgeConfig {
        agent_id: manifest.identity.id.clone(),
        url: manifest.control_plane.url.clone(),
        token: manifest.control_plane.token.clone(),
        heartbeat_interval: Duration::from_secs(manifest.control_plane.heartbeat_interval_sec),
    });

    let runner = Arc::clone(&bridge);
    tokio::spawn(async move { runner.run().await });

    let reporter = Arc::clone(&bridge);
    let report_manifest = manifest.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(
            report_manifest.control_plane.status_report_interval_sec,
        ));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let report = status_report(&reporter, &report_manifest);
            if let Err(e) = reporter.send_status(report).await {
                warn!(error = %e, "status report not queued");
            }
        }
    });

    while let Some(event) = events.recv().await {
        match event {
            BridgeEvent::Restart => {
                info!("restart requested, exiting for the supervisor");
                bridge.close().await;
                std::process::exit(0);
            }
            BridgeEvent::Shutdown => {
                info!("shutdown requested, exiting");
                bridge.close().await;
                std::process::exit(0);
            }
            BridgeEvent::Connected => info!("control link up"),
            BridgeEvent::Disconnected => info!("control link down"),
            // The reasoning runtime consumes these; the shell only logs.
            BridgeEvent::UpdateConfig(_) => info!("config update received"),
            BridgeEvent::UpdateGoals(goals) => info!(count = goals.len(), "goals updated"),
            BridgeEvent::InjectKnowledge(docs) => info!(count = docs.len(), "knowledge injected"),
            BridgeEvent::SendMessage { channel, .. } => {
                info!(?channel, "message relay received");
            }
        }
    }
    Ok(())
}

/// Snapshot of this process and host for the status cadence.
pub fn status_report(bridge: &Bridge, manifest: &Manifest) -> StatusReport {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.refresh_cpu_usage();

    StatusReport {
        state: AgentState::Running,
        active_task: None,
        connected_channels: manifest
            .channels
            .iter()
            .filter(|c| c.enabled)
            .map(|c| c.channel_type.clone())
            .collect(),
        uptime_sec: bridge.uptime_sec(),
        memory_mb: sys.used_memory() / 1024 / 1024,
        cpu_percent: sys.global_cpu_usage(),
        // Daily rollups and goal progress come from the reasoning runtime;
        // the shell has no action ledger of its own.
        actions_today: 0,
        spend_today_usd: 0.0,
        goal_progress: Default::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn status_report_lists_enabled_channels() {
        let bytes = serde_json::json!({
            "identity": { "name": "a1" },
            "channels": [
                { "type": "telegram" },
                { "type": "discord", "enabled": false }
            ]
        })
        .to_string();
        let manifest = Manifest::parse(bytes.as_bytes()).unwrap();
        let (bridge, _events) = Bridge::new(BridgeConfig {
            agent_id: manifest.identity.id.clone(),
            url: manifest.control_plane.url.clone(),
            token: String::new(),
            heartbeat_interval: Duration::from_secs(30),
        });

        let report = status_report(&bridge, &manifest);
        assert_eq!(report.connected_channels, vec!["telegram".to_string()]);
        assert_eq!(report.state, AgentState::Running);
    }
}
