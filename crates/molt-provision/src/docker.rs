//! Local-container backend.
//!
//! Runs workers as containers on the host runtime instead of cloud servers.
//! The manifest travels base64-encoded through an environment variable rather
//! than user-data, the worker's gateway port is published on an ephemeral
//! host port, and the "public" IP is loopback.

use crate::{CreateRequest, MANAGED_LABEL, ProviderError, VpsProvider};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use molt_proto::{InstanceStatus, VpsInstance};
use serde_json::Value;
use std::collections::HashMap;
use tokio::process::Command;
use tracing::info;

use crate::bootstrap::GATEWAY_PORT;

pub struct DockerLocalProvider {
    docker_bin: String,
}

impl Default for DockerLocalProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerLocalProvider {
    pub fn new() -> Self {
        Self {
            docker_bin: "docker".to_string(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, ProviderError> {
        let output = Command::new(&self.docker_bin)
            .args(args)
            .output()
            .await
            .map_err(|e| ProviderError::Command(format!("{} {}: {e}", self.docker_bin, args.join(" "))))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ProviderError::Command(stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn inspect(&self, ids: &[String]) -> Result<Vec<Value>, ProviderError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec!["inspect"];
        args.extend(ids.iter().map(String::as_str));
        let stdout = self.run(&args).await?;
        serde_json::from_str(&stdout)
            .map_err(|e| ProviderError::Malformed(format!("docker inspect output: {e}")))
    }
}

/// Map container runtime states into the common variant.
pub fn map_container_status(status: &str) -> InstanceStatus {
    match status {
        "created" | "restarting" => InstanceStatus::Creating,
        "running" => InstanceStatus::Running,
        "removing" => InstanceStatus::Stopping,
        "exited" => InstanceStatus::Stopped,
        _ => InstanceStatus::Error,
    }
}

/// Build a [`VpsInstance`] from one `docker inspect` object.
pub fn instance_from_inspect(value: &Value) -> Option<VpsInstance> {
    let full_id = value.get("Id")?.as_str()?;
    let id: String = full_id.chars().take(12).collect();
    let state = value
        .pointer("/State/Status")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    let labels = value.pointer("/Config/Labels").and_then(Value::as_object);
    let agent_id = labels
        .and_then(|l| l.get("agent-id"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let created = value
        .get("Created")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(Utc::now);
    let host_port = value
        .pointer(&format!("/NetworkSettings/Ports/{GATEWAY_PORT}~1tcp/0/HostPort"))
        .and_then(Value::as_str)
        .map(String::from);

    let mut metadata = HashMap::from([
        ("containerId".to_string(), serde_json::json!(full_id)),
    ]);
    if let Some(name) = value.get("Name").and_then(Value::as_str) {
        metadata.insert(
            "containerName".to_string(),
            serde_json::json!(name.trim_start_matches('/')),
        );
    }
    if let Some(port) = host_port {
        metadata.insert("hostPort".to_string(), serde_json::json!(port));
    }

    Some(VpsInstance {
        id,
        provider: "docker-local".to_string(),
        status: map_container_status(state),
        ipv4: Some("127.0.0.1".to_string()),
        ipv6: None,
        server_type: "container".to_string(),
        region: "local".to_string(),
        created_at: created,
        agent_id,
        metadata,
    })
}

#[async_trait]
impl VpsProvider for DockerLocalProvider {
    fn name(&self) -> &str {
        "docker-local"
    }

    async fn create(&self, req: CreateRequest<'_>) -> Result<VpsInstance, ProviderError> {
        let manifest = req.manifest;
        let agent_id = &manifest.identity.id;
        let short_id: String = agent_id.chars().take(8).collect();
        let container_name = format!("moltagent-{short_id}");
        let manifest_b64 = BASE64.encode(serde_json::to_vec(manifest).unwrap_or_default());

        info!(
            agent_id = %agent_id,
            image = %manifest.resources.docker_image,
            container = %container_name,
            "starting local container"
        );

        let moltagent_label = format!("{MANAGED_LABEL}=true");
        let agent_label = format!("agent-id={agent_id}");
        let owner_label = format!("owner-id={}", manifest.identity.owner_id);
        let manifest_env = format!("MOLTAGENT_MANIFEST_B64={manifest_b64}");
        let id_env = format!("MOLTAGENT_ID={agent_id}");
        let publish = format!("127.0.0.1:0:{GATEWAY_PORT}");

        let full_id = self
            .run(&[
                "run",
                "-d",
                "--name",
                &container_name,
                "--label",
                &moltagent_label,
                "--label",
                &agent_label,
                "--label",
                &owner_label,
                "-e",
                &manifest_env,
                "-e",
                &id_env,
                "-p",
                &publish,
                &manifest.resources.docker_image,
            ])
            .await?;
        let id: String = full_id.chars().take(12).collect();

        // Ephemeral port assignment is only known after the container starts.
        let port_spec = format!("{GATEWAY_PORT}/tcp");
        let host_port = self
            .run(&["port", &container_name, &port_spec])
            .await
            .ok()
            .and_then(|s| s.rsplit(':').next().map(String::from));

        let mut metadata = HashMap::from([
            ("containerId".to_string(), serde_json::json!(full_id)),
            ("containerName".to_string(), serde_json::json!(container_name)),
        ]);
        if let Some(port) = host_port {
            metadata.insert("hostPort".to_string(), serde_json::json!(port));
        }

        Ok(VpsInstance {
            id,
            provider: "docker-local".to_string(),
            status: InstanceStatus::Running,
            ipv4: Some("127.0.0.1".to_string()),
            ipv6: None,
            server_type: "container".to_string(),
            region: "local".to_string(),
            created_at: Utc::now(),
            agent_id: agent_id.clone(),
            metadata,
        })
    }

    async fn destroy(&self, instance_id: &str) -> Result<(), ProviderError> {
        info!(instance_id, "removing local container");
        self.run(&["rm", "-f", instance_id]).await?;
        Ok(())
    }

    async fn status(&self, instance_id: &str) -> Result<Option<VpsInstance>, ProviderError> {
        match self.inspect(&[instance_id.to_string()]).await {
            Ok(objects) => Ok(objects.first().and_then(instance_from_inspect)),
            Err(ProviderError::Command(msg)) if msg.contains("No such") => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list(&self) -> Result<Vec<VpsInstance>, ProviderError> {
        let filter = format!("label={MANAGED_LABEL}=true");
        let stdout = self
            .run(&["ps", "-a", "--filter", &filter, "--format", "{{.ID}}"])
            .await?;
        let ids: Vec<String> = stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();
        let objects = self.inspect(&ids).await?;
        Ok(objects.iter().filter_map(instance_from_inspect).collect())
    }
}
