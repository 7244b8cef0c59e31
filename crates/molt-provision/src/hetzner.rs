//! Hetzner-style cloud backend.
//!
//! Bearer-token JSON REST API. Instances are tagged with the `moltagent`
//! label set so `list` can filter to machines this system owns; the bootstrap
//! script rides along as user-data and the server starts immediately.

use crate::{CreateRequest, MANAGED_LABEL, ProviderError, VpsProvider};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use molt_proto::{InstanceStatus, VpsInstance};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use tracing::info;

const DEFAULT_BASE_URL: &str = "https://api.hetzner.cloud/v1";
const SERVER_IMAGE: &str = "ubuntu-22.04";

pub struct HetznerProvider {
    api_token: String,
    base_url: String,
    client: reqwest::Client,
}

impl HetznerProvider {
    pub fn new(api_token: String) -> Self {
        Self::with_base_url(api_token, DEFAULT_BASE_URL.to_string())
    }

    /// Base URL is injectable so tests can point at a stub server.
    pub fn with_base_url(api_token: String, base_url: String) -> Self {
        Self {
            api_token,
            base_url,
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(ProviderError::Api {
            status: status.as_u16(),
            body,
        })
    }
}

/// Map the provider's lifecycle vocabulary into the common variant.
pub fn map_server_status(status: &str) -> InstanceStatus {
    match status {
        "initializing" | "starting" => InstanceStatus::Creating,
        "running" => InstanceStatus::Running,
        "stopping" | "deleting" => InstanceStatus::Stopping,
        "off" => InstanceStatus::Stopped,
        _ => InstanceStatus::Error,
    }
}

#[async_trait]
impl VpsProvider for HetznerProvider {
    fn name(&self) -> &str {
        "hetzner"
    }

    async fn create(&self, req: CreateRequest<'_>) -> Result<VpsInstance, ProviderError> {
        let manifest = req.manifest;
        let agent_id = &manifest.identity.id;
        let short_id: String = agent_id.chars().take(8).collect();
        let server_name = format!("moltagent-{short_id}");

        info!(
            agent_id = %agent_id,
            server_type = %manifest.resources.server_type,
            region = %manifest.resources.region,
            "creating cloud instance"
        );

        let mut body = json!({
            "name": server_name,
            "server_type": manifest.resources.server_type,
            "location": manifest.resources.region,
            "image": SERVER_IMAGE,
            "user_data": req.bootstrap_script,
            "labels": {
                MANAGED_LABEL: "true",
                "agent-id": agent_id,
                "owner-id": manifest.identity.owner_id,
            },
            "start_after_create": true,
        });
        if !req.ssh_key_ids.is_empty() {
            body["ssh_keys"] = json!(req.ssh_key_ids);
        }

        let resp = self
            .client
            .post(format!("{}/servers", self.base_url))
            .bearer_auth(&self.api_token)
            .json(&body)
            .send()
            .await?;
        let resp = Self::check(resp).await?;
        let payload: serde_json::Value = resp.json().await?;

        let server: HetznerServer = serde_json::from_value(payload["server"].clone())
            .map_err(|e| ProviderError::Malformed(format!("server object: {e}")))?;

        info!(server_id = server.id, agent_id = %agent_id, "cloud instance accepted");
        Ok(server.into_instance())
    }

    async fn destroy(&self, instance_id: &str) -> Result<(), ProviderError> {
        info!(instance_id, "destroying cloud instance");
        let resp = self
            .client
            .delete(format!("{}/servers/{instance_id}", self.base_url))
            .bearer_auth(&self.api_token)
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn status(&self, instance_id: &str) -> Result<Option<VpsInstance>, ProviderError> {
        let resp = self
            .client
            .get(format!("{}/servers/{instance_id}", self.base_url))
            .bearer_auth(&self.api_token)
            .send()
            .await?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        let resp = Self::check(resp).await?;
        let payload: serde_json::Value = resp.json().await?;
        let server: HetznerServer = serde_json::from_value(payload["server"].clone())
            .map_err(|e| ProviderError::Malformed(format!("server object: {e}")))?;
        Ok(Some(server.into_instance()))
    }

    async fn list(&self) -> Result<Vec<VpsInstance>, ProviderError> {
        let mut all = Vec::new();
        let mut page = 1u32;

        loop {
            let url = format!(
                "{}/servers?label_selector={MANAGED_LABEL}%3Dtrue&page={page}&per_page=25",
                self.base_url
            );
            let resp = self
                .client
                .get(&url)
                .bearer_auth(&self.api_token)
                .send()
                .await?;
            let resp = Self::check(resp).await?;
            let payload: HetznerListServersResponse = resp
                .json()
                .await
                .map_err(|e| ProviderError::Malformed(format!("server list: {e}")))?;

            let has_next = payload.meta.pagination.next_page.is_some();
            all.extend(payload.servers.into_iter().map(HetznerServer::into_instance));
            if has_next {
                page += 1;
            } else {
                break;
            }
        }

        info!(count = all.len(), "listed cloud instances");
        Ok(all)
    }
}

// ─── API types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HetznerServer {
    pub id: u64,
    pub name: String,
    pub status: String,
    pub created: DateTime<Utc>,
    pub public_net: HetznerPublicNet,
    pub server_type: HetznerServerType,
    #[serde(default)]
    pub datacenter: Option<HetznerDatacenter>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl HetznerServer {
    fn into_instance(self) -> VpsInstance {
        let agent_id = self.labels.get("agent-id").cloned().unwrap_or_default();
        let region = self
            .datacenter
            .as_ref()
            .map(|d| d.location.name.clone())
            .unwrap_or_default();
        VpsInstance {
            id: self.id.to_string(),
            provider: "hetzner".to_string(),
            status: map_server_status(&self.status),
            ipv4: self.public_net.ipv4.map(|i| i.ip),
            ipv6: self.public_net.ipv6.map(|i| i.ip),
            server_type: self.server_type.name,
            region,
            created_at: self.created,
            agent_id,
            metadata: HashMap::from([
                ("serverId".to_string(), serde_json::json!(self.id)),
                ("name".to_string(), serde_json::json!(self.name)),
            ]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HetznerPublicNet {
    pub ipv4: Option<HetznerIp>,
    pub ipv6: Option<HetznerIp>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HetznerIp {
    pub ip: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HetznerServerType {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HetznerDatacenter {
    pub location: HetznerLocation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HetznerLocation {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HetznerListServersResponse {
    pub servers: Vec<HetznerServer>,
    pub meta: HetznerMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HetznerMeta {
    pub pagination: HetznerPagination,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HetznerPagination {
    pub page: u32,
    pub per_page: u32,
    pub next_page: Option<u32>,
    pub total_entries: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_covers_lifecycle_table() {
        assert_eq!(map_server_status("initializing"), InstanceStatus::Creating);
        assert_eq!(map_server_status("starting"), InstanceStatus::Creating);
        assert_eq!(map_server_status("running"), InstanceStatus::Running);
        assert_eq!(map_server_status("stopping"), InstanceStatus::Stopping);
        assert_eq!(map_server_status("off"), InstanceStatus::Stopped);
        assert_eq!(map_server_status("rebuilding"), InstanceStatus::Error);
        assert_eq!(map_server_status("unknown"), InstanceStatus::Error);
    }

    #[test]
    fn server_converts_to_instance_with_labels() {
        let raw = serde_json::json!({
            "id": 4711,
            "name": "moltagent-0a68e1de",
            "status": "running",
            "created": "2025-06-01T12:00:00Z",
            "public_net": {
                "ipv4": { "ip": "203.0.113.7" },
                "ipv6": { "ip": "2001:db8::/64" }
            },
            "server_type": { "name": "cx22" },
            "datacenter": { "location": { "name": "nbg1" } },
            "labels": {
                "moltagent": "true",
                "agent-id": "0a68e1de-9d0f-4a3a-8c11-30a9d21f6b55",
                "owner-id": "owner-1"
            }
        });
        let server: HetznerServer = serde_json::from_value(raw).unwrap();
        let instance = server.into_instance();
        assert_eq!(instance.id, "4711");
        assert_eq!(instance.provider, "hetzner");
        assert_eq!(instance.status, InstanceStatus::Running);
        assert_eq!(instance.ipv4.as_deref(), Some("203.0.113.7"));
        assert_eq!(instance.server_type, "cx22");
        assert_eq!(instance.region, "nbg1");
        assert_eq!(instance.agent_id, "0a68e1de-9d0f-4a3a-8c11-30a9d21f6b55");
    }

    #[test]
    fn list_response_deserializes_with_pagination() {
        let raw = serde_json::json!({
            "servers": [],
            "meta": { "pagination": { "page": 1, "per_page": 25, "next_page": null, "total_entries": 0 } }
        });
        let parsed: HetznerListServersResponse = serde_json::from_value(raw).unwrap();
        assert!(parsed.servers.is_empty());
        assert!(parsed.meta.pagination.next_page.is_none());
    }
}
