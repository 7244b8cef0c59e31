//! Lifecycle orchestration over the provider registry.
//!
//! The provisioner owns the index of live instances keyed by agent id; all
//! other components reach instances through it.

use crate::{CreateRequest, ProviderError, ProviderRegistry, VpsProvider};
use molt_manifest::Manifest;
use molt_proto::VpsInstance;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("unknown provider {requested:?}, available: {}", available.join(", "))]
    UnknownProvider {
        requested: String,
        available: Vec<String>,
    },

    #[error("no instance indexed for agent {0}")]
    UnknownAgent(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

pub struct Provisioner {
    registry: Arc<ProviderRegistry>,
    default_provider: String,
    instances: RwLock<HashMap<String, VpsInstance>>,
}

impl Provisioner {
    pub fn new(registry: Arc<ProviderRegistry>, default_provider: impl Into<String>) -> Self {
        Self {
            registry,
            default_provider: default_provider.into(),
            instances: RwLock::new(HashMap::new()),
        }
    }

    fn provider_for(&self, manifest: &Manifest) -> Result<Arc<dyn VpsProvider>, ProvisionError> {
        let requested = if manifest.resources.provider.is_empty() {
            self.default_provider.as_str()
        } else {
            manifest.resources.provider.as_str()
        };
        self.registry
            .get(requested)
            .ok_or_else(|| ProvisionError::UnknownProvider {
                requested: requested.to_string(),
                available: self.registry.names(),
            })
    }

    /// Create an instance for the manifest and index it by agent id.
    pub async fn provision(
        &self,
        manifest: &Manifest,
        bootstrap_script: &str,
    ) -> Result<VpsInstance, ProvisionError> {
        let provider = self.provider_for(manifest)?;
        let agent_id = manifest.identity.id.clone();

        let instance = provider
            .create(CreateRequest {
                manifest,
                bootstrap_script,
                ssh_key_ids: Vec::new(),
            })
            .await?;

        info!(
            agent_id = %agent_id,
            provider = provider.name(),
            instance_id = %instance.id,
            "instance provisioned"
        );
        self.instances
            .write()
            .await
            .insert(agent_id, instance.clone());
        Ok(instance)
    }

    /// Destroy the indexed instance for an agent and drop the index entry.
    pub async fn destroy(&self, agent_id: &str) -> Result<(), ProvisionError> {
        let instance = self
            .instances
            .read()
            .await
            .get(agent_id)
            .cloned()
            .ok_or_else(|| ProvisionError::UnknownAgent(agent_id.to_string()))?;

        let provider = self.registry.get(&instance.provider).ok_or_else(|| {
            ProvisionError::UnknownProvider {
                requested: instance.provider.clone(),
                available: self.registry.names(),
            }
        })?;

        provider.destroy(&instance.id).await?;
        self.instances.write().await.remove(agent_id);
        info!(agent_id, instance_id = %instance.id, "instance destroyed");
        Ok(())
    }

    /// Live provider status for an agent's instance, falling back to the
    /// last-known indexed value when the provider is unreachable.
    pub async fn get_status(&self, agent_id: &str) -> Option<VpsInstance> {
        let indexed = self.instances.read().await.get(agent_id).cloned()?;

        let Some(provider) = self.registry.get(&indexed.provider) else {
            return Some(indexed);
        };
        match provider.status(&indexed.id).await {
            Ok(Some(live)) => {
                self.instances
                    .write()
                    .await
                    .insert(agent_id.to_string(), live.clone());
                Some(live)
            }
            Ok(None) => Some(indexed),
            Err(e) => {
                warn!(agent_id, error = %e, "provider status failed, using last known");
                Some(indexed)
            }
        }
    }

    /// Snapshot of the index; does not hit providers.
    pub async fn list_instances(&self) -> Vec<VpsInstance> {
        self.instances.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MANAGED_LABEL;
    use async_trait::async_trait;
    use chrono::Utc;
    use molt_proto::InstanceStatus;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedProvider {
        name: String,
        create_calls: AtomicU32,
        fail_status: bool,
    }

    impl ScriptedProvider {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                create_calls: AtomicU32::new(0),
                fail_status: false,
            }
        }

        fn instance(&self, agent_id: &str) -> VpsInstance {
            VpsInstance {
                id: "i-1".to_string(),
                provider: self.name.clone(),
                status: InstanceStatus::Creating,
                ipv4: Some("203.0.113.9".to_string()),
                ipv6: None,
                server_type: "cx22".to_string(),
                region: "nbg1".to_string(),
                created_at: Utc::now(),
                agent_id: agent_id.to_string(),
                metadata: HashMap::from([(MANAGED_LABEL.to_string(), serde_json::json!(true))]),
            }
        }
    }

    #[async_trait]
    impl VpsProvider for ScriptedProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn create(&self, req: CreateRequest<'_>) -> Result<VpsInstance, ProviderError> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.instance(&req.manifest.identity.id))
        }

        async fn destroy(&self, _instance_id: &str) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn status(&self, instance_id: &str) -> Result<Option<VpsInstance>, ProviderError> {
            if self.fail_status {
                return Err(ProviderError::Api {
                    status: 503,
                    body: "maintenance".to_string(),
                });
            }
            let mut live = self.instance("a-1");
            live.id = instance_id.to_string();
            live.status = InstanceStatus::Running;
            Ok(Some(live))
        }

        async fn list(&self) -> Result<Vec<VpsInstance>, ProviderError> {
            Ok(vec![])
        }
    }

    fn manifest(provider: &str) -> Manifest {
        let mut m = Manifest::default();
        m.identity.name = "a1".to_string();
        m.resources.provider = provider.to_string();
        m
    }

    fn provisioner(provider: ScriptedProvider) -> Provisioner {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(provider));
        Provisioner::new(Arc::new(registry), "mock")
    }

    #[tokio::test]
    async fn provision_indexes_instance_by_agent_id() {
        let p = provisioner(ScriptedProvider::new("mock"));
        let m = manifest("");
        let instance = p.provision(&m, "#!/bin/bash\n").await.unwrap();
        assert_eq!(instance.agent_id, m.identity.id);

        let listed = p.list_instances().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].agent_id, m.identity.id);
    }

    #[tokio::test]
    async fn unknown_provider_error_enumerates_available() {
        let p = provisioner(ScriptedProvider::new("mock"));
        let m = manifest("vaporware");
        match p.provision(&m, "").await {
            Err(ProvisionError::UnknownProvider {
                requested,
                available,
            }) => {
                assert_eq!(requested, "vaporware");
                assert_eq!(available, vec!["mock".to_string()]);
            }
            other => panic!("expected UnknownProvider, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn destroy_twice_returns_unknown_agent() {
        let p = provisioner(ScriptedProvider::new("mock"));
        let m = manifest("");
        p.provision(&m, "").await.unwrap();

        p.destroy(&m.identity.id).await.unwrap();
        match p.destroy(&m.identity.id).await {
            Err(ProvisionError::UnknownAgent(id)) => assert_eq!(id, m.identity.id),
            other => panic!("expected UnknownAgent, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn get_status_prefers_live_view() {
        let p = provisioner(ScriptedProvider::new("mock"));
        let m = manifest("");
        p.provision(&m, "").await.unwrap();

        let status = p.get_status(&m.identity.id).await.unwrap();
        assert_eq!(status.status, InstanceStatus::Running);
    }

    #[tokio::test]
    async fn get_status_falls_back_to_last_known_on_provider_error() {
        let mut provider = ScriptedProvider::new("mock");
        provider.fail_status = true;
        let p = provisioner(provider);
        let m = manifest("");
        p.provision(&m, "").await.unwrap();

        let status = p.get_status(&m.identity.id).await.unwrap();
        assert_eq!(status.status, InstanceStatus::Creating);
    }

    #[tokio::test]
    async fn get_status_unknown_agent_is_none() {
        let p = provisioner(ScriptedProvider::new("mock"));
        assert!(p.get_status("missing").await.is_none());
    }
}
