//! Multi-provider VPS provisioning for MoltAgent.
//!
//! Exposes a uniform create / destroy / status / list contract over
//! heterogeneous cloud APIs, a bootstrap-script generator that turns a
//! manifest into a self-installing first-boot sequence, and the provisioner
//! that owns the live-instance index.

#![forbid(unsafe_code)]

pub mod bootstrap;
pub mod docker;
pub mod hetzner;
pub mod provisioner;

use async_trait::async_trait;
use molt_manifest::Manifest;
use molt_proto::VpsInstance;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

pub use docker::DockerLocalProvider;
pub use hetzner::HetznerProvider;
pub use provisioner::{ProvisionError, Provisioner};

/// Label attached to every instance this system creates; `list` filters on it.
pub const MANAGED_LABEL: &str = "moltagent";

// ─── Errors ───────────────────────────────────────────────────────────────────

/// A provider-layer failure. Upstream HTTP status and body are surfaced
/// verbatim; providers never retry, callers decide policy.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider command failed: {0}")]
    Command(String),

    #[error("malformed provider response: {0}")]
    Malformed(String),
}

// ─── Provider contract ────────────────────────────────────────────────────────

/// Everything `create` needs: the manifest and the rendered bootstrap script.
pub struct CreateRequest<'a> {
    pub manifest: &'a Manifest,
    pub bootstrap_script: &'a str,
    pub ssh_key_ids: Vec<String>,
}

/// Uniform lifecycle contract over a VPS backend.
///
/// `create` is initiation: an `Ok` means the provider accepted the request
/// and assigned an id (and, where applicable, an IP), not that the worker is
/// reachable yet.
#[async_trait]
pub trait VpsProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn create(&self, req: CreateRequest<'_>) -> Result<VpsInstance, ProviderError>;

    async fn destroy(&self, instance_id: &str) -> Result<(), ProviderError>;

    /// Current provider-side view, or `None` if the instance is gone.
    async fn status(&self, instance_id: &str) -> Result<Option<VpsInstance>, ProviderError>;

    /// Instances labelled as belonging to this system.
    async fn list(&self) -> Result<Vec<VpsInstance>, ProviderError>;
}

// ─── Registry ─────────────────────────────────────────────────────────────────

/// Name → provider implementation. Owned by the orchestrator and injected
/// into the provisioner.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn VpsProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    /// Register backends from the environment: the Hetzner cloud backend when
    /// `HETZNER_API_TOKEN` is set, and the local-container backend always.
    pub fn from_env() -> Self {
        let mut registry = Self::new();

        if let Ok(token) = std::env::var("HETZNER_API_TOKEN") {
            registry.register(Arc::new(HetznerProvider::new(token)));
        }
        registry.register(Arc::new(DockerLocalProvider::new()));

        registry
    }

    pub fn register(&mut self, provider: Arc<dyn VpsProvider>) {
        info!(name = provider.name(), "registering provider");
        self.providers
            .insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn VpsProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registry_has_no_providers() {
        let registry = ProviderRegistry::new();
        assert!(registry.get("hetzner").is_none());
        assert!(registry.names().is_empty());
    }

    #[test]
    fn from_env_always_registers_docker_local() {
        let registry = ProviderRegistry::from_env();
        assert!(registry.get("docker-local").is_some());
    }
}
