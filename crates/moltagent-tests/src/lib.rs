//! Shared harness for the integration suite: a real control plane on an
//! ephemeral port, a scripted provider instead of a cloud API, and WebSocket
//! clients that speak the worker protocol.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use chrono::Utc;
use molt_approval::ApprovalManager;
use molt_fleet::FleetManager;
use molt_proto::{InstanceStatus, VpsInstance};
use molt_provision::{
    CreateRequest, ProviderError, ProviderRegistry, Provisioner, VpsProvider,
};
use molt_server::{ControlPlane, http};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

pub const TEST_TOKEN: &str = "T";

pub type WorkerSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ─── Scripted provider ────────────────────────────────────────────────────────

/// Provider stand-in that records calls and never leaves the process.
pub struct ScriptedProvider {
    pub create_calls: Arc<AtomicU32>,
    pub destroy_calls: Arc<AtomicU32>,
}

impl ScriptedProvider {
    pub fn with_counters() -> (Self, Arc<AtomicU32>, Arc<AtomicU32>) {
        let create_calls = Arc::new(AtomicU32::new(0));
        let destroy_calls = Arc::new(AtomicU32::new(0));
        (
            Self {
                create_calls: Arc::clone(&create_calls),
                destroy_calls: Arc::clone(&destroy_calls),
            },
            create_calls,
            destroy_calls,
        )
    }
}

#[async_trait]
impl VpsProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "docker-local"
    }

    async fn create(&self, req: CreateRequest<'_>) -> Result<VpsInstance, ProviderError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        Ok(VpsInstance {
            id: format!("i-{}", self.create_calls.load(Ordering::SeqCst)),
            provider: "docker-local".to_string(),
            status: InstanceStatus::Creating,
            ipv4: Some("127.0.0.1".to_string()),
            ipv6: None,
            server_type: "container".to_string(),
            region: "local".to_string(),
            created_at: Utc::now(),
            agent_id: req.manifest.identity.id.clone(),
            metadata: HashMap::new(),
        })
    }

    async fn destroy(&self, _instance_id: &str) -> Result<(), ProviderError> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn status(&self, instance_id: &str) -> Result<Option<VpsInstance>, ProviderError> {
        Ok(Some(VpsInstance {
            id: instance_id.to_string(),
            provider: "docker-local".to_string(),
            status: InstanceStatus::Running,
            ipv4: Some("127.0.0.1".to_string()),
            ipv6: None,
            server_type: "container".to_string(),
            region: "local".to_string(),
            created_at: Utc::now(),
            agent_id: String::new(),
            metadata: HashMap::new(),
        }))
    }

    async fn list(&self) -> Result<Vec<VpsInstance>, ProviderError> {
        Ok(Vec::new())
    }
}

// ─── Harness ──────────────────────────────────────────────────────────────────

pub struct TestHarness {
    pub addr: SocketAddr,
    pub fleet: Arc<FleetManager>,
    pub approvals: Arc<ApprovalManager>,
    pub control: Arc<ControlPlane>,
    pub create_calls: Arc<AtomicU32>,
    pub destroy_calls: Arc<AtomicU32>,
    pub http: reqwest::Client,
    server: JoinHandle<()>,
}

impl TestHarness {
    /// Start a full control plane on an ephemeral port with a scripted
    /// provider registered as `docker-local`.
    pub async fn start(data_dir: &Path) -> Self {
        let fleet = Arc::new(FleetManager::load(data_dir.join("fleet.json")));
        let approvals = ApprovalManager::new();
        let control = ControlPlane::new(TEST_TOKEN, Arc::clone(&fleet), Arc::clone(&approvals));

        let (provider, create_calls, destroy_calls) = ScriptedProvider::with_counters();
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(provider));
        let provisioner = Arc::new(Provisioner::new(Arc::new(registry), "docker-local"));

        let state = http::AppState::new(
            Arc::clone(&control),
            Arc::clone(&fleet),
            Arc::clone(&approvals),
            provisioner,
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let server = tokio::spawn(async move {
            let _ = http::serve(listener, state, std::future::pending::<()>()).await;
        });

        Self {
            addr,
            fleet,
            approvals,
            control,
            create_calls,
            destroy_calls,
            http: reqwest::Client::new(),
            server,
        }
    }

    pub fn base(&self) -> String {
        format!("http://{}/moltagent", self.addr)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/moltagent/ws", self.addr)
    }

    pub async fn stop(self) {
        self.control.shutdown().await;
        self.approvals.close().await;
        self.fleet.close().await;
        self.server.abort();
    }

    // ─── HTTP helpers ─────────────────────────────────────────────────────

    pub async fn api_get(&self, path: &str) -> (u16, serde_json::Value) {
        let resp = self
            .http
            .get(format!("{}{path}", self.base()))
            .bearer_auth(TEST_TOKEN)
            .send()
            .await
            .expect("request");
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap_or(serde_json::Value::Null))
    }

    pub async fn api_post(&self, path: &str, body: serde_json::Value) -> (u16, serde_json::Value) {
        let resp = self
            .http
            .post(format!("{}{path}", self.base()))
            .bearer_auth(TEST_TOKEN)
            .json(&body)
            .send()
            .await
            .expect("request");
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap_or(serde_json::Value::Null))
    }

    pub async fn api_delete(&self, path: &str) -> (u16, serde_json::Value) {
        let resp = self
            .http
            .delete(format!("{}{path}", self.base()))
            .bearer_auth(TEST_TOKEN)
            .send()
            .await
            .expect("request");
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap_or(serde_json::Value::Null))
    }

    // ─── WebSocket helpers ────────────────────────────────────────────────

    /// Connect a worker socket with the bearer token in the header.
    pub async fn connect_worker(&self, agent_id: &str) -> WorkerSocket {
        let url = format!("{}?agentId={agent_id}", self.ws_url());
        let mut request = url.into_client_request().expect("request");
        request.headers_mut().insert(
            AUTHORIZATION,
            format!("Bearer {TEST_TOKEN}").parse().expect("header"),
        );
        let (socket, _) = connect_async(request).await.expect("ws connect");
        socket
    }

    /// Connect with an arbitrary token (or none) and no header auth, for
    /// admission tests. Returns the handshake error, if any.
    pub async fn try_connect(
        &self,
        query: &str,
    ) -> Result<WorkerSocket, tokio_tungstenite::tungstenite::Error> {
        let url = format!("{}{query}", self.ws_url());
        connect_async(url).await.map(|(socket, _)| socket)
    }
}

/// Poll until `check` yields true or the timeout elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Minimal deployable manifest body for the scripted provider.
pub fn minimal_manifest(agent_id: &str, name: &str) -> serde_json::Value {
    serde_json::json!({
        "identity": { "id": agent_id, "name": name },
        "controlPlane": { "url": "ws://localhost:18790", "token": TEST_TOKEN },
        "resources": { "provider": "docker-local" },
        "financialControls": { "maxPerDayUsd": 10.0 }
    })
}
