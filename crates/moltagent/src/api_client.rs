//! HTTP front-end used by the CLI verbs.
//!
//! Every verb talks to a running orchestrator over its dashboard surface;
//! nothing here touches the managers directly.

use anyhow::{Context, bail};
use serde_json::Value;

pub struct ApiClient {
    base: String,
    token: String,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(base: String, token: String) -> Self {
        Self {
            base,
            token,
            http: reqwest::Client::new(),
        }
    }

    async fn check(resp: reqwest::Response) -> anyhow::Result<Value> {
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            bail!("control plane returned {status}: {body}");
        }
        Ok(body)
    }

    pub async fn get(&self, path: &str) -> anyhow::Result<Value> {
        let resp = self
            .http
            .get(format!("{}{path}", self.base))
            .bearer_auth(&self.token)
            .send()
            .await
            .context("control plane unreachable")?;
        Self::check(resp).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> anyhow::Result<Value> {
        let resp = self
            .http
            .post(format!("{}{path}", self.base))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .context("control plane unreachable")?;
        Self::check(resp).await
    }

    pub async fn delete(&self, path: &str) -> anyhow::Result<Value> {
        let resp = self
            .http
            .delete(format!("{}{path}", self.base))
            .bearer_auth(&self.token)
            .send()
            .await
            .context("control plane unreachable")?;
        Self::check(resp).await
    }

    // ─── Verbs ────────────────────────────────────────────────────────────

    pub async fn provision(&self, manifest: &Value) -> anyhow::Result<Value> {
        self.post("/dashboard/agents", manifest).await
    }

    pub async fn list_agents(&self) -> anyhow::Result<Value> {
        self.get("/dashboard/agents").await
    }

    pub async fn destroy(&self, agent_id: &str) -> anyhow::Result<Value> {
        self.delete(&format!("/dashboard/agents/{agent_id}")).await
    }

    pub async fn overview(&self) -> anyhow::Result<Value> {
        self.get("/dashboard/overview").await
    }

    pub async fn pending_approvals(&self) -> anyhow::Result<Value> {
        self.get("/dashboard/approvals").await
    }

    pub async fn respond_approval(&self, id: &str, approved: bool) -> anyhow::Result<Value> {
        self.post(
            &format!("/dashboard/approvals/{id}/respond"),
            &serde_json::json!({"approved": approved, "respondedBy": "cli"}),
        )
        .await
    }
}
