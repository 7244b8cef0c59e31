//! Protocol types for the MoltAgent control link.
//!
//! Defines the message types exchanged between the control plane and the
//! agent workers running on provisioned VPS instances, plus the shared model
//! types both sides serialize.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

// ─── Instance lifecycle ───────────────────────────────────────────────────────

/// Common lifecycle status a provider maps its own states into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Creating,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A provider's view of a provisioned machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VpsInstance {
    pub id: String,
    pub provider: String,
    pub status: InstanceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv4: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6: Option<String>,
    pub server_type: String,
    pub region: String,
    pub created_at: DateTime<Utc>,
    pub agent_id: String,
    /// Opaque provider-specific bag (raw API ids, container names, ...).
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

// ─── Connection & worker state ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Online,
    Offline,
    #[default]
    Unknown,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    #[default]
    Starting,
    Running,
    Busy,
    Idle,
    Error,
    ShuttingDown,
}

/// Worker-produced snapshot sent on the status cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub state: AgentState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_task: Option<String>,
    #[serde(default)]
    pub connected_channels: Vec<String>,
    pub uptime_sec: u64,
    pub memory_mb: u64,
    pub cpu_percent: f32,
    pub actions_today: u64,
    pub spend_today_usd: f64,
    /// Goal id -> completion fraction in 0.0..=1.0.
    #[serde(default)]
    pub goal_progress: HashMap<String, f64>,
}

// ─── Actions ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionCategory {
    Browse,
    Execute,
    Message,
    ApiCall,
    Spend,
    File,
    Other,
}

impl std::fmt::Display for ActionCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Browse => write!(f, "browse"),
            Self::Execute => write!(f, "execute"),
            Self::Message => write!(f, "message"),
            Self::ApiCall => write!(f, "api_call"),
            Self::Spend => write!(f, "spend"),
            Self::File => write!(f, "file"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// A logged, categorized unit of work performed by a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionLogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub category: ActionCategory,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl ActionLogEntry {
    /// The USD amount for spend accounting, when this is a spend entry with a
    /// numeric `details.amount`.
    pub fn spend_amount(&self) -> Option<f64> {
        if self.category != ActionCategory::Spend {
            return None;
        }
        self.details
            .as_ref()
            .and_then(|d| d.get("amount"))
            .and_then(Value::as_f64)
    }
}

// ─── Approvals ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalCategory {
    Spend,
    Action,
    Access,
}

impl std::fmt::Display for ApprovalCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spend => write!(f, "spend"),
            Self::Action => write!(f, "action"),
            Self::Access => write!(f, "access"),
        }
    }
}

/// A human-gated authorization request originated by a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub id: String,
    pub category: ApprovalCategory,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    pub expires_at: DateTime<Utc>,
}

// ─── Goals & knowledge ────────────────────────────────────────────────────────

/// An ordered objective with a 1..=5 priority.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Goal {
    pub id: String,
    pub description: String,
    pub priority: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub key_results: Vec<String>,
}

/// An inline knowledge document injected into a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnowledgeDoc {
    pub title: String,
    pub content: String,
}

// ─── Wire messages ────────────────────────────────────────────────────────────

/// Frames sent by a worker to the control plane.
///
/// One JSON object per WebSocket frame, discriminated by `type`. Unknown tags
/// fail deserialization so the receiver can drop the frame silently.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    #[serde(rename_all = "camelCase")]
    Heartbeat {
        agent_id: String,
        timestamp: DateTime<Utc>,
        uptime_sec: u64,
    },
    #[serde(rename_all = "camelCase")]
    Status {
        agent_id: String,
        report: StatusReport,
    },
    #[serde(rename_all = "camelCase")]
    Action {
        agent_id: String,
        entry: ActionLogEntry,
    },
    #[serde(rename_all = "camelCase")]
    ApprovalRequest {
        agent_id: String,
        request: ApprovalRequest,
    },
    #[serde(rename_all = "camelCase")]
    Error { agent_id: String, message: String },
}

impl WorkerMessage {
    pub fn agent_id(&self) -> &str {
        match self {
            Self::Heartbeat { agent_id, .. }
            | Self::Status { agent_id, .. }
            | Self::Action { agent_id, .. }
            | Self::ApprovalRequest { agent_id, .. }
            | Self::Error { agent_id, .. } => agent_id,
        }
    }
}

/// Frames sent by the control plane to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlaneMessage {
    UpdateConfig {
        config: Value,
    },
    UpdateGoals {
        goals: Vec<Goal>,
    },
    InjectKnowledge {
        documents: Vec<KnowledgeDoc>,
    },
    SendMessage {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ApprovalResponse {
        request_id: String,
        approved: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Restart,
    Shutdown,
    Ping,
}
