//! Fleet manager — the durable registry of deployed workers.
//!
//! One JSON file backs the whole fleet. Mutations set a dirty flag; a
//! background task persists every 30 seconds when something changed, and
//! `close` flushes synchronously. Live connection state is authoritative only
//! while the process runs: every record loaded from disk starts `offline`
//! and workers must re-announce.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use molt_manifest::Manifest;
use molt_persist::StateFile;
use molt_proto::{ActionLogEntry, ConnectionState, StatusReport, VpsInstance};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the per-agent recent-actions ring.
pub const ACTION_RING_CAP: usize = 200;
/// Capacity of the per-agent recent-errors ring.
pub const ERROR_RING_CAP: usize = 50;
/// Fleet file schema version. Unknown versions load as an empty fleet.
pub const FLEET_FILE_VERSION: u32 = 1;

const SAVE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

// ─── Records ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Everything the control plane knows about one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub manifest: Manifest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<VpsInstance>,
    #[serde(default)]
    pub connection: ConnectionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<StatusReport>,
    pub deployed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(default)]
    pub uptime_sec: u64,
    /// Newest first, never more than [`ACTION_RING_CAP`] entries.
    #[serde(default)]
    pub recent_actions: VecDeque<ActionLogEntry>,
    /// Newest first, never more than [`ERROR_RING_CAP`] entries.
    #[serde(default)]
    pub recent_errors: VecDeque<ErrorEntry>,
    #[serde(default)]
    pub total_actions: u64,
    #[serde(default)]
    pub total_spend_usd: f64,
}

impl AgentRecord {
    fn new(manifest: Manifest, instance: Option<VpsInstance>) -> Self {
        Self {
            manifest,
            instance,
            connection: ConnectionState::Unknown,
            remote_addr: None,
            last_status: None,
            deployed_at: Utc::now(),
            last_heartbeat: None,
            uptime_sec: 0,
            recent_actions: VecDeque::new(),
            recent_errors: VecDeque::new(),
            total_actions: 0,
            total_spend_usd: 0.0,
        }
    }
}

/// Aggregate counters across the fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetSummary {
    pub total_agents: usize,
    pub online: usize,
    pub offline: usize,
    pub total_actions: u64,
    pub total_spend_usd: f64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FleetFile {
    version: u32,
    updated_at: DateTime<Utc>,
    agents: HashMap<String, AgentRecord>,
}

// ─── Manager ──────────────────────────────────────────────────────────────────

struct Inner {
    agents: HashMap<String, AgentRecord>,
    dirty: bool,
}

pub struct FleetManager {
    inner: Arc<RwLock<Inner>>,
    store: Arc<StateFile>,
    save_task: Mutex<Option<JoinHandle<()>>>,
}

impl FleetManager {
    /// Load the fleet file (if any) and start the background save timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let store = Arc::new(StateFile::new(path));
        let agents = match store.load::<FleetFile>() {
            Some(file) if file.version == FLEET_FILE_VERSION => {
                let mut agents = file.agents;
                // Live state comes from the control plane only.
                for record in agents.values_mut() {
                    record.connection = ConnectionState::Offline;
                }
                info!(count = agents.len(), "loaded fleet registry");
                agents
            }
            Some(file) => {
                warn!(version = file.version, "unknown fleet file version, starting empty");
                HashMap::new()
            }
            None => HashMap::new(),
        };

        let inner = Arc::new(RwLock::new(Inner {
            agents,
            dirty: false,
        }));

        let save_inner = Arc::clone(&inner);
        let save_store = Arc::clone(&store);
        let save_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SAVE_INTERVAL);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                persist_if_dirty(&save_inner, &save_store).await;
            }
        });

        Self {
            inner,
            store,
            save_task: Mutex::new(Some(save_task)),
        }
    }

    /// Stop the save timer and flush once.
    pub async fn close(&self) {
        if let Some(task) = self.save_task.lock().await.take() {
            task.abort();
        }
        persist_if_dirty(&self.inner, &self.store).await;
    }

    /// Force a save regardless of the dirty flag.
    pub async fn flush(&self) {
        let mut inner = self.inner.write().await;
        inner.dirty = true;
        drop(inner);
        persist_if_dirty(&self.inner, &self.store).await;
    }

    // ─── Mutators ─────────────────────────────────────────────────────────

    /// Register (or re-register) an agent. Counters, ring contents, and the
    /// deploy timestamp survive re-registration of an existing id.
    pub async fn register_agent(&self, manifest: Manifest, instance: Option<VpsInstance>) {
        let id = manifest.identity.id.clone();
        let mut inner = self.inner.write().await;
        match inner.agents.get_mut(&id) {
            Some(existing) => {
                existing.manifest = manifest;
                if instance.is_some() {
                    existing.instance = instance;
                }
            }
            None => {
                inner.agents.insert(id.clone(), AgentRecord::new(manifest, instance));
            }
        }
        inner.dirty = true;
        debug!(agent_id = %id, "agent registered");
    }

    pub async fn update_connection(
        &self,
        agent_id: &str,
        connection: ConnectionState,
        remote_addr: Option<String>,
    ) {
        let mut inner = self.inner.write().await;
        let record = ensure_record(&mut inner.agents, agent_id);
        record.connection = connection;
        if remote_addr.is_some() {
            record.remote_addr = remote_addr;
        }
        inner.dirty = true;
    }

    pub async fn update_heartbeat(&self, agent_id: &str, timestamp: DateTime<Utc>, uptime_sec: u64) {
        let mut inner = self.inner.write().await;
        let record = ensure_record(&mut inner.agents, agent_id);
        record.last_heartbeat = Some(timestamp);
        record.uptime_sec = uptime_sec;
        inner.dirty = true;
    }

    pub async fn update_status(&self, agent_id: &str, report: StatusReport) {
        let mut inner = self.inner.write().await;
        let record = ensure_record(&mut inner.agents, agent_id);
        record.uptime_sec = report.uptime_sec;
        record.last_status = Some(report);
        inner.dirty = true;
    }

    /// Append an action newest-first, keeping the ring bounded and the
    /// counters monotonic. Spend entries with a numeric amount add to the
    /// cumulative spend.
    pub async fn record_action(&self, agent_id: &str, entry: ActionLogEntry) {
        let mut inner = self.inner.write().await;
        let record = ensure_record(&mut inner.agents, agent_id);
        if let Some(amount) = entry.spend_amount() {
            record.total_spend_usd += amount;
        }
        record.recent_actions.push_front(entry);
        record.recent_actions.truncate(ACTION_RING_CAP);
        record.total_actions += 1;
        inner.dirty = true;
    }

    pub async fn record_error(&self, agent_id: &str, message: String) {
        let mut inner = self.inner.write().await;
        let record = ensure_record(&mut inner.agents, agent_id);
        record.recent_errors.push_front(ErrorEntry {
            timestamp: Utc::now(),
            message,
        });
        record.recent_errors.truncate(ERROR_RING_CAP);
        inner.dirty = true;
    }

    pub async fn remove_agent(&self, agent_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        let removed = inner.agents.remove(agent_id).is_some();
        if removed {
            inner.dirty = true;
        }
        removed
    }

    // ─── Queries ──────────────────────────────────────────────────────────

    pub async fn get(&self, agent_id: &str) -> Option<AgentRecord> {
        self.inner.read().await.agents.get(agent_id).cloned()
    }

    pub async fn list(&self) -> Vec<AgentRecord> {
        self.inner.read().await.agents.values().cloned().collect()
    }

    pub async fn online(&self) -> Vec<AgentRecord> {
        self.inner
            .read()
            .await
            .agents
            .values()
            .filter(|r| r.connection == ConnectionState::Online)
            .cloned()
            .collect()
    }

    pub async fn summary(&self) -> FleetSummary {
        let inner = self.inner.read().await;
        let mut summary = FleetSummary {
            total_agents: inner.agents.len(),
            online: 0,
            offline: 0,
            total_actions: 0,
            total_spend_usd: 0.0,
        };
        for record in inner.agents.values() {
            match record.connection {
                ConnectionState::Online => summary.online += 1,
                _ => summary.offline += 1,
            }
            summary.total_actions += record.total_actions;
            summary.total_spend_usd += record.total_spend_usd;
        }
        summary
    }

    /// Paginated slice of the recent-actions ring, newest first.
    pub async fn recent_actions(
        &self,
        agent_id: &str,
        limit: usize,
        offset: usize,
    ) -> Vec<ActionLogEntry> {
        self.inner
            .read()
            .await
            .agents
            .get(agent_id)
            .map(|r| {
                r.recent_actions
                    .iter()
                    .skip(offset)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Connection, heartbeat, and action frames may arrive for an agent the
/// orchestrator never provisioned (manual workers). Materialize a skeleton
/// record so the data is not dropped.
fn ensure_record<'a>(
    agents: &'a mut HashMap<String, AgentRecord>,
    agent_id: &str,
) -> &'a mut AgentRecord {
    agents.entry(agent_id.to_string()).or_insert_with(|| {
        let mut manifest = Manifest::default();
        manifest.identity.id = agent_id.to_string();
        manifest.identity.name = agent_id.to_string();
        AgentRecord::new(manifest, None)
    })
}

async fn persist_if_dirty(inner: &Arc<RwLock<Inner>>, store: &Arc<StateFile>) {
    let snapshot = {
        let mut guard = inner.write().await;
        if !guard.dirty {
            return;
        }
        guard.dirty = false;
        FleetFile {
            version: FLEET_FILE_VERSION,
            updated_at: Utc::now(),
            agents: guard.agents.clone(),
        }
    };
    if let Err(e) = store.save(&snapshot) {
        warn!(error = %e, "failed to persist fleet registry");
        inner.write().await.dirty = true;
    } else {
        debug!(count = snapshot.agents.len(), "fleet registry persisted");
    }
}
