//! Approval manager — the queue of human-gated requests.
//!
//! Pending approvals live only in memory; a resolved or expired entry moves
//! to a bounded history and never returns to the queue. A background task
//! expires overdue entries every 10 seconds. The control-plane server is
//! wired in through callbacks set after construction, which keeps this crate
//! free of a server reference.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use molt_proto::{ApprovalCategory, ApprovalRequest};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Capacity of the resolved/expired history, newest first.
pub const HISTORY_CAP: usize = 1000;

const EXPIRY_SCAN_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);

// ─── Records ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalState {
    Pending,
    Approved,
    Denied,
    Expired,
}

impl std::fmt::Display for ApprovalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Approved => write!(f, "approved"),
            Self::Denied => write!(f, "denied"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

/// One approval, pending or settled. State only ever moves from `pending` to
/// one of the three terminal states.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingApproval {
    pub id: String,
    pub agent_id: String,
    pub category: ApprovalCategory,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: ApprovalState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responded_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub responded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalSummary {
    pub pending: usize,
    pub approved_today: usize,
    pub denied_today: usize,
    pub expired_today: usize,
    pub approved_spend_today_usd: f64,
}

type Callback = Arc<dyn Fn(PendingApproval) + Send + Sync>;

// ─── Manager ──────────────────────────────────────────────────────────────────

struct Inner {
    queue: HashMap<String, PendingApproval>,
    history: VecDeque<PendingApproval>,
}

pub struct ApprovalManager {
    inner: Arc<RwLock<Inner>>,
    on_new_approval: std::sync::RwLock<Option<Callback>>,
    on_resolved: std::sync::RwLock<Option<Callback>>,
    expiry_task: Mutex<Option<JoinHandle<()>>>,
}

impl ApprovalManager {
    /// Create the manager and start the expiry timer.
    ///
    /// Must be called from within a tokio runtime. Callbacks are wired by the
    /// orchestrator afterwards via the setters.
    pub fn new() -> Arc<Self> {
        let manager = Arc::new(Self {
            inner: Arc::new(RwLock::new(Inner {
                queue: HashMap::new(),
                history: VecDeque::new(),
            })),
            on_new_approval: std::sync::RwLock::new(None),
            on_resolved: std::sync::RwLock::new(None),
            expiry_task: Mutex::new(None),
        });

        let scan = Arc::clone(&manager);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(EXPIRY_SCAN_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                scan.expire_overdue().await;
            }
        });
        // Registering the handle cannot block: nothing else holds the lock yet.
        if let Ok(mut slot) = manager.expiry_task.try_lock() {
            *slot = Some(task);
        }

        manager
    }

    /// Stop the expiry timer. Pending entries are left unresolved.
    pub async fn close(&self) {
        if let Some(task) = self.expiry_task.lock().await.take() {
            task.abort();
        }
    }

    pub fn set_on_new_approval(&self, callback: impl Fn(PendingApproval) + Send + Sync + 'static) {
        if let Ok(mut slot) = self.on_new_approval.write() {
            *slot = Some(Arc::new(callback));
        }
    }

    pub fn set_on_resolved(&self, callback: impl Fn(PendingApproval) + Send + Sync + 'static) {
        if let Ok(mut slot) = self.on_resolved.write() {
            *slot = Some(Arc::new(callback));
        }
    }

    fn fire(slot: &std::sync::RwLock<Option<Callback>>, approval: PendingApproval) {
        let callback = slot.read().ok().and_then(|s| s.clone());
        if let Some(callback) = callback {
            callback(approval);
        }
    }

    // ─── Mutators ─────────────────────────────────────────────────────────

    /// Register a worker-originated request as pending.
    pub async fn add_request(&self, agent_id: &str, request: ApprovalRequest) -> PendingApproval {
        let approval = PendingApproval {
            id: request.id,
            agent_id: agent_id.to_string(),
            category: request.category,
            description: request.description,
            amount: request.amount,
            currency: request.currency,
            created_at: Utc::now(),
            expires_at: request.expires_at,
            state: ApprovalState::Pending,
            responded_by: None,
            reason: None,
            responded_at: None,
        };

        self.inner
            .write()
            .await
            .queue
            .insert(approval.id.clone(), approval.clone());
        info!(id = %approval.id, agent_id, category = %approval.category, "approval queued");
        Self::fire(&self.on_new_approval, approval.clone());
        approval
    }

    /// Settle a pending approval. Returns `None` when the id is unknown or
    /// the entry is already in a terminal state.
    pub async fn resolve(
        &self,
        id: &str,
        approved: bool,
        responded_by: Option<String>,
        reason: Option<String>,
    ) -> Option<PendingApproval> {
        let resolved = {
            let mut inner = self.inner.write().await;
            let mut approval = inner.queue.remove(id)?;
            debug_assert_eq!(approval.state, ApprovalState::Pending);
            approval.state = if approved {
                ApprovalState::Approved
            } else {
                ApprovalState::Denied
            };
            approval.responded_by = responded_by;
            approval.reason = reason;
            approval.responded_at = Some(Utc::now());
            push_history(&mut inner.history, approval.clone());
            approval
        };

        info!(id, state = %resolved.state, "approval resolved");
        Self::fire(&self.on_resolved, resolved.clone());
        Some(resolved)
    }

    /// Move every past-expiry entry to history as `expired`, firing
    /// `on_resolved` for each. The timer calls this every 10 seconds.
    pub async fn expire_overdue(&self) -> Vec<PendingApproval> {
        let now = Utc::now();
        let expired: Vec<PendingApproval> = {
            let mut inner = self.inner.write().await;
            let due: Vec<String> = inner
                .queue
                .values()
                .filter(|a| a.expires_at <= now)
                .map(|a| a.id.clone())
                .collect();
            due.into_iter()
                .filter_map(|id| {
                    let mut approval = inner.queue.remove(&id)?;
                    approval.state = ApprovalState::Expired;
                    approval.responded_at = Some(now);
                    push_history(&mut inner.history, approval.clone());
                    Some(approval)
                })
                .collect()
        };

        for approval in &expired {
            info!(id = %approval.id, agent_id = %approval.agent_id, "approval expired");
            Self::fire(&self.on_resolved, approval.clone());
        }
        expired
    }

    // ─── Queries ──────────────────────────────────────────────────────────

    pub async fn pending(&self, agent_id: Option<&str>) -> Vec<PendingApproval> {
        let inner = self.inner.read().await;
        let mut entries: Vec<PendingApproval> = inner
            .queue
            .values()
            .filter(|a| agent_id.is_none_or(|id| a.agent_id == id))
            .cloned()
            .collect();
        entries.sort_by_key(|a| a.created_at);
        entries
    }

    pub async fn get(&self, id: &str) -> Option<PendingApproval> {
        self.inner.read().await.queue.get(id).cloned()
    }

    /// Paginated history, newest first.
    pub async fn history(&self, limit: usize, offset: usize) -> Vec<PendingApproval> {
        self.inner
            .read()
            .await
            .history
            .iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect()
    }

    pub async fn summary(&self) -> ApprovalSummary {
        let inner = self.inner.read().await;
        let today = Utc::now().date_naive();
        let mut summary = ApprovalSummary {
            pending: inner.queue.len(),
            approved_today: 0,
            denied_today: 0,
            expired_today: 0,
            approved_spend_today_usd: 0.0,
        };
        for entry in &inner.history {
            let settled_today = entry
                .responded_at
                .is_some_and(|t| t.date_naive() == today);
            if !settled_today {
                continue;
            }
            match entry.state {
                ApprovalState::Approved => {
                    summary.approved_today += 1;
                    if entry.category == ApprovalCategory::Spend {
                        summary.approved_spend_today_usd += entry.amount.unwrap_or(0.0);
                    }
                }
                ApprovalState::Denied => summary.denied_today += 1,
                ApprovalState::Expired => summary.expired_today += 1,
                ApprovalState::Pending => {}
            }
        }
        summary
    }
}

fn push_history(history: &mut VecDeque<PendingApproval>, entry: PendingApproval) {
    history.push_front(entry);
    history.truncate(HISTORY_CAP);
    debug!(len = history.len(), "approval history updated");
}
