//! Control-plane server.
//!
//! Multiplexes worker WebSocket sessions, authenticates them against the
//! shared bearer token, relays operator commands, and ingests telemetry into
//! the fleet and approval managers. The HTTP management surface lives in
//! [`http`].

#![forbid(unsafe_code)]

pub mod http;

use axum::extract::ws::{CloseFrame, Message as WsMessage, Utf8Bytes, WebSocket};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use molt_approval::ApprovalManager;
use molt_fleet::FleetManager;
use molt_proto::{ConnectionState, PlaneMessage, WorkerMessage};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};

/// Close code sent to a session displaced by a newer connection for the same
/// agent id.
pub const REPLACED_CLOSE_CODE: u16 = 4000;
/// Close code sent to every session on server shutdown.
pub const GOING_AWAY_CLOSE_CODE: u16 = 1001;

const SESSION_BUFFER: usize = 64;

// ─── Sessions ─────────────────────────────────────────────────────────────────

/// Server-side handle for one live worker session.
struct ConnectedAgent {
    session_id: u64,
    outbound: mpsc::Sender<WsMessage>,
    connected_at: DateTime<Utc>,
    last_heartbeat: DateTime<Utc>,
    peer_addr: String,
}

/// Operator-facing view of a session.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub agent_id: String,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub peer_addr: String,
}

// ─── Control plane ────────────────────────────────────────────────────────────

pub struct ControlPlane {
    token: String,
    fleet: Arc<FleetManager>,
    approvals: Arc<ApprovalManager>,
    sessions: RwLock<HashMap<String, ConnectedAgent>>,
    next_session_id: AtomicU64,
    accepting: AtomicBool,
}

impl ControlPlane {
    pub fn new(
        token: impl Into<String>,
        fleet: Arc<FleetManager>,
        approvals: Arc<ApprovalManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            token: token.into(),
            fleet,
            approvals,
            sessions: RwLock::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
            accepting: AtomicBool::new(true),
        })
    }

    /// Bind the approval manager's resolution callback back to this server so
    /// every settled approval (operator response or expiry) is relayed to
    /// the originating worker. Called once by the orchestrator after
    /// construction; the constructor itself takes no server reference, which
    /// keeps the two components cycle-free.
    pub fn wire_approvals(self: &Arc<Self>) {
        let plane = Arc::clone(self);
        self.approvals.set_on_resolved(move |approval| {
            let plane = Arc::clone(&plane);
            tokio::spawn(async move {
                let approved = approval.state == molt_approval::ApprovalState::Approved;
                let delivered = plane
                    .send_approval_response(
                        &approval.agent_id,
                        &approval.id,
                        approved,
                        approval.reason.clone(),
                    )
                    .await;
                if !delivered {
                    debug!(
                        agent_id = %approval.agent_id,
                        request_id = %approval.id,
                        "approval response not delivered, worker offline"
                    );
                }
            });
        });
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn token_matches(&self, presented: &str) -> bool {
        !self.token.is_empty() && self.token == presented
    }

    /// Agent ids with a live session right now.
    pub async fn online_agents(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions
            .read()
            .await
            .iter()
            .map(|(agent_id, s)| SessionInfo {
                agent_id: agent_id.clone(),
                connected_at: s.connected_at,
                last_heartbeat: s.last_heartbeat,
                peer_addr: s.peer_addr.clone(),
            })
            .collect()
    }

    // ─── Outbound ─────────────────────────────────────────────────────────

    /// Serialize and queue a message for an agent's session. Returns whether
    /// delivery was attempted on a live session.
    pub async fn send_to_agent(&self, agent_id: &str, message: &PlaneMessage) -> bool {
        let json = match serde_json::to_string(message) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "failed to serialize outbound command");
                return false;
            }
        };
        let sessions = self.sessions.read().await;
        match sessions.get(agent_id) {
            Some(session) => session
                .outbound
                .try_send(WsMessage::Text(Utf8Bytes::from(json)))
                .is_ok(),
            None => false,
        }
    }

    pub async fn send_approval_response(
        &self,
        agent_id: &str,
        request_id: &str,
        approved: bool,
        reason: Option<String>,
    ) -> bool {
        self.send_to_agent(
            agent_id,
            &PlaneMessage::ApprovalResponse {
                request_id: request_id.to_string(),
                approved,
                reason,
            },
        )
        .await
    }

    // ─── Session lifecycle ────────────────────────────────────────────────

    /// Serve one admitted worker session until its socket dies.
    pub async fn handle_connection(
        self: Arc<Self>,
        socket: WebSocket,
        agent_id: String,
        peer_addr: String,
    ) {
        let (mut sink, mut stream) = socket.split();
        let (tx, mut rx) = mpsc::channel::<WsMessage>(SESSION_BUFFER);

        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let closing = matches!(message, WsMessage::Close(_));
                if sink.send(message).await.is_err() || closing {
                    break;
                }
            }
        });

        let session_id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();
        let replaced = self.sessions.write().await.insert(
            agent_id.clone(),
            ConnectedAgent {
                session_id,
                outbound: tx.clone(),
                connected_at: now,
                last_heartbeat: now,
                peer_addr: peer_addr.clone(),
            },
        );
        if let Some(previous) = replaced {
            info!(agent_id, "replacing existing session");
            let _ = previous.outbound.try_send(WsMessage::Close(Some(CloseFrame {
                code: REPLACED_CLOSE_CODE,
                reason: Utf8Bytes::from_static("Replaced by new connection"),
            })));
        }

        info!(agent_id, peer = %peer_addr, session_id, "worker connected");
        self.fleet
            .update_connection(&agent_id, ConnectionState::Online, Some(peer_addr))
            .await;

        while let Some(frame) = stream.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => self.dispatch(&agent_id, text.as_str()).await,
                Ok(WsMessage::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(agent_id, error = %e, "session read error");
                    break;
                }
            }
        }

        // Only the session that still owns the registry slot marks the agent
        // offline; a replaced session's slot was already rewritten.
        let owned = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(&agent_id) {
                Some(current) if current.session_id == session_id => {
                    sessions.remove(&agent_id);
                    true
                }
                _ => false,
            }
        };
        if owned {
            info!(agent_id, session_id, "worker disconnected");
            self.fleet
                .update_connection(&agent_id, ConnectionState::Offline, None)
                .await;
        } else {
            debug!(agent_id, session_id, "replaced session closed");
        }

        drop(tx);
        let _ = writer.await;
    }

    /// Parse and route one inbound frame. Malformed frames are dropped
    /// silently. The admitted session's agent id is authoritative; the id
    /// inside the frame is ignored.
    async fn dispatch(&self, agent_id: &str, text: &str) {
        let frame: WorkerMessage = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(agent_id, error = %e, "dropping malformed frame");
                return;
            }
        };

        match frame {
            WorkerMessage::Heartbeat {
                timestamp,
                uptime_sec,
                ..
            } => {
                if let Some(session) = self.sessions.write().await.get_mut(agent_id) {
                    session.last_heartbeat = timestamp;
                }
                self.fleet
                    .update_heartbeat(agent_id, timestamp, uptime_sec)
                    .await;
            }
            WorkerMessage::Status { report, .. } => {
                self.fleet.update_status(agent_id, report).await;
            }
            WorkerMessage::Action { entry, .. } => {
                self.fleet.record_action(agent_id, entry).await;
            }
            WorkerMessage::ApprovalRequest { request, .. } => {
                self.approvals.add_request(agent_id, request).await;
            }
            WorkerMessage::Error { message, .. } => {
                warn!(agent_id, %message, "worker reported error");
                self.fleet.record_error(agent_id, message).await;
            }
        }
    }

    /// Close every session with 1001 and stop accepting upgrades.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        let sessions: Vec<(String, ConnectedAgent)> =
            self.sessions.write().await.drain().collect();
        info!(count = sessions.len(), "closing all worker sessions");
        for (agent_id, session) in sessions {
            let _ = session.outbound.try_send(WsMessage::Close(Some(CloseFrame {
                code: GOING_AWAY_CLOSE_CODE,
                reason: Utf8Bytes::from_static("Server shutting down"),
            })));
            self.fleet
                .update_connection(&agent_id, ConnectionState::Offline, None)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use molt_proto::{ActionCategory, ApprovalCategory};
    use serde_json::json;

    async fn plane(dir: &std::path::Path) -> (Arc<ControlPlane>, Arc<FleetManager>, Arc<ApprovalManager>) {
        let fleet = Arc::new(FleetManager::load(dir.join("fleet.json")));
        let approvals = ApprovalManager::new();
        let plane = ControlPlane::new("T", Arc::clone(&fleet), Arc::clone(&approvals));
        (plane, fleet, approvals)
    }

    #[tokio::test]
    async fn token_check() {
        let dir = tempfile::tempdir().unwrap();
        let (plane, fleet, approvals) = plane(dir.path()).await;
        assert!(plane.token_matches("T"));
        assert!(!plane.token_matches("wrong"));
        assert!(!plane.token_matches(""));
        fleet.close().await;
        approvals.close().await;
    }

    #[tokio::test]
    async fn dispatch_heartbeat_updates_fleet() {
        let dir = tempfile::tempdir().unwrap();
        let (plane, fleet, approvals) = plane(dir.path()).await;

        let ts = Utc::now();
        let frame = json!({
            "type": "heartbeat",
            "agentId": "u1",
            "timestamp": ts,
            "uptimeSec": 42
        })
        .to_string();
        plane.dispatch("u1", &frame).await;

        let record = fleet.get("u1").await.expect("record materialized");
        assert_eq!(record.uptime_sec, 42);
        assert!(record.last_heartbeat.is_some());
        fleet.close().await;
        approvals.close().await;
    }

    #[tokio::test]
    async fn dispatch_action_and_error_feed_the_rings() {
        let dir = tempfile::tempdir().unwrap();
        let (plane, fleet, approvals) = plane(dir.path()).await;

        let action = json!({
            "type": "action",
            "agentId": "u1",
            "entry": {
                "id": uuid::Uuid::new_v4().to_string(),
                "timestamp": Utc::now(),
                "category": "spend",
                "summary": "bought api credits",
                "details": {"amount": 3.0}
            }
        })
        .to_string();
        plane.dispatch("u1", &action).await;
        plane
            .dispatch("u1", &json!({"type": "error", "agentId": "u1", "message": "boom"}).to_string())
            .await;

        let record = fleet.get("u1").await.unwrap();
        assert_eq!(record.total_actions, 1);
        assert!((record.total_spend_usd - 3.0).abs() < f64::EPSILON);
        assert_eq!(record.recent_errors.len(), 1);
        fleet.close().await;
        approvals.close().await;
    }

    #[tokio::test]
    async fn dispatch_approval_request_enqueues() {
        let dir = tempfile::tempdir().unwrap();
        let (plane, fleet, approvals) = plane(dir.path()).await;

        let frame = json!({
            "type": "approval_request",
            "agentId": "u1",
            "request": {
                "id": "R1",
                "category": "spend",
                "description": "buy credits",
                "amount": 12.5,
                "expiresAt": Utc::now() + ChronoDuration::seconds(60)
            }
        })
        .to_string();
        plane.dispatch("u1", &frame).await;

        let pending = approvals.pending(Some("u1")).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "R1");
        assert_eq!(pending[0].category, ApprovalCategory::Spend);
        fleet.close().await;
        approvals.close().await;
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let (plane, fleet, approvals) = plane(dir.path()).await;

        plane.dispatch("u1", "not json").await;
        plane.dispatch("u1", r#"{"missing":"type"}"#).await;
        plane.dispatch("u1", r#"{"type":"warp"}"#).await;

        // A malformed frame materializes nothing.
        assert!(fleet.get("u1").await.is_none());
        fleet.close().await;
        approvals.close().await;
    }

    #[tokio::test]
    async fn send_to_agent_without_session_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (plane, fleet, approvals) = plane(dir.path()).await;
        assert!(!plane.send_to_agent("ghost", &PlaneMessage::Ping).await);
        assert!(
            !plane
                .send_approval_response("ghost", "R1", true, None)
                .await
        );
        fleet.close().await;
        approvals.close().await;
    }

    #[tokio::test]
    async fn shutdown_stops_accepting() {
        let dir = tempfile::tempdir().unwrap();
        let (plane, fleet, approvals) = plane(dir.path()).await;
        assert!(plane.is_accepting());
        plane.shutdown().await;
        assert!(!plane.is_accepting());
        assert!(plane.online_agents().await.is_empty());
        fleet.close().await;
        approvals.close().await;
    }

    #[tokio::test]
    async fn wired_approvals_relay_resolutions_without_panicking_offline() {
        let dir = tempfile::tempdir().unwrap();
        let (plane, fleet, approvals) = plane(dir.path()).await;
        plane.wire_approvals();

        approvals
            .add_request(
                "u1",
                molt_proto::ApprovalRequest {
                    id: "R1".to_string(),
                    category: ApprovalCategory::Action,
                    description: "poke the prod db".to_string(),
                    amount: None,
                    currency: None,
                    expires_at: Utc::now() + ChronoDuration::seconds(60),
                },
            )
            .await;
        let resolved = approvals
            .resolve("R1", false, Some("op".to_string()), None)
            .await;
        assert!(resolved.is_some());
        // The relay task runs on the runtime; give it a beat.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        fleet.close().await;
        approvals.close().await;
    }

    #[test]
    fn action_category_still_round_trips_through_dispatch_shapes() {
        // Guard against drift between the proto enum and dashboard JSON.
        let entry = json!({"category": "api_call"});
        let parsed: ActionCategory =
            serde_json::from_value(entry["category"].clone()).unwrap();
        assert_eq!(parsed, ActionCategory::ApiCall);
    }
}
