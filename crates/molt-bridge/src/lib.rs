//! Worker-side bridge to the MoltAgent control plane.
//!
//! A long-lived reconnecting WebSocket client. The session state machine is
//! `disconnected → connecting → connected → disconnected`, with a `closed`
//! sink reached only by an explicit local [`Bridge::close`]. Reconnection is
//! entirely client-driven: exponential backoff doubling from 1 second, capped
//! at 60, reset on every successful open.

#![forbid(unsafe_code)]

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use molt_proto::{ActionLogEntry, ApprovalRequest, PlaneMessage, StatusReport, WorkerMessage};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, Notify, RwLock, mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::{Message, http::HeaderValue};
use tracing::{debug, error, info, warn};

/// Hard ceiling on the reconnect delay.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

/// An unanswered approval resolves to deny after this long.
pub const APPROVAL_TIMEOUT: Duration = Duration::from_secs(300);

const OUTBOUND_BUFFER: usize = 64;

// ─── Types ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid control-plane URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("bridge is closed")]
    Closed,

    #[error("outbound channel full or closed")]
    Send,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub agent_id: String,
    /// Control-plane WebSocket URL, without the `agentId` query parameter.
    pub url: String,
    pub token: String,
    pub heartbeat_interval: Duration,
}

/// Inbound commands surfaced to the embedding worker runtime.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    Connected,
    Disconnected,
    UpdateConfig(Value),
    UpdateGoals(Vec<molt_proto::Goal>),
    InjectKnowledge(Vec<molt_proto::KnowledgeDoc>),
    SendMessage {
        content: String,
        channel: Option<String>,
    },
    /// The supervisor restarts the process; exit 0.
    Restart,
    /// The instance is being destroyed; exit 0.
    Shutdown,
}

// ─── Bridge ───────────────────────────────────────────────────────────────────

pub struct Bridge {
    config: BridgeConfig,
    state: RwLock<BridgeState>,
    outbound_tx: mpsc::Sender<WorkerMessage>,
    outbound_rx: Mutex<Option<mpsc::Receiver<WorkerMessage>>>,
    events_tx: mpsc::Sender<BridgeEvent>,
    pending_approvals: Mutex<HashMap<String, oneshot::Sender<bool>>>,
    closed: AtomicBool,
    close_notify: Notify,
    started_at: Instant,
}

impl Bridge {
    /// Build a bridge and the event stream the runtime consumes.
    pub fn new(config: BridgeConfig) -> (Arc<Self>, mpsc::Receiver<BridgeEvent>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (events_tx, events_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let bridge = Arc::new(Self {
            config,
            state: RwLock::new(BridgeState::Disconnected),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            events_tx,
            pending_approvals: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            started_at: Instant::now(),
        });
        (bridge, events_rx)
    }

    pub async fn state(&self) -> BridgeState {
        *self.state.read().await
    }

    pub fn uptime_sec(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Enter the sink state. Suppresses any further reconnect scheduling and
    /// tears down the live session if one exists.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        *self.state.write().await = BridgeState::Closed;
        self.close_notify.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // ─── Outbound ─────────────────────────────────────────────────────────

    pub async fn send(&self, message: WorkerMessage) -> Result<(), BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::Closed);
        }
        self.outbound_tx
            .send(message)
            .await
            .map_err(|_| BridgeError::Send)
    }

    pub async fn send_status(&self, report: StatusReport) -> Result<(), BridgeError> {
        self.send(WorkerMessage::Status {
            agent_id: self.config.agent_id.clone(),
            report,
        })
        .await
    }

    pub async fn send_action(&self, entry: ActionLogEntry) -> Result<(), BridgeError> {
        self.send(WorkerMessage::Action {
            agent_id: self.config.agent_id.clone(),
            entry,
        })
        .await
    }

    pub async fn send_error(&self, message: impl Into<String>) -> Result<(), BridgeError> {
        self.send(WorkerMessage::Error {
            agent_id: self.config.agent_id.clone(),
            message: message.into(),
        })
        .await
    }

    // ─── Approval correlation ─────────────────────────────────────────────

    /// Send an approval request and wait for the operator's answer.
    ///
    /// Resolves to `false` (deny) when no matching `approval_response`
    /// arrives within the 5-minute window.
    pub async fn request_approval(&self, request: ApprovalRequest) -> bool {
        self.request_approval_with_timeout(request, APPROVAL_TIMEOUT)
            .await
    }

    pub async fn request_approval_with_timeout(
        &self,
        request: ApprovalRequest,
        timeout: Duration,
    ) -> bool {
        let request_id = request.id.clone();
        let (tx, rx) = oneshot::channel();
        self.pending_approvals
            .lock()
            .await
            .insert(request_id.clone(), tx);

        let sent = self
            .send(WorkerMessage::ApprovalRequest {
                agent_id: self.config.agent_id.clone(),
                request,
            })
            .await;
        if sent.is_err() {
            warn!(request_id, "approval request could not be queued");
        }

        let approved = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(approved)) => approved,
            Ok(Err(_)) => false,
            Err(_) => {
                debug!(request_id, "approval timed out, denying");
                false
            }
        };
        self.pending_approvals.lock().await.remove(&request_id);
        approved
    }

    /// Fulfil a pending approval. Unknown ids are dropped without effect.
    async fn complete_approval(&self, request_id: &str, approved: bool) {
        if let Some(tx) = self.pending_approvals.lock().await.remove(request_id) {
            let _ = tx.send(approved);
        } else {
            debug!(request_id, "approval response for unknown request, dropping");
        }
    }

    // ─── Session loop ─────────────────────────────────────────────────────

    /// Run until [`Bridge::close`] is called: connect, serve the session,
    /// reconnect with exponential backoff on any drop.
    pub async fn run(self: &Arc<Self>) {
        let mut attempt: u32 = 0;
        loop {
            if self.is_closed() {
                break;
            }
            *self.state.write().await = BridgeState::Connecting;

            match self.run_session(&mut attempt).await {
                Ok(()) => info!("control-plane session ended"),
                Err(e) => warn!(error = %e, "control-plane connection failed"),
            }

            if self.is_closed() {
                break;
            }
            *self.state.write().await = BridgeState::Disconnected;
            let _ = self.events_tx.send(BridgeEvent::Disconnected).await;

            attempt += 1;
            let delay = reconnect_delay(attempt);
            info!(attempt, delay_secs = delay.as_secs(), "reconnecting");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.close_notify.notified() => {}
            }
        }
        *self.state.write().await = BridgeState::Closed;
    }

    fn dial_url(&self) -> Result<url::Url, BridgeError> {
        let mut url = url::Url::parse(&self.config.url)?;
        url.query_pairs_mut()
            .append_pair("agentId", &self.config.agent_id);
        Ok(url)
    }

    async fn run_session(self: &Arc<Self>, attempt: &mut u32) -> Result<(), BridgeError> {
        let url = self.dial_url()?;
        info!(url = %url, "connecting to control plane");

        let mut request = url.as_str().into_client_request()?;
        let bearer = format!("Bearer {}", self.config.token);
        if let Ok(value) = HeaderValue::from_str(&bearer) {
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (ws, _) = connect_async(request).await?;
        let (mut write, mut read) = ws.split();

        *self.state.write().await = BridgeState::Connected;
        *attempt = 0;
        info!(agent_id = %self.config.agent_id, "connected to control plane");
        let _ = self.events_tx.send(BridgeEvent::Connected).await;

        let mut outbound_rx = self
            .outbound_rx
            .lock()
            .await
            .take()
            .unwrap_or_else(|| mpsc::channel(OUTBOUND_BUFFER).1);
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.tick().await; // interval's first tick is immediate; skip it

        let result = loop {
            tokio::select! {
                _ = self.close_notify.notified() => {
                    let _ = write.send(Message::Close(None)).await;
                    break Ok(());
                }

                Some(message) = outbound_rx.recv() => {
                    let json = match serde_json::to_string(&message) {
                        Ok(json) => json,
                        Err(e) => {
                            error!(error = %e, "failed to serialize outbound message");
                            continue;
                        }
                    };
                    if let Err(e) = write.send(Message::Text(json)).await {
                        break Err(BridgeError::WebSocket(e));
                    }
                }

                _ = heartbeat.tick() => {
                    let frame = WorkerMessage::Heartbeat {
                        agent_id: self.config.agent_id.clone(),
                        timestamp: Utc::now(),
                        uptime_sec: self.uptime_sec(),
                    };
                    let json = serde_json::to_string(&frame).unwrap_or_default();
                    if let Err(e) = write.send(Message::Text(json)).await {
                        break Err(BridgeError::WebSocket(e));
                    }
                }

                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => self.handle_inbound(&text).await,
                        Some(Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Binary(_)) | Ok(Message::Frame(_))) => {}
                        Some(Ok(Message::Close(frame))) => {
                            info!(?frame, "control plane closed the session");
                            break Ok(());
                        }
                        Some(Err(e)) => break Err(BridgeError::WebSocket(e)),
                        None => break Ok(()),
                    }
                }
            }
        };

        // Stow the receiver for the next session so queued messages survive.
        *self.outbound_rx.lock().await = Some(outbound_rx);
        result
    }

    /// Dispatch one inbound frame. Malformed frames are dropped silently;
    /// the wire is untrusted against bugs, not adversaries beyond the auth
    /// boundary.
    async fn handle_inbound(&self, text: &str) {
        let message: PlaneMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "dropping malformed frame");
                return;
            }
        };

        match message {
            PlaneMessage::Ping => {}
            PlaneMessage::ApprovalResponse {
                request_id,
                approved,
                reason,
            } => {
                info!(request_id, approved, ?reason, "approval response received");
                self.complete_approval(&request_id, approved).await;
            }
            PlaneMessage::Restart => {
                info!("restart command received");
                let _ = self.events_tx.send(BridgeEvent::Restart).await;
            }
            PlaneMessage::Shutdown => {
                info!("shutdown command received");
                let _ = self.events_tx.send(BridgeEvent::Shutdown).await;
            }
            PlaneMessage::UpdateConfig { config } => {
                info!("config update received");
                let _ = self.events_tx.send(BridgeEvent::UpdateConfig(config)).await;
            }
            PlaneMessage::UpdateGoals { goals } => {
                info!(count = goals.len(), "goal update received");
                let _ = self.events_tx.send(BridgeEvent::UpdateGoals(goals)).await;
            }
            PlaneMessage::InjectKnowledge { documents } => {
                info!(count = documents.len(), "knowledge injection received");
                let _ = self
                    .events_tx
                    .send(BridgeEvent::InjectKnowledge(documents))
                    .await;
            }
            PlaneMessage::SendMessage { content, channel } => {
                info!(?channel, "outbound message relay received");
                let _ = self
                    .events_tx
                    .send(BridgeEvent::SendMessage { content, channel })
                    .await;
            }
        }
    }
}

/// Backoff before reconnect attempt `n` (1-based): `min(1s · 2^(n-1), 60s)`.
pub fn reconnect_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(6);
    MAX_RECONNECT_DELAY.min(Duration::from_secs(1u64 << exp))
}
