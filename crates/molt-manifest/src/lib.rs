//! Manifest schema for MoltAgent workers.
//!
//! The manifest is the immutable root document describing a deployable
//! worker. Every field has a default so partial inputs still yield a complete
//! manifest; validation is purely structural and returns the full list of
//! issues rather than the first one. Semantic coherence (e.g. a wallet being
//! present when crypto spending is enabled) is a documented precondition of
//! the consumers.

#![forbid(unsafe_code)]

use molt_proto::{Goal, KnowledgeDoc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;

/// Current manifest schema version. Carried as a literal for forward
/// compatibility.
pub const SCHEMA_VERSION: u32 = 1;

const KNOWN_KEYS: &[&str] = &[
    "schemaVersion",
    "identity",
    "agentConfig",
    "capabilities",
    "channels",
    "resources",
    "financialControls",
    "controlPlane",
    "retention",
    "goals",
    "knowledge",
    "metadata",
];

// ─── Errors ───────────────────────────────────────────────────────────────────

/// One structural problem found while validating a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Dotted path to the offending field, e.g. `goals[2].priority`.
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest is not valid JSON: {0}")]
    Json(String),

    #[error("manifest does not match the schema: {0}")]
    Schema(String),

    #[error("manifest failed validation ({} issue(s))", .0.len())]
    Invalid(Vec<ValidationIssue>),
}

/// Discriminated outcome of [`Manifest::safe_parse`].
#[derive(Debug)]
pub enum ParseOutcome {
    Valid(Box<Manifest>),
    Invalid(Vec<ValidationIssue>),
}

// ─── Sections ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    #[serde(default = "fresh_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub owner_id: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Default for Identity {
    fn default() -> Self {
        Self {
            id: fresh_id(),
            name: String::new(),
            owner_id: String::new(),
            tags: Vec::new(),
            avatar: None,
            description: None,
        }
    }
}

fn fresh_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Inline tool descriptor handed to the worker runtime verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default = "default_model_provider")]
    pub model_provider: String,
    #[serde(default = "default_model_name")]
    pub model_name: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            model_provider: default_model_provider(),
            model_name: default_model_name(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            skills: Vec::new(),
            tools: Vec::new(),
        }
    }
}

fn default_model_provider() -> String {
    "anthropic".to_string()
}
fn default_model_name() -> String {
    "claude-3-5-sonnet".to_string()
}
fn default_temperature() -> f64 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitRepo {
    pub url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_command: Option<String>,
}

fn default_branch() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    #[serde(default)]
    pub web_browsing: bool,
    #[serde(default)]
    pub code_execution: bool,
    #[serde(default)]
    pub terminal: bool,
    #[serde(default)]
    pub file_system: bool,
    #[serde(default)]
    pub git_repos: Vec<GitRepo>,
    #[serde(default)]
    pub os_packages: Vec<String>,
    #[serde(default)]
    pub npm_packages: Vec<String>,
    #[serde(default)]
    pub pip_packages: Vec<String>,
}

/// A typed credential bag for one messaging channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfig {
    #[serde(rename = "type")]
    pub channel_type: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub credentials: HashMap<String, String>,
    #[serde(default)]
    pub settings: HashMap<String, Value>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resources {
    #[serde(default = "default_server_type")]
    pub server_type: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_disk_gb")]
    pub disk_gb: u32,
    #[serde(default = "default_docker_image")]
    pub docker_image: String,
    /// Provider override; empty means the provisioner's default.
    #[serde(default)]
    pub provider: String,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            server_type: default_server_type(),
            region: default_region(),
            disk_gb: default_disk_gb(),
            docker_image: default_docker_image(),
            provider: String::new(),
        }
    }
}

fn default_server_type() -> String {
    "cx22".to_string()
}
fn default_region() -> String {
    "nbg1".to_string()
}
fn default_disk_gb() -> u32 {
    40
}
fn default_docker_image() -> String {
    "moltagent/worker:latest".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletConfig {
    pub address: String,
    #[serde(default)]
    pub chain: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinancialControls {
    #[serde(default = "default_max_per_transaction")]
    pub max_per_transaction_usd: f64,
    #[serde(default = "default_max_per_day")]
    pub max_per_day_usd: f64,
    #[serde(default = "default_max_per_month")]
    pub max_per_month_usd: f64,
    #[serde(default)]
    pub require_approval_for_all: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet: Option<WalletConfig>,
}

impl Default for FinancialControls {
    fn default() -> Self {
        Self {
            max_per_transaction_usd: default_max_per_transaction(),
            max_per_day_usd: default_max_per_day(),
            max_per_month_usd: default_max_per_month(),
            require_approval_for_all: false,
            wallet: None,
        }
    }
}

fn default_max_per_transaction() -> f64 {
    10.0
}
fn default_max_per_day() -> f64 {
    50.0
}
fn default_max_per_month() -> f64 {
    500.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneConfig {
    #[serde(default = "default_cp_url")]
    pub url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_sec: u64,
    #[serde(default = "default_status_interval")]
    pub status_report_interval_sec: u64,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            url: default_cp_url(),
            token: String::new(),
            heartbeat_interval_sec: default_heartbeat_interval(),
            status_report_interval_sec: default_status_interval(),
        }
    }
}

fn default_cp_url() -> String {
    "ws://localhost:18790".to_string()
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_status_interval() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Retention {
    #[serde(default = "default_action_log_days")]
    pub action_log_days: u32,
    #[serde(default = "default_recording_days")]
    pub recording_days: u32,
    #[serde(default)]
    pub live_stream: bool,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            action_log_days: default_action_log_days(),
            recording_days: default_recording_days(),
            live_stream: false,
        }
    }
}

fn default_action_log_days() -> u32 {
    30
}
fn default_recording_days() -> u32 {
    7
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Knowledge {
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub documents: Vec<KnowledgeDoc>,
}

// ─── Manifest ─────────────────────────────────────────────────────────────────

/// The declarative root document that fully describes a deployable worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    #[serde(default)]
    pub identity: Identity,
    #[serde(default)]
    pub agent_config: AgentConfig,
    #[serde(default)]
    pub capabilities: Capabilities,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default)]
    pub financial_controls: FinancialControls,
    #[serde(default)]
    pub control_plane: ControlPlaneConfig,
    #[serde(default)]
    pub retention: Retention,
    #[serde(default)]
    pub goals: Vec<Goal>,
    #[serde(default)]
    pub knowledge: Knowledge,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            identity: Identity::default(),
            agent_config: AgentConfig::default(),
            capabilities: Capabilities::default(),
            channels: Vec::new(),
            resources: Resources::default(),
            financial_controls: FinancialControls::default(),
            control_plane: ControlPlaneConfig::default(),
            retention: Retention::default(),
            goals: Vec::new(),
            knowledge: Knowledge::default(),
            metadata: HashMap::new(),
        }
    }
}

impl Manifest {
    /// Parse and validate a manifest document.
    ///
    /// Unknown top-level keys are moved into `metadata` rather than rejected.
    /// All validation issues are collected; the error carries the full list.
    pub fn parse(bytes: &[u8]) -> Result<Self, ManifestError> {
        let mut value: Value =
            serde_json::from_slice(bytes).map_err(|e| ManifestError::Json(e.to_string()))?;
        let obj = value
            .as_object_mut()
            .ok_or_else(|| ManifestError::Schema("top level must be a JSON object".to_string()))?;

        fold_unknown_keys(obj);

        let manifest: Manifest =
            serde_json::from_value(value).map_err(|e| ManifestError::Schema(e.to_string()))?;

        let issues = manifest.validate();
        if issues.is_empty() {
            Ok(manifest)
        } else {
            Err(ManifestError::Invalid(issues))
        }
    }

    /// Like [`Manifest::parse`] but with a discriminated outcome instead of an
    /// error, folding JSON and schema failures into a single root issue.
    pub fn safe_parse(bytes: &[u8]) -> ParseOutcome {
        match Self::parse(bytes) {
            Ok(m) => ParseOutcome::Valid(Box::new(m)),
            Err(ManifestError::Invalid(issues)) => ParseOutcome::Invalid(issues),
            Err(e) => ParseOutcome::Invalid(vec![ValidationIssue {
                path: "$".to_string(),
                message: e.to_string(),
            }]),
        }
    }

    /// Structural validation. Returns every issue found.
    pub fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        let mut push = |path: &str, message: String| {
            issues.push(ValidationIssue {
                path: path.to_string(),
                message,
            });
        };

        if self.schema_version != SCHEMA_VERSION {
            push(
                "schemaVersion",
                format!("unsupported schema version {}", self.schema_version),
            );
        }

        if uuid::Uuid::parse_str(&self.identity.id).is_err() {
            push("identity.id", format!("not a UUID: {:?}", self.identity.id));
        }
        if self.identity.name.trim().is_empty() {
            push("identity.name", "must not be empty".to_string());
        }

        if !(0.0..=2.0).contains(&self.agent_config.temperature) {
            push(
                "agentConfig.temperature",
                format!("{} is outside 0.0..=2.0", self.agent_config.temperature),
            );
        }

        if let Err(e) = url::Url::parse(&self.control_plane.url) {
            push("controlPlane.url", format!("not a URL: {e}"));
        }
        if self.control_plane.heartbeat_interval_sec == 0 {
            push(
                "controlPlane.heartbeatIntervalSec",
                "must be at least 1 second".to_string(),
            );
        }
        if self.control_plane.status_report_interval_sec == 0 {
            push(
                "controlPlane.statusReportIntervalSec",
                "must be at least 1 second".to_string(),
            );
        }

        let fc = &self.financial_controls;
        for (path, cap) in [
            ("financialControls.maxPerTransactionUsd", fc.max_per_transaction_usd),
            ("financialControls.maxPerDayUsd", fc.max_per_day_usd),
            ("financialControls.maxPerMonthUsd", fc.max_per_month_usd),
        ] {
            if cap < 0.0 || !cap.is_finite() {
                push(path, format!("{cap} is not a non-negative amount"));
            }
        }

        for (i, goal) in self.goals.iter().enumerate() {
            if !(1..=5).contains(&goal.priority) {
                push(
                    &format!("goals[{i}].priority"),
                    format!("{} is outside 1..=5", goal.priority),
                );
            }
            if goal.description.trim().is_empty() {
                push(&format!("goals[{i}].description"), "must not be empty".to_string());
            }
        }

        for (i, u) in self.knowledge.urls.iter().enumerate() {
            if url::Url::parse(u).is_err() {
                push(&format!("knowledge.urls[{i}]"), format!("not a URL: {u:?}"));
            }
        }

        for (i, repo) in self.capabilities.git_repos.iter().enumerate() {
            if url::Url::parse(&repo.url).is_err() {
                push(
                    &format!("capabilities.gitRepos[{i}].url"),
                    format!("not a URL: {:?}", repo.url),
                );
            }
            if repo.path.trim().is_empty() {
                push(
                    &format!("capabilities.gitRepos[{i}].path"),
                    "must not be empty".to_string(),
                );
            }
        }

        issues
    }

    /// Serialize with the control-plane token and every channel credential
    /// replaced by `***`, for operator-facing views.
    pub fn redacted(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Some(cp) = value.pointer_mut("/controlPlane/token") {
            *cp = Value::String("***".to_string());
        }
        if let Some(Value::Array(channels)) = value.get_mut("channels") {
            for channel in channels {
                if let Some(Value::Object(creds)) = channel.get_mut("credentials") {
                    for (_, v) in creds.iter_mut() {
                        *v = Value::String("***".to_string());
                    }
                }
            }
        }
        value
    }
}

/// Move unrecognized top-level keys into `metadata`, preserving any explicit
/// metadata entries on collision.
fn fold_unknown_keys(obj: &mut Map<String, Value>) {
    let unknown: Vec<String> = obj
        .keys()
        .filter(|k| !KNOWN_KEYS.contains(&k.as_str()))
        .cloned()
        .collect();
    if unknown.is_empty() {
        return;
    }

    let mut extra = Map::new();
    for key in unknown {
        if let Some(v) = obj.remove(&key) {
            extra.insert(key, v);
        }
    }

    let metadata = obj
        .entry("metadata".to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if let Some(meta) = metadata.as_object_mut() {
        for (k, v) in extra {
            meta.entry(k).or_insert(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn minimal() -> Vec<u8> {
        json!({
            "identity": { "name": "a1" }
        })
        .to_string()
        .into_bytes()
    }

    #[test]
    fn minimal_manifest_gets_defaults() {
        let m = Manifest::parse(&minimal()).unwrap();
        assert_eq!(m.schema_version, SCHEMA_VERSION);
        assert_eq!(m.identity.name, "a1");
        assert!(uuid::Uuid::parse_str(&m.identity.id).is_ok());
        assert_eq!(m.resources.server_type, "cx22");
        assert_eq!(m.control_plane.heartbeat_interval_sec, 30);
        assert_eq!(m.financial_controls.max_per_day_usd, 50.0);
        assert!(m.channels.is_empty());
    }

    #[test]
    fn unknown_top_level_keys_fold_into_metadata() {
        let bytes = json!({
            "identity": { "name": "a1" },
            "experimental": { "flag": true },
            "metadata": { "kept": "yes" }
        })
        .to_string()
        .into_bytes();
        let m = Manifest::parse(&bytes).unwrap();
        assert_eq!(m.metadata.get("kept"), Some(&json!("yes")));
        assert_eq!(m.metadata.get("experimental"), Some(&json!({"flag": true})));
    }

    #[test]
    fn reparse_is_idempotent() {
        let m1 = Manifest::parse(&minimal()).unwrap();
        let serialized = serde_json::to_vec(&m1).unwrap();
        let m2 = Manifest::parse(&serialized).unwrap();
        assert_eq!(
            serde_json::to_value(&m1).unwrap(),
            serde_json::to_value(&m2).unwrap()
        );
    }

    #[test]
    fn priority_out_of_range_rejects_with_path() {
        let bytes = json!({
            "identity": { "name": "a1" },
            "goals": [
                { "id": "g1", "description": "ship", "priority": 3 },
                { "id": "g2", "description": "win", "priority": 9 }
            ]
        })
        .to_string()
        .into_bytes();
        match Manifest::parse(&bytes) {
            Err(ManifestError::Invalid(issues)) => {
                assert_eq!(issues.len(), 1);
                assert_eq!(issues[0].path, "goals[1].priority");
            }
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn bad_urls_reject() {
        let bytes = json!({
            "identity": { "name": "a1" },
            "controlPlane": { "url": "not a url" },
            "knowledge": { "urls": ["https://ok.example", "nope"] }
        })
        .to_string()
        .into_bytes();
        match Manifest::parse(&bytes) {
            Err(ManifestError::Invalid(issues)) => {
                let paths: Vec<&str> = issues.iter().map(|i| i.path.as_str()).collect();
                assert!(paths.contains(&"controlPlane.url"), "{paths:?}");
                assert!(paths.contains(&"knowledge.urls[1]"), "{paths:?}");
            }
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn negative_spend_caps_reject() {
        let bytes = json!({
            "identity": { "name": "a1" },
            "financialControls": { "maxPerDayUsd": -5.0 }
        })
        .to_string()
        .into_bytes();
        match Manifest::parse(&bytes) {
            Err(ManifestError::Invalid(issues)) => {
                assert_eq!(issues[0].path, "financialControls.maxPerDayUsd");
            }
            other => panic!("expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn safe_parse_collects_json_errors_as_root_issue() {
        match Manifest::safe_parse(b"{ not json") {
            ParseOutcome::Invalid(issues) => {
                assert_eq!(issues[0].path, "$");
            }
            ParseOutcome::Valid(_) => panic!("expected Invalid"),
        }
    }

    #[test]
    fn safe_parse_valid_round_trip() {
        match Manifest::safe_parse(&minimal()) {
            ParseOutcome::Valid(m) => assert_eq!(m.identity.name, "a1"),
            ParseOutcome::Invalid(issues) => panic!("unexpected issues: {issues:?}"),
        }
    }

    #[test]
    fn channel_type_uses_type_key_on_the_wire() {
        let bytes = json!({
            "identity": { "name": "a1" },
            "channels": [
                { "type": "telegram", "credentials": { "botToken": "secret" } }
            ]
        })
        .to_string()
        .into_bytes();
        let m = Manifest::parse(&bytes).unwrap();
        assert_eq!(m.channels[0].channel_type, "telegram");
        assert!(m.channels[0].enabled, "enabled defaults to true");

        let back = serde_json::to_value(&m).unwrap();
        assert_eq!(back["channels"][0]["type"], "telegram");
    }

    #[test]
    fn redacted_masks_token_and_channel_credentials() {
        let bytes = json!({
            "identity": { "name": "a1" },
            "controlPlane": { "token": "super-secret" },
            "channels": [
                { "type": "telegram", "credentials": { "botToken": "secret" } }
            ]
        })
        .to_string()
        .into_bytes();
        let m = Manifest::parse(&bytes).unwrap();
        let redacted = m.redacted();
        assert_eq!(redacted["controlPlane"]["token"], "***");
        assert_eq!(redacted["channels"][0]["credentials"]["botToken"], "***");
    }

    #[test]
    fn validate_on_default_fails_only_on_empty_name() {
        let m = Manifest::default();
        let issues = m.validate();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].path, "identity.name");
    }
}
