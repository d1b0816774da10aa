//! Core data model (spec §3): `FlowExecution`, `FlowStep`, `StepInvocation`,
//! `ToolCredentials`, `ThrottlingPolicy`, `StepResult`.
//!
//! Grounded on the teacher's `models/db.rs` row-struct style
//! (`#[derive(FromRow, Serialize, Deserialize)]`, explicit field renames),
//! adapted from Prisma-shaped WhatsApp-bot rows to the flow-execution domain.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::ErrorRecord;

/// Closed set of step types (spec §4.7). Unrecognized wire values deserialize
/// into `Unknown`, carrying the original string, so the Dispatcher can route
/// them to `UNKNOWN_STEP_TYPE` rather than fail to parse the flow at all
/// (design note §9: "Dynamic dispatch on step type -> closed tagged variant +
/// handler table").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StepType {
    SandboxSync,
    SandboxAsync,
    CodeExecution,
    DataTransform,
    Conditional,
    HttpRequest,
    OauthApiCall,
    Delay,
    Unknown(String),
}

impl StepType {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "sandbox_sync" => StepType::SandboxSync,
            "sandbox_async" => StepType::SandboxAsync,
            "code_execution" => StepType::CodeExecution,
            "data_transform" => StepType::DataTransform,
            "conditional" => StepType::Conditional,
            "http_request" => StepType::HttpRequest,
            "oauth_api_call" => StepType::OauthApiCall,
            "delay" => StepType::Delay,
            other => StepType::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            StepType::SandboxSync => "sandbox_sync",
            StepType::SandboxAsync => "sandbox_async",
            StepType::CodeExecution => "code_execution",
            StepType::DataTransform => "data_transform",
            StepType::Conditional => "conditional",
            StepType::HttpRequest => "http_request",
            StepType::OauthApiCall => "oauth_api_call",
            StepType::Delay => "delay",
            StepType::Unknown(raw) => raw.as_str(),
        }
    }

    /// Types that receive auth headers (spec §4.6 rule 1).
    pub fn receives_auth_headers(&self) -> bool {
        matches!(self, StepType::HttpRequest | StepType::OauthApiCall)
    }
}

impl Serialize for StepType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for StepType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(StepType::parse(&raw))
    }
}

/// A step declaration within a flow (spec §3 `FlowStep`). Immutable once the
/// flow is accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowStep {
    pub id: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub name: String,
    #[serde(default)]
    pub config: Value,
    #[serde(rename = "executeIf", default, skip_serializing_if = "Option::is_none")]
    pub execute_if: Option<Value>,
    #[serde(default)]
    pub critical: Option<bool>,
    #[serde(rename = "dependsOn", default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Vec<String>>,
}

impl FlowStep {
    /// Open Question (spec §9) resolved: `critical` is "true unless literal
    /// false" — see DESIGN.md.
    pub fn is_critical(&self) -> bool {
        !matches!(self.critical, Some(false))
    }

    pub fn config_object(&self) -> &Map<String, Value> {
        static EMPTY: once_cell::sync::Lazy<Map<String, Value>> =
            once_cell::sync::Lazy::new(Map::new);
        self.config.as_object().unwrap_or(&EMPTY)
    }
}

/// Overall `FlowExecution` status (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Queued => "queued",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

/// One concrete run of a flow (spec §3 `FlowExecution`). Created on accepting
/// a flow-execute event; mutated only by the Orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowExecution {
    pub id: String,
    pub org_id: String,
    pub flow_id: String,
    pub user_id: String,
    pub variables: Value,
    pub step_outputs: Map<String, Value>,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<ErrorRecord>,
}

impl FlowExecution {
    pub fn new(org_id: String, flow_id: String, user_id: String, variables: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            org_id,
            flow_id,
            user_id,
            variables,
            step_outputs: Map::new(),
            status: ExecutionStatus::Queued,
            started_at: Utc::now(),
            ended_at: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

/// Runtime status of one `StepInvocation` (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepInvocationStatus {
    Started,
    Completed,
    Failed,
    Skipped,
}

/// One row in the Execution Log (spec §3 `StepInvocation`, §4.3). One-to-one
/// with an Execution Log row; created at step start, updated exactly once at
/// terminal transition.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StepInvocation {
    pub id: String,
    #[sqlx(rename = "org_id")]
    pub org_id: String,
    #[sqlx(rename = "user_id")]
    pub user_id: String,
    #[sqlx(rename = "flow_id")]
    pub flow_id: String,
    #[sqlx(rename = "execution_id")]
    pub execution_id: String,
    #[sqlx(rename = "step_id")]
    pub step_id: String,
    pub attempt: i32,
    pub status: String,
    #[sqlx(rename = "inputs_snapshot")]
    pub inputs_snapshot: Value,
    pub outputs: Option<Value>,
    pub error: Option<Value>,
    #[sqlx(rename = "created_at")]
    pub created_at: DateTime<Utc>,
    #[sqlx(rename = "updated_at")]
    pub updated_at: DateTime<Utc>,
}

/// Snapshot handed to the Dispatcher at step start (spec §3: "the Dispatcher
/// receives an immutable snapshot").
#[derive(Debug, Clone, Serialize)]
pub struct StepInputsSnapshot {
    pub step_name: String,
    pub step_type: String,
    pub config: Value,
    #[serde(rename = "executeIf", skip_serializing_if = "Option::is_none")]
    pub execute_if: Option<Value>,
    pub variables: Value,
    pub step_outputs: Map<String, Value>,
}

/// Opaque per-(org,tool) credential envelope (spec §3 `ToolCredentials`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCredentials {
    #[serde(rename = "accessToken", skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(rename = "refreshToken", skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Epoch ms; 0 means "never expires".
    #[serde(rename = "expiresAt", default)]
    pub expires_at: i64,
    #[serde(rename = "apiKey", skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(rename = "clientId", skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(rename = "clientSecret", skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(rename = "tokenEndpoint", skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<String>,
    #[serde(rename = "headerName", skip_serializing_if = "Option::is_none")]
    pub header_name: Option<String>,
    #[serde(rename = "headerValue", skip_serializing_if = "Option::is_none")]
    pub header_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(rename = "tokenType")]
    pub token_type: Option<String>,
    #[serde(rename = "lastUpdated", skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ToolCredentials {
    pub fn token_type_or_default(&self) -> &str {
        self.token_type.as_deref().unwrap_or("Bearer")
    }
}

/// OAuth-only view returned by `getOAuthTokens` (spec §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthTokens {
    #[serde(rename = "accessToken")]
    pub access_token: String,
    #[serde(rename = "refreshToken", skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(rename = "expiresAt")]
    pub expires_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(rename = "tokenType")]
    pub token_type: String,
}

#[derive(Debug, Clone, Copy)]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub kind: BackoffKind,
    pub delay: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub max: u32,
    pub per: Duration,
}

/// Pure value describing concurrency/rate-limit/retry for a step type (spec
/// §3, §4.8).
#[derive(Debug, Clone, Copy, Default)]
pub struct ThrottlingPolicy {
    pub concurrency: Option<u32>,
    pub rate_limit: Option<RateLimit>,
    pub retry: Option<RetryPolicy>,
}

/// Extra metadata attached to a `StepResult` (spec §3: `metadata: {duration,
/// ...}`). `duration` is always filled in by the Orchestrator, never the
/// handler (spec §4.7).
#[derive(Debug, Clone, Default, Serialize)]
pub struct StepMetadata {
    pub duration_ms: u128,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Result of dispatching one step (spec §3 `StepResult`), produced by the
/// Dispatcher and consumed by the Orchestrator.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub success: bool,
    pub skipped: bool,
    pub skip_reason: Option<String>,
    pub output: Option<Value>,
    pub error: Option<ErrorRecord>,
    pub metadata: StepMetadata,
}

impl StepResult {
    pub fn success(output: Value) -> Self {
        Self {
            success: true,
            skipped: false,
            skip_reason: None,
            output: Some(output),
            error: None,
            metadata: StepMetadata::default(),
        }
    }

    pub fn failure(error: ErrorRecord) -> Self {
        Self {
            success: false,
            skipped: false,
            skip_reason: None,
            output: None,
            error: Some(error),
            metadata: StepMetadata::default(),
        }
    }

    pub fn skipped(reason: Option<String>) -> Self {
        Self {
            success: true,
            skipped: true,
            skip_reason: reason,
            output: None,
            error: None,
            metadata: StepMetadata::default(),
        }
    }
}

/// Input to a single flow-execute run (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowExecuteEvent {
    #[serde(rename = "orgId")]
    pub org_id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "flowId")]
    pub flow_id: String,
    #[serde(rename = "executionId")]
    pub execution_id: String,
    #[serde(default)]
    pub variables: Value,
    pub steps: Vec<FlowStep>,
}

pub type StepOutputs = HashMap<String, Value>;
