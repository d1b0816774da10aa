//! Event payloads published by the Event Publisher (spec §4.4, §6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ErrorRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepEventStatus {
    Started,
    Completed,
    Failed,
    Skipped,
}

/// Step lifecycle event (spec §4.4). Carried on the per-execution channel
/// `flows.{org}.{executionId}` with wire event name `step-status` (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepEvent {
    #[serde(rename = "stepId")]
    pub step_id: String,
    pub status: StepEventStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "executionId")]
    pub execution_id: String,
    #[serde(rename = "orgId")]
    pub org_id: String,
    #[serde(rename = "flowId")]
    pub flow_id: String,
    #[serde(rename = "stepName", skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u128>,
    #[serde(rename = "skipReason", skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(rename = "executeIf", skip_serializing_if = "Option::is_none")]
    pub execute_if: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionEventStatus {
    Started,
    Completed,
    Failed,
    Cancelled,
}

/// Execution lifecycle event (spec §4.4), wire event name `execution-status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    #[serde(rename = "executionId")]
    pub execution_id: String,
    pub status: ExecutionEventStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "orgId")]
    pub org_id: String,
    #[serde(rename = "flowId")]
    pub flow_id: String,
    #[serde(rename = "totalSteps", skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<usize>,
    #[serde(rename = "completedSteps", skip_serializing_if = "Option::is_none")]
    pub completed_steps: Option<usize>,
    #[serde(rename = "failedSteps", skip_serializing_if = "Option::is_none")]
    pub failed_steps: Option<usize>,
    #[serde(rename = "skippedSteps", skip_serializing_if = "Option::is_none")]
    pub skipped_steps: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u128>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
}

/// Fire-and-forget webhook-dispatch event (spec §6), queue output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDispatchEvent {
    pub name: String,
    pub data: WebhookDispatchData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDispatchData {
    #[serde(rename = "orgId")]
    pub org_id: String,
    #[serde(rename = "eventType")]
    pub event_type: String,
    pub payload: Value,
}

impl WebhookDispatchEvent {
    pub fn new(org_id: impl Into<String>, event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            name: "webhook.dispatch".to_string(),
            data: WebhookDispatchData {
                org_id: org_id.into(),
                event_type: event_type.into(),
                payload,
            },
        }
    }
}
