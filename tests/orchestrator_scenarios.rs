//! End-to-end scenarios driving `Orchestrator::run_flow` against in-memory
//! fakes for every external collaborator (`FlowExecutionStore`,
//! `ExecutionLogRecorder`, `AuthConfigStore`, `CredentialStore`,
//! `SandboxBackend`, `PubSubGateway`), plus a `wiremock` server standing in
//! for the outbound HTTP target on the auth-header scenario. No Postgres or
//! Redis instance is required.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use flowforge_core::auth::{AuthConfig, AuthConfigStore};
use flowforge_core::config::GlobalThrottleDefaults;
use flowforge_core::credentials::{CredentialResolver, CredentialStore};
use flowforge_core::durable::InProcessDurableRuntime;
use flowforge_core::error::{EngineError, ErrorRecord, Result};
use flowforge_core::execution_log::ExecutionLogRecorder;
use flowforge_core::models::{
    BackoffKind, BackoffPolicy, ExecutionStatus, FlowExecuteEvent, FlowExecution, FlowStep,
    RetryPolicy, StepType, ToolCredentials,
};
use flowforge_core::orchestrator::{FlowExecutionStore, Orchestrator};
use flowforge_core::publisher::{EventPublisher, PubSubGateway};
use flowforge_core::sandbox::{AsyncResult, AsyncStatus, SandboxBackend, SandboxContext, SandboxRunResult};

#[derive(Default)]
struct InMemoryExecutionStore {
    rows: Mutex<HashMap<String, (FlowExecution, Vec<FlowStep>, bool)>>,
}

#[async_trait]
impl FlowExecutionStore for InMemoryExecutionStore {
    async fn create(&self, execution: &FlowExecution, steps: &[FlowStep]) -> Result<()> {
        self.rows
            .lock()
            .unwrap()
            .insert(execution.id.clone(), (execution.clone(), steps.to_vec(), false));
        Ok(())
    }

    async fn mark_running(&self, execution_id: &str) -> Result<()> {
        if let Some(row) = self.rows.lock().unwrap().get_mut(execution_id) {
            row.0.status = ExecutionStatus::Running;
        }
        Ok(())
    }

    async fn finalize(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        step_outputs: &Map<String, Value>,
        error: Option<&ErrorRecord>,
    ) -> Result<()> {
        if let Some(row) = self.rows.lock().unwrap().get_mut(execution_id) {
            row.0.status = status;
            row.0.step_outputs = step_outputs.clone();
            row.0.error = error.cloned();
        }
        Ok(())
    }

    async fn list_running(&self) -> Result<Vec<(FlowExecution, Vec<FlowStep>)>> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|(e, _, _)| e.status == ExecutionStatus::Running)
            .map(|(e, s, _)| (e.clone(), s.clone()))
            .collect())
    }

    async fn request_cancellation(&self, execution_id: &str) -> Result<()> {
        if let Some(row) = self.rows.lock().unwrap().get_mut(execution_id) {
            row.2 = true;
        }
        Ok(())
    }

    async fn is_cancellation_requested(&self, execution_id: &str) -> Result<bool> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .get(execution_id)
            .map(|(_, _, c)| *c)
            .unwrap_or(false))
    }
}

#[derive(Default)]
struct InMemoryLogStore {
    next_id: Mutex<u64>,
}

#[async_trait]
impl ExecutionLogRecorder for InMemoryLogStore {
    async fn mark_step_started(
        &self,
        _org: &str,
        _user: &str,
        _flow: &str,
        _execution: &str,
        _step_key: &str,
        _inputs_snapshot: Value,
    ) -> Result<String> {
        let mut n = self.next_id.lock().unwrap();
        *n += 1;
        Ok(format!("log-{n}"))
    }

    async fn mark_step_completed(&self, _id: &str, _outputs: Value) -> Result<()> {
        Ok(())
    }

    async fn mark_step_failed(&self, _id: &str, _error: Value) -> Result<()> {
        Ok(())
    }

    async fn mark_step_skipped(&self, _id: &str, _reason: Option<String>) -> Result<()> {
        Ok(())
    }
}

struct NoAuthConfigs;

#[async_trait]
impl AuthConfigStore for NoAuthConfigs {
    async fn get(&self, _org: &str, _tool: &str) -> Option<AuthConfig> {
        None
    }
}

struct GithubApiKeyConfigs;

#[async_trait]
impl AuthConfigStore for GithubApiKeyConfigs {
    async fn get(&self, _org: &str, tool: &str) -> Option<AuthConfig> {
        if tool == "github" {
            Some(AuthConfig::ApiKey {
                api_key: "secret-key".to_string(),
                header_name: None,
                header_value: None,
            })
        } else {
            None
        }
    }
}

struct EmptyCredentialStore;

#[async_trait]
impl CredentialStore for EmptyCredentialStore {
    async fn get(&self, _tool: &str, _org: &str) -> Result<Option<ToolCredentials>> {
        Ok(None)
    }
    async fn upsert(&self, _tool: &str, _org: &str, _creds: &ToolCredentials) -> Result<()> {
        Ok(())
    }
    async fn delete(&self, _tool: &str, _org: &str) -> Result<()> {
        Ok(())
    }
}

/// Never reachable in these scenarios (no `sandbox_*` step is dispatched
/// except in the timeout scenario, which supplies its own backend).
struct UnusedSandbox;

#[async_trait]
impl SandboxBackend for UnusedSandbox {
    async fn run_sync(&self, _code: &str, _language: &str, _ctx: &SandboxContext) -> Result<SandboxRunResult> {
        Err(EngineError::SandboxUnavailable)
    }
    async fn run_async(&self, _code: &str, _language: &str, _ctx: &SandboxContext) -> Result<String> {
        Err(EngineError::SandboxUnavailable)
    }
    async fn get_async_result(&self, _session_id: &str) -> Result<AsyncResult> {
        Err(EngineError::SandboxUnavailable)
    }
    async fn cancel_async_execution(&self, _session_id: &str) -> Result<()> {
        Ok(())
    }
}

/// Always reports `running`, so `sandbox_async` with a small
/// `maxPollAttempts` exhausts its budget and reports a timeout.
struct AlwaysRunningSandbox;

#[async_trait]
impl SandboxBackend for AlwaysRunningSandbox {
    async fn run_sync(&self, _code: &str, _language: &str, _ctx: &SandboxContext) -> Result<SandboxRunResult> {
        Err(EngineError::SandboxUnavailable)
    }
    async fn run_async(&self, _code: &str, _language: &str, _ctx: &SandboxContext) -> Result<String> {
        Ok("session-1".to_string())
    }
    async fn get_async_result(&self, _session_id: &str) -> Result<AsyncResult> {
        Ok(AsyncResult {
            session_id: "session-1".to_string(),
            status: AsyncStatus::Running,
            result: None,
        })
    }
    async fn cancel_async_execution(&self, _session_id: &str) -> Result<()> {
        Ok(())
    }
}

/// Captures every published `(channel, payload)` pair so assertions can
/// inspect the event stream instead of just the final `FlowExecution`.
#[derive(Default, Clone)]
struct RecordingGateway {
    published: Arc<Mutex<Vec<(String, String)>>>,
}

#[async_trait]
impl PubSubGateway for RecordingGateway {
    async fn publish(&self, channel: &str, payload: String) -> bool {
        self.published.lock().unwrap().push((channel.to_string(), payload));
        true
    }
}

impl RecordingGateway {
    fn events(&self) -> Vec<Value> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(_, payload)| serde_json::from_str(payload).ok())
            .collect()
    }
}

fn flow_step(id: &str, step_type: StepType, config: Value) -> FlowStep {
    FlowStep {
        id: id.to_string(),
        step_type,
        name: id.to_string(),
        config,
        execute_if: None,
        critical: None,
        depends_on: None,
    }
}

fn build_orchestrator(
    auth_configs: Box<dyn AuthConfigStore>,
    sandbox: Box<dyn SandboxBackend>,
    gateway: RecordingGateway,
) -> Orchestrator<InProcessDurableRuntime> {
    let executions: Arc<dyn FlowExecutionStore> = Arc::new(InMemoryExecutionStore::default());
    let execution_log: Box<dyn ExecutionLogRecorder> = Box::new(InMemoryLogStore::default());
    let publisher = EventPublisher::new(Box::new(gateway));
    let credentials = CredentialResolver::new(
        Box::new(EmptyCredentialStore),
        Duration::from_secs(600),
        HashMap::new(),
        RetryPolicy {
            max_attempts: 1,
            backoff: BackoffPolicy {
                kind: BackoffKind::Fixed,
                delay: Duration::from_millis(1),
            },
        },
    );
    Orchestrator::new(
        executions,
        execution_log,
        publisher,
        credentials,
        auth_configs,
        sandbox,
        InProcessDurableRuntime::new(),
        10,
        GlobalThrottleDefaults::default(),
    )
}

fn event(execution_id: &str, variables: Value, steps: Vec<FlowStep>) -> FlowExecuteEvent {
    FlowExecuteEvent {
        org_id: "org1".to_string(),
        user_id: "user1".to_string(),
        flow_id: "flow1".to_string(),
        execution_id: execution_id.to_string(),
        variables,
        steps,
    }
}

#[tokio::test]
async fn happy_path_delay_completes_and_publishes_lifecycle_events() {
    let gateway = RecordingGateway::default();
    let orchestrator = build_orchestrator(Box::new(NoAuthConfigs), Box::new(UnusedSandbox), gateway.clone());

    let steps = vec![flow_step("s1", StepType::Delay, json!({ "delayMs": 10 }))];
    let execution = orchestrator
        .run_flow(event("exec-happy", json!({}), steps))
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    let s1_output = execution.step_outputs.get("s1").unwrap();
    assert_eq!(s1_output.get("delayedFor").unwrap().as_u64().unwrap(), 10);

    let events = gateway.events();
    let statuses: Vec<&str> = events
        .iter()
        .map(|e| e.get("status").and_then(Value::as_str).unwrap())
        .collect();
    assert!(statuses.contains(&"started"));
    assert!(statuses.contains(&"completed"));
    let execution_completed = events
        .iter()
        .find(|e| e.get("status") == Some(&json!("completed")) && e.get("totalSteps").is_some())
        .unwrap();
    assert_eq!(execution_completed["completedSteps"], json!(1));
}

#[tokio::test]
async fn guard_false_skips_the_step_and_still_completes() {
    let gateway = RecordingGateway::default();
    let orchestrator = build_orchestrator(Box::new(NoAuthConfigs), Box::new(UnusedSandbox), gateway.clone());

    let mut step = flow_step("s1", StepType::Delay, json!({ "delayMs": 10 }));
    step.execute_if = Some(json!({ "==": [{ "var": "variables.skip" }, true] }));
    let execution = orchestrator
        .run_flow(event("exec-guard", json!({ "skip": true }), vec![step]))
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert!(!execution.step_outputs.contains_key("s1"));

    let skipped_event = gateway
        .events()
        .into_iter()
        .find(|e| e.get("stepId") == Some(&json!("s1")))
        .expect("a step event for s1 was published");
    assert_eq!(skipped_event["status"], json!("skipped"));
    assert_eq!(
        skipped_event["skipReason"],
        json!("executeIf condition evaluated to false")
    );
}

#[tokio::test]
async fn critical_step_failure_halts_the_flow_before_later_steps() {
    let gateway = RecordingGateway::default();
    let orchestrator = build_orchestrator(Box::new(NoAuthConfigs), Box::new(UnusedSandbox), gateway.clone());

    let a = flow_step("a", StepType::parse("unknown_x"), json!({}));
    let b = flow_step("b", StepType::Delay, json!({ "delayMs": 5 }));
    let execution = orchestrator
        .run_flow(event("exec-critical", json!({}), vec![a, b]))
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error.unwrap().code, "UNKNOWN_STEP_TYPE");
    assert!(!execution.step_outputs.contains_key("b"));

    let step_ids: Vec<String> = gateway
        .events()
        .iter()
        .filter_map(|e| e.get("stepId").and_then(Value::as_str).map(str::to_string))
        .collect();
    assert!(step_ids.iter().any(|id| id == "a"));
    assert!(!step_ids.iter().any(|id| id == "b"));
}

#[tokio::test]
async fn non_critical_step_failure_continues_to_later_steps() {
    let gateway = RecordingGateway::default();
    let orchestrator = build_orchestrator(Box::new(NoAuthConfigs), Box::new(UnusedSandbox), gateway.clone());

    let mut a = flow_step("a", StepType::parse("unknown_x"), json!({}));
    a.critical = Some(false);
    let b = flow_step("b", StepType::Delay, json!({ "delayMs": 5 }));
    let execution = orchestrator
        .run_flow(event("exec-noncritical", json!({}), vec![a, b]))
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert!(execution.step_outputs.contains_key("b"));

    let execution_completed = gateway
        .events()
        .into_iter()
        .find(|e| e.get("totalSteps").is_some())
        .unwrap();
    assert_eq!(execution_completed["failedSteps"], json!(1));
    assert_eq!(execution_completed["completedSteps"], json!(1));
}

#[tokio::test]
async fn http_request_with_api_key_auth_injects_bearer_header() {
    let server = wiremock::MockServer::start().await;
    wiremock::Mock::given(wiremock::matchers::method("GET"))
        .and(wiremock::matchers::path("/repos"))
        .and(wiremock::matchers::header("Authorization", "Bearer secret-key"))
        .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
        .mount(&server)
        .await;

    let gateway = RecordingGateway::default();
    let orchestrator = build_orchestrator(
        Box::new(GithubApiKeyConfigs),
        Box::new(UnusedSandbox),
        gateway.clone(),
    );

    let step = flow_step(
        "s1",
        StepType::HttpRequest,
        json!({ "url": format!("{}/repos", server.uri()), "toolName": "github" }),
    );
    let execution = orchestrator
        .run_flow(event("exec-auth", json!({}), vec![step]))
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Completed);
    let output = execution.step_outputs.get("s1").unwrap();
    assert_eq!(output["status"], json!(200));
}

#[tokio::test]
async fn sandbox_async_exhausting_poll_budget_reports_timeout() {
    let gateway = RecordingGateway::default();
    let orchestrator = build_orchestrator(
        Box::new(NoAuthConfigs),
        Box::new(AlwaysRunningSandbox),
        gateway.clone(),
    );

    let step = flow_step(
        "s1",
        StepType::SandboxAsync,
        json!({
            "code": "print('hi')",
            "waitForCompletion": true,
            "pollInterval": 1,
            "maxPollAttempts": 3
        }),
    );
    let execution = orchestrator
        .run_flow(event("exec-timeout", json!({}), vec![step]))
        .await
        .unwrap();

    assert_eq!(execution.status, ExecutionStatus::Failed);
    let error = execution.error.unwrap();
    assert_eq!(error.code, "SANDBOX_ASYNC_TIMEOUT");

    let step_failed = gateway
        .events()
        .into_iter()
        .find(|e| e.get("stepId") == Some(&json!("s1")))
        .expect("a step event for s1 was published");
    assert_eq!(step_failed["metadata"]["pollAttempts"], json!(3));
}
