//! Step Dispatcher (C7, spec §4.7): one handler per step type, returning
//! `StepResult`. Never touches the Execution Log or Event Publisher — those
//! are the Orchestrator's responsibility.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};

use crate::condition::{self, ConditionContext};
use crate::error::{ErrorCode, ErrorRecord};
use crate::models::{StepInputsSnapshot, StepResult, StepType};
use crate::sandbox::{infer_language, SandboxBackend, SandboxContext};

/// Everything the Dispatcher needs beyond the step's own config: the
/// resolved auth headers and identifiers for building a `SandboxContext`.
pub struct DispatchContext<'a> {
    pub org_id: &'a str,
    pub user_id: &'a str,
    pub flow_id: &'a str,
    pub execution_id: &'a str,
    pub step_id: &'a str,
    pub inputs: &'a StepInputsSnapshot,
    pub auth_headers: HashMap<String, String>,
    /// Set by the Orchestrator when a cancellation has been requested for
    /// this execution; checked by long-running handlers (`sandbox_async`'s
    /// poll loop) so a cancel can take effect mid-step, not just between
    /// steps (spec §5 "Cancellation support").
    pub cancellation: Option<Arc<AtomicBool>>,
}

pub struct StepDispatcher<'a> {
    pub sandbox: &'a dyn SandboxBackend,
    pub http: &'a reqwest::Client,
}

impl<'a> StepDispatcher<'a> {
    pub fn new(sandbox: &'a dyn SandboxBackend, http: &'a reqwest::Client) -> Self {
        Self { sandbox, http }
    }

    pub async fn dispatch(&self, step_type: &StepType, ctx: &DispatchContext<'_>) -> StepResult {
        match step_type {
            StepType::SandboxSync => self.handle_sandbox_sync(ctx).await,
            StepType::SandboxAsync => self.handle_sandbox_async(ctx).await,
            StepType::CodeExecution => self.handle_code_execution(ctx).await,
            StepType::DataTransform => self.handle_data_transform(ctx).await,
            StepType::Conditional => self.handle_conditional(ctx).await,
            StepType::HttpRequest | StepType::OauthApiCall => self.handle_http_request(ctx).await,
            StepType::Delay => self.handle_delay(ctx).await,
            StepType::Unknown(raw) => StepResult::failure(ErrorRecord::new(
                ErrorCode::UnknownStepType,
                format!("unknown step type '{raw}'"),
            )),
        }
    }

    fn sandbox_context(&self, ctx: &DispatchContext<'_>) -> SandboxContext {
        SandboxContext {
            org_id: ctx.org_id.to_string(),
            user_id: ctx.user_id.to_string(),
            flow_id: ctx.flow_id.to_string(),
            step_id: ctx.step_id.to_string(),
            execution_id: ctx.execution_id.to_string(),
            variables: ctx.inputs.variables.clone(),
            step_outputs: ctx.inputs.step_outputs.clone(),
            auth_headers: if ctx.auth_headers.is_empty() {
                None
            } else {
                Some(ctx.auth_headers.clone())
            },
        }
    }

    async fn handle_sandbox_sync(&self, ctx: &DispatchContext<'_>) -> StepResult {
        let config = ctx.inputs.config.as_object().cloned().unwrap_or_default();
        let code = match config.get("code").and_then(Value::as_str) {
            Some(c) => c,
            None => return StepResult::failure(ErrorRecord::new(ErrorCode::MissingCode, "config.code is required")),
        };
        let language = config
            .get("language")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| infer_language(code).to_string());

        let sandbox_ctx = self.sandbox_context(ctx);
        match self.sandbox.run_sync(code, &language, &sandbox_ctx).await {
            Ok(result) if result.success => {
                let mut meta = StepResult::success(result.output.unwrap_or(Value::Null));
                meta.metadata.extra.insert(
                    "executionTime".to_string(),
                    json!(result.execution_time),
                );
                meta
            }
            Ok(result) => StepResult::failure(ErrorRecord::new(
                ErrorCode::SandboxSyncError,
                result.error.unwrap_or_else(|| "sandbox execution failed".to_string()),
            )),
            Err(e) => StepResult::failure(ErrorRecord::from(&e)),
        }
    }

    async fn handle_sandbox_async(&self, ctx: &DispatchContext<'_>) -> StepResult {
        let config = ctx.inputs.config.as_object().cloned().unwrap_or_default();
        let code = match config.get("code").and_then(Value::as_str) {
            Some(c) => c,
            None => return StepResult::failure(ErrorRecord::new(ErrorCode::MissingCode, "config.code is required")),
        };
        let language = config
            .get("language")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| infer_language(code).to_string());
        let wait_for_completion = config
            .get("waitForCompletion")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let poll_interval_ms = config.get("pollInterval").and_then(Value::as_u64).unwrap_or(1000);
        let max_poll_attempts = config.get("maxPollAttempts").and_then(Value::as_u64).unwrap_or(300);

        let sandbox_ctx = self.sandbox_context(ctx);
        let session_id = match self.sandbox.run_async(code, &language, &sandbox_ctx).await {
            Ok(id) => id,
            Err(e) => return StepResult::failure(ErrorRecord::from(&e)),
        };

        if !wait_for_completion {
            return StepResult::success(json!({
                "sessionId": session_id,
                "message": "sandbox execution started"
            }));
        }

        for attempt in 0..max_poll_attempts {
            if ctx.cancellation.as_deref().is_some_and(|c| c.load(Ordering::Relaxed)) {
                self.sandbox.cancel_async_execution(&session_id).await.ok();
                return StepResult::failure(ErrorRecord::new(
                    ErrorCode::Cancelled,
                    "execution cancelled while awaiting sandbox async result",
                ));
            }
            match self.sandbox.get_async_result(&session_id).await {
                Ok(result) => match result.status {
                    crate::sandbox::AsyncStatus::Completed => {
                        let run = result.result.unwrap_or(crate::sandbox::SandboxRunResult {
                            success: true,
                            output: None,
                            error: None,
                            execution_time: 0,
                        });
                        return StepResult::success(run.output.unwrap_or(Value::Null));
                    }
                    crate::sandbox::AsyncStatus::Failed => {
                        let message = result
                            .result
                            .and_then(|r| r.error)
                            .unwrap_or_else(|| "sandbox execution failed".to_string());
                        return StepResult::failure(ErrorRecord::new(ErrorCode::SandboxSyncError, message));
                    }
                    crate::sandbox::AsyncStatus::Pending | crate::sandbox::AsyncStatus::Running => {
                        if attempt + 1 < max_poll_attempts {
                            tokio::time::sleep(Duration::from_millis(poll_interval_ms)).await;
                        }
                    }
                },
                Err(e) => return StepResult::failure(ErrorRecord::from(&e)),
            }
        }

        let mut result = StepResult::failure(ErrorRecord::new(
            ErrorCode::SandboxAsyncTimeout,
            format!("sandbox async execution did not complete after {max_poll_attempts} polls"),
        ));
        result
            .metadata
            .extra
            .insert("pollAttempts".to_string(), json!(max_poll_attempts));
        result
    }

    async fn handle_code_execution(&self, ctx: &DispatchContext<'_>) -> StepResult {
        let mode = ctx
            .inputs
            .config
            .get("mode")
            .and_then(Value::as_str)
            .unwrap_or("sync");
        if mode == "async" {
            self.handle_sandbox_async(ctx).await
        } else {
            self.handle_sandbox_sync(ctx).await
        }
    }

    async fn handle_data_transform(&self, ctx: &DispatchContext<'_>) -> StepResult {
        let config = ctx.inputs.config.as_object().cloned().unwrap_or_default();
        let script = match config.get("script").and_then(Value::as_str) {
            Some(s) => s,
            None => {
                return StepResult::failure(ErrorRecord::new(
                    ErrorCode::TransformError,
                    "config.script is required",
                ))
            }
        };
        let use_sandbox = config.get("useSandbox").and_then(Value::as_bool).unwrap_or(true);

        if use_sandbox {
            let wrapped = format!(
                "const input = context.stepOutputs; const flowContext = context; {script}"
            );
            let sandbox_ctx = self.sandbox_context(ctx);
            match self.sandbox.run_sync(&wrapped, "javascript", &sandbox_ctx).await {
                Ok(result) if result.success => StepResult::success(result.output.unwrap_or(Value::Null)),
                Ok(result) => StepResult::failure(ErrorRecord::new(
                    ErrorCode::TransformError,
                    result.error.unwrap_or_else(|| "transform failed".to_string()),
                )),
                Err(_) => self.direct_transform(script, ctx),
            }
        } else {
            self.direct_transform(script, ctx)
        }
    }

    /// Fallback path when the sandbox is unavailable or not requested:
    /// evaluates `script` as a JSON-logic expression over `(input, context)`
    /// via the condition evaluator's expression engine, reusing one engine
    /// rather than writing a second (spec §4.7 design note).
    fn direct_transform(&self, script: &str, ctx: &DispatchContext<'_>) -> StepResult {
        let rule: Value = match serde_json::from_str(script) {
            Ok(v) => v,
            Err(e) => {
                return StepResult::failure(ErrorRecord::new(
                    ErrorCode::TransformError,
                    format!("failed to parse transform expression: {e}"),
                ))
            }
        };
        let cond_ctx = self.condition_context(ctx);
        match condition::eval_expression(&rule, &cond_ctx) {
            Ok(value) => StepResult::success(value),
            Err(e) => StepResult::failure(ErrorRecord::new(ErrorCode::TransformError, e.to_string())),
        }
    }

    async fn handle_conditional(&self, ctx: &DispatchContext<'_>) -> StepResult {
        let config = ctx.inputs.config.as_object().cloned().unwrap_or_default();
        let condition_expr = match config.get("condition") {
            Some(c) => c.clone(),
            None => {
                return StepResult::failure(ErrorRecord::new(
                    ErrorCode::ConditionError,
                    "config.condition is required",
                ))
            }
        };
        let use_sandbox = config.get("useSandbox").and_then(Value::as_bool).unwrap_or(true);

        if use_sandbox {
            let expr_str = condition_expr.as_str().unwrap_or_default();
            let wrapped = format!("const context = arguments[0]; return {expr_str};");
            let sandbox_ctx = self.sandbox_context(ctx);
            match self.sandbox.run_sync(&wrapped, "javascript", &sandbox_ctx).await {
                Ok(result) if result.success => {
                    StepResult::success(json!({ "conditionResult": result.output.unwrap_or(Value::Null) }))
                }
                Ok(result) => StepResult::failure(ErrorRecord::new(
                    ErrorCode::ConditionError,
                    result.error.unwrap_or_else(|| "condition evaluation failed".to_string()),
                )),
                Err(_) => self.direct_conditional(&condition_expr, ctx),
            }
        } else {
            self.direct_conditional(&condition_expr, ctx)
        }
    }

    fn direct_conditional(&self, rule: &Value, ctx: &DispatchContext<'_>) -> StepResult {
        let cond_ctx = self.condition_context(ctx);
        match condition::eval_expression(rule, &cond_ctx) {
            Ok(value) => StepResult::success(json!({ "conditionResult": value })),
            Err(e) => StepResult::failure(ErrorRecord::new(ErrorCode::ConditionError, e.to_string())),
        }
    }

    fn condition_context(&self, ctx: &DispatchContext<'_>) -> ConditionContext {
        ConditionContext {
            inputs: Value::Object(Map::new()),
            variables: ctx.inputs.variables.clone(),
            step_outputs: Value::Object(ctx.inputs.step_outputs.clone()),
            current_step: None,
            org_id: Some(ctx.org_id.to_string()),
            user_id: Some(ctx.user_id.to_string()),
            meta: crate::condition::ConditionMeta {
                flow_id: Some(ctx.flow_id.to_string()),
                execution_id: Some(ctx.execution_id.to_string()),
                step_id: Some(ctx.step_id.to_string()),
            },
        }
    }

    async fn handle_http_request(&self, ctx: &DispatchContext<'_>) -> StepResult {
        let config = ctx.inputs.config.as_object().cloned().unwrap_or_default();
        let url = match config.get("url").and_then(Value::as_str) {
            Some(u) => u,
            None => {
                return StepResult::failure(ErrorRecord::new(ErrorCode::HttpError, "config.url is required"))
            }
        };
        let method = config
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_uppercase();
        let method = match reqwest::Method::from_bytes(method.as_bytes()) {
            Ok(m) => m,
            Err(_) => reqwest::Method::GET,
        };

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        if let Some(Value::Object(custom_headers)) = config.get("headers") {
            for (k, v) in custom_headers {
                if let (Ok(name), Some(value)) = (
                    reqwest::header::HeaderName::from_bytes(k.as_bytes()),
                    v.as_str().and_then(|s| reqwest::header::HeaderValue::from_str(s).ok()),
                ) {
                    headers.insert(name, value);
                }
            }
        }
        for (k, v) in &ctx.auth_headers {
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(k.as_bytes()),
                reqwest::header::HeaderValue::from_str(v),
            ) {
                headers.insert(name, value);
            }
        }

        let mut builder = self.http.request(method, url).headers(headers);
        if let Some(body) = config.get("body") {
            builder = builder.json(body);
        }

        let resp = match builder.send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() || e.is_connect() => {
                return StepResult::failure(ErrorRecord::new(ErrorCode::NetworkError, e.to_string()))
            }
            Err(e) => return StepResult::failure(ErrorRecord::new(ErrorCode::NetworkError, e.to_string())),
        };

        let status = resp.status();
        let response_headers: Map<String, Value> = resp
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), json!(v.to_str().unwrap_or(""))))
            .collect();
        let text = resp.text().await.unwrap_or_default();
        let data = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text.clone()));

        let output = json!({
            "status": status.as_u16(),
            "statusText": status.canonical_reason().unwrap_or(""),
            "data": data,
            "headers": response_headers,
        });

        if status.is_success() {
            StepResult::success(output)
        } else {
            let mut result = StepResult::failure(ErrorRecord::new(
                ErrorCode::HttpError,
                format!("HTTP {}: {}", status.as_u16(), text),
            ));
            result.output = Some(output);
            result
        }
    }

    async fn handle_delay(&self, ctx: &DispatchContext<'_>) -> StepResult {
        let delay_ms = ctx
            .inputs
            .config
            .get("delayMs")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        StepResult::success(json!({ "delayedFor": delay_ms }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EngineError, Result};
    use crate::sandbox::{AsyncResult, AsyncStatus, SandboxRunResult};

    struct UnavailableSandbox;

    #[async_trait::async_trait]
    impl SandboxBackend for UnavailableSandbox {
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

    fn snapshot(config: Value) -> StepInputsSnapshot {
        StepInputsSnapshot {
            step_name: "Step".to_string(),
            step_type: "data_transform".to_string(),
            config,
            execute_if: None,
            variables: json!({}),
            step_outputs: Map::new(),
        }
    }

    #[tokio::test]
    async fn missing_code_on_sandbox_sync_is_missing_code_error() {
        let backend = UnavailableSandbox;
        let http = reqwest::Client::new();
        let dispatcher = StepDispatcher::new(&backend, &http);
        let inputs = snapshot(json!({}));
        let ctx = DispatchContext {
            org_id: "org1",
            user_id: "user1",
            flow_id: "flow1",
            execution_id: "exec1",
            step_id: "step1",
            inputs: &inputs,
            auth_headers: HashMap::new(),
            cancellation: None,
        };
        let result = dispatcher.dispatch(&StepType::SandboxSync, &ctx).await;
        assert!(!result.success);
        assert_eq!(result.error.unwrap().code, "MISSING_CODE");
    }

    #[tokio::test]
    async fn data_transform_falls_back_to_direct_evaluation_when_sandbox_unavailable() {
        let backend = UnavailableSandbox;
        let http = reqwest::Client::new();
        let dispatcher = StepDispatcher::new(&backend, &http);
        let inputs = snapshot(json!({"script": "{\"+\": [1, 2]}", "useSandbox": true}));
        let ctx = DispatchContext {
            org_id: "org1",
            user_id: "user1",
            flow_id: "flow1",
            execution_id: "exec1",
            step_id: "step1",
            inputs: &inputs,
            auth_headers: HashMap::new(),
            cancellation: None,
        };
        let result = dispatcher.dispatch(&StepType::DataTransform, &ctx).await;
        assert!(result.success);
        assert_eq!(result.output, Some(json!(3.0)));
    }

    #[tokio::test]
    async fn delay_sleeps_and_reports_elapsed() {
        let backend = UnavailableSandbox;
        let http = reqwest::Client::new();
        let dispatcher = StepDispatcher::new(&backend, &http);
        let inputs = snapshot(json!({"delayMs": 5}));
        let ctx = DispatchContext {
            org_id: "org1",
            user_id: "user1",
            flow_id: "flow1",
            execution_id: "exec1",
            step_id: "step1",
            inputs: &inputs,
            auth_headers: HashMap::new(),
            cancellation: None,
        };
        let result = dispatcher.dispatch(&StepType::Delay, &ctx).await;
        assert!(result.success);
    }

    struct AlwaysRunningSandbox {
        cancel_calls: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait::async_trait]
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
            self.cancel_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn sandbox_async_notices_cancellation_mid_poll() {
        let cancel_calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let backend = AlwaysRunningSandbox {
            cancel_calls: cancel_calls.clone(),
        };
        let http = reqwest::Client::new();
        let dispatcher = StepDispatcher::new(&backend, &http);
        let inputs = snapshot(json!({
            "code": "print(1)",
            "waitForCompletion": true,
            "pollInterval": 1,
            "maxPollAttempts": 1000
        }));
        let cancellation = Arc::new(AtomicBool::new(true));
        let ctx = DispatchContext {
            org_id: "org1",
            user_id: "user1",
            flow_id: "flow1",
            execution_id: "exec1",
            step_id: "step1",
            inputs: &inputs,
            auth_headers: HashMap::new(),
            cancellation: Some(cancellation),
        };
        let result = dispatcher.dispatch(&StepType::SandboxAsync, &ctx).await;
        assert!(!result.success);
        assert_eq!(result.error.unwrap().code, "CANCELLED");
        assert_eq!(cancel_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_step_type_reports_unknown_step_type() {
        let backend = UnavailableSandbox;
        let http = reqwest::Client::new();
        let dispatcher = StepDispatcher::new(&backend, &http);
        let inputs = snapshot(json!({}));
        let ctx = DispatchContext {
            org_id: "org1",
            user_id: "user1",
            flow_id: "flow1",
            execution_id: "exec1",
            step_id: "step1",
            inputs: &inputs,
            auth_headers: HashMap::new(),
            cancellation: None,
        };
        let result = dispatcher
            .dispatch(&StepType::Unknown("made_up".to_string()), &ctx)
            .await;
        assert!(!result.success);
        assert_eq!(result.error.unwrap().code, "UNKNOWN_STEP_TYPE");
    }
}
