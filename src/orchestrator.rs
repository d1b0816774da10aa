//! Flow Orchestrator (C9, spec §4.9): the top-level driver. Runs each
//! `FlowExecution` as a sequence of named, memoized sub-units hosted by a
//! [`DurableRuntime`], wiring together every other component.
//!
//! Grounded on the teacher's `flow_engine::execute_and_advance`/
//! `schedule_step` loop shape (fetch execution, run one step, always
//! advance) and `recover_running_executions` startup-recovery pattern.
//! Concurrency/rate limiting uses `tokio::sync::Semaphore` (execution-level
//! ceiling) plus `governor::RateLimiter` (per-step-type throttling), mirroring
//! the `governor::RateLimiter::direct` usage grounded on `pollux`'s OAuth
//! refresh job.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use governor::{Quota, RateLimiter};
use serde_json::{Map, Value};
use sqlx::PgPool;
use tokio::sync::Semaphore;

use crate::auth::{AuthConfigStore, AuthHeaderBuilder};
use crate::condition::{self, ConditionContext, ConditionMeta};
use crate::config::GlobalThrottleDefaults;
use crate::credentials::CredentialResolver;
use crate::dispatcher::{DispatchContext, StepDispatcher};
use crate::durable::DurableRuntime;
use crate::error::{EngineError, ErrorRecord, Result};
use crate::execution_log::ExecutionLogRecorder;
use crate::metrics as engine_metrics;
use crate::models::{
    ExecutionEvent, ExecutionEventStatus, ExecutionStatus, FlowExecuteEvent, FlowExecution,
    FlowStep, RateLimit, StepEvent, StepEventStatus, StepInputsSnapshot, StepResult, StepType,
};
use crate::publisher::EventPublisher;
use crate::retry;
use crate::sandbox::SandboxBackend;
use crate::throttle;

/// Persists `FlowExecution` rows, external collaborator. Grounded on the
/// teacher's transaction-scoped execution-row updates in
/// `flow_engine::process_incoming_message`/`execute_and_advance`.
#[async_trait]
pub trait FlowExecutionStore: Send + Sync {
    /// Persists the execution row along with the step definitions it was
    /// started with, so a crash-restart can resume it without depending on
    /// an external flow-definition store (spec §9 "survive worker crashes
    /// mid-flow" made concrete entirely within this crate's own SQL).
    async fn create(&self, execution: &FlowExecution, steps: &[FlowStep]) -> Result<()>;
    async fn mark_running(&self, execution_id: &str) -> Result<()>;
    async fn finalize(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        step_outputs: &Map<String, Value>,
        error: Option<&ErrorRecord>,
    ) -> Result<()>;
    /// Used at startup to resume executions left `running` by a crashed
    /// process (spec §9 supplemented feature, grounded on the teacher's
    /// `recover_running_executions`).
    async fn list_running(&self) -> Result<Vec<(FlowExecution, Vec<FlowStep>)>>;
    /// Records a cancellation request against a running execution (spec §5
    /// "Cancellation support").
    async fn request_cancellation(&self, execution_id: &str) -> Result<()>;
    async fn is_cancellation_requested(&self, execution_id: &str) -> Result<bool>;
}

pub struct PgFlowExecutionStore {
    pool: PgPool,
}

impl PgFlowExecutionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FlowExecutionStore for PgFlowExecutionStore {
    async fn create(&self, execution: &FlowExecution, steps: &[FlowStep]) -> Result<()> {
        let steps_value = serde_json::to_value(steps).unwrap_or(Value::Array(Vec::new()));
        sqlx::query(
            "INSERT INTO executions
                (id, org_id, flow_id, user_id, variables, step_outputs, status, started_at, steps)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&execution.id)
        .bind(&execution.org_id)
        .bind(&execution.flow_id)
        .bind(&execution.user_id)
        .bind(&execution.variables)
        .bind(Value::Object(execution.step_outputs.clone()))
        .bind(execution.status.as_str())
        .bind(execution.started_at)
        .bind(steps_value)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::Unknown(e.to_string()))?;
        Ok(())
    }

    async fn mark_running(&self, execution_id: &str) -> Result<()> {
        sqlx::query("UPDATE executions SET status = 'running' WHERE id = $1")
            .bind(execution_id)
            .execute(&self.pool)
            .await
            .map_err(|e| EngineError::Unknown(e.to_string()))?;
        Ok(())
    }

    async fn finalize(
        &self,
        execution_id: &str,
        status: ExecutionStatus,
        step_outputs: &Map<String, Value>,
        error: Option<&ErrorRecord>,
    ) -> Result<()> {
        let error_value = error.map(|e| serde_json::to_value(e).unwrap_or(Value::Null));
        sqlx::query(
            "UPDATE executions
                SET status = $2, step_outputs = $3, error = $4, ended_at = NOW()
              WHERE id = $1",
        )
        .bind(execution_id)
        .bind(status.as_str())
        .bind(Value::Object(step_outputs.clone()))
        .bind(error_value)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::Unknown(e.to_string()))?;
        Ok(())
    }

    async fn list_running(&self) -> Result<Vec<(FlowExecution, Vec<FlowStep>)>> {
        let rows: Vec<(String, String, String, String, Value, Value, Value)> = sqlx::query_as(
            "SELECT id, org_id, flow_id, user_id, variables, step_outputs, steps
               FROM executions WHERE status = 'running'",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EngineError::Unknown(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(
                |(id, org_id, flow_id, user_id, variables, step_outputs, steps)| {
                    let steps: Vec<FlowStep> = serde_json::from_value(steps).unwrap_or_default();
                    let execution = FlowExecution {
                        id,
                        org_id,
                        flow_id,
                        user_id,
                        variables,
                        step_outputs: step_outputs.as_object().cloned().unwrap_or_default(),
                        status: ExecutionStatus::Running,
                        started_at: chrono::Utc::now(),
                        ended_at: None,
                        error: None,
                    };
                    (execution, steps)
                },
            )
            .collect())
    }

    async fn request_cancellation(&self, execution_id: &str) -> Result<()> {
        sqlx::query("UPDATE executions SET cancel_requested = true WHERE id = $1")
            .bind(execution_id)
            .execute(&self.pool)
            .await
            .map_err(|e| EngineError::Unknown(e.to_string()))?;
        Ok(())
    }

    async fn is_cancellation_requested(&self, execution_id: &str) -> Result<bool> {
        let row: Option<(bool,)> =
            sqlx::query_as("SELECT cancel_requested FROM executions WHERE id = $1")
                .bind(execution_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| EngineError::Unknown(e.to_string()))?;
        Ok(row.map(|(v,)| v).unwrap_or(false))
    }
}

fn quota_for(rate: &RateLimit) -> Quota {
    let max = rate.max.max(1);
    let per_cell = rate.per / max;
    let per_cell = if per_cell.is_zero() {
        Duration::from_millis(1)
    } else {
        per_cell
    };
    Quota::with_period(per_cell)
        .unwrap_or_else(|| Quota::per_second(NonZeroU32::new(1).unwrap()))
        .allow_burst(NonZeroU32::new(max).unwrap())
}

async fn acquire_rate_limit(limiter: &governor::DefaultDirectRateLimiter) {
    while limiter.check().is_err() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Flow Orchestrator: owns every collaborator and drives one `FlowExecution`
/// through to a terminal status.
pub struct Orchestrator<R: DurableRuntime> {
    executions: Arc<dyn FlowExecutionStore>,
    execution_log: Box<dyn ExecutionLogRecorder>,
    publisher: EventPublisher,
    credentials: CredentialResolver,
    auth_configs: Box<dyn AuthConfigStore>,
    sandbox: Box<dyn SandboxBackend>,
    http: reqwest::Client,
    durable: R,
    execution_semaphore: Semaphore,
    throttle_semaphores: DashMap<String, std::sync::Arc<Semaphore>>,
    throttle_limiters: DashMap<String, std::sync::Arc<governor::DefaultDirectRateLimiter>>,
    global_defaults: GlobalThrottleDefaults,
}

impl<R: DurableRuntime> Orchestrator<R> {
    pub fn new(
        executions: Arc<dyn FlowExecutionStore>,
        execution_log: Box<dyn ExecutionLogRecorder>,
        publisher: EventPublisher,
        credentials: CredentialResolver,
        auth_configs: Box<dyn AuthConfigStore>,
        sandbox: Box<dyn SandboxBackend>,
        durable: R,
        max_concurrent_executions: usize,
        global_defaults: GlobalThrottleDefaults,
    ) -> Self {
        Self {
            executions,
            execution_log,
            publisher,
            credentials,
            auth_configs,
            sandbox,
            http: reqwest::Client::new(),
            durable,
            execution_semaphore: Semaphore::new(max_concurrent_executions),
            throttle_semaphores: DashMap::new(),
            throttle_limiters: DashMap::new(),
            global_defaults,
        }
    }

    fn semaphore_for(&self, key: &str, concurrency: u32) -> std::sync::Arc<Semaphore> {
        self.throttle_semaphores
            .entry(key.to_string())
            .or_insert_with(|| std::sync::Arc::new(Semaphore::new(concurrency as usize)))
            .clone()
    }

    fn limiter_for(&self, key: &str, rate: &RateLimit) -> std::sync::Arc<governor::DefaultDirectRateLimiter> {
        self.throttle_limiters
            .entry(key.to_string())
            .or_insert_with(|| std::sync::Arc::new(RateLimiter::direct(quota_for(rate))))
            .clone()
    }

    /// Requests cooperative cancellation of a running execution (spec §5).
    /// The request is persisted and picked up by the execution's own cancel
    /// watcher between steps; this call does not itself stop anything.
    pub async fn cancel_execution(&self, execution_id: &str) -> Result<()> {
        self.executions.request_cancellation(execution_id).await
    }

    /// Startup recovery: re-drives every execution left `running` by a
    /// previous process (grounded on `flow_engine::recover_running_executions`).
    /// The durable runtime's memoization means already-completed sub-units
    /// are skipped on re-entry, so this simply re-invokes `run_flow` for each.
    pub async fn recover_running_executions(&self) {
        let running = match self.executions.list_running().await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::error!(error = %e, "orchestrator: failed to list running executions for recovery");
                return;
            }
        };
        for (execution, steps) in running {
            if steps.is_empty() {
                tracing::warn!(execution_id = %execution.id, "orchestrator: no step definitions available to resume execution");
                continue;
            }
            let event = FlowExecuteEvent {
                org_id: execution.org_id.clone(),
                user_id: execution.user_id.clone(),
                flow_id: execution.flow_id.clone(),
                execution_id: execution.id.clone(),
                variables: execution.variables.clone(),
                steps,
            };
            if let Err(e) = self.run_flow(event).await {
                tracing::error!(execution_id = %execution.id, error = %e, "orchestrator: recovery run failed");
            }
        }
    }

    /// Runs one `FlowExecution` end to end per the algorithm in spec §4.9.
    pub async fn run_flow(&self, event: FlowExecuteEvent) -> Result<FlowExecution> {
        let _permit = self
            .execution_semaphore
            .acquire()
            .await
            .map_err(|e| EngineError::Unknown(e.to_string()))?;

        let mut execution = FlowExecution {
            id: event.execution_id.clone(),
            org_id: event.org_id.clone(),
            flow_id: event.flow_id.clone(),
            user_id: event.user_id.clone(),
            variables: event.variables.clone(),
            step_outputs: Map::new(),
            status: ExecutionStatus::Queued,
            started_at: chrono::Utc::now(),
            ended_at: None,
            error: None,
        };
        self.executions.create(&execution, &event.steps).await?;

        let exec_id = execution.id.clone();
        let total_steps = event.steps.len();
        self.durable
            .run_sub_unit(&exec_id, "update-execution-status", async {
                self.executions.mark_running(&exec_id).await.ok();
                self.publisher
                    .publish_execution_event(&ExecutionEvent {
                        execution_id: exec_id.clone(),
                        status: ExecutionEventStatus::Started,
                        timestamp: chrono::Utc::now(),
                        org_id: execution.org_id.clone(),
                        flow_id: execution.flow_id.clone(),
                        total_steps: Some(total_steps),
                        completed_steps: None,
                        failed_steps: None,
                        skipped_steps: None,
                        duration: None,
                        output: None,
                        error: None,
                    })
                    .await;
            })
            .await;
        execution.status = ExecutionStatus::Running;

        // Cooperative cancellation (spec §5): a lightweight sidecar polls the
        // persisted `cancelRequested` flag so the per-step check below is a
        // cheap atomic load rather than a DB round trip on every iteration.
        // The watcher exits as soon as `_cancel_watcher_stop` is dropped at
        // the end of this call.
        let cancel_flag = Arc::new(AtomicBool::new(false));
        let (_cancel_watcher_stop, mut stop_rx) = tokio::sync::oneshot::channel::<()>();
        {
            let executions = self.executions.clone();
            let exec_id = execution.id.clone();
            let cancel_flag = cancel_flag.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = &mut stop_rx => break,
                        _ = tokio::time::sleep(Duration::from_millis(250)) => {
                            if let Ok(true) = executions.is_cancellation_requested(&exec_id).await {
                                cancel_flag.store(true, Ordering::Relaxed);
                                break;
                            }
                        }
                    }
                }
            });
        }

        let flow_started_at = Instant::now();
        let mut completed_steps = 0usize;
        let mut failed_steps = 0usize;
        let mut skipped_steps = 0usize;
        let mut cancelled = false;

        for step in &event.steps {
            if cancel_flag.load(Ordering::Relaxed) {
                cancelled = true;
                break;
            }

            let exec_id = execution.id.clone();
            let sub_unit_name = format!("execute-step-{}", step.id);
            let step_outputs_snapshot = execution.step_outputs.clone();
            let variables_snapshot = execution.variables.clone();

            let result = self
                .durable
                .run_sub_unit(&exec_id, &sub_unit_name, self.run_step_with_retry(
                    &execution.org_id,
                    &execution.user_id,
                    &execution.flow_id,
                    &execution.id,
                    step,
                    &variables_snapshot,
                    &step_outputs_snapshot,
                    &cancel_flag,
                ))
                .await;

            if result.skipped {
                let sub_unit = format!("publish-step-skipped-{}", step.id);
                self.durable
                    .run_sub_unit(&exec_id, &sub_unit, self.publish_step_result(&execution, step, &result))
                    .await;
                skipped_steps += 1;
            } else if result.success {
                if let Some(output) = &result.output {
                    execution
                        .step_outputs
                        .insert(step.id.clone(), output.clone());
                }
                let sub_unit = format!("publish-step-completed-{}", step.id);
                self.durable
                    .run_sub_unit(&exec_id, &sub_unit, self.publish_step_result(&execution, step, &result))
                    .await;
                completed_steps += 1;
            } else {
                failed_steps += 1;
                let sub_unit = format!("publish-step-failed-{}", step.id);
                self.durable
                    .run_sub_unit(&exec_id, &sub_unit, self.publish_step_result(&execution, step, &result))
                    .await;
                if step.is_critical() {
                    execution.error = result.error.clone();
                    break;
                }
            }

            if cancel_flag.load(Ordering::Relaxed) {
                cancelled = true;
                break;
            }
        }

        let final_status = if cancelled {
            ExecutionStatus::Cancelled
        } else if failed_steps > 0 {
            ExecutionStatus::Failed
        } else {
            ExecutionStatus::Completed
        };

        let exec_id = execution.id.clone();
        let final_status_copy = final_status;
        let step_outputs_copy = execution.step_outputs.clone();
        let error_copy = execution.error.clone();
        self.durable
            .run_sub_unit(&exec_id, "finalize-execution", async {
                self.executions
                    .finalize(&exec_id, final_status_copy, &step_outputs_copy, error_copy.as_ref())
                    .await
                    .ok();
                self.publisher
                    .publish_execution_event(&ExecutionEvent {
                        execution_id: exec_id.clone(),
                        status: match final_status_copy {
                            ExecutionStatus::Completed => ExecutionEventStatus::Completed,
                            ExecutionStatus::Cancelled => ExecutionEventStatus::Cancelled,
                            _ => ExecutionEventStatus::Failed,
                        },
                        timestamp: chrono::Utc::now(),
                        org_id: execution.org_id.clone(),
                        flow_id: execution.flow_id.clone(),
                        total_steps: Some(event.steps.len()),
                        completed_steps: Some(completed_steps),
                        failed_steps: Some(failed_steps),
                        skipped_steps: Some(skipped_steps),
                        duration: Some(flow_started_at.elapsed().as_millis()),
                        output: None,
                        error: error_copy.clone(),
                    })
                    .await;
            })
            .await;

        execution.status = final_status;
        execution.ended_at = Some(chrono::Utc::now());
        Ok(execution)
    }

    async fn publish_step_result(&self, execution: &FlowExecution, step: &FlowStep, result: &StepResult) {
        let status = if result.skipped {
            StepEventStatus::Skipped
        } else if result.success {
            StepEventStatus::Completed
        } else {
            StepEventStatus::Failed
        };
        self.publisher
            .publish_step_event(&StepEvent {
                step_id: step.id.clone(),
                status,
                timestamp: chrono::Utc::now(),
                execution_id: execution.id.clone(),
                org_id: execution.org_id.clone(),
                flow_id: execution.flow_id.clone(),
                step_name: Some(step.name.clone()),
                output: result.output.clone(),
                error: result.error.clone(),
                duration: Some(result.metadata.duration_ms),
                skip_reason: result.skip_reason.clone(),
                execute_if: step.execute_if.clone(),
                metadata: Some(result.metadata.extra.clone()),
            })
            .await;
    }

    /// Wraps the step routine with the throttling policy's concurrency,
    /// rate limit, and retry (spec §4.9 "Retries").
    async fn run_step_with_retry(
        &self,
        org: &str,
        user: &str,
        flow: &str,
        execution_id: &str,
        step: &FlowStep,
        variables: &Value,
        step_outputs: &Map<String, Value>,
        cancel_flag: &Arc<AtomicBool>,
    ) -> StepResult {
        let policy = throttle::policy_for(&step.step_type, step.is_critical());
        let policy_key = format!("{}:{}", step.step_type.as_str(), step.is_critical());

        let _concurrency_permit = match policy.concurrency {
            Some(n) if n > 0 => {
                let sem = self.semaphore_for(&policy_key, n);
                Some(sem)
            }
            _ => None,
        };
        let _permit_guard = if let Some(sem) = &_concurrency_permit {
            Some(sem.clone().acquire_owned().await)
        } else {
            None
        };

        if let Some(rate) = &policy.rate_limit {
            let limiter = self.limiter_for(&policy_key, rate);
            acquire_rate_limit(&limiter).await;
        }

        let retry_policy = policy.retry.unwrap_or(crate::models::RetryPolicy {
            max_attempts: self.global_defaults.retry_max_attempts,
            backoff: crate::models::BackoffPolicy {
                kind: crate::models::BackoffKind::Exponential,
                delay: self.global_defaults.retry_base_delay,
            },
        });

        let mut attempt_counter = 0u32;
        let org = org.to_string();
        let flow = flow.to_string();
        let result = retry::retry_with_policy(
            &retry_policy,
            || {
                attempt_counter += 1;
                self.run_step(org.clone(), user, flow.clone(), execution_id, step, variables, step_outputs, attempt_counter, cancel_flag)
            },
            |_| engine_metrics::record_step_retry(&org, &flow, &step.id),
        )
        .await;

        match result {
            Ok(r) => r,
            Err(r) => r,
        }
    }

    /// Single invocation of the step routine (spec §4.9 "Step routine").
    /// Returns `Ok` for a terminal non-retryable-relevant outcome (success or
    /// skip) and `Err` for a failure, so [`retry::retry_with_policy`] can
    /// treat failures as retryable while skip/success stop immediately.
    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        &self,
        org: String,
        user: &str,
        flow: String,
        execution_id: &str,
        step: &FlowStep,
        variables: &Value,
        step_outputs: &Map<String, Value>,
        _attempt: u32,
        cancel_flag: &Arc<AtomicBool>,
    ) -> std::result::Result<StepResult, StepResult> {
        let started = Instant::now();

        let auth_builder = AuthHeaderBuilder::new(self.auth_configs.as_ref(), &self.credentials);
        let auth_headers = auth_builder.build_headers(&org, step).await;

        if let Some(execute_if) = &step.execute_if {
            let cond_ctx = ConditionContext {
                inputs: Value::Object(Map::new()),
                variables: variables.clone(),
                step_outputs: Value::Object(step_outputs.clone()),
                current_step: Some(serde_json::json!({ "id": step.id, "type": step.step_type.as_str() })),
                org_id: Some(org.clone()),
                user_id: Some(user.to_string()),
                meta: ConditionMeta {
                    flow_id: Some(flow.clone()),
                    execution_id: Some(execution_id.to_string()),
                    step_id: Some(step.id.clone()),
                },
            };
            match condition::evaluate(&Some(execute_if.clone()), &cond_ctx) {
                Ok(true) => {}
                Ok(false) => {
                    return Ok(StepResult::skipped(Some(
                        "executeIf condition evaluated to false".to_string(),
                    )))
                }
                Err(e) => {
                    tracing::warn!(step_id = %step.id, error = %e, "orchestrator: executeIf evaluation failed, proceeding (fail-open)");
                }
            }
        }

        let inputs_snapshot = StepInputsSnapshot {
            step_name: step.name.clone(),
            step_type: step.step_type.as_str().to_string(),
            config: step.config.clone(),
            execute_if: step.execute_if.clone(),
            variables: variables.clone(),
            step_outputs: step_outputs.clone(),
        };
        let inputs_snapshot_value = serde_json::to_value(&inputs_snapshot).unwrap_or(Value::Null);

        let log_id = match self
            .execution_log
            .mark_step_started(&org, user, &flow, execution_id, &step.id, inputs_snapshot_value)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                let mut result = StepResult::failure(ErrorRecord::from(&e));
                result.metadata.duration_ms = started.elapsed().as_millis();
                engine_metrics::record_step_error(&org, &flow, &step.id, &result.error.as_ref().unwrap().code);
                return Err(result);
            }
        };

        let dispatch_ctx = DispatchContext {
            org_id: &org,
            user_id: user,
            flow_id: &flow,
            execution_id,
            step_id: &step.id,
            inputs: &inputs_snapshot,
            auth_headers,
            cancellation: Some(cancel_flag.clone()),
        };
        let dispatcher = StepDispatcher::new(self.sandbox.as_ref(), &self.http);
        let mut result = dispatcher.dispatch(&step.step_type, &dispatch_ctx).await;
        result.metadata.duration_ms = started.elapsed().as_millis();
        engine_metrics::record_step_execution(&org, &flow, &step.id, started.elapsed());

        let log_outcome = if result.skipped {
            self.execution_log
                .mark_step_skipped(&log_id, result.skip_reason.clone())
                .await
        } else if result.success {
            self.execution_log
                .mark_step_completed(&log_id, result.output.clone().unwrap_or(Value::Null))
                .await
        } else {
            let error_value = result
                .error
                .clone()
                .map(|e| serde_json::to_value(e).unwrap_or(Value::Null))
                .unwrap_or(Value::Null);
            self.execution_log.mark_step_failed(&log_id, error_value).await
        };

        if let Err(e) = log_outcome {
            let mut failure = StepResult::failure(ErrorRecord::new(
                crate::error::ErrorCode::LogUpdateError,
                e.to_string(),
            ));
            failure.metadata.duration_ms = started.elapsed().as_millis();
            engine_metrics::record_step_error(&org, &flow, &step.id, "LOG_UPDATE_ERROR");
            return Err(failure);
        }

        if !result.success && !result.skipped {
            if let Some(error) = &result.error {
                engine_metrics::record_step_error(&org, &flow, &step.id, &error.code);
            }
            return Err(result);
        }

        Ok(result)
    }
}
