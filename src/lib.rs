pub mod auth;
pub mod condition;
pub mod config;
pub mod credentials;
pub mod dispatcher;
pub mod durable;
pub mod error;
pub mod execution_log;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod publisher;
pub mod retry;
pub mod sandbox;
pub mod throttle;

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::auth::AuthConfigStore;
use crate::config::EngineConfig;
use crate::credentials::{CredentialResolver, PgCredentialStore};
use crate::durable::InProcessDurableRuntime;
use crate::execution_log::PgExecutionLogStore;
use crate::orchestrator::{Orchestrator, PgFlowExecutionStore};
use crate::publisher::{EventPublisher, RedisPubSubGateway};
use crate::sandbox::HttpSandboxBackend;

/// Org-level tool auth configuration backed by Postgres (external
/// collaborator named in spec §4.6; storage shape is this crate's own,
/// grounded on the teacher's key/value settings-row pattern).
pub struct PgAuthConfigStore {
    pool: PgPool,
}

impl PgAuthConfigStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl AuthConfigStore for PgAuthConfigStore {
    async fn get(&self, org: &str, tool: &str) -> Option<auth::AuthConfig> {
        let row: Option<(String, Option<String>, Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT auth_type, api_key, header_name, header_value
               FROM tool_auth_configs WHERE org_id = $1 AND tool = $2",
        )
        .bind(org)
        .bind(tool)
        .fetch_optional(&self.pool)
        .await
        .ok()
        .flatten();

        match row {
            Some((auth_type, _, _, _)) if auth_type == "oauth2" => Some(auth::AuthConfig::OAuth2),
            Some((_, Some(api_key), header_name, header_value)) => Some(auth::AuthConfig::ApiKey {
                api_key,
                header_name,
                header_value,
            }),
            _ => None,
        }
    }
}

/// Everything the engine needs to drive flow executions: every collaborator
/// named in spec §2, wired from one [`EngineConfig`]. Replaces the
/// WhatsApp-bot `AppState` with the set of components the Flow Orchestrator
/// actually depends on.
pub struct Engine {
    pub pool: PgPool,
    pub orchestrator: Orchestrator<InProcessDurableRuntime>,
}

impl Engine {
    pub async fn connect(config: &EngineConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(&config.database_url)
            .await?;

        let executions: Arc<dyn orchestrator::FlowExecutionStore> =
            Arc::new(PgFlowExecutionStore::new(pool.clone()));
        let execution_log: Box<dyn execution_log::ExecutionLogRecorder> =
            Box::new(PgExecutionLogStore::new(pool.clone()));

        let gateway = RedisPubSubGateway::connect(Some(&config.redis_url)).await;
        let publisher = EventPublisher::new(Box::new(gateway));

        let credential_store = Box::new(PgCredentialStore::new(pool.clone()));
        let refresh_retry = crate::models::RetryPolicy {
            max_attempts: config.global_throttle_defaults.retry_max_attempts,
            backoff: crate::models::BackoffPolicy {
                kind: crate::models::BackoffKind::Exponential,
                delay: config.global_throttle_defaults.retry_base_delay,
            },
        };
        let credentials = CredentialResolver::new(
            credential_store,
            config.credential_cache_ttl,
            config.oauth_token_endpoint_overrides.clone(),
            refresh_retry,
        );

        let auth_configs: Box<dyn AuthConfigStore> = Box::new(PgAuthConfigStore::new(pool.clone()));
        let sandbox: Box<dyn sandbox::SandboxBackend> = Box::new(HttpSandboxBackend::new(
            config.sandbox_base_url.clone(),
            config.daytona_sync_timeout,
        ));

        let durable = InProcessDurableRuntime::new();

        let orchestrator = Orchestrator::new(
            executions,
            execution_log,
            publisher,
            credentials,
            auth_configs,
            sandbox,
            durable,
            config.max_concurrent_executions,
            config.global_throttle_defaults.clone(),
        );

        Ok(Self { pool, orchestrator })
    }

    /// Startup recovery (spec §9 supplemented feature): re-drives every
    /// `FlowExecution` left `running` by a crashed process, using the step
    /// definitions persisted alongside the execution row at creation time.
    pub async fn recover(&self) {
        self.orchestrator.recover_running_executions().await;
    }

    /// Requests cooperative cancellation of a running execution (spec §5).
    pub async fn cancel_execution(&self, execution_id: &str) -> anyhow::Result<()> {
        self.orchestrator.cancel_execution(execution_id).await?;
        Ok(())
    }
}
