//! Environment-driven configuration, loaded the way the teacher's `main.rs`
//! loads `DATABASE_URL`/`REDIS_URL`: `dotenvy::dotenv().ok()` then
//! `std::env::var` with explicit fallbacks (spec §6 "Environment /
//! configuration keys").

use std::env;
use std::time::Duration;

/// Global defaults applied "when the runtime consults no per-step policy"
/// (spec §4.8).
#[derive(Debug, Clone)]
pub struct GlobalThrottleDefaults {
    pub concurrency: u32,
    pub rate_limit_max: u32,
    pub rate_limit_per: Duration,
    pub retry_max_attempts: u32,
    pub retry_base_delay: Duration,
}

impl Default for GlobalThrottleDefaults {
    fn default() -> Self {
        Self {
            concurrency: 10,
            rate_limit_max: 100,
            rate_limit_per: Duration::from_secs(60),
            retry_max_attempts: 3,
            retry_base_delay: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: String,
    pub redis_url: String,
    /// `DAYTONA_SYNC_TIMEOUT` — `runSync` blocks until reply or this elapses.
    pub daytona_sync_timeout: Duration,
    /// `DAYTONA_ASYNC_TIMEOUT` — upper bound honored by async sandbox calls.
    pub daytona_async_timeout: Duration,
    /// Sandbox backend base URL; `None` means "unconfigured" (spec §4.5).
    pub sandbox_base_url: Option<String>,
    /// Global execution concurrency ceiling (spec §5): at most this many
    /// `FlowExecution`s run in parallel.
    pub max_concurrent_executions: usize,
    pub global_throttle_defaults: GlobalThrottleDefaults,
    /// Platform default HTTP request timeout (spec §5): 30s unless a step
    /// overrides it.
    pub default_http_timeout: Duration,
    /// Per-tool OAuth token endpoint overrides (spec §4.1), keyed by tool
    /// name lowercased.
    pub oauth_token_endpoint_overrides: std::collections::HashMap<String, String>,
    /// Credential cache TTL (spec §4.1: 10 min).
    pub credential_cache_ttl: Duration,
}

impl EngineConfig {
    /// Loads configuration from the process environment, calling
    /// `dotenvy::dotenv().ok()` first so a local `.env` is honored, matching
    /// the teacher's startup sequence.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
        let redis_url =
            env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());

        let daytona_sync_timeout = Duration::from_millis(
            env_u64("DAYTONA_SYNC_TIMEOUT").unwrap_or(30_000),
        );
        let daytona_async_timeout = Duration::from_millis(
            env_u64("DAYTONA_ASYNC_TIMEOUT").unwrap_or(300_000),
        );
        let sandbox_base_url = env::var("SANDBOX_BASE_URL").ok().filter(|s| !s.is_empty());

        let max_concurrent_executions =
            env_u64("ENGINE_MAX_CONCURRENT_EXECUTIONS").unwrap_or(10) as usize;

        let mut defaults = GlobalThrottleDefaults::default();
        if let Some(v) = env_u64("ENGINE_DEFAULT_CONCURRENCY") {
            defaults.concurrency = v as u32;
        }
        if let Some(v) = env_u64("ENGINE_DEFAULT_RETRY_MAX_ATTEMPTS") {
            defaults.retry_max_attempts = v as u32;
        }

        let default_http_timeout =
            Duration::from_millis(env_u64("ENGINE_HTTP_TIMEOUT_MS").unwrap_or(30_000));

        let credential_cache_ttl =
            Duration::from_millis(env_u64("ENGINE_CREDENTIAL_CACHE_TTL_MS").unwrap_or(600_000));

        let mut oauth_token_endpoint_overrides = std::collections::HashMap::new();
        for (tool, var) in [
            ("github", "OAUTH_TOKEN_ENDPOINT_GITHUB"),
            ("google", "OAUTH_TOKEN_ENDPOINT_GOOGLE"),
            ("microsoft", "OAUTH_TOKEN_ENDPOINT_MICROSOFT"),
            ("slack", "OAUTH_TOKEN_ENDPOINT_SLACK"),
            ("discord", "OAUTH_TOKEN_ENDPOINT_DISCORD"),
        ] {
            if let Ok(v) = env::var(var) {
                oauth_token_endpoint_overrides.insert(tool.to_string(), v);
            }
        }

        Ok(Self {
            database_url,
            redis_url,
            daytona_sync_timeout,
            daytona_async_timeout,
            sandbox_base_url,
            max_concurrent_executions,
            global_throttle_defaults: defaults,
            default_http_timeout,
            oauth_token_endpoint_overrides,
            credential_cache_ttl,
        })
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}
