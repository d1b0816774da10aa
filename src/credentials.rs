//! Credential Resolver (C1, spec §4.1): per-(org, tool) credential storage,
//! a TTL cache in front of it, and OAuth token refresh.
//!
//! Backing storage is an external collaborator behind [`CredentialStore`],
//! grounded on the teacher's sqlx `FromRow`/parameterized-query style in
//! `flow_engine.rs`. The TTL cache is a `DashMap` keyed by `(org, tool)`,
//! grounded on `nebula-credential::manager::core::CredentialManager`'s
//! cache-then-lock-then-refresh shape. OAuth refresh reuses the shared
//! `retry` executor rather than pulling in `backon` a second time.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use sqlx::PgPool;

use crate::error::{EngineError, Result};
use crate::models::{OAuthTokens, RetryPolicy, ToolCredentials};
use crate::retry;

/// Backing store for `ToolCredentials` rows, keyed by `(tool, org)`. External
/// collaborator: the default implementation is Postgres via sqlx, but the
/// resolver itself only depends on this trait.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, tool: &str, org: &str) -> Result<Option<ToolCredentials>>;
    async fn upsert(&self, tool: &str, org: &str, creds: &ToolCredentials) -> Result<()>;
    async fn delete(&self, tool: &str, org: &str) -> Result<()>;
}

/// Postgres-backed `CredentialStore` against a `tool_credentials` table,
/// grounded on the teacher's `sqlx::query!`/transaction style in
/// `flow_engine::process_incoming_message`.
pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn get(&self, tool: &str, org: &str) -> Result<Option<ToolCredentials>> {
        let row = sqlx::query_scalar::<_, Value>(
            "SELECT data FROM tool_credentials WHERE tool_name = $1 AND org_id = $2",
        )
        .bind(tool)
        .bind(org)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EngineError::NotFound(e.to_string()))?;

        match row {
            Some(v) => Ok(Some(
                serde_json::from_value(v).map_err(|e| EngineError::NotFound(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    async fn upsert(&self, tool: &str, org: &str, creds: &ToolCredentials) -> Result<()> {
        let data = serde_json::to_value(creds).map_err(|e| EngineError::Unknown(e.to_string()))?;
        sqlx::query(
            "INSERT INTO tool_credentials (tool_name, org_id, data, updated_at)
             VALUES ($1, $2, $3, NOW())
             ON CONFLICT (tool_name, org_id) DO UPDATE SET data = $3, updated_at = NOW()",
        )
        .bind(tool)
        .bind(org)
        .bind(data)
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::Unknown(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, tool: &str, org: &str) -> Result<()> {
        sqlx::query("DELETE FROM tool_credentials WHERE tool_name = $1 AND org_id = $2")
            .bind(tool)
            .bind(org)
            .execute(&self.pool)
            .await
            .map_err(|e| EngineError::Unknown(e.to_string()))?;
        Ok(())
    }
}

/// Default OAuth token endpoints for known providers (spec §4.1), overridable
/// per-tool via `EngineConfig::oauth_token_endpoint_overrides`.
fn default_token_endpoint(tool: &str) -> Option<&'static str> {
    match tool {
        "github" => Some("https://github.com/login/oauth/access_token"),
        "google" => Some("https://oauth2.googleapis.com/token"),
        "microsoft" => Some("https://login.microsoftonline.com/common/oauth2/v2.0/token"),
        "slack" => Some("https://slack.com/api/oauth.v2.access"),
        "discord" => Some("https://discord.com/api/oauth2/token"),
        _ => None,
    }
}

struct CacheEntry {
    value: Option<ToolCredentials>,
    expires_at: Instant,
}

/// Credential Resolver (C1): TTL cache over a [`CredentialStore`], plus OAuth
/// refresh. Cache failures never fail a read — they fall through to the
/// backing store (spec §4.1).
pub struct CredentialResolver {
    store: Box<dyn CredentialStore>,
    cache: DashMap<(String, String), CacheEntry>,
    ttl: Duration,
    http: reqwest::Client,
    token_endpoint_overrides: HashMap<String, String>,
    refresh_retry: RetryPolicy,
}

impl CredentialResolver {
    pub fn new(
        store: Box<dyn CredentialStore>,
        ttl: Duration,
        token_endpoint_overrides: HashMap<String, String>,
        refresh_retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            cache: DashMap::new(),
            ttl,
            http: reqwest::Client::new(),
            token_endpoint_overrides,
            refresh_retry,
        }
    }

    fn cache_key(tool: &str, org: &str) -> (String, String) {
        (org.to_string(), tool.to_string())
    }

    fn cache_get(&self, tool: &str, org: &str) -> Option<Option<ToolCredentials>> {
        let key = Self::cache_key(tool, org);
        let entry = self.cache.get(&key)?;
        if entry.expires_at < Instant::now() {
            drop(entry);
            self.cache.remove(&key);
            return None;
        }
        Some(entry.value.clone())
    }

    fn cache_put(&self, tool: &str, org: &str, value: Option<ToolCredentials>) {
        self.cache.insert(
            Self::cache_key(tool, org),
            CacheEntry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    fn cache_invalidate(&self, tool: &str, org: &str) {
        self.cache.remove(&Self::cache_key(tool, org));
    }

    /// Invalidates every cached tool for one org (bulk invalidation, spec
    /// §4.1: "bulk invalidation by org uses a pattern delete").
    pub fn invalidate_org(&self, org: &str) {
        self.cache.retain(|(o, _), _| o != org);
    }

    pub async fn get_tool_credentials(&self, tool: &str, org: &str) -> Result<ToolCredentials> {
        if let Some(cached) = self.cache_get(tool, org) {
            return cached.ok_or_else(|| {
                EngineError::NotFound(format!("no credentials for tool '{tool}' in org '{org}'"))
            });
        }

        let fetched = self.store.get(tool, org).await?;
        self.cache_put(tool, org, fetched.clone());
        fetched.ok_or_else(|| {
            EngineError::NotFound(format!("no credentials for tool '{tool}' in org '{org}'"))
        })
    }

    pub async fn set_tool_credentials(
        &self,
        tool: &str,
        org: &str,
        creds: ToolCredentials,
    ) -> Result<()> {
        self.store.upsert(tool, org, &creds).await?;
        self.cache_invalidate(tool, org);
        Ok(())
    }

    pub async fn delete_tool_credentials(&self, tool: &str, org: &str) -> Result<()> {
        self.store.delete(tool, org).await?;
        self.cache_invalidate(tool, org);
        Ok(())
    }

    pub async fn get_oauth_tokens(&self, tool: &str, org: &str) -> Result<OAuthTokens> {
        let creds = self.get_tool_credentials(tool, org).await?;
        let access_token = creds.access_token.ok_or(EngineError::NoAccessToken)?;
        Ok(OAuthTokens {
            access_token,
            refresh_token: creds.refresh_token,
            expires_at: creds.expires_at,
            scope: creds.scope,
            token_type: creds.token_type.unwrap_or_else(|| "Bearer".to_string()),
        })
    }

    /// True when `expiresAt > 0 && expiresAt - 5min <= now`, or on retrieval
    /// failure (spec §4.1 — fail toward "treat as expired").
    pub async fn is_token_expired(&self, tool: &str, org: &str) -> bool {
        match self.get_tool_credentials(tool, org).await {
            Ok(creds) => {
                if creds.expires_at <= 0 {
                    return false;
                }
                let now_ms = chrono::Utc::now().timestamp_millis();
                creds.expires_at - 5 * 60 * 1000 <= now_ms
            }
            Err(_) => true,
        }
    }

    pub async fn update_oauth_tokens(
        &self,
        tool: &str,
        org: &str,
        tokens: &OAuthTokens,
    ) -> Result<()> {
        let mut existing = self
            .store
            .get(tool, org)
            .await?
            .unwrap_or_default();
        existing.access_token = Some(tokens.access_token.clone());
        if let Some(rt) = &tokens.refresh_token {
            existing.refresh_token = Some(rt.clone());
        }
        existing.expires_at = tokens.expires_at;
        if tokens.scope.is_some() {
            existing.scope = tokens.scope.clone();
        }
        existing.token_type = Some(tokens.token_type.clone());
        existing.last_updated = Some(chrono::Utc::now().timestamp_millis());

        self.store.upsert(tool, org, &existing).await?;
        self.cache_invalidate(tool, org);
        Ok(())
    }

    fn resolve_token_endpoint(&self, tool: &str, creds: &ToolCredentials) -> Option<String> {
        if let Some(ep) = &creds.token_endpoint {
            return Some(ep.clone());
        }
        if let Some(ep) = self.token_endpoint_overrides.get(tool) {
            return Some(ep.clone());
        }
        default_token_endpoint(tool).map(str::to_string)
    }

    /// Refreshes OAuth tokens for `(tool, org)`, invoked externally by the
    /// Dispatcher when a call requires a non-expired token (spec §4.1).
    pub async fn refresh_oauth_tokens(&self, tool: &str, org: &str) -> Result<OAuthTokens> {
        let creds = self.get_tool_credentials(tool, org).await?;
        let refresh_token = creds
            .refresh_token
            .clone()
            .ok_or(EngineError::NoRefreshToken)?;
        let token_endpoint = self
            .resolve_token_endpoint(tool, &creds)
            .ok_or_else(|| EngineError::Unknown(format!("no token endpoint for tool '{tool}'")))?;

        let mut retries = 0u32;
        let response_body = retry::retry_with_policy(
            &self.refresh_retry,
            || {
                let mut form = vec![
                    ("grant_type", "refresh_token".to_string()),
                    ("refresh_token", refresh_token.clone()),
                ];
                if let Some(id) = &creds.client_id {
                    form.push(("client_id", id.clone()));
                }
                if let Some(secret) = &creds.client_secret {
                    form.push(("client_secret", secret.clone()));
                }
                if let Some(scope) = &creds.scope {
                    form.push(("scope", scope.clone()));
                }
                let client = self.http.clone();
                let endpoint = token_endpoint.clone();
                async move {
                    let resp = client
                        .post(&endpoint)
                        .form(&form)
                        .send()
                        .await
                        .map_err(|e| EngineError::NetworkError(e.to_string()))?;
                    if !resp.status().is_success() {
                        return Err(EngineError::HttpError(format!(
                            "token refresh failed: HTTP {}",
                            resp.status()
                        )));
                    }
                    resp.json::<Value>()
                        .await
                        .map_err(|e| EngineError::HttpError(e.to_string()))
                }
            },
            |_| retries += 1,
        )
        .await?;

        let access_token = response_body
            .get("access_token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| EngineError::Unknown("refresh response missing access_token".into()))?;
        let refresh_token_new = response_body
            .get("refresh_token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| creds.refresh_token.clone());
        let expires_in = response_body
            .get("expires_in")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let expires_at = if expires_in > 0 {
            chrono::Utc::now().timestamp_millis() + expires_in * 1000
        } else {
            creds.expires_at
        };
        let scope = response_body
            .get("scope")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| creds.scope.clone());
        let token_type = response_body
            .get("token_type")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| creds.token_type_or_default().to_string());

        let tokens = OAuthTokens {
            access_token,
            refresh_token: refresh_token_new,
            expires_at,
            scope,
            token_type,
        };
        self.update_oauth_tokens(tool, org, &tokens).await?;
        Ok(tokens)
    }
}

/// `Map<String, Value>` view used by callers that only need a generic
/// key/value credential bag (e.g. auth header construction testing).
pub fn credentials_to_map(creds: &ToolCredentials) -> Map<String, Value> {
    match serde_json::to_value(creds) {
        Ok(Value::Object(m)) => m,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct InMemoryStore {
        rows: Mutex<HashMap<(String, String), ToolCredentials>>,
    }

    #[async_trait]
    impl CredentialStore for InMemoryStore {
        async fn get(&self, tool: &str, org: &str) -> Result<Option<ToolCredentials>> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .get(&(tool.to_string(), org.to_string()))
                .cloned())
        }

        async fn upsert(&self, tool: &str, org: &str, creds: &ToolCredentials) -> Result<()> {
            self.rows
                .lock()
                .unwrap()
                .insert((tool.to_string(), org.to_string()), creds.clone());
            Ok(())
        }

        async fn delete(&self, tool: &str, org: &str) -> Result<()> {
            self.rows
                .lock()
                .unwrap()
                .remove(&(tool.to_string(), org.to_string()));
            Ok(())
        }
    }

    fn default_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 1,
            backoff: crate::models::BackoffPolicy {
                kind: crate::models::BackoffKind::Fixed,
                delay: Duration::from_millis(1),
            },
        }
    }

    #[tokio::test]
    async fn get_missing_credentials_reports_not_found() {
        let resolver = CredentialResolver::new(
            Box::new(InMemoryStore::default()),
            Duration::from_secs(600),
            HashMap::new(),
            default_retry(),
        );
        let err = resolver
            .get_tool_credentials("github", "org1")
            .await
            .unwrap_err();
        assert_eq!(err.code().as_str(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn set_then_get_round_trips_and_invalidates_cache() {
        let resolver = CredentialResolver::new(
            Box::new(InMemoryStore::default()),
            Duration::from_secs(600),
            HashMap::new(),
            default_retry(),
        );
        let creds = ToolCredentials {
            access_token: Some("tok".to_string()),
            ..Default::default()
        };
        resolver
            .set_tool_credentials("slack", "org1", creds)
            .await
            .unwrap();
        let fetched = resolver.get_tool_credentials("slack", "org1").await.unwrap();
        assert_eq!(fetched.access_token.as_deref(), Some("tok"));
    }

    #[tokio::test]
    async fn get_oauth_tokens_fails_without_access_token() {
        let resolver = CredentialResolver::new(
            Box::new(InMemoryStore::default()),
            Duration::from_secs(600),
            HashMap::new(),
            default_retry(),
        );
        resolver
            .set_tool_credentials("github", "org1", ToolCredentials::default())
            .await
            .unwrap();
        let err = resolver.get_oauth_tokens("github", "org1").await.unwrap_err();
        assert_eq!(err.code().as_str(), "NO_ACCESS_TOKEN");
    }

    #[tokio::test]
    async fn is_token_expired_true_on_missing_credentials() {
        let resolver = CredentialResolver::new(
            Box::new(InMemoryStore::default()),
            Duration::from_secs(600),
            HashMap::new(),
            default_retry(),
        );
        assert!(resolver.is_token_expired("github", "org1").await);
    }

    #[tokio::test]
    async fn is_token_expired_false_when_expires_at_is_zero() {
        let resolver = CredentialResolver::new(
            Box::new(InMemoryStore::default()),
            Duration::from_secs(600),
            HashMap::new(),
            default_retry(),
        );
        resolver
            .set_tool_credentials(
                "github",
                "org1",
                ToolCredentials {
                    access_token: Some("tok".to_string()),
                    expires_at: 0,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!resolver.is_token_expired("github", "org1").await);
    }

    #[tokio::test]
    async fn refresh_without_refresh_token_fails() {
        let resolver = CredentialResolver::new(
            Box::new(InMemoryStore::default()),
            Duration::from_secs(600),
            HashMap::new(),
            default_retry(),
        );
        resolver
            .set_tool_credentials(
                "github",
                "org1",
                ToolCredentials {
                    access_token: Some("tok".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let err = resolver
            .refresh_oauth_tokens("github", "org1")
            .await
            .unwrap_err();
        assert_eq!(err.code().as_str(), "NO_REFRESH_TOKEN");
    }
}
