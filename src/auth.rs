//! Auth Header Builder (C6, spec §4.6): resolves outbound auth headers for
//! `http_request`/`oauth_api_call` steps.
//!
//! The domain→tool table is a `once_cell::sync::Lazy` static map, grounded
//! on the static-table idiom used for provider lookups elsewhere in the
//! pack. Host parsing uses the `url` crate.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde_json::{Map, Value};
use url::Url;

use crate::credentials::CredentialResolver;
use crate::models::{FlowStep, StepType};

static DOMAIN_TOOL_TABLE: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("api.slack.com", "slack"),
        ("hooks.slack.com", "slack"),
        ("api.github.com", "github"),
        ("api.notion.com", "notion"),
        ("api.linear.app", "linear"),
        ("discord.com", "discord"),
        ("api.discord.com", "discord"),
    ])
});

/// Org-level auth configuration for one tool (external collaborator: backed
/// by org settings storage, out of this crate's scope beyond this shape).
#[derive(Debug, Clone)]
pub enum AuthConfig {
    ApiKey {
        api_key: String,
        header_name: Option<String>,
        header_value: Option<String>,
    },
    OAuth2,
}

#[async_trait::async_trait]
pub trait AuthConfigStore: Send + Sync {
    async fn get(&self, org: &str, tool: &str) -> Option<AuthConfig>;
}

pub struct AuthHeaderBuilder<'a> {
    pub auth_configs: &'a dyn AuthConfigStore,
    pub credentials: &'a CredentialResolver,
}

impl<'a> AuthHeaderBuilder<'a> {
    pub fn new(auth_configs: &'a dyn AuthConfigStore, credentials: &'a CredentialResolver) -> Self {
        Self {
            auth_configs,
            credentials,
        }
    }

    fn resolve_tool_name(config: &Map<String, Value>) -> Option<String> {
        if let Some(name) = config.get("toolName").and_then(Value::as_str) {
            return Some(name.to_string());
        }
        let url_str = config.get("url").and_then(Value::as_str)?;
        let parsed = Url::parse(url_str).ok()?;
        let host = parsed.host_str()?;
        DOMAIN_TOOL_TABLE.get(host).map(|s| s.to_string())
    }

    /// Builds the header map for one step, incrementing
    /// `auth_injection_total{org, stepId, stepType, toolName, authType}` on
    /// every resolution attempt including `authType=none` (spec §4.6 rule 4).
    /// Never fails — on any retrieval failure, log and omit (rule 3).
    pub async fn build_headers(&self, org: &str, step: &FlowStep) -> HashMap<String, String> {
        if !step.step_type.receives_auth_headers() {
            record_injection(org, &step.id, step.step_type.as_str(), "none", "none");
            return HashMap::new();
        }

        let config = step.config_object();
        let tool_name = match Self::resolve_tool_name(config) {
            Some(t) => t,
            None => {
                record_injection(org, &step.id, step.step_type.as_str(), "none", "none");
                return HashMap::new();
            }
        };

        let auth_config = self.auth_configs.get(org, &tool_name).await;
        let (headers, auth_type) = match auth_config {
            Some(AuthConfig::ApiKey {
                api_key,
                header_name,
                header_value,
            }) => {
                let mut headers = HashMap::new();
                match (header_name, header_value) {
                    (Some(name), Some(value)) => {
                        headers.insert(name, value);
                    }
                    _ => {
                        headers.insert("Authorization".to_string(), format!("Bearer {api_key}"));
                    }
                }
                (headers, "apiKey")
            }
            Some(AuthConfig::OAuth2) => {
                match self.credentials.get_tool_credentials(&tool_name, org).await {
                    Ok(creds) => match creds.access_token {
                        Some(token) => {
                            let mut headers = HashMap::new();
                            headers.insert("Authorization".to_string(), format!("Bearer {token}"));
                            (headers, "oauth2")
                        }
                        None => {
                            tracing::warn!(tool = %tool_name, org = %org, "auth header builder: oauth2 credentials missing access token");
                            (HashMap::new(), "oauth2")
                        }
                    },
                    Err(e) => {
                        tracing::warn!(tool = %tool_name, org = %org, error = %e, "auth header builder: failed to retrieve oauth2 credentials");
                        (HashMap::new(), "oauth2")
                    }
                }
            }
            None => (HashMap::new(), "none"),
        };

        record_injection(org, &step.id, step.step_type.as_str(), &tool_name, auth_type);
        headers
    }
}

fn record_injection(org: &str, step_id: &str, step_type: &str, tool_name: &str, auth_type: &str) {
    metrics::counter!(
        "auth_injection_total",
        "org" => org.to_string(),
        "stepId" => step_id.to_string(),
        "stepType" => step_type.to_string(),
        "toolName" => tool_name.to_string(),
        "authType" => auth_type.to_string(),
    )
    .increment(1);
}

/// Returns `true` for the two step types that ever receive auth headers
/// (spec §4.6 rule 1) — exposed for callers that need the check without
/// constructing a builder.
pub fn receives_auth_headers(step_type: &StepType) -> bool {
    step_type.receives_auth_headers()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialStore;
    use crate::error::Result;
    use crate::models::ToolCredentials;
    use serde_json::json;
    use std::time::Duration;

    struct NoAuthConfigs;

    #[async_trait::async_trait]
    impl AuthConfigStore for NoAuthConfigs {
        async fn get(&self, _org: &str, _tool: &str) -> Option<AuthConfig> {
            None
        }
    }

    struct ApiKeyConfigs;

    #[async_trait::async_trait]
    impl AuthConfigStore for ApiKeyConfigs {
        async fn get(&self, _org: &str, _tool: &str) -> Option<AuthConfig> {
            Some(AuthConfig::ApiKey {
                api_key: "secret".to_string(),
                header_name: None,
                header_value: None,
            })
        }
    }

    struct EmptyStore;

    #[async_trait::async_trait]
    impl CredentialStore for EmptyStore {
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

    fn resolver() -> CredentialResolver {
        CredentialResolver::new(
            Box::new(EmptyStore),
            Duration::from_secs(600),
            HashMap::new(),
            crate::models::RetryPolicy {
                max_attempts: 1,
                backoff: crate::models::BackoffPolicy {
                    kind: crate::models::BackoffKind::Fixed,
                    delay: Duration::from_millis(1),
                },
            },
        )
    }

    fn step(step_type: StepType, config: Value) -> FlowStep {
        FlowStep {
            id: "step1".to_string(),
            step_type,
            name: "Step".to_string(),
            config,
            execute_if: None,
            critical: None,
            depends_on: None,
        }
    }

    #[tokio::test]
    async fn non_http_steps_get_no_headers() {
        let configs = NoAuthConfigs;
        let creds = resolver();
        let builder = AuthHeaderBuilder::new(&configs, &creds);
        let s = step(StepType::Delay, json!({}));
        let headers = builder.build_headers("org1", &s).await;
        assert!(headers.is_empty());
    }

    #[tokio::test]
    async fn resolves_tool_from_known_host() {
        let configs = ApiKeyConfigs;
        let creds = resolver();
        let builder = AuthHeaderBuilder::new(&configs, &creds);
        let s = step(StepType::HttpRequest, json!({"url": "https://api.github.com/repos"}));
        let headers = builder.build_headers("org1", &s).await;
        assert_eq!(headers.get("Authorization"), Some(&"Bearer secret".to_string()));
    }

    #[tokio::test]
    async fn unknown_host_and_no_tool_name_yields_empty_map() {
        let configs = NoAuthConfigs;
        let creds = resolver();
        let builder = AuthHeaderBuilder::new(&configs, &creds);
        let s = step(StepType::HttpRequest, json!({"url": "https://unknown.example.com"}));
        let headers = builder.build_headers("org1", &s).await;
        assert!(headers.is_empty());
    }

    #[tokio::test]
    async fn explicit_header_name_and_value_override_bearer_default() {
        struct CustomHeaderConfigs;
        #[async_trait::async_trait]
        impl AuthConfigStore for CustomHeaderConfigs {
            async fn get(&self, _org: &str, _tool: &str) -> Option<AuthConfig> {
                Some(AuthConfig::ApiKey {
                    api_key: "secret".to_string(),
                    header_name: Some("X-Api-Key".to_string()),
                    header_value: Some("secret-value".to_string()),
                })
            }
        }
        let configs = CustomHeaderConfigs;
        let creds = resolver();
        let builder = AuthHeaderBuilder::new(&configs, &creds);
        let s = step(StepType::HttpRequest, json!({"toolName": "github"}));
        let headers = builder.build_headers("org1", &s).await;
        assert_eq!(headers.get("X-Api-Key"), Some(&"secret-value".to_string()));
    }
}
