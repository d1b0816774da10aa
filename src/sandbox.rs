//! Sandbox Executor (C5, spec §4.5): opaque code-execution backend with a
//! sync and async (polling) mode.
//!
//! The backend is modeled as a trait so the engine never couples to a
//! specific sandbox vendor; the default implementation calls a configurable
//! HTTP base URL via `reqwest`, grounded on `pollux`'s reqwest-based
//! provider call style. When unconfigured, `run_sync` raises
//! `SANDBOX_UNAVAILABLE` so callers (`data_transform`/`conditional`) fall
//! back to direct expression evaluation (spec §4.5/§4.7).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{EngineError, Result};

/// Verbatim context handed to the sandbox runtime (spec §4.5).
#[derive(Debug, Clone, Serialize)]
pub struct SandboxContext {
    #[serde(rename = "orgId")]
    pub org_id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "flowId")]
    pub flow_id: String,
    #[serde(rename = "stepId")]
    pub step_id: String,
    #[serde(rename = "executionId")]
    pub execution_id: String,
    pub variables: Value,
    #[serde(rename = "stepOutputs")]
    pub step_outputs: Map<String, Value>,
    #[serde(rename = "authHeaders", skip_serializing_if = "Option::is_none")]
    pub auth_headers: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxRunResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "executionTime")]
    pub execution_time: u128,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AsyncStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsyncResult {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub status: AsyncStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<SandboxRunResult>,
}

/// Syntactic-marker language inference (spec §4.5).
pub fn infer_language(code: &str) -> &'static str {
    if code.contains("def ") || code.contains("import ") || code.contains("print(") {
        "python"
    } else if code.contains("function") || code.contains("const ") || code.contains("console.log") {
        "javascript"
    } else if code.contains("func ") || code.contains("package ") || code.contains("fmt.Print") {
        "go"
    } else if code.contains("fn ") || code.contains("let mut") || code.contains("println!") {
        "rust"
    } else {
        "javascript"
    }
}

/// External, opaque sandbox backend (spec §4.5: "the executor treats the
/// backend as opaque").
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    async fn run_sync(&self, code: &str, language: &str, ctx: &SandboxContext) -> Result<SandboxRunResult>;
    async fn run_async(&self, code: &str, language: &str, ctx: &SandboxContext) -> Result<String>;
    async fn get_async_result(&self, session_id: &str) -> Result<AsyncResult>;
    async fn cancel_async_execution(&self, session_id: &str) -> Result<()>;
}

/// HTTP-based default implementation.
pub struct HttpSandboxBackend {
    base_url: Option<String>,
    http: reqwest::Client,
    sync_timeout: Duration,
}

impl HttpSandboxBackend {
    pub fn new(base_url: Option<String>, sync_timeout: Duration) -> Self {
        Self {
            base_url,
            http: reqwest::Client::new(),
            sync_timeout,
        }
    }

    fn require_base_url(&self) -> Result<&str> {
        self.base_url.as_deref().ok_or(EngineError::SandboxUnavailable)
    }
}

#[async_trait]
impl SandboxBackend for HttpSandboxBackend {
    async fn run_sync(&self, code: &str, language: &str, ctx: &SandboxContext) -> Result<SandboxRunResult> {
        let base_url = self.require_base_url()?;
        let resp = self
            .http
            .post(format!("{base_url}/run-sync"))
            .timeout(self.sync_timeout)
            .json(&serde_json::json!({ "code": code, "language": language, "context": ctx }))
            .send()
            .await
            .map_err(|e| EngineError::SandboxSyncError(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(EngineError::SandboxSyncError(format!(
                "sandbox returned HTTP {}",
                resp.status()
            )));
        }
        resp.json::<SandboxRunResult>()
            .await
            .map_err(|e| EngineError::SandboxSyncError(e.to_string()))
    }

    async fn run_async(&self, code: &str, language: &str, ctx: &SandboxContext) -> Result<String> {
        let base_url = self.require_base_url()?;
        #[derive(Deserialize)]
        struct RunAsyncResponse {
            #[serde(rename = "sessionId")]
            session_id: String,
        }
        let resp = self
            .http
            .post(format!("{base_url}/run-async"))
            .json(&serde_json::json!({ "code": code, "language": language, "context": ctx }))
            .send()
            .await
            .map_err(|e| EngineError::SandboxSyncError(e.to_string()))?;
        let parsed: RunAsyncResponse = resp
            .json()
            .await
            .map_err(|e| EngineError::SandboxSyncError(e.to_string()))?;
        Ok(parsed.session_id)
    }

    async fn get_async_result(&self, session_id: &str) -> Result<AsyncResult> {
        let base_url = self.require_base_url()?;
        let resp = self
            .http
            .get(format!("{base_url}/sessions/{session_id}"))
            .send()
            .await
            .map_err(|e| EngineError::SandboxSyncError(e.to_string()))?;
        resp.json::<AsyncResult>()
            .await
            .map_err(|e| EngineError::SandboxSyncError(e.to_string()))
    }

    async fn cancel_async_execution(&self, session_id: &str) -> Result<()> {
        let base_url = self.require_base_url()?;
        self.http
            .post(format!("{base_url}/sessions/{session_id}/cancel"))
            .send()
            .await
            .map_err(|e| EngineError::SandboxSyncError(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infers_python_from_def_and_import() {
        assert_eq!(infer_language("def main():\n    import os"), "python");
    }

    #[test]
    fn infers_javascript_from_console_log() {
        assert_eq!(infer_language("const x = 1; console.log(x)"), "javascript");
    }

    #[test]
    fn infers_go_from_package_and_fmt_print() {
        assert_eq!(infer_language("package main\nfunc main() { fmt.Println(1) }"), "go");
    }

    #[test]
    fn infers_rust_from_println_macro() {
        assert_eq!(infer_language("fn main() { let mut x = 1; println!(\"{}\", x); }"), "rust");
    }

    #[test]
    fn defaults_to_javascript_for_unrecognized_code() {
        assert_eq!(infer_language("???"), "javascript");
    }

    #[tokio::test]
    async fn unconfigured_backend_reports_sandbox_unavailable() {
        let backend = HttpSandboxBackend::new(None, Duration::from_secs(30));
        let ctx = SandboxContext {
            org_id: "org1".to_string(),
            user_id: "user1".to_string(),
            flow_id: "flow1".to_string(),
            step_id: "step1".to_string(),
            execution_id: "exec1".to_string(),
            variables: Value::Null,
            step_outputs: Map::new(),
            auth_headers: None,
        };
        let err = backend.run_sync("print(1)", "python", &ctx).await.unwrap_err();
        assert_eq!(err.code().as_str(), "SANDBOX_UNAVAILABLE");
    }
}
