//! Event Publisher (C4, spec §4.4): fire-and-forget step/execution events on
//! per-execution and per-org Redis channels.
//!
//! Grounded on the teacher's `redis::AsyncCommands`/`MultiplexedConnection`
//! usage in `flow_engine.rs`/`main.rs`, adapted from stream-append
//! (`XADD`/consumer groups) to plain `PUBLISH`, since §4.4 specifies
//! fire-and-forget channels rather than a durable consumer-group stream.
//! Retry loop reuses `retry::retry_fire_and_forget`.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::models::{ExecutionEvent, StepEvent};
use crate::retry;

const MAX_PUBLISH_ATTEMPTS: u32 = 3;

/// Publish destination, external collaborator. The default implementation
/// publishes to Redis; tests substitute an in-memory recorder.
#[async_trait]
pub trait PubSubGateway: Send + Sync {
    async fn publish(&self, channel: &str, payload: String) -> bool;
}

/// Lazily-connecting Redis publisher. When no Redis URL is configured the
/// publisher becomes a silent no-op and steps still execute (spec §4.4).
pub struct RedisPubSubGateway {
    conn: Option<Mutex<MultiplexedConnection>>,
}

impl RedisPubSubGateway {
    pub async fn connect(redis_url: Option<&str>) -> Self {
        let conn = match redis_url {
            Some(url) => match redis::Client::open(url) {
                Ok(client) => match client.get_multiplexed_async_connection().await {
                    Ok(c) => Some(Mutex::new(c)),
                    Err(e) => {
                        tracing::warn!(error = %e, "event publisher: redis connection failed, falling back to no-op");
                        None
                    }
                },
                Err(e) => {
                    tracing::warn!(error = %e, "event publisher: invalid redis url, falling back to no-op");
                    None
                }
            },
            None => None,
        };
        Self { conn }
    }

    pub fn disabled() -> Self {
        Self { conn: None }
    }
}

#[async_trait]
impl PubSubGateway for RedisPubSubGateway {
    async fn publish(&self, channel: &str, payload: String) -> bool {
        let Some(conn) = &self.conn else {
            return true;
        };
        let mut guard = conn.lock().await;
        guard.publish::<_, _, i64>(channel, payload).await.is_ok()
    }
}

/// Event Publisher: formats and retries-then-drops step/execution events.
pub struct EventPublisher {
    gateway: Box<dyn PubSubGateway>,
}

impl EventPublisher {
    pub fn new(gateway: Box<dyn PubSubGateway>) -> Self {
        Self { gateway }
    }

    fn execution_channel(org: &str, execution_id: &str) -> String {
        format!("flows.{org}.{execution_id}")
    }

    fn org_channel(org: &str) -> String {
        format!("flows.{org}")
    }

    /// Publishes `event` on the per-execution channel with retry-then-drop;
    /// event loss never fails a flow (spec §4.4).
    pub async fn publish_step_event(&self, event: &StepEvent) {
        self.publish_on(&Self::execution_channel(&event.org_id, &event.execution_id), event)
            .await;
    }

    pub async fn publish_execution_event(&self, event: &ExecutionEvent) {
        self.publish_on(&Self::execution_channel(&event.org_id, &event.execution_id), event)
            .await;
    }

    /// Broadcast publish on the per-org channel (spec §4.4: "reserved for
    /// broadcast events").
    pub async fn publish_org_broadcast(&self, org: &str, payload: &impl Serialize) {
        self.publish_on(&Self::org_channel(org), payload).await;
    }

    async fn publish_on(&self, channel: &str, payload: &impl Serialize) {
        let body = match serde_json::to_string(payload) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "event publisher: failed to serialize payload");
                return;
            }
        };
        let channel = channel.to_string();
        let ok = retry::retry_fire_and_forget(MAX_PUBLISH_ATTEMPTS, || {
            let channel = channel.clone();
            let body = body.clone();
            async move { self.gateway.publish(&channel, body).await }
        })
        .await;
        if !ok {
            tracing::warn!(channel = %channel, "event publisher: dropping event after exhausting retries");
        }
    }
}
