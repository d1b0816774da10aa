use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use flowforge_core::config::EngineConfig;
use flowforge_core::models::FlowExecuteEvent;
use flowforge_core::Engine;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tracing::{error, info, warn};

const STREAM_KEY: &str = "flows:queue:execute";
const GROUP_NAME: &str = "flow_orchestrator_group";

/// Best-effort distributed lock preventing two workers from double-driving
/// the same `executionId`, grounded on the teacher's `SET NX EX` lock in
/// `process_incoming_message`.
async fn acquire_execution_lock(conn: &mut MultiplexedConnection, execution_id: &str) -> bool {
    let key = format!("flows:lock:{execution_id}");
    let result: redis::RedisResult<Option<String>> = redis::cmd("SET")
        .arg(&key)
        .arg("1")
        .arg("NX")
        .arg("EX")
        .arg(300)
        .query_async(conn)
        .await;
    matches!(result, Ok(Some(_)))
}

async fn release_execution_lock(conn: &mut MultiplexedConnection, execution_id: &str) {
    let key = format!("flows:lock:{execution_id}");
    let _: redis::RedisResult<()> = conn.del(&key).await;
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting flow orchestrator engine...");

    let config = EngineConfig::from_env().context("Failed to load engine configuration")?;

    let engine = Arc::new(
        Engine::connect(&config)
            .await
            .context("Failed to connect engine to its collaborators")?,
    );
    info!("Connected to Postgres and Redis.");

    let redis_url = env::var("REDIS_URL").unwrap_or_else(|_| config.redis_url.clone());
    let redis_client = redis::Client::open(redis_url)?;
    let mut stream_conn = redis_client.get_multiplexed_async_connection().await?;

    let consumer_name =
        env::var("ENGINE_CONSUMER_NAME").unwrap_or_else(|_| "flow_worker_1".to_string());

    let _ = redis::cmd("XGROUP")
        .arg("CREATE")
        .arg(STREAM_KEY)
        .arg(GROUP_NAME)
        .arg("$")
        .arg("MKSTREAM")
        .query_async::<()>(&mut stream_conn)
        .await;

    info!("Resuming executions left running by a previous process...");
    engine.recover().await;

    info!(stream = STREAM_KEY, "Listening for flow-execute events");

    loop {
        let opts = StreamReadOptions::default()
            .group(GROUP_NAME, &consumer_name)
            .block(5000)
            .count(10);

        let result: redis::RedisResult<StreamReadReply> = stream_conn
            .clone()
            .xread_options(&[STREAM_KEY], &[">"], &opts)
            .await;

        match result {
            Ok(reply) => {
                for stream in reply.keys {
                    let key = stream.key;
                    for message in stream.ids {
                        let id = message.id.clone();
                        let Some(val) = message.map.get("payload") else {
                            let _: redis::RedisResult<()> =
                                stream_conn.xack(&key, GROUP_NAME, &[&id]).await;
                            continue;
                        };
                        let Ok(payload_str) = redis::from_redis_value::<String>(val) else {
                            let _: redis::RedisResult<()> =
                                stream_conn.xack(&key, GROUP_NAME, &[&id]).await;
                            continue;
                        };

                        match serde_json::from_str::<FlowExecuteEvent>(&payload_str) {
                            Ok(event) => {
                                if acquire_execution_lock(&mut stream_conn, &event.execution_id).await {
                                    let engine = engine.clone();
                                    let mut lock_conn = stream_conn.clone();
                                    let execution_id = event.execution_id.clone();
                                    tokio::spawn(async move {
                                        info!(execution_id = %execution_id, "Running flow execution");
                                        if let Err(e) = engine.orchestrator.run_flow(event).await {
                                            error!(execution_id = %execution_id, error = %e, "Flow execution failed");
                                        }
                                        release_execution_lock(&mut lock_conn, &execution_id).await;
                                    });
                                } else {
                                    warn!(execution_id = %event.execution_id, "Execution already claimed by another worker, skipping");
                                }
                            }
                            Err(e) => {
                                error!(payload = payload_str, error = %e, "Failed to parse flow-execute event");
                            }
                        }

                        let _: redis::RedisResult<()> =
                            stream_conn.xack(&key, GROUP_NAME, &[&id]).await;
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Error reading from Redis stream");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }
}
