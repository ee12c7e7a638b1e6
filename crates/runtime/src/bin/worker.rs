//! `skein-worker` — a worker-pool process.
//!
//! Connects to the broker, consumes the run queue, and runs the orphan
//! sweep. One process per host is typical; scale out by starting more.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use skein_broker::{Broker, RedisBroker};
use skein_domain::config::RuntimeConfig;
use skein_domain::store::{InMemoryMessageStore, MessageStore};
use skein_providers::{LlmClient, OpenAiCompatClient, ResilientClient};
use skein_runlog::{JsonlRunRegistry, RunRegistry};
use skein_runtime::{consume_queue, new_instance_id, CancelToken, ReconciliationSweep, RunWorker};

#[derive(Parser, Debug)]
#[command(name = "skein-worker", about = "skein agent-run worker pool")]
struct Args {
    /// Directory for the run registry JSONL state.
    #[arg(long, env = "SKEIN_STATE_DIR", default_value = ".skein")]
    state_dir: std::path::PathBuf,

    /// LLM endpoint base URL (OpenAI-compatible).
    #[arg(long, env = "LLM_API_BASE", default_value = "https://api.openai.com/v1")]
    llm_api_base: String,

    /// Emit logs as JSON (for log shippers).
    #[arg(long, env = "SKEIN_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = RuntimeConfig::from_env().context("reading environment configuration")?;
    let instance_id = new_instance_id();
    tracing::info!(%instance_id, "skein worker starting");

    let broker: Arc<dyn Broker> = Arc::new(
        RedisBroker::connect(&config.redis)
            .await
            .context("connecting to redis broker")?,
    );

    let registry: Arc<dyn RunRegistry> = Arc::new(
        JsonlRunRegistry::open(&args.state_dir).context("opening run registry")?,
    );

    // Thread persistence is an external service in production; the
    // in-memory store keeps single-process deployments self-contained.
    let store: Arc<dyn MessageStore> = InMemoryMessageStore::shared();

    let api_key = config
        .llm
        .api_key
        .clone()
        .context("LLM_API_KEY must be set")?;
    let primary: Arc<dyn LlmClient> = Arc::new(
        OpenAiCompatClient::new("primary", &args.llm_api_base, &api_key)
            .context("building llm client")?,
    );
    let mut resilient = ResilientClient::new(primary);
    if let (Some(base), Some(key)) = (
        &config.llm.openrouter_api_base,
        &config.llm.openrouter_api_key,
    ) {
        let fallback: Arc<dyn LlmClient> = Arc::new(
            OpenAiCompatClient::new("openrouter", base, key)
                .context("building fallback llm client")?,
        );
        resilient = resilient.with_fallback(fallback);
    }
    let llm: Arc<dyn LlmClient> = Arc::new(resilient);

    let worker = Arc::new(RunWorker::new(
        Arc::clone(&broker),
        Arc::clone(&registry),
        store,
        llm,
        instance_id,
    ));

    let shutdown = CancelToken::new();

    let sweep = ReconciliationSweep::new(Arc::clone(&broker), Arc::clone(&registry));
    let sweep_shutdown = shutdown.clone();
    let sweep_task = tokio::spawn(async move { sweep.run_forever(sweep_shutdown).await });

    let consume_shutdown = shutdown.clone();
    let consume_task = tokio::spawn(consume_queue(worker, broker, consume_shutdown));

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("shutdown requested, draining");
    shutdown.cancel();

    // In-flight runs are left to lock TTL + the next sweep, per the
    // at-most-once execution model.
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), consume_task).await;
    sweep_task.abort();
    Ok(())
}

fn init_tracing(json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        fmt().with_env_filter(filter).json().init();
    } else {
        fmt().with_env_filter(filter).init();
    }
}
