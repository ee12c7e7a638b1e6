//! Run worker — the background task that drives one run end-to-end.
//!
//! Acquires the single-flight lock, reconciles the registry, wires MCP
//! tools, feeds the thread manager's event stream into the durable log,
//! and settles the run's terminal state. Workers share nothing in-process;
//! the broker is the only coordination surface.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use skein_broker::Broker;
use skein_domain::config::{RUN_KEY_TTL, STOP_FLAG_TTL};
use skein_domain::event::{control, Event, EventBody, StatusValue};
use skein_domain::run::{RunRequest, RunStatus};
use skein_domain::store::MessageStore;
use skein_domain::{Error, Result};
use skein_mcp_client::pool::McpConnector;
use skein_mcp_client::{endpoint::EndpointResolver, McpClientPool};
use skein_providers::{resolve_model_alias, LlmClient, ToolChoice};
use skein_runlog::{
    active_run_key_for_account, active_run_key_for_instance, control_channel,
    instance_control_channel, run_lock_key, stop_key, EventLog, RunRegistry, RUN_QUEUE_CHANNEL,
    RUN_QUEUE_KEY,
};
use skein_tools::builtin::register_lifecycle_tools;
use skein_tools::{register_mcp_tools, ToolRegistry};

use crate::cancel::CancelToken;
use crate::processor::ProcessorConfig;
use crate::thread::{RunThreadParams, ThreadManager};

/// Lock and active-key TTLs are refreshed every this many events.
const LOCK_REFRESH_EVERY: u64 = 50;

/// Cadence of the coarse stop-flag poll.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Broker append retry budget before a run is declared failed.
const APPEND_RETRIES: u32 = 3;

pub struct RunWorker {
    broker: Arc<dyn Broker>,
    run_registry: Arc<dyn RunRegistry>,
    event_log: EventLog,
    store: Arc<dyn MessageStore>,
    llm: Arc<dyn LlmClient>,
    instance_id: String,
    /// Test seam: substitute the MCP network edge.
    mcp_connector: Option<Arc<dyn McpConnector>>,
}

impl RunWorker {
    pub fn new(
        broker: Arc<dyn Broker>,
        run_registry: Arc<dyn RunRegistry>,
        store: Arc<dyn MessageStore>,
        llm: Arc<dyn LlmClient>,
        instance_id: impl Into<String>,
    ) -> Self {
        let event_log = EventLog::new(Arc::clone(&broker));
        Self {
            broker,
            run_registry,
            event_log,
            store,
            llm,
            instance_id: instance_id.into(),
            mcp_connector: None,
        }
    }

    pub fn with_mcp_connector(mut self, connector: Arc<dyn McpConnector>) -> Self {
        self.mcp_connector = Some(connector);
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Drive one run to a terminal state. Returns Ok even when the run
    /// fails; Err only for infrastructure breakage before the run could be
    /// settled.
    pub async fn run(&self, request: RunRequest) -> Result<()> {
        let run_id = request.run_id;
        let lock_key = run_lock_key(run_id);

        // Single-flight: first worker in wins, everyone else exits
        // silently.
        let acquired = self
            .broker
            .set_nx(&lock_key, &self.instance_id, RUN_KEY_TTL)
            .await
            .map_err(Error::from)?;
        if !acquired {
            let owner = self.broker.get(&lock_key).await.unwrap_or(None);
            tracing::info!(
                %run_id,
                owner = owner.as_deref().unwrap_or("unknown"),
                "run already owned by another instance, skipping"
            );
            return Ok(());
        }

        let span = tracing::info_span!("agent_run", %run_id, thread_id = %request.thread_id, instance = %self.instance_id);
        self.run_owned(request).instrument(span).await
    }

    async fn run_owned(&self, request: RunRequest) -> Result<()> {
        let run_id = request.run_id;
        let lock_key = run_lock_key(run_id);
        tracing::info!(model = %request.model, "run starting");

        let cancel = CancelToken::new();
        let watcher = self.spawn_stop_watcher(run_id, cancel.clone());

        let pool = self.build_pool();
        let outcome = self.run_inner(&request, &pool, &cancel).await;

        // Settle terminal state, snapshot, publish the control token.
        let settled = self.settle(&request, outcome).await;

        // Cleanup, best-effort and unconditional.
        watcher.abort();
        pool.close();
        if let Err(e) = self.event_log.extend_ttl(run_id).await {
            tracing::warn!(error = %e, "failed to arm response list TTL");
        }
        let _ = self
            .broker
            .delete(&active_run_key_for_instance(&self.instance_id, run_id))
            .await;
        if !request.account_id.is_empty() {
            let _ = self
                .broker
                .delete(&active_run_key_for_account(&request.account_id, run_id))
                .await;
        }
        let _ = self.broker.delete(&lock_key).await;

        tracing::info!(status = ?settled, "run settled");
        Ok(())
    }

    fn build_pool(&self) -> Arc<McpClientPool> {
        let resolver = EndpointResolver::direct_only();
        Arc::new(match &self.mcp_connector {
            Some(connector) => McpClientPool::with_connector(
                Arc::clone(&self.broker),
                resolver,
                Arc::clone(connector),
            ),
            None => McpClientPool::new(Arc::clone(&self.broker), resolver),
        })
    }

    /// Watch both control channels and the coarse stop flag; the two paths
    /// tolerate broker partitions on either side.
    fn spawn_stop_watcher(&self, run_id: Uuid, cancel: CancelToken) -> JoinHandle<()> {
        let broker = Arc::clone(&self.broker);
        let instance_id = self.instance_id.clone();
        tokio::spawn(async move {
            let global = broker.subscribe(&control_channel(run_id)).await;
            let scoped = broker
                .subscribe(&instance_control_channel(run_id, &instance_id))
                .await;
            let (mut global, mut scoped) = match (global, scoped) {
                (Ok(g), Ok(s)) => (g, s),
                (g, s) => {
                    tracing::warn!(
                        global_ok = g.is_ok(),
                        scoped_ok = s.is_ok(),
                        "control channel subscription failed, relying on stop-flag polling"
                    );
                    // Degraded mode: poll the KV flag only.
                    loop {
                        tokio::time::sleep(STOP_POLL_INTERVAL).await;
                        if matches!(broker.get(&stop_key(run_id)).await, Ok(Some(v)) if v == control::STOP)
                        {
                            cancel.cancel();
                            return;
                        }
                    }
                }
            };

            let mut poll = tokio::time::interval(STOP_POLL_INTERVAL);
            let mut ticks: u64 = 0;
            loop {
                tokio::select! {
                    msg = global.recv() => {
                        if matches!(msg.as_deref(), Some(control::STOP)) {
                            cancel.cancel();
                            return;
                        }
                    }
                    msg = scoped.recv() => {
                        if matches!(msg.as_deref(), Some(control::STOP)) {
                            cancel.cancel();
                            return;
                        }
                    }
                    _ = poll.tick() => {
                        if matches!(broker.get(&stop_key(run_id)).await, Ok(Some(v)) if v == control::STOP) {
                            cancel.cancel();
                            return;
                        }
                        ticks += 1;
                        if ticks % 10 == 0 {
                            let _ = broker
                                .expire(&active_run_key_for_instance(&instance_id, run_id), RUN_KEY_TTL)
                                .await;
                        }
                    }
                }
            }
        })
    }

    /// The event loop: transition to running, initialize MCPs, stream the
    /// turn, mirror every event into the log.
    async fn run_inner(
        &self,
        request: &RunRequest,
        pool: &Arc<McpClientPool>,
        cancel: &CancelToken,
    ) -> Result<RunOutcome> {
        let run_id = request.run_id;
        let thread_id = request.thread_id;

        self.run_registry
            .transition(run_id, RunStatus::Running, None)
            .await?;
        self.broker
            .set(
                &active_run_key_for_instance(&self.instance_id, run_id),
                "running",
                Some(RUN_KEY_TTL),
            )
            .await
            .map_err(Error::from)?;

        // ── Tooling ──────────────────────────────────────────────────
        let mcp_configs: Vec<_> = request.agent_config.all_mcps().cloned().collect();
        let catalog = pool.initialize(&mcp_configs).await;
        for (server, reason) in &catalog.failures {
            let warning = Event::status_with_message(
                Some(thread_id),
                StatusValue::Running,
                format!("MCP server {server} unavailable: {reason}"),
            );
            self.append_with_retry(run_id, &warning).await?;
        }

        let registry = Arc::new(ToolRegistry::new());
        register_lifecycle_tools(&registry, Arc::clone(&self.store));
        register_mcp_tools(&registry, pool, &catalog);

        // ── Drive the turn ───────────────────────────────────────────
        let thread_manager = Arc::new(ThreadManager::new(
            Arc::clone(&self.store),
            registry,
            Arc::clone(&self.llm),
        ));

        let llm_model = resolve_model_alias(&request.model).to_string();
        let mut stream = thread_manager
            .run_thread(RunThreadParams {
                thread_id,
                system_prompt: request.agent_config.system_prompt.clone(),
                llm_model,
                tool_choice: ToolChoice::Auto,
                processor_config: ProcessorConfig::default(),
                temporary_message: None,
                enable_thinking: request.enable_thinking.unwrap_or(false),
                reasoning_effort: request.reasoning_effort,
                enable_context_manager: request.enable_context_manager,
                cancel: cancel.clone(),
            })
            .await;

        let mut final_status: Option<StatusValue> = None;
        let mut error_message: Option<String> = None;
        let mut terminal_event_appended = false;
        let mut total_events: u64 = 0;

        while let Some(event) = stream.next().await {
            if cancel.is_cancelled() && final_status.is_none() {
                final_status = Some(StatusValue::Stopped);
                break;
            }

            self.append_with_retry(run_id, &event).await?;
            total_events += 1;

            if total_events % LOCK_REFRESH_EVERY == 0 {
                let _ = self.broker.expire(&run_lock_key(run_id), RUN_KEY_TTL).await;
                let _ = self.event_log.extend_ttl(run_id).await;
            }

            if let Some(status) = event.terminal_status() {
                if let EventBody::Status { message, .. } = &event.body {
                    error_message = message.clone();
                }
                final_status = Some(status);
                terminal_event_appended = true;
                break;
            }
        }

        if cancel.is_cancelled() && final_status.is_none() {
            final_status = Some(StatusValue::Stopped);
        }

        tracing::debug!(total_events, status = ?final_status, "event loop finished");
        Ok(RunOutcome {
            final_status,
            error_message,
            terminal_event_appended,
        })
    }

    /// Decide the terminal state, append the closing status event if the
    /// stream didn't produce one, snapshot, transition the registry, and
    /// publish the control token.
    async fn settle(&self, request: &RunRequest, outcome: Result<RunOutcome>) -> RunStatus {
        let run_id = request.run_id;
        let thread_id = request.thread_id;

        let (final_status, error_message) = match outcome {
            Ok(RunOutcome {
                final_status: None,
                ..
            }) => {
                // Stream completed without a terminal event.
                let done = Event::status_with_message(
                    Some(thread_id),
                    StatusValue::Completed,
                    "Agent run completed successfully",
                );
                if let Err(e) = self.event_log.append(run_id, &done).await {
                    tracing::warn!(error = %e, "failed to append completion event");
                }
                (RunStatus::Completed, None)
            }
            Ok(RunOutcome {
                final_status: Some(status),
                error_message,
                terminal_event_appended,
            }) => {
                let mapped = match status {
                    StatusValue::Completed => RunStatus::Completed,
                    StatusValue::Stopped => {
                        if !terminal_event_appended {
                            let stopped = Event::status(Some(thread_id), StatusValue::Stopped);
                            if let Err(e) = self.event_log.append(run_id, &stopped).await {
                                tracing::warn!(error = %e, "failed to append stop event");
                            }
                        }
                        RunStatus::Stopped
                    }
                    StatusValue::Failed | StatusValue::Error => RunStatus::Failed,
                    StatusValue::Running => RunStatus::Completed,
                };
                (mapped, error_message)
            }
            Err(e) => {
                // Worker-fatal path: record the failure on the stream too.
                let error_event = Event::status_with_message(
                    Some(thread_id),
                    StatusValue::Error,
                    e.to_string(),
                );
                if let Err(append_err) = self.event_log.append(run_id, &error_event).await {
                    tracing::error!(error = %append_err, "failed to append error event");
                }
                (RunStatus::Failed, Some(e.to_string()))
            }
        };

        // Snapshot the full log onto the registry row.
        match self.event_log.read_from(run_id, 0).await {
            Ok(events) => {
                if let Err(e) = self.run_registry.snapshot_responses(run_id, events).await {
                    tracing::warn!(error = %e, "failed to snapshot responses");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to read responses for snapshot"),
        }

        if let Err(e) = self
            .run_registry
            .transition(run_id, final_status, error_message)
            .await
        {
            tracing::error!(error = %e, "failed to transition run to terminal state");
        }

        let token = match final_status {
            RunStatus::Completed => control::END_STREAM,
            RunStatus::Stopped => control::STOP,
            _ => control::ERROR,
        };
        if let Err(e) = self.event_log.publish_control(run_id, token).await {
            tracing::warn!(error = %e, "failed to publish control token");
        }

        final_status
    }

    /// Append with bounded retries; persistent broker failure fails the
    /// run.
    async fn append_with_retry(&self, run_id: Uuid, event: &Event) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            match self.event_log.append(run_id, event).await {
                Ok(_) => return Ok(()),
                Err(e) if attempt < APPEND_RETRIES => {
                    let delay = Duration::from_millis(500) * 2u32.pow(attempt);
                    tracing::warn!(attempt, error = %e, "event append failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// What the event loop concluded, before registry settlement.
struct RunOutcome {
    final_status: Option<StatusValue>,
    error_message: Option<String>,
    /// True when the terminal status event already reached the log, so
    /// settlement must not append a duplicate.
    terminal_event_appended: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stop requests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Signal a run to stop: write the coarse flag and publish on the control
/// channel, so the worker hears it even if one path is partitioned.
pub async fn signal_stop(broker: &Arc<dyn Broker>, run_id: Uuid) -> Result<()> {
    broker
        .set(&stop_key(run_id), control::STOP, Some(STOP_FLAG_TTL))
        .await
        .map_err(Error::from)?;
    broker
        .publish(&control_channel(run_id), control::STOP)
        .await
        .map_err(Error::from)?;
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Queue consumption
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Consume the durable work queue until shutdown, spawning one task per
/// run.
pub async fn consume_queue(
    worker: Arc<RunWorker>,
    broker: Arc<dyn Broker>,
    shutdown: CancelToken,
) {
    let mut wakeup = match broker.subscribe(RUN_QUEUE_CHANNEL).await {
        Ok(sub) => Some(sub),
        Err(e) => {
            tracing::warn!(error = %e, "queue channel unavailable, falling back to polling");
            None
        }
    };

    while !shutdown.is_cancelled() {
        match broker.lpop(RUN_QUEUE_KEY).await {
            Ok(Some(raw)) => {
                let request: RunRequest = match serde_json::from_str(&raw) {
                    Ok(request) => request,
                    Err(e) => {
                        tracing::error!(error = %e, "dropping undecodable work-queue message");
                        continue;
                    }
                };
                let worker = Arc::clone(&worker);
                tokio::spawn(async move {
                    if let Err(e) = worker.run(request).await {
                        tracing::error!(error = %e, "run worker crashed");
                    }
                });
            }
            Ok(None) => match &mut wakeup {
                Some(sub) => {
                    let _ = tokio::time::timeout(Duration::from_secs(1), sub.recv()).await;
                }
                None => tokio::time::sleep(Duration::from_secs(1)).await,
            },
            Err(e) => {
                tracing::warn!(error = %e, "queue read failed, backing off");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
