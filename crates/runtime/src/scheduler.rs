//! Run scheduler — accepts run requests, enforces per-account
//! concurrency, and enqueues work for the worker pool.

use std::sync::Arc;

use uuid::Uuid;

use skein_broker::Broker;
use skein_domain::config::{RuntimeConfig, RUN_KEY_TTL};
use skein_domain::run::{AgentRun, RunRequest, RunStatus, StartRunRequest};
use skein_domain::{Error, Result};
use skein_runlog::{
    active_run_key_for_account, active_run_pattern_for_account, RunRegistry, RUN_QUEUE_CHANNEL,
    RUN_QUEUE_KEY,
};

use crate::worker::signal_stop;

pub struct RunScheduler {
    broker: Arc<dyn Broker>,
    registry: Arc<dyn RunRegistry>,
    instance_id: String,
    /// Per-account concurrent run limit; `None` is unbounded (local dev).
    max_parallel_runs: Option<usize>,
}

impl RunScheduler {
    pub fn new(
        broker: Arc<dyn Broker>,
        registry: Arc<dyn RunRegistry>,
        config: &RuntimeConfig,
        instance_id: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            registry,
            instance_id: instance_id.into(),
            max_parallel_runs: config.max_parallel_agent_runs,
        }
    }

    /// Accept a run: check the account's concurrency budget, create the
    /// registry row, and enqueue the work-queue message.
    pub async fn start_run(&self, request: StartRunRequest) -> Result<Uuid> {
        if let Some(limit) = self.max_parallel_runs {
            let pattern = active_run_pattern_for_account(&request.account_id);
            let active = self.broker.keys(&pattern).await.map_err(Error::from)?;
            if active.len() >= limit {
                return Err(Error::Validation(format!(
                    "TooManyRunsForAccount: {} active runs (limit {limit})",
                    active.len()
                )));
            }
        }

        let run_id = Uuid::new_v4();
        let snapshot = serde_json::json!({
            "account_id": request.account_id,
            "project_id": request.project_id,
            "agent_config": request.agent_config,
            "idempotency_key": request.idempotency_key,
        });
        self.registry
            .create(AgentRun::new(
                run_id,
                request.thread_id,
                request.model.clone(),
                snapshot,
            ))
            .await?;

        // Claim an account-concurrency slot before the enqueue so two
        // racing starts cannot both slip under the limit.
        self.broker
            .set(
                &active_run_key_for_account(&request.account_id, run_id),
                "queued",
                Some(RUN_KEY_TTL),
            )
            .await
            .map_err(Error::from)?;

        let message = RunRequest {
            run_id,
            thread_id: request.thread_id,
            instance_id: self.instance_id.clone(),
            account_id: request.account_id.clone(),
            project_id: request.project_id.clone(),
            model: request.model.clone(),
            enable_thinking: request.enable_thinking,
            reasoning_effort: request.reasoning_effort,
            stream: request.stream,
            enable_context_manager: request.enable_context_manager,
            agent_config: request.agent_config.clone(),
            is_agent_builder: false,
            target_agent_id: None,
            request_id: request.idempotency_key.clone(),
        };
        let encoded = serde_json::to_string(&message)?;
        self.broker
            .rpush(RUN_QUEUE_KEY, &encoded)
            .await
            .map_err(Error::from)?;
        self.broker
            .publish(RUN_QUEUE_CHANNEL, "new")
            .await
            .map_err(Error::from)?;

        tracing::info!(%run_id, thread_id = %request.thread_id, model = %request.model, "run enqueued");
        Ok(run_id)
    }

    /// Request a stop. Stopping an already-terminal run is a no-op that
    /// reports the terminal status unchanged.
    pub async fn stop_run(&self, run_id: Uuid) -> Result<RunStatus> {
        let run = self
            .registry
            .get(run_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("run {run_id}")))?;

        if run.status.is_terminal() {
            return Ok(run.status);
        }

        signal_stop(&self.broker, run_id).await?;
        tracing::info!(%run_id, "stop signalled");
        Ok(run.status)
    }

    /// Fetch the current registry row.
    pub async fn get_run(&self, run_id: Uuid) -> Result<Option<AgentRun>> {
        self.registry.get(run_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_broker::MemoryBroker;
    use skein_domain::run::AgentConfig;
    use skein_runlog::JsonlRunRegistry;

    fn scheduler(limit: Option<usize>) -> (RunScheduler, Arc<dyn Broker>) {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let registry: Arc<dyn RunRegistry> = Arc::new(JsonlRunRegistry::ephemeral());
        let config = RuntimeConfig {
            max_parallel_agent_runs: limit,
            ..Default::default()
        };
        (
            RunScheduler::new(Arc::clone(&broker), registry, &config, "sched-1"),
            broker,
        )
    }

    fn start_request(account: &str) -> StartRunRequest {
        StartRunRequest {
            thread_id: Uuid::new_v4(),
            account_id: account.into(),
            project_id: "proj".into(),
            model: "sonnet".into(),
            agent_config: AgentConfig::default(),
            enable_thinking: None,
            reasoning_effort: None,
            stream: true,
            enable_context_manager: true,
            idempotency_key: None,
        }
    }

    #[tokio::test]
    async fn start_creates_row_and_enqueues() {
        let (scheduler, broker) = scheduler(None);
        let run_id = scheduler.start_run(start_request("acct")).await.unwrap();

        let row = scheduler.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(row.status, RunStatus::Queued);

        let queued = broker.lpop(RUN_QUEUE_KEY).await.unwrap().unwrap();
        let message: RunRequest = serde_json::from_str(&queued).unwrap();
        assert_eq!(message.run_id, run_id);
        assert_eq!(message.account_id, "acct");
    }

    #[tokio::test]
    async fn per_account_limit_rejects_excess() {
        let (scheduler, _broker) = scheduler(Some(2));
        scheduler.start_run(start_request("acct")).await.unwrap();
        scheduler.start_run(start_request("acct")).await.unwrap();

        let err = scheduler.start_run(start_request("acct")).await.unwrap_err();
        assert!(matches!(err, Error::Validation(m) if m.contains("TooManyRunsForAccount")));

        // A different account is unaffected.
        scheduler.start_run(start_request("other")).await.unwrap();
    }

    #[tokio::test]
    async fn rejected_start_leaves_no_registry_row() {
        let (scheduler, broker) = scheduler(Some(1));
        let first = scheduler.start_run(start_request("acct")).await.unwrap();
        assert!(scheduler.start_run(start_request("acct")).await.is_err());

        // Only the accepted run is queued.
        assert_eq!(broker.llen(RUN_QUEUE_KEY).await.unwrap(), 1);
        assert!(scheduler.get_run(first).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stop_run_signals_both_paths() {
        let (scheduler, broker) = scheduler(None);
        let run_id = scheduler.start_run(start_request("acct")).await.unwrap();

        let mut control = broker
            .subscribe(&skein_runlog::control_channel(run_id))
            .await
            .unwrap();
        let status = scheduler.stop_run(run_id).await.unwrap();
        assert_eq!(status, RunStatus::Queued);

        assert_eq!(
            broker
                .get(&skein_runlog::stop_key(run_id))
                .await
                .unwrap()
                .as_deref(),
            Some("STOP")
        );
        assert_eq!(control.recv().await.as_deref(), Some("STOP"));
    }

    #[tokio::test]
    async fn stop_of_terminal_run_is_noop() {
        let (scheduler, broker) = scheduler(None);
        let run_id = scheduler.start_run(start_request("acct")).await.unwrap();
        scheduler
            .registry
            .transition(run_id, RunStatus::Running, None)
            .await
            .unwrap();
        scheduler
            .registry
            .transition(run_id, RunStatus::Completed, None)
            .await
            .unwrap();

        let status = scheduler.stop_run(run_id).await.unwrap();
        assert_eq!(status, RunStatus::Completed);
        // No stop flag written for a terminal run.
        assert!(broker
            .get(&skein_runlog::stop_key(run_id))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn stop_unknown_run_errors() {
        let (scheduler, _) = scheduler(None);
        assert!(matches!(
            scheduler.stop_run(Uuid::new_v4()).await.unwrap_err(),
            Error::NotFound(_)
        ));
    }
}
